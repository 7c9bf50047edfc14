use std::io::{self, Write};

use byteorder::{LittleEndian, WriteBytesExt};

/// Opaque address logged by the instrumented allocator. Never dereferenced;
/// the analyzer treats it purely as a key.
pub type Address = u64;

/// Identifier assigned by an Intern record.
pub type LabelId = u64;

/// The wire format is fixed at 64-bit little-endian words regardless of the
/// host, so logs move freely between producer and analyzer machines.
pub const WORD_BYTES: usize = 8;

/// Clock values occupy the upper 56 bits of the header word.
pub const CLOCK_MASK: u64 = (1 << 56) - 1;

/// Upper bound on the byte length of a single interned string. A length word
/// beyond this is treated as a corrupt stream rather than an allocation
/// request.
pub const MAX_STRING_BYTES: u64 = 1 << 20;

/// Discriminator selecting a record's field shape.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum EventCode {
  Intern = 0x01,
  Label = 0x02,
  ArenaCreate = 0x10,
  ArenaDestroy = 0x11,
  PoolInit = 0x12,
  PoolFinish = 0x13,
  Reserve = 0x14,
  Release = 0x15,
  Alloc = 0x16,
  Free = 0x17,
  Commit = 0x18,
  Meter = 0x19,
}

impl EventCode {
  pub const ALL: [EventCode; 12] = [
    EventCode::Intern,
    EventCode::Label,
    EventCode::ArenaCreate,
    EventCode::ArenaDestroy,
    EventCode::PoolInit,
    EventCode::PoolFinish,
    EventCode::Reserve,
    EventCode::Release,
    EventCode::Alloc,
    EventCode::Free,
    EventCode::Commit,
    EventCode::Meter,
  ];

  #[must_use]
  pub fn from_name(name: &str) -> Option<Self> {
    Self::ALL
      .iter()
      .copied()
      .find(|code| code.name().eq_ignore_ascii_case(name))
  }

  #[must_use]
  pub fn from_u8(raw: u8) -> Option<Self> {
    Self::ALL.iter().copied().find(|code| *code as u8 == raw)
  }

  #[must_use]
  pub fn name(self) -> &'static str {
    match self {
      Self::Intern => "Intern",
      Self::Label => "Label",
      Self::ArenaCreate => "ArenaCreate",
      Self::ArenaDestroy => "ArenaDestroy",
      Self::PoolInit => "PoolInit",
      Self::PoolFinish => "PoolFinish",
      Self::Reserve => "Reserve",
      Self::Release => "Release",
      Self::Alloc => "Alloc",
      Self::Free => "Free",
      Self::Commit => "Commit",
      Self::Meter => "Meter",
    }
  }
}

/// Kinds of field a record shape may contain.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FieldKind {
  /// One word interpreted as an opaque address.
  Address,
  /// One word interpreted as an unsigned integer.
  Word,
  /// One word carrying the bit pattern of an `f64`.
  Double,
  /// A length word followed by that many bytes, zero padded to the next
  /// word boundary.
  Bytes,
}

/// Ordered field list for each known code. Codes absent from this table
/// decode as header-only records; see `Event::Unknown`.
#[must_use]
pub fn shape(code: EventCode) -> &'static [FieldKind] {
  use FieldKind::{Address, Bytes, Double, Word};

  match code {
    EventCode::Intern => &[Bytes],
    EventCode::Label => &[Address, Word],
    EventCode::ArenaCreate => &[Address, Word],
    EventCode::ArenaDestroy => &[Address],
    EventCode::PoolInit => &[Address, Address, Word],
    EventCode::PoolFinish => &[Address],
    EventCode::Reserve | EventCode::Release => &[Address, Address, Word],
    EventCode::Alloc => &[Address, Address, Word, Word, Word],
    EventCode::Free => &[Address, Address, Word],
    EventCode::Commit => &[Address, Word],
    EventCode::Meter => &[Address, Double],
  }
}

/// A field value paired with its kind, ready for encoding.
#[derive(Debug, Clone, Copy)]
pub enum FieldValue<'a> {
  Address(Address),
  Word(u64),
  Double(f64),
  Bytes(&'a [u8]),
}

#[must_use]
pub fn pack_header(code: u8, clock: u64) -> u64 {
  u64::from(code) | ((clock & CLOCK_MASK) << 8)
}

#[must_use]
pub fn unpack_header(word: u64) -> (u8, u64) {
  ((word & 0xff) as u8, word >> 8)
}

/// Number of padding bytes required after `len` bytes of string payload.
#[must_use]
pub fn padding_after(len: usize) -> usize {
  (WORD_BYTES - len % WORD_BYTES) % WORD_BYTES
}

/// Encode one record: header word, then each field in shape order.
///
/// # Errors
///
/// Propagates any error from the underlying writer. Writing into an
/// in-memory buffer cannot fail.
pub fn encode_record<W: Write>(
  mut out: W,
  code: u8,
  clock: u64,
  fields: &[FieldValue<'_>],
) -> io::Result<()> {
  out.write_u64::<LittleEndian>(pack_header(code, clock))?;

  for field in fields {
    match field {
      FieldValue::Address(value) | FieldValue::Word(value) => {
        out.write_u64::<LittleEndian>(*value)?;
      }
      FieldValue::Double(value) => {
        out.write_u64::<LittleEndian>(value.to_bits())?;
      }
      FieldValue::Bytes(bytes) => {
        out.write_u64::<LittleEndian>(bytes.len() as u64)?;
        out.write_all(bytes)?;

        let padding = padding_after(bytes.len());
        out.write_all(&[0u8; WORD_BYTES][..padding])?;
      }
    }
  }

  Ok(())
}

/// Total encoded length of a record with the given fields, in bytes.
#[must_use]
pub fn encoded_len(fields: &[FieldValue<'_>]) -> usize {
  let mut len = WORD_BYTES;

  for field in fields {
    len += match field {
      FieldValue::Address(_) | FieldValue::Word(_) | FieldValue::Double(_) => {
        WORD_BYTES
      }
      FieldValue::Bytes(bytes) => {
        WORD_BYTES + bytes.len() + padding_after(bytes.len())
      }
    };
  }

  len
}
