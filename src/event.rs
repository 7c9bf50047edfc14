use crate::wire::{Address, EventCode, FieldValue, LabelId};

/// One decoded telemetry event. The variant set mirrors the static shape
/// table; field names are part of the crate's public decoding contract.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
  /// Assigns the next sequential id to `text`. Ids start at 1 and are never
  /// carried on the wire.
  Intern { text: Vec<u8> },
  /// Associates an interned id with an address. A null address marks a
  /// report directive instead.
  Label { address: Address, id: LabelId },
  ArenaCreate { arena: Address, grain: u64 },
  ArenaDestroy { arena: Address },
  PoolInit { pool: Address, arena: Address, class_id: LabelId },
  PoolFinish { pool: Address },
  Reserve { arena: Address, pool: Address, size: u64 },
  Release { arena: Address, pool: Address, size: u64 },
  Alloc {
    pool: Address,
    address: Address,
    size: u64,
    class_id: LabelId,
    location_id: LabelId,
  },
  Free { pool: Address, address: Address, size: u64 },
  Commit { arena: Address, committed: u64 },
  Meter { pool: Address, value: f64 },
  /// A code outside the shape table, decoded as a header-only record so a
  /// newer producer's log never crashes an older analyzer.
  Unknown { code: u8 },
}

impl Event {
  /// The known code for this event, if it has one.
  #[must_use]
  pub fn code(&self) -> Option<EventCode> {
    match self {
      Self::Intern { .. } => Some(EventCode::Intern),
      Self::Label { .. } => Some(EventCode::Label),
      Self::ArenaCreate { .. } => Some(EventCode::ArenaCreate),
      Self::ArenaDestroy { .. } => Some(EventCode::ArenaDestroy),
      Self::PoolInit { .. } => Some(EventCode::PoolInit),
      Self::PoolFinish { .. } => Some(EventCode::PoolFinish),
      Self::Reserve { .. } => Some(EventCode::Reserve),
      Self::Release { .. } => Some(EventCode::Release),
      Self::Alloc { .. } => Some(EventCode::Alloc),
      Self::Free { .. } => Some(EventCode::Free),
      Self::Commit { .. } => Some(EventCode::Commit),
      Self::Meter { .. } => Some(EventCode::Meter),
      Self::Unknown { .. } => None,
    }
  }

  /// The raw code byte, including unknown codes.
  #[must_use]
  pub fn raw_code(&self) -> u8 {
    match self {
      Self::Unknown { code } => *code,
      other => other.code().map_or(0, |code| code as u8),
    }
  }

  /// Field values in shape order, for encoding.
  #[must_use]
  pub fn fields(&self) -> Vec<FieldValue<'_>> {
    match self {
      Self::Intern { text } => vec![FieldValue::Bytes(text)],
      Self::Label { address, id } => {
        vec![FieldValue::Address(*address), FieldValue::Word(*id)]
      }
      Self::ArenaCreate { arena, grain } => {
        vec![FieldValue::Address(*arena), FieldValue::Word(*grain)]
      }
      Self::ArenaDestroy { arena } => vec![FieldValue::Address(*arena)],
      Self::PoolInit {
        pool,
        arena,
        class_id,
      } => vec![
        FieldValue::Address(*pool),
        FieldValue::Address(*arena),
        FieldValue::Word(*class_id),
      ],
      Self::PoolFinish { pool } => vec![FieldValue::Address(*pool)],
      Self::Reserve { arena, pool, size }
      | Self::Release { arena, pool, size } => vec![
        FieldValue::Address(*arena),
        FieldValue::Address(*pool),
        FieldValue::Word(*size),
      ],
      Self::Alloc {
        pool,
        address,
        size,
        class_id,
        location_id,
      } => vec![
        FieldValue::Address(*pool),
        FieldValue::Address(*address),
        FieldValue::Word(*size),
        FieldValue::Word(*class_id),
        FieldValue::Word(*location_id),
      ],
      Self::Free {
        pool,
        address,
        size,
      } => vec![
        FieldValue::Address(*pool),
        FieldValue::Address(*address),
        FieldValue::Word(*size),
      ],
      Self::Commit { arena, committed } => {
        vec![FieldValue::Address(*arena), FieldValue::Word(*committed)]
      }
      Self::Meter { pool, value } => {
        vec![FieldValue::Address(*pool), FieldValue::Double(*value)]
      }
      Self::Unknown { .. } => Vec::new(),
    }
  }
}

/// One fully decoded record: the event plus its 56-bit clock value.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
  pub clock: u64,
  pub event: Event,
}

impl EventRecord {
  #[must_use]
  pub fn new(clock: u64, event: Event) -> Self {
    Self { clock, event }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::wire::shape;

  #[test]
  fn fields_match_the_shape_table() {
    let samples = [
      Event::Intern { text: b"cache".to_vec() },
      Event::Label { address: 0x10, id: 1 },
      Event::ArenaCreate { arena: 0x10, grain: 4096 },
      Event::ArenaDestroy { arena: 0x10 },
      Event::PoolInit { pool: 0x20, arena: 0x10, class_id: 1 },
      Event::PoolFinish { pool: 0x20 },
      Event::Reserve { arena: 0x10, pool: 0x20, size: 8192 },
      Event::Release { arena: 0x10, pool: 0x20, size: 8192 },
      Event::Alloc {
        pool: 0x20,
        address: 0x1000,
        size: 64,
        class_id: 2,
        location_id: 0,
      },
      Event::Free { pool: 0x20, address: 0x1000, size: 64 },
      Event::Commit { arena: 0x10, committed: 1 << 20 },
      Event::Meter { pool: 0x20, value: 0.5 },
    ];

    for event in samples {
      let code = event.code().expect("known code");
      assert_eq!(event.fields().len(), shape(code).len());
    }
  }

  #[test]
  fn unknown_events_have_no_fields() {
    let event = Event::Unknown { code: 0x7f };
    assert!(event.fields().is_empty());
    assert_eq!(event.code(), None);
    assert_eq!(event.raw_code(), 0x7f);
  }
}
