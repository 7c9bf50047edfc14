use std::{
  collections::HashMap,
  fmt::{self, Display, Formatter},
  io::{self, Read},
  sync::Arc,
};

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::event::{Event, EventRecord};
use crate::wire::{
  self, EventCode, FieldKind, LabelId, MAX_STRING_BYTES, WORD_BYTES,
};

/// How the reader treats a stream that ends inside a record.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReadMode {
  /// A mid-record end of stream is a fatal error.
  Strict,
  /// A mid-record end of stream is a normal end of a partial log.
  Tolerant,
}

#[derive(Debug)]
pub enum ReadError {
  /// Malformed record; byte alignment of everything after it is lost.
  Decode(String),
  Io(io::Error),
  /// The stream ended strictly inside a record.
  Truncated,
}

impl Display for ReadError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::Decode(detail) => write!(f, "malformed event record: {detail}"),
      Self::Io(err) => write!(f, "i/o error while reading event log: {err}"),
      Self::Truncated => write!(f, "event log ends inside a record"),
    }
  }
}

impl std::error::Error for ReadError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Io(err) => Some(err),
      Self::Decode(_) | Self::Truncated => None,
    }
  }
}

impl From<io::Error> for ReadError {
  fn from(value: io::Error) -> Self {
    Self::Io(value)
  }
}

/// Id → string table built from Intern records during one decode session.
#[derive(Debug, Default)]
pub struct InternTable {
  by_id: HashMap<LabelId, Arc<str>>,
  next_id: LabelId,
}

impl InternTable {
  #[must_use]
  pub fn get(&self, id: LabelId) -> Option<Arc<str>> {
    self.by_id.get(&id).cloned()
  }

  fn insert(&mut self, text: &[u8]) -> LabelId {
    self.next_id += 1;
    let id = self.next_id;
    self
      .by_id
      .insert(id, Arc::from(String::from_utf8_lossy(text).into_owned()));
    id
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.by_id.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.by_id.is_empty()
  }
}

/// Decodes one record at a time from a byte stream.
pub struct LogReader<R: Read> {
  last_clock: u64,
  mode: ReadMode,
  reader: R,
  strings: InternTable,
  truncated: bool,
  unknown_codes: u64,
}

enum Fill {
  Full,
  Empty,
  Partial,
}

impl<R: Read> LogReader<R> {
  #[must_use]
  pub fn new(reader: R, mode: ReadMode) -> Self {
    Self {
      last_clock: 0,
      mode,
      reader,
      strings: InternTable::default(),
      truncated: false,
      unknown_codes: 0,
    }
  }

  /// Decode the next record.
  ///
  /// Returns `Ok(None)` at a clean end of stream, and also in tolerant
  /// mode when the stream ends inside a record (the `truncated` flag is
  /// set and no partial state mutation takes place).
  ///
  /// # Errors
  ///
  /// `ReadError::Truncated` in strict mode for a mid-record end of
  /// stream; `ReadError::Decode` for a malformed record; `ReadError::Io`
  /// for an underlying read failure.
  pub fn read_record(&mut self) -> Result<Option<EventRecord>, ReadError> {
    let mut header = [0u8; WORD_BYTES];

    match self.fill(&mut header)? {
      Fill::Empty => return Ok(None),
      Fill::Partial => return self.truncate(),
      Fill::Full => {}
    }

    let (raw_code, clock) = wire::unpack_header(LittleEndian::read_u64(&header));

    if clock < self.last_clock {
      debug!(
        "clock went backwards: {clock} after {last}",
        last = self.last_clock
      );
    }

    let Some(code) = EventCode::from_u8(raw_code) else {
      // Placeholder shape: header word only. Counted for diagnostics.
      self.unknown_codes += 1;
      self.last_clock = self.last_clock.max(clock);
      return Ok(Some(EventRecord::new(clock, Event::Unknown { code: raw_code })));
    };

    let mut words = Vec::with_capacity(wire::shape(code).len());
    let mut text = None;

    for kind in wire::shape(code) {
      match kind {
        FieldKind::Address | FieldKind::Word | FieldKind::Double => {
          match self.read_word()? {
            Some(word) => words.push(word),
            None => return self.truncate(),
          }
        }
        FieldKind::Bytes => match self.read_bytes()? {
          Some(bytes) => text = Some(bytes),
          None => return self.truncate(),
        },
      }
    }

    let event = build_event(code, &words, text);

    if let Event::Intern { text } = &event {
      self.strings.insert(text);
    }

    self.last_clock = self.last_clock.max(clock);

    Ok(Some(EventRecord::new(clock, event)))
  }

  /// Consume the reader, keeping the interned-string table for use after
  /// the decode pass.
  #[must_use]
  pub fn into_strings(self) -> InternTable {
    self.strings
  }

  /// The interned-string table accumulated so far.
  #[must_use]
  pub fn strings(&self) -> &InternTable {
    &self.strings
  }

  /// Whether a tolerated truncation ended the stream.
  #[must_use]
  pub fn truncated(&self) -> bool {
    self.truncated
  }

  /// Number of records skipped because their code was not in the shape
  /// table.
  #[must_use]
  pub fn unknown_codes(&self) -> u64 {
    self.unknown_codes
  }

  fn fill(&mut self, buf: &mut [u8]) -> Result<Fill, ReadError> {
    let mut filled = 0;

    while filled < buf.len() {
      match self.reader.read(&mut buf[filled..]) {
        Ok(0) => {
          return Ok(if filled == 0 { Fill::Empty } else { Fill::Partial });
        }
        Ok(n) => filled += n,
        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
        Err(err) => return Err(err.into()),
      }
    }

    Ok(Fill::Full)
  }

  fn read_bytes(&mut self) -> Result<Option<Vec<u8>>, ReadError> {
    let Some(len) = self.read_word()? else {
      return Ok(None);
    };

    if len > MAX_STRING_BYTES {
      return Err(ReadError::Decode(format!(
        "string length {len} exceeds the {MAX_STRING_BYTES} byte cap"
      )));
    }

    let padded = len as usize + wire::padding_after(len as usize);
    let mut bytes = vec![0u8; padded];

    match self.fill(&mut bytes)? {
      Fill::Full => {
        bytes.truncate(len as usize);
        Ok(Some(bytes))
      }
      Fill::Empty | Fill::Partial => Ok(None),
    }
  }

  fn read_word(&mut self) -> Result<Option<u64>, ReadError> {
    let mut word = [0u8; WORD_BYTES];

    match self.fill(&mut word)? {
      Fill::Full => Ok(Some(LittleEndian::read_u64(&word))),
      Fill::Empty | Fill::Partial => Ok(None),
    }
  }

  fn truncate(&mut self) -> Result<Option<EventRecord>, ReadError> {
    match self.mode {
      ReadMode::Tolerant => {
        self.truncated = true;
        Ok(None)
      }
      ReadMode::Strict => Err(ReadError::Truncated),
    }
  }
}

fn build_event(code: EventCode, words: &[u64], text: Option<Vec<u8>>) -> Event {
  match code {
    EventCode::Intern => Event::Intern {
      text: text.unwrap_or_default(),
    },
    EventCode::Label => Event::Label {
      address: words[0],
      id: words[1],
    },
    EventCode::ArenaCreate => Event::ArenaCreate {
      arena: words[0],
      grain: words[1],
    },
    EventCode::ArenaDestroy => Event::ArenaDestroy { arena: words[0] },
    EventCode::PoolInit => Event::PoolInit {
      pool: words[0],
      arena: words[1],
      class_id: words[2],
    },
    EventCode::PoolFinish => Event::PoolFinish { pool: words[0] },
    EventCode::Reserve => Event::Reserve {
      arena: words[0],
      pool: words[1],
      size: words[2],
    },
    EventCode::Release => Event::Release {
      arena: words[0],
      pool: words[1],
      size: words[2],
    },
    EventCode::Alloc => Event::Alloc {
      pool: words[0],
      address: words[1],
      size: words[2],
      class_id: words[3],
      location_id: words[4],
    },
    EventCode::Free => Event::Free {
      pool: words[0],
      address: words[1],
      size: words[2],
    },
    EventCode::Commit => Event::Commit {
      arena: words[0],
      committed: words[1],
    },
    EventCode::Meter => Event::Meter {
      pool: words[0],
      value: f64::from_bits(words[1]),
    },
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::producer::EventLog;
  use crate::wire::FieldValue;
  use std::io::Cursor;
  use std::sync::{Arc as StdArc, Mutex};

  #[derive(Clone, Default)]
  struct SharedSink(StdArc<Mutex<Vec<u8>>>);

  impl io::Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
      self.0.lock().expect("sink lock").extend_from_slice(buf);
      Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
      Ok(())
    }
  }

  fn encode_all(events: &[(u64, Event)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (clock, event) in events {
      wire::encode_record(&mut out, event.raw_code(), *clock, &event.fields())
        .expect("vec write");
    }
    out
  }

  #[test]
  fn every_code_round_trips() {
    let events = vec![
      (1, Event::Intern { text: b"class-x".to_vec() }),
      (2, Event::Label { address: 0x10, id: 1 }),
      (3, Event::ArenaCreate { arena: 0x10, grain: 4096 }),
      (4, Event::PoolInit { pool: 0x20, arena: 0x10, class_id: 1 }),
      (5, Event::Reserve { arena: 0x10, pool: 0x20, size: 8192 }),
      (
        6,
        Event::Alloc {
          pool: 0x20,
          address: 0x1000,
          size: 64,
          class_id: 1,
          location_id: 0,
        },
      ),
      (7, Event::Free { pool: 0x20, address: 0x1000, size: 64 }),
      (8, Event::Release { arena: 0x10, pool: 0x20, size: 8192 }),
      (9, Event::Commit { arena: 0x10, committed: 1 << 20 }),
      (10, Event::Meter { pool: 0x20, value: 0.25 }),
      (11, Event::PoolFinish { pool: 0x20 }),
      (12, Event::ArenaDestroy { arena: 0x10 }),
    ];

    let bytes = encode_all(&events);
    let mut reader = LogReader::new(Cursor::new(bytes), ReadMode::Strict);

    for (clock, event) in &events {
      let record = reader
        .read_record()
        .expect("decode")
        .expect("record present");
      assert_eq!(record.clock, *clock);
      assert_eq!(&record.event, event);
    }

    assert!(reader.read_record().expect("clean end").is_none());
  }

  #[test]
  fn producer_output_decodes_back() {
    let sink = SharedSink::default();
    let log = EventLog::new(sink.clone());

    let class = log.intern(b"symbol-table");
    log.arena_create(0xa000, 4096);
    log.pool_init(0xb000, 0xa000, Some(class));
    log.alloc(0xb000, 0x1000, 64, Some(class), None);
    log.sync().expect("sync");

    let bytes = sink.0.lock().expect("sink lock").clone();
    let mut reader = LogReader::new(Cursor::new(bytes), ReadMode::Strict);

    let mut decoded = Vec::new();
    while let Some(record) = reader.read_record().expect("decode") {
      decoded.push(record.event);
    }

    assert_eq!(decoded.len(), 4);
    assert_eq!(reader.strings().get(class).as_deref(), Some("symbol-table"));
    assert!(matches!(decoded[3], Event::Alloc { size: 64, .. }));
  }

  #[test]
  fn truncation_is_tolerated_or_fatal_by_mode() {
    let events = vec![(
      1,
      Event::Alloc {
        pool: 0x20,
        address: 0x1000,
        size: 64,
        class_id: 0,
        location_id: 0,
      },
    )];
    let bytes = encode_all(&events);

    // Truncate at every interior offset of the record.
    for cut in 1..bytes.len() {
      let partial = bytes[..cut].to_vec();

      let mut tolerant =
        LogReader::new(Cursor::new(partial.clone()), ReadMode::Tolerant);
      assert!(tolerant.read_record().expect("tolerated").is_none());
      assert!(tolerant.truncated());
      assert!(tolerant.strings().is_empty());

      let mut strict = LogReader::new(Cursor::new(partial), ReadMode::Strict);
      assert!(matches!(
        strict.read_record(),
        Err(ReadError::Truncated)
      ));
    }
  }

  #[test]
  fn clean_end_is_not_truncation() {
    let bytes = encode_all(&[(1, Event::ArenaDestroy { arena: 0x10 })]);
    let mut reader = LogReader::new(Cursor::new(bytes), ReadMode::Tolerant);

    assert!(reader.read_record().expect("record").is_some());
    assert!(reader.read_record().expect("end").is_none());
    assert!(!reader.truncated());
  }

  #[test]
  fn unknown_codes_are_counted_not_fatal() {
    let mut bytes = Vec::new();
    wire::encode_record(&mut bytes, 0x7f, 1, &[]).expect("vec write");
    wire::encode_record(
      &mut bytes,
      EventCode::ArenaDestroy as u8,
      2,
      &[FieldValue::Address(0x10)],
    )
    .expect("vec write");

    let mut reader = LogReader::new(Cursor::new(bytes), ReadMode::Strict);

    let first = reader.read_record().expect("unknown").expect("record");
    assert_eq!(first.event, Event::Unknown { code: 0x7f });

    let second = reader.read_record().expect("known").expect("record");
    assert_eq!(second.event, Event::ArenaDestroy { arena: 0x10 });

    assert_eq!(reader.unknown_codes(), 1);
  }

  #[test]
  fn oversized_string_length_is_a_decode_error() {
    let mut bytes = Vec::new();
    wire::encode_record(&mut bytes, EventCode::Intern as u8, 1, &[])
      .expect("vec write");
    // Hand-append an absurd length word.
    bytes.extend_from_slice(&u64::MAX.to_le_bytes());

    let mut reader = LogReader::new(Cursor::new(bytes), ReadMode::Tolerant);
    assert!(matches!(
      reader.read_record(),
      Err(ReadError::Decode(_))
    ));
  }

  #[test]
  fn intern_ids_are_sequential_from_one() {
    let bytes = encode_all(&[
      (1, Event::Intern { text: b"first".to_vec() }),
      (2, Event::Intern { text: b"second".to_vec() }),
    ]);

    let mut reader = LogReader::new(Cursor::new(bytes), ReadMode::Strict);
    while reader.read_record().expect("decode").is_some() {}

    assert_eq!(reader.strings().get(1).as_deref(), Some("first"));
    assert_eq!(reader.strings().get(2).as_deref(), Some("second"));
    assert_eq!(reader.strings().get(3), None);
  }
}
