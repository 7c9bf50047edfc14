use std::{
  collections::HashMap,
  io::{self, Write},
  sync::{Mutex, MutexGuard},
  time::Instant,
};

use std::fmt::{self, Display, Formatter};

use crate::event::Event;
use crate::wire::{
  self, Address, EventCode, LabelId, encoded_len,
};

/// Error surfaced by `EventLog::sync`.
#[derive(Debug)]
pub enum ProduceError {
  Io(io::Error),
}

impl Display for ProduceError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::Io(err) => write!(f, "i/o error while writing event log: {err}"),
    }
  }
}

impl std::error::Error for ProduceError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Io(err) => Some(err),
    }
  }
}

impl From<io::Error> for ProduceError {
  fn from(value: io::Error) -> Self {
    Self::Io(value)
  }
}

/// Predicate deciding whether a code is written at all. Lets callers turn
/// off expensive or rarely-needed events without touching call sites.
pub type CodeFilter = Box<dyn Fn(EventCode) -> bool + Send>;

/// Monotonic clock feeding the header word of every record.
pub type ClockFn = Box<dyn FnMut() -> u64 + Send>;

/// Configures an `EventLog` before construction.
pub struct EventLogBuilder {
  buffer_bytes: usize,
  clock: Option<ClockFn>,
  filter: Option<CodeFilter>,
}

impl Default for EventLogBuilder {
  fn default() -> Self {
    Self {
      buffer_bytes: 64 * 1024,
      clock: None,
      filter: None,
    }
  }
}

impl EventLogBuilder {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Size of the in-memory batch buffer. Records larger than the buffer
  /// are written straight through.
  #[must_use]
  pub fn buffer_bytes(mut self, bytes: usize) -> Self {
    self.buffer_bytes = bytes.max(wire::WORD_BYTES);
    self
  }

  /// Replace the default monotonic clock. Values are clamped so the logged
  /// clock never decreases within one session.
  #[must_use]
  pub fn clock(mut self, clock: ClockFn) -> Self {
    self.clock = Some(clock);
    self
  }

  #[must_use]
  pub fn filter(mut self, filter: CodeFilter) -> Self {
    self.filter = Some(filter);
    self
  }

  #[must_use]
  pub fn finish<W: Write + Send + 'static>(self, sink: W) -> EventLog {
    let clock = self.clock.unwrap_or_else(|| {
      let origin = Instant::now();
      Box::new(move || origin.elapsed().as_nanos() as u64)
    });

    EventLog {
      inner: Mutex::new(LogInner {
        buffer: Vec::with_capacity(self.buffer_bytes),
        capacity: self.buffer_bytes,
        clock,
        error: None,
        filter: self.filter,
        interned: HashMap::new(),
        last_clock: 0,
        next_label: 1,
        sink: Box::new(sink),
      }),
    }
  }
}

struct LogInner {
  buffer: Vec<u8>,
  capacity: usize,
  clock: ClockFn,
  error: Option<io::Error>,
  filter: Option<CodeFilter>,
  interned: HashMap<Vec<u8>, LabelId>,
  last_clock: u64,
  next_label: LabelId,
  sink: Box<dyn Write + Send>,
}

impl LogInner {
  fn emit(&mut self, event: &Event) {
    if self.error.is_some() {
      return;
    }

    if let (Some(filter), Some(code)) = (&self.filter, event.code()) {
      if !filter(code) {
        return;
      }
    }

    let clock = (self.clock)().max(self.last_clock);
    self.last_clock = clock;

    let fields = event.fields();
    let record_len = encoded_len(&fields);

    if self.buffer.len() + record_len > self.capacity {
      self.flush_buffer();
    }

    // Oversized records bypass the buffer entirely so they are still
    // written whole.
    if record_len > self.capacity {
      let result = wire::encode_record(
        &mut self.sink,
        event.raw_code(),
        clock,
        &fields,
      );
      if let Err(err) = result {
        self.error = Some(err);
      }
      return;
    }

    // Encoding into a Vec cannot fail.
    let _ = wire::encode_record(
      &mut self.buffer,
      event.raw_code(),
      clock,
      &fields,
    );
  }

  fn flush_buffer(&mut self) {
    if self.buffer.is_empty() {
      return;
    }

    if let Err(err) = self.sink.write_all(&self.buffer) {
      if self.error.is_none() {
        self.error = Some(err);
      }
    }

    self.buffer.clear();
  }

  fn intern(&mut self, text: &[u8]) -> LabelId {
    if let Some(existing) = self.interned.get(text) {
      return *existing;
    }

    let id = self.next_label;
    self.next_label = self.next_label.saturating_add(1);
    self.interned.insert(text.to_vec(), id);

    self.emit(&Event::Intern {
      text: text.to_vec(),
    });

    id
  }
}

/// Process-wide buffered event writer used by the instrumented allocator.
///
/// All emit paths run under one exclusive lock so "check space, encode,
/// possibly flush" is a single critical section; interleaving a partial
/// record with another thread's bytes would corrupt the stream
/// irrecoverably. Emits are fire and forget: I/O failures set a sticky
/// error that suppresses further writes until the caller consumes it via
/// `sync`.
pub struct EventLog {
  inner: Mutex<LogInner>,
}

impl EventLog {
  #[must_use]
  pub fn builder() -> EventLogBuilder {
    EventLogBuilder::new()
  }

  #[must_use]
  pub fn new<W: Write + Send + 'static>(sink: W) -> Self {
    EventLogBuilder::new().finish(sink)
  }

  pub fn alloc(
    &self,
    pool: Address,
    address: Address,
    size: u64,
    class: Option<LabelId>,
    location: Option<LabelId>,
  ) {
    self.emit(&Event::Alloc {
      pool,
      address,
      size,
      class_id: class.unwrap_or(0),
      location_id: location.unwrap_or(0),
    });
  }

  pub fn arena_create(&self, arena: Address, grain: u64) {
    self.emit(&Event::ArenaCreate { arena, grain });
  }

  pub fn arena_destroy(&self, arena: Address) {
    self.emit(&Event::ArenaDestroy { arena });
  }

  pub fn commit(&self, arena: Address, committed: u64) {
    self.emit(&Event::Commit { arena, committed });
  }

  /// Emit a report directive: an interned `"dump ..."` string labelled at
  /// the null address, executed by the analyzer when it reaches this point
  /// of the log.
  pub fn directive(&self, text: &str) {
    let id = self.intern(text.as_bytes());
    self.label(0, id);
  }

  /// Encode one event into the session buffer, flushing first if it does
  /// not fit.
  pub fn emit(&self, event: &Event) {
    self.lock_inner().emit(event);
  }

  pub fn free(&self, pool: Address, address: Address, size: u64) {
    self.emit(&Event::Free {
      pool,
      address,
      size,
    });
  }

  /// Intern `text`, emitting an Intern record only the first time this
  /// exact byte string is seen in the session.
  pub fn intern(&self, text: &[u8]) -> LabelId {
    self.lock_inner().intern(text)
  }

  pub fn label(&self, address: Address, id: LabelId) {
    self.emit(&Event::Label { address, id });
  }

  fn lock_inner(&self) -> MutexGuard<'_, LogInner> {
    match self.inner.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }

  pub fn meter(&self, pool: Address, value: f64) {
    self.emit(&Event::Meter { pool, value });
  }

  pub fn pool_finish(&self, pool: Address) {
    self.emit(&Event::PoolFinish { pool });
  }

  pub fn pool_init(&self, pool: Address, arena: Address, class: Option<LabelId>) {
    self.emit(&Event::PoolInit {
      pool,
      arena,
      class_id: class.unwrap_or(0),
    });
  }

  pub fn release(&self, arena: Address, pool: Address, size: u64) {
    self.emit(&Event::Release { arena, pool, size });
  }

  pub fn reserve(&self, arena: Address, pool: Address, size: u64) {
    self.emit(&Event::Reserve { arena, pool, size });
  }

  /// Flush the batch buffer and the sink, then report and clear the first
  /// I/O error encountered since the last successful sync.
  ///
  /// # Errors
  ///
  /// Returns the sticky `ProduceError` if any emit or flush failed.
  pub fn sync(&self) -> Result<(), ProduceError> {
    let mut inner = self.lock_inner();
    inner.flush_buffer();

    if inner.error.is_none() {
      if let Err(err) = inner.sink.flush() {
        inner.error = Some(err);
      }
    }

    match inner.error.take() {
      Some(err) => Err(ProduceError::Io(err)),
      None => Ok(()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::{Arc, Mutex as StdMutex};

  #[derive(Clone, Default)]
  struct SharedSink(Arc<StdMutex<Vec<u8>>>);

  impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
      self.0.lock().expect("sink lock").extend_from_slice(buf);
      Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
      Ok(())
    }
  }

  struct FailingSink;

  impl Write for FailingSink {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
      Err(io::Error::other("disk gone"))
    }

    fn flush(&mut self) -> io::Result<()> {
      Ok(())
    }
  }

  fn counted_clock() -> ClockFn {
    let mut tick = 0;
    Box::new(move || {
      tick += 1;
      tick
    })
  }

  #[test]
  fn interning_is_idempotent() {
    let sink = SharedSink::default();
    let log = EventLog::builder()
      .clock(counted_clock())
      .finish(sink.clone());

    let first = log.intern(b"class-x");
    let second = log.intern(b"class-x");
    assert_eq!(first, second);

    let other = log.intern(b"class-y");
    assert_ne!(first, other);

    log.sync().expect("sync");

    // One Intern record per distinct string: 2 records total.
    let bytes = sink.0.lock().expect("sink lock").clone();
    let record_len = wire::WORD_BYTES * 3; // header + length + 7 padded bytes
    assert_eq!(bytes.len(), record_len * 2);
  }

  #[test]
  fn buffer_flushes_when_full() {
    let sink = SharedSink::default();
    let log = EventLog::builder()
      .buffer_bytes(wire::WORD_BYTES * 4)
      .clock(counted_clock())
      .finish(sink.clone());

    // Each ArenaDestroy record is two words; the third emit must flush.
    log.arena_destroy(0x10);
    log.arena_destroy(0x20);
    assert!(sink.0.lock().expect("sink lock").is_empty());

    log.arena_destroy(0x30);
    assert_eq!(
      sink.0.lock().expect("sink lock").len(),
      wire::WORD_BYTES * 4
    );
  }

  #[test]
  fn sticky_error_is_surfaced_once_by_sync() {
    let log = EventLog::builder()
      .buffer_bytes(wire::WORD_BYTES)
      .clock(counted_clock())
      .finish(FailingSink);

    log.arena_destroy(0x10);
    log.arena_destroy(0x20); // forces a failing flush

    assert!(log.sync().is_err());
    assert!(log.sync().is_ok());
  }

  #[test]
  fn filter_suppresses_codes_before_encoding() {
    let sink = SharedSink::default();
    let log = EventLog::builder()
      .clock(counted_clock())
      .filter(Box::new(|code| code != EventCode::Meter))
      .finish(sink.clone());

    log.meter(0x20, 1.0);
    log.sync().expect("sync");

    assert!(sink.0.lock().expect("sink lock").is_empty());
  }

  #[test]
  fn logged_clock_never_decreases() {
    let sink = SharedSink::default();
    let mut values = vec![5u64, 9, 3].into_iter();
    let log = EventLog::builder()
      .clock(Box::new(move || values.next().unwrap_or(0)))
      .finish(sink.clone());

    log.arena_destroy(0x10);
    log.arena_destroy(0x20);
    log.arena_destroy(0x30);
    log.sync().expect("sync");

    let bytes = sink.0.lock().expect("sink lock").clone();
    let mut clocks = Vec::new();
    for chunk in bytes.chunks(wire::WORD_BYTES * 2) {
      let word = u64::from_le_bytes(chunk[..8].try_into().expect("word"));
      clocks.push(wire::unpack_header(word).1);
    }

    assert_eq!(clocks, vec![5, 9, 9]);
  }
}
