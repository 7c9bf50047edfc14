//! Event-telemetry pipeline for a memory-pool allocator.
//!
//! The producer half ([`EventLog`]) is linked into the instrumented
//! process and batches encoded lifecycle records into a fixed buffer.
//! The analyzer half decodes the resulting binary log one record at a
//! time ([`LogReader`]), reconstructs a hierarchical accounting model of
//! arenas, pools and allocation classes ([`Tracker`]), and answers
//! selector queries over it ([`report`]).

mod config;
mod counter;
mod event;
mod producer;
mod range_index;
mod reader;
pub mod report;
mod selector;
mod sink;
mod tracker;
mod wire;

pub use {
  config::{
    AnalyzeConfig, ParseOptionError, SizeRange, TrackFlags, size_selected,
  },
  counter::{CodeSet, EventCounter, ParseCountSpecError},
  event::{Event, EventRecord},
  producer::{EventLog, EventLogBuilder, ProduceError},
  range_index::{FreeOutcome, FreedSlice, RangeIndex},
  reader::{InternTable, LogReader, ReadError, ReadMode},
  report::{ExportError, Report, Row, RowKind, Style},
  selector::{
    Clause, DumpSpec, EntityMatch, ParseSelectorError,
    parse as parse_selector,
  },
  sink::MmapLogSink,
  tracker::{
    Applied, ArenaRecord, ArenaSnapshot, ClassSnapshot, DIRECTIVE_PREFIX,
    PoolRecord, PoolSnapshot, RetiredArena, ScopeStats, Snapshot, Tracker,
    UNCLASSIFIED,
  },
  wire::{Address, EventCode, FieldKind, FieldValue, LabelId},
};
