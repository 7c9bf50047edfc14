use std::{collections::BTreeMap, sync::Arc};

use crate::wire::Address;

/// One byte span removed from the index by a free request.
#[derive(Debug, Clone)]
pub struct FreedSlice {
  pub bytes: u64,
  pub class: Arc<str>,
  /// True when the whole live range was consumed, so the owning class's
  /// object count goes down as well as its size.
  pub removed: bool,
}

/// Result of resolving one free request against the index.
#[derive(Debug, Clone, Default)]
pub struct FreeOutcome {
  pub slices: Vec<FreedSlice>,
  /// Requested bytes with no live range under them. Non-zero means the
  /// log started after the matching allocation, or the request spanned a
  /// gap between live ranges.
  pub unmatched: u64,
}

impl FreeOutcome {
  #[must_use]
  pub fn freed_bytes(&self) -> u64 {
    self.slices.iter().map(|slice| slice.bytes).sum()
  }
}

/// Index over a pool's currently-live `[addr, addr + size)` ranges, keyed
/// by start address. Live ranges never overlap; a free request may match
/// exactly, trim a range at either end, or punch a hole through its
/// middle.
#[derive(Debug, Default)]
pub struct RangeIndex {
  ranges: BTreeMap<Address, LiveRange>,
}

#[derive(Debug, Clone)]
struct LiveRange {
  class: Arc<str>,
  size: u64,
}

impl RangeIndex {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Remove every live range, yielding `(address, size, class)` tuples.
  /// Used when a pool finishes with allocations still live.
  pub fn drain(&mut self) -> Vec<(Address, u64, Arc<str>)> {
    let ranges = std::mem::take(&mut self.ranges);
    ranges
      .into_iter()
      .map(|(address, range)| (address, range.size, range.class))
      .collect()
  }

  /// Resolve a free request against the index.
  ///
  /// Every overlapping live range is trimmed, split, or removed until no
  /// overlap with `[address, address + size)` remains. The outcome's
  /// freed bytes plus its unmatched bytes always equal `size` exactly.
  pub fn free(&mut self, address: Address, size: u64) -> FreeOutcome {
    let mut outcome = FreeOutcome::default();

    if size == 0 {
      return outcome;
    }

    let free_end = address.saturating_add(size);

    for (start, range) in self.overlapping(address, free_end) {
      let range_end = start.saturating_add(range.size);
      let covered_start = start.max(address);
      let covered_end = range_end.min(free_end);
      let covered = covered_end - covered_start;

      if covered_start == start && covered_end == range_end {
        // Full cover: the range disappears.
        self.ranges.remove(&start);
        outcome.slices.push(FreedSlice {
          bytes: covered,
          class: range.class,
          removed: true,
        });
      } else if covered_start == start {
        // Front trim: the suffix survives at a new start address.
        self.ranges.remove(&start);
        self.ranges.insert(
          covered_end,
          LiveRange {
            class: range.class.clone(),
            size: range_end - covered_end,
          },
        );
        outcome.slices.push(FreedSlice {
          bytes: covered,
          class: range.class,
          removed: false,
        });
      } else if covered_end == range_end {
        // Back trim: shrink in place.
        if let Some(entry) = self.ranges.get_mut(&start) {
          entry.size = covered_start - start;
        }
        outcome.slices.push(FreedSlice {
          bytes: covered,
          class: range.class,
          removed: false,
        });
      } else {
        // Interior hole: prefix shrinks, suffix keeps the class.
        if let Some(entry) = self.ranges.get_mut(&start) {
          entry.size = covered_start - start;
        }
        self.ranges.insert(
          covered_end,
          LiveRange {
            class: range.class.clone(),
            size: range_end - covered_end,
          },
        );
        outcome.slices.push(FreedSlice {
          bytes: covered,
          class: range.class,
          removed: false,
        });
      }
    }

    outcome.unmatched = size - outcome.freed_bytes();
    outcome
  }

  /// Insert a new live range. Any existing range overlapping it is first
  /// evicted and returned, so the caller can account for the implicit
  /// free; a well-formed log never triggers that path.
  pub fn insert(
    &mut self,
    address: Address,
    size: u64,
    class: Arc<str>,
  ) -> FreeOutcome {
    let evicted = self.free(address, size);

    if size > 0 {
      self.ranges.insert(address, LiveRange { class, size });
    }

    evicted
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.ranges.is_empty()
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.ranges.len()
  }

  /// Total bytes currently live in the index.
  #[must_use]
  pub fn live_bytes(&self) -> u64 {
    self.ranges.values().map(|range| range.size).sum()
  }

  /// Live ranges as `(address, size, class)` in address order.
  #[must_use]
  pub fn live_ranges(&self) -> Vec<(Address, u64, Arc<str>)> {
    self
      .ranges
      .iter()
      .map(|(address, range)| (*address, range.size, range.class.clone()))
      .collect()
  }

  fn overlapping(
    &self,
    start: Address,
    end: Address,
  ) -> Vec<(Address, LiveRange)> {
    // Candidates start strictly before `end`; the one starting at or
    // before `start` may still reach into the freed span.
    self
      .ranges
      .range(..end)
      .rev()
      .take_while(|(range_start, range)| {
        range_start.saturating_add(range.size) > start
      })
      .map(|(range_start, range)| (*range_start, range.clone()))
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn class(name: &str) -> Arc<str> {
    Arc::from(name)
  }

  #[test]
  fn exact_free_removes_the_range() {
    let mut index = RangeIndex::new();
    index.insert(0x1000, 64, class("x"));

    let outcome = index.free(0x1000, 64);

    assert_eq!(outcome.freed_bytes(), 64);
    assert_eq!(outcome.unmatched, 0);
    assert!(outcome.slices[0].removed);
    assert!(index.is_empty());
  }

  #[test]
  fn front_trim_keeps_one_smaller_range() {
    let mut index = RangeIndex::new();
    index.insert(0x1000, 64, class("x"));

    let outcome = index.free(0x1000, 32);

    assert_eq!(outcome.freed_bytes(), 32);
    assert!(!outcome.slices[0].removed);
    assert_eq!(index.live_ranges(), vec![(0x1020, 32, class("x"))]);
    assert_eq!(index.live_bytes(), 32);
  }

  #[test]
  fn back_trim_keeps_one_smaller_range() {
    let mut index = RangeIndex::new();
    index.insert(0x1000, 64, class("x"));

    let outcome = index.free(0x1020, 32);

    assert_eq!(outcome.freed_bytes(), 32);
    assert!(!outcome.slices[0].removed);
    assert_eq!(index.live_ranges(), vec![(0x1000, 32, class("x"))]);
  }

  #[test]
  fn interior_free_splits_into_two() {
    let mut index = RangeIndex::new();
    index.insert(0x1000, 0x100, class("x"));

    let outcome = index.free(0x1040, 0x40);

    assert_eq!(outcome.freed_bytes(), 0x40);
    assert!(!outcome.slices[0].removed);
    assert_eq!(
      index.live_ranges(),
      vec![(0x1000, 0x40, class("x")), (0x1080, 0x80, class("x"))]
    );
    assert_eq!(index.live_bytes(), 0x100 - 0x40);
  }

  #[test]
  fn free_spanning_several_ranges_consumes_them_all() {
    let mut index = RangeIndex::new();
    index.insert(0x1000, 0x10, class("x"));
    index.insert(0x1010, 0x10, class("y"));
    index.insert(0x1020, 0x10, class("z"));

    let outcome = index.free(0x1000, 0x30);

    assert_eq!(outcome.freed_bytes(), 0x30);
    assert_eq!(outcome.unmatched, 0);
    assert_eq!(outcome.slices.len(), 3);
    assert!(outcome.slices.iter().all(|slice| slice.removed));
    assert!(index.is_empty());
  }

  #[test]
  fn free_across_a_gap_reports_unmatched_bytes() {
    let mut index = RangeIndex::new();
    index.insert(0x1000, 0x10, class("x"));
    index.insert(0x1020, 0x10, class("x"));

    let outcome = index.free(0x1000, 0x30);

    assert_eq!(outcome.freed_bytes(), 0x20);
    assert_eq!(outcome.unmatched, 0x10);
    assert!(index.is_empty());
  }

  #[test]
  fn free_with_no_live_range_is_fully_unmatched() {
    let mut index = RangeIndex::new();

    let outcome = index.free(0x1000, 64);

    assert_eq!(outcome.freed_bytes(), 0);
    assert_eq!(outcome.unmatched, 64);
  }

  #[test]
  fn overlapping_insert_evicts_the_old_range() {
    let mut index = RangeIndex::new();
    index.insert(0x1000, 64, class("x"));

    let evicted = index.insert(0x1000, 64, class("y"));

    assert_eq!(evicted.freed_bytes(), 64);
    assert_eq!(index.live_ranges(), vec![(0x1000, 64, class("y"))]);
  }

  #[test]
  fn conservation_holds_across_random_style_churn() {
    let mut index = RangeIndex::new();
    let mut expected: u64 = 0;

    for i in 0..32u64 {
      index.insert(0x1000 + i * 0x100, 0x80, class("x"));
      expected += 0x80;
    }

    // Trim the front of every other range, then free the rest of them.
    for i in (0..32u64).step_by(2) {
      let outcome = index.free(0x1000 + i * 0x100, 0x20);
      expected -= outcome.freed_bytes();
    }
    for i in (0..32u64).step_by(2) {
      let outcome = index.free(0x1020 + i * 0x100, 0x60);
      expected -= outcome.freed_bytes();
    }

    assert_eq!(index.live_bytes(), expected);
    assert_eq!(index.len(), 16);
  }
}
