use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;

use crate::counter::CodeSet;
use crate::report::Style;

/// A malformed `-t` or `-r` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOptionError {
  pub offending: String,
  pub reason: &'static str,
}

impl Display for ParseOptionError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    write!(f, "bad option value {:?}: {}", self.offending, self.reason)
  }
}

impl std::error::Error for ParseOptionError {}

/// What live allocation tracking prints, selected by `-t` flag letters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackFlags {
  /// `a`: a line per arena-grain event (reserve/release).
  pub arena_lines: bool,
  /// `A`: an arena summary when it is destroyed.
  pub arena_summaries: bool,
  /// `c`: a line per commit event.
  pub commit_lines: bool,
  /// `E`: a summary of everything still live at end of log.
  pub end_summary: bool,
  /// `p`: a line per pool-grain event (alloc/free).
  pub pool_lines: bool,
  /// `P`: a pool summary when it finishes.
  pub pool_summaries: bool,
  /// `t`: prefix lines with wall-clock-scaled time.
  pub timestamps: bool,
}

impl TrackFlags {
  /// Whether any tracking output is requested at all.
  #[must_use]
  pub fn any(&self) -> bool {
    *self != Self::default()
  }

  /// Parse the flag letters of a `-t` argument, e.g. `aPE`.
  ///
  /// # Errors
  ///
  /// Returns an error naming the unrecognized letter.
  pub fn parse(letters: &str) -> Result<Self, ParseOptionError> {
    let mut flags = Self::default();

    for letter in letters.chars() {
      match letter {
        'a' => flags.arena_lines = true,
        'A' => flags.arena_summaries = true,
        'p' => flags.pool_lines = true,
        'P' => flags.pool_summaries = true,
        'c' => flags.commit_lines = true,
        'E' => flags.end_summary = true,
        't' => flags.timestamps = true,
        _ => {
          return Err(ParseOptionError {
            offending: letter.to_string(),
            reason: "unknown tracking flag; expected one of aApPcEt",
          });
        }
      }
    }

    Ok(flags)
  }
}

/// One inclusive size range from a `-r` argument: `low-high` with either
/// bound omittable, or a singleton `n`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeRange {
  pub high: Option<u64>,
  pub low: Option<u64>,
}

impl SizeRange {
  #[must_use]
  pub fn contains(&self, size: u64) -> bool {
    self.low.map_or(true, |low| size >= low)
      && self.high.map_or(true, |high| size <= high)
  }

  /// Parse a comma separated list of ranges and singletons.
  ///
  /// # Errors
  ///
  /// Returns an error naming the unparseable piece.
  pub fn parse_list(text: &str) -> Result<Vec<Self>, ParseOptionError> {
    text.split(',').map(|piece| Self::parse(piece.trim())).collect()
  }

  fn parse(piece: &str) -> Result<Self, ParseOptionError> {
    let bad = |reason| ParseOptionError {
      offending: piece.to_string(),
      reason,
    };

    match piece.split_once('-') {
      None => {
        let value = piece.parse().map_err(|_| bad("expected a size"))?;
        Ok(Self {
          high: Some(value),
          low: Some(value),
        })
      }
      Some((low, high)) => {
        let low = if low.is_empty() {
          None
        } else {
          Some(low.parse().map_err(|_| bad("bad lower bound"))?)
        };
        let high = if high.is_empty() {
          None
        } else {
          Some(high.parse().map_err(|_| bad("bad upper bound"))?)
        };

        if low.is_none() && high.is_none() {
          return Err(bad("range needs at least one bound"));
        }
        if let (Some(low), Some(high)) = (low, high) {
          if low > high {
            return Err(bad("lower bound exceeds upper bound"));
          }
        }

        Ok(Self { high, low })
      }
    }
  }
}

/// Returns true when `size` matches the restriction list; an empty list
/// matches everything.
#[must_use]
pub fn size_selected(ranges: &[SizeRange], size: u64) -> bool {
  ranges.is_empty() || ranges.iter().any(|range| range.contains(size))
}

/// Fully resolved analyzer configuration, assembled by the CLI driver.
#[derive(Debug, Default)]
pub struct AnalyzeConfig {
  /// Bucket size in clock units for periodic per-code counts.
  pub bucket_size: Option<u64>,
  /// Codes selected for counting, when `-e` was given.
  pub count_set: Option<CodeSet>,
  /// Where to write the final accounting snapshot as JSON, if anywhere.
  pub json_path: Option<PathBuf>,
  /// Size restrictions on line-by-line tracking output.
  pub ranges: Vec<SizeRange>,
  pub style: Style,
  /// Treat a truncated trailing record as a normal end of stream.
  pub tolerant: bool,
  pub track: TrackFlags,
  /// Echo every decoded record.
  pub verbose: bool,
}

impl AnalyzeConfig {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  #[must_use]
  pub fn tolerant(mut self, tolerant: bool) -> Self {
    self.tolerant = tolerant;
    self
  }

  #[must_use]
  pub fn verbose(mut self, verbose: bool) -> Self {
    self.verbose = verbose;
    self
  }

  #[must_use]
  pub fn with_style(mut self, style: Style) -> Self {
    self.style = style;
    self
  }

  #[must_use]
  pub fn with_tracking(mut self, track: TrackFlags) -> Self {
    self.track = track;
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn track_flags_parse_each_letter() {
    let flags = TrackFlags::parse("aApPcEt").expect("parse");
    assert!(flags.arena_lines);
    assert!(flags.arena_summaries);
    assert!(flags.pool_lines);
    assert!(flags.pool_summaries);
    assert!(flags.commit_lines);
    assert!(flags.end_summary);
    assert!(flags.timestamps);
    assert!(flags.any());

    assert!(!TrackFlags::parse("").expect("empty").any());
    assert!(TrackFlags::parse("z").is_err());
  }

  #[test]
  fn size_ranges_parse_with_open_bounds() {
    let ranges = SizeRange::parse_list("64,128-256,-32,1024-").expect("parse");

    assert!(size_selected(&ranges, 64));
    assert!(!size_selected(&ranges, 65));
    assert!(size_selected(&ranges, 200));
    assert!(size_selected(&ranges, 16));
    assert!(size_selected(&ranges, 4096));
    assert!(!size_selected(&ranges, 512));
  }

  #[test]
  fn empty_restriction_list_selects_everything() {
    assert!(size_selected(&[], 12345));
  }

  #[test]
  fn bad_ranges_are_rejected() {
    assert!(SizeRange::parse_list("abc").is_err());
    assert!(SizeRange::parse_list("-").is_err());
    assert!(SizeRange::parse_list("9-1").is_err());
  }
}
