use std::{
  collections::BTreeMap,
  fmt::{self, Display, Formatter},
  io::{self, Write},
};

use crate::wire::EventCode;

/// A malformed `-e` counting spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCountSpecError {
  pub offending: String,
}

impl Display for ParseCountSpecError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "bad count spec near {:?}: expected `all` or a +/- joined list of \
       event names",
      self.offending
    )
  }
}

impl std::error::Error for ParseCountSpecError {}

/// The set of event codes selected for counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeSet {
  enabled: [bool; 256],
}

impl Default for CodeSet {
  fn default() -> Self {
    Self {
      enabled: [false; 256],
    }
  }
}

impl CodeSet {
  #[must_use]
  pub fn all() -> Self {
    let mut set = Self::default();
    for code in EventCode::ALL {
      set.enabled[code as usize] = true;
    }
    set
  }

  #[must_use]
  pub fn contains(&self, code: u8) -> bool {
    self.enabled[code as usize]
  }

  /// Parse a spec such as `all`, `+Alloc+Free`, or `all-Meter`.
  ///
  /// Processed left to right: `all` enables every known code, `+Name`
  /// enables one, `-Name` disables one.
  ///
  /// # Errors
  ///
  /// Returns an error naming the first unparseable token.
  pub fn parse(spec: &str) -> Result<Self, ParseCountSpecError> {
    let mut set = Self::default();
    let mut rest = spec.trim();

    if let Some(after) = rest.strip_prefix("all") {
      set = Self::all();
      rest = after;
    }

    while !rest.is_empty() {
      let (enable, after_sign) = match rest.as_bytes()[0] {
        b'+' => (true, &rest[1..]),
        b'-' => (false, &rest[1..]),
        _ => {
          return Err(ParseCountSpecError {
            offending: rest.to_string(),
          });
        }
      };

      let name_len = after_sign
        .find(['+', '-'])
        .unwrap_or(after_sign.len());
      let (name, after_name) = after_sign.split_at(name_len);

      let Some(code) = EventCode::from_name(name) else {
        return Err(ParseCountSpecError {
          offending: name.to_string(),
        });
      };

      set.enabled[code as usize] = enable;
      rest = after_name;
    }

    Ok(set)
  }
}

/// Counts selected event codes, overall and per clock bucket when a
/// bucket size is configured.
#[derive(Debug)]
pub struct EventCounter {
  bucket_size: Option<u64>,
  buckets: BTreeMap<u64, BTreeMap<u8, u64>>,
  set: CodeSet,
  totals: BTreeMap<u8, u64>,
}

impl EventCounter {
  #[must_use]
  pub fn new(set: CodeSet, bucket_size: Option<u64>) -> Self {
    Self {
      bucket_size: bucket_size.filter(|size| *size > 0),
      buckets: BTreeMap::new(),
      set,
      totals: BTreeMap::new(),
    }
  }

  pub fn record(&mut self, code: u8, clock: u64) {
    if !self.set.contains(code) {
      return;
    }

    *self.totals.entry(code).or_insert(0) += 1;

    if let Some(size) = self.bucket_size {
      let bucket = clock / size;
      *self
        .buckets
        .entry(bucket)
        .or_default()
        .entry(code)
        .or_insert(0) += 1;
    }
  }

  #[must_use]
  pub fn total(&self, code: EventCode) -> u64 {
    self.totals.get(&(code as u8)).copied().unwrap_or(0)
  }

  /// Print totals and, when bucketing is enabled, per-bucket counts.
  ///
  /// # Errors
  ///
  /// Propagates writer failures.
  pub fn render<W: Write>(&self, mut out: W) -> io::Result<()> {
    if self.totals.is_empty() {
      return Ok(());
    }

    writeln!(out, "event counts:")?;
    for (code, count) in &self.totals {
      writeln!(out, "  {name:<14} {count:>10}", name = code_name(*code))?;
    }

    let Some(size) = self.bucket_size else {
      return Ok(());
    };

    writeln!(out, "per-bucket counts (bucket = {size} clock units):")?;
    for (bucket, counts) in &self.buckets {
      let line: Vec<String> = counts
        .iter()
        .map(|(code, count)| format!("{}={count}", code_name(*code)))
        .collect();
      writeln!(
        out,
        "  [{start}..{end}) {joined}",
        start = bucket * size,
        end = (bucket + 1) * size,
        joined = line.join(" ")
      )?;
    }

    Ok(())
  }
}

fn code_name(code: u8) -> String {
  match EventCode::from_u8(code) {
    Some(known) => known.name().to_string(),
    None => format!("code {code:#04x}"),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn all_spec_counts_every_known_code() {
    let set = CodeSet::parse("all").expect("parse");
    for code in EventCode::ALL {
      assert!(set.contains(code as u8));
    }
  }

  #[test]
  fn plus_and_minus_adjust_the_set() {
    let set = CodeSet::parse("+Alloc+Free").expect("parse");
    assert!(set.contains(EventCode::Alloc as u8));
    assert!(set.contains(EventCode::Free as u8));
    assert!(!set.contains(EventCode::Commit as u8));

    let set = CodeSet::parse("all-Meter").expect("parse");
    assert!(set.contains(EventCode::Alloc as u8));
    assert!(!set.contains(EventCode::Meter as u8));
  }

  #[test]
  fn bad_specs_name_the_offending_token() {
    let err = CodeSet::parse("+Alloc-Nonsense").expect_err("bad name");
    assert_eq!(err.offending, "Nonsense");

    assert!(CodeSet::parse("Alloc").is_err());
  }

  #[test]
  fn totals_and_buckets_accumulate() {
    let set = CodeSet::parse("+Alloc").expect("parse");
    let mut counter = EventCounter::new(set, Some(100));

    counter.record(EventCode::Alloc as u8, 10);
    counter.record(EventCode::Alloc as u8, 110);
    counter.record(EventCode::Alloc as u8, 120);
    counter.record(EventCode::Free as u8, 10); // not selected

    assert_eq!(counter.total(EventCode::Alloc), 3);
    assert_eq!(counter.total(EventCode::Free), 0);

    let mut out = Vec::new();
    counter.render(&mut out).expect("render");
    let text = String::from_utf8(out).expect("utf8");
    assert!(text.contains("Alloc"));
    assert!(text.contains("[0..100)"));
    assert!(text.contains("[100..200) Alloc=2"));
  }
}
