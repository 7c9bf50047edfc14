use std::fmt::{self, Display, Formatter};

use crate::wire::Address;

/// How one level of the accounting tree is matched by a clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityMatch {
  /// `*` / `all`: every entity at this level, with a report line for each.
  All,
  /// `+` / `any`: every entity at this level, but only its children are
  /// reported; no line for the level itself.
  Any,
  /// A literal address, written `0x..` or in decimal.
  Address(Address),
  /// A display name attached via a Label event.
  Name(String),
}

impl EntityMatch {
  /// Whether this matcher asks for a line at its own level.
  #[must_use]
  pub fn wants_line(&self) -> bool {
    !matches!(self, Self::Any)
  }
}

/// One selector clause: matchers for up to three levels plus an optional
/// output label.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Clause {
  pub arena: Option<EntityMatch>,
  pub class: Option<EntityMatch>,
  pub label: Option<String>,
  pub pool: Option<EntityMatch>,
}

impl Clause {
  /// A clause with no matchers at all requests the global summary line.
  #[must_use]
  pub fn is_total(&self) -> bool {
    self.arena.is_none() && self.pool.is_none() && self.class.is_none()
  }
}

/// A parsed dump spec: one or more clauses evaluated against the same
/// tracker snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpSpec {
  pub clauses: Vec<Clause>,
}

/// A malformed selection expression, reported with the offending
/// substring so the rest of the log can still be processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseSelectorError {
  pub offending: String,
  pub reason: String,
}

impl Display for ParseSelectorError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "bad selector near {:?}: {}",
      self.offending, self.reason
    )
  }
}

impl std::error::Error for ParseSelectorError {}

/// Parse a dump spec: clauses separated by `,` or `|`, each optionally
/// prefixed `label:`, each `total`, `all`, or `&`-joined
/// `arena=`/`pool=`/`class=` terms.
///
/// # Errors
///
/// Returns a `ParseSelectorError` naming the offending substring.
pub fn parse(text: &str) -> Result<DumpSpec, ParseSelectorError> {
  let mut clauses = Vec::new();

  for raw in text.split([',', '|']) {
    let raw = raw.trim();
    if raw.is_empty() {
      return Err(error(raw, "empty clause"));
    }
    clauses.push(parse_clause(raw)?);
  }

  if clauses.is_empty() {
    return Err(error(text, "empty selector"));
  }

  Ok(DumpSpec { clauses })
}

fn error(offending: &str, reason: &str) -> ParseSelectorError {
  ParseSelectorError {
    offending: offending.to_string(),
    reason: reason.to_string(),
  }
}

fn parse_clause(raw: &str) -> Result<Clause, ParseSelectorError> {
  let mut clause = Clause::default();
  let mut body = raw;

  // An output label is any prefix before ':' that is not itself a term.
  if let Some((label, rest)) = raw.split_once(':') {
    if label.contains(['=', '&', ':']) {
      return Err(error(raw, "malformed output label"));
    }
    clause.label = Some(label.trim().to_string());
    body = rest.trim();
  }

  match body {
    "total" => return Ok(clause),
    "all" => {
      clause.arena = Some(EntityMatch::All);
      clause.pool = Some(EntityMatch::All);
      clause.class = Some(EntityMatch::All);
      return Ok(clause);
    }
    _ => {}
  }

  for term in body.split('&') {
    let term = term.trim();
    let Some((key, value)) = term.split_once('=') else {
      return Err(error(term, "expected key=value, `total` or `all`"));
    };

    let matcher = parse_match(value.trim())?;

    match key.trim() {
      "arena" => set_once(&mut clause.arena, matcher, term)?,
      "pool" => set_once(&mut clause.pool, matcher, term)?,
      "class" => {
        if matches!(matcher, EntityMatch::Address(_)) {
          return Err(error(term, "classes are matched by name, not address"));
        }
        set_once(&mut clause.class, matcher, term)?;
      }
      _ => return Err(error(term, "unknown level; use arena, pool or class")),
    }
  }

  Ok(clause)
}

fn parse_match(value: &str) -> Result<EntityMatch, ParseSelectorError> {
  match value {
    "" => Err(error(value, "empty matcher")),
    "*" | "all" => Ok(EntityMatch::All),
    "+" | "any" => Ok(EntityMatch::Any),
    _ => {
      if let Some(hex) = value.strip_prefix("0x") {
        return u64::from_str_radix(hex, 16)
          .map(EntityMatch::Address)
          .map_err(|_| error(value, "malformed hexadecimal address"));
      }

      if value.bytes().all(|b| b.is_ascii_digit()) {
        return value
          .parse()
          .map(EntityMatch::Address)
          .map_err(|_| error(value, "malformed decimal address"));
      }

      Ok(EntityMatch::Name(value.to_string()))
    }
  }
}

fn set_once(
  slot: &mut Option<EntityMatch>,
  matcher: EntityMatch,
  term: &str,
) -> Result<(), ParseSelectorError> {
  if slot.is_some() {
    return Err(error(term, "level matched twice in one clause"));
  }

  *slot = Some(matcher);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_a_full_three_level_clause() {
    let spec = parse("arena=0xa000&pool=nursery&class=*").expect("parse");

    assert_eq!(spec.clauses.len(), 1);
    let clause = &spec.clauses[0];
    assert_eq!(clause.arena, Some(EntityMatch::Address(0xa000)));
    assert_eq!(clause.pool, Some(EntityMatch::Name("nursery".into())));
    assert_eq!(clause.class, Some(EntityMatch::All));
  }

  #[test]
  fn parses_shorthands_and_labels() {
    let spec = parse("totals here:total,all").expect("parse");

    assert_eq!(spec.clauses.len(), 2);
    assert!(spec.clauses[0].is_total());
    assert_eq!(spec.clauses[0].label.as_deref(), Some("totals here"));
    assert_eq!(spec.clauses[1].arena, Some(EntityMatch::All));
    assert_eq!(spec.clauses[1].class, Some(EntityMatch::All));
  }

  #[test]
  fn pipe_and_comma_both_separate_clauses() {
    let spec = parse("arena=*|pool=*,class=*").expect("parse");
    assert_eq!(spec.clauses.len(), 3);
  }

  #[test]
  fn plus_means_descend_without_a_line() {
    let spec = parse("arena=+&pool=*").expect("parse");
    let clause = &spec.clauses[0];

    assert_eq!(clause.arena, Some(EntityMatch::Any));
    assert!(!clause.arena.as_ref().expect("arena").wants_line());
    assert!(clause.pool.as_ref().expect("pool").wants_line());
  }

  #[test]
  fn keyword_spellings_match_wildcards() {
    let spec = parse("arena=all&pool=any").expect("parse");
    let clause = &spec.clauses[0];
    assert_eq!(clause.arena, Some(EntityMatch::All));
    assert_eq!(clause.pool, Some(EntityMatch::Any));
  }

  #[test]
  fn errors_carry_the_offending_substring() {
    let err = parse("arena=*&flavor=mint").expect_err("bad level");
    assert!(err.offending.contains("flavor=mint"));

    let err = parse("arena=0xzz").expect_err("bad address");
    assert!(err.offending.contains("0xzz"));

    let err = parse("arena=*&arena=*").expect_err("duplicate");
    assert!(err.reason.contains("twice"));

    let err = parse("class=0x10").expect_err("class by address");
    assert!(err.reason.contains("name"));

    assert!(parse("").is_err());
    assert!(parse("arena=").is_err());
  }
}
