use std::{
  collections::BTreeSet,
  fmt::{self, Display, Formatter},
  io::{self, Write},
};

use serde::Serialize;

use crate::selector::{Clause, DumpSpec, EntityMatch};
use crate::tracker::{
  ArenaSnapshot, ClassSnapshot, PoolSnapshot, ScopeStats, Snapshot,
};
use crate::wire::Address;

/// Errors raised while rendering or exporting a report.
#[derive(Debug)]
pub enum ExportError {
  Io(io::Error),
  Json(serde_json::Error),
}

impl Display for ExportError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::Io(err) => write!(f, "i/o error during export: {err}"),
      Self::Json(err) => write!(f, "failed to encode snapshot as json: {err}"),
    }
  }
}

impl std::error::Error for ExportError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Io(err) => Some(err),
      Self::Json(err) => Some(err),
    }
  }
}

impl From<io::Error> for ExportError {
  fn from(value: io::Error) -> Self {
    Self::Io(value)
  }
}

impl From<serde_json::Error> for ExportError {
  fn from(value: serde_json::Error) -> Self {
    Self::Json(value)
  }
}

/// Output style for rendered reports.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum Style {
  /// Human-readable aligned columns.
  #[default]
  Columns,
  Csv,
  /// One `Kind[key=value, ...]` line per row.
  Java,
  /// One `(kind :key value ...)` form per row.
  Lisp,
}

/// Which level of the accounting tree a report row describes.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RowKind {
  Global,
  Arena,
  Pool,
  Class,
}

impl RowKind {
  #[must_use]
  fn label(self) -> &'static str {
    match self {
      Self::Global => "total",
      Self::Arena => "arena",
      Self::Pool => "pool",
      Self::Class => "class",
    }
  }
}

/// One rendered line of a report.
#[derive(Debug, Clone)]
pub struct Row {
  pub address: Option<Address>,
  pub depth: usize,
  pub kind: RowKind,
  pub name: Option<String>,
  pub stats: ScopeStats,
}

/// A stably-ordered, deduplicated selection over one snapshot.
#[derive(Debug, Clone, Default)]
pub struct Report {
  pub labels: Vec<String>,
  pub rows: Vec<Row>,
}

/// Evaluate a dump spec against a snapshot.
///
/// Selected nodes are collected into one ordered set (arena, then pool,
/// then class name) with duplicates suppressed, then laid out depth-first
/// with indentation reflecting the nesting.
#[must_use]
pub fn evaluate(spec: &DumpSpec, snapshot: &Snapshot) -> Report {
  let mut labels = Vec::new();
  let mut keys: BTreeSet<RowKey> = BTreeSet::new();

  for clause in &spec.clauses {
    if let Some(label) = &clause.label {
      if !label.is_empty() && !labels.contains(label) {
        labels.push(label.clone());
      }
    }

    select_clause(clause, snapshot, &mut keys);
  }

  let rows = keys
    .into_iter()
    .filter_map(|key| materialize(&key, snapshot))
    .collect();

  Report { labels, rows }
}

/// Render a report in the chosen style.
///
/// # Errors
///
/// Propagates writer failures.
pub fn render<W: Write>(
  report: &Report,
  style: Style,
  mut out: W,
) -> Result<(), ExportError> {
  for label in &report.labels {
    match style {
      Style::Columns | Style::Java | Style::Lisp => {
        writeln!(out, "== {label} ==")?;
      }
      Style::Csv => writeln!(out, "# {label}")?,
    }
  }

  if style == Style::Csv {
    writeln!(
      out,
      "kind,address,name,current_size,peak_size,lifetime_size,\
       current_reserved,current_count,lifetime_count"
    )?;
  }

  for row in &report.rows {
    render_row(row, style, &mut out)?;
  }

  Ok(())
}

/// Write the whole accounting snapshot as one JSON document.
///
/// # Errors
///
/// Returns an error if serialization or the underlying writer fails.
pub fn export_snapshot_json<W: Write>(
  snapshot: &Snapshot,
  writer: W,
) -> Result<(), ExportError> {
  serde_json::to_writer_pretty(writer, &JsonDocument { snapshot })?;
  Ok(())
}

#[derive(Serialize)]
struct JsonDocument<'a> {
  snapshot: &'a Snapshot,
}

type RowKey = (Option<Address>, Option<Address>, Option<String>);

fn ident(row: &Row) -> String {
  match (&row.name, row.address) {
    (Some(name), Some(address)) => format!("{name}@{address:#x}"),
    (Some(name), None) => name.clone(),
    (None, Some(address)) => format!("{address:#x}"),
    (None, None) => row.kind.label().to_string(),
  }
}

fn match_class(matcher: &EntityMatch, class: &ClassSnapshot) -> bool {
  match matcher {
    EntityMatch::All | EntityMatch::Any => true,
    EntityMatch::Address(_) => false,
    EntityMatch::Name(name) => class.name == *name,
  }
}

fn match_entity(
  matcher: &EntityMatch,
  address: Address,
  name: Option<&str>,
) -> bool {
  match matcher {
    EntityMatch::All | EntityMatch::Any => true,
    EntityMatch::Address(wanted) => address == *wanted,
    EntityMatch::Name(wanted) => name == Some(wanted.as_str()),
  }
}

fn materialize(key: &RowKey, snapshot: &Snapshot) -> Option<Row> {
  match key {
    (None, None, None) => Some(Row {
      address: None,
      depth: 0,
      kind: RowKind::Global,
      name: None,
      stats: snapshot.global,
    }),
    (Some(arena_addr), rest_pool, rest_class) => {
      let arena = snapshot
        .arenas
        .iter()
        .find(|arena| arena.address == *arena_addr)?;

      match (rest_pool, rest_class) {
        (None, None) => Some(Row {
          address: Some(arena.address),
          depth: 0,
          kind: RowKind::Arena,
          name: arena.name.clone(),
          stats: arena.stats,
        }),
        (Some(pool_addr), None) => {
          let pool = find_pool(arena, *pool_addr)?;
          Some(Row {
            address: Some(pool.address),
            depth: 1,
            kind: RowKind::Pool,
            name: pool.name.clone(),
            stats: pool.stats,
          })
        }
        (Some(pool_addr), Some(class_name)) => {
          let pool = find_pool(arena, *pool_addr)?;
          let class = pool
            .classes
            .iter()
            .find(|class| class.name == *class_name)?;
          Some(Row {
            address: None,
            depth: 2,
            kind: RowKind::Class,
            name: Some(class.name.clone()),
            stats: class.stats,
          })
        }
        (None, Some(_)) => None,
      }
    }
    _ => None,
  }
}

fn find_pool(arena: &ArenaSnapshot, address: Address) -> Option<&PoolSnapshot> {
  arena.pools.iter().find(|pool| pool.address == address)
}

fn render_row<W: Write>(
  row: &Row,
  style: Style,
  out: &mut W,
) -> io::Result<()> {
  let stats = &row.stats;
  let indent = "  ".repeat(row.depth);

  match style {
    Style::Columns => {
      writeln!(
        out,
        "{indent}{kind:<6} {ident:<28} {cur:>12} {peak:>12} {life:>14} \
         {resv:>12} {count:>8} {lcount:>10}",
        kind = row.kind.label(),
        ident = ident(row),
        cur = stats.current_size,
        peak = stats.peak_size,
        life = stats.lifetime_size,
        resv = stats.current_reserved,
        count = stats.current_count,
        lcount = stats.lifetime_count,
      )
    }
    Style::Csv => {
      writeln!(
        out,
        "{kind},{address},{name},{cur},{peak},{life},{resv},{count},{lcount}",
        kind = row.kind.label(),
        address = row
          .address
          .map(|address| format!("{address:#x}"))
          .unwrap_or_default(),
        name = row.name.clone().unwrap_or_default(),
        cur = stats.current_size,
        peak = stats.peak_size,
        life = stats.lifetime_size,
        resv = stats.current_reserved,
        count = stats.current_count,
        lcount = stats.lifetime_count,
      )
    }
    Style::Java => {
      writeln!(
        out,
        "{indent}{kind}[id={ident}, currentSize={cur}, peakSize={peak}, \
         lifetimeSize={life}, reserved={resv}, count={count}]",
        kind = title_case(row.kind.label()),
        ident = ident(row),
        cur = stats.current_size,
        peak = stats.peak_size,
        life = stats.lifetime_size,
        resv = stats.current_reserved,
        count = stats.current_count,
      )
    }
    Style::Lisp => {
      writeln!(
        out,
        "{indent}({kind} {ident:?} :current-size {cur} :peak-size {peak} \
         :lifetime-size {life} :reserved {resv} :count {count})",
        kind = row.kind.label(),
        ident = ident(row),
        cur = stats.current_size,
        peak = stats.peak_size,
        life = stats.lifetime_size,
        resv = stats.current_reserved,
        count = stats.current_count,
      )
    }
  }
}

fn select_clause(
  clause: &Clause,
  snapshot: &Snapshot,
  keys: &mut BTreeSet<RowKey>,
) {
  if clause.is_total() {
    keys.insert((None, None, None));
    return;
  }

  // Omitting a level while matching a deeper one walks the omitted level
  // silently, exactly like `+`.
  let arena_matcher = clause.arena.clone().unwrap_or(EntityMatch::Any);
  let pool_matcher = clause.pool.clone().or_else(|| {
    clause.class.as_ref().map(|_| EntityMatch::Any)
  });

  for arena in &snapshot.arenas {
    if !match_entity(&arena_matcher, arena.address, arena.name.as_deref()) {
      continue;
    }

    if clause.arena.is_some() && arena_matcher.wants_line() {
      keys.insert((Some(arena.address), None, None));
    }

    let Some(pool_matcher) = &pool_matcher else {
      continue;
    };

    for pool in &arena.pools {
      if !match_entity(pool_matcher, pool.address, pool.name.as_deref()) {
        continue;
      }

      if clause.pool.is_some() && pool_matcher.wants_line() {
        keys.insert((Some(arena.address), Some(pool.address), None));
      }

      let Some(class_matcher) = &clause.class else {
        continue;
      };

      for class in &pool.classes {
        if match_class(class_matcher, class) && class_matcher.wants_line() {
          keys.insert((
            Some(arena.address),
            Some(pool.address),
            Some(class.name.clone()),
          ));
        }
      }
    }
  }
}

fn title_case(word: &str) -> String {
  let mut chars = word.chars();
  match chars.next() {
    Some(first) => first.to_uppercase().chain(chars).collect(),
    None => String::new(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::selector;
  use crate::tracker::{ArenaSnapshot, ClassSnapshot, PoolSnapshot};

  fn stats(current: u64) -> ScopeStats {
    ScopeStats {
      current_count: 1,
      current_size: current,
      lifetime_count: 1,
      lifetime_size: current,
      peak_count: 1,
      peak_size: current,
      ..ScopeStats::default()
    }
  }

  fn sample_snapshot() -> Snapshot {
    let class_x = ClassSnapshot {
      name: "X".into(),
      stats: stats(64),
    };
    let class_y = ClassSnapshot {
      name: "Y".into(),
      stats: stats(32),
    };

    Snapshot {
      arenas: vec![
        ArenaSnapshot {
          address: 0xa000,
          classes: vec![class_x.clone(), class_y.clone()],
          name: Some("main".into()),
          pools: vec![
            PoolSnapshot {
              address: 0xb000,
              classes: vec![class_x.clone()],
              name: Some("nursery".into()),
              stats: stats(64),
            },
            PoolSnapshot {
              address: 0xc000,
              classes: vec![class_y.clone()],
              name: None,
              stats: stats(32),
            },
          ],
          stats: stats(96),
        },
        ArenaSnapshot {
          address: 0xd000,
          classes: vec![],
          name: None,
          pools: vec![],
          stats: stats(0),
        },
      ],
      classes: vec![class_x, class_y],
      global: stats(96),
      inconsistencies: 0,
    }
  }

  fn kinds(report: &Report) -> Vec<RowKind> {
    report.rows.iter().map(|row| row.kind).collect()
  }

  #[test]
  fn total_selects_the_global_line_only() {
    let spec = selector::parse("total").expect("parse");
    let report = evaluate(&spec, &sample_snapshot());

    assert_eq!(kinds(&report), vec![RowKind::Global]);
    assert_eq!(report.rows[0].stats.current_size, 96);
  }

  #[test]
  fn star_emits_lines_and_plus_descends_silently() {
    let snapshot = sample_snapshot();

    let starred = evaluate(
      &selector::parse("arena=*&pool=*").expect("parse"),
      &snapshot,
    );
    assert_eq!(
      kinds(&starred),
      vec![
        RowKind::Arena,
        RowKind::Pool,
        RowKind::Pool,
        RowKind::Arena,
      ]
    );

    let silent = evaluate(
      &selector::parse("arena=+&pool=*").expect("parse"),
      &snapshot,
    );
    assert_eq!(kinds(&silent), vec![RowKind::Pool, RowKind::Pool]);
  }

  #[test]
  fn duplicate_selections_collapse() {
    let spec = selector::parse("arena=0xa000,arena=main").expect("parse");
    let report = evaluate(&spec, &sample_snapshot());

    assert_eq!(report.rows.len(), 1);
    assert_eq!(report.rows[0].address, Some(0xa000));
  }

  #[test]
  fn omitted_arena_walks_every_arena() {
    let spec = selector::parse("pool=nursery").expect("parse");
    let report = evaluate(&spec, &sample_snapshot());

    assert_eq!(kinds(&report), vec![RowKind::Pool]);
    assert_eq!(report.rows[0].name.as_deref(), Some("nursery"));
  }

  #[test]
  fn class_rows_nest_under_their_pool() {
    let spec = selector::parse("arena=*&pool=*&class=*").expect("parse");
    let report = evaluate(&spec, &sample_snapshot());

    assert_eq!(
      kinds(&report),
      vec![
        RowKind::Arena,
        RowKind::Pool,
        RowKind::Class,
        RowKind::Pool,
        RowKind::Class,
        RowKind::Arena,
      ]
    );
    assert_eq!(report.rows[2].depth, 2);
  }

  #[test]
  fn evaluation_is_deterministic() {
    let snapshot = sample_snapshot();
    let spec = selector::parse("class=*,pool=*,arena=*").expect("parse");

    let mut rendered = Vec::new();
    for _ in 0..3 {
      let report = evaluate(&spec, &snapshot);
      let mut out = Vec::new();
      render(&report, Style::Csv, &mut out).expect("render");
      rendered.push(out);
    }

    assert_eq!(rendered[0], rendered[1]);
    assert_eq!(rendered[1], rendered[2]);
  }

  #[test]
  fn csv_style_has_a_header_and_one_line_per_row() {
    let spec = selector::parse("arena=0xa000").expect("parse");
    let report = evaluate(&spec, &sample_snapshot());

    let mut out = Vec::new();
    render(&report, Style::Csv, &mut out).expect("render");
    let text = String::from_utf8(out).expect("utf8");

    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("kind,address"));
    assert!(lines[1].starts_with("arena,0xa000,main,96"));
  }

  #[test]
  fn labels_render_as_section_headers() {
    let spec = selector::parse("live now:total").expect("parse");
    let report = evaluate(&spec, &sample_snapshot());

    let mut out = Vec::new();
    render(&report, Style::Columns, &mut out).expect("render");
    let text = String::from_utf8(out).expect("utf8");

    assert!(text.starts_with("== live now =="));
  }

  #[test]
  fn snapshot_exports_as_json() {
    let mut out = Vec::new();
    export_snapshot_json(&sample_snapshot(), &mut out).expect("export");

    let value: serde_json::Value =
      serde_json::from_slice(&out).expect("valid json");
    assert_eq!(
      value["snapshot"]["arenas"][0]["pools"][0]["name"],
      serde_json::Value::String("nursery".into())
    );
  }
}
