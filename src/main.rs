use std::{
  error::Error,
  fs::File,
  io::{self, BufReader, BufWriter, Read, Write},
  path::PathBuf,
  process::ExitCode,
};

use clap::Parser;

use pooltrace::{
  AnalyzeConfig, Applied, CodeSet, EventCounter, LogReader, PoolRecord,
  ReadMode, RetiredArena, ScopeStats, SizeRange, Style, TrackFlags, Tracker,
  parse_selector, report, size_selected,
};

#[derive(Parser)]
#[command(
  name = "pooltrace",
  about = "Offline analyzer for memory-pool telemetry logs",
  version
)]
struct Cli {
  /// Log file to analyze; `-` reads standard input.
  #[arg(short = 'f', value_name = "PATH", default_value = "-")]
  file: String,

  /// Tolerate a truncated trailing record (partial log).
  #[arg(short = 'p')]
  partial: bool,

  /// Echo every decoded record.
  #[arg(short = 'v')]
  verbose: bool,

  /// Count events per code: `all` or a +/- joined list of code names.
  #[arg(short = 'e', value_name = "SPEC")]
  events: Option<String>,

  /// Bucket size in clock units for periodic per-code counts.
  #[arg(short = 'b', value_name = "N")]
  bucket: Option<u64>,

  /// Output style: C (CSV), J (Java-ish) or L (Lisp-ish); human-readable
  /// columns when omitted.
  #[arg(
    short = 'S',
    value_name = "STYLE",
    num_args = 0..=1,
    default_missing_value = ""
  )]
  style: Option<String>,

  /// Enable live allocation tracking; flags choose what to print
  /// (aApPcEt).
  #[arg(
    short = 't',
    value_name = "FLAGS",
    num_args = 0..=1,
    default_missing_value = "E"
  )]
  track: Option<String>,

  /// Restrict line-by-line tracking output to size ranges, comma
  /// separated `low-high` with either bound omittable.
  #[arg(short = 'r', value_name = "RANGES")]
  ranges: Option<String>,

  /// Write the final accounting snapshot as JSON.
  #[arg(long = "json", value_name = "PATH")]
  json: Option<PathBuf>,
}

fn main() -> ExitCode {
  env_logger::init();

  let cli = Cli::parse();

  match run(&cli) {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      eprintln!("pooltrace: {err}");
      ExitCode::FAILURE
    }
  }
}

fn build_config(cli: &Cli) -> Result<AnalyzeConfig, Box<dyn Error>> {
  let mut config = AnalyzeConfig::new()
    .tolerant(cli.partial)
    .verbose(cli.verbose);

  config.bucket_size = cli.bucket;
  config.json_path = cli.json.clone();

  if let Some(spec) = &cli.events {
    config.count_set = Some(CodeSet::parse(spec)?);
  }

  if let Some(letters) = &cli.track {
    config.track = TrackFlags::parse(letters)?;
  }

  if let Some(ranges) = &cli.ranges {
    config.ranges = SizeRange::parse_list(ranges)?;
  }

  if let Some(style) = &cli.style {
    config.style = parse_style(style)?;
  }

  Ok(config)
}

fn parse_style(value: &str) -> Result<Style, Box<dyn Error>> {
  match value {
    "" => Ok(Style::Columns),
    "C" => Ok(Style::Csv),
    "J" => Ok(Style::Java),
    "L" => Ok(Style::Lisp),
    other => Err(format!("unknown style {other:?}; expected C, J or L").into()),
  }
}

fn open_input(path: &str) -> io::Result<Box<dyn Read>> {
  if path == "-" {
    Ok(Box::new(io::stdin()))
  } else {
    Ok(Box::new(File::open(path)?))
  }
}

fn run(cli: &Cli) -> Result<(), Box<dyn Error>> {
  let config = build_config(cli)?;

  let mode = if config.tolerant {
    ReadMode::Tolerant
  } else {
    ReadMode::Strict
  };

  let mut reader =
    LogReader::new(BufReader::new(open_input(&cli.file)?), mode);
  let mut tracker = Tracker::new();
  let mut counter = config
    .count_set
    .map(|set| EventCounter::new(set, config.bucket_size));

  let stdout = io::stdout();
  let mut out = BufWriter::new(stdout.lock());

  let mut clock_origin = None;

  loop {
    let Some(record) = reader.read_record()? else {
      break;
    };

    clock_origin.get_or_insert(record.clock);

    if config.verbose {
      writeln!(out, "{:>14} {:?}", record.clock, record.event)?;
    }

    if let Some(counter) = counter.as_mut() {
      counter.record(record.event.raw_code(), record.clock);
    }

    // The tracker always runs so that in-log dump directives see the
    // state they were emitted against; -t only selects what is printed.
    let applied = tracker.apply(&record, reader.strings());

    let prefix = line_prefix(&config.track, clock_origin, record.clock);

    match applied {
      Applied::Directive(selector) => {
        match parse_selector(&selector) {
          Ok(spec) => {
            let report = report::evaluate(&spec, &tracker.snapshot());
            report::render(&report, config.style, &mut out)?;
          }
          Err(err) => eprintln!("pooltrace: {err}"),
        }
      }
      Applied::Allocated {
        address,
        class,
        pool,
        size,
        ..
      } if config.track.pool_lines => {
        if size_selected(&config.ranges, size) {
          writeln!(
            out,
            "{prefix}alloc  pool={pool:#x} {address:#x}+{size} class={class}"
          )?;
        }
      }
      Applied::Freed {
        address,
        freed,
        pool,
        unmatched,
        ..
      } if config.track.pool_lines => {
        if size_selected(&config.ranges, freed.max(unmatched)) {
          write!(out, "{prefix}free   pool={pool:#x} {address:#x}+{freed}")?;
          if unmatched > 0 {
            write!(out, " (unmatched {unmatched})")?;
          }
          writeln!(out)?;
        }
      }
      Applied::Reserved { arena, pool, size }
        if config.track.arena_lines =>
      {
        writeln!(
          out,
          "{prefix}reserve arena={arena:#x} pool={pool:#x} size={size}"
        )?;
      }
      Applied::Released { arena, pool, size }
        if config.track.arena_lines =>
      {
        writeln!(
          out,
          "{prefix}release arena={arena:#x} pool={pool:#x} size={size}"
        )?;
      }
      Applied::Committed { arena, committed }
        if config.track.commit_lines =>
      {
        writeln!(out, "{prefix}commit arena={arena:#x} committed={committed}")?;
      }
      Applied::PoolFinished(pool) if config.track.pool_summaries => {
        print_pool_summary(&mut out, &prefix, &pool)?;
      }
      Applied::ArenaDestroyed(retired)
        if config.track.arena_summaries =>
      {
        print_arena_summary(&mut out, &prefix, &retired, &config.track)?;
      }
      _ => {}
    }
  }

  if reader.truncated() {
    eprintln!("pooltrace: log truncated inside a record; partial log accepted");
  }

  if config.track.end_summary {
    // Everything still live: the global line plus the full tree.
    let spec = parse_selector("total,all")?;
    let report = report::evaluate(&spec, &tracker.snapshot());
    report::render(&report, config.style, &mut out)?;
  }

  if let Some(counter) = &counter {
    counter.render(&mut out)?;
  }

  if reader.unknown_codes() > 0 {
    writeln!(out, "unknown event codes skipped: {}", reader.unknown_codes())?;
  }

  if tracker.inconsistencies() > 0 {
    writeln!(
      out,
      "accounting inconsistencies: {}",
      tracker.inconsistencies()
    )?;
  }

  if let Some(path) = &config.json_path {
    let file = File::create(path)?;
    report::export_snapshot_json(&tracker.snapshot(), BufWriter::new(file))?;
  }

  out.flush()?;
  Ok(())
}

fn line_prefix(
  track: &TrackFlags,
  clock_origin: Option<u64>,
  clock: u64,
) -> String {
  if !track.timestamps {
    return String::new();
  }

  let elapsed = clock.saturating_sub(clock_origin.unwrap_or(clock));
  format!("{:>12.6} ", elapsed as f64 / 1e9)
}

fn print_arena_summary<W: Write>(
  out: &mut W,
  prefix: &str,
  retired: &RetiredArena,
  track: &TrackFlags,
) -> io::Result<()> {
  let arena = &retired.arena;
  let name = arena
    .name
    .as_deref()
    .map(|name| format!(" ({name})"))
    .unwrap_or_default();

  writeln!(out, "{prefix}arena {:#x}{name} destroyed:", arena.address)?;
  print_stats(out, 1, &arena.stats)?;

  if track.pool_summaries {
    for pool in &retired.pools {
      print_pool_summary(out, prefix, pool)?;
    }
  }

  Ok(())
}

fn print_pool_summary<W: Write>(
  out: &mut W,
  prefix: &str,
  pool: &PoolRecord,
) -> io::Result<()> {
  let name = pool
    .name
    .as_deref()
    .map(|name| format!(" ({name})"))
    .unwrap_or_default();

  writeln!(out, "{prefix}pool {:#x}{name} finished:", pool.address)?;
  print_stats(out, 1, &pool.stats)?;

  let mut classes: Vec<_> = pool.classes.iter().collect();
  classes.sort_by(|a, b| a.0.cmp(b.0));
  for (class, stats) in classes {
    writeln!(
      out,
      "  class {class}: peak={peak} lifetime={life} count={count}",
      peak = stats.peak_size,
      life = stats.lifetime_size,
      count = stats.lifetime_count,
    )?;
  }

  Ok(())
}

fn print_stats<W: Write>(
  out: &mut W,
  depth: usize,
  stats: &ScopeStats,
) -> io::Result<()> {
  writeln!(
    out,
    "{indent}peak={peak} lifetime={life} allocs={count} \
     peak-reserved={resv}",
    indent = "  ".repeat(depth),
    peak = stats.peak_size,
    life = stats.lifetime_size,
    count = stats.lifetime_count,
    resv = stats.peak_reserved,
  )
}
