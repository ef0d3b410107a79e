//! `telemerge` - daily telemetry reconciliation.
//!
//! # Usage
//!
//! ```text
//! telemerge init
//! telemerge refresh gazetteer airports asns starlink-countries
//! telemerge best-servers 2024-01:2024-03
//! telemerge starlink-countries 2024-01-01:2024-03-31
//! telemerge date 2024-03-15 --skip-processed
//! telemerge range 2024-03-01:2024-03-31
//! ```
//!
//! Settings come from `telemerge.toml` (or `--config`) and `TELEMERGE_*`
//! environment variables.

mod jsonl;
mod settings;

use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context as _, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use telemerge_core::{
  dates::{parse_date, parse_date_range, parse_month_range},
  pipeline::{DateOutcome, Pipeline, RangeSummary, RunContext},
  reference::{self, REFERENCES, ReferenceKind, SourceFile},
};
use telemerge_store_sqlite::{SqliteStore, TABLES};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::{jsonl::JsonlSource, settings::Settings};

// ─── CLI args ────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "telemerge", version, about = "Daily telemetry reconciliation pipeline")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "telemerge.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Create every table that does not exist yet.
  Init,

  /// Drop every table.
  Drop {
    /// Confirm that all stored data should be removed.
    #[arg(long)]
    yes: bool,
  },

  /// Reload reference tables from the reference directory. With no
  /// arguments every table is refreshed.
  Refresh {
    #[arg(value_parser = parse_kind)]
    tables: Vec<ReferenceKind>,
  },

  /// Rebuild best-server tables for `yyyy-mm[:yyyy-mm]`.
  BestServers { months: String },

  /// Rebuild the starlink country list from starlink measurements in
  /// `start[:end]`. The end defaults to yesterday.
  StarlinkCountries { range: String },

  /// Ingest a single `yyyy-mm-dd`.
  Date {
    date: String,

    /// Fetch starlink measurements only.
    #[arg(long)]
    starlink_only: bool,

    /// Exit successfully if the date was already processed.
    #[arg(long)]
    skip_processed: bool,
  },

  /// Ingest `start[:end]`, newest first. The end defaults to yesterday.
  Range {
    range: String,

    /// Fetch starlink measurements only.
    #[arg(long)]
    starlink_only: bool,
  },
}

fn parse_kind(s: &str) -> Result<ReferenceKind, String> {
  ReferenceKind::parse(s).ok_or_else(|| {
    let names: Vec<_> = REFERENCES.iter().map(|r| r.name).collect();
    format!("unknown table {s:?}; expected one of {}", names.join(", "))
  })
}

// ─── Exit codes ──────────────────────────────────────────────────────────────

const EXIT_OTHER: u8 = 1;
const EXIT_INELIGIBLE: u8 = 2;
const EXIT_ALREADY_PROCESSED: u8 = 3;
const EXIT_UPSTREAM: u8 = 4;
const EXIT_STORE: u8 = 5;

fn core_exit_code(err: &telemerge_core::Error) -> u8 {
  use telemerge_core::Error as E;
  match err {
    E::DateNotEligible { .. } | E::InvalidDateRange { .. } | E::DateFormat(_) | E::MonthFormat(_) => {
      EXIT_INELIGIBLE
    }
    E::AlreadyProcessed(_) => EXIT_ALREADY_PROCESSED,
    E::UpstreamFetch { .. } => EXIT_UPSTREAM,
    E::Store(_) => EXIT_STORE,
    E::Reference { .. } | E::InvalidQuantile(_) => EXIT_OTHER,
  }
}

/// The code of the first (newest) failed date, or success.
fn range_exit_code(summary: &RangeSummary) -> u8 {
  summary.failed.first().map_or(0, |(_, e)| core_exit_code(e))
}

fn exit_code(err: &anyhow::Error) -> u8 {
  if let Some(e) = err.downcast_ref::<telemerge_core::Error>() {
    core_exit_code(e)
  } else if err.downcast_ref::<telemerge_store_sqlite::Error>().is_some() {
    EXIT_STORE
  } else {
    EXIT_OTHER
  }
}

// ─── Entry point ─────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();
  match run(cli).await {
    Ok(code) => ExitCode::from(code),
    Err(err) => {
      tracing::error!("{err:#}");
      ExitCode::from(exit_code(&err))
    }
  }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
  let settings = Settings::load(&cli.config)?;
  let today = Utc::now().date_naive();

  // Date arguments are validated before the store is opened.
  let command = cli.command;
  let dates = match &command {
    Command::Date { date, .. } => Some((parse_date(date, today)?, None)),
    Command::Range { range, .. } | Command::StarlinkCountries { range } => {
      let (start, end) = parse_date_range(range, today)?;
      Some((start, Some(end)))
    }
    _ => None,
  };

  let store = SqliteStore::open(&settings.store_path)
    .await
    .with_context(|| format!("failed to open store at {:?}", settings.store_path))?;

  let mut ctx = RunContext::new(today);
  ctx.builder = settings.builder_params()?;
  ctx.top_asns_per_country = settings.top_asns_per_country;
  let sources = JsonlSource::all(&settings.measurements_dir);

  match (command, dates) {
    (Command::Init, _) => {
      for table in &TABLES {
        println!("{}", table.id.name());
      }
      tracing::info!(tables = TABLES.len(), "schema ready");
      Ok(0)
    }

    (Command::Drop { yes }, _) => {
      if !yes {
        bail!("refusing to drop every table without --yes");
      }
      store.drop_schema().await?;
      tracing::info!(tables = TABLES.len(), "schema dropped");
      Ok(0)
    }

    (Command::Refresh { tables }, _) => {
      refresh(&store, &settings, tables).await?;
      Ok(0)
    }

    (Command::BestServers { months }, _) => {
      let (from, to) = parse_month_range(&months, today)?;
      let written = Pipeline::new(&store, &sources, &ctx)
        .build_best_servers(from, to)
        .await?;
      tracing::info!(%from, %to, entries = written, "best-server tables rebuilt");
      Ok(0)
    }

    (Command::StarlinkCountries { .. }, Some((start, Some(end)))) => {
      let stored = Pipeline::new(&store, &sources, &ctx)
        .refresh_starlink_countries(start, end)
        .await?;
      tracing::info!(%start, %end, countries = stored, "starlink countries rebuilt");
      Ok(0)
    }

    (Command::Date { starlink_only, skip_processed, .. }, Some((date, _))) => {
      ctx.starlink_only = starlink_only;
      ctx.allow_skip = skip_processed;
      match Pipeline::new(&store, &sources, &ctx).ingest_date(date).await? {
        DateOutcome::Merged(report) => println!("{}", serde_json::to_string_pretty(&report)?),
        DateOutcome::Skipped => tracing::info!(%date, "already processed; skipped"),
      }
      Ok(0)
    }

    (Command::Range { starlink_only, .. }, Some((start, Some(end)))) => {
      ctx.starlink_only = starlink_only;
      let summary = Pipeline::new(&store, &sources, &ctx)
        .ingest_range(start, end)
        .await?;
      for report in &summary.merged {
        println!("{}", serde_json::to_string(report)?);
      }
      for (date, error) in &summary.failed {
        eprintln!("{date}: {error}");
      }
      Ok(range_exit_code(&summary))
    }

    (command, _) => bail!("unexpected arguments for {command:?}"),
  }
}

/// Refresh `kinds` (every table when empty) in registry order, so airports
/// are canonicalized against a fresh gazetteer.
async fn refresh(
  store: &SqliteStore,
  settings: &Settings,
  kinds: Vec<ReferenceKind>,
) -> anyhow::Result<()> {
  for spec in REFERENCES.iter().filter(|r| kinds.is_empty() || kinds.contains(&r.kind)) {
    let mut contents = Vec::with_capacity(spec.files.len());
    for name in spec.files {
      let path = settings.reference_dir.join(name);
      match tokio::fs::read_to_string(&path).await {
        Ok(text) => contents.push((*name, text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
          tracing::warn!(table = spec.name, path = %path.display(), "reference file missing; skipped");
          break;
        }
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
      }
    }
    if contents.len() < spec.files.len() {
      continue;
    }

    let files: Vec<SourceFile<'_>> = contents
      .iter()
      .map(|(name, text)| SourceFile { name, contents: text.as_str() })
      .collect();
    reference::refresh(store, spec.kind, &files).await?;
  }
  Ok(())
}
