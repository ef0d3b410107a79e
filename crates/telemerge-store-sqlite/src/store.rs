//! [`SqliteStore`]: the SQLite implementation of [`TelemetryStore`].

use std::{path::Path, sync::Arc};

use chrono::NaiveDate;
use rusqlite::{OptionalExtension as _, Transaction};

use telemerge_core::{
  asn::{AsnClass, AsnRank},
  dates::Month,
  measurement::{DataSource, RawMeasurement, ServerId, StagingRecord, UnifiedTelemetryRecord},
  reconcile::{MergeReport, Reconciler},
  reference::{AirportMapping, BestServerEntry, GazetteerCity, MAX_ALIASES, ReferenceRows},
  store::{MergeOutcome, TelemetryStore},
};

use crate::{
  Error, Result,
  encode::{
    RawBestServer, RawGazetteer, RawStaging, RawUnified, STAGING_COLUMNS, UNIFIED_COLUMNS,
    decode_date, encode_date, encode_dt, encode_server, encode_u64, rank_from_row,
  },
  registry::{PRAGMAS, TABLES, TableId},
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A telemerge store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and create any missing tables.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Create every registered table. Idempotent.
  pub async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(PRAGMAS)?;
        let tx = conn.transaction()?;
        for table in &TABLES {
          tx.execute_batch(table.ddl)?;
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Drop every registered table, in reverse registration order.
  pub async fn drop_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        let tx = conn.transaction()?;
        for table in TABLES.iter().rev() {
          tx.execute_batch(&format!("DROP TABLE IF EXISTS {};", table.id.name()))?;
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Every ledger entry, oldest first.
  pub async fn processed_dates(&self) -> Result<Vec<NaiveDate>> {
    let raw: Vec<String> = self
      .conn
      .call(|conn| {
        let mut stmt =
          conn.prepare("SELECT processed_date FROM processed_dates ORDER BY processed_date")?;
        let rows = stmt
          .query_map([], |r| r.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
      })
      .await?;
    raw.iter().map(|s| decode_date(s)).collect()
  }

  /// Number of rows parked in staging for `source` on `date`.
  pub async fn staged_count(&self, source: DataSource, date: NaiveDate) -> Result<usize> {
    let date = encode_date(date);
    let count: i64 = self
      .conn
      .call(move |conn| {
        let n = conn.query_row(
          "SELECT COUNT(*) FROM staging WHERE source = ?1 AND run_date = ?2",
          rusqlite::params![source.as_str(), date],
          |r| r.get(0),
        )?;
        Ok(n)
      })
      .await?;
    Ok(usize::try_from(count).unwrap_or(0))
  }

  /// The whole unified store, ordered by uuid.
  pub async fn unified_records(&self) -> Result<Vec<UnifiedTelemetryRecord>> {
    let raw: Vec<RawUnified> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {UNIFIED_COLUMNS} FROM unified_telemetry ORDER BY uuid"
        ))?;
        let rows = stmt
          .query_map([], RawUnified::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raw.into_iter().map(RawUnified::into_record).collect()
  }

  #[cfg(test)]
  pub(crate) async fn execute_batch(&self, sql: &'static str) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        conn.execute_batch(sql)?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

// ─── Transaction helpers ─────────────────────────────────────────────────────

fn read_staging(tx: &Transaction<'_>, source: DataSource, date: &str) -> Result<Vec<StagingRecord>> {
  let mut stmt = tx.prepare(&format!(
    "SELECT {STAGING_COLUMNS} FROM staging
     WHERE source = ?1 AND run_date = ?2
     ORDER BY uuid"
  ))?;
  let raw = stmt
    .query_map(rusqlite::params![source.as_str(), date], RawStaging::from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  raw.into_iter().map(RawStaging::into_record).collect()
}

fn insert_unified(tx: &Transaction<'_>, r: &UnifiedTelemetryRecord) -> Result<usize> {
  let m = &r.metrics;
  let inserted = tx.execute(
    &format!(
      "INSERT OR IGNORE INTO unified_telemetry ({UNIFIED_COLUMNS})
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
    ),
    rusqlite::params![
      r.uuid,
      encode_dt(r.test_time),
      r.client_city,
      r.client_region,
      r.client_country,
      r.server_city,
      r.server_country,
      r.asn,
      r.data_source.as_str(),
      m.packet_loss_rate,
      m.download_throughput_mbps,
      m.download_latency_ms,
      m.download_jitter_ms,
      m.upload_throughput_mbps,
      m.upload_latency_ms,
      m.upload_jitter_ms,
    ],
  )?;
  Ok(inserted)
}

fn clear_staging(tx: &Transaction<'_>, source: DataSource, date: &str) -> Result<()> {
  tx.execute(
    "DELETE FROM staging WHERE source = ?1 AND run_date = ?2",
    rusqlite::params![source.as_str(), date],
  )?;
  Ok(())
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
  matches!(
    err,
    rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
  )
}

/// Ledger claim, reconciliation, insert and staging cleanup for one date.
/// Nothing is committed unless every step succeeds.
fn merge_in_tx(
  conn: &mut rusqlite::Connection,
  date: NaiveDate,
  sources: &[DataSource],
  reconciler: &Reconciler,
) -> Result<MergeOutcome> {
  let tx = conn.transaction()?;
  let date_str = encode_date(date);

  match tx.execute(
    "INSERT INTO processed_dates (processed_date) VALUES (?1)",
    rusqlite::params![date_str],
  ) {
    Ok(_) => {}
    Err(e) if is_constraint_violation(&e) => {
      // The date is merged already; what this run staged is never read.
      for &source in sources {
        clear_staging(&tx, source, &date_str)?;
      }
      tx.commit()?;
      return Ok(MergeOutcome::AlreadyClaimed);
    }
    Err(e) => return Err(e.into()),
  }

  let mut reports = Vec::with_capacity(sources.len());
  for &source in sources {
    let staged = read_staging(&tx, source, &date_str)?;
    let reconciled = reconciler.reconcile(source, staged);
    let mut report = reconciled.report;
    for record in &reconciled.records {
      report.merged += insert_unified(&tx, record)?;
    }
    clear_staging(&tx, source, &date_str)?;
    reports.push(report);
  }

  tx.commit()?;
  Ok(MergeOutcome::Merged(MergeReport { date, sources: reports }))
}

fn stage_in_tx(
  conn: &mut rusqlite::Connection,
  source: DataSource,
  date: NaiveDate,
  rows: &[RawMeasurement],
) -> Result<usize> {
  let tx = conn.transaction()?;
  let date_str = encode_date(date);
  clear_staging(&tx, source, &date_str)?;

  {
    let mut stmt = tx.prepare(&format!(
      "INSERT OR REPLACE INTO staging ({STAGING_COLUMNS})
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
    ))?;
    for row in rows {
      let (server_city, server_country, server_code) = encode_server(&row.server);
      let m = &row.metrics;
      stmt.execute(rusqlite::params![
        source.as_str(),
        date_str,
        row.uuid,
        encode_dt(row.test_time),
        row.client_city,
        row.client_region,
        row.client_country,
        server_city,
        server_country,
        server_code,
        row.asn,
        m.packet_loss_rate,
        m.download_throughput_mbps,
        m.download_latency_ms,
        m.download_jitter_ms,
        m.upload_throughput_mbps,
        m.upload_latency_ms,
        m.upload_jitter_ms,
      ])?;
    }
  }
  // A uuid fetched twice occupies one row.
  let staged: i64 = tx.query_row(
    "SELECT COUNT(*) FROM staging WHERE source = ?1 AND run_date = ?2",
    rusqlite::params![source.as_str(), date_str],
    |r| r.get(0),
  )?;
  tx.commit()?;
  Ok(usize::try_from(staged).unwrap_or(0))
}

fn best_server_select(source: DataSource, table: &str) -> String {
  if source.identifies_servers_by_code() {
    format!(
      "SELECT client_city, client_country, NULL, NULL, server_code FROM {table}
       WHERE year = ?1 AND month = ?2"
    )
  } else {
    format!(
      "SELECT client_city, client_country, server_city, server_country, NULL FROM {table}
       WHERE year = ?1 AND month = ?2"
    )
  }
}

fn replace_best_servers_in_tx(
  conn: &mut rusqlite::Connection,
  source: DataSource,
  class: AsnClass,
  period: Month,
  entries: &[BestServerEntry],
) -> Result<usize> {
  let table = TableId::BestServers(source, class).name();
  let tx = conn.transaction()?;
  tx.execute(
    &format!("DELETE FROM {table} WHERE year = ?1 AND month = ?2"),
    rusqlite::params![period.year, period.month],
  )?;

  let mut written = 0;
  for e in entries {
    written += match (&e.server, source.identifies_servers_by_code()) {
      (ServerId::Pop { code }, true) => tx.execute(
        &format!(
          "INSERT INTO {table} (client_city, client_country, server_code, year, month)
           VALUES (?1, ?2, ?3, ?4, ?5)"
        ),
        rusqlite::params![e.client_city, e.client_country, code, period.year, period.month],
      )?,
      (ServerId::Location { city, country }, false) => tx.execute(
        &format!(
          "INSERT INTO {table}
             (client_city, client_country, server_city, server_country, year, month)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
        ),
        rusqlite::params![e.client_city, e.client_country, city, country, period.year, period.month],
      )?,
      (server, _) => {
        return Err(Error::ServerKind { data_source: source, server: format!("{server:?}") });
      }
    };
  }
  tx.commit()?;
  Ok(written)
}

fn replace_reference_in_tx(conn: &mut rusqlite::Connection, rows: &ReferenceRows) -> Result<usize> {
  let tx = conn.transaction()?;
  let written = match rows {
    ReferenceRows::Gazetteer(cities) => {
      tx.execute("DELETE FROM gazetteer", [])?;
      let mut stmt = tx.prepare(
        "INSERT INTO gazetteer
           (name, ascii_name, alias1, alias2, alias3, alias4, region, country_code, population)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
      )?;
      let mut n = 0;
      for c in cities {
        let alias = |i: usize| c.aliases.get(i).filter(|_| i < MAX_ALIASES);
        n += stmt.execute(rusqlite::params![
          c.name,
          c.ascii_name,
          alias(0),
          alias(1),
          alias(2),
          alias(3),
          c.region,
          c.country_code,
          encode_u64(c.population),
        ])?;
      }
      n
    }
    ReferenceRows::Airports(mappings) => {
      tx.execute("DELETE FROM airport_mapping", [])?;
      let mut stmt = tx.prepare(
        "INSERT OR REPLACE INTO airport_mapping (code, city, country) VALUES (?1, ?2, ?3)",
      )?;
      let mut n = 0;
      for m in mappings {
        n += stmt.execute(rusqlite::params![m.code, m.city, m.country])?;
      }
      n
    }
    ReferenceRows::AsnRanks(ranks) => {
      tx.execute("DELETE FROM asn_ranks", [])?;
      let mut stmt = tx.prepare(
        "INSERT OR REPLACE INTO asn_ranks (asn, asn_name, rank, country_code, country_name)
         VALUES (?1, ?2, ?3, ?4, ?5)",
      )?;
      let mut n = 0;
      for r in ranks {
        n += stmt.execute(rusqlite::params![
          r.asn,
          r.name,
          r.rank.map(encode_u64),
          r.country_code,
          r.country_name,
        ])?;
      }
      n
    }
    ReferenceRows::StarlinkCountries(countries) => {
      tx.execute("DELETE FROM starlink_countries", [])?;
      let mut stmt =
        tx.prepare("INSERT OR IGNORE INTO starlink_countries (country_code) VALUES (?1)")?;
      let mut n = 0;
      for c in countries {
        n += stmt.execute(rusqlite::params![c])?;
      }
      n
    }
  };
  tx.commit()?;
  Ok(written)
}

// ─── TelemetryStore impl ─────────────────────────────────────────────────────

impl TelemetryStore for SqliteStore {
  type Error = Error;

  async fn is_processed(&self, date: NaiveDate) -> Result<bool> {
    let date = encode_date(date);
    let found = self
      .conn
      .call(move |conn| {
        let found = conn
          .query_row(
            "SELECT 1 FROM processed_dates WHERE processed_date = ?1",
            rusqlite::params![date],
            |_| Ok(true),
          )
          .optional()?
          .unwrap_or(false);
        Ok(found)
      })
      .await?;
    Ok(found)
  }

  async fn stage(
    &self,
    source: DataSource,
    date: NaiveDate,
    rows: Vec<RawMeasurement>,
  ) -> Result<usize> {
    self
      .conn
      .call(move |conn| Ok(stage_in_tx(conn, source, date, &rows)))
      .await?
  }

  async fn best_servers(&self, source: DataSource, period: Month) -> Result<Vec<BestServerEntry>> {
    let raw: Vec<(AsnClass, RawBestServer)> = self
      .conn
      .call(move |conn| {
        let mut out = Vec::new();
        for class in AsnClass::ALL {
          let table = TableId::BestServers(source, class).name();
          let mut stmt = conn.prepare(&best_server_select(source, table))?;
          let rows = stmt.query_map(rusqlite::params![period.year, period.month], |r| {
            Ok(RawBestServer {
              client_city:    r.get(0)?,
              client_country: r.get(1)?,
              server_city:    r.get(2)?,
              server_country: r.get(3)?,
              server_code:    r.get(4)?,
            })
          })?;
          for row in rows {
            out.push((class, row?));
          }
        }
        Ok(out)
      })
      .await?;

    raw
      .into_iter()
      .map(|(class, r)| r.into_entry(period, class))
      .collect()
  }

  async fn replace_best_servers(
    &self,
    source: DataSource,
    class: AsnClass,
    period: Month,
    entries: Vec<BestServerEntry>,
  ) -> Result<usize> {
    self
      .conn
      .call(move |conn| Ok(replace_best_servers_in_tx(conn, source, class, period, &entries)))
      .await?
  }

  async fn gazetteer(&self) -> Result<Vec<GazetteerCity>> {
    let raw: Vec<RawGazetteer> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT name, ascii_name, alias1, alias2, alias3, alias4, region, country_code, population
           FROM gazetteer",
        )?;
        let rows = stmt
          .query_map([], |r| {
            Ok(RawGazetteer {
              name:         r.get(0)?,
              ascii_name:   r.get(1)?,
              aliases:      [r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?],
              region:       r.get(6)?,
              country_code: r.get(7)?,
              population:   r.get(8)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(raw.into_iter().map(RawGazetteer::into_city).collect())
  }

  async fn airport_mappings(&self) -> Result<Vec<AirportMapping>> {
    let rows = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare("SELECT code, city, country FROM airport_mapping")?;
        let rows = stmt
          .query_map([], |r| {
            Ok(AirportMapping { code: r.get(0)?, city: r.get(1)?, country: r.get(2)? })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(rows)
  }

  async fn asn_ranks(&self) -> Result<Vec<AsnRank>> {
    let rows = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT asn, asn_name, rank, country_code, country_name FROM asn_ranks ORDER BY asn",
        )?;
        let rows = stmt
          .query_map([], rank_from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(rows)
  }

  async fn starlink_countries(&self) -> Result<Vec<String>> {
    let rows = self
      .conn
      .call(|conn| {
        let mut stmt =
          conn.prepare("SELECT country_code FROM starlink_countries ORDER BY country_code")?;
        let rows = stmt
          .query_map([], |r| r.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(rows)
  }

  async fn replace_reference(&self, rows: ReferenceRows) -> Result<usize> {
    self
      .conn
      .call(move |conn| Ok(replace_reference_in_tx(conn, &rows)))
      .await?
  }

  async fn merge_date(
    &self,
    date: NaiveDate,
    sources: Vec<DataSource>,
    reconciler: Arc<Reconciler>,
  ) -> Result<MergeOutcome> {
    let outcome = self
      .conn
      .call(move |conn| Ok(merge_in_tx(conn, date, &sources, &reconciler)))
      .await??;
    if outcome == MergeOutcome::AlreadyClaimed {
      tracing::warn!(%date, "date claimed by another run; nothing merged");
    }
    Ok(outcome)
  }
}
