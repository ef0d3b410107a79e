//! Declarative table registry.
//!
//! Every table the store owns has one [`TableSpec`] in [`TABLES`]. Schema
//! creation walks the list in order and schema removal walks it in reverse;
//! nothing else enumerates tables by hand.

use telemerge_core::{asn::AsnClass, measurement::DataSource};

/// Identity of a stored table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableId {
  ProcessedDates,
  Gazetteer,
  AirportMapping,
  AsnRanks,
  StarlinkCountries,
  Staging,
  /// One best-server table per source and ASN class.
  BestServers(DataSource, AsnClass),
  UnifiedTelemetry,
}

impl TableId {
  pub fn name(self) -> &'static str {
    use AsnClass::{Starlink, Terrestrial};
    use DataSource::{Cloudflare, Ndt7};
    match self {
      Self::ProcessedDates => "processed_dates",
      Self::Gazetteer => "gazetteer",
      Self::AirportMapping => "airport_mapping",
      Self::AsnRanks => "asn_ranks",
      Self::StarlinkCountries => "starlink_countries",
      Self::Staging => "staging",
      Self::BestServers(Ndt7, Terrestrial) => "ndt7_terrestrial_servers",
      Self::BestServers(Ndt7, Starlink) => "ndt7_starlink_servers",
      Self::BestServers(Cloudflare, Terrestrial) => "cloudflare_terrestrial_servers",
      Self::BestServers(Cloudflare, Starlink) => "cloudflare_starlink_servers",
      Self::UnifiedTelemetry => "unified_telemetry",
    }
  }
}

pub struct TableSpec {
  pub id:  TableId,
  /// Idempotent DDL for the table and its indexes.
  pub ddl: &'static str,
}

pub static TABLES: [TableSpec; 11] = [
  TableSpec {
    id:  TableId::ProcessedDates,
    ddl: "CREATE TABLE IF NOT EXISTS processed_dates (
            processed_date TEXT PRIMARY KEY   -- yyyy-mm-dd
          );",
  },
  TableSpec {
    id:  TableId::Gazetteer,
    ddl: "CREATE TABLE IF NOT EXISTS gazetteer (
            name          TEXT NOT NULL,
            ascii_name    TEXT NOT NULL,
            alias1        TEXT,
            alias2        TEXT,
            alias3        TEXT,
            alias4        TEXT,
            region        TEXT NOT NULL,
            country_code  TEXT NOT NULL,
            population    INTEGER NOT NULL DEFAULT 0
          );
          CREATE INDEX IF NOT EXISTS gazetteer_country_idx ON gazetteer(country_code);",
  },
  TableSpec {
    id:  TableId::AirportMapping,
    ddl: "CREATE TABLE IF NOT EXISTS airport_mapping (
            code     TEXT PRIMARY KEY,
            city     TEXT NOT NULL,
            country  TEXT NOT NULL
          );",
  },
  TableSpec {
    id:  TableId::AsnRanks,
    ddl: "CREATE TABLE IF NOT EXISTS asn_ranks (
            asn           INTEGER PRIMARY KEY,
            asn_name      TEXT,
            rank          INTEGER,
            country_code  TEXT,
            country_name  TEXT
          );",
  },
  TableSpec {
    id:  TableId::StarlinkCountries,
    ddl: "CREATE TABLE IF NOT EXISTS starlink_countries (
            country_code TEXT PRIMARY KEY
          );",
  },
  TableSpec {
    id:  TableId::Staging,
    ddl: "CREATE TABLE IF NOT EXISTS staging (
            source                    TEXT NOT NULL,   -- 'ndt7' | 'cloudflare'
            run_date                  TEXT NOT NULL,   -- yyyy-mm-dd
            uuid                      TEXT NOT NULL,
            test_time                 TEXT NOT NULL,   -- RFC 3339 UTC
            client_city               TEXT,
            client_region             TEXT,
            client_country            TEXT NOT NULL,
            server_city               TEXT,            -- city-identified servers
            server_country            TEXT,
            server_code               TEXT,            -- code-identified servers
            asn                       INTEGER NOT NULL,
            packet_loss_rate          REAL,
            download_throughput_mbps  REAL,
            download_latency_ms       INTEGER,
            download_jitter_ms        REAL,
            upload_throughput_mbps    REAL,
            upload_latency_ms         INTEGER,
            upload_jitter_ms          REAL,
            PRIMARY KEY (source, run_date, uuid)
          );",
  },
  TableSpec {
    id:  TableId::BestServers(DataSource::Ndt7, AsnClass::Terrestrial),
    ddl: "CREATE TABLE IF NOT EXISTS ndt7_terrestrial_servers (
            client_city     TEXT,            -- NULL for country-level entries
            client_country  TEXT NOT NULL,
            server_city     TEXT NOT NULL,
            server_country  TEXT NOT NULL,
            month           INTEGER NOT NULL,
            year            INTEGER NOT NULL
          );
          CREATE INDEX IF NOT EXISTS ndt7_terrestrial_period_idx
            ON ndt7_terrestrial_servers(year, month);",
  },
  TableSpec {
    id:  TableId::BestServers(DataSource::Ndt7, AsnClass::Starlink),
    ddl: "CREATE TABLE IF NOT EXISTS ndt7_starlink_servers (
            client_city     TEXT,
            client_country  TEXT NOT NULL,
            server_city     TEXT NOT NULL,
            server_country  TEXT NOT NULL,
            month           INTEGER NOT NULL,
            year            INTEGER NOT NULL
          );
          CREATE INDEX IF NOT EXISTS ndt7_starlink_period_idx
            ON ndt7_starlink_servers(year, month);",
  },
  TableSpec {
    id:  TableId::BestServers(DataSource::Cloudflare, AsnClass::Terrestrial),
    ddl: "CREATE TABLE IF NOT EXISTS cloudflare_terrestrial_servers (
            client_city     TEXT,
            client_country  TEXT NOT NULL,
            server_code     TEXT NOT NULL,
            month           INTEGER NOT NULL,
            year            INTEGER NOT NULL
          );
          CREATE INDEX IF NOT EXISTS cloudflare_terrestrial_period_idx
            ON cloudflare_terrestrial_servers(year, month);",
  },
  TableSpec {
    id:  TableId::BestServers(DataSource::Cloudflare, AsnClass::Starlink),
    ddl: "CREATE TABLE IF NOT EXISTS cloudflare_starlink_servers (
            client_city     TEXT,
            client_country  TEXT NOT NULL,
            server_code     TEXT NOT NULL,
            month           INTEGER NOT NULL,
            year            INTEGER NOT NULL
          );
          CREATE INDEX IF NOT EXISTS cloudflare_starlink_period_idx
            ON cloudflare_starlink_servers(year, month);",
  },
  // Insert-only; rows are never updated or deleted by the pipeline.
  TableSpec {
    id:  TableId::UnifiedTelemetry,
    ddl: "CREATE TABLE IF NOT EXISTS unified_telemetry (
            uuid                      TEXT PRIMARY KEY,
            test_time                 TEXT NOT NULL,
            client_city               TEXT,
            client_region             TEXT,
            client_country            TEXT NOT NULL,
            server_city               TEXT NOT NULL,
            server_country            TEXT NOT NULL,
            asn                       INTEGER NOT NULL,
            data_source               TEXT NOT NULL,
            packet_loss_rate          REAL,
            download_throughput_mbps  REAL,
            download_latency_ms       INTEGER,
            download_jitter_ms        REAL,
            upload_throughput_mbps    REAL,
            upload_latency_ms         INTEGER,
            upload_jitter_ms          REAL
          );
          CREATE INDEX IF NOT EXISTS unified_test_time_idx ON unified_telemetry(test_time);",
  },
];

/// Connection-level settings applied before the tables are created.
pub const PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
";
