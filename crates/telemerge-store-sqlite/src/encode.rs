//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Dates are stored as `yyyy-mm-dd`, timestamps as RFC 3339 strings and
//! enumerations as their lowercase tags.

use chrono::{DateTime, NaiveDate, Utc};
use telemerge_core::{
  asn::{AsnClass, AsnRank},
  dates::{DATE_FORMAT, Month},
  measurement::{DataSource, Metrics, RawMeasurement, ServerId, StagingRecord, UnifiedTelemetryRecord},
  reference::{BestServerEntry, GazetteerCity},
};

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_date(d: NaiveDate) -> String { d.format(DATE_FORMAT).to_string() }

pub fn decode_date(s: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(s, DATE_FORMAT).map_err(|e| Error::DateParse(format!("{s:?}: {e}")))
}

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(format!("{s:?}: {e}")))
}

pub fn decode_source(s: &str) -> Result<DataSource> {
  DataSource::parse(s).ok_or_else(|| Error::Decode { column: "source", value: s.to_owned() })
}

/// SQLite integers are signed; counts and populations saturate.
pub fn encode_u64(n: u64) -> i64 { i64::try_from(n).unwrap_or(i64::MAX) }

pub fn decode_u64(n: i64) -> u64 { u64::try_from(n).unwrap_or(0) }

pub fn decode_asn(n: i64) -> Result<u32> {
  u32::try_from(n).map_err(|_| Error::Decode { column: "asn", value: n.to_string() })
}

// ─── Server identity ─────────────────────────────────────────────────────────

/// `(server_city, server_country, server_code)` columns.
pub fn encode_server(s: &ServerId) -> (Option<String>, Option<String>, Option<String>) {
  match s {
    ServerId::Location { city, country } => (Some(city.clone()), Some(country.clone()), None),
    ServerId::Pop { code } => (None, None, Some(code.clone())),
  }
}

pub fn decode_server(
  city: Option<String>,
  country: Option<String>,
  code: Option<String>,
) -> Result<ServerId> {
  match (city, country, code) {
    (_, _, Some(code)) => Ok(ServerId::Pop { code }),
    (Some(city), Some(country), None) => Ok(ServerId::Location { city, country }),
    (city, country, None) => Err(Error::Decode {
      column: "server",
      value:  format!("{city:?}/{country:?}"),
    }),
  }
}

// ─── Rows ────────────────────────────────────────────────────────────────────

/// Raw values read directly from a `staging` row.
pub struct RawStaging {
  pub source:         String,
  pub run_date:       String,
  pub uuid:           String,
  pub test_time:      String,
  pub client_city:    Option<String>,
  pub client_region:  Option<String>,
  pub client_country: String,
  pub server_city:    Option<String>,
  pub server_country: Option<String>,
  pub server_code:    Option<String>,
  pub asn:            i64,
  pub metrics:        Metrics,
}

/// Column list matching [`RawStaging::from_row`].
pub const STAGING_COLUMNS: &str = "source, run_date, uuid, test_time, client_city, client_region,
  client_country, server_city, server_country, server_code, asn,
  packet_loss_rate, download_throughput_mbps, download_latency_ms, download_jitter_ms,
  upload_throughput_mbps, upload_latency_ms, upload_jitter_ms";

impl RawStaging {
  pub fn from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      source:         r.get(0)?,
      run_date:       r.get(1)?,
      uuid:           r.get(2)?,
      test_time:      r.get(3)?,
      client_city:    r.get(4)?,
      client_region:  r.get(5)?,
      client_country: r.get(6)?,
      server_city:    r.get(7)?,
      server_country: r.get(8)?,
      server_code:    r.get(9)?,
      asn:            r.get(10)?,
      metrics:        metrics_from_row(r, 11)?,
    })
  }

  pub fn into_record(self) -> Result<StagingRecord> {
    Ok(StagingRecord {
      source:      decode_source(&self.source)?,
      run_date:    decode_date(&self.run_date)?,
      measurement: RawMeasurement {
        uuid:           self.uuid,
        test_time:      decode_dt(&self.test_time)?,
        client_city:    self.client_city,
        client_region:  self.client_region,
        client_country: self.client_country,
        server:         decode_server(self.server_city, self.server_country, self.server_code)?,
        asn:            decode_asn(self.asn)?,
        metrics:        self.metrics,
      },
    })
  }
}

/// Raw values read directly from a `unified_telemetry` row.
pub struct RawUnified {
  pub uuid:           String,
  pub test_time:      String,
  pub client_city:    Option<String>,
  pub client_region:  Option<String>,
  pub client_country: String,
  pub server_city:    String,
  pub server_country: String,
  pub asn:            i64,
  pub data_source:    String,
  pub metrics:        Metrics,
}

pub const UNIFIED_COLUMNS: &str = "uuid, test_time, client_city, client_region, client_country,
  server_city, server_country, asn, data_source,
  packet_loss_rate, download_throughput_mbps, download_latency_ms, download_jitter_ms,
  upload_throughput_mbps, upload_latency_ms, upload_jitter_ms";

impl RawUnified {
  pub fn from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      uuid:           r.get(0)?,
      test_time:      r.get(1)?,
      client_city:    r.get(2)?,
      client_region:  r.get(3)?,
      client_country: r.get(4)?,
      server_city:    r.get(5)?,
      server_country: r.get(6)?,
      asn:            r.get(7)?,
      data_source:    r.get(8)?,
      metrics:        metrics_from_row(r, 9)?,
    })
  }

  pub fn into_record(self) -> Result<UnifiedTelemetryRecord> {
    Ok(UnifiedTelemetryRecord {
      uuid:           self.uuid,
      test_time:      decode_dt(&self.test_time)?,
      client_city:    self.client_city,
      client_region:  self.client_region,
      client_country: self.client_country,
      server_city:    self.server_city,
      server_country: self.server_country,
      asn:            decode_asn(self.asn)?,
      data_source:    decode_source(&self.data_source)?,
      metrics:        self.metrics,
    })
  }
}

/// Seven metric columns starting at `first`, in [`Metrics`] field order.
fn metrics_from_row(r: &rusqlite::Row<'_>, first: usize) -> rusqlite::Result<Metrics> {
  Ok(Metrics {
    packet_loss_rate:         r.get(first)?,
    download_throughput_mbps: r.get(first + 1)?,
    download_latency_ms:      r.get(first + 2)?,
    download_jitter_ms:       r.get(first + 3)?,
    upload_throughput_mbps:   r.get(first + 4)?,
    upload_latency_ms:        r.get(first + 5)?,
    upload_jitter_ms:         r.get(first + 6)?,
  })
}

/// Raw values read from any best-server table. `server_*` columns absent from
/// a table are selected as NULL.
pub struct RawBestServer {
  pub client_city:    Option<String>,
  pub client_country: String,
  pub server_city:    Option<String>,
  pub server_country: Option<String>,
  pub server_code:    Option<String>,
}

impl RawBestServer {
  pub fn into_entry(self, period: Month, class: AsnClass) -> Result<BestServerEntry> {
    Ok(BestServerEntry {
      client_city: self.client_city,
      client_country: self.client_country,
      server: decode_server(self.server_city, self.server_country, self.server_code)?,
      period,
      class,
    })
  }
}

/// Raw values read from a `gazetteer` row.
pub struct RawGazetteer {
  pub name:         String,
  pub ascii_name:   String,
  pub aliases:      [Option<String>; 4],
  pub region:       String,
  pub country_code: String,
  pub population:   i64,
}

impl RawGazetteer {
  pub fn into_city(self) -> GazetteerCity {
    GazetteerCity {
      name:         self.name,
      ascii_name:   self.ascii_name,
      aliases:      self.aliases.into_iter().flatten().collect(),
      region:       self.region,
      country_code: self.country_code,
      population:   decode_u64(self.population),
    }
  }
}

pub fn rank_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<AsnRank> {
  let rank: Option<i64> = r.get(2)?;
  Ok(AsnRank {
    asn:          r.get(0)?,
    name:         r.get(1)?,
    rank:         rank.map(decode_u64),
    country_code: r.get(3)?,
    country_name: r.get(4)?,
  })
}
