//! Measurement rows as they flow through the pipeline.
//!
//! A [`RawMeasurement`] is produced by a probe adapter and never changes after
//! it is fetched. The reconciler consumes staged copies and emits
//! [`UnifiedTelemetryRecord`]s, the only shape that reaches the unified store.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{asn::AsnClass, dates::Month};

// ─── Source ──────────────────────────────────────────────────────────────────

/// The probe network a measurement came from.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
  /// M-Lab NDT7; servers are identified by city and country.
  Ndt7,
  /// Cloudflare speed tests; servers are identified by PoP (airport) code.
  Cloudflare,
}

impl DataSource {
  pub const ALL: [Self; 2] = [Self::Ndt7, Self::Cloudflare];

  /// The tag stored in the `data_source` column.
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Ndt7 => "ndt7",
      Self::Cloudflare => "cloudflare",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "ndt7" => Some(Self::Ndt7),
      "cloudflare" => Some(Self::Cloudflare),
      _ => None,
    }
  }

  /// Whether servers from this source must go through the airport resolver.
  pub fn identifies_servers_by_code(self) -> bool {
    matches!(self, Self::Cloudflare)
  }
}

impl fmt::Display for DataSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

// ─── Server identity ─────────────────────────────────────────────────────────

/// How a source names the server that answered a test.
#[derive(
  Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerId {
  Location { city: String, country: String },
  /// An airport / point-of-presence code such as `CDG`.
  Pop { code: String },
}

impl ServerId {
  pub fn location(city: impl Into<String>, country: impl Into<String>) -> Self {
    Self::Location { city: city.into(), country: country.into() }
  }

  pub fn pop(code: impl Into<String>) -> Self {
    Self::Pop { code: code.into() }
  }
}

// ─── Metrics ─────────────────────────────────────────────────────────────────

/// The performance figures carried unchanged from probe to unified store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
  pub packet_loss_rate:         Option<f64>,
  pub download_throughput_mbps: Option<f64>,
  pub download_latency_ms:      Option<i64>,
  pub download_jitter_ms:       Option<f64>,
  pub upload_throughput_mbps:   Option<f64>,
  pub upload_latency_ms:        Option<i64>,
  pub upload_jitter_ms:         Option<f64>,
}

// ─── Raw measurement ─────────────────────────────────────────────────────────

/// A single test result exactly as the probe source reported it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMeasurement {
  /// Unique within its source; becomes the unified primary key.
  pub uuid:           String,
  pub test_time:      DateTime<Utc>,
  pub client_city:    Option<String>,
  pub client_region:  Option<String>,
  pub client_country: String,
  pub server:         ServerId,
  pub asn:            u32,
  #[serde(flatten)]
  pub metrics:        Metrics,
}

impl RawMeasurement {
  pub fn class(&self) -> AsnClass { AsnClass::classify(self.asn) }

  /// The UTC calendar month the test ran in.
  pub fn period(&self) -> Month { Month::from_date(self.test_time.date_naive()) }

  /// The client city, treating an empty string as absent.
  pub fn client_city(&self) -> Option<&str> {
    self.client_city.as_deref().filter(|c| !c.is_empty())
  }
}

/// A raw measurement parked in staging for one source and one run date.
#[derive(Debug, Clone, PartialEq)]
pub struct StagingRecord {
  pub source:      DataSource,
  pub run_date:    NaiveDate,
  pub measurement: RawMeasurement,
}

// ─── Unified record ──────────────────────────────────────────────────────────

/// A reconciled row in the unified store. Insert-only; keyed by `uuid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedTelemetryRecord {
  pub uuid:           String,
  pub test_time:      DateTime<Utc>,
  pub client_city:    Option<String>,
  pub client_region:  Option<String>,
  pub client_country: String,
  pub server_city:    String,
  pub server_country: String,
  pub asn:            u32,
  pub data_source:    DataSource,
  pub metrics:        Metrics,
}
