//! Contracts for upstream measurement providers.
//!
//! Adapters are passed into the pipeline explicitly; nothing here knows how
//! rows are fetched.

use std::future::Future;

use chrono::NaiveDate;

use crate::{
  asn::AsnAllowList,
  best_server::LatencySample,
  measurement::{DataSource, RawMeasurement},
};

/// Daily measurements for one probe network.
pub trait MeasurementSource: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn data_source(&self) -> DataSource;

  /// Every measurement taken on `date` (UTC) by an ASN in `asns`.
  fn fetch<'a>(
    &'a self,
    date: NaiveDate,
    asns: &'a AsnAllowList,
  ) -> impl Future<Output = Result<Vec<RawMeasurement>, Self::Error>> + Send + 'a;
}

/// Latency observations used to build best-server references.
pub trait LatencySource: MeasurementSource {
  /// Samples for every day in `from..=to` by an ASN in `asns`.
  fn latency_samples<'a>(
    &'a self,
    from: NaiveDate,
    to: NaiveDate,
    asns: &'a AsnAllowList,
  ) -> impl Future<Output = Result<Vec<LatencySample>, Self::Error>> + Send + 'a;
}
