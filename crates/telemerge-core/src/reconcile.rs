//! Staged rows → unified records.
//!
//! A [`Reconciler`] holds everything a merge needs in memory: the best-server
//! index of every source and the static reference data. Storage backends call
//! [`Reconciler::reconcile`] from inside their merge transaction so that the
//! decisions and the writes commit together.

use std::{collections::HashMap, sync::Arc};

use chrono::NaiveDate;
use serde::Serialize;

use crate::{
  airport::AirportIndex,
  filter::{Granularity, ReferenceIndex, Verdict},
  gazetteer::Gazetteer,
  measurement::{DataSource, ServerId, StagingRecord, UnifiedTelemetryRecord},
};

/// Reference data that does not depend on the date being merged.
pub struct StaticReference {
  pub gazetteer: Gazetteer,
  pub airports:  AirportIndex,
}

// ─── Reports ─────────────────────────────────────────────────────────────────

/// Counts for one source on one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
  pub source:          DataSource,
  /// Rows read from staging.
  pub staged:          usize,
  pub dropped_city:    usize,
  pub dropped_country: usize,
  /// Rows kept because no reference data covered them.
  pub unfiltered:      usize,
  /// Rows whose client city matched the gazetteer.
  pub canonicalized:   usize,
  /// Rows whose server code had no airport mapping.
  pub unresolved:      usize,
  /// Rows actually inserted; uuids already present are not counted.
  pub merged:          usize,
}

impl SourceReport {
  pub fn new(source: DataSource, staged: usize) -> Self {
    Self {
      source,
      staged,
      dropped_city: 0,
      dropped_country: 0,
      unfiltered: 0,
      canonicalized: 0,
      unresolved: 0,
      merged: 0,
    }
  }

  /// Rows that survived reconciliation but were already in the unified store.
  pub fn duplicates(&self) -> usize {
    self
      .staged
      .saturating_sub(self.dropped_city + self.dropped_country + self.unresolved)
      .saturating_sub(self.merged)
  }
}

/// Outcome of merging one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReport {
  pub date:    NaiveDate,
  pub sources: Vec<SourceReport>,
}

impl MergeReport {
  pub fn merged(&self) -> usize { self.sources.iter().map(|s| s.merged).sum() }

  pub fn source(&self, source: DataSource) -> Option<&SourceReport> {
    self.sources.iter().find(|s| s.source == source)
  }
}

/// Records ready for insertion together with their counts.
#[derive(Debug)]
pub struct Reconciled {
  pub records: Vec<UnifiedTelemetryRecord>,
  pub report:  SourceReport,
}

// ─── Reconciler ──────────────────────────────────────────────────────────────

pub struct Reconciler {
  references: HashMap<DataSource, ReferenceIndex>,
  statics:    Arc<StaticReference>,
}

impl Reconciler {
  pub fn new(statics: Arc<StaticReference>) -> Self {
    Self { references: HashMap::new(), statics }
  }

  /// Use `index` as the best-server reference for `source`.
  pub fn with_reference(mut self, source: DataSource, index: ReferenceIndex) -> Self {
    self.references.insert(source, index);
    self
  }

  /// Filter, canonicalize and resolve the staged rows of one source.
  ///
  /// Order matters: the validity filter sees the raw fields, the airport
  /// resolver sees the filtered rows, and only resolved rows are returned.
  pub fn reconcile(&self, source: DataSource, rows: Vec<StagingRecord>) -> Reconciled {
    let empty = ReferenceIndex::default();
    let reference = self.references.get(&source).unwrap_or(&empty);
    let StaticReference { gazetteer, airports } = self.statics.as_ref();

    let mut report = SourceReport::new(source, rows.len());
    let mut records = Vec::with_capacity(rows.len());

    for row in rows {
      let mut m = row.measurement;
      match reference.decide(&m) {
        Verdict::Dropped(Granularity::City) => {
          report.dropped_city += 1;
          continue;
        }
        Verdict::Dropped(Granularity::Country) => {
          report.dropped_country += 1;
          continue;
        }
        Verdict::Unfiltered => report.unfiltered += 1,
        Verdict::Valid(_) => {}
      }

      if gazetteer.canonicalize_client(&mut m) {
        report.canonicalized += 1;
      }

      let mut server = m.server;
      gazetteer.canonicalize_server(&mut server);
      let (server_city, server_country) = match server {
        ServerId::Location { city, country } => (city, country),
        ServerId::Pop { code } => match airports.resolve(&code) {
          Some((city, country)) => (city.to_owned(), country.to_owned()),
          None => {
            tracing::debug!(%source, code = %code, uuid = %m.uuid, "unmapped server code");
            report.unresolved += 1;
            continue;
          }
        },
      };

      records.push(UnifiedTelemetryRecord {
        uuid: m.uuid,
        test_time: m.test_time,
        client_city: m.client_city,
        client_region: m.client_region,
        client_country: m.client_country,
        server_city,
        server_country,
        asn: m.asn,
        data_source: source,
        metrics: m.metrics,
      });
    }

    if report.unfiltered > 0 {
      tracing::warn!(
        %source,
        rows = report.unfiltered,
        "no best-server reference for some rows; kept unfiltered"
      );
    }
    if report.unresolved > 0 {
      tracing::warn!(%source, rows = report.unresolved, "rows dropped for unmapped server codes");
    }

    Reconciled { records, report }
  }
}

#[cfg(test)]
mod tests {
  use chrono::{TimeZone, Utc};

  use super::*;
  use crate::{
    asn::AsnClass,
    dates::Month,
    measurement::{Metrics, RawMeasurement},
    reference::{AirportMapping, BestServerEntry, GazetteerCity},
  };

  fn statics() -> Arc<StaticReference> {
    Arc::new(StaticReference {
      gazetteer: Gazetteer::new(vec![GazetteerCity {
        name:         "Paris".into(),
        ascii_name:   "Paris".into(),
        aliases:      vec!["Paname".into()],
        region:       "Île-de-France".into(),
        country_code: "FR".into(),
        population:   2_138_551,
      }]),
      airports:  AirportIndex::new(vec![AirportMapping {
        code:    "CDG".into(),
        city:    "Paris".into(),
        country: "FR".into(),
      }]),
    })
  }

  fn staged(uuid: &str, city: &str, server: ServerId, source: DataSource) -> StagingRecord {
    StagingRecord {
      source,
      run_date: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
      measurement: RawMeasurement {
        uuid:           uuid.into(),
        test_time:      Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap(),
        client_city:    Some(city.into()),
        client_region:  None,
        client_country: "FR".into(),
        server,
        asn:            3215,
        metrics:        Metrics { download_latency_ms: Some(12), ..Metrics::default() },
      },
    }
  }

  fn entry(server: ServerId) -> BestServerEntry {
    BestServerEntry {
      client_city: Some("Paname".into()),
      client_country: "FR".into(),
      server,
      period: Month::new(2024, 3).unwrap(),
      class: AsnClass::Terrestrial,
    }
  }

  #[test]
  fn filter_sees_raw_city_then_canonicalizes() {
    let reconciler = Reconciler::new(statics()).with_reference(
      DataSource::Ndt7,
      ReferenceIndex::new([entry(ServerId::location("Paris", "FR"))]),
    );
    let out = reconciler.reconcile(DataSource::Ndt7, vec![
      staged("a", "Paname", ServerId::location("Paname", "FR"), DataSource::Ndt7),
      staged("b", "Paname", ServerId::location("Berlin", "DE"), DataSource::Ndt7),
    ]);

    // "Paname" → "Paris" for the server happens after filtering, so the raw
    // server (Paname, FR) is not in the reference set.
    assert_eq!(out.report.dropped_city, 2);
    assert!(out.records.is_empty());

    let out = reconciler.reconcile(DataSource::Ndt7, vec![staged(
      "c",
      "Paname",
      ServerId::location("Paris", "FR"),
      DataSource::Ndt7,
    )]);
    assert_eq!(out.records.len(), 1);
    let r = &out.records[0];
    assert_eq!(r.client_city.as_deref(), Some("Paris"));
    assert_eq!(r.client_region.as_deref(), Some("Île-de-France"));
    assert_eq!((r.server_city.as_str(), r.server_country.as_str()), ("Paris", "FR"));
    assert_eq!(r.data_source, DataSource::Ndt7);
    assert_eq!(r.metrics.download_latency_ms, Some(12));
    assert_eq!(out.report.canonicalized, 1);
  }

  #[test]
  fn unmapped_codes_are_counted_not_returned() {
    let reconciler = Reconciler::new(statics());
    let out = reconciler.reconcile(DataSource::Cloudflare, vec![
      staged("a", "Paris", ServerId::pop("CDG"), DataSource::Cloudflare),
      staged("b", "Paris", ServerId::pop("ZZZ"), DataSource::Cloudflare),
    ]);
    assert_eq!(out.report.unfiltered, 2);
    assert_eq!(out.report.unresolved, 1);
    assert_eq!(out.records.len(), 1);
    assert_eq!(out.records[0].uuid, "a");
    assert_eq!(out.records[0].server_city, "Paris");
  }

  #[test]
  fn references_are_per_source() {
    let reconciler = Reconciler::new(statics()).with_reference(
      DataSource::Cloudflare,
      ReferenceIndex::new([entry(ServerId::pop("CDG"))]),
    );
    // The cloudflare reference does not filter ndt7 rows.
    let out = reconciler.reconcile(DataSource::Ndt7, vec![staged(
      "a",
      "Paname",
      ServerId::location("Berlin", "DE"),
      DataSource::Ndt7,
    )]);
    assert_eq!(out.records.len(), 1);
    assert_eq!(out.report.unfiltered, 1);
  }
}
