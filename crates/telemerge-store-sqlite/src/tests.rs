//! Integration tests for `SqliteStore` and the pipeline against an in-memory
//! database.

use std::{
  collections::{HashMap, HashSet},
  sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
  },
};

use chrono::{NaiveDate, TimeZone, Utc};
use telemerge_core::{
  asn::{AsnAllowList, AsnClass, AsnRank, STARLINK_ASN},
  best_server::LatencySample,
  dates::Month,
  measurement::{DataSource, Metrics, RawMeasurement, ServerId},
  pipeline::{DateOutcome, Pipeline, RunContext},
  reference::{self, AirportMapping, BestServerEntry, ReferenceKind, ReferenceRows, SourceFile},
  source::{LatencySource, MeasurementSource},
  store::TelemetryStore,
};

use crate::{Error, SqliteStore};

// ─── Fixtures ────────────────────────────────────────────────────────────────

async fn store() -> SqliteStore {
  let store = SqliteStore::open_in_memory()
    .await
    .expect("in-memory store");
  seed_asns(&store).await;
  store
}

/// Rank a terrestrial ASN in FR and JP so the default allow-list covers the
/// rows used below.
async fn seed_asns(store: &SqliteStore) {
  let rank = |asn, cc: &str| AsnRank {
    asn,
    name: Some(format!("AS{asn}")),
    rank: Some(1),
    country_code: Some(cc.into()),
    country_name: None,
  };
  store
    .replace_reference(ReferenceRows::AsnRanks(vec![rank(3215, "FR"), rank(2516, "JP")]))
    .await
    .unwrap();
  store
    .replace_reference(ReferenceRows::StarlinkCountries(vec!["FR".into(), "JP".into()]))
    .await
    .unwrap();
}

fn day(d: u32) -> NaiveDate { NaiveDate::from_ymd_opt(2024, 3, d).unwrap() }

fn today() -> NaiveDate { NaiveDate::from_ymd_opt(2024, 4, 1).unwrap() }

fn march() -> Month { Month::new(2024, 3).unwrap() }

fn loc(city: &str, country: &str) -> ServerId { ServerId::location(city, country) }

fn row(uuid: &str, date: NaiveDate, city: &str, country: &str, server: ServerId, asn: u32) -> RawMeasurement {
  RawMeasurement {
    uuid: uuid.into(),
    test_time: Utc
      .from_utc_datetime(&date.and_hms_opt(9, 30, 0).unwrap()),
    client_city: Some(city.into()),
    client_region: None,
    client_country: country.into(),
    server,
    asn,
    metrics: Metrics {
      download_throughput_mbps: Some(94.2),
      download_latency_ms: Some(18),
      ..Metrics::default()
    },
  }
}

fn entry(city: Option<&str>, country: &str, server: ServerId, class: AsnClass) -> BestServerEntry {
  BestServerEntry {
    client_city: city.map(str::to_owned),
    client_country: country.into(),
    server,
    period: march(),
    class,
  }
}

async fn uuids(store: &SqliteStore) -> Vec<String> {
  store
    .unified_records()
    .await
    .unwrap()
    .into_iter()
    .map(|r| r.uuid)
    .collect()
}

// ─── Fake source ─────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
#[error("upstream unavailable for {0}")]
struct Unavailable(NaiveDate);

struct FakeSource {
  data_source: DataSource,
  days:        HashMap<NaiveDate, Vec<RawMeasurement>>,
  failing:     HashSet<NaiveDate>,
  samples:     Vec<(u32, LatencySample)>,
  fetches:     AtomicUsize,
  seen_asns:   Mutex<Vec<AsnAllowList>>,
}

impl FakeSource {
  fn new(data_source: DataSource) -> Self {
    Self {
      data_source,
      days: HashMap::new(),
      failing: HashSet::new(),
      samples: Vec::new(),
      fetches: AtomicUsize::new(0),
      seen_asns: Mutex::new(Vec::new()),
    }
  }

  fn with_day(mut self, date: NaiveDate, rows: Vec<RawMeasurement>) -> Self {
    self.days.insert(date, rows);
    self
  }

  fn failing_on(mut self, date: NaiveDate) -> Self {
    self.failing.insert(date);
    self
  }

  fn with_sample(mut self, asn: u32, city: &str, country: &str, server: ServerId, down: f64) -> Self {
    self.samples.push((asn, LatencySample {
      client_city: Some(city.into()),
      client_country: country.into(),
      server,
      download_latency_ms: Some(down),
      upload_latency_ms: None,
    }));
    self
  }

  fn fetches(&self) -> usize { self.fetches.load(Ordering::SeqCst) }
}

impl MeasurementSource for FakeSource {
  type Error = Unavailable;

  fn data_source(&self) -> DataSource { self.data_source }

  async fn fetch<'a>(
    &'a self,
    date: NaiveDate,
    asns: &'a AsnAllowList,
  ) -> Result<Vec<RawMeasurement>, Unavailable> {
    self.fetches.fetch_add(1, Ordering::SeqCst);
    self.seen_asns.lock().unwrap().push(asns.clone());
    if self.failing.contains(&date) {
      return Err(Unavailable(date));
    }
    Ok(
      self
        .days
        .get(&date)
        .into_iter()
        .flatten()
        .filter(|m| asns.contains(m.asn))
        .cloned()
        .collect(),
    )
  }
}

impl LatencySource for FakeSource {
  async fn latency_samples<'a>(
    &'a self,
    _from: NaiveDate,
    _to: NaiveDate,
    asns: &'a AsnAllowList,
  ) -> Result<Vec<LatencySample>, Unavailable> {
    Ok(
      self
        .samples
        .iter()
        .filter(|(asn, _)| asns.contains(*asn))
        .map(|(_, s)| s.clone())
        .collect(),
    )
  }
}

// ─── Schema ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn schema_init_is_idempotent_and_drop_removes_tables() {
  let s = store().await;
  s.init_schema().await.unwrap();
  assert!(!s.is_processed(day(1)).await.unwrap());

  s.drop_schema().await.unwrap();
  assert!(s.is_processed(day(1)).await.is_err());

  s.init_schema().await.unwrap();
  assert!(s.asn_ranks().await.unwrap().is_empty());
}

// ─── Staging ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn restaging_replaces_previous_attempt() {
  let s = store().await;
  let rows = vec![
    row("a", day(15), "Paris", "FR", loc("Paris", "FR"), 3215),
    row("b", day(15), "Paris", "FR", loc("Paris", "FR"), 3215),
  ];
  assert_eq!(s.stage(DataSource::Ndt7, day(15), rows).await.unwrap(), 2);
  assert_eq!(s.staged_count(DataSource::Ndt7, day(15)).await.unwrap(), 2);

  let retry = vec![row("a", day(15), "Paris", "FR", loc("Paris", "FR"), 3215)];
  s.stage(DataSource::Ndt7, day(15), retry).await.unwrap();
  assert_eq!(s.staged_count(DataSource::Ndt7, day(15)).await.unwrap(), 1);

  // Other sources and dates are untouched.
  assert_eq!(s.staged_count(DataSource::Cloudflare, day(15)).await.unwrap(), 0);
}

#[tokio::test]
async fn staged_count_matches_rows_held() {
  let s = store().await;
  let rows = vec![
    row("a", day(15), "Paris", "FR", loc("Paris", "FR"), 3215),
    row("a", day(15), "Paris", "FR", loc("London", "GB"), 3215),
    row("b", day(15), "Paris", "FR", loc("Paris", "FR"), 3215),
  ];
  assert_eq!(s.stage(DataSource::Ndt7, day(15), rows).await.unwrap(), 2);
  assert_eq!(s.staged_count(DataSource::Ndt7, day(15)).await.unwrap(), 2);
}

// ─── Reference data ──────────────────────────────────────────────────────────

const CITIES: &str = "\
2988507\tParis\tParis\tLutece,Paname\t48.85\t2.35\tP\tPPLC\tFR\t\t11\t75\t\t\t2138551\t\t42\tEurope/Paris\t2024-01-01
";
const REGIONS: &str = "FR.11\tÎle-de-France\tIle-de-France\t3012874\n";
const AIRPORTS: &str = "\
ident\ttype\tmunicipality\tiso_country\tiata_code
LFPG\tlarge_airport\tPaname\tFR\tCDG
";

async fn refresh_geography(s: &SqliteStore) {
  reference::refresh(s, ReferenceKind::Gazetteer, &[
    SourceFile { name: "cities15000.txt", contents: CITIES },
    SourceFile { name: "admin1CodesASCII.txt", contents: REGIONS },
  ])
  .await
  .unwrap();
  reference::refresh(s, ReferenceKind::Airports, &[SourceFile {
    name:     "airport-codes.tsv",
    contents: AIRPORTS,
  }])
  .await
  .unwrap();
}

#[tokio::test]
async fn refresh_replaces_tables_and_canonicalizes_airports() {
  let s = store().await;
  refresh_geography(&s).await;

  let cities = s.gazetteer().await.unwrap();
  assert_eq!(cities.len(), 1);
  assert_eq!(cities[0].aliases, vec!["Lutece", "Paname"]);

  assert_eq!(s.airport_mappings().await.unwrap(), vec![AirportMapping {
    code:    "CDG".into(),
    city:    "Paris".into(),
    country: "FR".into(),
  }]);

  // A second refresh replaces rather than appends.
  refresh_geography(&s).await;
  assert_eq!(s.gazetteer().await.unwrap().len(), 1);
  assert_eq!(s.airport_mappings().await.unwrap().len(), 1);
}

#[tokio::test]
async fn best_server_slice_is_replaced_per_month() {
  let s = store().await;
  let entries = vec![
    entry(Some("Paris"), "FR", loc("Paris", "FR"), AsnClass::Terrestrial),
    entry(None, "FR", loc("Paris", "FR"), AsnClass::Terrestrial),
  ];
  s.replace_best_servers(DataSource::Ndt7, AsnClass::Terrestrial, march(), entries.clone())
    .await
    .unwrap();
  s.replace_best_servers(DataSource::Ndt7, AsnClass::Terrestrial, march(), entries.clone())
    .await
    .unwrap();

  let stored = s.best_servers(DataSource::Ndt7, march()).await.unwrap();
  assert_eq!(stored.len(), 2);
  assert!(stored.contains(&entries[1]));

  let april = Month::new(2024, 4).unwrap();
  assert!(s.best_servers(DataSource::Ndt7, april).await.unwrap().is_empty());
}

#[tokio::test]
async fn best_server_tables_reject_the_wrong_server_kind() {
  let s = store().await;
  let err = s
    .replace_best_servers(DataSource::Ndt7, AsnClass::Starlink, march(), vec![entry(
      Some("Paris"),
      "FR",
      ServerId::pop("CDG"),
      AsnClass::Starlink,
    )])
    .await
    .unwrap_err();
  assert!(matches!(err, Error::ServerKind { .. }));
}

// ─── Ingest ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn paris_row_to_berlin_is_dropped() {
  let s = store().await;
  s.replace_best_servers(DataSource::Ndt7, AsnClass::Terrestrial, march(), vec![
    entry(Some("Paris"), "FR", loc("Paris", "FR"), AsnClass::Terrestrial),
    entry(Some("Paris"), "FR", loc("London", "GB"), AsnClass::Terrestrial),
  ])
  .await
  .unwrap();

  let sources = [FakeSource::new(DataSource::Ndt7).with_day(day(15), vec![
    row("a", day(15), "Paris", "FR", loc("Paris", "FR"), 3215),
    row("b", day(15), "Paris", "FR", loc("London", "GB"), 3215),
    row("c", day(15), "Paris", "FR", loc("Berlin", "DE"), 3215),
  ])];
  let ctx = RunContext::new(today());
  let outcome = Pipeline::new(&s, &sources, &ctx)
    .ingest_date(day(15))
    .await
    .unwrap();

  let DateOutcome::Merged(report) = outcome else { panic!("expected a merge") };
  let ndt7 = report.source(DataSource::Ndt7).unwrap();
  assert_eq!(ndt7.staged, 3);
  assert_eq!(ndt7.dropped_city, 1);
  assert_eq!(ndt7.merged, 2);

  assert_eq!(uuids(&s).await, vec!["a", "b"]);
  assert_eq!(s.staged_count(DataSource::Ndt7, day(15)).await.unwrap(), 0);
  assert_eq!(s.processed_dates().await.unwrap(), vec![day(15)]);
}

#[tokio::test]
async fn tokyo_falls_back_to_country_entries() {
  let s = store().await;
  s.replace_best_servers(DataSource::Ndt7, AsnClass::Terrestrial, march(), vec![entry(
    None,
    "JP",
    loc("Osaka", "JP"),
    AsnClass::Terrestrial,
  )])
  .await
  .unwrap();

  let sources = [FakeSource::new(DataSource::Ndt7).with_day(day(15), vec![
    row("nagoya", day(15), "Tokyo", "JP", loc("Nagoya", "JP"), 2516),
    row("osaka", day(15), "Tokyo", "JP", loc("Osaka", "JP"), 2516),
  ])];
  let ctx = RunContext::new(today());
  let DateOutcome::Merged(report) = Pipeline::new(&s, &sources, &ctx)
    .ingest_date(day(15))
    .await
    .unwrap()
  else {
    panic!("expected a merge")
  };

  assert_eq!(report.source(DataSource::Ndt7).unwrap().dropped_country, 1);
  assert_eq!(uuids(&s).await, vec!["osaka"]);
}

#[tokio::test]
async fn unmapped_code_never_reaches_unified_store() {
  let s = store().await;
  refresh_geography(&s).await;

  let sources = [FakeSource::new(DataSource::Cloudflare).with_day(day(15), vec![
    row("cdg", day(15), "Paris", "FR", ServerId::pop("CDG"), 3215),
    row("zzz", day(15), "Paris", "FR", ServerId::pop("ZZZ"), 3215),
  ])];
  let ctx = RunContext::new(today());
  let DateOutcome::Merged(report) = Pipeline::new(&s, &sources, &ctx)
    .ingest_date(day(15))
    .await
    .unwrap()
  else {
    panic!("expected a merge")
  };

  let cf = report.source(DataSource::Cloudflare).unwrap();
  // No best-server reference: both rows pass the filter.
  assert_eq!(cf.unfiltered, 2);
  assert_eq!(cf.unresolved, 1);
  assert_eq!(cf.merged, 1);

  let records = s.unified_records().await.unwrap();
  assert_eq!(records.len(), 1);
  assert_eq!(records[0].uuid, "cdg");
  assert_eq!(records[0].server_city, "Paris");
  assert_eq!(records[0].data_source, DataSource::Cloudflare);
  assert_eq!(s.staged_count(DataSource::Cloudflare, day(15)).await.unwrap(), 0);
}

#[tokio::test]
async fn client_city_is_canonicalized_on_merge() {
  let s = store().await;
  refresh_geography(&s).await;

  let sources = [FakeSource::new(DataSource::Ndt7).with_day(day(15), vec![row(
    "a",
    day(15),
    "Paname",
    "FR",
    loc("Lutece", "FR"),
    3215,
  )])];
  let ctx = RunContext::new(today());
  Pipeline::new(&s, &sources, &ctx).ingest_date(day(15)).await.unwrap();

  let records = s.unified_records().await.unwrap();
  assert_eq!(records[0].client_city.as_deref(), Some("Paris"));
  assert_eq!(records[0].client_region.as_deref(), Some("Ile-de-France"));
  assert_eq!(records[0].server_city, "Paris");
  assert_eq!(records[0].metrics.download_latency_ms, Some(18));
}

#[tokio::test]
async fn starlink_and_terrestrial_references_stay_separate() {
  let s = store().await;
  s.replace_best_servers(DataSource::Ndt7, AsnClass::Starlink, march(), vec![entry(
    Some("Paris"),
    "FR",
    loc("Paris", "FR"),
    AsnClass::Starlink,
  )])
  .await
  .unwrap();

  let sources = [FakeSource::new(DataSource::Ndt7).with_day(day(15), vec![
    row("terrestrial", day(15), "Paris", "FR", loc("Berlin", "DE"), 3215),
    row("starlink", day(15), "Paris", "FR", loc("Berlin", "DE"), STARLINK_ASN),
  ])];
  let ctx = RunContext::new(today());
  let DateOutcome::Merged(report) = Pipeline::new(&s, &sources, &ctx)
    .ingest_date(day(15))
    .await
    .unwrap()
  else {
    panic!("expected a merge")
  };

  let ndt7 = report.source(DataSource::Ndt7).unwrap();
  assert_eq!(ndt7.dropped_city, 1);
  assert_eq!(ndt7.unfiltered, 1);
  assert_eq!(uuids(&s).await, vec!["terrestrial"]);
}

#[tokio::test]
async fn both_sources_merge_together() {
  let s = store().await;
  refresh_geography(&s).await;

  let sources = [
    FakeSource::new(DataSource::Ndt7).with_day(day(15), vec![row(
      "ndt7-1",
      day(15),
      "Paris",
      "FR",
      loc("Paris", "FR"),
      3215,
    )]),
    FakeSource::new(DataSource::Cloudflare).with_day(day(15), vec![row(
      "cf-1",
      day(15),
      "Paris",
      "FR",
      ServerId::pop("CDG"),
      3215,
    )]),
  ];
  let ctx = RunContext::new(today());
  let DateOutcome::Merged(report) = Pipeline::new(&s, &sources, &ctx)
    .ingest_date(day(15))
    .await
    .unwrap()
  else {
    panic!("expected a merge")
  };

  assert_eq!(report.sources.len(), 2);
  assert_eq!(report.merged(), 2);
  let tags: Vec<_> = s
    .unified_records()
    .await
    .unwrap()
    .into_iter()
    .map(|r| (r.uuid, r.data_source))
    .collect();
  assert_eq!(tags, vec![
    ("cf-1".to_owned(), DataSource::Cloudflare),
    ("ndt7-1".to_owned(), DataSource::Ndt7),
  ]);
}

// ─── Ledger ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn processed_date_fails_strictly_and_skips_quietly() {
  let s = store().await;
  let sources = [FakeSource::new(DataSource::Ndt7).with_day(day(15), vec![row(
    "a",
    day(15),
    "Paris",
    "FR",
    loc("Paris", "FR"),
    3215,
  )])];

  let mut ctx = RunContext::new(today());
  Pipeline::new(&s, &sources, &ctx).ingest_date(day(15)).await.unwrap();
  assert_eq!(sources[0].fetches(), 1);

  let err = Pipeline::new(&s, &sources, &ctx)
    .ingest_date(day(15))
    .await
    .unwrap_err();
  assert!(matches!(err, telemerge_core::Error::AlreadyProcessed(d) if d == day(15)));

  ctx.allow_skip = true;
  let outcome = Pipeline::new(&s, &sources, &ctx)
    .ingest_date(day(15))
    .await
    .unwrap();
  assert_eq!(outcome, DateOutcome::Skipped);

  // Neither attempt fetched or wrote anything.
  assert_eq!(sources[0].fetches(), 1);
  assert_eq!(uuids(&s).await, vec!["a"]);
  assert_eq!(s.staged_count(DataSource::Ndt7, day(15)).await.unwrap(), 0);
}

#[tokio::test]
async fn today_is_rejected_before_any_fetch() {
  let s = store().await;
  let sources = [FakeSource::new(DataSource::Ndt7)];
  let ctx = RunContext::new(today());
  let err = Pipeline::new(&s, &sources, &ctx)
    .ingest_date(today())
    .await
    .unwrap_err();
  assert!(matches!(err, telemerge_core::Error::DateNotEligible { .. }));
  assert_eq!(sources[0].fetches(), 0);
}

#[tokio::test]
async fn concurrent_claim_is_reported_as_already_claimed() {
  let s = store().await;
  s.stage(DataSource::Ndt7, day(15), vec![row("a", day(15), "Paris", "FR", loc("Paris", "FR"), 3215)])
    .await
    .unwrap();

  let statics = std::sync::Arc::new(telemerge_core::reconcile::StaticReference {
    gazetteer: telemerge_core::gazetteer::Gazetteer::new(vec![]),
    airports:  telemerge_core::airport::AirportIndex::default(),
  });
  let reconciler = std::sync::Arc::new(telemerge_core::reconcile::Reconciler::new(statics));

  let first = s
    .merge_date(day(15), vec![DataSource::Ndt7], reconciler.clone())
    .await
    .unwrap();
  assert!(matches!(first, telemerge_core::store::MergeOutcome::Merged(_)));

  // A late run stages the same date again and loses the claim.
  s.stage(DataSource::Ndt7, day(15), vec![row("a", day(15), "Paris", "FR", loc("Paris", "FR"), 3215)])
    .await
    .unwrap();
  let second = s
    .merge_date(day(15), vec![DataSource::Ndt7], reconciler)
    .await
    .unwrap();
  assert_eq!(second, telemerge_core::store::MergeOutcome::AlreadyClaimed);

  // Its staged rows are discarded rather than left behind forever.
  assert_eq!(s.staged_count(DataSource::Ndt7, day(15)).await.unwrap(), 0);
  assert_eq!(uuids(&s).await, vec!["a"]);
  assert_eq!(s.processed_dates().await.unwrap(), vec![day(15)]);
}

// ─── Dedup and failure handling ──────────────────────────────────────────────

#[tokio::test]
async fn uuid_seen_twice_is_merged_once() {
  let s = store().await;
  let sources = [FakeSource::new(DataSource::Ndt7)
    .with_day(day(14), vec![row("dup", day(14), "Paris", "FR", loc("Paris", "FR"), 3215)])
    .with_day(day(15), vec![row("dup", day(15), "Paris", "FR", loc("Paris", "FR"), 3215)])];
  let ctx = RunContext::new(today());
  let pipeline = Pipeline::new(&s, &sources, &ctx);

  pipeline.ingest_date(day(15)).await.unwrap();
  let DateOutcome::Merged(report) = pipeline.ingest_date(day(14)).await.unwrap() else {
    panic!("expected a merge")
  };

  let ndt7 = report.source(DataSource::Ndt7).unwrap();
  assert_eq!(ndt7.merged, 0);
  assert_eq!(ndt7.duplicates(), 1);
  assert_eq!(uuids(&s).await, vec!["dup"]);
}

#[tokio::test]
async fn range_isolates_failing_dates() {
  let s = store().await;
  let sources = [FakeSource::new(DataSource::Ndt7)
    .with_day(day(13), vec![row("13", day(13), "Paris", "FR", loc("Paris", "FR"), 3215)])
    .with_day(day(14), vec![row("14", day(14), "Paris", "FR", loc("Paris", "FR"), 3215)])
    .with_day(day(15), vec![row("15", day(15), "Paris", "FR", loc("Paris", "FR"), 3215)])
    .failing_on(day(14))];
  let ctx = RunContext::new(today());
  let pipeline = Pipeline::new(&s, &sources, &ctx);

  let summary = pipeline.ingest_range(day(13), day(15)).await.unwrap();
  assert!(!summary.is_success());
  let merged: Vec<_> = summary.merged.iter().map(|r| r.date).collect();
  assert_eq!(merged, vec![day(15), day(13)]);
  assert_eq!(summary.failed.len(), 1);
  assert_eq!(summary.failed[0].0, day(14));
  assert!(matches!(
    summary.failed[0].1,
    telemerge_core::Error::UpstreamFetch { data_source: DataSource::Ndt7, .. }
  ));
  assert_eq!(s.processed_dates().await.unwrap(), vec![day(13), day(15)]);

  // A rerun skips the merged dates and retries the failed one.
  let rerun = pipeline.ingest_range(day(13), day(15)).await.unwrap();
  assert_eq!(rerun.skipped, vec![day(15), day(13)]);
  assert_eq!(rerun.failed.len(), 1);
}

#[tokio::test]
async fn range_rejects_reversed_bounds() {
  let s = store().await;
  let sources = [FakeSource::new(DataSource::Ndt7)];
  let ctx = RunContext::new(today());
  let err = Pipeline::new(&s, &sources, &ctx)
    .ingest_range(day(15), day(13))
    .await
    .unwrap_err();
  assert!(matches!(err, telemerge_core::Error::InvalidDateRange { .. }));
}

#[tokio::test]
async fn failed_merge_keeps_staging_and_ledger_unmarked() {
  let s = store().await;
  s.execute_batch("DROP TABLE unified_telemetry;").await.unwrap();

  let sources = [FakeSource::new(DataSource::Ndt7).with_day(day(15), vec![row(
    "a",
    day(15),
    "Paris",
    "FR",
    loc("Paris", "FR"),
    3215,
  )])];
  let ctx = RunContext::new(today());
  let err = Pipeline::new(&s, &sources, &ctx)
    .ingest_date(day(15))
    .await
    .unwrap_err();

  assert!(matches!(err, telemerge_core::Error::Store(_)));
  assert_eq!(s.staged_count(DataSource::Ndt7, day(15)).await.unwrap(), 1);
  assert!(!s.is_processed(day(15)).await.unwrap());
}

// ─── Allow-list and reference builds ─────────────────────────────────────────

#[tokio::test]
async fn fetch_uses_ranked_asns_plus_starlink() {
  let s = store().await;
  let sources = [FakeSource::new(DataSource::Ndt7)];

  let ctx = RunContext::new(today());
  Pipeline::new(&s, &sources, &ctx).ingest_date(day(15)).await.unwrap();

  let mut starlink_ctx = RunContext::new(today());
  starlink_ctx.starlink_only = true;
  Pipeline::new(&s, &sources, &starlink_ctx)
    .ingest_date(day(14))
    .await
    .unwrap();

  let seen = sources[0].seen_asns.lock().unwrap().clone();
  assert_eq!(seen, vec![
    AsnAllowList::new([2516, 3215, STARLINK_ASN]),
    AsnAllowList::starlink_only(),
  ]);
}

#[tokio::test]
async fn best_server_rebuild_is_repeatable() {
  let s = store().await;
  let sources = [FakeSource::new(DataSource::Ndt7)
    .with_sample(3215, "Paris", "FR", loc("Paris", "FR"), 5.0)
    .with_sample(3215, "Paris", "FR", loc("Berlin", "DE"), 50.0)
    .with_sample(STARLINK_ASN, "Paris", "FR", loc("London", "GB"), 30.0)];
  let ctx = RunContext::new(today());
  let pipeline = Pipeline::new(&s, &sources, &ctx);

  // City-level and country-level entries for each class.
  assert_eq!(pipeline.build_best_servers(march(), march()).await.unwrap(), 4);
  assert_eq!(pipeline.build_best_servers(march(), march()).await.unwrap(), 4);

  let stored = s.best_servers(DataSource::Ndt7, march()).await.unwrap();
  assert_eq!(stored.len(), 4);
  for e in &stored {
    let expected = match e.class {
      AsnClass::Terrestrial => loc("Paris", "FR"),
      AsnClass::Starlink => loc("London", "GB"),
    };
    assert_eq!(e.server, expected);
  }
}

#[tokio::test]
async fn starlink_countries_come_from_starlink_measurements() {
  let s = store().await;
  let sources = [
    FakeSource::new(DataSource::Ndt7)
      .with_sample(STARLINK_ASN, "Quito", "EC", loc("Miami", "US"), 40.0)
      .with_sample(3215, "Paris", "FR", loc("Paris", "FR"), 5.0),
    FakeSource::new(DataSource::Cloudflare)
      .with_sample(STARLINK_ASN, "Lima", "PE", ServerId::pop("LIM"), 35.0)
      .with_sample(STARLINK_ASN, "Quito", "EC", ServerId::pop("MIA"), 42.0),
  ];
  let ctx = RunContext::new(today());
  let pipeline = Pipeline::new(&s, &sources, &ctx);

  assert_eq!(pipeline.refresh_starlink_countries(day(1), day(31)).await.unwrap(), 2);
  // The seeded list is replaced; terrestrial-only FR is not kept.
  assert_eq!(s.starlink_countries().await.unwrap(), vec!["EC", "PE"]);

  let err = pipeline
    .refresh_starlink_countries(day(1), today())
    .await
    .unwrap_err();
  assert!(matches!(err, telemerge_core::Error::DateNotEligible { .. }));
}

#[tokio::test]
async fn starlink_countries_kept_when_range_has_no_starlink_rows() {
  let s = store().await;
  let sources = [FakeSource::new(DataSource::Ndt7).with_sample(
    3215,
    "Paris",
    "FR",
    loc("Paris", "FR"),
    5.0,
  )];
  let ctx = RunContext::new(today());
  let stored = Pipeline::new(&s, &sources, &ctx)
    .refresh_starlink_countries(day(1), day(31))
    .await
    .unwrap();
  assert_eq!(stored, 0);
  assert_eq!(s.starlink_countries().await.unwrap(), vec!["FR", "JP"]);
}
