//! Per-date orchestration.
//!
//! A [`Pipeline`] borrows the store, the measurement sources and a
//! [`RunContext`] built once per invocation. Ingesting a date runs:
//!
//! ledger admission → fetch and stage every source → load references →
//! merge (ledger claim, reconcile, insert, clear staging) in one transaction.
//!
//! A date range walks newest to oldest and isolates failures per date.
//!
//! The same pipeline also rebuilds the data-derived references: best-server
//! tables and the list of countries with starlink measurements.

use std::{
  collections::{BTreeSet, HashSet},
  sync::Arc,
};

use chrono::{Days, NaiveDate, Utc};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
  Error, Result,
  airport::AirportIndex,
  asn::{AsnAllowList, AsnClass, DEFAULT_TOP_ASNS_PER_COUNTRY, top_asns},
  best_server::{self, BuilderParams},
  dates::{Month, ensure_eligible, newest_first},
  filter::ReferenceIndex,
  gazetteer::Gazetteer,
  ledger::{Admission, Ledger},
  measurement::{DataSource, RawMeasurement},
  reconcile::{MergeReport, Reconciler, StaticReference},
  reference::ReferenceRows,
  source::{LatencySource, MeasurementSource},
  store::{MergeOutcome, TelemetryStore},
};

// ─── Context ─────────────────────────────────────────────────────────────────

/// Parameters fixed for the lifetime of one invocation.
#[derive(Debug, Clone)]
pub struct RunContext {
  /// Correlates every log line of the run.
  pub run_id:               Uuid,
  /// The current UTC date; only earlier dates are eligible.
  pub today:                NaiveDate,
  /// Treat an already-processed date as a skip instead of an error.
  pub allow_skip:           bool,
  /// Fetch only the starlink ASN.
  pub starlink_only:        bool,
  pub builder:              BuilderParams,
  pub top_asns_per_country: usize,
}

impl RunContext {
  pub fn new(today: NaiveDate) -> Self {
    Self {
      run_id: Uuid::new_v4(),
      today,
      allow_skip: false,
      starlink_only: false,
      builder: BuilderParams::default(),
      top_asns_per_country: DEFAULT_TOP_ASNS_PER_COUNTRY,
    }
  }

  /// A context for a run starting now.
  pub fn now() -> Self { Self::new(Utc::now().date_naive()) }
}

// ─── Outcomes ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateOutcome {
  Merged(MergeReport),
  /// Already processed; nothing was fetched or written.
  Skipped,
}

/// What happened to each date of a range.
#[derive(Debug, Default)]
pub struct RangeSummary {
  pub merged:  Vec<MergeReport>,
  pub skipped: Vec<NaiveDate>,
  pub failed:  Vec<(NaiveDate, Error)>,
}

impl RangeSummary {
  pub fn is_success(&self) -> bool { self.failed.is_empty() }
}

/// Reference data shared by every date of a run.
struct Prepared {
  asns:    AsnAllowList,
  statics: Arc<StaticReference>,
}

// ─── Pipeline ────────────────────────────────────────────────────────────────

pub struct Pipeline<'a, S, M> {
  store:   &'a S,
  sources: &'a [M],
  ctx:     &'a RunContext,
}

impl<'a, S, M> Pipeline<'a, S, M>
where
  S: TelemetryStore,
  M: MeasurementSource,
{
  pub fn new(store: &'a S, sources: &'a [M], ctx: &'a RunContext) -> Self {
    Self { store, sources, ctx }
  }

  /// Ingest a single date.
  pub async fn ingest_date(&self, date: NaiveDate) -> Result<DateOutcome> {
    // Eligibility is checked before any store access.
    ensure_eligible(date, self.ctx.today)?;
    let prepared = self.prepare().await?;
    self
      .ingest(date, &prepared, self.ctx.allow_skip)
      .instrument(tracing::info_span!("ingest", run_id = %self.ctx.run_id, date = %date))
      .await
  }

  /// Ingest every date in `start..=end`, newest first.
  ///
  /// Already-processed dates are skipped. A failing date is recorded in the
  /// summary and the walk continues with the next one.
  pub async fn ingest_range(&self, start: NaiveDate, end: NaiveDate) -> Result<RangeSummary> {
    if start > end {
      return Err(Error::InvalidDateRange { start, end });
    }
    ensure_eligible(end, self.ctx.today)?;

    let prepared = self.prepare().await?;
    let mut summary = RangeSummary::default();
    for date in newest_first(start, end) {
      let span = tracing::info_span!("ingest", run_id = %self.ctx.run_id, date = %date);
      match self.ingest(date, &prepared, true).instrument(span).await {
        Ok(DateOutcome::Merged(report)) => summary.merged.push(report),
        Ok(DateOutcome::Skipped) => summary.skipped.push(date),
        Err(error) => {
          tracing::error!(%date, %error, "date failed; continuing with the next one");
          summary.failed.push((date, error));
        }
      }
    }

    tracing::info!(
      run_id = %self.ctx.run_id,
      merged = summary.merged.len(),
      skipped = summary.skipped.len(),
      failed = summary.failed.len(),
      "range finished"
    );
    Ok(summary)
  }

  async fn ingest(
    &self,
    date: NaiveDate,
    prepared: &Prepared,
    allow_skip: bool,
  ) -> Result<DateOutcome> {
    let admission = Ledger::new(self.store)
      .admit(date, allow_skip, self.ctx.today)
      .await?;
    if admission == Admission::Skip {
      tracing::warn!("date already processed; skipping");
      return Ok(DateOutcome::Skipped);
    }

    let mut months = BTreeSet::from([Month::from_date(date)]);
    for source in self.sources {
      let data_source = source.data_source();
      let rows = source
        .fetch(date, &prepared.asns)
        .await
        .map_err(|e| Error::UpstreamFetch { data_source, date, cause: Box::new(e) })?;
      months.extend(rows.iter().map(RawMeasurement::period));
      let staged = self
        .store
        .stage(data_source, date, rows)
        .await
        .map_err(Error::store)?;
      tracing::info!(source = %data_source, rows = staged, "staged");
    }

    let reconciler = self.reconciler(&months, prepared.statics.clone()).await?;
    let sources = data_sources(self.sources);
    let outcome = self
      .store
      .merge_date(date, sources, Arc::new(reconciler))
      .await
      .map_err(Error::store)?;

    match outcome {
      MergeOutcome::Merged(report) => {
        for s in &report.sources {
          tracing::info!(
            source = %s.source,
            staged = s.staged,
            dropped_city = s.dropped_city,
            dropped_country = s.dropped_country,
            unfiltered = s.unfiltered,
            canonicalized = s.canonicalized,
            unresolved = s.unresolved,
            merged = s.merged,
            "merged"
          );
        }
        Ok(DateOutcome::Merged(report))
      }
      // Another run claimed the date between admission and merge.
      MergeOutcome::AlreadyClaimed if allow_skip => Ok(DateOutcome::Skipped),
      MergeOutcome::AlreadyClaimed => Err(Error::AlreadyProcessed(date)),
    }
  }

  async fn prepare(&self) -> Result<Prepared> {
    let asns = self.allow_list().await?;
    let statics = Arc::new(self.static_reference().await?);
    Ok(Prepared { asns, statics })
  }

  /// The ASNs measurements are fetched for.
  pub async fn allow_list(&self) -> Result<AsnAllowList> {
    if self.ctx.starlink_only {
      return Ok(AsnAllowList::starlink_only());
    }
    let asns = self.ranked_asns(true).await?;
    if asns.len() <= 1 {
      tracing::warn!("no ranked ASNs available; fetching starlink only");
    }
    tracing::info!(asns = asns.len(), "allow-list ready");
    Ok(asns)
  }

  async fn ranked_asns(&self, include_starlink: bool) -> Result<AsnAllowList> {
    let ranks = self.store.asn_ranks().await.map_err(Error::store)?;
    let countries: HashSet<String> = self
      .store
      .starlink_countries()
      .await
      .map_err(Error::store)?
      .into_iter()
      .collect();
    Ok(top_asns(&ranks, &countries, self.ctx.top_asns_per_country, include_starlink))
  }

  async fn static_reference(&self) -> Result<StaticReference> {
    let gazetteer = Gazetteer::new(self.store.gazetteer().await.map_err(Error::store)?);
    let airports = AirportIndex::new(self.store.airport_mappings().await.map_err(Error::store)?);
    if gazetteer.is_empty() {
      tracing::warn!("gazetteer is empty; cities will not be canonicalized");
    }
    if airports.is_empty() && self.sources.iter().any(|s| s.data_source().identifies_servers_by_code()) {
      tracing::warn!("airport mapping is empty; code-identified servers will not merge");
    }
    Ok(StaticReference { gazetteer, airports })
  }

  async fn reconciler(
    &self,
    months: &BTreeSet<Month>,
    statics: Arc<StaticReference>,
  ) -> Result<Reconciler> {
    let mut reconciler = Reconciler::new(statics);
    for source in self.sources {
      let data_source = source.data_source();
      let mut entries = Vec::new();
      for &month in months {
        let found = self
          .store
          .best_servers(data_source, month)
          .await
          .map_err(Error::store)?;
        if found.is_empty() {
          tracing::warn!(source = %data_source, %month, "no best-server reference");
        }
        entries.extend(found);
      }
      reconciler = reconciler.with_reference(data_source, ReferenceIndex::new(entries));
    }
    Ok(reconciler)
  }
}

impl<S, M> Pipeline<'_, S, M>
where
  S: TelemetryStore,
  M: LatencySource,
{
  /// Rebuild the best-server tables of every source and class for each
  /// month in `from..=to`. Returns the number of entries written.
  ///
  /// Days of the current month that have not elapsed yet are left out of
  /// the training window.
  pub async fn build_best_servers(&self, from: Month, to: Month) -> Result<usize> {
    let Some(last_eligible) = self.ctx.today.checked_sub_days(Days::new(1)) else {
      return Ok(0);
    };
    let terrestrial = self.ranked_asns(false).await?;
    if terrestrial.is_empty() {
      tracing::warn!("no ranked ASNs available; terrestrial reference will not be built");
    }
    let starlink = AsnAllowList::starlink_only();

    let mut written = 0;
    for month in from.through(to) {
      let first = month.first_day();
      let last = month.last_day().min(last_eligible);
      if first > last {
        tracing::warn!(%month, "month has not started; skipped");
        continue;
      }

      for source in self.sources {
        let data_source = source.data_source();
        for class in AsnClass::ALL {
          let asns = match class {
            AsnClass::Starlink => &starlink,
            AsnClass::Terrestrial => &terrestrial,
          };
          if asns.is_empty() {
            continue;
          }
          let samples = source
            .latency_samples(first, last, asns)
            .await
            .map_err(|e| Error::UpstreamFetch { data_source, date: first, cause: Box::new(e) })?;
          let entries = best_server::build(&samples, month, class, &self.ctx.builder);
          let count = self
            .store
            .replace_best_servers(data_source, class, month, entries)
            .await
            .map_err(Error::store)?;
          tracing::info!(
            source = %data_source,
            %class,
            %month,
            samples = samples.len(),
            entries = count,
            "best-server reference rebuilt"
          );
          written += count;
        }
      }
    }
    Ok(written)
  }
}

impl<S, M> Pipeline<'_, S, M>
where
  S: TelemetryStore,
  M: LatencySource,
{
  /// Rebuild the starlink country list from the client countries of starlink
  /// measurements in `start..=end`, across every source. Returns the number
  /// of countries stored.
  ///
  /// An empty result leaves the stored list untouched.
  pub async fn refresh_starlink_countries(&self, start: NaiveDate, end: NaiveDate) -> Result<usize> {
    if start > end {
      return Err(Error::InvalidDateRange { start, end });
    }
    ensure_eligible(end, self.ctx.today)?;

    let starlink = AsnAllowList::starlink_only();
    let mut countries = BTreeSet::new();
    for source in self.sources {
      let data_source = source.data_source();
      let samples = source
        .latency_samples(start, end, &starlink)
        .await
        .map_err(|e| Error::UpstreamFetch { data_source, date: start, cause: Box::new(e) })?;
      let before = countries.len();
      countries.extend(
        samples
          .into_iter()
          .map(|s| s.client_country)
          .filter(|c| !c.is_empty()),
      );
      tracing::info!(source = %data_source, new = countries.len() - before, "starlink countries collected");
    }

    if countries.is_empty() {
      tracing::warn!(%start, %end, "no starlink measurements in range; country list kept");
      return Ok(0);
    }
    let rows = ReferenceRows::StarlinkCountries(countries.into_iter().collect());
    let stored = self.store.replace_reference(rows).await.map_err(Error::store)?;
    tracing::info!(%start, %end, countries = stored, "starlink countries refreshed");
    Ok(stored)
  }
}

/// Every source tag a pipeline over `sources` will merge.
pub fn data_sources<M: MeasurementSource>(sources: &[M]) -> Vec<DataSource> {
  sources.iter().map(MeasurementSource::data_source).collect()
}
