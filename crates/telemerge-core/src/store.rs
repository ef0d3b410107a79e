//! The `TelemetryStore` trait.
//!
//! Implemented by storage backends (e.g. `telemerge-store-sqlite`). The
//! pipeline depends on this abstraction only. Backends do bulk reads and
//! writes; every decision about which rows survive is made by core code over
//! materialised rows.

use std::{future::Future, sync::Arc};

use chrono::NaiveDate;

use crate::{
  asn::{AsnClass, AsnRank},
  dates::Month,
  measurement::{DataSource, RawMeasurement},
  reconcile::{MergeReport, Reconciler},
  reference::{AirportMapping, BestServerEntry, GazetteerCity, ReferenceRows},
};

/// Result of [`TelemetryStore::merge_date`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
  Merged(MergeReport),
  /// Another run recorded the date first; only this run's staging was
  /// cleared.
  AlreadyClaimed,
}

/// Abstraction over a telemerge storage backend.
///
/// All methods return `Send` futures so the trait can be used from
/// multi-threaded tokio runtimes.
pub trait TelemetryStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Ledger ────────────────────────────────────────────────────────────

  fn is_processed(
    &self,
    date: NaiveDate,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  // ── Staging ───────────────────────────────────────────────────────────

  /// Park freshly fetched rows for `source` on `date`, replacing whatever a
  /// previous attempt left there. Returns the number of staged rows.
  fn stage(
    &self,
    source: DataSource,
    date: NaiveDate,
    rows: Vec<RawMeasurement>,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;

  // ── Best-server reference ─────────────────────────────────────────────

  /// Every entry of `source` for `period`, both ASN classes.
  fn best_servers(
    &self,
    source: DataSource,
    period: Month,
  ) -> impl Future<Output = Result<Vec<BestServerEntry>, Self::Error>> + Send + '_;

  /// Replace the entries of one (source, class, month) slice.
  fn replace_best_servers(
    &self,
    source: DataSource,
    class: AsnClass,
    period: Month,
    entries: Vec<BestServerEntry>,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;

  // ── Static reference ──────────────────────────────────────────────────

  fn gazetteer(&self) -> impl Future<Output = Result<Vec<GazetteerCity>, Self::Error>> + Send + '_;

  fn airport_mappings(
    &self,
  ) -> impl Future<Output = Result<Vec<AirportMapping>, Self::Error>> + Send + '_;

  fn asn_ranks(&self) -> impl Future<Output = Result<Vec<AsnRank>, Self::Error>> + Send + '_;

  fn starlink_countries(&self) -> impl Future<Output = Result<Vec<String>, Self::Error>> + Send + '_;

  /// Replace the table `rows` belongs to with `rows`.
  fn replace_reference(
    &self,
    rows: ReferenceRows,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;

  // ── Merge ─────────────────────────────────────────────────────────────

  /// Claim `date` in the ledger and merge the staged rows of `sources`, in a
  /// single transaction.
  ///
  /// For each source the staged rows are read, passed through
  /// `reconciler`, inserted into the unified store (existing uuids are left
  /// alone) and removed from staging. If the date is already in the ledger
  /// the staged rows of `sources` are discarded, nothing else is written,
  /// and [`MergeOutcome::AlreadyClaimed`] is returned. On error the
  /// transaction rolls back and staging keeps its rows.
  fn merge_date(
    &self,
    date: NaiveDate,
    sources: Vec<DataSource>,
    reconciler: Arc<Reconciler>,
  ) -> impl Future<Output = Result<MergeOutcome, Self::Error>> + Send + '_;
}
