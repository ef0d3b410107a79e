//! Processed-date ledger admission.
//!
//! The ledger only decides whether a date may start. Recording the date
//! happens inside the merge transaction (see
//! [`TelemetryStore::merge_date`]), so a date is marked processed if and only
//! if its merge committed.

use chrono::NaiveDate;

use crate::{
  Error, Result,
  dates::ensure_eligible,
  store::TelemetryStore,
};

/// Whether a date should be ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
  Admit,
  /// Already processed and the caller asked to skip such dates.
  Skip,
}

pub struct Ledger<'a, S> {
  store: &'a S,
}

impl<'a, S: TelemetryStore> Ledger<'a, S> {
  pub fn new(store: &'a S) -> Self { Self { store } }

  /// Check `date` before any fetching happens.
  ///
  /// Eligibility is checked first and without touching the store. A date
  /// already in the ledger fails with [`Error::AlreadyProcessed`] unless
  /// `allow_skip` is set, in which case [`Admission::Skip`] is returned.
  pub async fn admit(
    &self,
    date: NaiveDate,
    allow_skip: bool,
    today: NaiveDate,
  ) -> Result<Admission> {
    ensure_eligible(date, today)?;
    let processed = self.store.is_processed(date).await.map_err(Error::store)?;
    match (processed, allow_skip) {
      (false, _) => Ok(Admission::Admit),
      (true, true) => Ok(Admission::Skip),
      (true, false) => Err(Error::AlreadyProcessed(date)),
    }
  }
}
