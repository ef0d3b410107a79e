//! Error types for `telemerge-core`.

use chrono::NaiveDate;
use thiserror::Error;

use crate::measurement::DataSource;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
  /// The day has not fully elapsed in UTC yet.
  #[error("date {date} is not eligible: only dates before {today} (UTC) can be processed")]
  DateNotEligible { date: NaiveDate, today: NaiveDate },

  #[error("date {0} has already been processed")]
  AlreadyProcessed(NaiveDate),

  #[error("invalid date range: {start} to {end}")]
  InvalidDateRange { start: NaiveDate, end: NaiveDate },

  #[error("invalid date {0:?}: expected yyyy-mm-dd")]
  DateFormat(String),

  #[error("invalid month {0:?}: expected yyyy-mm")]
  MonthFormat(String),

  #[error("failed to fetch {data_source} measurements for {date}: {cause}")]
  UpstreamFetch {
    data_source: DataSource,
    date:        NaiveDate,
    #[source]
    cause:       BoxError,
  },

  #[error("store error: {0}")]
  Store(#[source] BoxError),

  #[error("{file}:{line}: {reason}")]
  Reference {
    file:   String,
    line:   usize,
    reason: String,
  },

  #[error("percentile must lie within 0..=1, got {0}")]
  InvalidQuantile(f64),
}

impl Error {
  /// Box an arbitrary backend error into [`Error::Store`].
  pub fn store<E>(err: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Store(Box::new(err))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
