//! Error type for `telemerge-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// A stored value that does not decode into its domain type.
  #[error("invalid {column} value: {value:?}")]
  Decode {
    column: &'static str,
    value:  String,
  },

  /// A server identity of the wrong kind for the source's tables.
  #[error("{data_source} servers cannot be stored as {server}")]
  ServerKind {
    data_source: telemerge_core::measurement::DataSource,
    server:      String,
  },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
