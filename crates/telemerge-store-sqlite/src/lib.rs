//! SQLite backend for the telemerge pipeline.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime.

mod encode;
mod store;

pub mod error;
pub mod registry;

pub use error::{Error, Result};
pub use registry::{TABLES, TableId, TableSpec};
pub use store::SqliteStore;

#[cfg(test)]
mod tests;
