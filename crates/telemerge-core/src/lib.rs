//! Core types and reconciliation logic for the telemerge pipeline.
//!
//! This crate is free of database and I/O dependencies. Storage
//! backends implement [`store::TelemetryStore`]; probe adapters implement the
//! traits in [`source`]. Everything that decides which rows survive a merge
//! lives here and operates on materialised rows.

pub mod airport;
pub mod asn;
pub mod best_server;
pub mod dates;
pub mod error;
pub mod filter;
pub mod gazetteer;
pub mod ledger;
pub mod measurement;
pub mod pipeline;
pub mod reconcile;
pub mod reference;
pub mod source;
pub mod store;

pub use error::{Error, Result};
