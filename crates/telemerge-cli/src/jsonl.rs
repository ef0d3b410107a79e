//! JSON-lines measurement adapter.
//!
//! Each source keeps one file per UTC day under
//! `<root>/<source>/<yyyy-mm-dd>.jsonl`, one [`RawMeasurement`] per line.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use telemerge_core::{
  asn::AsnAllowList,
  best_server::LatencySample,
  dates::{format_date, newest_first},
  measurement::{DataSource, RawMeasurement},
  source::{LatencySource, MeasurementSource},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JsonlError {
  #[error("{}: {source}", path.display())]
  Io {
    path:   PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("{}:{line}: {source}", path.display())]
  Parse {
    path:   PathBuf,
    line:   usize,
    #[source]
    source: serde_json::Error,
  },
}

pub struct JsonlSource {
  data_source: DataSource,
  dir:         PathBuf,
}

impl JsonlSource {
  pub fn new(root: &Path, data_source: DataSource) -> Self {
    Self { data_source, dir: root.join(data_source.as_str()) }
  }

  /// One adapter per known source.
  pub fn all(root: &Path) -> Vec<Self> {
    DataSource::ALL.into_iter().map(|s| Self::new(root, s)).collect()
  }

  fn path(&self, date: NaiveDate) -> PathBuf {
    self.dir.join(format!("{}.jsonl", format_date(date)))
  }

  /// Rows of one day restricted to `asns`. `Ok(None)` when the file does not
  /// exist.
  async fn read_day(
    &self,
    date: NaiveDate,
    asns: &AsnAllowList,
  ) -> Result<Option<Vec<RawMeasurement>>, JsonlError> {
    let path = self.path(date);
    let contents = match tokio::fs::read_to_string(&path).await {
      Ok(contents) => contents,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
      Err(source) => return Err(JsonlError::Io { path, source }),
    };

    let mut rows = Vec::new();
    for (i, line) in contents.lines().enumerate() {
      if line.trim().is_empty() {
        continue;
      }
      let m: RawMeasurement = serde_json::from_str(line).map_err(|source| JsonlError::Parse {
        path: path.clone(),
        line: i + 1,
        source,
      })?;
      if asns.contains(m.asn) {
        rows.push(m);
      }
    }
    Ok(Some(rows))
  }
}

impl MeasurementSource for JsonlSource {
  type Error = JsonlError;

  fn data_source(&self) -> DataSource { self.data_source }

  /// A missing day file is an upstream failure: the day cannot be ingested.
  async fn fetch<'a>(
    &'a self,
    date: NaiveDate,
    asns: &'a AsnAllowList,
  ) -> Result<Vec<RawMeasurement>, JsonlError> {
    let rows = self.read_day(date, asns).await?;
    rows.ok_or_else(|| JsonlError::Io {
      path:   self.path(date),
      source: std::io::ErrorKind::NotFound.into(),
    })
  }
}

impl LatencySource for JsonlSource {
  /// Missing days inside the window are skipped.
  async fn latency_samples<'a>(
    &'a self,
    from: NaiveDate,
    to: NaiveDate,
    asns: &'a AsnAllowList,
  ) -> Result<Vec<LatencySample>, JsonlError> {
    let mut samples = Vec::new();
    for date in newest_first(from, to) {
      let Some(rows) = self.read_day(date, asns).await? else {
        tracing::debug!(source = %self.data_source, %date, "no measurements for day");
        continue;
      };
      samples.extend(rows.into_iter().map(|m| LatencySample {
        client_city:         m.client_city().map(str::to_owned),
        client_country:      m.client_country,
        server:              m.server,
        download_latency_ms: m.metrics.download_latency_ms.map(|l| l as f64),
        upload_latency_ms:   m.metrics.upload_latency_ms.map(|l| l as f64),
      }));
    }
    Ok(samples)
  }
}
