//! Runtime settings: an optional TOML file layered with `TELEMERGE_*`
//! environment variables.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::Deserialize;
use telemerge_core::{
  asn::DEFAULT_TOP_ASNS_PER_COUNTRY,
  best_server::{BuilderParams, DEFAULT_QUANTILE, Qualify},
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
  /// SQLite database file.
  pub store_path:           PathBuf,
  /// Root of the `<source>/<yyyy-mm-dd>.jsonl` measurement tree.
  pub measurements_dir:     PathBuf,
  /// Directory holding the reference files named in the table registry.
  pub reference_dir:        PathBuf,
  pub best_servers:         BestServerSettings,
  pub top_asns_per_country: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BestServerSettings {
  /// Latency quantile used as the per-location threshold.
  pub percentile: f64,
  pub qualify:    Qualify,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      store_path:           PathBuf::from("telemerge.db"),
      measurements_dir:     PathBuf::from("data/measurements"),
      reference_dir:        PathBuf::from("data/reference"),
      best_servers:         BestServerSettings::default(),
      top_asns_per_country: DEFAULT_TOP_ASNS_PER_COUNTRY,
    }
  }
}

impl Default for BestServerSettings {
  fn default() -> Self {
    Self { percentile: DEFAULT_QUANTILE, qualify: Qualify::default() }
  }
}

impl Settings {
  /// Read `path` if it exists, then apply environment overrides such as
  /// `TELEMERGE_STORE_PATH` or `TELEMERGE_BEST_SERVERS__PERCENTILE`.
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let builder = config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(
        config::Environment::with_prefix("TELEMERGE")
          .prefix_separator("_")
          .separator("__")
          .try_parsing(true),
      );
    Self::build(builder)
  }

  fn build(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
  ) -> anyhow::Result<Self> {
    builder
      .build()
      .context("failed to read config file")?
      .try_deserialize()
      .context("failed to deserialise Settings")
  }

  pub fn builder_params(&self) -> telemerge_core::Result<BuilderParams> {
    BuilderParams::new(self.best_servers.percentile, self.best_servers.qualify)
  }
}
