//! Best-server reference builder.
//!
//! For every client location observed in a training window, keep every server
//! whose latency falls at or below a low percentile of that location's
//! latencies. Keeping all near-threshold servers instead of a single arg-min
//! absorbs outliers and servers that flap between adjacent months.
//!
//! Two granularities are produced from the same samples: city-level groups
//! keyed by (client_city, client_country), and country-level groups keyed by
//! client_country alone.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  asn::AsnClass,
  dates::Month,
  measurement::ServerId,
  reference::BestServerEntry,
};

/// Default latency quantile used as the per-group threshold.
pub const DEFAULT_QUANTILE: f64 = 0.01;

// ─── Parameters ──────────────────────────────────────────────────────────────

/// Which directions must be at or below their threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Qualify {
  #[default]
  Either,
  Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BuilderParams {
  quantile: f64,
  qualify:  Qualify,
}

impl BuilderParams {
  pub fn new(quantile: f64, qualify: Qualify) -> Result<Self> {
    if !(0.0..=1.0).contains(&quantile) {
      return Err(Error::InvalidQuantile(quantile));
    }
    Ok(Self { quantile, qualify })
  }

  pub fn quantile(&self) -> f64 { self.quantile }

  pub fn qualify(&self) -> Qualify { self.qualify }
}

impl Default for BuilderParams {
  fn default() -> Self {
    Self { quantile: DEFAULT_QUANTILE, qualify: Qualify::Either }
  }
}

// ─── Samples ─────────────────────────────────────────────────────────────────

/// One observation returned by a latency source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySample {
  pub client_city:         Option<String>,
  pub client_country:      String,
  pub server:              ServerId,
  pub download_latency_ms: Option<f64>,
  pub upload_latency_ms:   Option<f64>,
}

/// Latencies that can take part in a threshold: present and positive.
fn usable(latency: Option<f64>) -> Option<f64> {
  latency.filter(|l| l.is_finite() && *l > 0.0)
}

/// Discrete percentile: the smallest observed value with at least `q` of the
/// observations at or below it.
pub fn percentile_disc(values: &mut [f64], q: f64) -> Option<f64> {
  if values.is_empty() {
    return None;
  }
  values.sort_unstable_by(f64::total_cmp);
  let rank = (q * values.len() as f64).ceil() as usize;
  Some(values[rank.saturating_sub(1).min(values.len() - 1)])
}

// ─── Builder ─────────────────────────────────────────────────────────────────

/// Compute best-server entries for one source, class and month.
///
/// The output is sorted and free of duplicates. Samples from other classes
/// must already have been excluded by the caller's ASN allow-list.
pub fn build(
  samples: &[LatencySample],
  period: Month,
  class: AsnClass,
  params: &BuilderParams,
) -> Vec<BestServerEntry> {
  let mut groups: BTreeMap<(Option<&str>, &str), Vec<&LatencySample>> = BTreeMap::new();
  for s in samples {
    if s.client_country.is_empty() {
      continue;
    }
    if usable(s.download_latency_ms).is_none() && usable(s.upload_latency_ms).is_none() {
      continue;
    }
    if let Some(city) = s.client_city.as_deref().filter(|c| !c.is_empty()) {
      groups
        .entry((Some(city), s.client_country.as_str()))
        .or_default()
        .push(s);
    }
    groups
      .entry((None, s.client_country.as_str()))
      .or_default()
      .push(s);
  }

  let mut entries = Vec::new();
  for ((city, country), group) in groups {
    for server in best_of_group(&group, params) {
      entries.push(BestServerEntry {
        client_city: city.map(str::to_owned),
        client_country: country.to_owned(),
        server,
        period,
        class,
      });
    }
  }
  entries
}

fn best_of_group(group: &[&LatencySample], params: &BuilderParams) -> BTreeSet<ServerId> {
  let mut down: Vec<f64> = group.iter().filter_map(|s| usable(s.download_latency_ms)).collect();
  let mut up: Vec<f64> = group.iter().filter_map(|s| usable(s.upload_latency_ms)).collect();
  let down_threshold = percentile_disc(&mut down, params.quantile);
  let up_threshold = percentile_disc(&mut up, params.quantile);

  let within = |latency: Option<f64>, threshold: Option<f64>| match (usable(latency), threshold) {
    (Some(l), Some(t)) => l <= t,
    _ => false,
  };

  group
    .iter()
    .filter(|s| {
      let d = within(s.download_latency_ms, down_threshold);
      let u = within(s.upload_latency_ms, up_threshold);
      match params.qualify {
        Qualify::Either => d || u,
        Qualify::Both => d && u,
      }
    })
    .map(|s| s.server.clone())
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample(city: Option<&str>, country: &str, server: ServerId, down: Option<f64>, up: Option<f64>) -> LatencySample {
    LatencySample {
      client_city: city.map(str::to_owned),
      client_country: country.into(),
      server,
      download_latency_ms: down,
      upload_latency_ms: up,
    }
  }

  fn march() -> Month { Month::new(2024, 3).unwrap() }

  #[test]
  fn percentile_disc_nearest_rank() {
    let mut values: Vec<f64> = (1..=200).map(f64::from).collect();
    assert_eq!(percentile_disc(&mut values, 0.01), Some(2.0));
    assert_eq!(percentile_disc(&mut values, 0.0), Some(1.0));
    assert_eq!(percentile_disc(&mut values, 1.0), Some(200.0));
    assert_eq!(percentile_disc(&mut [], 0.5), None);
  }

  #[test]
  fn either_direction_qualifies() {
    let samples = vec![
      sample(Some("Paris"), "FR", ServerId::location("Paris", "FR"), Some(5.0), Some(50.0)),
      sample(Some("Paris"), "FR", ServerId::location("London", "GB"), Some(40.0), Some(6.0)),
      sample(Some("Paris"), "FR", ServerId::location("Berlin", "DE"), Some(30.0), Some(30.0)),
    ];
    let entries = build(&samples, march(), AsnClass::Terrestrial, &BuilderParams::default());

    let city_servers: Vec<_> = entries
      .iter()
      .filter(|e| e.client_city.as_deref() == Some("Paris"))
      .map(|e| e.server.clone())
      .collect();
    assert_eq!(city_servers, vec![
      ServerId::location("London", "GB"),
      ServerId::location("Paris", "FR"),
    ]);
  }

  #[test]
  fn both_directions_rule_is_stricter() {
    let samples = vec![
      sample(Some("Paris"), "FR", ServerId::location("Paris", "FR"), Some(5.0), Some(50.0)),
      sample(Some("Paris"), "FR", ServerId::location("London", "GB"), Some(5.0), Some(6.0)),
    ];
    let params = BuilderParams::new(0.01, Qualify::Both).unwrap();
    let entries = build(&samples, march(), AsnClass::Terrestrial, &params);
    assert!(entries.iter().all(|e| e.server == ServerId::location("London", "GB")));
  }

  #[test]
  fn near_threshold_servers_all_kept() {
    let mut samples: Vec<_> = (0..99)
      .map(|i| sample(Some("Lyon"), "FR", ServerId::pop("LYS"), Some(20.0 + f64::from(i)), None))
      .collect();
    samples.push(sample(Some("Lyon"), "FR", ServerId::pop("MRS"), Some(20.0), None));
    let params = BuilderParams::new(0.02, Qualify::Either).unwrap();

    let entries = build(&samples, march(), AsnClass::Starlink, &params);
    let lyon: BTreeSet<_> = entries
      .iter()
      .filter(|e| e.client_city.is_some())
      .map(|e| e.server.clone())
      .collect();
    assert_eq!(lyon, [ServerId::pop("LYS"), ServerId::pop("MRS")].into());
    assert!(entries.iter().all(|e| e.class == AsnClass::Starlink));
  }

  #[test]
  fn country_level_entries_cover_cityless_samples() {
    let samples = vec![
      sample(None, "JP", ServerId::location("Osaka", "JP"), Some(3.0), None),
      sample(Some("Tokyo"), "JP", ServerId::location("Nagoya", "JP"), Some(9.0), None),
    ];
    let entries = build(&samples, march(), AsnClass::Terrestrial, &BuilderParams::default());

    let country: Vec<_> = entries.iter().filter(|e| e.client_city.is_none()).collect();
    assert_eq!(country.len(), 1);
    assert_eq!(country[0].server, ServerId::location("Osaka", "JP"));

    let tokyo: Vec<_> = entries
      .iter()
      .filter(|e| e.client_city.as_deref() == Some("Tokyo"))
      .collect();
    assert_eq!(tokyo.len(), 1);
    assert_eq!(tokyo[0].server, ServerId::location("Nagoya", "JP"));
  }

  #[test]
  fn non_positive_latencies_ignored() {
    let samples = vec![
      sample(Some("Oslo"), "NO", ServerId::pop("OSL"), Some(0.0), None),
      sample(Some("Oslo"), "NO", ServerId::pop("ARN"), Some(12.0), None),
    ];
    let entries = build(&samples, march(), AsnClass::Terrestrial, &BuilderParams::default());
    assert!(entries.iter().all(|e| e.server == ServerId::pop("ARN")));
    assert!(!entries.is_empty());
  }

  #[test]
  fn quantile_out_of_range_rejected() {
    assert!(matches!(
      BuilderParams::new(1.5, Qualify::Either),
      Err(Error::InvalidQuantile(_))
    ));
  }
}
