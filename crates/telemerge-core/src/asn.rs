//! ASN classification and allow-list selection.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// The well-known ASN of Starlink. Every other ASN is terrestrial.
pub const STARLINK_ASN: u32 = 14593;

/// Default number of top-ranked ASNs kept per country.
pub const DEFAULT_TOP_ASNS_PER_COUNTRY: usize = 5;

// ─── Class ───────────────────────────────────────────────────────────────────

/// Partition key for best-server reference data.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AsnClass {
  Starlink,
  Terrestrial,
}

impl AsnClass {
  pub const ALL: [Self; 2] = [Self::Terrestrial, Self::Starlink];

  pub fn classify(asn: u32) -> Self {
    if asn == STARLINK_ASN { Self::Starlink } else { Self::Terrestrial }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Starlink => "starlink",
      Self::Terrestrial => "terrestrial",
    }
  }
}

impl fmt::Display for AsnClass {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

// ─── Allow-list ──────────────────────────────────────────────────────────────

/// A sorted, de-duplicated set of ASNs a source query is restricted to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AsnAllowList(BTreeSet<u32>);

impl AsnAllowList {
  pub fn new(asns: impl IntoIterator<Item = u32>) -> Self {
    Self(asns.into_iter().collect())
  }

  pub fn starlink_only() -> Self { Self::new([STARLINK_ASN]) }

  pub fn contains(&self, asn: u32) -> bool { self.0.contains(&asn) }

  pub fn is_empty(&self) -> bool { self.0.is_empty() }

  pub fn len(&self) -> usize { self.0.len() }

  pub fn iter(&self) -> impl Iterator<Item = u32> + '_ { self.0.iter().copied() }

  /// Comma-joined numeric identifiers, the form warehouse queries expect.
  pub fn to_csv(&self) -> String {
    self
      .0
      .iter()
      .map(u32::to_string)
      .collect::<Vec<_>>()
      .join(",")
  }
}

// ─── Ranking ─────────────────────────────────────────────────────────────────

/// One row of the ASN ranking reference table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsnRank {
  pub asn:          u32,
  pub name:         Option<String>,
  pub rank:         Option<u64>,
  pub country_code: Option<String>,
  pub country_name: Option<String>,
}

/// Select the `per_country` best-ranked ASNs of every country that has seen
/// Starlink measurements.
///
/// Ties share a rank, so a country may contribute more than `per_country`
/// ASNs. Unranked ASNs are never selected. Starlink itself is added when
/// `include_starlink` is set, and removed otherwise.
pub fn top_asns(
  ranks: &[AsnRank],
  starlink_countries: &HashSet<String>,
  per_country: usize,
  include_starlink: bool,
) -> AsnAllowList {
  let mut by_country: BTreeMap<&str, Vec<(u64, u32)>> = BTreeMap::new();
  for r in ranks {
    let (Some(country), Some(rank)) = (r.country_code.as_deref(), r.rank) else {
      continue;
    };
    if starlink_countries.contains(country) {
      by_country.entry(country).or_default().push((rank, r.asn));
    }
  }

  let mut selected = BTreeSet::new();
  for rows in by_country.values_mut() {
    rows.sort_unstable();
    // Competition ranking: position of the first row sharing this rank.
    let mut position = 0;
    let mut last_rank = None;
    for (i, (rank, asn)) in rows.iter().enumerate() {
      if last_rank != Some(*rank) {
        position = i + 1;
        last_rank = Some(*rank);
      }
      if position > per_country {
        break;
      }
      selected.insert(*asn);
    }
  }

  if include_starlink {
    selected.insert(STARLINK_ASN);
  } else {
    selected.remove(&STARLINK_ASN);
  }
  AsnAllowList(selected)
}
