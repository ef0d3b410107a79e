//! Geographic validity filter.
//!
//! A measurement is checked against the best-server entries of its own
//! source, ASN class and month, falling back from city to country granularity:
//!
//! 1. city-level entries exist for the client city: the server must be one of
//!    them;
//! 2. otherwise entries exist for the client country: the server must be one
//!    of them;
//! 3. otherwise there is no reference data and the row is kept.
//!
//! The raw client fields are used; canonicalization runs afterwards.

use std::collections::{HashMap, HashSet};

use crate::{
  asn::AsnClass,
  dates::Month,
  measurement::{RawMeasurement, ServerId},
  reference::BestServerEntry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
  City,
  Country,
}

/// The outcome of checking one measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
  Valid(Granularity),
  Dropped(Granularity),
  /// No reference data for this location, month and class.
  Unfiltered,
}

impl Verdict {
  pub fn keeps(self) -> bool { !matches!(self, Self::Dropped(_)) }
}

#[derive(Debug, Default)]
struct CountryReference {
  /// City-level entries, by client city.
  by_city: HashMap<String, HashSet<ServerId>>,
  /// Every entry for the country, city-level ones included.
  any:     HashSet<ServerId>,
}

/// Best-server entries for one source, indexed for per-row lookups.
#[derive(Debug, Default)]
pub struct ReferenceIndex {
  countries: HashMap<(AsnClass, Month, String), CountryReference>,
}

impl ReferenceIndex {
  pub fn new(entries: impl IntoIterator<Item = BestServerEntry>) -> Self {
    let mut countries: HashMap<(AsnClass, Month, String), CountryReference> = HashMap::new();
    for e in entries {
      let country = countries
        .entry((e.class, e.period, e.client_country))
        .or_default();
      if let Some(city) = e.client_city.filter(|c| !c.is_empty()) {
        country
          .by_city
          .entry(city)
          .or_default()
          .insert(e.server.clone());
      }
      country.any.insert(e.server);
    }
    Self { countries }
  }

  pub fn is_empty(&self) -> bool { self.countries.is_empty() }

  pub fn decide(&self, m: &RawMeasurement) -> Verdict {
    let key = (m.class(), m.period(), m.client_country.clone());
    let Some(country) = self.countries.get(&key) else {
      return Verdict::Unfiltered;
    };

    if let Some(servers) = m.client_city().and_then(|c| country.by_city.get(c)) {
      return if servers.contains(&m.server) {
        Verdict::Valid(Granularity::City)
      } else {
        Verdict::Dropped(Granularity::City)
      };
    }

    if country.any.contains(&m.server) {
      Verdict::Valid(Granularity::Country)
    } else {
      Verdict::Dropped(Granularity::Country)
    }
  }
}
