//! City canonicalization against the gazetteer.
//!
//! A reported city matches a gazetteer row when the country codes are equal
//! and the city equals the row's name, ascii name or one of its aliases,
//! exactly and case-sensitively. When several rows match, the most populous
//! wins, then the lexicographically smallest ascii name, so the choice never
//! depends on load order.

use std::collections::HashMap;

use crate::{
  measurement::{RawMeasurement, ServerId},
  reference::GazetteerCity,
};

pub struct Gazetteer {
  cities: Vec<GazetteerCity>,
  /// (country, spelling) -> index of the winning row in `cities`.
  index:  HashMap<(String, String), usize>,
}

impl Gazetteer {
  pub fn new(cities: Vec<GazetteerCity>) -> Self {
    let mut index: HashMap<(String, String), usize> = HashMap::new();
    for (i, city) in cities.iter().enumerate() {
      for spelling in city.spellings() {
        let key = (city.country_code.clone(), spelling.to_owned());
        let replace = index
          .get(&key)
          .is_none_or(|&current| outranks(city, &cities[current]));
        if replace {
          index.insert(key, i);
        }
      }
    }
    Self { cities, index }
  }

  pub fn is_empty(&self) -> bool { self.cities.is_empty() }

  pub fn len(&self) -> usize { self.cities.len() }

  /// Find the canonical row for `city` in `country`.
  pub fn lookup(&self, city: &str, country: &str) -> Option<&GazetteerCity> {
    if city.is_empty() {
      return None;
    }
    self
      .index
      .get(&(country.to_owned(), city.to_owned()))
      .map(|&i| &self.cities[i])
  }

  /// Rewrite the client city and region of `m` in place.
  ///
  /// Returns `true` when a gazetteer row matched. Rows without a city or
  /// without a match are left untouched.
  pub fn canonicalize_client(&self, m: &mut RawMeasurement) -> bool {
    let Some(city) = m.client_city() else { return false };
    let Some(row) = self.lookup(city, &m.client_country) else {
      return false;
    };
    m.client_city = Some(row.ascii_name.clone());
    m.client_region = Some(row.region.clone());
    true
  }

  /// Rewrite a city-identified server in place. Code-identified servers are
  /// left to the airport resolver.
  pub fn canonicalize_server(&self, server: &mut ServerId) -> bool {
    let ServerId::Location { city, country } = server else {
      return false;
    };
    match self.lookup(city, country) {
      Some(row) => {
        *city = row.ascii_name.clone();
        true
      }
      None => false,
    }
  }
}

/// Tie-break between two rows answering to the same spelling.
fn outranks(candidate: &GazetteerCity, current: &GazetteerCity) -> bool {
  candidate.population > current.population
    || (candidate.population == current.population
      && candidate.ascii_name < current.ascii_name)
}

#[cfg(test)]
mod tests {
  use chrono::{TimeZone, Utc};

  use super::*;
  use crate::measurement::Metrics;

  fn city(name: &str, ascii: &str, aliases: &[&str], region: &str, cc: &str, pop: u64) -> GazetteerCity {
    GazetteerCity {
      name:         name.into(),
      ascii_name:   ascii.into(),
      aliases:      aliases.iter().map(|a| (*a).to_owned()).collect(),
      region:       region.into(),
      country_code: cc.into(),
      population:   pop,
    }
  }

  fn measurement(city: Option<&str>, country: &str) -> RawMeasurement {
    RawMeasurement {
      uuid:           "m-1".into(),
      test_time:      Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap(),
      client_city:    city.map(str::to_owned),
      client_region:  Some("raw region".into()),
      client_country: country.into(),
      server:         ServerId::location("Paris", "FR"),
      asn:            3215,
      metrics:        Metrics::default(),
    }
  }

  fn gazetteer() -> Gazetteer {
    Gazetteer::new(vec![
      city("Zürich", "Zurich", &["Zuerich", "Zurigo"], "Zurich", "CH", 341_730),
      city("München", "Munich", &["Muenchen"], "Bavaria", "DE", 1_260_391),
      city("Springfield", "Springfield", &[], "Illinois", "US", 116_250),
      city("Springfield", "Springfield", &[], "Massachusetts", "US", 155_929),
    ])
  }

  #[test]
  fn alias_rewrites_city_and_region() {
    let g = gazetteer();
    let mut m = measurement(Some("Zuerich"), "CH");
    assert!(g.canonicalize_client(&mut m));
    assert_eq!(m.client_city.as_deref(), Some("Zurich"));
    assert_eq!(m.client_region.as_deref(), Some("Zurich"));
  }

  #[test]
  fn match_is_case_sensitive_and_country_scoped() {
    let g = gazetteer();
    let mut lower = measurement(Some("zuerich"), "CH");
    assert!(!g.canonicalize_client(&mut lower));
    assert_eq!(lower.client_city.as_deref(), Some("zuerich"));

    let mut wrong_country = measurement(Some("Zuerich"), "DE");
    assert!(!g.canonicalize_client(&mut wrong_country));
    assert_eq!(wrong_country.client_region.as_deref(), Some("raw region"));
  }

  #[test]
  fn empty_or_missing_city_passes_through() {
    let g = gazetteer();
    let mut none = measurement(None, "CH");
    let mut empty = measurement(Some(""), "CH");
    assert!(!g.canonicalize_client(&mut none));
    assert!(!g.canonicalize_client(&mut empty));
    assert_eq!(empty.client_city.as_deref(), Some(""));
  }

  #[test]
  fn canonical_name_is_a_fixed_point() {
    let g = gazetteer();
    let mut m = measurement(Some("München"), "DE");
    assert!(g.canonicalize_client(&mut m));
    let once = m.clone();
    assert!(g.canonicalize_client(&mut m));
    assert_eq!(m, once);
    assert_eq!(m.client_city.as_deref(), Some("Munich"));
  }

  #[test]
  fn tie_break_prefers_population() {
    let g = gazetteer();
    let mut m = measurement(Some("Springfield"), "US");
    assert!(g.canonicalize_client(&mut m));
    assert_eq!(m.client_region.as_deref(), Some("Massachusetts"));

    // Same answer regardless of insertion order.
    let reversed = Gazetteer::new(vec![
      city("Springfield", "Springfield", &[], "Massachusetts", "US", 155_929),
      city("Springfield", "Springfield", &[], "Illinois", "US", 116_250),
    ]);
    assert_eq!(
      reversed.lookup("Springfield", "US").map(|c| c.region.as_str()),
      Some("Massachusetts")
    );
  }

  #[test]
  fn server_city_rewritten_without_region() {
    let g = gazetteer();
    let mut server = ServerId::location("Muenchen", "DE");
    assert!(g.canonicalize_server(&mut server));
    assert_eq!(server, ServerId::location("Munich", "DE"));

    let mut pop = ServerId::pop("MUC");
    assert!(!g.canonicalize_server(&mut pop));
  }
}
