//! Airport / PoP code resolution for code-identified servers.

use std::collections::HashMap;

use crate::{gazetteer::Gazetteer, reference::AirportMapping};

/// Rewrite each mapping's city to its gazetteer spelling, leaving unmatched
/// cities as they were.
pub fn canonicalize_mappings(
  mappings: Vec<AirportMapping>,
  gazetteer: &Gazetteer,
) -> Vec<AirportMapping> {
  mappings
    .into_iter()
    .map(|mut m| {
      if let Some(row) = gazetteer.lookup(&m.city, &m.country) {
        m.city = row.ascii_name.clone();
      }
      m
    })
    .collect()
}

/// Code → (city, country) lookup built from the stored airport table.
#[derive(Debug, Default)]
pub struct AirportIndex {
  by_code: HashMap<String, (String, String)>,
}

impl AirportIndex {
  pub fn new(mappings: Vec<AirportMapping>) -> Self {
    let by_code = mappings
      .into_iter()
      .map(|m| (m.code, (m.city, m.country)))
      .collect();
    Self { by_code }
  }

  /// Resolve `code` to `(city, country)`. `None` means the row will never
  /// reach the unified store.
  pub fn resolve(&self, code: &str) -> Option<(&str, &str)> {
    self
      .by_code
      .get(code)
      .map(|(city, country)| (city.as_str(), country.as_str()))
  }

  pub fn len(&self) -> usize { self.by_code.len() }

  pub fn is_empty(&self) -> bool { self.by_code.is_empty() }
}
