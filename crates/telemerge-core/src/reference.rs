//! Static reference data: gazetteer, airport codes, ASN ranks and the list of
//! countries with Starlink measurements.
//!
//! Each kind of reference table is described by a [`ReferenceSpec`] in
//! [`REFERENCES`]: the files it is loaded from, the parser that turns those
//! files into rows, and (through [`refresh`]) the store call that replaces the
//! table. Callers iterate the registry instead of naming tables one by one.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  airport::canonicalize_mappings,
  asn::{AsnClass, AsnRank},
  dates::Month,
  gazetteer::Gazetteer,
  measurement::ServerId,
  store::TelemetryStore,
};

/// Number of alternate names kept per gazetteer city.
pub const MAX_ALIASES: usize = 4;

// ─── Rows ────────────────────────────────────────────────────────────────────

/// One canonical city.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GazetteerCity {
  pub name:         String,
  /// Canonical spelling written back into measurements.
  pub ascii_name:   String,
  /// At most [`MAX_ALIASES`] alternate spellings.
  pub aliases:      Vec<String>,
  pub region:       String,
  pub country_code: String,
  pub population:   u64,
}

impl GazetteerCity {
  /// Every spelling this row answers to.
  pub fn spellings(&self) -> impl Iterator<Item = &str> {
    [self.name.as_str(), self.ascii_name.as_str()]
      .into_iter()
      .chain(self.aliases.iter().map(String::as_str))
      .filter(|s| !s.is_empty())
  }
}

/// An airport / PoP code and the city it serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AirportMapping {
  pub code:    String,
  pub city:    String,
  pub country: String,
}

/// A server that was latency-optimal for a client location in one month.
///
/// `client_city == None` marks a country-level entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BestServerEntry {
  pub client_city:    Option<String>,
  pub client_country: String,
  pub server:         ServerId,
  pub period:         Month,
  pub class:          AsnClass,
}

// ─── Registry ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
  Gazetteer,
  Airports,
  AsnRanks,
  StarlinkCountries,
}

/// Parsed contents of one reference table, ready to replace the stored copy.
#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceRows {
  Gazetteer(Vec<GazetteerCity>),
  Airports(Vec<AirportMapping>),
  AsnRanks(Vec<AsnRank>),
  StarlinkCountries(Vec<String>),
}

impl ReferenceRows {
  pub fn len(&self) -> usize {
    match self {
      Self::Gazetteer(rows) => rows.len(),
      Self::Airports(rows) => rows.len(),
      Self::AsnRanks(rows) => rows.len(),
      Self::StarlinkCountries(rows) => rows.len(),
    }
  }

  pub fn is_empty(&self) -> bool { self.len() == 0 }
}

/// A file handed to a loader: its name (for error messages) and contents.
pub struct SourceFile<'a> {
  pub name:     &'a str,
  pub contents: &'a str,
}

pub struct ReferenceSpec {
  pub kind:  ReferenceKind,
  /// Name used on the command line.
  pub name:  &'static str,
  /// Input files, in the order the loader expects them.
  pub files: &'static [&'static str],
  pub load:  fn(&[SourceFile<'_>]) -> Result<ReferenceRows>,
}

/// Every reference table. The gazetteer precedes airports because airport
/// cities are canonicalized against it during refresh.
pub static REFERENCES: [ReferenceSpec; 4] = [
  ReferenceSpec {
    kind:  ReferenceKind::Gazetteer,
    name:  "gazetteer",
    files: &["cities15000.txt", "admin1CodesASCII.txt"],
    load:  load_gazetteer,
  },
  ReferenceSpec {
    kind:  ReferenceKind::Airports,
    name:  "airports",
    files: &["airport-codes.tsv"],
    load:  load_airports,
  },
  ReferenceSpec {
    kind:  ReferenceKind::AsnRanks,
    name:  "asns",
    files: &["asns.tsv"],
    load:  load_asn_ranks,
  },
  ReferenceSpec {
    kind:  ReferenceKind::StarlinkCountries,
    name:  "starlink-countries",
    files: &["starlink-countries.txt"],
    load:  load_starlink_countries,
  },
];

impl ReferenceKind {
  pub fn spec(self) -> &'static ReferenceSpec {
    match self {
      Self::Gazetteer => &REFERENCES[0],
      Self::Airports => &REFERENCES[1],
      Self::AsnRanks => &REFERENCES[2],
      Self::StarlinkCountries => &REFERENCES[3],
    }
  }

  pub fn parse(name: &str) -> Option<Self> {
    REFERENCES.iter().find(|s| s.name == name).map(|s| s.kind)
  }
}

/// Parse `files` for `kind` and replace the stored table.
///
/// Airport cities are rewritten to their canonical gazetteer spelling before
/// they are stored, so the gazetteer must be refreshed first.
pub async fn refresh<S: TelemetryStore>(
  store: &S,
  kind: ReferenceKind,
  files: &[SourceFile<'_>],
) -> Result<usize> {
  let rows = match (kind.spec().load)(files)? {
    ReferenceRows::Airports(mappings) => {
      let cities = store.gazetteer().await.map_err(Error::store)?;
      let gazetteer = Gazetteer::new(cities);
      ReferenceRows::Airports(canonicalize_mappings(mappings, &gazetteer))
    }
    other => other,
  };

  let count = rows.len();
  store.replace_reference(rows).await.map_err(Error::store)?;
  tracing::info!(table = kind.spec().name, rows = count, "reference table refreshed");
  Ok(count)
}

// ─── Loaders ─────────────────────────────────────────────────────────────────

fn file<'a, 'b>(files: &'a [SourceFile<'b>], index: usize) -> Result<&'a SourceFile<'b>> {
  files.get(index).ok_or_else(|| Error::Reference {
    file:   format!("input #{}", index + 1),
    line:   0,
    reason: "missing input file".into(),
  })
}

/// Non-empty lines split on tabs, with 1-based line numbers.
fn tsv_rows<'a>(contents: &'a str) -> impl Iterator<Item = (usize, Vec<&'a str>)> {
  contents
    .lines()
    .enumerate()
    .filter(|(_, line)| !line.trim().is_empty())
    .map(|(i, line)| (i + 1, line.trim_end_matches('\r').split('\t').collect()))
}

fn non_empty(s: Option<&&str>) -> Option<String> {
  s.map(|s| s.trim())
    .filter(|s| !s.is_empty())
    .map(str::to_owned)
}

/// Column lookup for files whose first row is a header.
struct Header<'a> {
  file:    &'a str,
  columns: Vec<&'a str>,
}

impl<'a> Header<'a> {
  fn index(&self, name: &str) -> Result<usize> {
    self
      .columns
      .iter()
      .position(|c| c.trim() == name)
      .ok_or_else(|| Error::Reference {
        file:   self.file.to_owned(),
        line:   1,
        reason: format!("missing column {name:?}"),
      })
  }
}

fn header<'a>(f: &SourceFile<'a>) -> Result<(Header<'a>, impl Iterator<Item = (usize, Vec<&'a str>)>)> {
  let mut rows = tsv_rows(f.contents);
  let (_, columns) = rows.next().ok_or_else(|| Error::Reference {
    file:   f.name.to_owned(),
    line:   1,
    reason: "empty file".into(),
  })?;
  Ok((Header { file: f.name, columns }, rows))
}

/// Geonames `citiesNNNN.txt` dump plus the `admin1CodesASCII.txt` region file.
pub fn load_gazetteer(files: &[SourceFile<'_>]) -> Result<ReferenceRows> {
  let cities = file(files, 0)?;
  let regions = file(files, 1)?;

  // "FR.11" -> "Ile-de-France"
  let region_names: std::collections::HashMap<&str, &str> = tsv_rows(regions.contents)
    .filter_map(|(_, cols)| Some((*cols.first()?, *cols.get(2)?)))
    .collect();

  let mut seen = HashSet::new();
  let mut rows = Vec::new();
  for (line, cols) in tsv_rows(cities.contents) {
    if cols.len() < 15 {
      return Err(Error::Reference {
        file: cities.name.to_owned(),
        line,
        reason: format!("expected at least 15 columns, found {}", cols.len()),
      });
    }
    let (Some(ascii_name), Some(country_code)) = (non_empty(cols.get(2)), non_empty(cols.get(8)))
    else {
      continue;
    };
    let name = cols[1].trim().to_owned();
    let aliases: Vec<String> = cols[3]
      .split(',')
      .map(str::trim)
      .filter(|a| !a.is_empty())
      .take(MAX_ALIASES)
      .map(str::to_owned)
      .collect();
    let region = region_names
      .get(format!("{country_code}.{}", cols[10].trim()).as_str())
      .map(|r| (*r).to_owned())
      .unwrap_or_default();
    let population = cols[14].trim().parse().unwrap_or(0);

    if !seen.insert((name.clone(), ascii_name.clone(), region.clone(), country_code.clone())) {
      continue;
    }
    rows.push(GazetteerCity {
      name,
      ascii_name,
      aliases,
      region,
      country_code,
      population,
    });
  }
  Ok(ReferenceRows::Gazetteer(rows))
}

/// Airport table with a header containing `iata_code`, `municipality` and
/// `iso_country`. Rows without a three-letter code or a city are skipped.
pub fn load_airports(files: &[SourceFile<'_>]) -> Result<ReferenceRows> {
  let f = file(files, 0)?;
  let (header, rows) = header(f)?;
  let code_col = header.index("iata_code")?;
  let city_col = header.index("municipality")?;
  let country_col = header.index("iso_country")?;

  let mut seen = HashSet::new();
  let mut mappings = Vec::new();
  for (_, cols) in rows {
    let (Some(code), Some(city), Some(country)) = (
      non_empty(cols.get(code_col)),
      non_empty(cols.get(city_col)),
      non_empty(cols.get(country_col)),
    ) else {
      continue;
    };
    if code.len() != 3 || !seen.insert(code.clone()) {
      continue;
    }
    mappings.push(AirportMapping { code, city, country });
  }
  Ok(ReferenceRows::Airports(mappings))
}

/// ASN ranking table with columns `asn`, `asnName`, `rank`, `country_code`,
/// `country_name`.
pub fn load_asn_ranks(files: &[SourceFile<'_>]) -> Result<ReferenceRows> {
  let f = file(files, 0)?;
  let (header, rows) = header(f)?;
  let asn_col = header.index("asn")?;
  let name_col = header.index("asnName")?;
  let rank_col = header.index("rank")?;
  let cc_col = header.index("country_code")?;
  let cn_col = header.index("country_name")?;

  let mut seen = HashSet::new();
  let mut ranks = Vec::new();
  for (line, cols) in rows {
    let asn = cols
      .get(asn_col)
      .and_then(|s| s.trim().parse::<u32>().ok())
      .ok_or_else(|| Error::Reference {
        file: f.name.to_owned(),
        line,
        reason: "asn is not a number".into(),
      })?;
    if !seen.insert(asn) {
      continue;
    }
    ranks.push(AsnRank {
      asn,
      name: non_empty(cols.get(name_col)),
      rank: cols.get(rank_col).and_then(|s| s.trim().parse().ok()),
      country_code: non_empty(cols.get(cc_col)),
      country_name: non_empty(cols.get(cn_col)),
    });
  }
  Ok(ReferenceRows::AsnRanks(ranks))
}

/// One two-letter country code per line.
pub fn load_starlink_countries(files: &[SourceFile<'_>]) -> Result<ReferenceRows> {
  let f = file(files, 0)?;
  let mut seen = HashSet::new();
  let mut countries = Vec::new();
  for (line, cols) in tsv_rows(f.contents) {
    let code = cols[0].trim();
    if code.len() != 2 {
      return Err(Error::Reference {
        file:   f.name.to_owned(),
        line,
        reason: format!("not a country code: {code:?}"),
      });
    }
    if seen.insert(code) {
      countries.push(code.to_owned());
    }
  }
  Ok(ReferenceRows::StarlinkCountries(countries))
}
