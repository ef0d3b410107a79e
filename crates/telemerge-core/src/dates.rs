//! Calendar helpers: eligible dates, date ranges and training months.
//!
//! Only fully elapsed UTC days can be ingested. Every parser here validates
//! eligibility up front so no I/O happens for a request that would fail.

use std::{fmt, str::FromStr};

use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

// ─── Month ───────────────────────────────────────────────────────────────────

/// A calendar month; the granularity of best-server reference data.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Month {
  pub year:  i32,
  /// 1-based.
  pub month: u32,
}

impl Month {
  pub fn new(year: i32, month: u32) -> Option<Self> {
    NaiveDate::from_ymd_opt(year, month, 1).map(|_| Self { year, month })
  }

  pub fn from_date(date: NaiveDate) -> Self {
    Self { year: date.year(), month: date.month() }
  }

  pub fn first_day(self) -> NaiveDate {
    NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
  }

  pub fn last_day(self) -> NaiveDate {
    self
      .next()
      .first_day()
      .pred_opt()
      .unwrap_or(NaiveDate::MAX)
  }

  pub fn next(self) -> Self {
    if self.month == 12 {
      Self { year: self.year + 1, month: 1 }
    } else {
      Self { year: self.year, month: self.month + 1 }
    }
  }

  /// Every month from `self` to `end`, inclusive.
  pub fn through(self, end: Self) -> Vec<Self> {
    let mut months = Vec::new();
    let mut current = self;
    while current <= end {
      months.push(current);
      current = current.next();
    }
    months
  }
}

impl fmt::Display for Month {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:04}-{:02}", self.year, self.month)
  }
}

impl FromStr for Month {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let s = s.trim();
    let (year, month) = s
      .split_once('-')
      .ok_or_else(|| Error::MonthFormat(s.to_owned()))?;
    let year: i32 = year.parse().map_err(|_| Error::MonthFormat(s.to_owned()))?;
    let month: u32 = month.parse().map_err(|_| Error::MonthFormat(s.to_owned()))?;
    Self::new(year, month).ok_or_else(|| Error::MonthFormat(s.to_owned()))
  }
}

// ─── Dates ───────────────────────────────────────────────────────────────────

pub fn format_date(date: NaiveDate) -> String { date.format(DATE_FORMAT).to_string() }

/// Fail with [`Error::DateNotEligible`] unless `date` lies strictly before
/// `today`.
pub fn ensure_eligible(date: NaiveDate, today: NaiveDate) -> Result<()> {
  if date >= today {
    return Err(Error::DateNotEligible { date, today });
  }
  Ok(())
}

/// Parse a `yyyy-mm-dd` date that has already fully elapsed.
pub fn parse_date(s: &str, today: NaiveDate) -> Result<NaiveDate> {
  let date = NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
    .map_err(|_| Error::DateFormat(s.to_owned()))?;
  ensure_eligible(date, today)?;
  Ok(date)
}

/// Parse `start[:end]`. A missing end defaults to yesterday.
pub fn parse_date_range(s: &str, today: NaiveDate) -> Result<(NaiveDate, NaiveDate)> {
  let (start, end) = match s.split_once(':') {
    Some((start, end)) => (parse_date(start, today)?, parse_date(end, today)?),
    None => {
      let start = parse_date(s, today)?;
      let yesterday = today
        .checked_sub_days(Days::new(1))
        .ok_or(Error::DateNotEligible { date: start, today })?;
      (start, yesterday)
    }
  };
  check_range(start, end)?;
  Ok((start, end))
}

/// Parse `yyyy-mm[:yyyy-mm]`. A missing end means a single month.
///
/// Months that have not started yet are rejected; the current month is
/// accepted so partial training windows can be built.
pub fn parse_month_range(s: &str, today: NaiveDate) -> Result<(Month, Month)> {
  let (start, end) = match s.split_once(':') {
    Some((start, end)) => (start.parse::<Month>()?, end.parse::<Month>()?),
    None => {
      let m = s.parse::<Month>()?;
      (m, m)
    }
  };
  for m in [start, end] {
    ensure_eligible(m.first_day(), today)?;
  }
  check_range(start.first_day(), end.first_day())?;
  Ok((start, end))
}

fn check_range(start: NaiveDate, end: NaiveDate) -> Result<()> {
  if start > end {
    return Err(Error::InvalidDateRange { start, end });
  }
  Ok(())
}

/// Every date in `[start, end]`, newest first.
pub fn newest_first(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
  let mut dates = Vec::new();
  let mut current = end;
  while current >= start {
    dates.push(current);
    match current.pred_opt() {
      Some(prev) => current = prev,
      None => break,
    }
  }
  dates
}
