//! `YYYYMMDD` trading dates.
//!
//! Day values are range-checked to 1..=31 for every month; the gateway's
//! own calendar decides which dates exist, so `20240231` parses.

use std::cmp::Ordering;

use chrono::Local;

use crate::{types::DateKey, validation::ValidationError};

/// Default cap on the number of history dates replayed per account.
pub const DEFAULT_MAX_DAYS: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TradeDate {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl TradeDate {
    pub fn key(&self) -> DateKey {
        format!("{:04}{:02}{:02}", self.year, self.month, self.day)
    }
}

pub fn parse_date(s: &str) -> Result<TradeDate, ValidationError> {
    let invalid = || ValidationError::InvalidFormat {
        value: s.to_string(),
    };

    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let year: u16 = s[0..4].parse().map_err(|_| invalid())?;
    let month: u8 = s[4..6].parse().map_err(|_| invalid())?;
    let day: u8 = s[6..8].parse().map_err(|_| invalid())?;

    if !(1900..=2100).contains(&year) || !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return Err(invalid());
    }
    Ok(TradeDate { year, month, day })
}

/// True iff `a >= b`. Unparseable input on either side compares false.
pub fn compare_or_equal(a: &str, b: &str) -> bool {
    match (parse_date(a), parse_date(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b) != Ordering::Less,
        _ => false,
    }
}

/// Keep dates on or after `start_date`, most recent first, at most
/// `max_days` of them. Malformed entries are dropped.
pub fn build_history_set<S: AsRef<str>>(
    raw_dates: &[S],
    start_date: &str,
    max_days: usize,
) -> Vec<DateKey> {
    let mut dates: Vec<DateKey> = raw_dates
        .iter()
        .map(AsRef::as_ref)
        .filter(|d| compare_or_equal(d, start_date))
        .map(str::to_string)
        .collect();

    // Fixed-width zero-padded keys sort the same as their parsed form.
    dates.sort_unstable_by(|a, b| b.cmp(a));
    dates.truncate(max_days);
    dates
}

/// Today's date on the local clock, used to label the current session.
pub fn today() -> DateKey {
    Local::now().format("%Y%m%d").to_string()
}
