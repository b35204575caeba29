//! Canonical dates and the normalizer for the raw CSV date shapes.

use chrono::NaiveDate;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{self, Display};
use std::str::FromStr;
use thiserror::Error;

/// The canonical on-wire date format, `dd-mm-yyyy`.
pub const CANONICAL_FORMAT: &str = "%d-%m-%Y";

#[derive(Debug, Error)]
pub enum DateError {
    #[error("'{input}' is not a {CANONICAL_FORMAT} date")]
    NotCanonical { input: String },

    #[error("unrecognized date format: '{input}'")]
    Unrecognized { input: String },
}

/// A calendar date, serialized in the canonical `dd-mm-yyyy` form.
///
/// Ordering is calendar order, not string order, so range scans over a
/// `BTreeMap<Date, _>` walk dates chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Date(NaiveDate);

impl Date {
    /// Parse the canonical `dd-mm-yyyy` form.
    pub fn parse_canonical(s: &str) -> Result<Self, DateError> {
        NaiveDate::parse_from_str(s, CANONICAL_FORMAT)
            .map(Self)
            .map_err(|_| DateError::NotCanonical {
                input: s.to_string(),
            })
    }

    /// Normalize one of the known raw CSV date shapes into a canonical date.
    ///
    /// Accepted inputs: `yyyymmdd` (also with a trailing `.0` left over from
    /// numeric CSV columns), `yyyy-mm-dd`, and `yyyymmdd-HH:MM` (the time
    /// portion is discarded).
    pub fn normalize(raw: &str) -> Result<Self, DateError> {
        let raw = raw.trim();

        let compact = raw.strip_suffix(".0").unwrap_or(raw);
        if let Ok(d) = NaiveDate::parse_from_str(compact, "%Y%m%d") {
            return Ok(Self(d));
        }

        if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            return Ok(Self(d));
        }

        if let Some(head) = raw.split('-').next() {
            if let Ok(d) = NaiveDate::parse_from_str(head, "%Y%m%d") {
                return Ok(Self(d));
            }
        }

        Err(DateError::Unrecognized {
            input: raw.to_string(),
        })
    }
}

impl Display for Date {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(CANONICAL_FORMAT))
    }
}

impl FromStr for Date {
    type Err = DateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_canonical(s)
    }
}

impl Serialize for Date {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Date {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse_canonical(&s).map_err(de::Error::custom)
    }
}
