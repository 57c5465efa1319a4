//! # Scan Interval Grammar
//!
//! The scheduling period is configured as `<digits><s|m|h>`. The same
//! string is passed verbatim to the backend's relative-time parser
//! (`now-10s`) and parsed once here into an integer budget for the
//! deadline arithmetic.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serializer};

/// A parsed scan interval.
///
/// Keeps the original string because the eligibility query embeds it
/// verbatim (`now-<interval>`); the numeric accessors drive the
/// wall-clock budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    raw: String,
    secs: u64,
}

impl Interval {
    pub fn as_secs(&self) -> u64 {
        self.secs
    }

    pub fn as_millis(&self) -> u64 {
        self.secs * 1000
    }

    /// The original `<digits><unit>` string, for verbatim pass-through.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Interval {
    type Err = String;

    /// Parse `<digits><unit>` with units `s` (×1), `m` (×60), `h`
    /// (×3600). An unknown unit suffix falls back to seconds.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return Err(format!("invalid interval '{}': expected <digits><s|m|h>", s));
        }
        let n: u64 = digits
            .parse()
            .map_err(|_| format!("invalid interval '{}': number out of range", s))?;
        let multiplier = match &s[digits.len()..] {
            "m" => 60,
            "h" => 3600,
            _ => 1,
        };
        Ok(Self {
            raw: s.to_string(),
            secs: n * multiplier,
        })
    }
}

impl serde::Serialize for Interval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
