//! # Indicator Schema
//!
//! Typed view over a raw threat-indicator document. The search engine
//! hands us loosely-shaped JSON; parsing collapses it into the ordered
//! list of observables the scanner knows how to match, so the rest of
//! the engine never touches dotted-path lookups.

use serde_json::Value;

/// Event-side fields consulted when matching, in fixed order.
///
/// The order is load-bearing: should-clauses are emitted in this order,
/// and both IP-valued event fields draw from the single indicator-side
/// `ip` observable.
pub const EVENT_FIELDS: [&str; 6] = [
    "url.full",
    "file.hash.sha1",
    "file.hash.md5",
    "file.pe.imphash",
    "source.ip",
    "destination.ip",
];

/// One recognized observable carried by an indicator.
///
/// An indicator that parses to zero observables is the "unknown type"
/// case: it produces an empty should-clause list and is stamped with
/// zero new matches so it does not re-enter the eligible set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observable {
    UrlFull(String),
    FileSha1(String),
    FileMd5(String),
    PeImphash(String),
    Ip(String),
}

impl Observable {
    /// Event-side match predicates for this observable, in `EVENT_FIELDS`
    /// order. An IP observable matches both `source.ip` and
    /// `destination.ip`.
    fn clauses(&self) -> Vec<Value> {
        match self {
            Self::UrlFull(v) => vec![match_clause("url.full", v)],
            Self::FileSha1(v) => vec![match_clause("file.hash.sha1", v)],
            Self::FileMd5(v) => vec![match_clause("file.hash.md5", v)],
            Self::PeImphash(v) => vec![match_clause("file.pe.imphash", v)],
            Self::Ip(v) => vec![
                match_clause("source.ip", v),
                match_clause("destination.ip", v),
            ],
        }
    }
}

fn match_clause(field: &str, value: &str) -> Value {
    serde_json::json!({ "match": { field: value } })
}

/// Scanner-owned detection metadata stamped onto an indicator.
///
/// `timestamp` is epoch milliseconds of the last successful check;
/// `matches` is the cumulative bounded count of matching events across
/// all prior scans. Both are non-decreasing per indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub timestamp: i64,
    pub matches: i64,
}

/// Parsed view of one indicator hit.
#[derive(Debug, Clone)]
pub struct Indicator {
    /// Document id in the indicator index.
    pub id: String,
    /// Concrete index the document lives in (write-back target).
    pub index: String,
    /// The `threat.indicator.type` discriminator, if present. Carried
    /// for log lines only; matching is driven by the observables.
    pub indicator_type: Option<String>,
    /// Recognized observables, in `EVENT_FIELDS` order.
    pub observables: Vec<Observable>,
    /// Prior detection stamp, absent if never checked.
    pub detection: Option<Detection>,
}

impl Indicator {
    /// Parse a raw `_source` document into an [`Indicator`].
    ///
    /// Probes `threat.indicator.<path>` for each recognized leaf.
    /// Absent and empty values are skipped; an unrecognized indicator
    /// type simply yields no observables.
    pub fn parse(id: &str, index: &str, source: &Value) -> Self {
        let mut observables = Vec::new();

        if let Some(v) = indicator_field(source, "url.full") {
            observables.push(Observable::UrlFull(v));
        }
        if let Some(v) = indicator_field(source, "file.hash.sha1") {
            observables.push(Observable::FileSha1(v));
        }
        if let Some(v) = indicator_field(source, "file.hash.md5") {
            observables.push(Observable::FileMd5(v));
        }
        if let Some(v) = indicator_field(source, "file.pe.imphash") {
            observables.push(Observable::PeImphash(v));
        }
        // Both IP-valued event fields share the one `ip` observable.
        if let Some(v) = indicator_field(source, "ip") {
            observables.push(Observable::Ip(v));
        }

        let detection = source
            .pointer("/threat/detection/timestamp")
            .and_then(Value::as_i64)
            .map(|timestamp| Detection {
                timestamp,
                matches: source
                    .pointer("/threat/detection/matches")
                    .and_then(Value::as_i64)
                    .unwrap_or(0),
            });

        Self {
            id: id.to_string(),
            index: index.to_string(),
            indicator_type: source
                .pointer("/threat/indicator/type")
                .and_then(Value::as_str)
                .map(str::to_string),
            observables,
            detection,
        }
    }

    /// The disjunction of single-field match predicates for this
    /// indicator, ordered by `EVENT_FIELDS`. Empty when the indicator
    /// carries nothing we recognize.
    pub fn should_clauses(&self) -> Vec<Value> {
        self.observables.iter().flat_map(Observable::clauses).collect()
    }

    /// Cumulative match count recorded by prior scans (0 if never
    /// checked).
    pub fn prior_matches(&self) -> i64 {
        self.detection.map(|d| d.matches).unwrap_or(0)
    }
}

/// Probe `threat.indicator.<path>` for a non-empty string value.
fn indicator_field(source: &Value, path: &str) -> Option<String> {
    let pointer = format!("/threat/indicator/{}", path.replace('.', "/"));
    source
        .pointer(&pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_url_indicator_single_clause() {
        let source = json!({
            "@timestamp": "2024-03-01T00:00:00Z",
            "threat": { "indicator": { "type": "url", "url": { "full": "http://a.test" } } }
        });
        let ind = Indicator::parse("i1", "threats", &source);
        assert_eq!(ind.observables, vec![Observable::UrlFull("http://a.test".into())]);
        assert_eq!(
            ind.should_clauses(),
            vec![json!({ "match": { "url.full": "http://a.test" } })]
        );
    }

    #[test]
    fn test_file_indicator_emits_hash_clauses_in_order() {
        let source = json!({
            "threat": { "indicator": {
                "type": "file",
                "file": { "hash": { "md5": "d41d8cd9", "sha1": "da39a3ee" } }
            } }
        });
        let ind = Indicator::parse("i2", "threats", &source);
        let clauses = ind.should_clauses();
        assert_eq!(clauses.len(), 2);
        // sha1 precedes md5 per the fixed event-field order
        assert_eq!(clauses[0], json!({ "match": { "file.hash.sha1": "da39a3ee" } }));
        assert_eq!(clauses[1], json!({ "match": { "file.hash.md5": "d41d8cd9" } }));
    }

    #[test]
    fn test_ip_indicator_matches_both_directions() {
        let source = json!({
            "threat": { "indicator": { "type": "ip", "ip": "10.0.0.1" } }
        });
        let ind = Indicator::parse("i3", "threats", &source);
        assert_eq!(
            ind.should_clauses(),
            vec![
                json!({ "match": { "source.ip": "10.0.0.1" } }),
                json!({ "match": { "destination.ip": "10.0.0.1" } }),
            ]
        );
    }

    #[test]
    fn test_clause_order_follows_event_fields() {
        let source = json!({
            "threat": { "indicator": {
                "type": "file",
                "url": { "full": "http://a.test" },
                "file": {
                    "hash": { "sha1": "da39a3ee", "md5": "d41d8cd9" },
                    "pe": { "imphash": "a1b2c3d4" }
                },
                "ip": "10.0.0.1"
            } }
        });
        let ind = Indicator::parse("ix", "threats", &source);
        let fields: Vec<String> = ind
            .should_clauses()
            .iter()
            .map(|c| {
                c["match"]
                    .as_object()
                    .unwrap()
                    .keys()
                    .next()
                    .unwrap()
                    .clone()
            })
            .collect();
        assert_eq!(fields, EVENT_FIELDS);
    }

    #[test]
    fn test_unknown_type_yields_no_clauses() {
        let source = json!({
            "threat": { "indicator": { "type": "dns", "dns": { "question": "a.test" } } }
        });
        let ind = Indicator::parse("i4", "threats", &source);
        assert!(ind.should_clauses().is_empty());
        assert_eq!(ind.indicator_type.as_deref(), Some("dns"));
    }

    #[test]
    fn test_empty_values_are_skipped() {
        let source = json!({
            "threat": { "indicator": { "type": "url", "url": { "full": "" } } }
        });
        let ind = Indicator::parse("i5", "threats", &source);
        assert!(ind.observables.is_empty());
    }

    #[test]
    fn test_detection_stamp_parsed() {
        let source = json!({
            "threat": {
                "indicator": { "type": "url", "url": { "full": "http://b.test" } },
                "detection": { "timestamp": 1709251200000i64, "matches": 7 }
            }
        });
        let ind = Indicator::parse("i6", "threats", &source);
        assert_eq!(
            ind.detection,
            Some(Detection { timestamp: 1709251200000, matches: 7 })
        );
        assert_eq!(ind.prior_matches(), 7);
    }

    #[test]
    fn test_never_checked_has_no_detection() {
        let source = json!({
            "threat": { "indicator": { "type": "url", "url": { "full": "http://c.test" } } }
        });
        let ind = Indicator::parse("i7", "threats", &source);
        assert!(ind.detection.is_none());
        assert_eq!(ind.prior_matches(), 0);
    }
}
