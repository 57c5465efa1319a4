//! # Query Builders
//!
//! Engine-shaped query bodies, built as data. Two queries drive a scan:
//! the eligibility query selecting which indicators get processed this
//! run, and the per-indicator event-match query.

use serde_json::{json, Value};

use crate::indicator::Indicator;
use crate::interval::Interval;

/// Select indicators eligible for processing in this run: never
/// checked, or last checked more than one scheduling interval ago.
///
/// The interval string is embedded verbatim; the backend's
/// relative-time parser handles `now-10s` and friends.
pub fn eligible_indicators(interval: &Interval) -> Value {
    json!({
        "bool": {
            "minimum_should_match": 1,
            "should": [
                {
                    "range": {
                        "threat.detection.timestamp": {
                            "lte": format!("now-{}", interval.as_str())
                        }
                    }
                },
                {
                    "bool": {
                        "must_not": {
                            "exists": { "field": "threat.detection.timestamp" }
                        }
                    }
                }
            ]
        }
    })
}

/// The event-match query for one indicator, or `None` when the
/// indicator carries nothing we recognize (the caller still stamps it).
///
/// After the first scan only newly arrived events need counting, so a
/// previously-stamped indicator gets a `@timestamp >= last check` floor;
/// cumulative totals live in `threat.detection.matches`.
pub fn event_matches(indicator: &Indicator) -> Option<Value> {
    let should = indicator.should_clauses();
    if should.is_empty() {
        return None;
    }

    let mut bool_body = json!({
        "minimum_should_match": 1,
        "should": should,
    });

    if let Some(detection) = indicator.detection {
        bool_body["must"] = json!({
            "range": { "@timestamp": { "gte": detection.timestamp } }
        });
    }

    Some(json!({ "bool": bool_body }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicator::Indicator;
    use serde_json::json;

    #[test]
    fn test_eligibility_selects_overdue_or_unchecked() {
        let q = eligible_indicators(&"10s".parse().unwrap());
        assert_eq!(q["bool"]["minimum_should_match"], 1);
        let should = q["bool"]["should"].as_array().unwrap();
        assert_eq!(
            should[0]["range"]["threat.detection.timestamp"]["lte"],
            "now-10s"
        );
        assert_eq!(
            should[1]["bool"]["must_not"]["exists"]["field"],
            "threat.detection.timestamp"
        );
    }

    #[test]
    fn test_first_scan_has_no_time_floor() {
        let source = json!({
            "threat": { "indicator": { "type": "url", "url": { "full": "http://a.test" } } }
        });
        let ind = Indicator::parse("i1", "threats", &source);
        let q = event_matches(&ind).unwrap();
        assert!(q["bool"]["must"].is_null());
        assert_eq!(q["bool"]["should"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_rescan_carries_time_floor() {
        let source = json!({
            "threat": {
                "indicator": { "type": "url", "url": { "full": "http://a.test" } },
                "detection": { "timestamp": 1700000000000i64, "matches": 3 }
            }
        });
        let ind = Indicator::parse("i1", "threats", &source);
        let q = event_matches(&ind).unwrap();
        assert_eq!(
            q["bool"]["must"]["range"]["@timestamp"]["gte"],
            1700000000000i64
        );
    }

    #[test]
    fn test_unrecognized_indicator_builds_no_query() {
        let source = json!({ "threat": { "indicator": { "type": "dns" } } });
        let ind = Indicator::parse("i1", "threats", &source);
        assert!(event_matches(&ind).is_none());
    }
}
