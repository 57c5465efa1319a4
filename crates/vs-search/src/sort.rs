//! # Sort Specs
//!
//! The indicator stream is walked in one of two orders: plain ascending
//! ingestion time, or a deterministic per-run shuffle. The shuffle sorts
//! on a hash of `@timestamp` concatenated with a per-run salt, so
//! overlapping runs (or multiple scanner instances) spread over the
//! corpus instead of contending on the same hot slice.

use serde_json::{json, Value};

/// Requested walk order for a document stream.
#[derive(Debug, Clone)]
pub enum SortSpec {
    /// Ascending by `@timestamp`.
    TimestampAsc,
    /// Ascending by `hash(@timestamp + salt)`. The salt is per-run and
    /// never persisted; a resumed run permutes the remainder anew.
    SaltedShuffle { salt: String },
}

impl SortSpec {
    /// Render the engine-shaped sort body.
    pub fn to_json(&self) -> Value {
        match self {
            Self::TimestampAsc => json!([
                { "@timestamp": { "order": "asc" } }
            ]),
            Self::SaltedShuffle { salt } => json!([
                {
                    "_script": {
                        "type": "number",
                        "order": "asc",
                        "script": {
                            "lang": "painless",
                            "source": "(doc['@timestamp'].value.toString() + params.salt).hashCode()",
                            "params": { "salt": salt }
                        }
                    }
                }
            ]),
        }
    }
}
