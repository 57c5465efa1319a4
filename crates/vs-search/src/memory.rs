//! # In-Memory Backend
//!
//! A full in-process [`SearchBackend`] over JSON document maps. It
//! evaluates the query DSL subset the scanner emits (`bool`, `match`,
//! `range`, `exists`, `match_all`), snapshots indices at PIT open, and
//! honors both sort shapes, `search_after`, and `terminate_after`.
//!
//! This is the fixture harness behind every scan scenario test, so it
//! also carries a little instrumentation: pages served, peak concurrent
//! count calls, an injectable per-count delay, and failure hooks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::{BulkOp, BulkSummary, Hit, SearchBackend, SearchError, SearchPage};

#[derive(Debug, Clone)]
struct StoredDoc {
    id: String,
    source: Value,
}

#[derive(Debug, Clone)]
struct SnapshotDoc {
    index: String,
    id: String,
    source: Value,
}

/// In-process search backend.
pub struct MemoryBackend {
    indices: RwLock<HashMap<String, Vec<StoredDoc>>>,
    pits: RwLock<HashMap<String, Vec<SnapshotDoc>>>,
    mappings: RwLock<HashMap<String, Vec<Value>>>,
    pit_seq: AtomicU64,

    // Instrumentation for the scenario suite.
    pages_served: AtomicU64,
    counts_in_flight: AtomicUsize,
    max_counts_in_flight: AtomicUsize,
    count_delay_ms: AtomicU64,
    count_failures: RwLock<Vec<String>>,
    fail_next_bulk: AtomicBool,
    hidden_sources: RwLock<HashSet<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            indices: RwLock::new(HashMap::new()),
            pits: RwLock::new(HashMap::new()),
            mappings: RwLock::new(HashMap::new()),
            pit_seq: AtomicU64::new(0),
            pages_served: AtomicU64::new(0),
            counts_in_flight: AtomicUsize::new(0),
            max_counts_in_flight: AtomicUsize::new(0),
            count_delay_ms: AtomicU64::new(0),
            count_failures: RwLock::new(Vec::new()),
            fail_next_bulk: AtomicBool::new(false),
            hidden_sources: RwLock::new(HashSet::new()),
        }
    }

    /// Insert or replace a document.
    pub async fn put(&self, index: &str, id: &str, source: Value) {
        let mut indices = self.indices.write().await;
        let docs = indices.entry(index.to_string()).or_default();
        match docs.iter_mut().find(|d| d.id == id) {
            Some(doc) => doc.source = source,
            None => docs.push(StoredDoc { id: id.to_string(), source }),
        }
    }

    /// Fetch a document body by id.
    pub async fn get(&self, index: &str, id: &str) -> Option<Value> {
        let indices = self.indices.read().await;
        indices
            .get(index)?
            .iter()
            .find(|d| d.id == id)
            .map(|d| d.source.clone())
    }

    /// Mappings recorded for an index, oldest first.
    pub async fn mappings_for(&self, index: &str) -> Vec<Value> {
        self.mappings
            .read()
            .await
            .get(index)
            .cloned()
            .unwrap_or_default()
    }

    /// Total pages served across all PIT searches.
    pub fn search_pages_served(&self) -> u64 {
        self.pages_served.load(Ordering::Relaxed)
    }

    /// Peak number of concurrently in-flight `count` calls.
    pub fn max_concurrent_counts(&self) -> usize {
        self.max_counts_in_flight.load(Ordering::Relaxed)
    }

    /// Sleep this long inside every `count` call (pause scenarios).
    pub fn set_count_delay(&self, delay: Duration) {
        self.count_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Fail any `count` whose rendered query contains `needle`.
    pub async fn fail_counts_matching(&self, needle: &str) {
        self.count_failures.write().await.push(needle.to_string());
    }

    /// Make the next `bulk` call fail with a backend error.
    pub fn fail_next_bulk(&self) {
        self.fail_next_bulk.store(true, Ordering::Relaxed);
    }

    /// Serve page hits for this id without a `_source` body.
    pub async fn hide_source(&self, id: &str) {
        self.hidden_sources.write().await.insert(id.to_string());
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SearchBackend for MemoryBackend {
    async fn open_pit(&self, indices: &[String], _keep_alive: &str) -> Result<String, SearchError> {
        let store = self.indices.read().await;
        let mut snapshot = Vec::new();
        for index in indices {
            if let Some(docs) = store.get(index) {
                for doc in docs {
                    snapshot.push(SnapshotDoc {
                        index: index.clone(),
                        id: doc.id.clone(),
                        source: doc.source.clone(),
                    });
                }
            }
        }
        let id = format!("pit-{}", self.pit_seq.fetch_add(1, Ordering::Relaxed));
        self.pits.write().await.insert(id.clone(), snapshot);
        Ok(id)
    }

    async fn search_page(
        &self,
        pit_id: &str,
        query: &Value,
        sort: &Value,
        size: usize,
        search_after: Option<&Value>,
    ) -> Result<SearchPage, SearchError> {
        let pits = self.pits.read().await;
        let snapshot = pits
            .get(pit_id)
            .ok_or_else(|| SearchError::CursorExpired(pit_id.to_string()))?;

        self.pages_served.fetch_add(1, Ordering::Relaxed);
        let now_ms = chrono::Utc::now().timestamp_millis();

        let mut matched: Vec<(i64, &SnapshotDoc)> = snapshot
            .iter()
            .filter(|doc| eval_query(query, &doc.source, now_ms))
            .map(|doc| (sort_key(sort, &doc.source), doc))
            .collect();
        matched.sort_by(|a, b| (a.0, a.1.id.as_str()).cmp(&(b.0, b.1.id.as_str())));

        let hidden = self.hidden_sources.read().await;

        let floor = search_after.map(|v| {
            let key = v.get(0).and_then(Value::as_i64).unwrap_or(i64::MIN);
            let id = v.get(1).and_then(Value::as_str).unwrap_or("").to_string();
            (key, id)
        });

        let hits = matched
            .into_iter()
            .filter(|(key, doc)| match &floor {
                Some((fk, fid)) => (*key, doc.id.as_str()) > (*fk, fid.as_str()),
                None => true,
            })
            .take(size)
            .map(|(key, doc)| Hit {
                id: doc.id.clone(),
                index: doc.index.clone(),
                source: (!hidden.contains(&doc.id)).then(|| doc.source.clone()),
                sort: json!([key, doc.id]),
            })
            .collect();

        Ok(SearchPage { hits })
    }

    async fn close_pit(&self, pit_id: &str) -> Result<(), SearchError> {
        self.pits.write().await.remove(pit_id);
        Ok(())
    }

    async fn count(
        &self,
        indices: &[String],
        query: &Value,
        terminate_after: Option<u64>,
    ) -> Result<u64, SearchError> {
        let in_flight = self.counts_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_counts_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let result = self.count_inner(indices, query, terminate_after).await;

        self.counts_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn bulk(&self, ops: Vec<BulkOp>) -> Result<BulkSummary, SearchError> {
        if self.fail_next_bulk.swap(false, Ordering::Relaxed) {
            return Err(SearchError::Backend("injected bulk failure".into()));
        }

        let items = ops.len();
        let mut errors = false;
        let mut store = self.indices.write().await;
        for op in ops {
            let BulkOp::Update { id, index, doc } = op;
            let found = store
                .get_mut(&index)
                .and_then(|docs| docs.iter_mut().find(|d| d.id == id));
            match found {
                Some(stored) => deep_merge(&mut stored.source, &doc),
                None => errors = true,
            }
        }
        Ok(BulkSummary { errors, items })
    }

    async fn put_mapping(&self, index: &str, properties: &Value) -> Result<(), SearchError> {
        self.mappings
            .write()
            .await
            .entry(index.to_string())
            .or_default()
            .push(properties.clone());
        Ok(())
    }
}

impl MemoryBackend {
    async fn count_inner(
        &self,
        indices: &[String],
        query: &Value,
        terminate_after: Option<u64>,
    ) -> Result<u64, SearchError> {
        let delay = self.count_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        {
            let rendered = query.to_string();
            let failures = self.count_failures.read().await;
            if let Some(needle) = failures.iter().find(|n| rendered.contains(n.as_str())) {
                return Err(SearchError::Backend(format!(
                    "injected count failure for '{}'",
                    needle
                )));
            }
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let store = self.indices.read().await;
        let mut count = 0u64;
        'outer: for index in indices {
            let Some(docs) = store.get(index) else { continue };
            for doc in docs {
                if eval_query(query, &doc.source, now_ms) {
                    count += 1;
                    if let Some(bound) = terminate_after {
                        if count >= bound {
                            break 'outer;
                        }
                    }
                }
            }
        }
        Ok(count)
    }
}

// =============================================================================
// Query Evaluation
// =============================================================================

fn eval_query(query: &Value, doc: &Value, now_ms: i64) -> bool {
    let Some(obj) = query.as_object() else {
        return false;
    };

    if obj.contains_key("match_all") {
        return true;
    }
    if let Some(m) = obj.get("match") {
        return eval_match(m, doc);
    }
    if let Some(e) = obj.get("exists") {
        let field = e.get("field").and_then(Value::as_str).unwrap_or("");
        return lookup_path(doc, field).is_some();
    }
    if let Some(r) = obj.get("range") {
        return eval_range(r, doc, now_ms);
    }
    if let Some(b) = obj.get("bool") {
        return eval_bool(b, doc, now_ms);
    }
    false
}

fn eval_match(clause: &Value, doc: &Value) -> bool {
    let Some((field, expected)) = clause.as_object().and_then(|o| o.iter().next()) else {
        return false;
    };
    match lookup_path(doc, field) {
        Some(Value::Array(items)) => items.iter().any(|v| v == expected),
        Some(actual) => actual == expected,
        None => false,
    }
}

fn eval_range(clause: &Value, doc: &Value, now_ms: i64) -> bool {
    let Some((field, bounds)) = clause.as_object().and_then(|o| o.iter().next()) else {
        return false;
    };
    let Some(actual) = lookup_path(doc, field).and_then(to_epoch_millis) else {
        return false;
    };
    if let Some(gte) = bounds.get("gte").and_then(|b| bound_millis(b, now_ms)) {
        if actual < gte {
            return false;
        }
    }
    if let Some(lte) = bounds.get("lte").and_then(|b| bound_millis(b, now_ms)) {
        if actual > lte {
            return false;
        }
    }
    true
}

fn eval_bool(body: &Value, doc: &Value, now_ms: i64) -> bool {
    for clause in clause_list(body.get("must")) {
        if !eval_query(clause, doc, now_ms) {
            return false;
        }
    }
    for clause in clause_list(body.get("must_not")) {
        if eval_query(clause, doc, now_ms) {
            return false;
        }
    }

    let should = clause_list(body.get("should"));
    if should.is_empty() {
        return true;
    }
    let minimum = body
        .get("minimum_should_match")
        .and_then(Value::as_u64)
        .unwrap_or(1) as usize;
    should
        .iter()
        .filter(|c| eval_query(c, doc, now_ms))
        .count()
        >= minimum
}

fn clause_list(v: Option<&Value>) -> Vec<&Value> {
    match v {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(single) => vec![single],
        None => Vec::new(),
    }
}

/// Walk a dotted field path (`threat.detection.timestamp`) through
/// nested objects.
fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Normalize a document value to epoch milliseconds: integers pass
/// through, strings parse as RFC 3339.
fn to_epoch_millis(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis()),
        _ => None,
    }
}

/// Normalize a range bound: integers and RFC 3339 as above, plus the
/// engine's relative form (`now`, `now-10s`).
fn bound_millis(v: &Value, now_ms: i64) -> Option<i64> {
    if let Value::String(s) = v {
        if let Some(rest) = s.strip_prefix("now") {
            if rest.is_empty() {
                return Some(now_ms);
            }
            let offset = rest.strip_prefix('-')?;
            let interval: vs_model::Interval = offset.parse().ok()?;
            return Some(now_ms - interval.as_millis() as i64);
        }
    }
    to_epoch_millis(v)
}

// =============================================================================
// Sorting & Merging
// =============================================================================

/// Compute the sort key for one document under either sort shape.
fn sort_key(sort: &Value, doc: &Value) -> i64 {
    let timestamp = lookup_path(doc, "@timestamp");
    let first = sort.get(0).unwrap_or(&Value::Null);

    if let Some(script) = first.get("_script") {
        let salt = script
            .pointer("/script/params/salt")
            .and_then(Value::as_str)
            .unwrap_or("");
        let ts_repr = match timestamp {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        // Positive-clamped FNV-1a; only determinism matters here.
        return (fnv1a64(format!("{}{}", ts_repr, salt).as_bytes()) & (i64::MAX as u64)) as i64;
    }

    timestamp.and_then(to_epoch_millis).unwrap_or(0)
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Merge a partial document into a stored one, object-by-object.
fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(t), Value::Object(p)) => {
            for (key, value) in p {
                deep_merge(t.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_on_dotted_path() {
        let doc = json!({ "url": { "full": "http://a.test" } });
        let q = json!({ "match": { "url.full": "http://a.test" } });
        assert!(eval_query(&q, &doc, 0));
        let miss = json!({ "match": { "url.full": "http://b.test" } });
        assert!(!eval_query(&miss, &doc, 0));
    }

    #[test]
    fn test_range_with_relative_now() {
        let now_ms = 1_000_000;
        let doc = json!({ "threat": { "detection": { "timestamp": 900_000 } } });
        // checked 100s ago, eligible under a 10s interval
        let q = json!({ "range": { "threat.detection.timestamp": { "lte": "now-10s" } } });
        assert!(eval_query(&q, &doc, now_ms));
        // not eligible under a 1h interval
        let q = json!({ "range": { "threat.detection.timestamp": { "lte": "now-1h" } } });
        assert!(!eval_query(&q, &doc, now_ms));
    }

    #[test]
    fn test_range_parses_rfc3339_timestamps() {
        let doc = json!({ "@timestamp": "2024-03-01T00:00:10Z" });
        let floor = chrono::DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z")
            .unwrap()
            .timestamp_millis();
        let q = json!({ "range": { "@timestamp": { "gte": floor } } });
        assert!(eval_query(&q, &doc, 0));
    }

    #[test]
    fn test_bool_minimum_should_match() {
        let doc = json!({ "source": { "ip": "10.0.0.1" } });
        let q = json!({ "bool": {
            "minimum_should_match": 1,
            "should": [
                { "match": { "source.ip": "10.0.0.1" } },
                { "match": { "destination.ip": "10.0.0.1" } }
            ]
        }});
        assert!(eval_query(&q, &doc, 0));
    }

    #[test]
    fn test_must_not_exists() {
        let stamped = json!({ "threat": { "detection": { "timestamp": 1 } } });
        let fresh = json!({ "threat": { "indicator": { "type": "url" } } });
        let q = json!({ "bool": {
            "must_not": { "exists": { "field": "threat.detection.timestamp" } }
        }});
        assert!(!eval_query(&q, &stamped, 0));
        assert!(eval_query(&q, &fresh, 0));
    }

    #[test]
    fn test_deep_merge_preserves_siblings() {
        let mut doc = json!({ "threat": { "indicator": { "type": "url" } } });
        let patch = json!({ "threat": { "detection": { "timestamp": 5, "matches": 2 } } });
        deep_merge(&mut doc, &patch);
        assert_eq!(doc["threat"]["indicator"]["type"], "url");
        assert_eq!(doc["threat"]["detection"]["matches"], 2);
    }

    #[tokio::test]
    async fn test_count_honors_terminate_after() {
        let backend = MemoryBackend::new();
        for i in 0..10 {
            backend
                .put("events", &format!("e{}", i), json!({ "url": { "full": "http://a.test" } }))
                .await;
        }
        let q = json!({ "match": { "url.full": "http://a.test" } });
        let capped = backend
            .count(&["events".into()], &q, Some(3))
            .await
            .unwrap();
        assert_eq!(capped, 3);
        let full = backend.count(&["events".into()], &q, None).await.unwrap();
        assert_eq!(full, 10);
    }

    #[tokio::test]
    async fn test_salted_shuffle_is_deterministic_per_salt() {
        let backend = MemoryBackend::new();
        for i in 0..20 {
            backend
                .put(
                    "threats",
                    &format!("i{}", i),
                    json!({ "@timestamp": format!("2024-03-01T00:00:{:02}Z", i) }),
                )
                .await;
        }

        let order = |salt: &str| {
            let backend = &backend;
            let sort = crate::SortSpec::SaltedShuffle { salt: salt.into() }.to_json();
            async move {
                let pit = backend.open_pit(&["threats".into()], "1m").await.unwrap();
                let page = backend
                    .search_page(&pit, &json!({ "match_all": {} }), &sort, 100, None)
                    .await
                    .unwrap();
                page.hits.into_iter().map(|h| h.id).collect::<Vec<_>>()
            }
        };

        let a1 = order("salt-a").await;
        let a2 = order("salt-a").await;
        let b = order("salt-b").await;
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }
}
