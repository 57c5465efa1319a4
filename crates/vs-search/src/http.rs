//! # HTTP Backend
//!
//! [`SearchBackend`] over an Elasticsearch-compatible REST API:
//! `_pit`, `_search` with a PIT body, `_count` with `terminate_after`,
//! `_bulk` as NDJSON, and `_mapping`. Credentials are plain basic-auth
//! handed in at construction; request timeouts belong to the client.

use serde_json::{json, Value};

use crate::{BulkOp, BulkSummary, Hit, SearchBackend, SearchError, SearchPage};

/// Elasticsearch-compatible HTTP implementation of [`SearchBackend`].
pub struct HttpBackend {
    http: reqwest::Client,
    base: String,
    credentials: Option<(String, String)>,
}

impl HttpBackend {
    /// `base_url` without a trailing slash, e.g. `http://localhost:9200`.
    pub fn new(
        base_url: &str,
        credentials: Option<(String, String)>,
    ) -> Result<Self, SearchError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| SearchError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, format!("{}/{}", self.base, path));
        if let Some((user, pass)) = &self.credentials {
            req = req.basic_auth(user, Some(pass));
        }
        req
    }

    /// Send, check status, decode JSON. Missing-cursor responses map to
    /// [`SearchError::CursorExpired`] so the scan layer can tell a dead
    /// PIT from an ordinary rejection.
    async fn execute(&self, req: reqwest::RequestBuilder) -> Result<Value, SearchError> {
        let resp = req
            .send()
            .await
            .map_err(|e| SearchError::Transport(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| SearchError::Transport(e.to_string()))?;

        if !status.is_success() {
            if body.contains("search_context_missing") || body.contains("point in time") {
                return Err(SearchError::CursorExpired(body));
            }
            return Err(SearchError::Backend(format!("{}: {}", status, body)));
        }
        serde_json::from_str(&body).map_err(|e| SearchError::Decode(e.to_string()))
    }
}

#[async_trait::async_trait]
impl SearchBackend for HttpBackend {
    async fn open_pit(&self, indices: &[String], keep_alive: &str) -> Result<String, SearchError> {
        let path = format!("{}/_pit?keep_alive={}", indices.join(","), keep_alive);
        let resp = self.execute(self.request(reqwest::Method::POST, &path)).await?;
        resp.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SearchError::Decode("missing pit id".into()))
    }

    async fn search_page(
        &self,
        pit_id: &str,
        query: &Value,
        sort: &Value,
        size: usize,
        search_after: Option<&Value>,
    ) -> Result<SearchPage, SearchError> {
        let mut body = json!({
            "size": size,
            "query": query,
            "sort": sort,
            "pit": { "id": pit_id, "keep_alive": crate::PIT_KEEP_ALIVE },
            "track_total_hits": false,
        });
        if let Some(after) = search_after {
            body["search_after"] = after.clone();
        }

        let resp = self
            .execute(self.request(reqwest::Method::POST, "_search").json(&body))
            .await?;

        let hits = resp
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .ok_or_else(|| SearchError::Decode("missing hits".into()))?
            .iter()
            .map(|hit| Hit {
                id: hit
                    .get("_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                index: hit
                    .get("_index")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                source: hit.get("_source").filter(|s| !s.is_null()).cloned(),
                sort: hit.get("sort").cloned().unwrap_or(Value::Null),
            })
            .collect();

        Ok(SearchPage { hits })
    }

    async fn close_pit(&self, pit_id: &str) -> Result<(), SearchError> {
        self.execute(
            self.request(reqwest::Method::DELETE, "_pit")
                .json(&json!({ "id": pit_id })),
        )
        .await?;
        Ok(())
    }

    async fn count(
        &self,
        indices: &[String],
        query: &Value,
        terminate_after: Option<u64>,
    ) -> Result<u64, SearchError> {
        let mut path = format!("{}/_count", indices.join(","));
        if let Some(bound) = terminate_after {
            path = format!("{}?terminate_after={}", path, bound);
        }
        let resp = self
            .execute(
                self.request(reqwest::Method::POST, &path)
                    .json(&json!({ "query": query })),
            )
            .await?;
        resp.get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| SearchError::Decode("missing count".into()))
    }

    async fn bulk(&self, ops: Vec<BulkOp>) -> Result<BulkSummary, SearchError> {
        let items = ops.len();
        let mut ndjson = String::new();
        for op in ops {
            let BulkOp::Update { id, index, doc } = op;
            ndjson.push_str(&json!({ "update": { "_id": id, "_index": index } }).to_string());
            ndjson.push('\n');
            ndjson.push_str(&json!({ "doc": doc }).to_string());
            ndjson.push('\n');
        }

        let resp = self
            .execute(
                self.request(reqwest::Method::POST, "_bulk")
                    .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
                    .body(ndjson),
            )
            .await?;

        Ok(BulkSummary {
            errors: resp.get("errors").and_then(Value::as_bool).unwrap_or(false),
            items,
        })
    }

    async fn put_mapping(&self, index: &str, properties: &Value) -> Result<(), SearchError> {
        let path = format!("{}/_mapping", index);
        self.execute(self.request(reqwest::Method::PUT, &path).json(properties))
            .await?;
        Ok(())
    }
}
