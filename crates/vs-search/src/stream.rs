//! # Document Stream — Paginated PIT Cursor
//!
//! A stateful cursor over one query against one set of indices. The
//! point-in-time opened at construction pins a consistent snapshot for
//! every page, even while the underlying indices take writes; pages
//! advance with `search_after` seeded from the previous page's terminal
//! sort key.
//!
//! # Invariant
//!
//! The stream is finite, single-pass, and non-restartable: the first
//! empty page ends it, and no further backend requests are issued.

use std::sync::Arc;

use serde_json::Value;

use crate::{Hit, SearchBackend, SearchError, SortSpec};

/// Hits per page.
pub const BATCH_SIZE: usize = 1000;

/// PIT keep-alive. The engine reaps abandoned cursors after this
/// elapses, so a crashed run leaks nothing durable.
pub const PIT_KEEP_ALIVE: &str = "1m";

/// A lazy sequence of document pages behind a point-in-time cursor.
pub struct DocumentStream {
    backend: Arc<dyn SearchBackend>,
    query: Value,
    sort: Value,
    /// `None` once the stream is exhausted.
    pit_id: Option<String>,
    /// Terminal sort key of the previous page; absent on the first.
    search_after: Option<Value>,
}

impl DocumentStream {
    /// Open a PIT over `indices` and position the stream before the
    /// first page.
    pub async fn open(
        backend: Arc<dyn SearchBackend>,
        indices: &[String],
        query: Value,
        sort: &SortSpec,
    ) -> Result<Self, SearchError> {
        let pit_id = backend.open_pit(indices, PIT_KEEP_ALIVE).await?;
        Ok(Self {
            backend,
            query,
            sort: sort.to_json(),
            pit_id: Some(pit_id),
            search_after: None,
        })
    }

    /// Fetch the next page, up to [`BATCH_SIZE`] hits.
    ///
    /// Returns `Ok(None)` once exhausted; the PIT is released
    /// best-effort at that point and later calls are no-ops.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Hit>>, SearchError> {
        let Some(pit_id) = self.pit_id.as_deref() else {
            return Ok(None);
        };

        let page = self
            .backend
            .search_page(
                pit_id,
                &self.query,
                &self.sort,
                BATCH_SIZE,
                self.search_after.as_ref(),
            )
            .await?;

        if page.hits.is_empty() {
            if let Some(pit_id) = self.pit_id.take() {
                if let Err(err) = self.backend.close_pit(&pit_id).await {
                    tracing::debug!(error = %err, "failed to release point-in-time");
                }
            }
            return Ok(None);
        }

        self.search_after = page.hits.last().map(|hit| hit.sort.clone());
        Ok(Some(page.hits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use serde_json::json;

    fn doc(ts: &str) -> Value {
        json!({ "@timestamp": ts, "threat": { "indicator": { "type": "url" } } })
    }

    #[tokio::test]
    async fn test_stream_walks_snapshot_in_timestamp_order() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put("threats", "b", doc("2024-03-01T00:00:02Z")).await;
        backend.put("threats", "a", doc("2024-03-01T00:00:01Z")).await;
        backend.put("threats", "c", doc("2024-03-01T00:00:03Z")).await;

        let mut stream = DocumentStream::open(
            backend.clone(),
            &["threats".into()],
            json!({ "match_all": {} }),
            &SortSpec::TimestampAsc,
        )
        .await
        .unwrap();

        let page = stream.next_page().await.unwrap().unwrap();
        let ids: Vec<&str> = page.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(stream.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_exhausted_stream_stops_hitting_the_backend() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put("threats", "a", doc("2024-03-01T00:00:01Z")).await;

        let mut stream = DocumentStream::open(
            backend.clone(),
            &["threats".into()],
            json!({ "match_all": {} }),
            &SortSpec::TimestampAsc,
        )
        .await
        .unwrap();

        while stream.next_page().await.unwrap().is_some() {}
        let served = backend.search_pages_served();

        assert!(stream.next_page().await.unwrap().is_none());
        assert!(stream.next_page().await.unwrap().is_none());
        assert_eq!(backend.search_pages_served(), served);
    }

    #[tokio::test]
    async fn test_snapshot_hides_documents_added_mid_stream() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put("threats", "a", doc("2024-03-01T00:00:01Z")).await;

        let mut stream = DocumentStream::open(
            backend.clone(),
            &["threats".into()],
            json!({ "match_all": {} }),
            &SortSpec::TimestampAsc,
        )
        .await
        .unwrap();

        // Lands after the PIT was opened, so the stream never sees it.
        backend.put("threats", "z", doc("2024-03-01T00:00:09Z")).await;

        let page = stream.next_page().await.unwrap().unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "a");
        assert!(stream.next_page().await.unwrap().is_none());
    }
}
