//! # vs-scan — The "Watch" of VESPER
//!
//! The scan orchestrator. One run walks the eligible slice of the
//! indicator corpus through a point-in-time cursor, fans each page out
//! to a bounded worker pool that counts matching events, stamps the
//! page back with one bulk update, and pauses cleanly when the
//! wall-clock budget runs out. Durable state lives only in the
//! indicator index: a paused or crashed run costs at most the page in
//! flight, which the next run simply redoes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use vs_model::{queries, Indicator, Interval};
use vs_search::migrate::ensure_detection_mapping;
use vs_search::{DocumentStream, Hit, SearchBackend, SearchError, SortSpec};

/// Early-termination bound on per-indicator event counts. Stored match
/// totals are lower-bound estimates of lifetime matches.
pub const MATCH_CAP: u64 = 100;

/// Safety margin subtracted from the scheduling interval so a run
/// returns before its successor is due.
const DEADLINE_MARGIN: Duration = Duration::from_millis(100);

/// Parameters for one scan run.
#[derive(Debug, Clone)]
pub struct ScanParams {
    /// Indicator indices to walk.
    pub threat_index: Vec<String>,
    /// Event indices to match against.
    pub events_index: Vec<String>,
    /// Maximum in-flight event-match operations per page.
    pub concurrency: usize,
    /// Emit per-indicator debug lines.
    pub verbose: bool,
    /// Scheduling period; doubles as the wall-clock budget and the
    /// re-eligibility age threshold.
    pub interval: Interval,
}

/// Outcome of one scan run.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub run_id: String,
    /// Indicators handed to a worker this run.
    pub examined: u64,
    /// Sum of bounded event-match deltas observed this run.
    pub new_threats: u64,
    /// True iff the budget fired before the cursor was exhausted.
    pub paused: bool,
    pub duration: Duration,
}

/// Fatal scan failures. Worker-level and bulk-level errors are logged
/// and absorbed instead; the affected indicators stay eligible.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("mapping migration failed: {0}")]
    Migration(SearchError),

    #[error("indicator pagination failed: {0}")]
    Pagination(SearchError),
}

/// What one worker decided about one indicator.
enum Outcome {
    /// Write `total` back as the cumulative match count.
    Stamp {
        id: String,
        index: String,
        total: i64,
        delta: u64,
    },
    /// Hit without a `_source`; treated as transient, left unstamped.
    Skipped,
    /// Match attempt failed; left unstamped, re-eligible next run.
    Failed,
}

/// Run one time-budgeted scan over the indicator corpus.
///
/// Dropping the returned future cancels in-flight workers and issues
/// no further bulk write.
pub async fn run_scan(
    backend: Arc<dyn SearchBackend>,
    params: &ScanParams,
) -> Result<ScanReport, ScanError> {
    let run_id = format!("scan-{}", uuid::Uuid::new_v4().as_simple());
    let start = Instant::now();
    let start_ms = chrono::Utc::now().timestamp_millis();

    ensure_detection_mapping(backend.as_ref(), &params.threat_index)
        .await
        .map_err(ScanError::Migration)?;

    let selection = queries::eligible_indicators(&params.interval);

    // Progress telemetry only; a failure here must not kill the run.
    let total = match backend.count(&params.threat_index, &selection, None).await {
        Ok(n) => n,
        Err(err) => {
            tracing::warn!(run_id = %run_id, error = %err, "eligible-indicator count failed");
            0
        }
    };
    tracing::info!(run_id = %run_id, eligible = total, "scan starting");

    let deadline = start
        + Duration::from_millis(params.interval.as_millis())
            .saturating_sub(DEADLINE_MARGIN);

    // Per-run salt: overlapping runs walk differently permuted corpora,
    // spreading contention across instances.
    let sort = SortSpec::SaltedShuffle {
        salt: start_ms.to_string(),
    };
    let mut stream = DocumentStream::open(
        backend.clone(),
        &params.threat_index,
        selection,
        &sort,
    )
    .await
    .map_err(ScanError::Pagination)?;

    let events_index: Arc<Vec<String>> = Arc::new(params.events_index.clone());
    let concurrency = params.concurrency.max(1);

    let mut examined = 0u64;
    let mut new_threats = 0u64;
    let mut paused = false;

    while let Some(page) = stream.next_page().await.map_err(ScanError::Pagination)? {
        // Budget is checked only at page boundaries; a worker may
        // slightly overrun, but partial pages are never submitted.
        if Instant::now() >= deadline {
            paused = true;
            break;
        }

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut workers: JoinSet<Outcome> = JoinSet::new();
        for hit in page {
            let semaphore = semaphore.clone();
            let backend = backend.clone();
            let events_index = events_index.clone();
            let verbose = params.verbose;
            workers.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("scan semaphore is never closed");
                check_indicator(backend.as_ref(), &events_index, hit, verbose).await
            });
        }

        // Page join: per-worker results merge here, then one bulk
        // update stamps the whole page.
        let mut stamps: Vec<(String, String, i64)> = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Outcome::Stamp { id, index, total, delta }) => {
                    examined += 1;
                    new_threats += delta;
                    stamps.push((id, index, total));
                }
                Ok(Outcome::Skipped) | Ok(Outcome::Failed) => examined += 1,
                Err(err) => {
                    tracing::error!(run_id = %run_id, error = %err, "indicator worker panicked");
                }
            }
        }

        submit_page(backend.as_ref(), &run_id, stamps).await;
    }

    let duration = start.elapsed();
    let rate = examined as f64 / duration.as_secs_f64().max(f64::EPSILON);
    tracing::info!(
        run_id = %run_id,
        examined,
        new_threats,
        "scan {} after {:.1}s ({:.0} indicators/s)",
        if paused { "paused" } else { "finished" },
        duration.as_secs_f64(),
        rate,
    );

    Ok(ScanReport {
        run_id,
        examined,
        new_threats,
        paused,
        duration,
    })
}

/// Check one indicator against the event indices.
async fn check_indicator(
    backend: &dyn SearchBackend,
    events_index: &[String],
    hit: Hit,
    verbose: bool,
) -> Outcome {
    let Some(source) = hit.source.as_ref() else {
        tracing::warn!(id = %hit.id, "indicator hit without _source, skipping");
        return Outcome::Skipped;
    };

    let indicator = Indicator::parse(&hit.id, &hit.index, source);

    let Some(query) = queries::event_matches(&indicator) else {
        // Nothing we know how to match. Stamp with zero new matches so
        // the indicator leaves the eligible set instead of re-entering
        // the queue every run.
        if verbose {
            tracing::debug!(
                id = %indicator.id,
                indicator_type = indicator.indicator_type.as_deref().unwrap_or("unknown"),
                "no recognized observables"
            );
        }
        let total = indicator.prior_matches();
        return Outcome::Stamp {
            id: indicator.id,
            index: indicator.index,
            total,
            delta: 0,
        };
    };

    match backend.count(events_index, &query, Some(MATCH_CAP)).await {
        Ok(n) => {
            let delta = n.min(MATCH_CAP);
            if verbose {
                tracing::debug!(id = %indicator.id, matches = delta, "indicator checked");
            }
            let total = indicator.prior_matches() + delta as i64;
            Outcome::Stamp {
                id: indicator.id,
                index: indicator.index,
                total,
                delta,
            }
        }
        Err(err) => {
            tracing::warn!(
                id = %indicator.id,
                error = %err,
                "event match failed, indicator left unstamped"
            );
            Outcome::Failed
        }
    }
}

/// Stamp a fully-processed page with one bulk update. Failures are
/// logged, not fatal: unstamped indicators re-enter the eligible set
/// on the next run.
async fn submit_page(
    backend: &dyn SearchBackend,
    run_id: &str,
    stamps: Vec<(String, String, i64)>,
) {
    if stamps.is_empty() {
        return;
    }

    let now_ms = chrono::Utc::now().timestamp_millis();
    let ops = stamps
        .into_iter()
        .map(|(id, index, total)| vs_search::BulkOp::Update {
            id,
            index,
            doc: json!({
                "threat": {
                    "detection": { "timestamp": now_ms, "matches": total }
                }
            }),
        })
        .collect::<Vec<_>>();
    let items = ops.len();

    match backend.bulk(ops).await {
        Ok(summary) if summary.errors => {
            tracing::warn!(run_id = %run_id, items, "bulk update reported item failures");
        }
        Ok(_) => {}
        Err(err) => {
            tracing::warn!(run_id = %run_id, items, error = %err, "bulk update failed");
        }
    }
}
