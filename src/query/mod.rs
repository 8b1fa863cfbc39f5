//! Read path over the aggregation store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::event::EventTime;
use crate::export::HealthMetrics;
use crate::store::{AggregationStore, WindowCount, WindowedKey};
use crate::window::Window;

/// Query failures surfaced to callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("query exceeded {0:?}; retry later")]
    Timeout(Duration),

    #[error("invalid range: from {from} is after to {to}")]
    InvalidRange { from: EventTime, to: EventTime },

    #[error("query task failed: {0}")]
    Internal(String),
}

impl QueryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Internal(_))
    }
}

/// Answers windowed count lookups under a deadline.
#[derive(Clone)]
pub struct QueryService {
    store: Arc<AggregationStore>,
    timeout: Duration,
    health: Option<Arc<HealthMetrics>>,
}

impl QueryService {
    pub fn new(store: Arc<AggregationStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            health: None,
        }
    }

    pub fn with_health(mut self, health: Option<Arc<HealthMetrics>>) -> Self {
        self.health = health;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Counts for `key` in windows whose start lies in `[from_start, to_start]`,
    /// ascending by start.
    pub async fn query(
        &self,
        key: &str,
        from_start: EventTime,
        to_start: EventTime,
    ) -> Result<Vec<WindowCount>, QueryError> {
        if from_start > to_start {
            return Err(QueryError::InvalidRange {
                from: from_start,
                to: to_start,
            });
        }

        let started = Instant::now();
        let limit = self.timeout;
        let deadline = started + limit;
        let store = Arc::clone(&self.store);
        let key = key.to_string();

        let task = tokio::task::spawn_blocking(move || {
            scan(&store, &key, from_start, to_start, deadline, limit)
        });

        let result = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(QueryError::Internal(e.to_string())),
            Err(_) => Err(QueryError::Timeout(limit)),
        };

        if let Some(ref h) = self.health {
            h.query_duration.observe(started.elapsed().as_secs_f64());
            if matches!(result, Err(QueryError::Timeout(_))) {
                h.query_timeouts.inc();
            }
        }
        if let Err(QueryError::Timeout(_)) = result {
            tracing::warn!(timeout = ?self.timeout, "query timed out");
        }

        result
    }

    /// Point lookup of a single window.
    pub fn get(&self, key: &str, window: Window) -> Option<WindowCount> {
        self.store
            .get(&WindowedKey::new(key, window))
            .map(|agg| agg.to_window_count())
    }
}

/// Walks the key's windows, checking the deadline between steps.
fn scan(
    store: &AggregationStore,
    key: &str,
    from_start: EventTime,
    to_start: EventTime,
    deadline: Instant,
    limit: Duration,
) -> Result<Vec<WindowCount>, QueryError> {
    let mut out = Vec::new();
    for agg in store.range_between(key, from_start, to_start) {
        if Instant::now() >= deadline {
            return Err(QueryError::Timeout(limit));
        }
        out.push(agg.to_window_count());
    }
    Ok(out)
}
