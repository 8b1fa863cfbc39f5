//! HTTP surface: publish, query, live updates and dead letters.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::event::parse::parse_publish;
use crate::event::EventTime;
use crate::export::health::bind_address;
use crate::fanout::{Fanout, FanoutError, KeyFilter, Subscription};
use crate::ingest::{Gateway, IngestError};
use crate::query::{QueryError, QueryService};
use crate::topology::DeadLetterSink;

const DEFAULT_DEAD_LETTER_LIMIT: usize = 100;

/// Shared state for the API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub gateway: Arc<Gateway>,
    pub query: QueryService,
    pub fanout: Fanout,
    pub dead_letters: Arc<DeadLetterSink>,
    pub keep_alive: Duration,
}

/// Builds the API router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/publish", post(publish_handler))
        .route("/query", get(query_handler))
        .route("/subscribe", get(subscribe_handler))
        .route("/dead-letters", get(dead_letters_handler))
        .with_state(state)
}

/// Serves [`router`] until stopped.
pub struct ApiServer {
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl ApiServer {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Binds the listener and spawns the server. Returns the bound address.
    pub async fn start(&self, state: ApiState) -> Result<SocketAddr> {
        let bind_addr = bind_address(&self.addr, ":8080");
        let app = router(state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "api server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "api server error");
            }
        });

        Ok(local_addr)
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn now_millis() -> EventTime {
    chrono::Utc::now().timestamp_millis()
}

fn error_body(status: StatusCode, reason: &str, message: String) -> Response {
    (status, Json(json!({ "error": message, "reason": reason }))).into_response()
}

/// POST /publish - decode and hand an event to the gateway.
async fn publish_handler(State(state): State<ApiState>, body: Bytes) -> Response {
    let (stream, event) = match parse_publish(&body, now_millis()) {
        Ok(parsed) => parsed,
        Err(e) => {
            let err = IngestError::Malformed(e.to_string());
            state.gateway.reject_payload(&body, &err);
            return error_body(StatusCode::BAD_REQUEST, err.reason(), err.to_string());
        }
    };

    let key = event.key().to_string();
    let timestamp = event.timestamp();
    match state.gateway.ingest(event) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({ "stream": stream, "key": key, "timestamp": timestamp })),
        )
            .into_response(),
        Err(err) => {
            tracing::debug!(stream = %stream, error = %err, "publish refused");
            error_body(StatusCode::SERVICE_UNAVAILABLE, err.reason(), err.to_string())
        }
    }
}

/// Parameters of `GET /query`. Missing bounds are open.
#[derive(Debug, Deserialize)]
pub struct QueryParams {
    pub key: String,
    pub from: Option<EventTime>,
    pub to: Option<EventTime>,
}

/// GET /query - windowed counts for one key.
async fn query_handler(State(state): State<ApiState>, Query(params): Query<QueryParams>) -> Response {
    let from = params.from.unwrap_or(EventTime::MIN);
    let to = params.to.unwrap_or(EventTime::MAX);

    match state.query.query(&params.key, from, to).await {
        Ok(rows) => (StatusCode::OK, Json(rows)).into_response(),
        Err(e @ QueryError::InvalidRange { .. }) => {
            error_body(StatusCode::BAD_REQUEST, "invalid_range", e.to_string())
        }
        Err(e @ QueryError::Timeout(_)) => {
            error_body(StatusCode::GATEWAY_TIMEOUT, "timeout", e.to_string())
        }
        Err(e @ QueryError::Internal(_)) => {
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string())
        }
    }
}

/// Parameters of `GET /subscribe`.
#[derive(Debug, Default, Deserialize)]
pub struct SubscribeParams {
    /// Comma-separated key list.
    pub keys: Option<String>,
    pub prefix: Option<String>,
}

impl SubscribeParams {
    /// `keys` wins over `prefix`; neither means every key.
    pub fn filter(&self) -> KeyFilter {
        if let Some(ref keys) = self.keys {
            let set: HashSet<String> = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect();
            if !set.is_empty() {
                return KeyFilter::Keys(set);
            }
        }
        match self.prefix {
            Some(ref p) if !p.is_empty() => KeyFilter::Prefix(p.clone()),
            _ => KeyFilter::All,
        }
    }
}

/// Turns a subscription into an SSE event stream. Dropping the stream
/// drops the subscription, which unsubscribes.
pub fn delta_stream(subscription: Subscription) -> impl Stream<Item = Result<SseEvent, axum::Error>> {
    futures::stream::unfold(subscription, |sub| async move {
        let delta = sub.recv().await?;
        let event = SseEvent::default().event("delta").json_data(delta.to_message());
        Some((event, sub))
    })
}

/// GET /subscribe - live deltas as server-sent events.
async fn subscribe_handler(
    State(state): State<ApiState>,
    Query(params): Query<SubscribeParams>,
) -> Response {
    let filter = params.filter();
    let subscription = match state.fanout.subscribe(filter) {
        Ok(sub) => sub,
        Err(e @ FanoutError::SubscriberLimitReached { .. }) => {
            return error_body(StatusCode::SERVICE_UNAVAILABLE, "subscriber_limit", e.to_string())
        }
        Err(e @ FanoutError::Closed) => {
            return error_body(StatusCode::SERVICE_UNAVAILABLE, "closed", e.to_string())
        }
    };

    Sse::new(delta_stream(subscription))
        .keep_alive(
            KeepAlive::new()
                .interval(state.keep_alive)
                .text("keep-alive"),
        )
        .into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct DeadLetterParams {
    pub limit: Option<usize>,
}

/// GET /dead-letters - most recent dead-lettered entries, newest first.
async fn dead_letters_handler(
    State(state): State<ApiState>,
    Query(params): Query<DeadLetterParams>,
) -> Response {
    let limit = params.limit.unwrap_or(DEFAULT_DEAD_LETTER_LIMIT);
    let entries: Vec<serde_json::Value> = state
        .dead_letters
        .recent(limit)
        .iter()
        .filter_map(|letter| serde_json::to_value(letter.to_view()).ok())
        .collect();

    (StatusCode::OK, Json(entries)).into_response()
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::fanout::{Delta, DeltaKind};
    use crate::store::AggregationStore;
    use crate::topology::{Topology, Watermark};
    use crate::window::{Window, WindowAssigner};

    fn state() -> ApiState {
        let store = Arc::new(AggregationStore::new(0));
        let fanout = Fanout::new(16, 0);
        let dead_letters = Arc::new(DeadLetterSink::new(16));
        let topology = Arc::new(Topology::new(
            WindowAssigner::from_millis(5_000, 5_000).unwrap(),
            Arc::clone(&store),
            Arc::new(Watermark::new()),
            fanout.clone(),
            Arc::clone(&dead_letters),
        ));
        let gateway = Arc::new(Gateway::start(
            topology,
            2,
            16,
            CancellationToken::new(),
            None,
        ));

        ApiState {
            gateway,
            query: QueryService::new(store, Duration::from_secs(1)),
            fanout,
            dead_letters,
            keep_alive: Duration::from_secs(15),
        }
    }

    async fn publish(state: &ApiState, body: &'static str) -> StatusCode {
        publish_handler(State(state.clone()), Bytes::from_static(body.as_bytes()))
            .await
            .status()
    }

    #[tokio::test]
    async fn test_publish_then_query() {
        let state = state();
        for ts in [0, 2_000, 4_000] {
            let body = format!(
                r#"{{"stream":"pageviews","key":"u1","timestamp":{ts},"attributes":{{"page":"P1"}}}}"#
            );
            let status = publish_handler(State(state.clone()), Bytes::from(body))
                .await
                .status();
            assert_eq!(status, StatusCode::ACCEPTED);
        }
        state.gateway.stop().await.unwrap();

        let rows = state.query.query("P1", 0, 0).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].count, 3);

        let resp = query_handler(
            State(state.clone()),
            Query(QueryParams {
                key: "P1".into(),
                from: Some(0),
                to: None,
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_malformed_publish_is_dead_lettered() {
        let state = state();
        assert_eq!(publish(&state, "{not json").await, StatusCode::BAD_REQUEST);
        assert_eq!(state.dead_letters.len(), 1);
        assert_eq!(state.dead_letters.recent(1)[0].reason, "malformed");

        let resp = dead_letters_handler(State(state.clone()), Query(DeadLetterParams::default())).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_publish_after_stop_is_unavailable() {
        let state = state();
        state.gateway.stop().await.unwrap();
        let status = publish(
            &state,
            r#"{"stream":"s","key":"u1","timestamp":1,"attributes":{"page":"P1"}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_query_invalid_range_is_bad_request() {
        let state = state();
        let resp = query_handler(
            State(state),
            Query(QueryParams {
                key: "P1".into(),
                from: Some(10),
                to: Some(5),
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_subscribe_params_filter() {
        let keys = SubscribeParams {
            keys: Some("P1, P2,".into()),
            prefix: Some("ignored".into()),
        };
        assert_eq!(keys.filter(), KeyFilter::keys(["P1", "P2"]));

        let prefix = SubscribeParams {
            keys: None,
            prefix: Some("P".into()),
        };
        assert_eq!(prefix.filter(), KeyFilter::Prefix("P".into()));
        assert_eq!(SubscribeParams::default().filter(), KeyFilter::All);
    }

    #[tokio::test]
    async fn test_delta_stream_yields_and_unsubscribes_on_drop() {
        let fanout = Fanout::new(8, 0);
        let sub = fanout.subscribe(KeyFilter::All).unwrap();
        let mut stream = Box::pin(delta_stream(sub));

        fanout.publish(&Delta {
            key: "P1".into(),
            window: Window { start: 0, end: 5_000 },
            count: 1,
            kind: DeltaKind::Update,
        });
        let first = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("stream stalled");
        assert!(matches!(first, Some(Ok(_))));

        drop(stream);
        assert_eq!(fanout.subscriber_count(), 0);
    }
}
