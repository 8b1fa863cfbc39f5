use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "windowtally";

/// Prometheus metrics for pipeline health.
///
/// All metrics use the "windowtally" namespace. Grouped by stage:
/// - Ingestion: events in, filtered, aggregated, late, rejected
/// - Store: live aggregates, contention, eviction
/// - Fan-out: deltas and subscribers
/// - Query: latency and timeouts
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Ingestion ===
    /// Total events accepted by the gateway.
    pub events_received: Counter,
    /// Events skipped by the filter predicate.
    pub events_filtered: Counter,
    /// Events applied to the store.
    pub events_aggregated: Counter,
    /// Events whose timestamp was behind the watermark on arrival.
    pub events_late: Counter,
    /// Dead-lettered events by reason.
    pub dead_letters: CounterVec,
    /// Events refused at the gateway by reason (overloaded/closed).
    pub ingest_rejected: CounterVec,
    /// Per-event topology processing duration.
    pub event_processing_duration: Histogram,
    /// Pending events per partition queue.
    pub partition_queue_length: GaugeVec,
    /// Current watermark in epoch milliseconds.
    pub watermark: Gauge,

    // === Store ===
    /// Live windowed aggregates.
    pub aggregates_live: Gauge,
    /// Aggregation keys with at least one live window.
    pub keys_live: Gauge,
    /// Shard lock retries taken by increments.
    pub store_contention_retries: Counter,
    /// Windows removed by eviction.
    pub windows_evicted: Counter,
    /// Duration of an eviction sweep.
    pub eviction_duration: Histogram,

    // === Fan-out ===
    /// Deltas handed to the fan-out.
    pub deltas_published: Counter,
    /// Deltas merged into an already pending delta.
    pub deltas_coalesced: Counter,
    /// Pending deltas dropped because a subscriber queue was full.
    pub deltas_dropped: Counter,
    /// Deltas skipped for a window older than one already delivered.
    pub deltas_stale: Counter,
    /// Open subscriptions.
    pub subscribers: Gauge,

    // === Query ===
    /// Query latency.
    pub query_duration: Histogram,
    /// Queries that exceeded their deadline.
    pub query_timeouts: Counter,
}

fn counter(name: &str, help: &str) -> Result<Counter> {
    Ok(Counter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?)
}

fn gauge(name: &str, help: &str) -> Result<Gauge> {
    Ok(Gauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?)
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Ingestion ===
        let events_received = counter("events_received_total", "Total events accepted by the gateway.")?;
        let events_filtered = counter(
            "events_filtered_total",
            "Total events skipped by the filter predicate.",
        )?;
        let events_aggregated = counter(
            "events_aggregated_total",
            "Total events applied to the aggregation store.",
        )?;
        let events_late = counter(
            "events_late_total",
            "Total events that arrived behind the watermark.",
        )?;
        let dead_letters = CounterVec::new(
            Opts::new("dead_letters_total", "Total dead-lettered events by reason.")
                .namespace(NAMESPACE),
            &["reason"],
        )?;
        let ingest_rejected = CounterVec::new(
            Opts::new(
                "ingest_rejected_total",
                "Total events refused at the gateway by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let event_processing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "event_processing_duration_seconds",
                "Time to process one event through the topology.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![
                0.000_005, 0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.005,
            ]),
        )?;
        let partition_queue_length = GaugeVec::new(
            Opts::new(
                "partition_queue_length",
                "Pending events per ingestion partition.",
            )
            .namespace(NAMESPACE),
            &["partition"],
        )?;
        let watermark = gauge("watermark_ms", "Current watermark in epoch milliseconds.")?;

        // === Store ===
        let aggregates_live = gauge("aggregates_live", "Number of live windowed aggregates.")?;
        let keys_live = gauge("keys_live", "Number of aggregation keys with live windows.")?;
        let store_contention_retries = counter(
            "store_contention_retries_total",
            "Total shard lock retries taken by store increments.",
        )?;
        let windows_evicted = counter("windows_evicted_total", "Total windows evicted.")?;
        let eviction_duration = Histogram::with_opts(
            HistogramOpts::new(
                "eviction_duration_seconds",
                "Time spent in one eviction sweep.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        )?;

        // === Fan-out ===
        let deltas_published = counter(
            "deltas_published_total",
            "Total deltas handed to the fan-out.",
        )?;
        let deltas_coalesced = counter(
            "deltas_coalesced_total",
            "Total deltas merged into a pending delta for the same window.",
        )?;
        let deltas_dropped = counter(
            "deltas_dropped_total",
            "Total pending deltas dropped on full subscriber queues.",
        )?;
        let deltas_stale = counter(
            "deltas_stale_total",
            "Total deltas skipped because a newer window was already delivered for the key.",
        )?;
        let subscribers = gauge("subscribers", "Number of open subscriptions.")?;

        // === Query ===
        let query_duration = Histogram::with_opts(
            HistogramOpts::new("query_duration_seconds", "Interactive query latency.")
                .namespace(NAMESPACE)
                .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        let query_timeouts = counter("query_timeouts_total", "Total queries that timed out.")?;

        // Ingestion
        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_filtered.clone()))?;
        registry.register(Box::new(events_aggregated.clone()))?;
        registry.register(Box::new(events_late.clone()))?;
        registry.register(Box::new(dead_letters.clone()))?;
        registry.register(Box::new(ingest_rejected.clone()))?;
        registry.register(Box::new(event_processing_duration.clone()))?;
        registry.register(Box::new(partition_queue_length.clone()))?;
        registry.register(Box::new(watermark.clone()))?;

        // Store
        registry.register(Box::new(aggregates_live.clone()))?;
        registry.register(Box::new(keys_live.clone()))?;
        registry.register(Box::new(store_contention_retries.clone()))?;
        registry.register(Box::new(windows_evicted.clone()))?;
        registry.register(Box::new(eviction_duration.clone()))?;

        // Fan-out
        registry.register(Box::new(deltas_published.clone()))?;
        registry.register(Box::new(deltas_coalesced.clone()))?;
        registry.register(Box::new(deltas_dropped.clone()))?;
        registry.register(Box::new(deltas_stale.clone()))?;
        registry.register(Box::new(subscribers.clone()))?;

        // Query
        registry.register(Box::new(query_duration.clone()))?;
        registry.register(Box::new(query_timeouts.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            events_filtered,
            events_aggregated,
            events_late,
            dead_letters,
            ingest_rejected,
            event_processing_duration,
            partition_queue_length,
            watermark,
            aggregates_live,
            keys_live,
            store_contention_retries,
            windows_evicted,
            eviction_duration,
            deltas_published,
            deltas_coalesced,
            deltas_dropped,
            deltas_stale,
            subscribers,
            query_duration,
            query_timeouts,
        })
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        render_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let bind_addr = bind_address(&self.addr, ":9090");

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Expands the ":port" shorthand to a bindable address.
pub fn bind_address(addr: &str, fallback: &str) -> String {
    let addr = if addr.is_empty() { fallback } else { addr };
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn render_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match render_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
