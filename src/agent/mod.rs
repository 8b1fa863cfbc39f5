use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::{ApiServer, ApiState};
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::fanout::Fanout;
use crate::ingest::Gateway;
use crate::query::QueryService;
use crate::store::AggregationStore;
use crate::topology::{DeadLetterSink, Topology, Watermark};

/// Agent wires all components: store, topology, gateway, fan-out, query
/// service and the HTTP servers.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    store: Arc<AggregationStore>,
    watermark: Arc<Watermark>,
    fanout: Fanout,
    dead_letters: Arc<DeadLetterSink>,
    topology: Arc<Topology>,
    query: QueryService,
    gateway: Option<Arc<Gateway>>,
    api: ApiServer,
    api_addr: Option<SocketAddr>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, validating the window geometry and building
    /// every component that does not need a runtime.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let assigner = cfg.window.assigner()?;

        let store = Arc::new(AggregationStore::new(cfg.window.grace_ms()));
        let watermark = Arc::new(Watermark::new());
        let fanout = Fanout::with_health(
            cfg.fanout.queue_capacity,
            cfg.fanout.max_subscribers,
            Some(Arc::clone(&health)),
        );
        let dead_letters = Arc::new(DeadLetterSink::new(cfg.dead_letter.capacity));

        let topology = Arc::new(
            Topology::new(
                assigner,
                Arc::clone(&store),
                Arc::clone(&watermark),
                fanout.clone(),
                Arc::clone(&dead_letters),
            )
            .with_filter(cfg.topology.event_filter())
            .with_key_extractor(cfg.topology.key_extractor())
            .with_allowed_lateness(cfg.window.allowed_lateness)
            .with_late_policy(cfg.window.late_policy)
            .with_health(Some(Arc::clone(&health))),
        );

        let query = QueryService::new(Arc::clone(&store), cfg.query.timeout)
            .with_health(Some(Arc::clone(&health)));
        let api = ApiServer::new(&cfg.api.addr);

        Ok(Self {
            cfg,
            health,
            store,
            watermark,
            fanout,
            dead_letters,
            topology,
            query,
            gateway: None,
            api,
            api_addr: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and begin accepting events.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Start health metrics server first so probes respond.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Ingestion workers.
        let gateway = Arc::new(Gateway::start(
            Arc::clone(&self.topology),
            self.cfg.topology.partitions,
            self.cfg.topology.partition_queue_size,
            self.cancel.child_token(),
            Some(Arc::clone(&self.health)),
        ));
        self.gateway = Some(Arc::clone(&gateway));

        // 2. Periodic eviction and reporting.
        self.spawn_eviction_task(Arc::clone(&gateway));
        self.spawn_stats_reporter();

        // 3. Public API.
        let state = ApiState {
            gateway,
            query: self.query.clone(),
            fanout: self.fanout.clone(),
            dead_letters: Arc::clone(&self.dead_letters),
            keep_alive: self.cfg.fanout.keep_alive,
        };
        let addr = self.api.start(state).await.context("starting api server")?;
        self.api_addr = Some(addr);

        info!(
            window_size = ?self.cfg.window.size,
            window_hop = ?self.cfg.window.hop,
            grace = ?self.store.grace(),
            commit_interval = ?self.cfg.topology.commit_interval(),
            "agent fully started"
        );

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Stop accepting HTTP traffic first.
        self.api.stop().await?;

        // Drain ingestion queues before the final sweep.
        if let Some(gateway) = self.gateway.take() {
            gateway.stop().await?;
        }

        // Signal background tasks to stop.
        self.cancel.cancel();

        let evicted = self.topology.evict();
        debug!(evicted = evicted.len(), "final eviction sweep");

        // Ends every live-update stream.
        self.fanout.close();

        self.health.stop().await?;

        info!(
            aggregates = self.store.len(),
            watermark = self.watermark.current(),
            "agent stopped"
        );

        Ok(())
    }

    /// Address the API server is bound to, once started.
    pub fn api_addr(&self) -> Option<SocketAddr> {
        self.api_addr
    }

    pub fn gateway(&self) -> Option<&Arc<Gateway>> {
        self.gateway.as_ref()
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn query(&self) -> &QueryService {
        &self.query
    }

    pub fn fanout(&self) -> &Fanout {
        &self.fanout
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Spawn the commit-interval eviction task.
    fn spawn_eviction_task(&self, gateway: Arc<Gateway>) {
        let cancel = self.cancel.clone();
        let topology = Arc::clone(&self.topology);
        let store = Arc::clone(&self.store);
        let health = Arc::clone(&self.health);
        let interval = self.cfg.topology.commit_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut reported_retries = 0u64;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let started = Instant::now();
                        let evicted = topology.evict();

                        let stats = store.stats();
                        health.aggregates_live.set(stats.aggregates as f64);
                        health.keys_live.set(stats.keys as f64);
                        health
                            .store_contention_retries
                            .inc_by(stats.contention_retries.saturating_sub(reported_retries) as f64);
                        reported_retries = stats.contention_retries;
                        gateway.report_queue_depths();

                        if !evicted.is_empty() {
                            debug!(
                                evicted = evicted.len(),
                                took = ?started.elapsed(),
                                "commit interval sweep",
                            );
                        }
                    }
                }
            }
        });
    }

    /// Spawn background stage counter reporter.
    fn spawn_stats_reporter(&self) {
        let cancel = self.cancel.clone();
        let topology = Arc::clone(&self.topology);
        let fanout = self.fanout.clone();
        let interval = self.cfg.topology.stats_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let counts = topology.stats().snapshot();
                        if counts.is_zero() {
                            continue;
                        }

                        let fanout_stats = fanout.stats();
                        info!(
                            received = counts.received,
                            filtered = counts.filtered,
                            aggregated = counts.aggregated,
                            late = counts.late,
                            dead_lettered = counts.dead_lettered,
                            watermark = topology.watermark().current(),
                            subscribers = fanout_stats.subscribers,
                            deltas_dropped = fanout_stats.dropped,
                            interval = ?interval,
                            "stage stats",
                        );
                    }
                }
            }
        });
    }
}
