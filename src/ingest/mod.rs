//! Ingestion gateway: the single boundary through which events enter.
//!
//! Events are routed by a hash of their record key to one of N bounded
//! partition queues, each drained by its own worker task that runs the
//! topology. A full queue is reported to the producer instead of blocking.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::event::{Event, EventTime};
use crate::export::HealthMetrics;
use crate::topology::Topology;
use crate::window::Window;

/// Per-event ingestion failure. Never aborts the stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("event has no usable {attribute:?} attribute")]
    MissingKey { attribute: String },

    #[error("malformed event: {0}")]
    Malformed(String),

    #[error("event at {timestamp} maps to closed window {window} (watermark {watermark})")]
    Late {
        timestamp: EventTime,
        window: Window,
        watermark: EventTime,
    },

    #[error("partition {partition} queue is full")]
    Overloaded { partition: usize },

    #[error("ingestion gateway is closed")]
    Closed,
}

impl IngestError {
    /// Short label used for metrics and dead-letter entries.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingKey { .. } => "missing_key",
            Self::Malformed(_) => "malformed",
            Self::Late { .. } => "late",
            Self::Overloaded { .. } => "overloaded",
            Self::Closed => "closed",
        }
    }

    /// Whether the producer may retry the same event later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Overloaded { .. })
    }

    /// Whether the event is routed to the dead-letter sink.
    pub fn is_dead_lettered(&self) -> bool {
        matches!(
            self,
            Self::MissingKey { .. } | Self::Malformed(_) | Self::Late { .. }
        )
    }
}

/// Gateway counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayStats {
    pub accepted: u64,
    pub overloaded: u64,
    pub pending: usize,
}

/// Partitioned worker pool feeding the topology.
pub struct Gateway {
    senders: Vec<mpsc::Sender<Event>>,
    queue_size: usize,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    accepted: AtomicU64,
    overloaded: AtomicU64,
    topology: Arc<Topology>,
    health: Option<Arc<HealthMetrics>>,
}

impl Gateway {
    /// Spawns one worker per partition. Must be called within a tokio runtime.
    pub fn start(
        topology: Arc<Topology>,
        partitions: usize,
        queue_size: usize,
        cancel: CancellationToken,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let partitions = partitions.max(1);
        let queue_size = queue_size.max(1);

        let mut senders = Vec::with_capacity(partitions);
        let mut workers = Vec::with_capacity(partitions);
        for partition in 0..partitions {
            let (tx, rx) = mpsc::channel(queue_size);
            senders.push(tx);
            workers.push(tokio::spawn(run_worker(
                partition,
                rx,
                Arc::clone(&topology),
                cancel.clone(),
            )));
        }

        tracing::info!(partitions, queue_size, "ingestion gateway started");

        Self {
            senders,
            queue_size,
            workers: parking_lot::Mutex::new(workers),
            cancel,
            closed: AtomicBool::new(false),
            accepted: AtomicU64::new(0),
            overloaded: AtomicU64::new(0),
            topology,
            health,
        }
    }

    /// Hands an event to its partition without waiting.
    pub fn ingest(&self, event: Event) -> Result<(), IngestError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.reject(IngestError::Closed));
        }

        let partition = self.partition_for(event.key());
        match self.senders[partition].try_send(event) {
            Ok(()) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                if let Some(ref h) = self.health {
                    h.events_received.inc();
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.overloaded.fetch_add(1, Ordering::Relaxed);
                Err(self.reject(IngestError::Overloaded { partition }))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(self.reject(IngestError::Closed)),
        }
    }

    /// Records an undecodable payload on the dead-letter path.
    pub fn reject_payload(&self, raw: &[u8], err: &IngestError) {
        self.topology.dead_letter_payload(raw, err);
    }

    fn reject(&self, err: IngestError) -> IngestError {
        if let Some(ref h) = self.health {
            h.ingest_rejected.with_label_values(&[err.reason()]).inc();
        }
        err
    }

    /// Stable partition for a record key.
    pub fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    pub fn partitions(&self) -> usize {
        self.senders.len()
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Events waiting in partition queues.
    pub fn pending(&self) -> usize {
        self.senders
            .iter()
            .map(|tx| self.queue_size - tx.capacity())
            .sum()
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            overloaded: self.overloaded.load(Ordering::Relaxed),
            pending: self.pending(),
        }
    }

    /// Publishes per-partition queue depth to the health metrics.
    pub fn report_queue_depths(&self) {
        if let Some(ref h) = self.health {
            for (partition, tx) in self.senders.iter().enumerate() {
                let label = partition.to_string();
                h.partition_queue_length
                    .with_label_values(&[label.as_str()])
                    .set((self.queue_size - tx.capacity()) as f64);
            }
        }
    }

    /// Refuses new events, lets workers drain their queues and waits for them.
    pub async fn stop(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "ingestion worker panicked");
            }
        }

        tracing::info!(accepted = self.accepted.load(Ordering::Relaxed), "ingestion gateway stopped");

        Ok(())
    }
}

async fn run_worker(
    partition: usize,
    mut rx: mpsc::Receiver<Event>,
    topology: Arc<Topology>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => {
                let Some(event) = event else { return };
                handle_event(partition, &topology, event);
            }
        }
    }

    // Drain what was accepted before shutdown.
    rx.close();
    while let Some(event) = rx.recv().await {
        handle_event(partition, &topology, event);
    }
}

fn handle_event(partition: usize, topology: &Topology, event: Event) {
    if let Err(e) = topology.process(event) {
        tracing::debug!(partition, error = %e, "event rejected");
    }
}
