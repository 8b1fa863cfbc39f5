use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::event::Event;
use crate::ingest::IngestError;

/// An event, or raw payload, that could not be processed.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub event: Option<Event>,
    /// Undecodable payload, truncated.
    pub raw: Option<String>,
    pub reason: &'static str,
    pub detail: String,
    pub received_at: SystemTime,
}

/// Longest raw payload prefix kept for a malformed event.
const MAX_RAW_BYTES: usize = 1024;

impl DeadLetter {
    pub fn for_event(event: Event, err: &IngestError) -> Self {
        Self {
            event: Some(event),
            raw: None,
            reason: err.reason(),
            detail: err.to_string(),
            received_at: SystemTime::now(),
        }
    }

    pub fn for_payload(raw: &[u8], err: &IngestError) -> Self {
        let end = raw.len().min(MAX_RAW_BYTES);
        Self {
            event: None,
            raw: Some(String::from_utf8_lossy(&raw[..end]).into_owned()),
            reason: err.reason(),
            detail: err.to_string(),
            received_at: SystemTime::now(),
        }
    }

    pub fn to_view(&self) -> DeadLetterView<'_> {
        DeadLetterView {
            event: self.event.as_ref(),
            raw: self.raw.as_deref(),
            reason: self.reason,
            detail: &self.detail,
            received_at: DateTime::<Utc>::from(self.received_at)
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// JSON shape served by the dead-letter endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterView<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<&'a Event>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<&'a str>,
    pub reason: &'a str,
    pub detail: &'a str,
    pub received_at: String,
}

/// Bounded in-memory sink keeping the most recent dead letters.
pub struct DeadLetterSink {
    entries: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
    total: AtomicU64,
}

impl DeadLetterSink {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            total: AtomicU64::new(0),
        }
    }

    /// Records an entry, discarding the oldest one when full.
    pub fn record(&self, letter: DeadLetter) {
        tracing::debug!(reason = letter.reason, detail = %letter.detail, "dead-lettered event");

        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(letter);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Up to `limit` most recent entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<DeadLetter> {
        self.entries.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries recorded since startup, including discarded ones.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}
