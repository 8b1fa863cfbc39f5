//! Event processing: filter, key extraction, window assignment,
//! aggregation and watermark advance.

pub mod dead_letter;
pub mod stats;
pub mod watermark;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::event::{Event, EventTime};
use crate::export::HealthMetrics;
use crate::fanout::{Delta, Fanout};
use crate::ingest::IngestError;
use crate::store::{Aggregate, AggregationStore, StoreError, WindowedKey};
use crate::window::{Window, WindowAssigner};

pub use self::dead_letter::{DeadLetter, DeadLetterSink};
pub use self::stats::{StageCounts, TopologyStats};
pub use self::watermark::Watermark;

/// What to do with an event some of whose windows are already closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatePolicy {
    /// Reject the whole event if any window is closed.
    #[default]
    DeadLetter,
    /// Count the event in its open windows only; dead-letter if none remain.
    ApplyOpen,
}

/// Keeps events whose numeric attribute exceeds a threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFilter {
    attribute: String,
    threshold: f64,
}

impl EventFilter {
    pub fn new(attribute: impl Into<String>, threshold: f64) -> Self {
        Self {
            attribute: attribute.into(),
            threshold,
        }
    }

    /// Numeric strings are accepted; a missing or non-numeric attribute fails.
    pub fn matches(&self, event: &Event) -> bool {
        let value = match event.attribute(&self.attribute) {
            Some(serde_json::Value::Number(n)) => n.as_f64(),
            Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        value.is_some_and(|v| v > self.threshold)
    }
}

/// Derives the aggregation key from a fixed event attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExtractor {
    attribute: String,
}

impl KeyExtractor {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
        }
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    pub fn extract(&self, event: &Event) -> Result<String, IngestError> {
        let key = match event.attribute(&self.attribute) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            Some(serde_json::Value::Bool(b)) => b.to_string(),
            _ => String::new(),
        };

        if key.is_empty() {
            return Err(IngestError::MissingKey {
                attribute: self.attribute.clone(),
            });
        }
        Ok(key)
    }
}

/// Result of a successfully processed event.
#[derive(Debug, Clone, PartialEq)]
pub enum Processed {
    /// Rejected by the filter. No side effects.
    Filtered,
    /// Counted in every listed aggregate.
    Aggregated {
        key: String,
        aggregates: Vec<Aggregate>,
        /// The event was behind the watermark when it arrived.
        late: bool,
    },
}

/// Drives the store from a stream of events.
pub struct Topology {
    assigner: WindowAssigner,
    store: Arc<AggregationStore>,
    watermark: Arc<Watermark>,
    fanout: Fanout,
    dead_letters: Arc<DeadLetterSink>,
    filter: Option<EventFilter>,
    key_extractor: KeyExtractor,
    allowed_lateness_ms: i64,
    late_policy: LatePolicy,
    stats: TopologyStats,
    health: Option<Arc<HealthMetrics>>,
}

impl Topology {
    /// Creates a topology with no filter, key attribute `page` and no
    /// allowed lateness.
    pub fn new(
        assigner: WindowAssigner,
        store: Arc<AggregationStore>,
        watermark: Arc<Watermark>,
        fanout: Fanout,
        dead_letters: Arc<DeadLetterSink>,
    ) -> Self {
        Self {
            assigner,
            store,
            watermark,
            fanout,
            dead_letters,
            filter: None,
            key_extractor: KeyExtractor::new("page"),
            allowed_lateness_ms: 0,
            late_policy: LatePolicy::default(),
            stats: TopologyStats::new(),
            health: None,
        }
    }

    pub fn with_filter(mut self, filter: Option<EventFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_key_extractor(mut self, key_extractor: KeyExtractor) -> Self {
        self.key_extractor = key_extractor;
        self
    }

    pub fn with_allowed_lateness(mut self, allowed_lateness: Duration) -> Self {
        self.allowed_lateness_ms = i64::try_from(allowed_lateness.as_millis()).unwrap_or(i64::MAX);
        self
    }

    pub fn with_late_policy(mut self, late_policy: LatePolicy) -> Self {
        self.late_policy = late_policy;
        self
    }

    pub fn with_health(mut self, health: Option<Arc<HealthMetrics>>) -> Self {
        self.health = health;
        self
    }

    pub fn store(&self) -> &Arc<AggregationStore> {
        &self.store
    }

    pub fn watermark(&self) -> &Arc<Watermark> {
        &self.watermark
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterSink> {
        &self.dead_letters
    }

    pub fn stats(&self) -> &TopologyStats {
        &self.stats
    }

    /// Processes one event. Errors have already been dead-lettered when
    /// returned.
    pub fn process(&self, event: Event) -> Result<Processed, IngestError> {
        let started = Instant::now();
        self.stats.record_received();

        let result = self.apply(&event);

        match &result {
            Ok(Processed::Filtered) => {
                self.stats.record_filtered();
                if let Some(ref h) = self.health {
                    h.events_filtered.inc();
                }
            }
            Ok(Processed::Aggregated { aggregates, late, .. }) => {
                self.stats.record_aggregated();
                if *late {
                    self.stats.record_late();
                }
                if let Some(ref h) = self.health {
                    h.events_aggregated.inc();
                    if *late {
                        h.events_late.inc();
                    }
                    h.watermark.set(self.watermark.current() as f64);
                }
                for agg in aggregates {
                    self.fanout.publish(&Delta::update(agg));
                }
            }
            Err(err) => self.dead_letter(event, err),
        }

        if let Some(ref h) = self.health {
            h.event_processing_duration
                .observe(started.elapsed().as_secs_f64());
        }

        result
    }

    fn apply(&self, event: &Event) -> Result<Processed, IngestError> {
        if let Some(ref filter) = self.filter {
            if !filter.matches(event) {
                return Ok(Processed::Filtered);
            }
        }

        let key = self.key_extractor.extract(event)?;
        let ts = event.timestamp();

        let watermark = self.watermark.current();
        let late = ts < watermark;
        let windows = self.open_windows(ts, watermark)?;

        let aggregates = self
            .store
            .increment_all(&key, &windows)
            .map_err(|e| match e {
                StoreError::WindowClosed { window, horizon } => IngestError::Late {
                    timestamp: ts,
                    window,
                    watermark: horizon,
                },
            })?;

        self.watermark
            .advance(ts.saturating_sub(self.allowed_lateness_ms));

        Ok(Processed::Aggregated {
            key,
            aggregates,
            late,
        })
    }

    /// Windows for `ts` that may still be written under the late policy.
    fn open_windows(&self, ts: EventTime, watermark: EventTime) -> Result<Vec<Window>, IngestError> {
        let grace_ms = self.store.grace_ms();
        let mut windows = self
            .assigner
            .assign(ts)
            .map_err(|e| IngestError::Malformed(e.to_string()))?;

        let closed = windows.iter().find(|w| w.is_closed(grace_ms, watermark)).copied();
        let Some(closed) = closed else {
            return Ok(windows);
        };

        let late = IngestError::Late {
            timestamp: ts,
            window: closed,
            watermark,
        };
        match self.late_policy {
            LatePolicy::DeadLetter => Err(late),
            LatePolicy::ApplyOpen => {
                windows.retain(|w| !w.is_closed(grace_ms, watermark));
                if windows.is_empty() {
                    Err(late)
                } else {
                    Ok(windows)
                }
            }
        }
    }

    fn dead_letter(&self, event: Event, err: &IngestError) {
        self.stats.record_dead_lettered();
        if let Some(ref h) = self.health {
            h.dead_letters.with_label_values(&[err.reason()]).inc();
        }
        self.dead_letters.record(DeadLetter::for_event(event, err));
    }

    /// Records a payload that could not be decoded into an event.
    pub fn dead_letter_payload(&self, raw: &[u8], err: &IngestError) {
        self.stats.record_dead_lettered();
        if let Some(ref h) = self.health {
            h.dead_letters.with_label_values(&[err.reason()]).inc();
        }
        self.dead_letters.record(DeadLetter::for_payload(raw, err));
    }

    /// Evicts every window closed at the current watermark, publishing
    /// each one's final value first.
    pub fn evict(&self) -> Vec<WindowedKey> {
        self.evict_at(self.watermark.current())
    }

    pub fn evict_at(&self, watermark: EventTime) -> Vec<WindowedKey> {
        if watermark == EventTime::MIN {
            return Vec::new();
        }

        let started = Instant::now();
        let evicted = self
            .store
            .evict_expired(watermark, |agg| self.fanout.publish(&Delta::final_value(agg)));

        if let Some(ref h) = self.health {
            h.windows_evicted.inc_by(evicted.len() as f64);
            h.eviction_duration.observe(started.elapsed().as_secs_f64());
        }
        if !evicted.is_empty() {
            tracing::debug!(
                watermark,
                evicted = evicted.len(),
                remaining = self.store.len(),
                "evicted closed windows"
            );
        }

        evicted
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::event::Attributes;
    use crate::fanout::KeyFilter;

    fn attrs(page: &str, duration: i64) -> Attributes {
        let mut a = Attributes::new();
        a.insert("page".into(), json!(page));
        a.insert("duration".into(), json!(duration));
        a
    }

    fn topology(size_ms: i64, hop_ms: i64, grace_ms: i64) -> Topology {
        Topology::new(
            WindowAssigner::from_millis(size_ms, hop_ms).unwrap(),
            Arc::new(AggregationStore::new(grace_ms)),
            Arc::new(Watermark::new()),
            Fanout::new(64, 0),
            Arc::new(DeadLetterSink::new(16)),
        )
        .with_filter(Some(EventFilter::new("duration", 0.0)))
    }

    fn window(start: i64, end: i64) -> Window {
        Window { start, end }
    }

    #[test]
    fn test_filter_matches_numeric_attribute() {
        let filter = EventFilter::new("duration", 10.0);
        assert!(filter.matches(&Event::new("u", 0, attrs("P1", 11))));
        assert!(!filter.matches(&Event::new("u", 0, attrs("P1", 10))));
        assert!(!filter.matches(&Event::new("u", 0, Attributes::new())));

        let mut text = Attributes::new();
        text.insert("duration".into(), json!("12.5"));
        assert!(filter.matches(&Event::new("u", 0, text)));
    }

    #[test]
    fn test_key_extractor_stringifies_scalars() {
        let extractor = KeyExtractor::new("page");
        let mut a = Attributes::new();
        a.insert("page".into(), json!(42));
        assert_eq!(extractor.extract(&Event::new("u", 0, a)).unwrap(), "42");

        let mut empty = Attributes::new();
        empty.insert("page".into(), json!(""));
        assert!(matches!(
            extractor.extract(&Event::new("u", 0, empty)),
            Err(IngestError::MissingKey { .. })
        ));
    }

    #[test]
    fn test_three_events_one_tumbling_window() {
        let topo = topology(5_000, 5_000, 0);
        for ts in [0, 2_000, 4_000] {
            topo.process(Event::new("u1", ts, attrs("P1", 5))).unwrap();
        }

        let agg = topo
            .store()
            .get(&WindowedKey::new("P1", window(0, 5_000)))
            .unwrap();
        assert_eq!(agg.count, 3);
    }

    #[test]
    fn test_filtered_event_has_no_side_effect() {
        let topo = topology(5_000, 5_000, 0);
        let out = topo.process(Event::new("u1", 1_000, attrs("P1", 0))).unwrap();

        assert_eq!(out, Processed::Filtered);
        assert!(topo.store().is_empty());
        assert!(topo.watermark().is_unset());
        assert!(topo.dead_letters().is_empty());
    }

    #[test]
    fn test_missing_key_is_dead_lettered() {
        let topo = topology(5_000, 5_000, 0);
        let mut a = Attributes::new();
        a.insert("duration".into(), json!(3));

        let err = topo.process(Event::new("u1", 1_000, a)).unwrap_err();
        assert!(matches!(err, IngestError::MissingKey { .. }));
        assert_eq!(topo.dead_letters().len(), 1);
        assert!(topo.store().is_empty());
    }

    #[test]
    fn test_late_event_after_eviction_is_dead_lettered() {
        let topo = topology(5_000, 5_000, 2_000);
        topo.process(Event::new("u1", 4_000, attrs("P1", 5))).unwrap();
        topo.process(Event::new("u1", 10_000, attrs("P2", 5))).unwrap();
        assert_eq!(topo.watermark().current(), 10_000);

        let evicted = topo.evict();
        assert_eq!(evicted, vec![WindowedKey::new("P1", window(0, 5_000))]);

        let err = topo.process(Event::new("u1", 1_000, attrs("P1", 5))).unwrap_err();
        assert!(matches!(err, IngestError::Late { .. }));
        assert_eq!(topo.dead_letters().len(), 1);
        assert!(topo
            .store()
            .get(&WindowedKey::new("P1", window(0, 5_000)))
            .is_none());
    }

    #[test]
    fn test_late_but_open_event_is_counted() {
        let topo = topology(5_000, 5_000, 2_000);
        topo.process(Event::new("u1", 6_000, attrs("P1", 5))).unwrap();

        // Window [0, 5000) closes at 7000; the watermark is 6000.
        let out = topo.process(Event::new("u1", 1_000, attrs("P1", 5))).unwrap();
        assert!(matches!(out, Processed::Aggregated { late: true, .. }));
        assert_eq!(topo.stats().snapshot().late, 1);
    }

    #[test]
    fn test_hopping_late_policy() {
        let strict = topology(10_000, 5_000, 0);
        strict.process(Event::new("u1", 12_000, attrs("P1", 5))).unwrap();
        // Event at 7000 maps to [0,10000) (closed) and [5000,15000) (open).
        assert!(strict.process(Event::new("u1", 7_000, attrs("P1", 5))).is_err());
        let open = strict
            .store()
            .get(&WindowedKey::new("P1", window(5_000, 15_000)))
            .unwrap();
        assert_eq!(open.count, 1);

        let lenient = topology(10_000, 5_000, 0).with_late_policy(LatePolicy::ApplyOpen);
        lenient.process(Event::new("u1", 12_000, attrs("P1", 5))).unwrap();
        let out = lenient.process(Event::new("u1", 7_000, attrs("P1", 5))).unwrap();
        match out {
            Processed::Aggregated { aggregates, .. } => {
                assert_eq!(aggregates.len(), 1);
                assert_eq!(aggregates[0].window(), window(5_000, 15_000));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_allowed_lateness_holds_back_watermark() {
        let topo = topology(5_000, 5_000, 0).with_allowed_lateness(Duration::from_secs(3));
        topo.process(Event::new("u1", 10_000, attrs("P1", 5))).unwrap();
        assert_eq!(topo.watermark().current(), 7_000);
    }

    #[test]
    fn test_updates_and_finals_are_published() {
        let fanout = Fanout::new(64, 0);
        let sub = fanout.subscribe(KeyFilter::keys(["P1"])).unwrap();
        let topo = Topology::new(
            WindowAssigner::from_millis(5_000, 5_000).unwrap(),
            Arc::new(AggregationStore::new(0)),
            Arc::new(Watermark::new()),
            fanout,
            Arc::new(DeadLetterSink::new(16)),
        );

        topo.process(Event::new("u1", 1_000, attrs("P1", 5))).unwrap();
        topo.process(Event::new("u1", 2_000, attrs("P1", 5))).unwrap();
        let pending = sub.try_recv().unwrap();
        assert_eq!(pending.count, 2);
        assert!(!pending.is_final());

        topo.process(Event::new("u1", 9_000, attrs("P2", 5))).unwrap();
        topo.evict();
        let last = sub.try_recv().unwrap();
        assert!(last.is_final());
        assert_eq!(last.count, 2);
    }

    #[test]
    fn test_hopping_updates_reach_subscriber() {
        let fanout = Fanout::new(64, 0);
        let sub = fanout.subscribe(KeyFilter::keys(["P1"])).unwrap();
        let topo = Topology::new(
            WindowAssigner::from_millis(10_000, 5_000).unwrap(),
            Arc::new(AggregationStore::new(0)),
            Arc::new(Watermark::new()),
            fanout.clone(),
            Arc::new(DeadLetterSink::new(16)),
        );
        let drain = || {
            std::iter::from_fn(|| sub.try_recv())
                .map(|d| (d.window.start, d.count))
                .collect::<Vec<_>>()
        };

        topo.process(Event::new("u1", 7_000, attrs("P1", 5))).unwrap();
        topo.process(Event::new("u1", 8_000, attrs("P1", 5))).unwrap();
        assert_eq!(drain(), vec![(0, 2), (5_000, 2)]);

        // Window 0 was already passed on this subscription.
        topo.process(Event::new("u1", 9_000, attrs("P1", 5))).unwrap();
        assert_eq!(drain(), vec![(5_000, 3)]);
        assert_eq!(fanout.stats().stale, 1);
        assert_eq!(
            topo.store()
                .get(&WindowedKey::new("P1", window(0, 10_000)))
                .unwrap()
                .count,
            3
        );
    }

    #[test]
    fn test_extreme_timestamp_is_dead_lettered() {
        let topo = topology(5_000, 5_000, 0);
        for ts in [i64::MIN, i64::MAX] {
            let err = topo.process(Event::new("u1", ts, attrs("P1", 5))).unwrap_err();
            assert!(matches!(err, IngestError::Malformed(_)));
        }
        assert!(topo.store().is_empty());
        assert!(topo.watermark().is_unset());
        assert_eq!(topo.dead_letters().len(), 2);

        topo.process(Event::new("u1", 1_000, attrs("P1", 5))).unwrap();
        assert_eq!(topo.store().len(), 1);
    }

    #[test]
    fn test_evict_before_first_event_is_noop() {
        let topo = topology(5_000, 5_000, 0);
        assert!(topo.evict().is_empty());
    }
}
