//! Push fan-out of aggregate changes to live subscribers.
//!
//! Each subscription owns a bounded queue. Publishing never waits on a
//! subscriber: a pending delta for the same `(key, window)` is updated in
//! place, and a full queue sheds its oldest pending delta. Pending deltas
//! of one key are held by window start and delivered smallest first, so
//! deliveries for a key are non-decreasing in window start. A delta for a
//! window older than one already delivered is skipped and counted as stale;
//! the query service still serves that window.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;

use crate::event::EventTime;
use crate::export::HealthMetrics;
use crate::store::Aggregate;
use crate::window::Window;

/// Errors returned by [`Fanout::subscribe`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FanoutError {
    #[error("subscriber limit reached ({max_subscribers})")]
    SubscriberLimitReached { max_subscribers: usize },

    #[error("fan-out is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaKind {
    /// The count changed; more updates may follow.
    Update,
    /// The window was evicted; this is its last value.
    Final,
}

/// A change to one windowed count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub key: String,
    pub window: Window,
    pub count: u64,
    pub kind: DeltaKind,
}

impl Delta {
    pub fn update(agg: &Aggregate) -> Self {
        Self::from_aggregate(agg, DeltaKind::Update)
    }

    pub fn final_value(agg: &Aggregate) -> Self {
        Self::from_aggregate(agg, DeltaKind::Final)
    }

    fn from_aggregate(agg: &Aggregate, kind: DeltaKind) -> Self {
        Self {
            key: agg.key().to_string(),
            window: agg.window(),
            count: agg.count,
            kind,
        }
    }

    pub fn is_final(&self) -> bool {
        self.kind == DeltaKind::Final
    }

    /// JSON body sent to live-update clients.
    pub fn to_message(&self) -> DeltaMessage<'_> {
        DeltaMessage {
            key: &self.key,
            window_start: self.window.start,
            window_end: self.window.end,
            count: self.count,
            is_final: self.is_final(),
        }
    }

    /// Merges a newer delta for the same window into this one.
    fn absorb(&mut self, newer: Delta) {
        self.count = self.count.max(newer.count);
        if newer.is_final() {
            self.kind = DeltaKind::Final;
        }
    }
}

/// Wire shape: `{key, windowStart, windowEnd, count, final}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaMessage<'a> {
    pub key: &'a str,
    pub window_start: EventTime,
    pub window_end: EventTime,
    pub count: u64,
    #[serde(rename = "final")]
    pub is_final: bool,
}

/// Which keys a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFilter {
    All,
    Keys(HashSet<String>),
    Prefix(String),
}

impl KeyFilter {
    pub fn keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Keys(keys.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::All => true,
            Self::Keys(keys) => keys.contains(key),
            Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
        }
    }
}

/// Fan-out counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub published: u64,
    pub delivered: u64,
    pub coalesced: u64,
    pub dropped: u64,
    pub stale: u64,
    pub subscribers: usize,
}

/// Outcome of offering a delta to one queue.
#[derive(Debug, PartialEq, Eq)]
enum Offer {
    Enqueued,
    Coalesced,
    EnqueuedDroppingOldest,
    Stale,
    Closed,
}

/// One key's slice of a subscriber queue.
#[derive(Default)]
struct KeyQueue {
    /// Pending deltas by window start, with their arrival sequence.
    pending: BTreeMap<EventTime, (u64, Delta)>,
    /// Window start of the last delta delivered for this key.
    delivered: Option<EventTime>,
}

#[derive(Default)]
struct QueueState {
    /// Arrival sequence to `(key, window start)` for every pending delta.
    arrivals: BTreeMap<u64, (String, EventTime)>,
    keys: HashMap<String, KeyQueue>,
    next_seq: u64,
}

impl QueueState {
    fn len(&self) -> usize {
        self.arrivals.len()
    }

    fn offer(&mut self, delta: &Delta, capacity: usize) -> Offer {
        let start = delta.window.start;

        if let Some(slot) = self.keys.get_mut(delta.key.as_str()) {
            if slot.delivered.is_some_and(|delivered| start < delivered) {
                return Offer::Stale;
            }
            if let Some((_, pending)) = slot.pending.get_mut(&start) {
                pending.absorb(delta.clone());
                return Offer::Coalesced;
            }
        }

        let mut outcome = Offer::Enqueued;
        if self.len() >= capacity && self.drop_oldest().is_some() {
            outcome = Offer::EnqueuedDroppingOldest;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.arrivals.insert(seq, (delta.key.clone(), start));
        self.keys
            .entry(delta.key.clone())
            .or_default()
            .pending
            .insert(start, (seq, delta.clone()));
        outcome
    }

    /// Takes the smallest pending window of the key that has waited longest.
    fn pop(&mut self) -> Option<Delta> {
        let key = self.arrivals.first_key_value().map(|(_, (key, _))| key.clone())?;
        let slot = self.keys.get_mut(key.as_str())?;
        let (start, (seq, delta)) = slot.pending.pop_first()?;
        self.arrivals.remove(&seq);
        slot.delivered = Some(start);

        self.release_if_done(&key, &delta);
        Some(delta)
    }

    /// Removes the pending delta that arrived first.
    fn drop_oldest(&mut self) -> Option<Delta> {
        let (_, (key, start)) = self.arrivals.pop_first()?;
        let slot = self.keys.get_mut(key.as_str())?;
        let (_, delta) = slot.pending.remove(&start)?;

        if slot.pending.is_empty() && slot.delivered.is_none() {
            self.keys.remove(key.as_str());
        } else {
            self.release_if_done(&key, &delta);
        }
        Some(delta)
    }

    /// Forgets a key once its final value has left the queue with nothing
    /// else pending. Every window up to a final one is already evicted, so
    /// no older delta can follow.
    fn release_if_done(&mut self, key: &str, delta: &Delta) {
        let done = delta.is_final()
            && self
                .keys
                .get(key)
                .is_some_and(|slot| slot.pending.is_empty());
        if done {
            self.keys.remove(key);
        }
    }

    fn clear(&mut self) {
        self.arrivals.clear();
        self.keys.clear();
    }
}

struct SubscriberQueue {
    id: u64,
    filter: KeyFilter,
    capacity: usize,
    state: Mutex<QueueState>,
    closed: AtomicBool,
    notify: Notify,
}

impl SubscriberQueue {
    fn offer(&self, delta: &Delta) -> Offer {
        if self.closed.load(Ordering::Acquire) {
            return Offer::Closed;
        }

        let outcome = self.state.lock().offer(delta, self.capacity);
        if matches!(outcome, Offer::Enqueued | Offer::EnqueuedDroppingOldest) {
            self.notify.notify_one();
        }
        outcome
    }

    fn pop(&self) -> Option<Delta> {
        self.state.lock().pop()
    }

    fn len(&self) -> usize {
        self.state.lock().len()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.state.lock().clear();
            // Wake a pending recv so it observes the close.
            self.notify.notify_one();
        }
    }
}

struct FanoutInner {
    subscribers: ArcSwap<Vec<Arc<SubscriberQueue>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    max_subscribers: usize,
    closed: AtomicBool,
    published: AtomicU64,
    delivered: AtomicU64,
    coalesced: AtomicU64,
    dropped: AtomicU64,
    stale: AtomicU64,
    health: Option<Arc<HealthMetrics>>,
}

impl FanoutInner {
    fn unsubscribe(&self, id: u64) -> bool {
        let mut removed = None;
        self.subscribers.rcu(|subs| {
            removed = subs.iter().find(|s| s.id == id).cloned();
            subs.iter()
                .filter(|s| s.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });

        match removed {
            Some(queue) => {
                queue.close();
                if let Some(ref h) = self.health {
                    h.subscribers.dec();
                }
                tracing::debug!(subscription = id, "subscription closed");
                true
            }
            None => false,
        }
    }
}

/// Delivers aggregate changes to subscribers.
#[derive(Clone)]
pub struct Fanout {
    inner: Arc<FanoutInner>,
}

impl Fanout {
    /// Creates a fan-out whose subscriber queues hold up to `queue_capacity`
    /// pending deltas.
    pub fn new(queue_capacity: usize, max_subscribers: usize) -> Self {
        Self::with_health(queue_capacity, max_subscribers, None)
    }

    pub fn with_health(
        queue_capacity: usize,
        max_subscribers: usize,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            inner: Arc::new(FanoutInner {
                subscribers: ArcSwap::from_pointee(Vec::new()),
                next_id: AtomicU64::new(1),
                queue_capacity: queue_capacity.max(1),
                max_subscribers,
                closed: AtomicBool::new(false),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                stale: AtomicU64::new(0),
                health,
            }),
        }
    }

    /// Registers a new subscription.
    pub fn subscribe(&self, filter: KeyFilter) -> Result<Subscription, FanoutError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(FanoutError::Closed);
        }
        if inner.max_subscribers > 0 && inner.subscribers.load().len() >= inner.max_subscribers {
            return Err(FanoutError::SubscriberLimitReached {
                max_subscribers: inner.max_subscribers,
            });
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue {
            id,
            filter,
            capacity: inner.queue_capacity,
            state: Mutex::new(QueueState::default()),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        });

        inner.subscribers.rcu(|subs| {
            let mut next = Vec::with_capacity(subs.len() + 1);
            next.extend(subs.iter().cloned());
            next.push(Arc::clone(&queue));
            next
        });

        if let Some(ref h) = inner.health {
            h.subscribers.inc();
        }
        tracing::debug!(subscription = id, filter = ?queue.filter, "subscription opened");

        Ok(Subscription {
            id,
            queue,
            fanout: Arc::clone(inner),
        })
    }

    /// Removes a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.inner.unsubscribe(id)
    }

    /// Offers a delta to every matching subscription without blocking.
    pub fn publish(&self, delta: &Delta) {
        let inner = &self.inner;
        inner.published.fetch_add(1, Ordering::Relaxed);
        if let Some(ref h) = inner.health {
            h.deltas_published.inc();
        }

        let subs = inner.subscribers.load();
        for queue in subs.iter().filter(|q| q.filter.matches(&delta.key)) {
            match queue.offer(delta) {
                Offer::Enqueued | Offer::Closed => {}
                Offer::Stale => {
                    inner.stale.fetch_add(1, Ordering::Relaxed);
                    if let Some(ref h) = inner.health {
                        h.deltas_stale.inc();
                    }
                    tracing::trace!(
                        subscription = queue.id,
                        key = %delta.key,
                        window = %delta.window,
                        "newer window already delivered, skipped delta"
                    );
                }
                Offer::Coalesced => {
                    inner.coalesced.fetch_add(1, Ordering::Relaxed);
                    if let Some(ref h) = inner.health {
                        h.deltas_coalesced.inc();
                    }
                }
                Offer::EnqueuedDroppingOldest => {
                    inner.dropped.fetch_add(1, Ordering::Relaxed);
                    if let Some(ref h) = inner.health {
                        h.deltas_dropped.inc();
                    }
                    tracing::trace!(subscription = queue.id, "subscriber queue full, dropped oldest");
                }
            }
        }
    }

    /// Closes every subscription and refuses new ones.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let subs = self.inner.subscribers.load_full();
        for queue in subs.iter() {
            self.inner.unsubscribe(queue.id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.load().len()
    }

    pub fn stats(&self) -> FanoutStats {
        let inner = &self.inner;
        FanoutStats {
            published: inner.published.load(Ordering::Relaxed),
            delivered: inner.delivered.load(Ordering::Relaxed),
            coalesced: inner.coalesced.load(Ordering::Relaxed),
            dropped: inner.dropped.load(Ordering::Relaxed),
            stale: inner.stale.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    fanout: Arc<FanoutInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next delta. Returns `None` once the subscription is closed.
    pub async fn recv(&self) -> Option<Delta> {
        loop {
            if let Some(delta) = self.try_recv() {
                return Some(delta);
            }
            if self.is_closed() {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Returns the next pending delta, if any.
    pub fn try_recv(&self) -> Option<Delta> {
        let delta = self.queue.pop()?;
        self.fanout.delivered.fetch_add(1, Ordering::Relaxed);
        Some(delta)
    }

    /// Number of deltas waiting in this subscription's queue.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.queue.closed.load(Ordering::Acquire)
    }

    /// Unsubscribes. Safe to call more than once.
    pub fn close(&self) {
        self.fanout.unsubscribe(self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.fanout.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::*;
    use crate::store::WindowedKey;

    fn delta(key: &str, start: i64, count: u64) -> Delta {
        Delta {
            key: key.to_string(),
            window: Window {
                start,
                end: start + 5_000,
            },
            count,
            kind: DeltaKind::Update,
        }
    }

    fn final_delta(key: &str, start: i64, count: u64) -> Delta {
        Delta {
            kind: DeltaKind::Final,
            ..delta(key, start, count)
        }
    }

    #[test]
    fn test_publish_reaches_matching_subscribers() {
        let fanout = Fanout::new(16, 0);
        let p1 = fanout.subscribe(KeyFilter::keys(["P1"])).unwrap();
        let all = fanout.subscribe(KeyFilter::All).unwrap();
        let prefix = fanout.subscribe(KeyFilter::Prefix("Q".into())).unwrap();

        fanout.publish(&delta("P1", 0, 1));
        fanout.publish(&delta("P2", 0, 1));

        assert_eq!(p1.try_recv().unwrap().key, "P1");
        assert!(p1.try_recv().is_none());
        assert_eq!(all.pending(), 2);
        assert!(prefix.try_recv().is_none());
    }

    #[test]
    fn test_same_window_is_coalesced() {
        let fanout = Fanout::new(16, 0);
        let sub = fanout.subscribe(KeyFilter::All).unwrap();

        for count in 1..=3 {
            fanout.publish(&delta("P1", 0, count));
        }

        assert_eq!(sub.pending(), 1);
        assert_eq!(sub.try_recv().unwrap().count, 3);
        assert_eq!(fanout.stats().coalesced, 2);
    }

    #[test]
    fn test_final_overrides_pending_update() {
        let fanout = Fanout::new(16, 0);
        let sub = fanout.subscribe(KeyFilter::All).unwrap();
        fanout.publish(&delta("P1", 0, 2));

        let agg = Aggregate {
            windowed_key: WindowedKey::new("P1", Window { start: 0, end: 5_000 }),
            count: 2,
            last_updated: SystemTime::UNIX_EPOCH,
        };
        fanout.publish(&Delta::final_value(&agg));

        let got = sub.try_recv().unwrap();
        assert!(got.is_final());
        assert_eq!(got.count, 2);
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let fanout = Fanout::new(2, 0);
        let sub = fanout.subscribe(KeyFilter::All).unwrap();

        fanout.publish(&delta("A", 0, 1));
        fanout.publish(&delta("B", 0, 1));
        fanout.publish(&delta("C", 0, 1));

        assert_eq!(sub.pending(), 2);
        assert_eq!(sub.try_recv().unwrap().key, "B");
        assert_eq!(sub.try_recv().unwrap().key, "C");
        assert_eq!(fanout.stats().dropped, 1);
    }

    #[test]
    fn test_pending_windows_deliver_smallest_first() {
        let fanout = Fanout::new(16, 0);
        let sub = fanout.subscribe(KeyFilter::All).unwrap();

        fanout.publish(&delta("P1", 5_000, 1));
        fanout.publish(&delta("P1", 0, 4));
        fanout.publish(&delta("P1", 10_000, 1));

        let starts: Vec<i64> = std::iter::from_fn(|| sub.try_recv())
            .map(|d| d.window.start)
            .collect();
        assert_eq!(starts, vec![0, 5_000, 10_000]);

        fanout.publish(&delta("P1", 5_000, 2));
        fanout.publish(&delta("P1", 10_000, 2));
        let got = sub.try_recv().unwrap();
        assert_eq!((got.window.start, got.count), (10_000, 2));
        assert!(sub.try_recv().is_none());
        assert_eq!(fanout.stats().stale, 1);
    }

    #[test]
    fn test_idle_subscriber_does_not_block_publish() {
        let fanout = Fanout::new(8, 0);
        let idle = fanout.subscribe(KeyFilter::All).unwrap();

        for i in 0..10_000 {
            fanout.publish(&delta(&format!("K{i}"), 0, 1));
        }

        assert_eq!(idle.pending(), 8);
        assert_eq!(fanout.stats().dropped, 10_000 - 8);
        assert!(idle.queue.state.lock().keys.len() <= 8);
    }

    #[test]
    fn test_key_state_released_after_final() {
        let fanout = Fanout::new(1, 0);
        let sub = fanout.subscribe(KeyFilter::All).unwrap();

        for i in 0..1_000 {
            let key = format!("K{i}");
            fanout.publish(&delta(&key, 0, 1));
            assert!(!sub.try_recv().unwrap().is_final());
            fanout.publish(&final_delta(&key, 0, 1));
            assert!(sub.try_recv().unwrap().is_final());
        }
        assert!(sub.queue.state.lock().keys.is_empty());

        // A final shed from a full queue releases its key too.
        fanout.publish(&delta("A", 0, 1));
        sub.try_recv().unwrap();
        fanout.publish(&final_delta("A", 0, 1));
        fanout.publish(&delta("B", 0, 1));
        {
            let state = sub.queue.state.lock();
            assert!(!state.keys.contains_key("A"));
            assert_eq!(state.keys.len(), 1);
        }

        // A released key starts over with its next window.
        fanout.publish(&delta("K0", 5_000, 1));
        assert_eq!(sub.try_recv().unwrap().window.start, 5_000);
    }

    #[test]
    fn test_drop_and_close_unsubscribe() {
        let fanout = Fanout::new(4, 0);
        let a = fanout.subscribe(KeyFilter::All).unwrap();
        let b = fanout.subscribe(KeyFilter::All).unwrap();
        assert_eq!(fanout.subscriber_count(), 2);

        let a_id = a.id();
        drop(a);
        assert_eq!(fanout.subscriber_count(), 1);
        assert!(!fanout.unsubscribe(a_id));

        b.close();
        b.close();
        assert!(b.is_closed());
        assert_eq!(fanout.subscriber_count(), 0);

        fanout.publish(&delta("P1", 0, 1));
        assert!(b.try_recv().is_none());
    }

    #[test]
    fn test_subscriber_limit() {
        let fanout = Fanout::new(4, 1);
        let _first = fanout.subscribe(KeyFilter::All).unwrap();
        assert_eq!(
            fanout.subscribe(KeyFilter::All).err(),
            Some(FanoutError::SubscriberLimitReached { max_subscribers: 1 })
        );
    }

    #[test]
    fn test_delta_message_shape() {
        let d = delta("P1", 0, 3);
        let json = serde_json::to_value(d.to_message()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "key": "P1",
                "windowStart": 0,
                "windowEnd": 5000,
                "count": 3,
                "final": false
            })
        );
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let fanout = Fanout::new(4, 0);
        let sub = fanout.subscribe(KeyFilter::All).unwrap();

        let publisher = fanout.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(&delta("P1", 0, 1));
        });

        let got = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("recv timed out");
        assert_eq!(got.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_fanout_close() {
        let fanout = Fanout::new(4, 0);
        let sub = fanout.subscribe(KeyFilter::All).unwrap();
        fanout.close();

        assert!(sub.recv().await.is_none());
        assert!(fanout.subscribe(KeyFilter::All).is_err());
    }
}
