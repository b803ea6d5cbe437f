//! Inbound event queue: validation, dedup, supersession, bounding, and the
//! readiness gate.
//!
//! `receive_event` never blocks the feed: enqueue is synchronous and cheap,
//! processing happens in the engine's drain loop. The queue exists purely to
//! buffer and deduplicate feed traffic so the decision engine sees one
//! clean, bounded stream.
//!
//! Purchase-completion events are special throughout: they are exempt from
//! dedup and supersession, and the overflow eviction prefers to drop
//! anything else first. Every purchase signal must be processed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::events::{parse_event, DedupKey, EventRejection, FeedEvent};
use crate::stats::EngineStats;

/// Queue tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum queued events.
    pub capacity: usize,
    /// Window within which same-key events collapse.
    pub dedup_cooldown: Duration,
    /// Log a drop warning once per this many drops.
    pub drop_warn_every: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            dedup_cooldown: Duration::from_secs(5),
            drop_warn_every: 50,
        }
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    queue: VecDeque<FeedEvent>,
    last_enqueued: HashMap<DedupKey, Instant>,
}

/// Bounded, deduplicating event queue.
pub struct EventQueue {
    config: QueueConfig,
    /// Collections in the active config; events for others are discarded.
    watched: HashSet<String>,
    /// While false, every incoming event is discarded immediately.
    ready: AtomicBool,
    inner: Mutex<QueueInner>,
    /// Signaled on enqueue so the drain loop can sleep when idle.
    enqueued: Notify,
    stats: Arc<EngineStats>,
}

impl EventQueue {
    pub fn new(config: QueueConfig, watched: HashSet<String>, stats: Arc<EngineStats>) -> Self {
        Self {
            config,
            watched,
            ready: AtomicBool::new(false),
            inner: Mutex::new(QueueInner::default()),
            enqueued: Notify::new(),
            stats,
        }
    }

    /// Ingest a raw feed message. Never blocks; invalid, unwatched and
    /// pre-ready traffic is counted and discarded.
    pub fn receive_event(&self, raw: &Value) {
        EngineStats::inc(&self.stats.events_received);

        if !self.ready.load(Ordering::Acquire) {
            EngineStats::inc(&self.stats.events_discarded_pre_ready);
            return;
        }

        let event = match parse_event(raw) {
            Ok(event) => event,
            Err(EventRejection::Malformed(field)) => {
                EngineStats::inc(&self.stats.events_invalid);
                debug!(field, "discarding malformed feed event");
                return;
            }
            Err(EventRejection::UnwatchedKind(kind)) => {
                EngineStats::inc(&self.stats.events_unwatched);
                debug!(kind, "discarding unwatched event kind");
                return;
            }
        };

        if !self.watched.contains(&event.collection_symbol) {
            EngineStats::inc(&self.stats.events_unwatched);
            return;
        }

        let now = Instant::now();
        let mut inner = self.inner.lock();

        if event.kind.is_purchase() {
            // Purchases bypass dedup and supersession entirely.
            self.push_bounded(&mut inner, event);
            drop(inner);
            self.enqueued.notify_one();
            return;
        }

        let key = event.dedup_key();

        // Supersession: replace a same-key event still waiting in the queue.
        if let Some(waiting) = inner
            .queue
            .iter_mut()
            .find(|queued| !queued.kind.is_purchase() && queued.dedup_key() == key)
        {
            *waiting = event;
            inner.last_enqueued.insert(key, now);
            EngineStats::inc(&self.stats.events_superseded);
            return;
        }

        // Dedup: a same-key event was enqueued within the cooldown and has
        // already left the queue; drop the newcomer.
        if let Some(last) = inner.last_enqueued.get(&key) {
            if now.duration_since(*last) < self.config.dedup_cooldown {
                EngineStats::inc(&self.stats.events_deduped);
                return;
            }
        }

        inner.last_enqueued.insert(key, now);
        self.prune_dedup_index(&mut inner, now);
        self.push_bounded(&mut inner, event);
        drop(inner);
        self.enqueued.notify_one();
    }

    /// Enqueue with capacity enforcement. Eviction prefers the oldest
    /// non-purchase event; only when every queued event is a purchase does
    /// the oldest purchase go.
    fn push_bounded(&self, inner: &mut QueueInner, event: FeedEvent) {
        while inner.queue.len() >= self.config.capacity {
            let victim = inner
                .queue
                .iter()
                .position(|queued| !queued.kind.is_purchase())
                .unwrap_or(0);
            let dropped = inner.queue.remove(victim);
            let total = EngineStats::inc(&self.stats.events_dropped);
            // A warning every Nth drop, not every drop, to avoid log storms.
            if total % self.config.drop_warn_every == 0 {
                warn!(
                    dropped_total = total,
                    victim = %dropped.map(|e| e.to_string()).unwrap_or_default(),
                    "event queue full, evicting oldest events"
                );
            }
        }
        inner.queue.push_back(event);
    }

    /// Drop dedup bookkeeping that has aged past the cooldown. Keeps the
    /// index bounded under sustained traffic.
    fn prune_dedup_index(&self, inner: &mut QueueInner, now: Instant) {
        if inner.last_enqueued.len() > self.config.capacity * 4 {
            let cooldown = self.config.dedup_cooldown;
            inner
                .last_enqueued
                .retain(|_, last| now.duration_since(*last) < cooldown);
        }
    }

    /// Flip the readiness gate. Whatever accumulated before steady state is
    /// discarded as unreliable backlog and folded into the pre-ready count.
    pub fn set_ready(&self) {
        let discarded = {
            let mut inner = self.inner.lock();
            let n = inner.queue.len();
            inner.queue.clear();
            inner.last_enqueued.clear();
            n
        };
        for _ in 0..discarded {
            EngineStats::inc(&self.stats.events_discarded_pre_ready);
        }
        self.ready.store(true, Ordering::Release);
        debug!(discarded, "event queue ready");
    }

    /// Whether the readiness gate is open.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Dequeue the oldest event.
    pub fn pop(&self) -> Option<FeedEvent> {
        self.inner.lock().queue.pop_front()
    }

    /// Current queue depth.
    pub fn depth(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Suspend until at least one event is queued.
    pub async fn wait_nonempty(&self) {
        loop {
            if self.depth() > 0 {
                return;
            }
            self.enqueued.notified().await;
        }
    }
}

/// Exclusion between the two event producers. A queue drain and a scheduled
/// cycle must never concurrently evaluate the same bid-history state; each
/// takes this gate for its duration.
///
/// The source of this design used two advisory flags polled on timers, valid
/// only under single-threaded cooperative scheduling. On a multi-threaded
/// runtime a real async mutex provides the same rule with actual exclusion.
#[derive(Clone, Default)]
pub struct ProducerGate {
    inner: Arc<tokio::sync::Mutex<()>>,
}

impl ProducerGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the gate for one drain batch or one scheduled cycle.
    pub async fn enter(&self) -> tokio::sync::OwnedMutexGuard<()> {
        Arc::clone(&self.inner).lock_owned().await
    }

    /// Non-blocking probe, used by stats.
    pub fn is_busy(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use serde_json::json;

    fn queue_with(capacity: usize) -> EventQueue {
        let mut watched = HashSet::new();
        watched.insert("monkes".to_string());
        watched.insert("other".to_string());
        let queue = EventQueue::new(
            QueueConfig {
                capacity,
                dedup_cooldown: Duration::from_secs(5),
                drop_warn_every: 50,
            },
            watched,
            Arc::new(EngineStats::new()),
        );
        queue.set_ready();
        queue
    }

    fn offer_placed(token: &str, price: u64) -> Value {
        json!({
            "kind": "offer_placed",
            "collectionSymbol": "monkes",
            "tokenId": token,
            "listedPrice": price,
            "buyerPaymentAddress": "bc1q-competitor",
        })
    }

    fn purchase(token: &str) -> Value {
        json!({
            "kind": "buying_broadcasted",
            "collectionSymbol": "monkes",
            "tokenId": token,
        })
    }

    #[test]
    fn test_same_key_supersedes_in_place() {
        let queue = queue_with(1000);
        queue.receive_event(&offer_placed("t1", 100));
        queue.receive_event(&offer_placed("t1", 120));

        assert_eq!(queue.depth(), 1);
        let event = queue.pop().unwrap();
        // Latest data wins.
        assert_eq!(event.listed_price, Some(120));
        assert_eq!(queue.stats.events_superseded.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_dedup_after_drain_within_cooldown() {
        let queue = queue_with(1000);
        queue.receive_event(&offer_placed("t1", 100));
        assert!(queue.pop().is_some());

        // Same key arrives again inside the cooldown; nothing re-queues.
        queue.receive_event(&offer_placed("t1", 110));
        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.stats.events_deduped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_purchases_exempt_from_dedup_and_supersession() {
        let queue = queue_with(1000);
        queue.receive_event(&purchase("t1"));
        queue.receive_event(&purchase("t1"));
        // Both purchase signals must be present.
        assert_eq!(queue.depth(), 2);
    }

    #[test]
    fn test_different_tokens_do_not_collapse() {
        let queue = queue_with(1000);
        queue.receive_event(&offer_placed("t1", 100));
        queue.receive_event(&offer_placed("t2", 100));
        assert_eq!(queue.depth(), 2);
    }

    #[test]
    fn test_overflow_evicts_oldest_non_purchase() {
        let queue = queue_with(3);
        queue.receive_event(&purchase("p1"));
        queue.receive_event(&offer_placed("t1", 100));
        queue.receive_event(&offer_placed("t2", 100));
        // Queue full; t1 (oldest non-purchase) must go, not p1.
        queue.receive_event(&offer_placed("t3", 100));

        assert_eq!(queue.depth(), 3);
        let kinds_tokens: Vec<(EventKind, Option<String>)> =
            std::iter::from_fn(|| queue.pop().map(|e| (e.kind, e.token_id))).collect();
        assert_eq!(
            kinds_tokens[0],
            (EventKind::BuyingBroadcasted, Some("p1".to_string()))
        );
        assert_eq!(
            kinds_tokens[1],
            (EventKind::OfferPlaced, Some("t2".to_string()))
        );
        assert_eq!(
            kinds_tokens[2],
            (EventKind::OfferPlaced, Some("t3".to_string()))
        );
        assert_eq!(queue.stats.events_dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_overflow_all_purchases_evicts_oldest() {
        let queue = queue_with(2);
        queue.receive_event(&purchase("p1"));
        queue.receive_event(&purchase("p2"));
        queue.receive_event(&purchase("p3"));

        assert_eq!(queue.depth(), 2);
        let first = queue.pop().unwrap();
        assert_eq!(first.token_id.as_deref(), Some("p2"));
    }

    #[test]
    fn test_pre_ready_discard_and_backlog_flush() {
        let mut watched = HashSet::new();
        watched.insert("monkes".to_string());
        let stats = Arc::new(EngineStats::new());
        let queue = EventQueue::new(QueueConfig::default(), watched, Arc::clone(&stats));

        // Not ready: discarded immediately, never queued.
        queue.receive_event(&offer_placed("t1", 100));
        assert_eq!(queue.depth(), 0);
        assert_eq!(stats.events_discarded_pre_ready.load(Ordering::Relaxed), 1);

        queue.set_ready();
        queue.receive_event(&offer_placed("t2", 100));
        assert_eq!(queue.depth(), 1);
    }

    #[test]
    fn test_unwatched_collection_discarded() {
        let queue = queue_with(1000);
        let raw = json!({
            "kind": "offer_placed",
            "collectionSymbol": "not-configured",
            "tokenId": "t1",
            "listedPrice": 100,
            "buyerPaymentAddress": "bc1q-x",
        });
        queue.receive_event(&raw);
        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.stats.events_unwatched.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_invalid_event_counted() {
        let queue = queue_with(1000);
        queue.receive_event(&json!({ "kind": 42 }));
        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.stats.events_invalid.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_producer_gate_excludes() {
        let gate = ProducerGate::new();
        let held = gate.enter().await;
        assert!(gate.is_busy());

        let gate2 = gate.clone();
        let mut waiter = tokio::spawn(async move {
            let _g = gate2.enter().await;
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), &mut waiter)
            .await
            .expect("gate must open after release")
            .unwrap();
    }
}
