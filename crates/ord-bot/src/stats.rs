//! Engine-wide counters and the periodic stats snapshot.
//!
//! Counters use relaxed atomics; exact interleaving is not critical, only
//! monotonic totals. The snapshot is what gets written to the 30-second
//! stats file and is the surface operators watch.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Counters updated on the hot path.
#[derive(Debug)]
pub struct EngineStats {
    /// Unique id for this engine run.
    session_id: Uuid,
    /// Engine start time.
    started_at: DateTime<Utc>,

    // Event ingestion.
    pub events_received: AtomicU64,
    pub events_invalid: AtomicU64,
    pub events_unwatched: AtomicU64,
    pub events_discarded_pre_ready: AtomicU64,
    pub events_deduped: AtomicU64,
    pub events_superseded: AtomicU64,
    pub events_dropped: AtomicU64,
    pub events_processed: AtomicU64,

    // Bid outcomes.
    pub bids_placed: AtomicU64,
    pub bids_skipped: AtomicU64,
    pub bids_cancelled: AtomicU64,
    pub counter_bids: AtomicU64,
    pub bid_errors: AtomicU64,
    pub purchases: AtomicU64,

    // Scheduling.
    pub cycles_run: AtomicU64,
    pub cycles_skipped_rate_limited: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            events_received: AtomicU64::new(0),
            events_invalid: AtomicU64::new(0),
            events_unwatched: AtomicU64::new(0),
            events_discarded_pre_ready: AtomicU64::new(0),
            events_deduped: AtomicU64::new(0),
            events_superseded: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            events_processed: AtomicU64::new(0),
            bids_placed: AtomicU64::new(0),
            bids_skipped: AtomicU64::new(0),
            bids_cancelled: AtomicU64::new(0),
            counter_bids: AtomicU64::new(0),
            bid_errors: AtomicU64::new(0),
            purchases: AtomicU64::new(0),
            cycles_run: AtomicU64::new(0),
            cycles_skipped_rate_limited: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Snapshot of all counters plus runtime gauges supplied by the engine.
    pub fn snapshot(&self, gauges: RuntimeGauges) -> StatsSnapshot {
        StatsSnapshot {
            session_id: self.session_id,
            started_at: self.started_at,
            captured_at: Utc::now(),
            events_received: self.events_received.load(Ordering::Relaxed),
            events_invalid: self.events_invalid.load(Ordering::Relaxed),
            events_unwatched: self.events_unwatched.load(Ordering::Relaxed),
            events_discarded_pre_ready: self.events_discarded_pre_ready.load(Ordering::Relaxed),
            events_deduped: self.events_deduped.load(Ordering::Relaxed),
            events_superseded: self.events_superseded.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            bids_placed: self.bids_placed.load(Ordering::Relaxed),
            bids_skipped: self.bids_skipped.load(Ordering::Relaxed),
            bids_cancelled: self.bids_cancelled.load(Ordering::Relaxed),
            counter_bids: self.counter_bids.load(Ordering::Relaxed),
            bid_errors: self.bid_errors.load(Ordering::Relaxed),
            purchases: self.purchases.load(Ordering::Relaxed),
            cycles_run: self.cycles_run.load(Ordering::Relaxed),
            cycles_skipped_rate_limited: self
                .cycles_skipped_rate_limited
                .load(Ordering::Relaxed),
            gauges,
        }
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time gauges that live outside the counter block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeGauges {
    /// Current event queue depth.
    pub queue_depth: usize,
    /// Whether the global pacer is currently limited.
    pub pacer_limited: bool,
    /// Milliseconds until the pacer frees a slot (0 when unlimited).
    pub pacer_reset_ms: u64,
    /// Identities currently under their per-identity cap.
    pub identities_available: usize,
    /// Total identities in the pool.
    pub identities_total: usize,
    /// Resident set size, when the platform exposes it.
    pub rss_bytes: Option<u64>,
}

/// Serialized stats file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub captured_at: DateTime<Utc>,
    pub events_received: u64,
    pub events_invalid: u64,
    pub events_unwatched: u64,
    pub events_discarded_pre_ready: u64,
    pub events_deduped: u64,
    pub events_superseded: u64,
    pub events_dropped: u64,
    pub events_processed: u64,
    pub bids_placed: u64,
    pub bids_skipped: u64,
    pub bids_cancelled: u64,
    pub counter_bids: u64,
    pub bid_errors: u64,
    pub purchases: u64,
    pub cycles_run: u64,
    pub cycles_skipped_rate_limited: u64,
    #[serde(flatten)]
    pub gauges: RuntimeGauges,
}

/// Best-effort resident set size from /proc on Linux; `None` elsewhere.
pub fn current_rss_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * 4096)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
