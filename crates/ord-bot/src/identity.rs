//! Rotating funding identities.
//!
//! The marketplace enforces its rate limit per signing identity. Rotating
//! submissions across N identities multiplies effective throughput to N×
//! the per-identity cap. Identities are organized into named groups; a
//! collection pins to exactly one group via `wallet_group`.
//!
//! Selection is least-recently-used among identities currently under their
//! own per-identity sliding window. When every identity in the group is
//! exhausted, callers learn the minimum time until one frees a slot and
//! either await it or skip.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

/// One rotating funding identity. Key material is an opaque capability
/// handle resolved by the external signer; the engine never inspects it.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// Human-readable label for logs.
    pub label: String,
    /// Opaque signing-key handle.
    pub key_handle: String,
    /// Payment address (funds bids; also how we recognize our own offers).
    pub payment_address: String,
    /// Receive address for purchased inscriptions.
    pub receive_address: String,
}

/// Errors from pool construction.
#[derive(Debug, Error)]
pub enum IdentityPoolError {
    #[error("identity group '{0}' is empty")]
    EmptyGroup(String),

    #[error("no identity groups configured")]
    NoGroups,
}

#[derive(Debug, Error)]
#[error("unknown identity group '{0}'")]
pub struct UnknownGroup(pub String);

#[derive(Debug)]
struct IdentityState {
    config: IdentityConfig,
    sent: VecDeque<Instant>,
    last_used: Option<Instant>,
}

/// A granted identity. The caller records the actual submission via
/// `IdentityPool::record_sent` with the returned index.
#[derive(Debug, Clone)]
pub struct IdentityLease {
    /// Index into the pool; used for `record_sent`.
    pub slot: usize,
    pub label: String,
    pub key_handle: String,
    pub payment_address: String,
    pub receive_address: String,
}

/// Pool of rotating identities with per-identity sliding windows.
pub struct IdentityPool {
    groups: HashMap<String, Vec<usize>>,
    identities: Vec<Mutex<IdentityState>>,
    window: Duration,
    max_per_window: usize,
}

impl IdentityPool {
    /// Build a pool from named groups. Every group must be non-empty.
    pub fn new(
        groups: HashMap<String, Vec<IdentityConfig>>,
        bids_per_minute: usize,
    ) -> Result<Self, IdentityPoolError> {
        if groups.is_empty() {
            return Err(IdentityPoolError::NoGroups);
        }

        let mut identities = Vec::new();
        let mut group_slots = HashMap::new();
        for (name, members) in groups {
            if members.is_empty() {
                return Err(IdentityPoolError::EmptyGroup(name));
            }
            let mut slots = Vec::with_capacity(members.len());
            for config in members {
                slots.push(identities.len());
                identities.push(Mutex::new(IdentityState {
                    config,
                    sent: VecDeque::new(),
                    last_used: None,
                }));
            }
            group_slots.insert(name, slots);
        }

        Ok(Self {
            groups: group_slots,
            identities,
            window: Duration::from_secs(60),
            max_per_window: bids_per_minute,
        })
    }

    /// True when `group` exists.
    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    /// Total identities across all groups.
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Identities currently under their cap (any group).
    pub fn available(&self) -> usize {
        let now = Instant::now();
        self.identities
            .iter()
            .filter(|id| {
                let mut state = id.lock();
                Self::prune(&mut state.sent, now, self.window);
                state.sent.len() < self.max_per_window
            })
            .count()
    }

    /// Identities currently under their cap in one group. Non-blocking
    /// callers use this to skip work instead of stalling on `acquire`.
    pub fn group_available(&self, group: &str) -> usize {
        let Some(slots) = self.groups.get(group) else {
            return 0;
        };
        let now = Instant::now();
        slots
            .iter()
            .filter(|&&slot| {
                let mut state = self.identities[slot].lock();
                Self::prune(&mut state.sent, now, self.window);
                state.sent.len() < self.max_per_window
            })
            .count()
    }

    /// All payment addresses in the pool. Used to recognize our own feed
    /// events regardless of which identity placed the bid.
    pub fn payment_addresses(&self) -> Vec<String> {
        self.identities
            .iter()
            .map(|id| id.lock().config.payment_address.clone())
            .collect()
    }

    /// Try to acquire the least-recently-used under-cap identity in `group`.
    ///
    /// `Err(wait)` means every identity in the group is exhausted and `wait`
    /// is the minimum time until the earliest window frees a slot.
    pub fn try_acquire(&self, group: &str) -> Result<Result<IdentityLease, Duration>, UnknownGroup> {
        let slots = self
            .groups
            .get(group)
            .ok_or_else(|| UnknownGroup(group.to_string()))?;

        let now = Instant::now();
        let mut best: Option<(usize, Option<Instant>)> = None;
        let mut min_wait: Option<Duration> = None;

        for &slot in slots {
            let mut state = self.identities[slot].lock();
            Self::prune(&mut state.sent, now, self.window);
            if state.sent.len() < self.max_per_window {
                // Least-recently-used wins; never-used wins over any used.
                let candidate = (slot, state.last_used);
                best = match best {
                    None => Some(candidate),
                    Some((_, prev_used)) if earlier(state.last_used, prev_used) => Some(candidate),
                    keep => keep,
                };
            } else {
                // Earliest in-window send ages out first.
                let wait = (state.sent[state.sent.len() - self.max_per_window] + self.window)
                    .saturating_duration_since(now);
                min_wait = Some(match min_wait {
                    None => wait,
                    Some(current) => current.min(wait),
                });
            }
        }

        match best {
            Some((slot, _)) => {
                let mut state = self.identities[slot].lock();
                state.last_used = Some(now);
                let config = &state.config;
                debug!(identity = %config.label, group, "identity acquired");
                Ok(Ok(IdentityLease {
                    slot,
                    label: config.label.clone(),
                    key_handle: config.key_handle.clone(),
                    payment_address: config.payment_address.clone(),
                    receive_address: config.receive_address.clone(),
                }))
            }
            None => Ok(Err(min_wait.unwrap_or(self.window))),
        }
    }

    /// Acquire, awaiting pool capacity when every identity is exhausted.
    pub async fn acquire(&self, group: &str) -> Result<IdentityLease, UnknownGroup> {
        loop {
            match self.try_acquire(group)? {
                Ok(lease) => return Ok(lease),
                Err(wait) => tokio::time::sleep(wait.max(Duration::from_millis(10))).await,
            }
        }
    }

    /// Record a bid submission through the identity in `slot`.
    pub fn record_sent(&self, slot: usize) {
        let now = Instant::now();
        let mut state = self.identities[slot].lock();
        state.sent.push_back(now);
        Self::prune(&mut state.sent, now, self.window);
    }

    /// The API reported a rate violation for this identity; saturate its
    /// window so it is skipped until the window ages out.
    pub fn on_rejected(&self, slot: usize) {
        let now = Instant::now();
        let mut state = self.identities[slot].lock();
        while state.sent.len() < self.max_per_window {
            state.sent.push_back(now);
        }
    }

    fn prune(sent: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(front) = sent.front() {
            if now.duration_since(*front) > window {
                sent.pop_front();
            } else {
                break;
            }
        }
    }
}

/// `a` is strictly earlier than `b`, with `None` (never used) earliest.
fn earlier(a: Option<Instant>, b: Option<Instant>) -> bool {
    match (a, b) {
        (None, None) => false,
        (None, Some(_)) => true,
        (Some(_), None) => false,
        (Some(a), Some(b)) => a < b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(label: &str) -> IdentityConfig {
        IdentityConfig {
            label: label.to_string(),
            key_handle: format!("key-{label}"),
            payment_address: format!("bc1q-{label}"),
            receive_address: format!("bc1p-{label}"),
        }
    }

    fn pool(members: &[&str], cap: usize) -> IdentityPool {
        let mut groups = HashMap::new();
        groups.insert(
            "main".to_string(),
            members.iter().map(|l| identity(l)).collect(),
        );
        IdentityPool::new(groups, cap).unwrap()
    }

    #[test]
    fn test_empty_group_rejected() {
        let mut groups = HashMap::new();
        groups.insert("main".to_string(), Vec::new());
        assert!(matches!(
            IdentityPool::new(groups, 5),
            Err(IdentityPoolError::EmptyGroup(_))
        ));
    }

    #[test]
    fn test_unknown_group() {
        let pool = pool(&["a"], 5);
        assert!(pool.try_acquire("nope").is_err());
    }

    #[test]
    fn test_round_robins_least_recently_used() {
        let pool = pool(&["a", "b", "c"], 5);
        let first = pool.try_acquire("main").unwrap().unwrap();
        let second = pool.try_acquire("main").unwrap().unwrap();
        let third = pool.try_acquire("main").unwrap().unwrap();
        let labels: Vec<_> = vec![first.label, second.label, third.label];
        // All three used before any repeats.
        assert_eq!(labels.len(), 3);
        assert!(labels.contains(&"a".to_string()));
        assert!(labels.contains(&"b".to_string()));
        assert!(labels.contains(&"c".to_string()));

        // Next acquisition cycles back to the least recently used.
        let fourth = pool.try_acquire("main").unwrap().unwrap();
        assert_eq!(fourth.label, labels[0]);
    }

    #[test]
    fn test_exhausted_pool_reports_min_wait() {
        let pool = pool(&["a", "b"], 1);
        let a = pool.try_acquire("main").unwrap().unwrap();
        pool.record_sent(a.slot);
        let b = pool.try_acquire("main").unwrap().unwrap();
        pool.record_sent(b.slot);

        match pool.try_acquire("main").unwrap() {
            Err(wait) => assert!(wait > Duration::ZERO && wait <= Duration::from_secs(60)),
            Ok(lease) => panic!("expected exhaustion, got {}", lease.label),
        }
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_under_cap_identity_preferred_over_exhausted() {
        let pool = pool(&["a", "b"], 1);
        let first = pool.try_acquire("main").unwrap().unwrap();
        pool.record_sent(first.slot);

        // Only the other identity has capacity now.
        let second = pool.try_acquire("main").unwrap().unwrap();
        assert_ne!(second.label, first.label);
    }

    #[test]
    fn test_on_rejected_saturates_identity() {
        let pool = pool(&["a"], 3);
        let lease = pool.try_acquire("main").unwrap().unwrap();
        pool.on_rejected(lease.slot);
        assert!(pool.try_acquire("main").unwrap().is_err());
    }

    #[test]
    fn test_payment_addresses_cover_pool() {
        let pool = pool(&["a", "b"], 5);
        let addrs = pool.payment_addresses();
        assert_eq!(addrs.len(), 2);
        assert!(addrs.contains(&"bc1q-a".to_string()));
    }
}
