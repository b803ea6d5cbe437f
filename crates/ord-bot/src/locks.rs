//! Mutual-exclusion primitives protecting per-token and per-collection
//! state.
//!
//! Token lock: the same token can be referenced almost simultaneously by a
//! feed event and a scheduled-cycle re-evaluation; without this lock both
//! could issue conflicting bid/cancel calls. Fairness is FIFO via an
//! explicit waiter queue rather than scheduler order, and a holder stuck
//! past the staleness deadline is force-cleared so a crashed task cannot
//! starve a token forever. Grants carry a generation number so a
//! force-cleared holder's late release is a no-op instead of unlocking the
//! new holder.
//!
//! Quantity lock: a per-collection mutex serializing read-increment-write
//! of the "fills so far" counter. Release happens in a drop guard so an
//! error inside the critical section cannot leave the lock held.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tracing::warn;

/// Default staleness deadline for held token locks.
pub const TOKEN_LOCK_STALE_AFTER: Duration = Duration::from_secs(60);

/// Maximum re-acquisition attempts for the quantity lock.
const QUANTITY_LOCK_ATTEMPTS: usize = 10;

#[derive(Debug)]
struct TokenLockState {
    held_since: Instant,
    generation: u64,
    waiters: VecDeque<oneshot::Sender<u64>>,
}

impl TokenLockState {
    /// Pass the lock to the oldest live waiter. Returns false when no waiter
    /// could take it (the entry should then be removed).
    fn grant_next(&mut self) -> bool {
        while let Some(next) = self.waiters.pop_front() {
            self.generation += 1;
            self.held_since = Instant::now();
            if next.send(self.generation).is_ok() {
                return true;
            }
            // Waiter was cancelled before its grant; try the next one.
        }
        false
    }
}

#[derive(Debug)]
struct TokenLocksInner {
    stale_after: Duration,
    table: Mutex<HashMap<String, TokenLockState>>,
}

/// Table of per-token FIFO locks. Entries exist only while a token is held
/// or contended.
#[derive(Debug, Clone)]
pub struct TokenLocks {
    inner: Arc<TokenLocksInner>,
}

enum AcquireStep {
    Granted(u64),
    Wait(oneshot::Receiver<u64>),
}

impl TokenLocks {
    pub fn new() -> Self {
        Self::with_staleness(TOKEN_LOCK_STALE_AFTER)
    }

    pub fn with_staleness(stale_after: Duration) -> Self {
        Self {
            inner: Arc::new(TokenLocksInner {
                stale_after,
                table: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Acquire the lock for `token`, waiting FIFO behind earlier acquirers.
    ///
    /// A holder older than the staleness deadline is force-cleared first:
    /// its slot passes to the oldest waiter (or to this caller when the
    /// queue is empty).
    pub async fn acquire(&self, token: &str) -> TokenLockGuard {
        loop {
            let step = {
                let mut table = self.inner.table.lock();
                match table.get_mut(token) {
                    None => {
                        table.insert(
                            token.to_string(),
                            TokenLockState {
                                held_since: Instant::now(),
                                generation: 1,
                                waiters: VecDeque::new(),
                            },
                        );
                        AcquireStep::Granted(1)
                    }
                    Some(state) => {
                        if state.held_since.elapsed() > self.inner.stale_after {
                            warn!(
                                token,
                                held_secs = state.held_since.elapsed().as_secs(),
                                "force-clearing stale token lock"
                            );
                            if state.grant_next() {
                                // Oldest waiter took over; queue up behind it.
                                let (tx, rx) = oneshot::channel();
                                state.waiters.push_back(tx);
                                AcquireStep::Wait(rx)
                            } else {
                                // Nobody waiting: the lock is ours.
                                state.generation += 1;
                                state.held_since = Instant::now();
                                AcquireStep::Granted(state.generation)
                            }
                        } else {
                            let (tx, rx) = oneshot::channel();
                            state.waiters.push_back(tx);
                            AcquireStep::Wait(rx)
                        }
                    }
                }
            };

            match step {
                AcquireStep::Granted(generation) => {
                    return TokenLockGuard {
                        inner: Arc::clone(&self.inner),
                        token: token.to_string(),
                        generation,
                    };
                }
                AcquireStep::Wait(rx) => match rx.await {
                    Ok(generation) => {
                        return TokenLockGuard {
                            inner: Arc::clone(&self.inner),
                            token: token.to_string(),
                            generation,
                        };
                    }
                    // Sender vanished without a grant (entry torn down);
                    // start over.
                    Err(_) => continue,
                },
            }
        }
    }

    /// Number of tokens currently held or contended. Stats/test use.
    pub fn active(&self) -> usize {
        self.inner.table.lock().len()
    }
}

impl Default for TokenLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Held token lock. Releasing wakes exactly the oldest waiter, or fully
/// clears the entry when nobody waits. A guard that was force-cleared for
/// staleness releases nothing.
#[derive(Debug)]
pub struct TokenLockGuard {
    inner: Arc<TokenLocksInner>,
    token: String,
    generation: u64,
}

impl Drop for TokenLockGuard {
    fn drop(&mut self) {
        let mut table = self.inner.table.lock();
        let cleared = match table.get_mut(&self.token) {
            // A newer generation holds the lock: our hold was force-cleared
            // and this release must not touch it.
            Some(state) if state.generation != self.generation => false,
            Some(state) => !state.grant_next(),
            None => false,
        };
        if cleared {
            table.remove(&self.token);
        }
    }
}

/// Quantity-lock failure: the collection's counter stayed contended through
/// every retry.
#[derive(Debug, Error)]
#[error("quantity lock for '{0}' still contended after {QUANTITY_LOCK_ATTEMPTS} attempts")]
pub struct QuantityLockContended(pub String);

#[derive(Debug, Default)]
struct QuantityEntry {
    locked: Mutex<bool>,
    released: Notify,
}

/// Per-collection quantity locks.
#[derive(Debug, Default, Clone)]
pub struct QuantityLocks {
    entries: Arc<Mutex<HashMap<String, Arc<QuantityEntry>>>>,
}

impl QuantityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, collection: &str) -> Arc<QuantityEntry> {
        let mut entries = self.entries.lock();
        Arc::clone(
            entries
                .entry(collection.to_string())
                .or_insert_with(|| Arc::new(QuantityEntry::default())),
        )
    }

    /// Run `mutate` while holding the collection's quantity lock.
    ///
    /// Bounded retry: when already held, await the holder's release signal
    /// and try again, up to the attempt cap. The lock is released on every
    /// exit path of `mutate`, including panics, via the drop guard.
    pub async fn with_lock<T>(
        &self,
        collection: &str,
        mutate: impl FnOnce() -> T,
    ) -> Result<T, QuantityLockContended> {
        let entry = self.entry(collection);

        for _ in 0..QUANTITY_LOCK_ATTEMPTS {
            let acquired = {
                let mut locked = entry.locked.lock();
                if *locked {
                    false
                } else {
                    *locked = true;
                    true
                }
            };

            if acquired {
                let _release = QuantityReleaseGuard { entry: &entry };
                return Ok(mutate());
            }

            entry.released.notified().await;
        }

        Err(QuantityLockContended(collection.to_string()))
    }
}

struct QuantityReleaseGuard<'a> {
    entry: &'a QuantityEntry,
}

impl Drop for QuantityReleaseGuard<'_> {
    fn drop(&mut self) {
        *self.entry.locked.lock() = false;
        self.entry.released.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn test_token_lock_exclusive() {
        let locks = TokenLocks::new();
        let guard = locks.acquire("tok-1").await;
        assert_eq!(locks.active(), 1);

        // A second acquire must not complete while the first is held.
        let locks2 = locks.clone();
        let mut second = tokio::spawn(async move {
            let _g = locks2.acquire("tok-1").await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), &mut second)
            .await
            .expect("second acquire should complete after release")
            .unwrap();
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn test_token_lock_independent_tokens() {
        let locks = TokenLocks::new();
        let _a = locks.acquire("tok-a").await;
        // Different token: no contention.
        let _b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("tok-b"))
            .await
            .expect("independent token must not block");
    }

    #[tokio::test]
    async fn test_token_lock_fifo_grant_order() {
        let locks = TokenLocks::new();
        let guard = locks.acquire("tok-1").await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..5 {
            let locks = locks.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let g = locks.acquire("tok-1").await;
                order.lock().push(i);
                drop(g);
            }));
            // Ensure each waiter enqueues before the next spawns.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        drop(guard);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_token_lock_stale_holder_force_cleared() {
        let locks = TokenLocks::with_staleness(Duration::from_millis(50));
        let stale = locks.acquire("tok-1").await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        // The stale holder must not block a fresh acquisition.
        let fresh = tokio::time::timeout(Duration::from_millis(200), locks.acquire("tok-1"))
            .await
            .expect("stale lock must be force-cleared");

        // The stale guard's late release must not free the fresh holder's
        // slot: a third acquire still has to wait.
        drop(stale);
        let locks2 = locks.clone();
        let mut third = tokio::spawn(async move {
            let _g = locks2.acquire("tok-1").await;
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!third.is_finished());

        drop(fresh);
        tokio::time::timeout(Duration::from_secs(1), &mut third)
            .await
            .expect("third acquire should complete after real release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_token_lock_stale_hands_to_oldest_waiter() {
        let locks = TokenLocks::with_staleness(Duration::from_millis(50));
        let _stale = locks.acquire("tok-1").await;

        // One waiter enqueued while the lock is fresh.
        let locks2 = locks.clone();
        let order = Arc::new(Mutex::new(Vec::new()));
        let order2 = Arc::clone(&order);
        let waiter = tokio::spawn(async move {
            let _g = locks2.acquire("tok-1").await;
            order2.lock().push("waiter");
        });
        tokio::time::sleep(Duration::from_millis(80)).await;

        // This acquire observes staleness; the queued waiter must win first.
        let order3 = Arc::clone(&order);
        let late = locks.acquire("tok-1").await;
        order3.lock().push("late");
        drop(late);

        waiter.await.unwrap();
        assert_eq!(*order.lock(), vec!["waiter", "late"]);
    }

    #[tokio::test]
    async fn test_quantity_lock_serializes_increments() {
        let locks = QuantityLocks::new();
        let counter = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let locks = locks.clone();
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                locks
                    .with_lock("collection", || {
                        // Read-increment-write, deliberately non-atomic.
                        let next = counter.load(Ordering::SeqCst) + 1;
                        counter.store(next, Ordering::SeqCst);
                        next
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut seen: Vec<u64> = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        seen.sort_unstable();
        // Exactly {1..16}: no duplicates, no gaps.
        assert_eq!(seen, (1..=16).collect::<Vec<u64>>());
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[tokio::test]
    async fn test_quantity_lock_independent_collections() {
        let locks = QuantityLocks::new();
        let a = locks.with_lock("coll-a", || 1).await.unwrap();
        let b = locks.with_lock("coll-b", || 2).await.unwrap();
        assert_eq!((a, b), (1, 2));
    }

    #[tokio::test]
    async fn test_quantity_lock_released_after_panic() {
        let locks = QuantityLocks::new();

        let locks2 = locks.clone();
        let panicked = tokio::spawn(async move {
            locks2
                .with_lock("collection", || panic!("boom"))
                .await
                .ok();
        })
        .await;
        assert!(panicked.is_err());

        // The lock must be free again.
        let value = tokio::time::timeout(
            Duration::from_millis(200),
            locks.with_lock("collection", || 42),
        )
        .await
        .expect("lock must be released after panic")
        .unwrap();
        assert_eq!(value, 42);
    }
}
