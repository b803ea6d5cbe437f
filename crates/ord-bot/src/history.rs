//! Per-collection bid history.
//!
//! This is the single most contended resource in the engine. Callers mutate
//! a token's fields only while holding that token's lock, and the quantity
//! counter only through the quantity lock; this module just provides the
//! storage and the pruning invariants:
//!
//! - at most 100 tracked bids per collection (oldest-by-expiration pruned)
//! - bids whose expiration is older than 24 hours are purged together with
//!   their top-bid flag
//!
//! Startup restore deliberately recovers only the `quantity` counter
//! ("resume count, not resume bids"); everything else starts empty.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use ord_common::{OfferType, Sats};
use ord_market::Listing;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Maximum tracked bids per collection.
pub const MAX_TRACKED_BIDS: usize = 100;

/// Age past expiration after which a tracked bid is purged.
pub const BID_PURGE_AGE_HOURS: i64 = 24;

/// Key under which a collection-wide offer is tracked in `our_bids`.
/// Collection offers have no token id; the symbol itself serves as the key.
pub fn collection_bid_key(symbol: &str) -> String {
    symbol.to_string()
}

/// One of our live offers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OurBid {
    /// Offer price in sats.
    pub price: Sats,
    /// When the offer expires.
    pub expiration: DateTime<Utc>,
    /// Payment address of the identity that funded it.
    pub payment_address: String,
}

/// Mutable per-collection bid state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionHistory {
    pub offer_type: OfferType,
    /// Our live bids keyed by token id (or the collection key).
    pub our_bids: HashMap<String, OurBid>,
    /// Tokens where we are currently the top offer.
    pub top_bids: HashMap<String, bool>,
    /// Cheapest current listings, the target set for ITEM bidding.
    #[serde(skip)]
    pub bottom_listings: Vec<Listing>,
    /// Live floor price from the last refresh.
    #[serde(skip)]
    pub floor_price: Sats,
    /// Last feed activity for this collection.
    pub last_seen_activity: Option<DateTime<Utc>>,
    /// Fills so far. Monotonically non-decreasing while the bot runs;
    /// mutated only under the collection's quantity lock.
    pub quantity: u64,
}

impl CollectionHistory {
    fn new(offer_type: OfferType) -> Self {
        Self {
            offer_type,
            our_bids: HashMap::new(),
            top_bids: HashMap::new(),
            bottom_listings: Vec::new(),
            floor_price: 0,
            last_seen_activity: None,
            quantity: 0,
        }
    }
}

/// All collections' bid state. Created lazily on first touch by either
/// producer.
#[derive(Debug, Default)]
pub struct BidHistory {
    collections: DashMap<String, CollectionHistory>,
}

impl BidHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lazily initialize the entry for `symbol`.
    pub fn ensure(&self, symbol: &str, offer_type: OfferType) {
        self.collections
            .entry(symbol.to_string())
            .or_insert_with(|| CollectionHistory::new(offer_type));
    }

    /// Run `f` with mutable access to the collection entry, creating it if
    /// needed.
    pub fn with_entry<T>(
        &self,
        symbol: &str,
        offer_type: OfferType,
        f: impl FnOnce(&mut CollectionHistory) -> T,
    ) -> T {
        let mut entry = self
            .collections
            .entry(symbol.to_string())
            .or_insert_with(|| CollectionHistory::new(offer_type));
        f(entry.value_mut())
    }

    /// Read-only view of a collection entry.
    pub fn read<T>(&self, symbol: &str, f: impl FnOnce(&CollectionHistory) -> T) -> Option<T> {
        self.collections.get(symbol).map(|entry| f(entry.value()))
    }

    /// Our tracked bid for `key` (token id or collection key).
    pub fn our_bid(&self, symbol: &str, key: &str) -> Option<OurBid> {
        self.collections
            .get(symbol)
            .and_then(|entry| entry.our_bids.get(key).cloned())
    }

    /// Record (or replace) a live bid, enforcing the tracked-bid cap by
    /// pruning the oldest-by-expiration entry.
    pub fn record_bid(&self, symbol: &str, offer_type: OfferType, key: &str, bid: OurBid) {
        self.with_entry(symbol, offer_type, |entry| {
            entry.our_bids.insert(key.to_string(), bid);
            while entry.our_bids.len() > MAX_TRACKED_BIDS {
                let oldest = entry
                    .our_bids
                    .iter()
                    .min_by_key(|(_, b)| b.expiration)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        entry.our_bids.remove(&k);
                        entry.top_bids.remove(&k);
                        debug!(collection = symbol, token = %k, "pruned oldest tracked bid");
                    }
                    None => break,
                }
            }
        });
    }

    /// Drop a tracked bid and its top flag.
    pub fn remove_bid(&self, symbol: &str, key: &str) {
        if let Some(mut entry) = self.collections.get_mut(symbol) {
            entry.our_bids.remove(key);
            entry.top_bids.remove(key);
        }
    }

    /// Record whether we are top for `key`.
    pub fn set_top(&self, symbol: &str, key: &str, top: bool) {
        if let Some(mut entry) = self.collections.get_mut(symbol) {
            entry.top_bids.insert(key.to_string(), top);
        }
    }

    /// Purge tracked bids whose expiration is more than the purge age in
    /// the past, together with their top flags. Returns how many were
    /// purged.
    pub fn purge_expired(&self, symbol: &str, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::hours(BID_PURGE_AGE_HOURS);
        match self.collections.get_mut(symbol) {
            Some(mut entry) => {
                let stale: Vec<String> = entry
                    .our_bids
                    .iter()
                    .filter(|(_, bid)| bid.expiration < cutoff)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in &stale {
                    entry.our_bids.remove(key);
                    entry.top_bids.remove(key);
                }
                stale.len()
            }
            None => 0,
        }
    }

    /// Replace the floor/bottom-listings view after a refresh.
    pub fn set_market_view(
        &self,
        symbol: &str,
        offer_type: OfferType,
        floor_price: Sats,
        bottom_listings: Vec<Listing>,
    ) {
        self.with_entry(symbol, offer_type, |entry| {
            entry.floor_price = floor_price;
            entry.bottom_listings = bottom_listings;
        });
    }

    /// Stamp feed activity for the collection.
    pub fn touch_activity(&self, symbol: &str, offer_type: OfferType, at: DateTime<Utc>) {
        self.with_entry(symbol, offer_type, |entry| {
            entry.last_seen_activity = Some(at);
        });
    }

    /// Current fills count.
    pub fn quantity(&self, symbol: &str) -> u64 {
        self.collections
            .get(symbol)
            .map(|entry| entry.quantity)
            .unwrap_or(0)
    }

    /// Read-increment-write of the fills counter. Callers hold the
    /// collection's quantity lock.
    pub fn increment_quantity(&self, symbol: &str, offer_type: OfferType) -> u64 {
        self.with_entry(symbol, offer_type, |entry| {
            entry.quantity += 1;
            entry.quantity
        })
    }

    /// Restore the fills counter from a snapshot (startup only).
    pub fn restore_quantity(&self, symbol: &str, offer_type: OfferType, quantity: u64) {
        self.with_entry(symbol, offer_type, |entry| {
            entry.quantity = quantity;
        });
    }

    /// Symbols with state.
    pub fn symbols(&self) -> Vec<String> {
        self.collections
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Clone the full entry for snapshotting.
    pub fn export(&self, symbol: &str) -> Option<CollectionHistory> {
        self.collections.get(symbol).map(|entry| entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bid(price: Sats, expires_in_mins: i64) -> OurBid {
        OurBid {
            price,
            expiration: Utc::now() + Duration::minutes(expires_in_mins),
            payment_address: "bc1q-ours".to_string(),
        }
    }

    #[test]
    fn test_lazy_init() {
        let history = BidHistory::new();
        assert!(history.our_bid("monkes", "t1").is_none());
        history.record_bid("monkes", OfferType::Item, "t1", bid(100, 30));
        assert_eq!(history.our_bid("monkes", "t1").unwrap().price, 100);
    }

    #[test]
    fn test_cap_prunes_oldest_by_expiration() {
        let history = BidHistory::new();
        // Fill to the cap; token t0 expires soonest.
        for i in 0..MAX_TRACKED_BIDS {
            history.record_bid(
                "monkes",
                OfferType::Item,
                &format!("t{i}"),
                bid(100, 10 + i as i64),
            );
        }
        history.set_top("monkes", "t0", true);

        history.record_bid("monkes", OfferType::Item, "overflow", bid(100, 500));

        let count = history.read("monkes", |e| e.our_bids.len()).unwrap();
        assert_eq!(count, MAX_TRACKED_BIDS);
        // t0 (oldest expiration) was pruned, together with its top flag.
        assert!(history.our_bid("monkes", "t0").is_none());
        let has_top = history
            .read("monkes", |e| e.top_bids.contains_key("t0"))
            .unwrap();
        assert!(!has_top);
        assert!(history.our_bid("monkes", "overflow").is_some());
    }

    #[test]
    fn test_purge_expired_older_than_24h() {
        let history = BidHistory::new();
        let now = Utc::now();
        history.record_bid(
            "monkes",
            OfferType::Item,
            "ancient",
            OurBid {
                price: 100,
                expiration: now - Duration::hours(25),
                payment_address: "bc1q-ours".into(),
            },
        );
        history.record_bid(
            "monkes",
            OfferType::Item,
            "recent",
            OurBid {
                price: 100,
                // Expired, but not by more than the purge age.
                expiration: now - Duration::hours(1),
                payment_address: "bc1q-ours".into(),
            },
        );
        history.set_top("monkes", "ancient", true);

        let purged = history.purge_expired("monkes", now);
        assert_eq!(purged, 1);
        assert!(history.our_bid("monkes", "ancient").is_none());
        assert!(history.our_bid("monkes", "recent").is_some());
        let has_top = history
            .read("monkes", |e| e.top_bids.contains_key("ancient"))
            .unwrap();
        assert!(!has_top);
    }

    #[test]
    fn test_quantity_monotonic_and_restorable() {
        let history = BidHistory::new();
        history.restore_quantity("monkes", OfferType::Item, 3);
        assert_eq!(history.quantity("monkes"), 3);
        assert_eq!(history.increment_quantity("monkes", OfferType::Item), 4);
        assert_eq!(history.quantity("monkes"), 4);
    }

    #[test]
    fn test_remove_bid_clears_top_flag() {
        let history = BidHistory::new();
        history.record_bid("monkes", OfferType::Item, "t1", bid(100, 30));
        history.set_top("monkes", "t1", true);
        history.remove_bid("monkes", "t1");
        assert!(history.our_bid("monkes", "t1").is_none());
        let has_top = history
            .read("monkes", |e| e.top_bids.contains_key("t1"))
            .unwrap();
        assert!(!has_top);
    }
}
