//! Crash-safe snapshots of bid history and runtime stats.
//!
//! Both files are best-effort caches: a missing or corrupted file loads as
//! empty with a warning, never a crash. Writes go through a single file
//! mutex and a write-to-temp-then-atomic-rename so a crash mid-write never
//! corrupts the previous good state.
//!
//! Startup restore recovers only the `quantity` counter for collections
//! still present in the active config; tracked bids start empty.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use ord_common::OfferType;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::BotConfig;
use crate::history::{BidHistory, OurBid};

/// Serialized bid-history file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BidHistorySnapshot {
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub collections: HashMap<String, CollectionSnapshot>,
}

/// Per-collection persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionSnapshot {
    pub offer_type: OfferType,
    pub our_bids: HashMap<String, OurBid>,
    pub top_bids: HashMap<String, bool>,
    pub quantity: u64,
}

/// Serializes snapshot writes. One instance per engine; both the periodic
/// tasks and the shutdown flush go through it.
#[derive(Debug, Default)]
pub struct Persister {
    write_lock: Mutex<()>,
}

impl Persister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize `value` to `path` via temp-file-then-rename, under the
    /// write mutex.
    pub async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> io::Result<()> {
        let _guard = self.write_lock.lock().await;
        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_atomic(path, &json)
    }
}

/// Write `bytes` to a sibling temp file, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

/// Load the bid-history snapshot. Missing or corrupt files come back empty.
pub fn load_bid_history(path: &Path) -> BidHistorySnapshot {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no bid-history snapshot, starting empty");
            return BidHistorySnapshot::default();
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read bid-history snapshot, starting empty");
            return BidHistorySnapshot::default();
        }
    };
    match serde_json::from_str(&content) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupted bid-history snapshot, starting empty");
            BidHistorySnapshot::default()
        }
    }
}

/// Capture the persistable slice of the live bid history.
pub fn snapshot_history(history: &BidHistory) -> BidHistorySnapshot {
    let mut collections = HashMap::new();
    for symbol in history.symbols() {
        if let Some(entry) = history.export(&symbol) {
            collections.insert(
                symbol,
                CollectionSnapshot {
                    offer_type: entry.offer_type,
                    our_bids: entry.our_bids,
                    top_bids: entry.top_bids,
                    quantity: entry.quantity,
                },
            );
        }
    }
    BidHistorySnapshot {
        saved_at: Some(Utc::now()),
        collections,
    }
}

/// Restore state from a snapshot: only the fills counter, and only for
/// collections still present in the active config.
pub fn restore_history(snapshot: &BidHistorySnapshot, config: &BotConfig, history: &BidHistory) {
    for (symbol, saved) in &snapshot.collections {
        match config.collection(symbol) {
            Some(collection) => {
                history.restore_quantity(symbol, collection.offer_type, saved.quantity);
                info!(
                    collection = %symbol,
                    quantity = saved.quantity,
                    "restored fills counter from snapshot"
                );
            }
            None => {
                info!(collection = %symbol, "dropping snapshot entry for unconfigured collection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;
    use chrono::Duration;

    fn test_config() -> BotConfig {
        BotConfig::from_toml_str(
            r#"
                api_base_url = "https://api.example.com"
                feed_url = "wss://feed.example.com"
                signer_endpoint = "http://127.0.0.1:9200/sign"

                [identity]
                [identity.default]
                label = "main"
                key_handle = "key-main"
                payment_address = "bc1q-main"
                receive_address = "bc1p-main"

                [[collections]]
                symbol = "monkes"
                min_bid = 100000
                max_bid = 1000000
                offer_type = "ITEM"
            "#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");

        let history = BidHistory::new();
        history.record_bid(
            "monkes",
            OfferType::Item,
            "t1",
            OurBid {
                price: 250_000,
                expiration: Utc::now() + Duration::minutes(30),
                payment_address: "bc1q-main".into(),
            },
        );
        history.restore_quantity("monkes", OfferType::Item, 2);

        let persister = Persister::new();
        persister
            .write_json(&path, &snapshot_history(&history))
            .await
            .unwrap();

        let loaded = load_bid_history(&path);
        let entry = &loaded.collections["monkes"];
        assert_eq!(entry.quantity, 2);
        assert_eq!(entry.our_bids["t1"].price, 250_000);
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let snapshot = load_bid_history(Path::new("/nonexistent/history.json"));
        assert!(snapshot.collections.is_empty());
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, b"{not json").unwrap();
        let snapshot = load_bid_history(&path);
        assert!(snapshot.collections.is_empty());
    }

    #[test]
    fn test_restore_recovers_only_quantity() {
        let mut snapshot = BidHistorySnapshot::default();
        let mut our_bids = HashMap::new();
        our_bids.insert(
            "t1".to_string(),
            OurBid {
                price: 250_000,
                expiration: Utc::now(),
                payment_address: "bc1q-main".into(),
            },
        );
        snapshot.collections.insert(
            "monkes".to_string(),
            CollectionSnapshot {
                offer_type: OfferType::Item,
                our_bids,
                top_bids: HashMap::new(),
                quantity: 7,
            },
        );
        // A collection no longer in the config is ignored entirely.
        snapshot.collections.insert(
            "retired".to_string(),
            CollectionSnapshot {
                offer_type: OfferType::Item,
                our_bids: HashMap::new(),
                top_bids: HashMap::new(),
                quantity: 3,
            },
        );

        let history = BidHistory::new();
        restore_history(&snapshot, &test_config(), &history);

        // Resume count, not resume bids.
        assert_eq!(history.quantity("monkes"), 7);
        assert!(history.our_bid("monkes", "t1").is_none());
        assert_eq!(history.quantity("retired"), 0);
    }

    #[tokio::test]
    async fn test_atomic_write_replaces_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let persister = Persister::new();

        persister.write_json(&path, &serde_json::json!({"v": 1})).await.unwrap();
        persister.write_json(&path, &serde_json::json!({"v": 2})).await.unwrap();

        let content: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(content["v"], 2);
        // No stray temp file left behind.
        assert!(!path.with_extension("tmp").exists());
    }
}
