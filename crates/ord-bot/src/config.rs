//! Configuration for the bidding engine.
//!
//! Loaded once at startup from TOML with environment variable overrides for
//! credentials, validated fail-closed, and immutable thereafter: the engine
//! never mutates configuration.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ord_common::{OfferType, Sats, TraitFilter};
use serde::Deserialize;

use crate::identity::IdentityConfig;

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Marketplace REST base URL.
    pub api_base_url: String,
    /// Marketplace streaming feed URL.
    pub feed_url: String,
    /// Marketplace API key (from environment).
    pub api_key: Option<String>,
    /// External signing service endpoint.
    pub signer_endpoint: String,
    /// Logging level.
    pub log_level: String,
    /// Watched collections.
    pub collections: Vec<CollectionConfig>,
    /// Global bid pacing.
    pub pacer: PacerSettings,
    /// Identity rotation.
    pub identity: IdentitySettings,
    /// Snapshot persistence.
    pub persistence: PersistenceSettings,
    /// Feed connection tuning.
    pub feed: FeedSettings,
}

/// One watched collection.
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    /// Unique collection symbol.
    pub symbol: String,
    /// Absolute price floor in sats.
    pub min_bid: Sats,
    /// Absolute price ceiling in sats.
    pub max_bid: Sats,
    /// Lower bound as percent of live floor. May be negative.
    pub min_floor_bid: i64,
    /// Upper bound as percent of live floor. Above 100 requires traits.
    pub max_floor_bid: i64,
    /// ITEM or COLLECTION offers.
    pub offer_type: OfferType,
    /// How many bottom listings to bid on.
    pub bid_count: u32,
    /// Offer lifetime in minutes.
    pub duration_mins: u32,
    /// Scheduled cycle period in seconds.
    pub scheduled_loop_secs: u64,
    /// React to being outbid.
    pub enable_counter_bidding: bool,
    /// Counter-bid increment in sats.
    pub out_bid_margin: Sats,
    /// Purchase cap: stop bidding after this many fills.
    pub quantity: u64,
    /// Network fee rate in sat/vB.
    pub fee_rate: u64,
    /// Identity group this collection bids through.
    pub wallet_group: Option<String>,
    /// Optional trait constraints for trait-scoped collection offers.
    pub traits: Vec<TraitFilter>,
}

/// Global pacer settings.
#[derive(Debug, Clone)]
pub struct PacerSettings {
    pub window_secs: u64,
    pub max_bids_per_window: usize,
}

impl Default for PacerSettings {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_bids_per_window: 5,
        }
    }
}

/// Identity rotation settings.
#[derive(Debug, Clone, Default)]
pub struct IdentitySettings {
    /// Rotate across grouped identities. When false, the single default
    /// identity is used and the global pacer is authoritative.
    pub rotation_enabled: bool,
    /// Per-identity sliding-window cap.
    pub bids_per_minute: usize,
    /// Identity used when rotation is disabled.
    pub default_identity: Option<IdentityConfig>,
    /// Named identity groups for rotation.
    pub groups: HashMap<String, Vec<IdentityConfig>>,
}

/// Snapshot persistence settings.
#[derive(Debug, Clone)]
pub struct PersistenceSettings {
    /// Bid-history snapshot path.
    pub state_path: PathBuf,
    /// Runtime stats snapshot path.
    pub stats_path: PathBuf,
    /// Bid-history rewrite period.
    pub state_interval_secs: u64,
    /// Stats rewrite period.
    pub stats_interval_secs: u64,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("data/bid-history.json"),
            stats_path: PathBuf::from("data/stats.json"),
            state_interval_secs: 300,
            stats_interval_secs: 30,
        }
    }
}

/// Feed connection settings.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// Heartbeat period.
    pub heartbeat_secs: u64,
    /// Connection timeout.
    pub connect_timeout_secs: u64,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            heartbeat_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

impl BotConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: TomlConfig = toml::from_str(content).context("Failed to parse TOML config")?;
        Self::try_from(file)
    }

    /// Apply environment variable overrides for sensitive values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("ORD_API_KEY") {
            self.api_key = Some(key);
        }
        if let Ok(endpoint) = std::env::var("ORD_SIGNER_ENDPOINT") {
            self.signer_endpoint = endpoint;
        }
    }

    /// Validate configuration. Fatal before the engine starts: never run
    /// with ambiguous configuration.
    pub fn validate(&self) -> Result<()> {
        if self.api_base_url.is_empty() {
            bail!("api_base_url must be set");
        }
        if self.feed_url.is_empty() {
            bail!("feed_url must be set");
        }
        if self.signer_endpoint.is_empty() {
            bail!("signer_endpoint must be set");
        }
        if self.collections.is_empty() {
            bail!("At least one collection must be configured");
        }
        if self.pacer.max_bids_per_window == 0 {
            bail!("pacer.max_bids_per_window must be at least 1");
        }

        let mut seen = HashSet::new();
        for collection in &self.collections {
            let symbol = &collection.symbol;
            if symbol.is_empty() {
                bail!("collection symbol must not be empty");
            }
            if !seen.insert(symbol.clone()) {
                bail!("duplicate collection symbol '{symbol}'");
            }
            if collection.min_bid > collection.max_bid {
                bail!("collection '{symbol}': min_bid exceeds max_bid");
            }
            if collection.min_floor_bid > collection.max_floor_bid {
                bail!("collection '{symbol}': min_floor_bid exceeds max_floor_bid");
            }
            if collection.bid_count == 0 {
                bail!("collection '{symbol}': bid_count must be positive");
            }
            if collection.quantity == 0 {
                bail!("collection '{symbol}': quantity must be at least 1");
            }
            if collection.duration_mins == 0 {
                bail!("collection '{symbol}': duration must be positive");
            }
            if collection.scheduled_loop_secs == 0 {
                bail!("collection '{symbol}': scheduled_loop must be positive");
            }
            // Bidding above floor is only permitted for trait-scoped bids.
            if collection.max_floor_bid > 100 && collection.traits.is_empty() {
                bail!(
                    "collection '{symbol}': max_floor_bid above 100 requires trait filters"
                );
            }
        }

        if self.identity.rotation_enabled {
            if self.identity.groups.is_empty() {
                bail!("identity rotation enabled but no groups configured");
            }
            if self.identity.bids_per_minute == 0 {
                bail!("identity.bids_per_minute must be at least 1");
            }
            for (name, members) in &self.identity.groups {
                if members.is_empty() {
                    bail!("identity group '{name}' is empty");
                }
            }
            for collection in &self.collections {
                match &collection.wallet_group {
                    None => bail!(
                        "collection '{}': wallet_group required when rotation is enabled",
                        collection.symbol
                    ),
                    Some(group) if !self.identity.groups.contains_key(group) => bail!(
                        "collection '{}': unknown wallet_group '{}'",
                        collection.symbol,
                        group
                    ),
                    Some(_) => {}
                }
            }
        } else {
            if self.identity.default_identity.is_none() {
                bail!("identity rotation disabled but no default identity configured");
            }
            // A named group on a collection would silently not rotate.
            for collection in &self.collections {
                if let Some(group) = &collection.wallet_group {
                    if !self.identity.groups.contains_key(group) {
                        bail!(
                            "collection '{}': wallet_group '{}' does not exist",
                            collection.symbol,
                            group
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// The configured collection entry for `symbol`.
    pub fn collection(&self, symbol: &str) -> Option<&CollectionConfig> {
        self.collections.iter().find(|c| c.symbol == symbol)
    }

    /// Symbols of all watched collections.
    pub fn watched_symbols(&self) -> HashSet<String> {
        self.collections
            .iter()
            .map(|c| c.symbol.clone())
            .collect()
    }
}

// ============================================================================
// TOML deserialization structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct TomlConfig {
    #[serde(default)]
    api_base_url: String,
    #[serde(default)]
    feed_url: String,
    #[serde(default)]
    signer_endpoint: String,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    collections: Vec<CollectionToml>,
    #[serde(default)]
    pacer: PacerToml,
    #[serde(default)]
    identity: IdentityToml,
    #[serde(default)]
    persistence: PersistenceToml,
    #[serde(default)]
    feed: FeedToml,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
struct CollectionToml {
    symbol: String,
    min_bid: u64,
    max_bid: u64,
    #[serde(default)]
    min_floor_bid: i64,
    #[serde(default = "default_max_floor_bid")]
    max_floor_bid: i64,
    offer_type: String,
    #[serde(default = "default_bid_count")]
    bid_count: u32,
    #[serde(default = "default_duration_mins")]
    duration_mins: u32,
    #[serde(default = "default_scheduled_loop_secs")]
    scheduled_loop_secs: u64,
    #[serde(default)]
    enable_counter_bidding: bool,
    #[serde(default)]
    out_bid_margin: u64,
    #[serde(default = "default_quantity")]
    quantity: u64,
    #[serde(default = "default_fee_rate")]
    fee_rate: u64,
    #[serde(default)]
    wallet_group: Option<String>,
    #[serde(default)]
    traits: Vec<TraitToml>,
}

fn default_max_floor_bid() -> i64 {
    100
}

fn default_bid_count() -> u32 {
    10
}

fn default_duration_mins() -> u32 {
    30
}

fn default_scheduled_loop_secs() -> u64 {
    60
}

fn default_quantity() -> u64 {
    1
}

fn default_fee_rate() -> u64 {
    10
}

#[derive(Debug, Deserialize)]
struct TraitToml {
    trait_type: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PacerToml {
    window_secs: u64,
    max_bids_per_window: usize,
}

impl Default for PacerToml {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_bids_per_window: 5,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct IdentityToml {
    rotation_enabled: bool,
    bids_per_minute: usize,
    default: Option<IdentityEntryToml>,
    groups: Vec<IdentityGroupToml>,
}

#[derive(Debug, Deserialize)]
struct IdentityGroupToml {
    name: String,
    identities: Vec<IdentityEntryToml>,
}

#[derive(Debug, Deserialize)]
struct IdentityEntryToml {
    label: String,
    key_handle: String,
    payment_address: String,
    receive_address: String,
}

impl From<IdentityEntryToml> for IdentityConfig {
    fn from(entry: IdentityEntryToml) -> Self {
        IdentityConfig {
            label: entry.label,
            key_handle: entry.key_handle,
            payment_address: entry.payment_address,
            receive_address: entry.receive_address,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PersistenceToml {
    state_path: PathBuf,
    stats_path: PathBuf,
    state_interval_secs: u64,
    stats_interval_secs: u64,
}

impl Default for PersistenceToml {
    fn default() -> Self {
        let defaults = PersistenceSettings::default();
        Self {
            state_path: defaults.state_path,
            stats_path: defaults.stats_path,
            state_interval_secs: defaults.state_interval_secs,
            stats_interval_secs: defaults.stats_interval_secs,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct FeedToml {
    heartbeat_secs: u64,
    connect_timeout_secs: u64,
}

impl Default for FeedToml {
    fn default() -> Self {
        let defaults = FeedSettings::default();
        Self {
            heartbeat_secs: defaults.heartbeat_secs,
            connect_timeout_secs: defaults.connect_timeout_secs,
        }
    }
}

impl TryFrom<TomlConfig> for BotConfig {
    type Error = anyhow::Error;

    fn try_from(toml: TomlConfig) -> Result<Self> {
        let mut collections = Vec::with_capacity(toml.collections.len());
        for collection in toml.collections {
            let offer_type = OfferType::from_str_opt(&collection.offer_type)
                .with_context(|| {
                    format!(
                        "collection '{}': offer_type must be ITEM or COLLECTION, got '{}'",
                        collection.symbol, collection.offer_type
                    )
                })?;
            collections.push(CollectionConfig {
                symbol: collection.symbol,
                min_bid: collection.min_bid,
                max_bid: collection.max_bid,
                min_floor_bid: collection.min_floor_bid,
                max_floor_bid: collection.max_floor_bid,
                offer_type,
                bid_count: collection.bid_count,
                duration_mins: collection.duration_mins,
                scheduled_loop_secs: collection.scheduled_loop_secs,
                enable_counter_bidding: collection.enable_counter_bidding,
                out_bid_margin: collection.out_bid_margin,
                quantity: collection.quantity,
                fee_rate: collection.fee_rate,
                wallet_group: collection.wallet_group,
                traits: collection
                    .traits
                    .into_iter()
                    .map(|t| TraitFilter {
                        trait_type: t.trait_type,
                        value: t.value,
                    })
                    .collect(),
            });
        }

        let groups = toml
            .identity
            .groups
            .into_iter()
            .map(|group| {
                (
                    group.name,
                    group
                        .identities
                        .into_iter()
                        .map(IdentityConfig::from)
                        .collect(),
                )
            })
            .collect();

        Ok(Self {
            api_base_url: toml.api_base_url,
            feed_url: toml.feed_url,
            api_key: None, // Always from env vars.
            signer_endpoint: toml.signer_endpoint,
            log_level: toml.log_level,
            collections,
            pacer: PacerSettings {
                window_secs: toml.pacer.window_secs,
                max_bids_per_window: toml.pacer.max_bids_per_window,
            },
            identity: IdentitySettings {
                rotation_enabled: toml.identity.rotation_enabled,
                bids_per_minute: toml.identity.bids_per_minute,
                default_identity: toml.identity.default.map(IdentityConfig::from),
                groups,
            },
            persistence: PersistenceSettings {
                state_path: toml.persistence.state_path,
                stats_path: toml.persistence.stats_path,
                state_interval_secs: toml.persistence.state_interval_secs,
                stats_interval_secs: toml.persistence.stats_interval_secs,
            },
            feed: FeedSettings {
                heartbeat_secs: toml.feed.heartbeat_secs,
                connect_timeout_secs: toml.feed.connect_timeout_secs,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            api_base_url = "https://api.example.com"
            feed_url = "wss://feed.example.com"
            signer_endpoint = "http://127.0.0.1:9200/sign"

            [identity]
            rotation_enabled = false
            bids_per_minute = 5

            [identity.default]
            label = "main"
            key_handle = "key-main"
            payment_address = "bc1q-main"
            receive_address = "bc1p-main"

            [[collections]]
            symbol = "nodemonkes"
            min_bid = 100000
            max_bid = 1000000
            min_floor_bid = 50
            max_floor_bid = 80
            offer_type = "ITEM"
            enable_counter_bidding = true
            out_bid_margin = 1000
        "#
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = BotConfig::from_toml_str(minimal_toml()).unwrap();
        assert_eq!(config.collections.len(), 1);
        let collection = &config.collections[0];
        assert_eq!(collection.symbol, "nodemonkes");
        assert_eq!(collection.offer_type, OfferType::Item);
        assert_eq!(collection.bid_count, 10); // default
        assert_eq!(collection.quantity, 1); // default
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_offer_type_fails_parse() {
        let toml = minimal_toml().replace("\"ITEM\"", "\"BUNDLE\"");
        assert!(BotConfig::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_min_bid_above_max_bid_rejected() {
        let mut config = BotConfig::from_toml_str(minimal_toml()).unwrap();
        config.collections[0].min_bid = 2_000_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_floor_guard_rejected_without_traits() {
        let mut config = BotConfig::from_toml_str(minimal_toml()).unwrap();
        config.collections[0].max_floor_bid = 120;
        assert!(config.validate().is_err());

        // Same config with one trait entry is accepted.
        config.collections[0].traits = vec![TraitFilter {
            trait_type: "Background".into(),
            value: "Gold".into(),
        }];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rotation_requires_groups_and_membership() {
        let mut config = BotConfig::from_toml_str(minimal_toml()).unwrap();
        config.identity.rotation_enabled = true;
        config.identity.bids_per_minute = 5;
        // No groups at all.
        assert!(config.validate().is_err());

        config.identity.groups.insert(
            "alpha".to_string(),
            vec![IdentityConfig {
                label: "a".into(),
                key_handle: "k".into(),
                payment_address: "bc1q-a".into(),
                receive_address: "bc1p-a".into(),
            }],
        );
        // Collection does not name a group yet.
        assert!(config.validate().is_err());

        config.collections[0].wallet_group = Some("alpha".to_string());
        assert!(config.validate().is_ok());

        // Unknown group name fails.
        config.collections[0].wallet_group = Some("beta".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_no_rotation_requires_default_identity() {
        let mut config = BotConfig::from_toml_str(minimal_toml()).unwrap();
        config.identity.default_identity = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_symbols_rejected() {
        let mut config = BotConfig::from_toml_str(minimal_toml()).unwrap();
        let dup = config.collections[0].clone();
        config.collections.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides_api_key() {
        let mut config = BotConfig::from_toml_str(minimal_toml()).unwrap();
        std::env::set_var("ORD_API_KEY", "secret-key");
        config.apply_env_overrides();
        std::env::remove_var("ORD_API_KEY");
        assert_eq!(config.api_key.as_deref(), Some("secret-key"));
    }

    #[test]
    fn test_groups_parse_from_toml() {
        let toml = r#"
            api_base_url = "https://api.example.com"
            feed_url = "wss://feed.example.com"
            signer_endpoint = "http://127.0.0.1:9200/sign"

            [identity]
            rotation_enabled = true
            bids_per_minute = 3

            [[identity.groups]]
            name = "alpha"

            [[identity.groups.identities]]
            label = "a1"
            key_handle = "key-a1"
            payment_address = "bc1q-a1"
            receive_address = "bc1p-a1"

            [[collections]]
            symbol = "nodemonkes"
            min_bid = 100000
            max_bid = 1000000
            offer_type = "COLLECTION"
            wallet_group = "alpha"
        "#;
        let config = BotConfig::from_toml_str(toml).unwrap();
        assert!(config.identity.groups.contains_key("alpha"));
        assert!(config.validate().is_ok());
        assert_eq!(config.collections[0].offer_type, OfferType::Collection);
    }
}
