//! The bid-orchestration engine.
//!
//! An owned, constructed instance with a start/stop lifecycle: nothing here
//! is process-global, so multiple engines can coexist in tests. `start`
//! restores the snapshot, bootstraps each collection's market view, opens
//! the readiness gate and spawns the long-lived tasks (feed, drain loop,
//! per-collection schedulers, persistence). `stop` signals them all, waits,
//! and flushes state to disk. In-flight network calls are not aborted; their
//! completion after shutdown is tolerated.
//!
//! Concurrency discipline: a queue drain and a scheduled cycle never run
//! concurrently (producer gate); a token's bid-history fields are mutated
//! only under that token's lock; the fills counter only under the quantity
//! lock. Per-token operation failures are logged and counted, never allowed
//! to abort the surrounding drain or cycle.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use ord_common::{OfferType, Sats};
use ord_market::{
    CreateCollectionOfferRequest, CreateOfferRequest, MarketError, Marketplace, OfferSigner,
    SignError,
};

use crate::config::{BotConfig, CollectionConfig};
use crate::events::{EventKind, FeedEvent};
use crate::history::{collection_bid_key, BidHistory, OurBid};
use crate::identity::{IdentityConfig, IdentityPool};
use crate::locks::{QuantityLockContended, QuantityLocks, TokenLocks};
use crate::pacer::{PacerConfig, RatePacer};
use crate::persistence::{load_bid_history, restore_history, snapshot_history, Persister};
use crate::pricing::{self, BidDecision, SkipReason};
use crate::queue::{EventQueue, ProducerGate, QueueConfig};
use crate::stats::{current_rss_bytes, EngineStats, RuntimeGauges};

/// Failures of a single bid operation. Caught at the token's decision
/// boundary; never aborts a drain or cycle.
#[derive(Debug, Error)]
enum BidOpError {
    #[error(transparent)]
    Market(#[from] MarketError),

    #[error(transparent)]
    Sign(#[from] SignError),

    #[error(transparent)]
    QuantityLock(#[from] QuantityLockContended),
}

/// Which limiter admitted a submission.
enum Admission {
    Paced,
    Identity(usize),
}

/// The engine. Construct with `new`, then `start`/`stop`.
pub struct BidEngine {
    inner: Arc<EngineInner>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
}

struct EngineInner {
    config: BotConfig,
    market: Arc<dyn Marketplace>,
    signer: Arc<dyn OfferSigner>,
    queue: Arc<EventQueue>,
    gate: ProducerGate,
    pacer: RatePacer,
    identities: Option<IdentityPool>,
    default_identity: Option<IdentityConfig>,
    our_payment_addresses: HashSet<String>,
    token_locks: TokenLocks,
    qty_locks: QuantityLocks,
    history: BidHistory,
    stats: Arc<EngineStats>,
    persister: Persister,
}

impl BidEngine {
    /// Validate the configuration and build an engine. Fails closed on any
    /// configuration inconsistency.
    pub fn new(
        config: BotConfig,
        market: Arc<dyn Marketplace>,
        signer: Arc<dyn OfferSigner>,
    ) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let identities = if config.identity.rotation_enabled {
            Some(
                IdentityPool::new(
                    config.identity.groups.clone(),
                    config.identity.bids_per_minute,
                )
                .context("invalid identity pool")?,
            )
        } else {
            None
        };

        let mut our_payment_addresses = HashSet::new();
        if let Some(pool) = &identities {
            our_payment_addresses.extend(pool.payment_addresses());
        }
        if let Some(default) = &config.identity.default_identity {
            our_payment_addresses.insert(default.payment_address.clone());
        }

        let stats = Arc::new(EngineStats::new());
        let queue = Arc::new(EventQueue::new(
            QueueConfig::default(),
            config.watched_symbols(),
            Arc::clone(&stats),
        ));

        let pacer = RatePacer::new(PacerConfig {
            window: Duration::from_secs(config.pacer.window_secs),
            max_per_window: config.pacer.max_bids_per_window,
        });

        let (shutdown_tx, _) = broadcast::channel(16);

        Ok(Self {
            inner: Arc::new(EngineInner {
                default_identity: config.identity.default_identity.clone(),
                config,
                market,
                signer,
                queue,
                gate: ProducerGate::new(),
                pacer,
                identities,
                our_payment_addresses,
                token_locks: TokenLocks::new(),
                qty_locks: QuantityLocks::new(),
                history: BidHistory::new(),
                stats,
                persister: Persister::new(),
            }),
            shutdown_tx,
            tasks: Vec::new(),
            started: false,
        })
    }

    /// Raw event ingestion, for hosts that feed the engine directly.
    pub fn queue(&self) -> Arc<EventQueue> {
        Arc::clone(&self.inner.queue)
    }

    /// Counter access for stats surfaces and tests.
    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.inner.stats)
    }

    /// Bid history access for tests and host inspection.
    pub fn history(&self) -> &BidHistory {
        &self.inner.history
    }

    /// Restore persisted state, bootstrap market views, open the readiness
    /// gate and spawn the long-lived tasks.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        // Resume count, not resume bids.
        let snapshot = load_bid_history(&self.inner.config.persistence.state_path);
        restore_history(&snapshot, &self.inner.config, &self.inner.history);

        // Feed connects first; pre-steady-state traffic is discarded by the
        // readiness gate while we bootstrap.
        self.spawn_feed();

        for collection in &self.inner.config.collections {
            if let Err(e) = self.inner.refresh_market_view(collection).await {
                warn!(
                    collection = %collection.symbol,
                    error = %e,
                    "bootstrap refresh failed, scheduler will retry"
                );
            }
        }
        self.inner.queue.set_ready();

        self.spawn_drain_loop();
        self.spawn_schedulers();
        self.spawn_persistence();

        self.started = true;
        info!(
            collections = self.inner.config.collections.len(),
            rotation = self.inner.identities.is_some(),
            "bid engine started"
        );
        Ok(())
    }

    /// Signal every task, wait for them, and flush snapshots. In-flight
    /// marketplace calls are allowed to finish on their own.
    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }
        info!("bid engine stopping");
        let _ = self.shutdown_tx.send(());

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(error = %e, "engine task ended abnormally");
                }
            }
        }

        self.inner.flush_state().await;
        self.inner.flush_stats().await;
        self.started = false;
        info!("bid engine stopped");
    }

    fn spawn_feed(&mut self) {
        let inner = Arc::clone(&self.inner);
        let shutdown = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            crate::feed::run_feed(
                inner.config.feed_url.clone(),
                inner.config.feed.clone(),
                inner.config.watched_symbols(),
                Arc::clone(&inner.queue),
                shutdown,
            )
            .await;
        }));
    }

    fn spawn_drain_loop(&mut self) {
        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.queue.wait_nonempty() => {}
                    _ = shutdown.recv() => {
                        debug!("drain loop shutting down");
                        return;
                    }
                }

                // Hold the producer gate for the whole batch so no
                // scheduled cycle interleaves with event processing.
                let _gate = inner.gate.enter().await;
                while let Some(event) = inner.queue.pop() {
                    inner.handle_event(event).await;
                }
            }
        }));
    }

    fn spawn_schedulers(&mut self) {
        for collection in self.inner.config.collections.clone() {
            let inner = Arc::clone(&self.inner);
            let mut shutdown = self.shutdown_tx.subscribe();
            self.tasks.push(tokio::spawn(async move {
                let mut ticker =
                    interval(Duration::from_secs(collection.scheduled_loop_secs));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The bootstrap in start() covered the first refresh.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            inner.run_scheduled_cycle(&collection).await;
                        }
                        _ = shutdown.recv() => {
                            debug!(collection = %collection.symbol, "scheduler shutting down");
                            return;
                        }
                    }
                }
            }));
        }
    }

    fn spawn_persistence(&mut self) {
        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.shutdown_tx.subscribe();
        let state_period = Duration::from_secs(inner.config.persistence.state_interval_secs);
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(state_period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => inner.flush_state().await,
                    _ = shutdown.recv() => return,
                }
            }
        }));

        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.shutdown_tx.subscribe();
        let stats_period = Duration::from_secs(inner.config.persistence.stats_interval_secs);
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(stats_period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => inner.flush_stats().await,
                    _ = shutdown.recv() => return,
                }
            }
        }));
    }
}

impl EngineInner {
    // ------------------------------------------------------------------
    // Event dispatch
    // ------------------------------------------------------------------

    async fn handle_event(&self, event: FeedEvent) {
        let Some(collection) = self.config.collection(&event.collection_symbol) else {
            // Config changed out from under the queue; drop quietly.
            return;
        };
        EngineStats::inc(&self.stats.events_processed);
        self.history
            .ensure(&collection.symbol, collection.offer_type);
        self.history
            .touch_activity(&collection.symbol, collection.offer_type, event.created_at);

        let outcome = match event.kind {
            EventKind::OfferPlaced => self.on_item_offer_placed(collection, &event).await,
            EventKind::CollOfferCreated | EventKind::CollOfferEdited => {
                self.on_collection_offer(collection, &event).await
            }
            EventKind::OfferCancelled => self.on_item_offer_cancelled(collection, &event).await,
            EventKind::CollOfferCancelled => {
                self.on_collection_offer_cancelled(collection, &event).await
            }
            EventKind::BuyingBroadcasted | EventKind::OfferAcceptedBroadcasted => {
                self.on_token_purchase(collection, &event).await
            }
            EventKind::CollOfferFulfillBroadcasted => {
                self.on_collection_fulfill(collection, &event).await
            }
        };

        // Failure is isolated per token; the drain continues.
        if let Err(e) = outcome {
            EngineStats::inc(&self.stats.bid_errors);
            warn!(event = %event, error = %e, "event handling failed");
        }
    }

    /// A competitor placed (or we see the echo of) an item offer.
    async fn on_item_offer_placed(
        &self,
        collection: &CollectionConfig,
        event: &FeedEvent,
    ) -> Result<(), BidOpError> {
        if collection.offer_type != OfferType::Item {
            return Ok(());
        }
        let symbol = &collection.symbol;
        let token = event.token_id.as_deref().unwrap_or_default();
        let incoming_price = event.listed_price.unwrap_or_default();

        let _lock = self.token_locks.acquire(token).await;

        // Our own bid echoing back through the feed confirms we are top.
        if self.is_ours(event.buyer_payment_address.as_deref()) {
            self.history.set_top(symbol, token, true);
            return Ok(());
        }

        match self.history.our_bid(symbol, token) {
            None => self.try_open_item_bid(collection, token, incoming_price).await,
            Some(ours) => {
                if incoming_price > ours.price {
                    self.history.set_top(symbol, token, false);
                    if !collection.enable_counter_bidding {
                        EngineStats::inc(&self.stats.bids_skipped);
                        return Ok(());
                    }
                    self.counter_bid_item(collection, token, &ours, incoming_price)
                        .await
                } else if incoming_price == ours.price {
                    self.tie_break_item(collection, token, &ours).await
                } else {
                    // Strictly lower: no action, no network call.
                    Ok(())
                }
            }
        }
    }

    /// Equal-price tie-break. Stale local state must not decide this: ask
    /// the authoritative best-offer endpoint, and counter against the price
    /// it returns, not the event's.
    async fn tie_break_item(
        &self,
        collection: &CollectionConfig,
        token: &str,
        ours: &OurBid,
    ) -> Result<(), BidOpError> {
        let symbol = &collection.symbol;
        let best = match self.market.best_offer(token).await {
            Ok(best) => best,
            Err(e) => {
                // Query failed: assume we might already be fine rather than
                // risk an erroneous duplicate bid.
                debug!(token, error = %e, "tie-break query failed, skipping conservatively");
                EngineStats::inc(&self.stats.bids_skipped);
                return Ok(());
            }
        };

        let Some(top) = best.as_ref().and_then(|b| b.top()) else {
            EngineStats::inc(&self.stats.bids_skipped);
            return Ok(());
        };

        if self.our_payment_addresses.contains(&top.buyer_payment_address) {
            self.history.set_top(symbol, token, true);
            return Ok(());
        }

        self.counter_bid_item(collection, token, ours, top.price).await
    }

    /// Counter-bid against a competitor's item offer.
    async fn counter_bid_item(
        &self,
        collection: &CollectionConfig,
        token: &str,
        ours: &OurBid,
        competitor_price: Sats,
    ) -> Result<(), BidOpError> {
        if !collection.enable_counter_bidding {
            EngineStats::inc(&self.stats.bids_skipped);
            return Ok(());
        }
        let floor = self.floor_price(collection).await?;
        let bounds = match pricing::offer_bounds(collection, floor) {
            Ok(bounds) => bounds,
            Err(reason) => return Ok(self.note_skip(collection, token, reason)),
        };

        match pricing::counter_bid(collection, bounds, floor, competitor_price) {
            BidDecision::Place(price) => {
                self.place_item_bid(collection, token, price, Some(ours))
                    .await?;
                EngineStats::inc(&self.stats.counter_bids);
                Ok(())
            }
            BidDecision::Skip(reason) => Ok(self.note_skip(collection, token, reason)),
        }
    }

    /// Place a fresh item bid when the token is in the target set.
    async fn try_open_item_bid(
        &self,
        collection: &CollectionConfig,
        token: &str,
        competitor_price: Sats,
    ) -> Result<(), BidOpError> {
        let symbol = &collection.symbol;

        // Early exit before any floor-price lookup: tokens outside the
        // bottom listings are not bid on.
        let in_target = self
            .history
            .read(symbol, |entry| {
                entry.bottom_listings.iter().any(|l| l.token_id == token)
            })
            .unwrap_or(false);
        if !in_target {
            return Ok(self.note_skip(collection, token, SkipReason::OutsideBottomListings));
        }

        if self.quantity_reached(collection) {
            return Ok(self.note_skip(collection, token, SkipReason::QuantityReached));
        }

        let floor = self.floor_price(collection).await?;
        let bounds = match pricing::offer_bounds(collection, floor) {
            Ok(bounds) => bounds,
            Err(reason) => return Ok(self.note_skip(collection, token, reason)),
        };

        match pricing::competitive_bid(collection, bounds, floor, competitor_price) {
            BidDecision::Place(price) => {
                self.place_item_bid(collection, token, price, None).await?;
                Ok(())
            }
            BidDecision::Skip(reason) => Ok(self.note_skip(collection, token, reason)),
        }
    }

    /// An item offer was cancelled. No tracked bid: no-op. Otherwise confirm
    /// whether we are now top via the authoritative query, and counter-bid
    /// if a competitor holds the top.
    async fn on_item_offer_cancelled(
        &self,
        collection: &CollectionConfig,
        event: &FeedEvent,
    ) -> Result<(), BidOpError> {
        if collection.offer_type != OfferType::Item {
            return Ok(());
        }
        let symbol = &collection.symbol;
        let token = event.token_id.as_deref().unwrap_or_default();

        let _lock = self.token_locks.acquire(token).await;

        let Some(ours) = self.history.our_bid(symbol, token) else {
            return Ok(());
        };

        let best = match self.market.best_offer(token).await {
            Ok(best) => best,
            Err(e) => {
                debug!(token, error = %e, "post-cancel query failed, skipping conservatively");
                EngineStats::inc(&self.stats.bids_skipped);
                return Ok(());
            }
        };

        match best.as_ref().and_then(|b| b.top()) {
            Some(top) if self.our_payment_addresses.contains(&top.buyer_payment_address) => {
                self.history.set_top(symbol, token, true);
                Ok(())
            }
            Some(top) => self.counter_bid_item(collection, token, &ours, top.price).await,
            None => {
                // No live offers at all: ours is gone too.
                self.history.remove_bid(symbol, token);
                Ok(())
            }
        }
    }

    /// A collection offer was created or edited. Both kinds get a fresh
    /// evaluation; an edit is not treated as a diff.
    async fn on_collection_offer(
        &self,
        collection: &CollectionConfig,
        event: &FeedEvent,
    ) -> Result<(), BidOpError> {
        if collection.offer_type != OfferType::Collection {
            return Ok(());
        }
        let symbol = &collection.symbol;
        let key = collection_bid_key(symbol);
        let incoming_price = event.listed_price.unwrap_or_default();

        let _lock = self.token_locks.acquire(&key).await;

        if self.is_ours(event.buyer_payment_address.as_deref()) {
            self.history.set_top(symbol, &key, true);
            return Ok(());
        }

        match self.history.our_bid(symbol, &key) {
            None => {
                if self.quantity_reached(collection) {
                    return Ok(self.note_skip(collection, &key, SkipReason::QuantityReached));
                }
                let floor = self.floor_price(collection).await?;
                let bounds = match pricing::offer_bounds(collection, floor) {
                    Ok(bounds) => bounds,
                    Err(reason) => return Ok(self.note_skip(collection, &key, reason)),
                };
                match pricing::competitive_bid(collection, bounds, floor, incoming_price) {
                    BidDecision::Place(price) => {
                        self.place_collection_bid(collection, price, None).await
                    }
                    BidDecision::Skip(reason) => Ok(self.note_skip(collection, &key, reason)),
                }
            }
            Some(ours) => {
                if incoming_price > ours.price {
                    self.history.set_top(symbol, &key, false);
                    self.counter_bid_collection(collection, &ours, incoming_price)
                        .await
                } else if incoming_price == ours.price {
                    self.tie_break_collection(collection, &ours).await
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn tie_break_collection(
        &self,
        collection: &CollectionConfig,
        ours: &OurBid,
    ) -> Result<(), BidOpError> {
        let symbol = &collection.symbol;
        let key = collection_bid_key(symbol);
        let best = match self.market.best_collection_offer(symbol).await {
            Ok(best) => best,
            Err(e) => {
                debug!(collection = %symbol, error = %e, "tie-break query failed, skipping conservatively");
                EngineStats::inc(&self.stats.bids_skipped);
                return Ok(());
            }
        };

        let Some(top) = best.as_ref().and_then(|b| b.top()) else {
            EngineStats::inc(&self.stats.bids_skipped);
            return Ok(());
        };

        if self.our_payment_addresses.contains(&top.buyer_payment_address) {
            self.history.set_top(symbol, &key, true);
            return Ok(());
        }

        self.counter_bid_collection(collection, ours, top.price).await
    }

    async fn counter_bid_collection(
        &self,
        collection: &CollectionConfig,
        ours: &OurBid,
        competitor_price: Sats,
    ) -> Result<(), BidOpError> {
        let key = collection_bid_key(&collection.symbol);
        if !collection.enable_counter_bidding {
            EngineStats::inc(&self.stats.bids_skipped);
            return Ok(());
        }
        let floor = self.floor_price(collection).await?;
        let bounds = match pricing::offer_bounds(collection, floor) {
            Ok(bounds) => bounds,
            Err(reason) => return Ok(self.note_skip(collection, &key, reason)),
        };
        match pricing::counter_bid(collection, bounds, floor, competitor_price) {
            BidDecision::Place(price) => {
                self.place_collection_bid(collection, price, Some(ours))
                    .await?;
                EngineStats::inc(&self.stats.counter_bids);
                Ok(())
            }
            BidDecision::Skip(reason) => Ok(self.note_skip(collection, &key, reason)),
        }
    }

    /// A collection offer was cancelled. Mirrors the item-cancel logic at
    /// collection scope.
    async fn on_collection_offer_cancelled(
        &self,
        collection: &CollectionConfig,
        _event: &FeedEvent,
    ) -> Result<(), BidOpError> {
        if collection.offer_type != OfferType::Collection {
            return Ok(());
        }
        let symbol = &collection.symbol;
        let key = collection_bid_key(symbol);

        let _lock = self.token_locks.acquire(&key).await;

        let Some(ours) = self.history.our_bid(symbol, &key) else {
            return Ok(());
        };

        let best = match self.market.best_collection_offer(symbol).await {
            Ok(best) => best,
            Err(e) => {
                debug!(collection = %symbol, error = %e, "post-cancel query failed, skipping conservatively");
                EngineStats::inc(&self.stats.bids_skipped);
                return Ok(());
            }
        };

        match best.as_ref().and_then(|b| b.top()) {
            Some(top) if self.our_payment_addresses.contains(&top.buyer_payment_address) => {
                self.history.set_top(symbol, &key, true);
                Ok(())
            }
            Some(top) => self.counter_bid_collection(collection, &ours, top.price).await,
            None => {
                self.history.remove_bid(symbol, &key);
                Ok(())
            }
        }
    }

    /// A token was bought, or an item offer was accepted. The listing is
    /// gone either way; when the buyer is us, this is a fill.
    async fn on_token_purchase(
        &self,
        collection: &CollectionConfig,
        event: &FeedEvent,
    ) -> Result<(), BidOpError> {
        let symbol = &collection.symbol;
        let token = event.token_id.as_deref().unwrap_or_default();

        let _lock = self.token_locks.acquire(token).await;

        let ours = match event.buyer_payment_address.as_deref() {
            Some(addr) => self.our_payment_addresses.contains(addr),
            // No buyer on the wire: an accepted offer on a token we were
            // bidding on counts as our fill.
            None => {
                event.kind == EventKind::OfferAcceptedBroadcasted
                    && self.history.our_bid(symbol, token).is_some()
            }
        };

        self.history.remove_bid(symbol, token);
        self.history.with_entry(symbol, collection.offer_type, |entry| {
            entry.bottom_listings.retain(|l| l.token_id != token);
        });

        if ours {
            self.record_fill(collection).await?;
            info!(collection = %symbol, token, "item offer filled");
        }
        Ok(())
    }

    /// Our (or a competitor's) collection offer was fulfilled.
    async fn on_collection_fulfill(
        &self,
        collection: &CollectionConfig,
        event: &FeedEvent,
    ) -> Result<(), BidOpError> {
        let symbol = &collection.symbol;
        let key = collection_bid_key(symbol);

        let _lock = self.token_locks.acquire(&key).await;

        let ours = self.is_ours(event.buyer_payment_address.as_deref())
            || (event.buyer_payment_address.is_none()
                && self.history.our_bid(symbol, &key).is_some());

        if ours {
            self.history.remove_bid(symbol, &key);
            self.record_fill(collection).await?;
            info!(collection = %symbol, "collection offer filled");
        }
        Ok(())
    }

    /// Serialized fill accounting under the quantity lock.
    async fn record_fill(&self, collection: &CollectionConfig) -> Result<(), BidOpError> {
        let filled = self
            .qty_locks
            .with_lock(&collection.symbol, || {
                self.history
                    .increment_quantity(&collection.symbol, collection.offer_type)
            })
            .await?;
        EngineStats::inc(&self.stats.purchases);
        if filled >= collection.quantity {
            info!(
                collection = %collection.symbol,
                filled,
                cap = collection.quantity,
                "purchase cap reached, no further bids for this collection"
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scheduled cycle
    // ------------------------------------------------------------------

    /// One periodic re-evaluation of a collection. Skips the entire cycle
    /// when the pacer is limited rather than stalling it.
    async fn run_scheduled_cycle(&self, collection: &CollectionConfig) {
        if !self.admission_open(collection) {
            EngineStats::inc(&self.stats.cycles_skipped_rate_limited);
            debug!(
                collection = %collection.symbol,
                reset_ms = self.pacer.reset_wait().as_millis() as u64,
                "skipping scheduled cycle, no submission capacity"
            );
            return;
        }

        let _gate = self.gate.enter().await;
        EngineStats::inc(&self.stats.cycles_run);

        if let Err(e) = self.refresh_market_view(collection).await {
            warn!(collection = %collection.symbol, error = %e, "cycle refresh failed");
            return;
        }

        self.history.purge_expired(&collection.symbol, Utc::now());

        if self.quantity_reached(collection) {
            debug!(collection = %collection.symbol, "purchase cap reached, cycle idle");
            return;
        }

        match collection.offer_type {
            OfferType::Item => self.cycle_item_bids(collection).await,
            OfferType::Collection => self.cycle_collection_bid(collection).await,
        }
    }

    /// Refresh floor and bottom listings for a collection.
    async fn refresh_market_view(&self, collection: &CollectionConfig) -> Result<(), MarketError> {
        let view = self.market.floor_and_listings(&collection.symbol).await?;
        let mut bottom = view.listings;
        bottom.truncate(collection.bid_count as usize);
        self.history.set_market_view(
            &collection.symbol,
            collection.offer_type,
            view.floor_price,
            bottom,
        );
        Ok(())
    }

    /// Re-evaluate item bids across the current bottom listings.
    async fn cycle_item_bids(&self, collection: &CollectionConfig) {
        let symbol = &collection.symbol;
        let (floor, targets) = match self
            .history
            .read(symbol, |entry| (entry.floor_price, entry.bottom_listings.clone()))
        {
            Some(view) => view,
            None => return,
        };

        let bounds = match pricing::offer_bounds(collection, floor) {
            Ok(bounds) => bounds,
            Err(reason) => {
                debug!(collection = %symbol, ?reason, "cycle skip");
                return;
            }
        };

        for listing in targets {
            if self.quantity_reached(collection) {
                break;
            }
            // Shed the rest of the cycle instead of stalling on admission.
            if !self.admission_open(collection) {
                EngineStats::inc(&self.stats.cycles_skipped_rate_limited);
                debug!(collection = %symbol, "no submission capacity mid-cycle, deferring remaining tokens");
                break;
            }

            let token = listing.token_id.clone();
            let _lock = self.token_locks.acquire(&token).await;

            let ours = self.history.our_bid(symbol, &token);
            let decision = match self.market.best_offer(&token).await {
                Ok(Some(best)) => match best.top() {
                    Some(top)
                        if self.our_payment_addresses.contains(&top.buyer_payment_address) =>
                    {
                        self.history.set_top(symbol, &token, true);
                        continue;
                    }
                    Some(top) => pricing::competitive_bid(collection, bounds, floor, top.price),
                    None => pricing::opening_bid(collection, bounds, floor),
                },
                Ok(None) => pricing::opening_bid(collection, bounds, floor),
                Err(e) => {
                    EngineStats::inc(&self.stats.bid_errors);
                    warn!(token = %token, error = %e, "best-offer lookup failed");
                    continue;
                }
            };

            match decision {
                BidDecision::Place(price) => {
                    if ours.as_ref().is_some_and(|b| b.price == price) {
                        // Already bidding exactly this; leave it alone.
                        continue;
                    }
                    if let Err(e) = self
                        .place_item_bid(collection, &token, price, ours.as_ref())
                        .await
                    {
                        EngineStats::inc(&self.stats.bid_errors);
                        warn!(token = %token, error = %e, "bid placement failed");
                    }
                }
                BidDecision::Skip(reason) => {
                    self.note_skip(collection, &token, reason);
                }
            }
        }
    }

    /// Re-evaluate the single collection-wide offer.
    async fn cycle_collection_bid(&self, collection: &CollectionConfig) {
        let symbol = &collection.symbol;
        let key = collection_bid_key(symbol);
        let floor = match self.history.read(symbol, |entry| entry.floor_price) {
            Some(floor) => floor,
            None => return,
        };

        let bounds = match pricing::offer_bounds(collection, floor) {
            Ok(bounds) => bounds,
            Err(reason) => {
                debug!(collection = %symbol, ?reason, "cycle skip");
                return;
            }
        };

        let _lock = self.token_locks.acquire(&key).await;
        let ours = self.history.our_bid(symbol, &key);

        let decision = match self.market.best_collection_offer(symbol).await {
            Ok(Some(best)) => match best.top() {
                Some(top) if self.our_payment_addresses.contains(&top.buyer_payment_address) => {
                    self.history.set_top(symbol, &key, true);
                    return;
                }
                Some(top) => pricing::competitive_bid(collection, bounds, floor, top.price),
                None => pricing::opening_bid(collection, bounds, floor),
            },
            Ok(None) => pricing::opening_bid(collection, bounds, floor),
            Err(e) => {
                EngineStats::inc(&self.stats.bid_errors);
                warn!(collection = %symbol, error = %e, "best-collection-offer lookup failed");
                return;
            }
        };

        match decision {
            BidDecision::Place(price) => {
                if ours.as_ref().is_some_and(|b| b.price == price) {
                    return;
                }
                if let Err(e) = self
                    .place_collection_bid(collection, price, ours.as_ref())
                    .await
                {
                    EngineStats::inc(&self.stats.bid_errors);
                    warn!(collection = %symbol, error = %e, "collection bid placement failed");
                }
            }
            BidDecision::Skip(reason) => {
                self.note_skip(collection, &key, reason);
            }
        }
    }

    // ------------------------------------------------------------------
    // Placement plumbing
    // ------------------------------------------------------------------

    /// Admission control: either the identity pool (rotation) or the global
    /// pacer (single identity) must admit the submission.
    async fn admit(&self, collection: &CollectionConfig) -> Result<(IdentityConfig, Admission), BidOpError> {
        match &self.identities {
            Some(pool) => {
                // Validated at startup: the group exists.
                let group = collection.wallet_group.as_deref().unwrap_or_default();
                let lease = pool
                    .acquire(group)
                    .await
                    .map_err(|e| MarketError::Transport(e.to_string()))?;
                Ok((
                    IdentityConfig {
                        label: lease.label.clone(),
                        key_handle: lease.key_handle.clone(),
                        payment_address: lease.payment_address.clone(),
                        receive_address: lease.receive_address.clone(),
                    },
                    Admission::Identity(lease.slot),
                ))
            }
            None => {
                self.pacer.wait_for_slot().await;
                let identity = self
                    .default_identity
                    .clone()
                    .expect("validated: default identity present when rotation is off");
                Ok((identity, Admission::Paced))
            }
        }
    }

    fn record_admission(&self, admission: &Admission) {
        match admission {
            Admission::Paced => self.pacer.record_sent(),
            Admission::Identity(slot) => {
                if let Some(pool) = &self.identities {
                    pool.record_sent(*slot);
                }
            }
        }
    }

    fn record_rejection(&self, admission: &Admission) {
        match admission {
            Admission::Paced => self.pacer.on_rejected(),
            Admission::Identity(slot) => {
                if let Some(pool) = &self.identities {
                    pool.on_rejected(*slot);
                }
            }
        }
    }

    /// Cancel-then-place an item bid and record it in history.
    async fn place_item_bid(
        &self,
        collection: &CollectionConfig,
        token: &str,
        price: Sats,
        existing: Option<&OurBid>,
    ) -> Result<(), BidOpError> {
        let symbol = &collection.symbol;
        let (identity, admission) = self.admit(collection).await?;

        if let Some(existing) = existing {
            match self
                .market
                .cancel_offer(token, &existing.payment_address)
                .await
            {
                Ok(_) => {
                    EngineStats::inc(&self.stats.bids_cancelled);
                    self.history.remove_bid(symbol, token);
                }
                Err(e) => {
                    // Leaving the old bid live and adding another would
                    // double-spend the slot; abort this placement.
                    return Err(self.classify(e, &admission).into());
                }
            }
        }

        let request = CreateOfferRequest {
            token_id: token.to_string(),
            price,
            duration_mins: collection.duration_mins,
            buyer_payment_address: identity.payment_address.clone(),
            buyer_receive_address: identity.receive_address.clone(),
            fee_rate: collection.fee_rate,
        };

        let unsigned = match self.market.create_offer(&request).await {
            Ok(unsigned) => unsigned,
            Err(e) => return Err(self.classify(e, &admission).into()),
        };
        let signed = self.signer.sign_offer(&unsigned, &identity.key_handle).await?;
        if let Err(e) = self.market.submit_signed_offer(&signed).await {
            return Err(self.classify(e, &admission).into());
        }

        self.record_admission(&admission);
        self.history.record_bid(
            symbol,
            collection.offer_type,
            token,
            OurBid {
                price,
                expiration: Utc::now() + chrono::Duration::minutes(collection.duration_mins as i64),
                payment_address: identity.payment_address.clone(),
            },
        );
        self.history.set_top(symbol, token, true);
        EngineStats::inc(&self.stats.bids_placed);
        info!(
            collection = %symbol,
            token,
            price,
            identity = %identity.label,
            "bid placed"
        );
        Ok(())
    }

    /// Cancel-then-place the collection-wide offer.
    async fn place_collection_bid(
        &self,
        collection: &CollectionConfig,
        price: Sats,
        existing: Option<&OurBid>,
    ) -> Result<(), BidOpError> {
        let symbol = &collection.symbol;
        let key = collection_bid_key(symbol);
        let (identity, admission) = self.admit(collection).await?;

        if let Some(existing) = existing {
            match self
                .market
                .cancel_collection_offer(symbol, &existing.payment_address)
                .await
            {
                Ok(_) => {
                    EngineStats::inc(&self.stats.bids_cancelled);
                    self.history.remove_bid(symbol, &key);
                }
                Err(e) => return Err(self.classify(e, &admission).into()),
            }
        }

        let remaining = collection
            .quantity
            .saturating_sub(self.history.quantity(symbol))
            .max(1);
        let request = CreateCollectionOfferRequest {
            collection_symbol: symbol.clone(),
            price,
            quantity: remaining,
            duration_mins: collection.duration_mins,
            buyer_payment_address: identity.payment_address.clone(),
            buyer_receive_address: identity.receive_address.clone(),
            fee_rate: collection.fee_rate,
            traits: collection.traits.clone(),
        };

        let unsigned = match self.market.create_collection_offer(&request).await {
            Ok(unsigned) => unsigned,
            Err(e) => return Err(self.classify(e, &admission).into()),
        };
        let signed = self.signer.sign_offer(&unsigned, &identity.key_handle).await?;
        if let Err(e) = self.market.submit_signed_offer(&signed).await {
            return Err(self.classify(e, &admission).into());
        }

        self.record_admission(&admission);
        self.history.record_bid(
            symbol,
            collection.offer_type,
            &key,
            OurBid {
                price,
                expiration: Utc::now() + chrono::Duration::minutes(collection.duration_mins as i64),
                payment_address: identity.payment_address.clone(),
            },
        );
        self.history.set_top(symbol, &key, true);
        EngineStats::inc(&self.stats.bids_placed);
        info!(collection = %symbol, price, identity = %identity.label, "collection bid placed");
        Ok(())
    }

    /// Route a marketplace error to the right limiter before surfacing it.
    fn classify(&self, error: MarketError, admission: &Admission) -> MarketError {
        match &error {
            MarketError::RateLimited => {
                self.record_rejection(admission);
            }
            MarketError::InsufficientFunds {
                required,
                available,
            } => {
                warn!(
                    required,
                    available,
                    "insufficient funds for bid, skipping"
                );
            }
            _ => {}
        }
        error
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn is_ours(&self, payment_address: Option<&str>) -> bool {
        payment_address.is_some_and(|addr| self.our_payment_addresses.contains(addr))
    }

    /// Whether a submission would be admitted right now: the collection's
    /// identity group has capacity, or (single-identity mode) the pacer is
    /// not limited. Used by the scheduler to shed cycles rather than stall.
    fn admission_open(&self, collection: &CollectionConfig) -> bool {
        match &self.identities {
            Some(pool) => {
                let group = collection.wallet_group.as_deref().unwrap_or_default();
                pool.group_available(group) > 0
            }
            None => !self.pacer.is_limited(),
        }
    }

    fn quantity_reached(&self, collection: &CollectionConfig) -> bool {
        self.history.quantity(&collection.symbol) >= collection.quantity
    }

    fn note_skip(&self, collection: &CollectionConfig, token: &str, reason: SkipReason) {
        EngineStats::inc(&self.stats.bids_skipped);
        debug!(collection = %collection.symbol, token, ?reason, "bid skipped");
    }

    /// Current floor for pricing. Uses the cycle's cached view; falls back
    /// to a live lookup when no refresh has happened yet.
    async fn floor_price(&self, collection: &CollectionConfig) -> Result<Sats, MarketError> {
        let cached = self
            .history
            .read(&collection.symbol, |entry| entry.floor_price)
            .unwrap_or(0);
        if cached > 0 {
            return Ok(cached);
        }
        self.refresh_market_view(collection).await?;
        Ok(self
            .history
            .read(&collection.symbol, |entry| entry.floor_price)
            .unwrap_or(0))
    }

    async fn flush_state(&self) {
        let snapshot = snapshot_history(&self.history);
        if let Err(e) = self
            .persister
            .write_json(&self.config.persistence.state_path, &snapshot)
            .await
        {
            warn!(error = %e, "bid-history snapshot write failed");
        }
    }

    async fn flush_stats(&self) {
        let gauges = RuntimeGauges {
            queue_depth: self.queue.depth(),
            pacer_limited: self.pacer.is_limited(),
            pacer_reset_ms: self.pacer.reset_wait().as_millis() as u64,
            identities_available: self
                .identities
                .as_ref()
                .map(|pool| pool.available())
                .unwrap_or(0),
            identities_total: self
                .identities
                .as_ref()
                .map(|pool| pool.len())
                .unwrap_or(0),
            rss_bytes: current_rss_bytes(),
        };
        let snapshot = self.stats.snapshot(gauges);
        if let Err(e) = self
            .persister
            .write_json(&self.config.persistence.stats_path, &snapshot)
            .await
        {
            warn!(error = %e, "stats snapshot write failed");
        }
    }
}
