//! Feed event model: a closed set of watched kinds plus validation.
//!
//! Raw feed messages are JSON objects with a `kind` field. Everything the
//! engine reacts to is represented by the exhaustive `EventKind` enum, so a
//! newly-watched kind is a compile-time-visible gap, not a silent branch.

use chrono::{DateTime, TimeZone, Utc};
use ord_common::Sats;
use serde_json::Value;

/// Watched feed event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A competitor placed an item offer.
    OfferPlaced,
    /// A collection-wide offer was created.
    CollOfferCreated,
    /// A collection-wide offer was edited. Handled identically to creation.
    CollOfferEdited,
    /// An item offer was cancelled.
    OfferCancelled,
    /// A collection offer was cancelled.
    CollOfferCancelled,
    /// A purchase transaction was broadcast for a listed token.
    BuyingBroadcasted,
    /// An item offer (possibly ours) was accepted and broadcast.
    OfferAcceptedBroadcasted,
    /// A collection offer (possibly ours) was fulfilled and broadcast.
    CollOfferFulfillBroadcasted,
}

impl EventKind {
    /// Parse the wire spelling. Returns `None` for kinds we do not watch.
    pub fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "offer_placed" => Some(EventKind::OfferPlaced),
            "coll_offer_created" => Some(EventKind::CollOfferCreated),
            "coll_offer_edited" => Some(EventKind::CollOfferEdited),
            "offer_cancelled" => Some(EventKind::OfferCancelled),
            "coll_offer_cancelled" => Some(EventKind::CollOfferCancelled),
            "buying_broadcasted" => Some(EventKind::BuyingBroadcasted),
            "offer_accepted_broadcasted" => Some(EventKind::OfferAcceptedBroadcasted),
            "coll_offer_fulfill_broadcasted" => Some(EventKind::CollOfferFulfillBroadcasted),
            _ => None,
        }
    }

    /// The wire spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::OfferPlaced => "offer_placed",
            EventKind::CollOfferCreated => "coll_offer_created",
            EventKind::CollOfferEdited => "coll_offer_edited",
            EventKind::OfferCancelled => "offer_cancelled",
            EventKind::CollOfferCancelled => "coll_offer_cancelled",
            EventKind::BuyingBroadcasted => "buying_broadcasted",
            EventKind::OfferAcceptedBroadcasted => "offer_accepted_broadcasted",
            EventKind::CollOfferFulfillBroadcasted => "coll_offer_fulfill_broadcasted",
        }
    }

    /// Purchase-completion kinds. These bypass dedup and supersession and are
    /// preferentially kept when the queue overflows: every purchase signal
    /// must be processed.
    pub fn is_purchase(&self) -> bool {
        matches!(
            self,
            EventKind::BuyingBroadcasted
                | EventKind::OfferAcceptedBroadcasted
                | EventKind::CollOfferFulfillBroadcasted
        )
    }

    /// Kinds that carry a `tokenId`.
    pub fn is_token_scoped(&self) -> bool {
        matches!(
            self,
            EventKind::OfferPlaced
                | EventKind::OfferCancelled
                | EventKind::BuyingBroadcasted
                | EventKind::OfferAcceptedBroadcasted
        )
    }

    /// Offer-creation kinds that carry `listedPrice` and
    /// `buyerPaymentAddress`.
    pub fn bears_price(&self) -> bool {
        matches!(
            self,
            EventKind::OfferPlaced | EventKind::CollOfferCreated | EventKind::CollOfferEdited
        )
    }

    /// Dedup class: item offers, item cancels, collection offers
    /// (creation and edit share a class since they are handled identically),
    /// and collection cancels each collapse independently.
    fn dedup_class(&self) -> DedupClass {
        match self {
            EventKind::OfferPlaced => DedupClass::ItemOffer,
            EventKind::OfferCancelled => DedupClass::ItemCancel,
            EventKind::CollOfferCreated | EventKind::CollOfferEdited => DedupClass::CollOffer,
            EventKind::CollOfferCancelled => DedupClass::CollCancel,
            // Purchases never dedup; the class is unused for them.
            EventKind::BuyingBroadcasted
            | EventKind::OfferAcceptedBroadcasted
            | EventKind::CollOfferFulfillBroadcasted => DedupClass::Purchase,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DedupClass {
    ItemOffer,
    ItemCancel,
    CollOffer,
    CollCancel,
    Purchase,
}

/// Key under which redundant queued events collapse.
///
/// Item-scoped offers and cancels key on (collection, token); collection
/// offers, edits and cancels key on the collection alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    class: DedupClass,
    symbol: String,
    token: Option<String>,
}

/// A validated market event.
#[derive(Debug, Clone)]
pub struct FeedEvent {
    pub kind: EventKind,
    pub collection_symbol: String,
    /// Present for token-scoped kinds.
    pub token_id: Option<String>,
    /// Present for offer-creation kinds.
    pub listed_price: Option<Sats>,
    /// Present for offer-creation kinds.
    pub buyer_payment_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FeedEvent {
    /// The key under which this event dedups/supersedes.
    pub fn dedup_key(&self) -> DedupKey {
        let class = self.kind.dedup_class();
        DedupKey {
            class,
            symbol: self.collection_symbol.clone(),
            token: if self.kind.is_token_scoped() {
                self.token_id.clone()
            } else {
                None
            },
        }
    }
}

impl std::fmt::Display for FeedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.token_id {
            Some(token) => write!(f, "{}({}/{})", self.kind, self.collection_symbol, token),
            None => write!(f, "{}({})", self.kind, self.collection_symbol),
        }
    }
}

/// Why a raw message did not become a `FeedEvent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRejection {
    /// Structurally invalid: wrong field types or missing required fields.
    Malformed(&'static str),
    /// Well-formed but not a kind we watch.
    UnwatchedKind(String),
}

/// Validate a raw feed message.
///
/// Rejects anything whose `kind` is not a string, whose `collectionSymbol`
/// is not a string, or whose kind-specific required fields are missing.
/// Unwatched kinds are reported separately so the queue can count them apart
/// from malformed traffic.
pub fn parse_event(raw: &Value) -> Result<FeedEvent, EventRejection> {
    let kind_str = raw
        .get("kind")
        .and_then(Value::as_str)
        .ok_or(EventRejection::Malformed("kind"))?;

    let kind = EventKind::from_wire(kind_str)
        .ok_or_else(|| EventRejection::UnwatchedKind(kind_str.to_string()))?;

    let collection_symbol = raw
        .get("collectionSymbol")
        .and_then(Value::as_str)
        .ok_or(EventRejection::Malformed("collectionSymbol"))?
        .to_string();

    let token_id = raw
        .get("tokenId")
        .and_then(Value::as_str)
        .map(str::to_string);
    if kind.is_token_scoped() && token_id.is_none() {
        return Err(EventRejection::Malformed("tokenId"));
    }

    let listed_price = raw.get("listedPrice").and_then(Value::as_u64);
    let buyer_payment_address = raw
        .get("buyerPaymentAddress")
        .and_then(Value::as_str)
        .map(str::to_string);
    if kind.bears_price() && (listed_price.is_none() || buyer_payment_address.is_none()) {
        return Err(EventRejection::Malformed("listedPrice/buyerPaymentAddress"));
    }

    let created_at = raw
        .get("createdAt")
        .and_then(Value::as_i64)
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);

    Ok(FeedEvent {
        kind,
        collection_symbol,
        token_id,
        listed_price,
        buyer_payment_address,
        created_at,
    })
}
