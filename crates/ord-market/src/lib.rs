//! Thin marketplace client layer for the Ordinals bidding bot.
//!
//! This crate defines the contracts the bidding engine consumes:
//! - `Marketplace`: the outbound REST operations (create/submit/cancel
//!   offers, best-offer lookups, floor and listings)
//! - `OfferSigner`: the opaque signing collaborator (PSBT signing lives
//!   outside this codebase; the engine never inspects key material)
//! - `MarketError`: typed failure conditions, with well-known API error
//!   bodies (insufficient funds, rate limits) parsed into distinct variants
//!
//! The HTTP implementations here only shape requests and map errors; all
//! retry and pacing policy lives in the engine.

pub mod client;
pub mod error;
pub mod signer;
pub mod types;

pub use client::{HttpMarketplace, Marketplace};
pub use error::MarketError;
pub use signer::{HttpSigner, OfferSigner, SignError};
pub use types::{
    BestOffers, CreateCollectionOfferRequest, CreateOfferRequest, FloorAndListings, Listing,
    OfferConfirmation, RankedOffer, SignedOffer, UnsignedOffer,
};
