//! Shared types for the Ordinals bidding bot.
//!
//! This crate contains the domain vocabulary used by every other crate:
//! offer kinds, trait filters, and price conventions.
//!
//! CRITICAL: all prices are smallest-unit integers (satoshis). There is no
//! fractional money anywhere in this system.

pub mod types;

pub use types::*;
