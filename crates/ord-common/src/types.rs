//! Shared types for the Ordinals bidding bot.

use serde::{Deserialize, Serialize};

/// Price in satoshis. Offers, floors and margins are all expressed in sats.
pub type Sats = u64;

/// Scope of an offer: a single inscription or a whole collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OfferType {
    /// Per-token offers against individual listed inscriptions.
    Item,
    /// One standing offer against any token in the collection.
    Collection,
}

impl OfferType {
    /// Parse from the config/wire spelling ("ITEM" / "COLLECTION").
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "ITEM" => Some(OfferType::Item),
            "COLLECTION" => Some(OfferType::Collection),
            _ => None,
        }
    }

    /// Returns the display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OfferType::Item => "ITEM",
            OfferType::Collection => "COLLECTION",
        }
    }
}

impl std::fmt::Display for OfferType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single trait constraint for trait-scoped collection offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraitFilter {
    /// Trait category, e.g. "Background".
    #[serde(rename = "traitType")]
    pub trait_type: String,
    /// Trait value, e.g. "Gold".
    pub value: String,
}

/// Half-up integer rounding of `pct` percent of `base`.
///
/// `pct` may be negative or above 100; the result is clamped at zero since
/// no offer can be priced below zero sats. Intermediate math runs in i128 so
/// large floors with large percentages cannot overflow.
pub fn pct_of(pct: i64, base: Sats) -> Sats {
    let product = pct as i128 * base as i128;
    // Round half away from zero, then clamp negatives to 0.
    let rounded = if product >= 0 {
        (product + 50) / 100
    } else {
        (product - 50) / 100
    };
    rounded.clamp(0, u64::MAX as i128) as Sats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_type_from_str() {
        assert_eq!(OfferType::from_str_opt("ITEM"), Some(OfferType::Item));
        assert_eq!(OfferType::from_str_opt("item"), Some(OfferType::Item));
        assert_eq!(
            OfferType::from_str_opt("COLLECTION"),
            Some(OfferType::Collection)
        );
        assert_eq!(OfferType::from_str_opt("bundle"), None);
    }

    #[test]
    fn test_offer_type_display() {
        assert_eq!(OfferType::Item.to_string(), "ITEM");
        assert_eq!(OfferType::Collection.to_string(), "COLLECTION");
    }

    #[test]
    fn test_pct_of_basic() {
        assert_eq!(pct_of(50, 1_000_000), 500_000);
        assert_eq!(pct_of(80, 1_000_000), 800_000);
        assert_eq!(pct_of(100, 123_456), 123_456);
    }

    #[test]
    fn test_pct_of_rounds_half_up() {
        // 33% of 100 = 33, 50% of 101 = 50.5 -> 51
        assert_eq!(pct_of(33, 100), 33);
        assert_eq!(pct_of(50, 101), 51);
    }

    #[test]
    fn test_pct_of_above_floor_and_negative() {
        assert_eq!(pct_of(120, 1_000_000), 1_200_000);
        // Negative percentages clamp to zero rather than underflowing.
        assert_eq!(pct_of(-20, 1_000_000), 0);
    }

    #[test]
    fn test_pct_of_large_floor_no_overflow() {
        // 21M BTC in sats times 500% stays in range via i128 intermediates.
        let max_supply_sats: Sats = 2_100_000_000_000_000;
        assert_eq!(pct_of(500, max_supply_sats), 10_500_000_000_000_000);
    }

    #[test]
    fn test_trait_filter_serde() {
        let json = r#"{"traitType":"Background","value":"Gold"}"#;
        let t: TraitFilter = serde_json::from_str(json).unwrap();
        assert_eq!(t.trait_type, "Background");
        assert_eq!(t.value, "Gold");
    }
}
