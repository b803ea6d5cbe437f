//! Pure bid-pricing computations: offer bounds, counter-bid prices, and the
//! guards around them.
//!
//! Everything here is side-effect free; the engine owns the network calls
//! and lock discipline around these decisions.

use ord_common::{pct_of, OfferType, Sats};

use crate::config::CollectionConfig;

/// Effective offer bounds for a collection at the current floor price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferBounds {
    pub min_offer: Sats,
    pub max_offer: Sats,
}

/// Why a placement or counter-bid was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// `max_floor_bid > 100` without trait filters: bidding above floor is
    /// only permitted for trait-scoped bids.
    AboveFloorWithoutTraits,
    /// The computed bounds leave no admissible price.
    EmptyBounds,
    /// The candidate price exceeds the maximum offer.
    ExceedsMaxOffer,
    /// COLLECTION offers must stay strictly below the live floor.
    AtOrAboveFloor,
    /// The purchase cap for the collection is already reached.
    QuantityReached,
    /// The token is not in the current bottom listings.
    OutsideBottomListings,
}

/// Outcome of a pricing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BidDecision {
    Place(Sats),
    Skip(SkipReason),
}

/// Compute `[min_offer, max_offer]` for `config` at `floor_price`:
/// `min_offer = max(min_bid, round(min_floor_bid% × floor))`,
/// `max_offer = min(max_bid, round(max_floor_bid% × floor))`.
///
/// Returns a skip when the range is empty, or when the configuration asks
/// to bid above floor without trait filters (the hard skip applies to both
/// ITEM and COLLECTION offers).
pub fn offer_bounds(config: &CollectionConfig, floor_price: Sats) -> Result<OfferBounds, SkipReason> {
    if config.max_floor_bid > 100 && config.traits.is_empty() {
        return Err(SkipReason::AboveFloorWithoutTraits);
    }

    let min_offer = config.min_bid.max(pct_of(config.min_floor_bid, floor_price));
    let max_offer = config.max_bid.min(pct_of(config.max_floor_bid, floor_price));

    if min_offer > max_offer {
        return Err(SkipReason::EmptyBounds);
    }
    Ok(OfferBounds {
        min_offer,
        max_offer,
    })
}

/// Price for a fresh bid with no competing offer: the bottom of the
/// admissible range. COLLECTION offers must additionally stay below floor.
pub fn opening_bid(
    config: &CollectionConfig,
    bounds: OfferBounds,
    floor_price: Sats,
) -> BidDecision {
    let price = bounds.min_offer;
    guard_price(config.offer_type, price, bounds, floor_price)
}

/// Counter-bid against `competitor_price`:
/// `competitor_price + out_bid_margin`, subject to the same guards.
pub fn counter_bid(
    config: &CollectionConfig,
    bounds: OfferBounds,
    floor_price: Sats,
    competitor_price: Sats,
) -> BidDecision {
    let price = competitor_price.saturating_add(config.out_bid_margin);
    guard_price(config.offer_type, price, bounds, floor_price)
}

/// Price for bidding when a competitor already holds the top offer: outbid
/// when counter-bidding is enabled, otherwise open at the range bottom only
/// if that beats the competitor.
pub fn competitive_bid(
    config: &CollectionConfig,
    bounds: OfferBounds,
    floor_price: Sats,
    competitor_price: Sats,
) -> BidDecision {
    if config.enable_counter_bidding {
        counter_bid(config, bounds, floor_price, competitor_price)
    } else if bounds.min_offer > competitor_price {
        guard_price(config.offer_type, bounds.min_offer, bounds, floor_price)
    } else {
        BidDecision::Skip(SkipReason::ExceedsMaxOffer)
    }
}

fn guard_price(
    offer_type: OfferType,
    price: Sats,
    bounds: OfferBounds,
    floor_price: Sats,
) -> BidDecision {
    if price > bounds.max_offer {
        return BidDecision::Skip(SkipReason::ExceedsMaxOffer);
    }
    if offer_type == OfferType::Collection && price >= floor_price {
        return BidDecision::Skip(SkipReason::AtOrAboveFloor);
    }
    BidDecision::Place(price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollectionConfig;
    use ord_common::TraitFilter;

    fn config(offer_type: OfferType) -> CollectionConfig {
        CollectionConfig {
            symbol: "monkes".to_string(),
            min_bid: 100_000,
            max_bid: 1_000_000,
            min_floor_bid: 50,
            max_floor_bid: 80,
            offer_type,
            bid_count: 10,
            duration_mins: 30,
            scheduled_loop_secs: 60,
            enable_counter_bidding: true,
            out_bid_margin: 1_000,
            quantity: 1,
            fee_rate: 12,
            wallet_group: None,
            traits: Vec::new(),
        }
    }

    #[test]
    fn test_bounds_from_floor_percentages() {
        // minFloorBid=50, maxFloorBid=80, floor=1,000,000,
        // minBid=100,000, maxBid=1,000,000 => [500,000, 800,000].
        let bounds = offer_bounds(&config(OfferType::Item), 1_000_000).unwrap();
        assert_eq!(bounds.min_offer, 500_000);
        assert_eq!(bounds.max_offer, 800_000);
    }

    #[test]
    fn test_absolute_bounds_clamp() {
        let mut cfg = config(OfferType::Item);
        cfg.min_bid = 600_000;
        cfg.max_bid = 700_000;
        let bounds = offer_bounds(&cfg, 1_000_000).unwrap();
        // Absolute floor beats the percentage floor; absolute ceiling beats
        // the percentage ceiling.
        assert_eq!(bounds.min_offer, 600_000);
        assert_eq!(bounds.max_offer, 700_000);
    }

    #[test]
    fn test_above_floor_without_traits_is_hard_skip() {
        let mut cfg = config(OfferType::Item);
        cfg.max_floor_bid = 120;
        assert_eq!(
            offer_bounds(&cfg, 1_000_000),
            Err(SkipReason::AboveFloorWithoutTraits)
        );

        // The same configuration with one trait entry is allowed.
        cfg.traits = vec![TraitFilter {
            trait_type: "Background".into(),
            value: "Gold".into(),
        }];
        let bounds = offer_bounds(&cfg, 1_000_000).unwrap();
        assert_eq!(bounds.max_offer, 1_000_000); // capped by max_bid
    }

    #[test]
    fn test_empty_bounds_skip() {
        let mut cfg = config(OfferType::Item);
        cfg.min_bid = 900_000;
        cfg.max_floor_bid = 80; // max_offer = 800,000 < min_offer
        assert_eq!(offer_bounds(&cfg, 1_000_000), Err(SkipReason::EmptyBounds));
    }

    #[test]
    fn test_counter_bid_adds_margin() {
        let cfg = config(OfferType::Item);
        let bounds = offer_bounds(&cfg, 1_000_000).unwrap();
        assert_eq!(
            counter_bid(&cfg, bounds, 1_000_000, 600_000),
            BidDecision::Place(601_000)
        );
    }

    #[test]
    fn test_counter_bid_respects_max_offer() {
        let cfg = config(OfferType::Item);
        let bounds = offer_bounds(&cfg, 1_000_000).unwrap();
        assert_eq!(
            counter_bid(&cfg, bounds, 1_000_000, 800_000),
            BidDecision::Skip(SkipReason::ExceedsMaxOffer)
        );
    }

    #[test]
    fn test_collection_bid_must_stay_below_floor() {
        let mut cfg = config(OfferType::Collection);
        cfg.max_bid = 2_000_000;
        cfg.max_floor_bid = 100;
        let bounds = offer_bounds(&cfg, 500_000).unwrap();
        // Counter at exactly the floor is rejected.
        assert_eq!(
            counter_bid(&cfg, bounds, 500_000, 499_000),
            BidDecision::Skip(SkipReason::AtOrAboveFloor)
        );
        // Strictly below floor is fine.
        assert_eq!(
            counter_bid(&cfg, bounds, 500_000, 400_000),
            BidDecision::Place(401_000)
        );
    }

    #[test]
    fn test_opening_bid_uses_range_bottom() {
        let cfg = config(OfferType::Item);
        let bounds = offer_bounds(&cfg, 1_000_000).unwrap();
        assert_eq!(
            opening_bid(&cfg, bounds, 1_000_000),
            BidDecision::Place(500_000)
        );
    }

    #[test]
    fn test_competitive_bid_without_counter_bidding() {
        let mut cfg = config(OfferType::Item);
        cfg.enable_counter_bidding = false;
        let bounds = offer_bounds(&cfg, 1_000_000).unwrap();
        // Competitor above our range bottom: no bid.
        assert_eq!(
            competitive_bid(&cfg, bounds, 1_000_000, 600_000),
            BidDecision::Skip(SkipReason::ExceedsMaxOffer)
        );
        // Competitor below our range bottom: open at the bottom.
        assert_eq!(
            competitive_bid(&cfg, bounds, 1_000_000, 400_000),
            BidDecision::Place(500_000)
        );
    }
}
