//! Wire types for the marketplace REST API.

use chrono::{DateTime, Utc};
use ord_common::{OfferType, Sats, TraitFilter};
use serde::{Deserialize, Serialize};

/// One currently-listed token, as returned by the listings endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    /// Inscription/token id.
    #[serde(rename = "tokenId")]
    pub token_id: String,
    /// Listed price in sats.
    #[serde(rename = "listedPrice")]
    pub price: Sats,
}

/// Floor price plus the cheapest current listings, ordered by price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloorAndListings {
    /// Lowest current listing price in sats.
    #[serde(rename = "floorPrice")]
    pub floor_price: Sats,
    /// Listings ordered cheapest-first.
    pub listings: Vec<Listing>,
}

/// One offer in a ranked best-offer response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedOffer {
    /// Offer id assigned by the marketplace.
    pub id: String,
    /// Offer price in sats.
    pub price: Sats,
    /// Payment address of the offer's maker. Used to recognize our own
    /// offers when deciding whether we are currently top.
    #[serde(rename = "buyerPaymentAddress")]
    pub buyer_payment_address: String,
    /// Offer expiration.
    #[serde(rename = "expirationDate", default)]
    pub expiration: Option<DateTime<Utc>>,
}

/// Ranked offers for a token or collection, best first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestOffers {
    pub offers: Vec<RankedOffer>,
}

impl BestOffers {
    /// The current top offer, if any.
    pub fn top(&self) -> Option<&RankedOffer> {
        self.offers.first()
    }
}

/// Request to create an item offer. The response is unsigned transaction
/// data; signing happens through the `OfferSigner` collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct CreateOfferRequest {
    #[serde(rename = "tokenId")]
    pub token_id: String,
    /// Offer price in sats.
    pub price: Sats,
    /// Offer lifetime in minutes.
    #[serde(rename = "expirationMinutes")]
    pub duration_mins: u32,
    #[serde(rename = "buyerPaymentAddress")]
    pub buyer_payment_address: String,
    #[serde(rename = "buyerReceiveAddress")]
    pub buyer_receive_address: String,
    /// Network fee rate in sat/vB.
    #[serde(rename = "feeRate")]
    pub fee_rate: u64,
}

/// Request to create (or re-create) a collection-wide offer.
#[derive(Debug, Clone, Serialize)]
pub struct CreateCollectionOfferRequest {
    #[serde(rename = "collectionSymbol")]
    pub collection_symbol: String,
    /// Offer price in sats.
    pub price: Sats,
    /// How many fills this offer allows.
    pub quantity: u64,
    /// Offer lifetime in minutes.
    #[serde(rename = "expirationMinutes")]
    pub duration_mins: u32,
    #[serde(rename = "buyerPaymentAddress")]
    pub buyer_payment_address: String,
    #[serde(rename = "buyerReceiveAddress")]
    pub buyer_receive_address: String,
    /// Network fee rate in sat/vB.
    #[serde(rename = "feeRate")]
    pub fee_rate: u64,
    /// Optional trait constraints; trait-scoped offers may price above floor.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub traits: Vec<TraitFilter>,
}

/// Unsigned transaction data returned by offer creation. Opaque to the
/// engine; it is handed to the signer and then submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsignedOffer {
    /// Scope of the offer being created.
    #[serde(rename = "offerType")]
    pub offer_type: OfferType,
    /// Base64 PSBT to sign. Never inspected by the engine.
    pub psbt_base64: String,
}

/// A signed offer ready for submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedOffer {
    #[serde(rename = "offerType")]
    pub offer_type: OfferType,
    /// Base64 signed PSBT.
    pub signed_psbt_base64: String,
}

/// Confirmation returned by a successful submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferConfirmation {
    /// Offer id assigned by the marketplace.
    #[serde(rename = "offerId")]
    pub offer_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_wire_format() {
        let json = r#"{"tokenId":"abc123i0","listedPrice":420000}"#;
        let listing: Listing = serde_json::from_str(json).unwrap();
        assert_eq!(listing.token_id, "abc123i0");
        assert_eq!(listing.price, 420_000);
    }

    #[test]
    fn test_best_offers_top() {
        let offers = BestOffers {
            offers: vec![
                RankedOffer {
                    id: "o1".into(),
                    price: 500_000,
                    buyer_payment_address: "bc1q-top".into(),
                    expiration: None,
                },
                RankedOffer {
                    id: "o2".into(),
                    price: 480_000,
                    buyer_payment_address: "bc1q-second".into(),
                    expiration: None,
                },
            ],
        };
        assert_eq!(offers.top().unwrap().price, 500_000);

        let empty = BestOffers { offers: vec![] };
        assert!(empty.top().is_none());
    }

    #[test]
    fn test_collection_offer_request_skips_empty_traits() {
        let req = CreateCollectionOfferRequest {
            collection_symbol: "nodemonkes".into(),
            price: 100_000,
            quantity: 1,
            duration_mins: 30,
            buyer_payment_address: "bc1q-pay".into(),
            buyer_receive_address: "bc1p-recv".into(),
            fee_rate: 12,
            traits: vec![],
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("traits"));
    }
}
