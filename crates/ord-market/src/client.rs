//! The `Marketplace` trait and its thin HTTP implementation.
//!
//! The engine consumes these operations as opaque async contracts. The HTTP
//! client only shapes requests and maps errors into `MarketError`; it never
//! retries. In particular a 429 is returned as `MarketError::RateLimited`
//! immediately so the engine's pacer and identity pool can extend their own
//! cool-down windows.

use async_trait::async_trait;
use tracing::trace;

use crate::error::MarketError;
use crate::types::{
    BestOffers, CreateCollectionOfferRequest, CreateOfferRequest, FloorAndListings,
    OfferConfirmation, SignedOffer, UnsignedOffer,
};

/// Outbound marketplace operations consumed by the bidding engine.
#[async_trait]
pub trait Marketplace: Send + Sync {
    /// Create an unsigned item offer.
    async fn create_offer(&self, req: &CreateOfferRequest) -> Result<UnsignedOffer, MarketError>;

    /// Create an unsigned collection-wide offer.
    async fn create_collection_offer(
        &self,
        req: &CreateCollectionOfferRequest,
    ) -> Result<UnsignedOffer, MarketError>;

    /// Submit a signed offer for inclusion.
    async fn submit_signed_offer(
        &self,
        signed: &SignedOffer,
    ) -> Result<OfferConfirmation, MarketError>;

    /// Cancel our item offer on a token. Returns whether an offer was
    /// actually cancelled.
    async fn cancel_offer(
        &self,
        token_id: &str,
        buyer_payment_address: &str,
    ) -> Result<bool, MarketError>;

    /// Cancel our collection offer. Returns whether an offer was cancelled.
    async fn cancel_collection_offer(
        &self,
        collection_symbol: &str,
        buyer_payment_address: &str,
    ) -> Result<bool, MarketError>;

    /// Ranked best offers for a token, best first. `None` when the token has
    /// no offers at all.
    async fn best_offer(&self, token_id: &str) -> Result<Option<BestOffers>, MarketError>;

    /// Ranked best collection offers, best first. `None` when the collection
    /// has no offers.
    async fn best_collection_offer(
        &self,
        collection_symbol: &str,
    ) -> Result<Option<BestOffers>, MarketError>;

    /// Current floor price and cheapest listings for a collection.
    async fn floor_and_listings(
        &self,
        collection_symbol: &str,
    ) -> Result<FloorAndListings, MarketError>;
}

/// Thin REST client for the marketplace API.
pub struct HttpMarketplace {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpMarketplace {
    /// Create a client against `base_url` (no trailing slash).
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Send a request and decode the JSON response, mapping error statuses
    /// through `MarketError::from_response`.
    async fn execute<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, MarketError> {
        let response = self
            .request(builder)
            .send()
            .await
            .map_err(|e| MarketError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MarketError::from_response(status.as_u16(), &body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| MarketError::Transport(format!("decode failed: {e}")))
    }
}

#[async_trait]
impl Marketplace for HttpMarketplace {
    async fn create_offer(&self, req: &CreateOfferRequest) -> Result<UnsignedOffer, MarketError> {
        trace!(token_id = %req.token_id, price = req.price, "create_offer");
        self.execute(self.http.post(self.url("/v2/offers/create")).json(req))
            .await
    }

    async fn create_collection_offer(
        &self,
        req: &CreateCollectionOfferRequest,
    ) -> Result<UnsignedOffer, MarketError> {
        trace!(collection = %req.collection_symbol, price = req.price, "create_collection_offer");
        self.execute(
            self.http
                .post(self.url("/v2/collection-offers/create"))
                .json(req),
        )
        .await
    }

    async fn submit_signed_offer(
        &self,
        signed: &SignedOffer,
    ) -> Result<OfferConfirmation, MarketError> {
        self.execute(self.http.post(self.url("/v2/offers/submit")).json(signed))
            .await
    }

    async fn cancel_offer(
        &self,
        token_id: &str,
        buyer_payment_address: &str,
    ) -> Result<bool, MarketError> {
        #[derive(serde::Deserialize)]
        struct CancelResponse {
            ok: bool,
        }
        let response: CancelResponse = self
            .execute(self.http.post(self.url("/v2/offers/cancel")).json(
                &serde_json::json!({
                    "tokenId": token_id,
                    "buyerPaymentAddress": buyer_payment_address,
                }),
            ))
            .await?;
        Ok(response.ok)
    }

    async fn cancel_collection_offer(
        &self,
        collection_symbol: &str,
        buyer_payment_address: &str,
    ) -> Result<bool, MarketError> {
        #[derive(serde::Deserialize)]
        struct CancelResponse {
            ok: bool,
        }
        let response: CancelResponse = self
            .execute(
                self.http
                    .post(self.url("/v2/collection-offers/cancel"))
                    .json(&serde_json::json!({
                        "collectionSymbol": collection_symbol,
                        "buyerPaymentAddress": buyer_payment_address,
                    })),
            )
            .await?;
        Ok(response.ok)
    }

    async fn best_offer(&self, token_id: &str) -> Result<Option<BestOffers>, MarketError> {
        let offers: BestOffers = self
            .execute(
                self.http
                    .get(self.url("/v2/offers"))
                    .query(&[("tokenId", token_id), ("sortBy", "priceDesc")]),
            )
            .await?;
        Ok(if offers.offers.is_empty() {
            None
        } else {
            Some(offers)
        })
    }

    async fn best_collection_offer(
        &self,
        collection_symbol: &str,
    ) -> Result<Option<BestOffers>, MarketError> {
        let offers: BestOffers = self
            .execute(self.http.get(self.url("/v2/collection-offers")).query(&[
                ("collectionSymbol", collection_symbol),
                ("sortBy", "priceDesc"),
            ]))
            .await?;
        Ok(if offers.offers.is_empty() {
            None
        } else {
            Some(offers)
        })
    }

    async fn floor_and_listings(
        &self,
        collection_symbol: &str,
    ) -> Result<FloorAndListings, MarketError> {
        self.execute(self.http.get(self.url("/v2/listings")).query(&[
            ("collectionSymbol", collection_symbol),
            ("sortBy", "priceAsc"),
        ]))
        .await
    }
}
