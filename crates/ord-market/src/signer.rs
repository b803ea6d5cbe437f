//! The signing collaborator boundary.
//!
//! Wallet key derivation and PSBT cryptography live outside this codebase.
//! The engine carries an opaque key handle per identity and hands it, with
//! the unsigned offer, to an `OfferSigner`. The bundled implementation
//! forwards to an external signing service over HTTP.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{SignedOffer, UnsignedOffer};

/// Signing failures. The engine treats these like any other per-token
/// operation error: logged, counted, isolated.
#[derive(Debug, Error)]
pub enum SignError {
    #[error("unknown key handle: {0}")]
    UnknownKey(String),

    #[error("signer rejected request: {0}")]
    Rejected(String),

    #[error("signer transport error: {0}")]
    Transport(String),
}

/// Signs unsigned offers on behalf of a named identity.
#[async_trait]
pub trait OfferSigner: Send + Sync {
    /// Sign `unsigned` with the key behind `key_handle`.
    async fn sign_offer(
        &self,
        unsigned: &UnsignedOffer,
        key_handle: &str,
    ) -> Result<SignedOffer, SignError>;
}

/// Signer backed by an external signing service.
pub struct HttpSigner {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpSigner {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl OfferSigner for HttpSigner {
    async fn sign_offer(
        &self,
        unsigned: &UnsignedOffer,
        key_handle: &str,
    ) -> Result<SignedOffer, SignError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "keyHandle": key_handle,
                "psbtBase64": unsigned.psbt_base64,
            }))
            .send()
            .await
            .map_err(|e| SignError::Transport(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SignError::UnknownKey(key_handle.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SignError::Rejected(format!("{status}: {body}")));
        }

        #[derive(serde::Deserialize)]
        struct SignResponse {
            #[serde(rename = "signedPsbtBase64")]
            signed_psbt_base64: String,
        }
        let signed: SignResponse = response
            .json()
            .await
            .map_err(|e| SignError::Transport(format!("decode failed: {e}")))?;

        Ok(SignedOffer {
            offer_type: unsigned.offer_type,
            signed_psbt_base64: signed.signed_psbt_base64,
        })
    }
}
