//! Typed marketplace errors.
//!
//! Well-known API error bodies are parsed into distinct variants so callers
//! can react (skip an identity, pause a collection) without treating them as
//! transport faults. Rate-limit responses are never retried here; the engine's
//! pacer and identity pool own that policy.

use ord_common::Sats;
use thiserror::Error;

/// Errors surfaced by marketplace operations.
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("insufficient funds: required {required} sats, available {available} sats")]
    InsufficientFunds { required: Sats, available: Sats },

    #[error("rate limited by marketplace")]
    RateLimited,

    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl MarketError {
    /// Map an HTTP error status plus response body into a typed error.
    ///
    /// 429 always maps to `RateLimited`. Known error payloads are parsed
    /// into their typed variants; anything else becomes `Api`.
    pub fn from_response(status: u16, body: &str) -> Self {
        if status == 429 {
            return MarketError::RateLimited;
        }
        if let Some((required, available)) = parse_insufficient_funds(body) {
            return MarketError::InsufficientFunds {
                required,
                available,
            };
        }
        MarketError::Api {
            status,
            message: extract_message(body),
        }
    }

    /// True for errors the engine treats as a rate violation.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, MarketError::RateLimited)
    }
}

/// Pull the `message` field out of a JSON error body, falling back to the
/// raw body (truncated) for non-JSON responses.
fn extract_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(msg) = value.get("message").and_then(|m| m.as_str()) {
            return msg.to_string();
        }
        if let Some(msg) = value.get("error").and_then(|m| m.as_str()) {
            return msg.to_string();
        }
    }
    let mut message = body.trim().to_string();
    message.truncate(200);
    message
}

/// Parse the marketplace's insufficient-funds body:
/// `"Insufficient funds. Required: 150000 sats. Available: 98000 sats"`.
///
/// Returns `(required, available)` when both amounts are present.
fn parse_insufficient_funds(body: &str) -> Option<(Sats, Sats)> {
    let message = extract_message(body);
    if !message.to_lowercase().contains("insufficient funds") {
        return None;
    }
    let required = amount_after(&message, "Required:")?;
    let available = amount_after(&message, "Available:")?;
    Some((required, available))
}

/// First integer following `label` in `text`.
fn amount_after(text: &str, label: &str) -> Option<Sats> {
    let idx = text.find(label)?;
    let rest = &text[idx + label.len()..];
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_429_maps_to_rate_limited() {
        let err = MarketError::from_response(429, "slow down");
        assert!(err.is_rate_limited());
    }

    #[test]
    fn test_insufficient_funds_parsed() {
        let body = r#"{"message":"Insufficient funds. Required: 150000 sats. Available: 98000 sats"}"#;
        match MarketError::from_response(400, body) {
            MarketError::InsufficientFunds {
                required,
                available,
            } => {
                assert_eq!(required, 150_000);
                assert_eq!(available, 98_000);
            }
            other => panic!("expected InsufficientFunds, got {other:?}"),
        }
    }

    #[test]
    fn test_insufficient_funds_plain_body() {
        let body = "Insufficient funds. Required: 21 sats. Available: 0 sats";
        match MarketError::from_response(400, body) {
            MarketError::InsufficientFunds {
                required,
                available,
            } => {
                assert_eq!(required, 21);
                assert_eq!(available, 0);
            }
            other => panic!("expected InsufficientFunds, got {other:?}"),
        }
    }

    #[test]
    fn test_generic_api_error() {
        let body = r#"{"message":"collection not found"}"#;
        match MarketError::from_response(404, body) {
            MarketError::Api { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "collection not found");
            }
            other => panic!("expected Api, got {other:?}"),
        }
    }

    #[test]
    fn test_non_json_body() {
        match MarketError::from_response(502, "<html>bad gateway</html>") {
            MarketError::Api { status, .. } => assert_eq!(status, 502),
            other => panic!("expected Api, got {other:?}"),
        }
    }
}
