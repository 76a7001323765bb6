//! Payment-rail boundary.
//!
//! The engine hands a [`TransferRequest`] (amount already in minor units) to
//! a [`PaymentRail`] and gets back a transfer id or a [`RailError`]. Calls
//! are never retried here; the caller records the failure.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod http;
mod paper;

pub use http::HttpRail;
pub use paper::PaperRail;

/// Metadata key carrying the payout id; rails use it as the idempotency key.
pub const META_PAYOUT_ID: &str = "payout_id";
pub const META_PARTNER_ID: &str = "partner_id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Integer minor units (cents).
    pub amount_minor: i64,
    /// ISO 4217 code.
    pub currency: String,
    /// Rail-side account id of the recipient.
    pub destination: String,
    pub metadata: BTreeMap<String, String>,
}

impl TransferRequest {
    pub fn payout_id(&self) -> Option<&str> {
        self.metadata.get(META_PAYOUT_ID).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(pub String);

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RailError {
    /// Network failure or timeout; the transfer may or may not have landed.
    #[error("rail transport error: {0}")]
    Transport(String),
    /// The rail refused the transfer.
    #[error("rail rejected transfer: {code}: {message}")]
    Rejected { code: String, message: String },
    #[error("rail response decode error: {0}")]
    Decode(String),
    /// Missing destination, bad amount, missing credentials.
    #[error("rail configuration error: {0}")]
    Config(String),
}

#[async_trait]
pub trait PaymentRail: Send + Sync {
    fn rail_name(&self) -> &'static str;

    async fn submit_transfer(&self, req: TransferRequest) -> Result<TransferId, RailError>;
}

/// Shared request checks run by every rail before anything leaves the process.
pub(crate) fn check_request(req: &TransferRequest) -> Result<(), RailError> {
    if req.amount_minor <= 0 {
        return Err(RailError::Config(format!(
            "amount_minor must be > 0, got {}",
            req.amount_minor
        )));
    }
    if req.destination.trim().is_empty() {
        return Err(RailError::Config("destination account id is empty".into()));
    }
    if req.currency.len() != 3 || !req.currency.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(RailError::Config(format!("invalid currency code '{}'", req.currency)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(amount: i64, currency: &str, dest: &str) -> TransferRequest {
        TransferRequest {
            amount_minor: amount,
            currency: currency.into(),
            destination: dest.into(),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn request_checks() {
        assert!(check_request(&req(100, "USD", "acct_1")).is_ok());
        assert!(matches!(check_request(&req(0, "USD", "acct_1")), Err(RailError::Config(_))));
        assert!(matches!(check_request(&req(100, "usd", "acct_1")), Err(RailError::Config(_))));
        assert!(matches!(check_request(&req(100, "USD", "  ")), Err(RailError::Config(_))));
    }

    #[test]
    fn rejected_display_carries_code() {
        let e = RailError::Rejected {
            code: "insufficient_platform_balance".into(),
            message: "top up".into(),
        };
        assert_eq!(
            e.to_string(),
            "rail rejected transfer: insufficient_platform_balance: top up"
        );
    }
}
