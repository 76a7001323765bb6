//! afl-schemas
//!
//! Domain records shared by every crate in the workspace: partners, links,
//! offers, earnings, settlement batches, payouts and invoices, plus the
//! [`Money`] fixed-point type. Pure data; no IO.
//!
//! Status enums carry `as_str` / `parse` so the persistence layer can store
//! them as upper-case text without a serde round-trip. Transition rules live
//! with the engine, not here.

mod money;

pub use money::{Money, MONEY_SCALE};

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Partner
// ---------------------------------------------------------------------------

/// Business category of a partner. Each category has a fixed allowed
/// commission-rate range (see the engine's compliance table).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartnerCategory {
    Accommodation,
    TourOperator,
    Restaurant,
    Transportation,
    ECommerce,
}

impl PartnerCategory {
    pub const ALL: [PartnerCategory; 5] = [
        PartnerCategory::Accommodation,
        PartnerCategory::TourOperator,
        PartnerCategory::Restaurant,
        PartnerCategory::Transportation,
        PartnerCategory::ECommerce,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PartnerCategory::Accommodation => "ACCOMMODATION",
            PartnerCategory::TourOperator => "TOUR_OPERATOR",
            PartnerCategory::Restaurant => "RESTAURANT",
            PartnerCategory::Transportation => "TRANSPORTATION",
            PartnerCategory::ECommerce => "E_COMMERCE",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| anyhow!("invalid partner category: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partner {
    pub id: Uuid,
    pub name: String,
    pub category: PartnerCategory,
    /// Replaces the offer's structure-based rate when present. Fraction in `[0,1]`.
    pub commission_rate_override: Option<Decimal>,
    pub is_active: bool,
    /// Free-form contact data. The payment-rail account id lives here by
    /// convention, under a configurable key.
    pub contact_metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl Partner {
    /// Read a string value from the contact metadata.
    pub fn contact_str(&self, key: &str) -> Option<&str> {
        self.contact_metadata
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }
}

// ---------------------------------------------------------------------------
// AffiliateLink
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffiliateLink {
    pub id: Uuid,
    pub partner_id: Uuid,
    pub offer_id: Uuid,
    pub tracking_code: String,
    pub is_active: bool,
}

// ---------------------------------------------------------------------------
// Offer + commission structure
// ---------------------------------------------------------------------------

/// How a tier's `value` is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    /// `value` is a percentage (10 = 10%).
    Percentage,
    /// `value` is a flat currency amount.
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionTier {
    /// Minimum booking value (inclusive) at which this tier applies.
    pub threshold: Decimal,
    pub kind: TierKind,
    pub value: Decimal,
}

/// Commission structure attached to an offer. Stored as tagged JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommissionStructure {
    /// `value` is a percentage of the booking value (10 = 10%).
    Percentage { value: Decimal },
    /// `value` is a flat amount per conversion.
    Fixed { value: Decimal },
    /// Rate bracket selected by booking value.
    Tiered { tiers: Vec<CommissionTier> },
}

impl CommissionStructure {
    pub fn kind_str(&self) -> &'static str {
        match self {
            CommissionStructure::Percentage { .. } => "percentage",
            CommissionStructure::Fixed { .. } => "fixed",
            CommissionStructure::Tiered { .. } => "tiered",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: Uuid,
    pub partner_id: Uuid,
    pub name: String,
    pub commission_structure: CommissionStructure,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Offer {
    /// `true` when `now` lies inside `[valid_from, valid_to]`.
    pub fn is_within_validity(&self, now: DateTime<Utc>) -> bool {
        self.valid_from <= now && now <= self.valid_to
    }
}

// ---------------------------------------------------------------------------
// Earning
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EarningStatus {
    Pending,
    Confirmed,
    Paid,
    Cancelled,
}

impl EarningStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EarningStatus::Pending => "PENDING",
            EarningStatus::Confirmed => "CONFIRMED",
            EarningStatus::Paid => "PAID",
            EarningStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(EarningStatus::Pending),
            "CONFIRMED" => Ok(EarningStatus::Confirmed),
            "PAID" => Ok(EarningStatus::Paid),
            "CANCELLED" => Ok(EarningStatus::Cancelled),
            other => Err(anyhow!("invalid earning status: {}", other)),
        }
    }

    /// Statuses whose amounts count toward a partner's payable balance.
    pub fn is_payable(&self) -> bool {
        matches!(self, EarningStatus::Pending | EarningStatus::Confirmed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Earning {
    pub id: Uuid,
    pub partner_id: Uuid,
    pub offer_id: Uuid,
    pub link_id: Option<Uuid>,
    pub booking_id: Option<String>,
    /// Booking value the commission was computed from. Kept so settlement can
    /// re-run the calculation against current offer state.
    pub booking_value: Money,
    pub amount_earned: Money,
    pub currency: String,
    pub status: EarningStatus,
    /// Append-only, one timestamped line per change.
    pub notes: Vec<String>,
    pub transaction_date: DateTime<Utc>,
    /// Set on the remainder row created when a payout splits an earning.
    pub split_from: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Earning {
    pub fn push_note(&mut self, line: String) {
        self.notes.push(line);
    }
}

// ---------------------------------------------------------------------------
// CommissionBatch
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Processing => "PROCESSING",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PROCESSING" => Ok(BatchStatus::Processing),
            "COMPLETED" => Ok(BatchStatus::Completed),
            "FAILED" => Ok(BatchStatus::Failed),
            other => Err(anyhow!("invalid batch status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionBatch {
    pub id: Uuid,
    pub batch_date: NaiveDate,
    pub total_commissions: Money,
    pub processed_count: i64,
    pub skipped_count: i64,
    pub status: BatchStatus,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Payout
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Paid,
    Failed,
    Cancelled,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "PENDING",
            PayoutStatus::Processing => "PROCESSING",
            PayoutStatus::Paid => "PAID",
            PayoutStatus::Failed => "FAILED",
            PayoutStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(PayoutStatus::Pending),
            "PROCESSING" => Ok(PayoutStatus::Processing),
            "PAID" => Ok(PayoutStatus::Paid),
            "FAILED" => Ok(PayoutStatus::Failed),
            "CANCELLED" => Ok(PayoutStatus::Cancelled),
            other => Err(anyhow!("invalid payout status: {}", other)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PayoutStatus::Paid | PayoutStatus::Failed | PayoutStatus::Cancelled
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    BankTransfer,
    WireTransfer,
    Ach,
    Paypal,
    Wallet,
}

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 5] = [
        PaymentMethod::BankTransfer,
        PaymentMethod::WireTransfer,
        PaymentMethod::Ach,
        PaymentMethod::Paypal,
        PaymentMethod::Wallet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::WireTransfer => "wire_transfer",
            PaymentMethod::Ach => "ach",
            PaymentMethod::Paypal => "paypal",
            PaymentMethod::Wallet => "wallet",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| anyhow!("invalid payment method: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payout {
    pub id: Uuid,
    pub partner_id: Uuid,
    pub amount: Money,
    pub currency: String,
    pub status: PayoutStatus,
    pub payment_method: PaymentMethod,
    pub invoice_id: Option<Uuid>,
    pub transaction_id: Option<String>,
    pub failure_reason: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub payout_date: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Invoice
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Issued,
    Paid,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Issued => "ISSUED",
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::Void => "VOID",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "ISSUED" => Ok(InvoiceStatus::Issued),
            "PAID" => Ok(InvoiceStatus::Paid),
            "VOID" => Ok(InvoiceStatus::Void),
            other => Err(anyhow!("invalid invoice status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceLineItem {
    pub earning_id: Uuid,
    pub description: String,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub partner_id: Uuid,
    pub payout_id: Uuid,
    /// `INV-YYYYMM-NNNN`, sequential within a calendar month.
    pub invoice_number: String,
    pub line_items: Vec<InvoiceLineItem>,
    pub amount_due: Money,
    pub currency: String,
    pub status: InvoiceStatus,
    pub issued_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn status_strings_roundtrip() {
        for s in [
            EarningStatus::Pending,
            EarningStatus::Confirmed,
            EarningStatus::Paid,
            EarningStatus::Cancelled,
        ] {
            assert_eq!(EarningStatus::parse(s.as_str()).unwrap(), s);
        }
        for s in [
            PayoutStatus::Pending,
            PayoutStatus::Processing,
            PayoutStatus::Paid,
            PayoutStatus::Failed,
            PayoutStatus::Cancelled,
        ] {
            assert_eq!(PayoutStatus::parse(s.as_str()).unwrap(), s);
        }
        for c in PartnerCategory::ALL {
            assert_eq!(PartnerCategory::parse(c.as_str()).unwrap(), c);
        }
        assert!(EarningStatus::parse("pending").is_err());
    }

    #[test]
    fn commission_structure_tagged_json() {
        let s: CommissionStructure = serde_json::from_value(json!({
            "type": "tiered",
            "tiers": [
                {"threshold": "0", "kind": "percentage", "value": "5"},
                {"threshold": "500", "kind": "fixed", "value": "40"}
            ]
        }))
        .unwrap();
        match &s {
            CommissionStructure::Tiered { tiers } => {
                assert_eq!(tiers.len(), 2);
                assert_eq!(tiers[1].kind, TierKind::Fixed);
                assert_eq!(tiers[1].threshold, dec!(500));
            }
            other => panic!("unexpected structure {other:?}"),
        }
        assert_eq!(s.kind_str(), "tiered");
    }

    #[test]
    fn unknown_structure_tag_fails_to_decode() {
        let r = serde_json::from_value::<CommissionStructure>(json!({"type": "revenue_share", "value": "3"}));
        assert!(r.is_err());
    }

    #[test]
    fn contact_str_ignores_blank_values() {
        let p = Partner {
            id: Uuid::new_v4(),
            name: "p".into(),
            category: PartnerCategory::Restaurant,
            commission_rate_override: None,
            is_active: true,
            contact_metadata: json!({"payment_account_id": "  ", "email": "a@b.c"}),
            created_at: Utc::now(),
        };
        assert_eq!(p.contact_str("payment_account_id"), None);
        assert_eq!(p.contact_str("email"), Some("a@b.c"));
        assert_eq!(p.contact_str("missing"), None);
    }
}
