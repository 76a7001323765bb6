use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use uuid::Uuid;

use afl_schemas::{Earning, EarningStatus, Money, Partner, PartnerCategory};

use crate::contact_with_account;

pub struct PartnerSeed {
    category: PartnerCategory,
    rate_override: Option<Decimal>,
    is_active: bool,
    contact: Value,
}

impl PartnerSeed {
    pub fn new(category: PartnerCategory) -> Self {
        Self {
            category,
            rate_override: None,
            is_active: true,
            contact: contact_with_account(&format!("acct_{}", Uuid::new_v4().simple())),
        }
    }

    pub fn rate_override(mut self, rate: Option<Decimal>) -> Self {
        self.rate_override = rate;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    pub fn contact(mut self, contact: Value) -> Self {
        self.contact = contact;
        self
    }

    pub(crate) fn build(self, now: DateTime<Utc>) -> Partner {
        Partner {
            id: Uuid::new_v4(),
            name: format!("{} partner", self.category.as_str().to_lowercase()),
            category: self.category,
            commission_rate_override: self.rate_override,
            is_active: self.is_active,
            contact_metadata: self.contact,
            created_at: now,
        }
    }
}

/// Earning inserted straight into the store. The booking value defaults to
/// ten times the amount, matching a 10% offer.
pub struct EarningSeed {
    partner_id: Uuid,
    offer_id: Uuid,
    amount: Money,
    booking_value: Option<Money>,
    currency: String,
    status: EarningStatus,
    at: Option<DateTime<Utc>>,
}

impl EarningSeed {
    pub fn new(partner_id: Uuid, offer_id: Uuid, amount: Money) -> Self {
        Self {
            partner_id,
            offer_id,
            amount,
            booking_value: None,
            currency: "USD".to_string(),
            status: EarningStatus::Pending,
            at: None,
        }
    }

    pub fn status(mut self, status: EarningStatus) -> Self {
        self.status = status;
        self
    }

    pub fn currency(mut self, currency: &str) -> Self {
        self.currency = currency.to_string();
        self
    }

    pub fn booking_value(mut self, value: Money) -> Self {
        self.booking_value = Some(value);
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(at);
        self
    }

    pub(crate) fn build(self, now: DateTime<Utc>) -> Earning {
        let at = self.at.unwrap_or(now - Duration::days(1));
        let booking_value = self
            .booking_value
            .unwrap_or_else(|| Money::from_decimal(self.amount.amount() * Decimal::TEN));
        Earning {
            id: Uuid::new_v4(),
            partner_id: self.partner_id,
            offer_id: self.offer_id,
            link_id: None,
            booking_id: Some(format!("bk-{}", Uuid::new_v4().simple())),
            booking_value,
            amount_earned: self.amount,
            currency: self.currency,
            status: self.status,
            notes: Vec::new(),
            transaction_date: at,
            split_from: None,
            created_at: at,
            updated_at: at,
        }
    }
}
