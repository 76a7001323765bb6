use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use afl_schemas::{Earning, EarningStatus, Money};

/// Sums per status for one currency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatusTotals {
    pub pending: Money,
    pub confirmed: Money,
    pub paid: Money,
    pub cancelled: Money,
    pub count: usize,
}

impl Default for StatusTotals {
    fn default() -> Self {
        Self {
            pending: Money::ZERO,
            confirmed: Money::ZERO,
            paid: Money::ZERO,
            cancelled: Money::ZERO,
            count: 0,
        }
    }
}

impl StatusTotals {
    fn add(&mut self, e: &Earning) {
        let slot = match e.status {
            EarningStatus::Pending => &mut self.pending,
            EarningStatus::Confirmed => &mut self.confirmed,
            EarningStatus::Paid => &mut self.paid,
            EarningStatus::Cancelled => &mut self.cancelled,
        };
        *slot += e.amount_earned;
        self.count += 1;
    }

    /// What a payout request could draw on right now.
    pub fn payable(&self) -> Money {
        self.pending + self.confirmed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionReport {
    pub partner_id: Uuid,
    /// Oldest first.
    pub earnings: Vec<Earning>,
    /// Keyed by currency code.
    pub totals: BTreeMap<String, StatusTotals>,
}

impl ConversionReport {
    pub(crate) fn build(partner_id: Uuid, earnings: Vec<Earning>) -> Self {
        let mut totals: BTreeMap<String, StatusTotals> = BTreeMap::new();
        for e in &earnings {
            totals.entry(e.currency.clone()).or_default().add(e);
        }
        Self {
            partner_id,
            earnings,
            totals,
        }
    }
}
