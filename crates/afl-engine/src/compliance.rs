//! Category rate limits.
//!
//! | category        | min  | max  |
//! |-----------------|------|------|
//! | accommodation   | 10%  | 15%  |
//! | tour operator   | 15%  | 20%  |
//! | restaurant      | 10%  | 10%  |
//! | transportation  |  8%  | 12%  |
//! | e-commerce      |  8%  | 12%  |
//!
//! Rates above 1 are read as percent and divided by 100, so `12` and `0.12`
//! are the same rate. Only percentage rates are checked; fixed amounts have
//! no rate to compare.

use rust_decimal::Decimal;

use afl_schemas::{CommissionStructure, PartnerCategory, TierKind};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRange {
    pub min: Decimal,
    pub max: Decimal,
}

impl RateRange {
    fn percent(min: i64, max: i64) -> Self {
        Self {
            min: Decimal::new(min, 2),
            max: Decimal::new(max, 2),
        }
    }

    pub fn contains(&self, rate: Decimal) -> bool {
        self.min <= rate && rate <= self.max
    }
}

pub fn range_for(category: PartnerCategory) -> RateRange {
    match category {
        PartnerCategory::Accommodation => RateRange::percent(10, 15),
        PartnerCategory::TourOperator => RateRange::percent(15, 20),
        PartnerCategory::Restaurant => RateRange::percent(10, 10),
        PartnerCategory::Transportation => RateRange::percent(8, 12),
        PartnerCategory::ECommerce => RateRange::percent(8, 12),
    }
}

pub fn normalize_rate(rate: Decimal) -> Decimal {
    if rate > Decimal::ONE {
        rate / Decimal::ONE_HUNDRED
    } else {
        rate
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ComplianceValidator;

impl ComplianceValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate_rate(&self, category: PartnerCategory, rate: Decimal) -> EngineResult<()> {
        let range = range_for(category);
        let normalized = normalize_rate(rate);
        if range.contains(normalized) {
            Ok(())
        } else {
            Err(EngineError::Compliance {
                category: category.as_str(),
                rate: normalized,
                min: range.min,
                max: range.max,
            })
        }
    }

    /// Check every percentage rate a structure can produce.
    pub fn validate_structure(
        &self,
        category: PartnerCategory,
        structure: &CommissionStructure,
    ) -> EngineResult<()> {
        match structure {
            CommissionStructure::Percentage { value } => self.validate_rate(category, *value),
            CommissionStructure::Fixed { .. } => Ok(()),
            CommissionStructure::Tiered { tiers } => tiers
                .iter()
                .filter(|t| t.kind == TierKind::Percentage)
                .try_for_each(|t| self.validate_rate(category, t.value)),
        }
    }
}
