//! Commission calculation.
//!
//! Pure functions over an offer's [`CommissionStructure`] and a booking
//! value. Percentages are written as percent (`10` = 10%); rates passed
//! around after evaluation are plain fractions (`0.10`). Every amount is
//! quantised half-up to minor units by [`Money`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};

use afl_schemas::{CommissionStructure, CommissionTier, Money, Offer, TierKind};

use crate::error::{EngineError, EngineResult};

/// Which part of the structure produced the amount.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "basis", rename_all = "snake_case")]
pub enum QuoteBasis {
    Percentage {
        percent: Decimal,
    },
    Fixed {
        amount: Money,
    },
    Tier {
        threshold: Decimal,
        kind: TierKind,
        value: Decimal,
        /// The booking was below every threshold and the lowest tier was
        /// used anyway.
        fallback: bool,
    },
}

/// Partner-level override replacing the structure rate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverrideAdjustment {
    pub override_rate: Decimal,
    pub structure_amount: Money,
    pub override_amount: Money,
    /// `override_amount - structure_amount`; may be negative.
    pub delta: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommissionQuote {
    pub amount: Money,
    /// `amount / booking_value`, six decimal places.
    pub effective_rate: Decimal,
    pub basis: QuoteBasis,
    pub override_adjustment: Option<OverrideAdjustment>,
}

impl CommissionQuote {
    pub fn tier_fallback(&self) -> bool {
        matches!(self.basis, QuoteBasis::Tier { fallback: true, .. })
    }

    /// Calculation details attached to the audit event of the earning it
    /// produced.
    pub fn audit_payload(&self) -> Value {
        json!({
            "amount": self.amount,
            "effective_rate": self.effective_rate,
            "basis": self.basis,
            "tier_fallback": self.tier_fallback(),
            "override": self.override_adjustment,
        })
    }
}

/// Reject structures the calculator could not evaluate sensibly.
pub fn check_structure(structure: &CommissionStructure) -> EngineResult<()> {
    match structure {
        CommissionStructure::Percentage { value } => check_percent(*value, "percentage value"),
        CommissionStructure::Fixed { value } => {
            if value.is_sign_negative() {
                return Err(EngineError::Validation(format!(
                    "fixed value must be >= 0, got {value}"
                )));
            }
            Ok(())
        }
        CommissionStructure::Tiered { tiers } => {
            if tiers.is_empty() {
                return Err(EngineError::Validation(
                    "tiered structure needs at least one tier".into(),
                ));
            }
            let mut thresholds: Vec<Decimal> = Vec::with_capacity(tiers.len());
            for t in tiers {
                if t.threshold.is_sign_negative() {
                    return Err(EngineError::Validation(format!(
                        "tier threshold must be >= 0, got {}",
                        t.threshold
                    )));
                }
                match t.kind {
                    TierKind::Percentage => check_percent(t.value, "tier percentage")?,
                    TierKind::Fixed if t.value.is_sign_negative() => {
                        return Err(EngineError::Validation(format!(
                            "tier fixed value must be >= 0, got {}",
                            t.value
                        )))
                    }
                    TierKind::Fixed => {}
                }
                if thresholds.contains(&t.threshold) {
                    return Err(EngineError::Validation(format!(
                        "duplicate tier threshold {}",
                        t.threshold
                    )));
                }
                thresholds.push(t.threshold);
            }
            Ok(())
        }
    }
}

fn check_percent(value: Decimal, what: &str) -> EngineResult<()> {
    if value.is_sign_negative() || value > Decimal::ONE_HUNDRED {
        return Err(EngineError::Validation(format!(
            "{what} must be within [0, 100], got {value}"
        )));
    }
    Ok(())
}

/// Highest threshold not above `booking_value`. When the booking is below
/// every threshold the lowest tier is returned with `fallback = true`.
pub fn select_tier(tiers: &[CommissionTier], booking_value: Decimal) -> Option<(&CommissionTier, bool)> {
    let eligible = tiers
        .iter()
        .filter(|t| t.threshold <= booking_value)
        .max_by(|a, b| a.threshold.cmp(&b.threshold));
    match eligible {
        Some(t) => Some((t, false)),
        None => tiers
            .iter()
            .min_by(|a, b| a.threshold.cmp(&b.threshold))
            .map(|t| (t, true)),
    }
}

fn percent_of(booking_value: Money, percent: Decimal) -> EngineResult<Money> {
    let rate = percent / Decimal::ONE_HUNDRED;
    booking_value
        .mul_rate(rate)
        .ok_or_else(|| EngineError::Validation(format!("commission overflow at {booking_value} x {rate}")))
}

/// Evaluate a structure against a booking value. No offer or partner state
/// is consulted.
pub fn evaluate_structure(
    structure: &CommissionStructure,
    booking_value: Money,
) -> EngineResult<(Money, QuoteBasis)> {
    check_structure(structure)?;
    match structure {
        CommissionStructure::Percentage { value } => Ok((
            percent_of(booking_value, *value)?,
            QuoteBasis::Percentage { percent: *value },
        )),
        CommissionStructure::Fixed { value } => {
            let amount = Money::from_decimal(*value);
            Ok((amount, QuoteBasis::Fixed { amount }))
        }
        CommissionStructure::Tiered { tiers } => {
            let (tier, fallback) = select_tier(tiers, booking_value.amount()).ok_or_else(|| {
                EngineError::Validation("tiered structure needs at least one tier".into())
            })?;
            let amount = match tier.kind {
                TierKind::Percentage => percent_of(booking_value, tier.value)?,
                TierKind::Fixed => Money::from_decimal(tier.value),
            };
            Ok((
                amount,
                QuoteBasis::Tier {
                    threshold: tier.threshold,
                    kind: tier.kind,
                    value: tier.value,
                    fallback,
                },
            ))
        }
    }
}

/// Stateless; holds no configuration today.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommissionCalculator;

impl CommissionCalculator {
    pub fn new() -> Self {
        Self
    }

    /// Quote the commission for one booking under `offer`.
    ///
    /// The offer must be active and `now` inside its validity window. A
    /// partner override (fraction in `[0, 1]`) replaces the structure rate;
    /// the difference is reported in `override_adjustment`.
    pub fn calculate(
        &self,
        booking_value: Money,
        offer: &Offer,
        rate_override: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> EngineResult<CommissionQuote> {
        if !booking_value.is_positive() {
            return Err(EngineError::Validation(format!(
                "booking value must be > 0, got {booking_value}"
            )));
        }
        if !offer.is_active {
            return Err(EngineError::OfferInactive(offer.id));
        }
        if !offer.is_within_validity(now) {
            return Err(EngineError::OfferExpired {
                offer_id: offer.id,
                at: now,
            });
        }

        let (structure_amount, basis) =
            evaluate_structure(&offer.commission_structure, booking_value)?;

        let (amount, override_adjustment) = match rate_override {
            None => (structure_amount, None),
            Some(rate) => {
                if rate.is_sign_negative() || rate > Decimal::ONE {
                    return Err(EngineError::Validation(format!(
                        "commission rate override must be within [0, 1], got {rate}"
                    )));
                }
                let override_amount = booking_value.mul_rate(rate).ok_or_else(|| {
                    EngineError::Validation(format!("commission overflow at {booking_value} x {rate}"))
                })?;
                (
                    override_amount,
                    Some(OverrideAdjustment {
                        override_rate: rate,
                        structure_amount,
                        override_amount,
                        delta: override_amount - structure_amount,
                    }),
                )
            }
        };

        let effective_rate = amount
            .ratio_to(booking_value)
            .map(|r| r.round_dp(6))
            .unwrap_or(Decimal::ZERO);

        Ok(CommissionQuote {
            amount,
            effective_rate,
            basis,
            override_adjustment,
        })
    }
}
