//! Earning ledger: records conversions, moves earnings through their
//! lifecycle, applies manual adjustments and reports per partner.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use afl_audit::AuditAction;
use afl_db::EarningFilter;
use afl_schemas::{Earning, EarningStatus, Money};

use crate::calculator::CommissionCalculator;
use crate::error::{EngineError, EngineResult};
use crate::{check_currency, check_positive, check_reason, note_line, EngineContext};

mod report;
pub mod transitions;

pub use report::{ConversionReport, StatusTotals};
pub(crate) use transitions::{status_changed_action, transition_earning};

/// A tracked booking reported against an affiliate link.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionDetails {
    pub link_id: Uuid,
    pub booking_value: Money,
    pub currency: String,
    pub booking_id: Option<String>,
    /// Defaults to the recording time.
    pub transaction_date: Option<DateTime<Utc>>,
}

pub struct EarningLedger {
    ctx: EngineContext,
    calculator: CommissionCalculator,
}

impl EarningLedger {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            calculator: CommissionCalculator::new(),
        }
    }

    /// Create a PENDING earning for a conversion.
    ///
    /// Resolves link -> offer -> partner, requires all three active, and
    /// prices the booking with the offer's current structure (or the
    /// partner's override).
    pub async fn record_conversion(
        &self,
        details: ConversionDetails,
        actor: &str,
    ) -> EngineResult<Earning> {
        check_positive(details.booking_value, "booking value")?;
        check_currency(&details.currency)?;
        let now = self.ctx.now();

        let mut uow = self.ctx.begin().await?;
        let link = uow
            .link(details.link_id)
            .await?
            .ok_or(EngineError::LinkNotFound(details.link_id))?;
        if !link.is_active {
            return Err(EngineError::Validation(format!(
                "affiliate link {} is inactive",
                link.id
            )));
        }
        let offer = uow
            .offer(link.offer_id)
            .await?
            .ok_or(EngineError::OfferNotFound(link.offer_id))?;
        let partner = uow
            .partner(link.partner_id)
            .await?
            .ok_or(EngineError::PartnerNotFound(link.partner_id))?;
        if !partner.is_active {
            return Err(EngineError::PartnerInactive(partner.id));
        }

        let quote = self.calculator.calculate(
            details.booking_value,
            &offer,
            partner.commission_rate_override,
            now,
        )?;

        let mut earning = Earning {
            id: Uuid::new_v4(),
            partner_id: partner.id,
            offer_id: offer.id,
            link_id: Some(link.id),
            booking_id: details.booking_id,
            booking_value: details.booking_value,
            amount_earned: quote.amount,
            currency: details.currency,
            status: EarningStatus::Pending,
            notes: Vec::new(),
            transaction_date: details.transaction_date.unwrap_or(now),
            split_from: None,
            created_at: now,
            updated_at: now,
        };
        earning.push_note(note_line(
            now,
            actor,
            &format!(
                "recorded {} {} on booking value {} via {} offer",
                earning.amount_earned,
                earning.currency,
                earning.booking_value,
                offer.commission_structure.kind_str()
            ),
        ));
        uow.insert_earning(&earning).await?;

        self.ctx
            .record(AuditAction::new(
                now,
                actor,
                "earning",
                earning.id,
                "EARNING_CREATED",
                json!({
                    "partner_id": earning.partner_id,
                    "offer_id": earning.offer_id,
                    "link_id": link.id,
                    "booking_id": earning.booking_id,
                    "booking_value": earning.booking_value,
                    "currency": earning.currency,
                    "structure": offer.commission_structure,
                    "quote": quote.audit_payload(),
                }),
            ))
            .await?;
        if let Some(adj) = &quote.override_adjustment {
            self.ctx
                .record(AuditAction::new(
                    now,
                    actor,
                    "earning",
                    earning.id,
                    "COMMISSION_OVERRIDE_APPLIED",
                    json!(adj),
                ))
                .await?;
        }
        uow.commit().await?;

        info!(
            earning_id = %earning.id,
            partner_id = %earning.partner_id,
            amount = %earning.amount_earned,
            currency = %earning.currency,
            tier_fallback = quote.tier_fallback(),
            "conversion recorded"
        );
        Ok(earning)
    }

    /// Move one earning to `to`. The edge must exist in the lifecycle table.
    pub async fn update_status(
        &self,
        earning_id: Uuid,
        to: EarningStatus,
        reason: &str,
        actor: &str,
    ) -> EngineResult<Earning> {
        check_reason(reason)?;
        let now = self.ctx.now();

        let mut uow = self.ctx.begin().await?;
        let mut earning = uow
            .earning(earning_id)
            .await?
            .ok_or(EngineError::EarningNotFound(earning_id))?;
        let from = transition_earning(&mut earning, to, actor, reason, now)?;
        uow.save_earning(&earning).await?;
        self.ctx
            .record(status_changed_action(
                now,
                actor,
                &earning,
                from,
                reason,
                json!({}),
            ))
            .await?;
        uow.commit().await?;

        info!(
            earning_id = %earning.id,
            from = from.as_str(),
            to = to.as_str(),
            "earning status changed"
        );
        Ok(earning)
    }

    /// Add `delta` (may be negative) to an earning that has not been paid or
    /// cancelled. The result may not go below zero.
    pub async fn apply_adjustment(
        &self,
        earning_id: Uuid,
        delta: Money,
        reason: &str,
        actor: &str,
    ) -> EngineResult<Earning> {
        check_reason(reason)?;
        if delta.is_zero() {
            return Err(EngineError::Validation("adjustment delta must be non-zero".into()));
        }
        let now = self.ctx.now();

        let mut uow = self.ctx.begin().await?;
        let mut earning = uow
            .earning(earning_id)
            .await?
            .ok_or(EngineError::EarningNotFound(earning_id))?;
        if !earning.status.is_payable() {
            return Err(EngineError::NotAdjustable {
                id: earning.id,
                status: earning.status.as_str(),
            });
        }
        let before = earning.amount_earned;
        let after = before
            .checked_add(delta)
            .ok_or_else(|| EngineError::Validation("adjustment overflow".into()))?;
        if after.is_negative() {
            return Err(EngineError::Validation(format!(
                "adjustment {delta} would take earning {} below zero ({before})",
                earning.id
            )));
        }

        earning.amount_earned = after;
        earning.updated_at = now;
        earning.push_note(note_line(
            now,
            actor,
            &format!("adjusted {before} -> {after} ({delta}): {reason}"),
        ));
        uow.save_earning(&earning).await?;
        self.ctx
            .record(AuditAction::new(
                now,
                actor,
                "earning",
                earning.id,
                "EARNING_ADJUSTED",
                json!({
                    "partner_id": earning.partner_id,
                    "before": before,
                    "delta": delta,
                    "after": after,
                    "currency": earning.currency,
                    "reason": reason,
                }),
            ))
            .await?;
        uow.commit().await?;

        info!(earning_id = %earning.id, %before, %after, "earning adjusted");
        Ok(earning)
    }

    /// Filtered earnings of one partner plus per-currency status totals.
    pub async fn get_conversion_report(
        &self,
        partner_id: Uuid,
        filter: EarningFilter,
    ) -> EngineResult<ConversionReport> {
        if let Some(c) = &filter.currency {
            check_currency(c)?;
        }
        if let (Some(from), Some(to)) = (filter.from, filter.to) {
            if from >= to {
                return Err(EngineError::Validation(format!(
                    "report window is empty: {from} >= {to}"
                )));
            }
        }

        let mut uow = self.ctx.begin().await?;
        if uow.partner(partner_id).await?.is_none() {
            return Err(EngineError::PartnerNotFound(partner_id));
        }
        let earnings = uow.partner_earnings(partner_id, &filter).await?;
        uow.rollback().await?;

        Ok(ConversionReport::build(partner_id, earnings))
    }
}
