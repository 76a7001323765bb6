//! Payout requests, settlement through the payment rail, cancellation, and
//! the marking of earnings as paid.
//!
//! Settling a payout takes three units of work with the rail call in the
//! middle, outside any of them:
//!
//! 1. PENDING -> PROCESSING (claims the payout),
//! 2. rail `submit_transfer`,
//! 3. PROCESSING -> PAID plus earning allocation, or PROCESSING -> FAILED.
//!
//! A crash between 1 and 3 leaves the payout PROCESSING; stale-job recovery
//! fails it for manual reconciliation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use afl_audit::AuditAction;
use afl_config::EngineConfig;
use afl_db::UnitOfWork;
use afl_rail::{PaymentRail, TransferId, TransferRequest, META_PARTNER_ID, META_PAYOUT_ID};
use afl_schemas::{
    Earning, EarningStatus, Invoice, InvoiceStatus, Money, PaymentMethod, Payout, PayoutStatus,
};

use crate::error::{EngineError, EngineResult};
use crate::ledger::{status_changed_action, transition_earning};
use crate::{check_currency, check_positive, check_reason, note_line, EngineContext, Trigger};

pub mod invoice;
pub mod split;
pub mod transitions;

pub use split::{plan_split, PlannedSplit, SplitPlan};
pub use transitions::payout_transition_allowed;
use transitions::transition_payout;

pub const SWEEP_LOCK: &str = "payout-sweep";
const SWEEP_ACTOR: &str = "system:payout-sweep";

pub fn payout_lock_key(payout_id: Uuid) -> String {
    format!("payout:{payout_id}")
}

#[derive(Debug, Clone, PartialEq)]
pub struct PayoutPolicy {
    pub minimum_amount: Money,
    /// Methods that get an invoice at request time.
    pub invoice_methods: Vec<PaymentMethod>,
    /// Key in the partner's contact metadata holding the rail account id.
    pub account_id_key: String,
}

impl PayoutPolicy {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            minimum_amount: cfg.payouts.minimum_amount,
            invoice_methods: cfg.payouts.invoice_methods.clone(),
            account_id_key: cfg.payments.account_id_key.clone(),
        }
    }

    pub fn requires_invoice(&self, method: PaymentMethod) -> bool {
        self.invoice_methods.contains(&method)
    }
}

impl Default for PayoutPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PayoutRequest {
    pub partner_id: Uuid,
    pub amount: Money,
    pub currency: String,
    pub method: PaymentMethod,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayoutReceipt {
    pub payout: Payout,
    pub invoice: Option<Invoice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SplitRecord {
    pub original_id: Uuid,
    pub remainder_id: Uuid,
    pub paid_portion: Money,
    pub remainder: Money,
}

/// What marking earnings as paid did.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SplitOutcome {
    /// Earnings now PAID, including a split original.
    pub paid: Vec<Uuid>,
    pub split: Option<SplitRecord>,
    pub unapplied: Option<Money>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SweepReport {
    pub paid: Vec<Uuid>,
    pub failed: Vec<Uuid>,
    /// Payouts left untouched because of an error (e.g. lock held).
    pub errors: BTreeMap<Uuid, String>,
}

pub struct PayoutEngine {
    ctx: EngineContext,
    rail: Arc<dyn PaymentRail>,
    policy: PayoutPolicy,
}

impl PayoutEngine {
    pub fn new(ctx: EngineContext, rail: Arc<dyn PaymentRail>, policy: PayoutPolicy) -> Self {
        Self { ctx, rail, policy }
    }

    pub fn policy(&self) -> &PayoutPolicy {
        &self.policy
    }

    /// Create a PENDING payout, plus an invoice for bank-style methods.
    ///
    /// The balance is the sum of the partner's PENDING and CONFIRMED
    /// earnings in the requested currency.
    pub async fn request_payout(&self, req: PayoutRequest, actor: &str) -> EngineResult<PayoutReceipt> {
        check_positive(req.amount, "payout amount")?;
        check_currency(&req.currency)?;
        let now = self.ctx.now();

        let mut uow = self.ctx.begin().await?;
        let partner = match uow.partner(req.partner_id).await? {
            Some(p) if p.is_active => p,
            _ => return Err(EngineError::PartnerNotFound(req.partner_id)),
        };
        let payable = uow.payable_earnings(partner.id, &req.currency).await?;
        let available: Money = payable.iter().map(|e| e.amount_earned).sum();
        if req.amount > available {
            return Err(EngineError::InsufficientFunds {
                requested: req.amount,
                available,
                currency: req.currency,
            });
        }
        if req.amount < self.policy.minimum_amount {
            return Err(EngineError::BelowMinimum {
                requested: req.amount,
                minimum: self.policy.minimum_amount,
            });
        }

        let mut payout = Payout {
            id: Uuid::new_v4(),
            partner_id: partner.id,
            amount: req.amount,
            currency: req.currency,
            status: PayoutStatus::Pending,
            payment_method: req.method,
            invoice_id: None,
            transaction_id: None,
            failure_reason: None,
            requested_at: now,
            processed_at: None,
            payout_date: None,
        };
        uow.insert_payout(&payout).await?;

        let invoice = if self.policy.requires_invoice(payout.payment_method) {
            let inv = invoice::issue_invoice(uow.as_mut(), &payout, &payable, now).await?;
            payout.invoice_id = Some(inv.id);
            uow.save_payout(&payout).await?;
            Some(inv)
        } else {
            None
        };

        self.ctx
            .record(AuditAction::new(
                now,
                actor,
                "payout",
                payout.id,
                "PAYOUT_REQUESTED",
                json!({
                    "partner_id": payout.partner_id,
                    "amount": payout.amount,
                    "currency": payout.currency,
                    "method": payout.payment_method.as_str(),
                    "available": available,
                    "invoice_id": payout.invoice_id,
                }),
            ))
            .await?;
        if let Some(inv) = &invoice {
            self.ctx
                .record(AuditAction::new(
                    now,
                    actor,
                    "invoice",
                    inv.id,
                    "INVOICE_ISSUED",
                    json!({
                        "invoice_number": inv.invoice_number,
                        "payout_id": inv.payout_id,
                        "amount_due": inv.amount_due,
                        "line_items": inv.line_items.len(),
                    }),
                ))
                .await?;
        }
        uow.commit().await?;

        info!(
            payout_id = %payout.id,
            partner_id = %payout.partner_id,
            amount = %payout.amount,
            currency = %payout.currency,
            invoice = invoice.as_ref().map(|i| i.invoice_number.as_str()),
            "payout requested"
        );
        Ok(PayoutReceipt { payout, invoice })
    }

    /// Settle every PENDING payout, oldest first.
    pub async fn settle_pending_payouts(&self, trigger: Trigger) -> EngineResult<SweepReport> {
        match (self.sweep_exclusive(trigger).await, trigger) {
            (Err(err), Trigger::Scheduled) => {
                error!(error = %err, kind = err.kind().as_str(), "scheduled payout sweep failed");
                Ok(SweepReport::default())
            }
            (outcome, _) => outcome,
        }
    }

    async fn sweep_exclusive(&self, trigger: Trigger) -> EngineResult<SweepReport> {
        if !self.ctx.try_lock(SWEEP_LOCK).await? {
            return match trigger {
                Trigger::Manual => Err(EngineError::JobAlreadyRunning(SWEEP_LOCK.to_string())),
                Trigger::Scheduled => {
                    info!("payout sweep already running; skipping scheduled run");
                    Ok(SweepReport::default())
                }
            };
        }
        let outcome = self.sweep_locked().await;
        self.ctx.unlock(SWEEP_LOCK).await;
        outcome
    }

    async fn sweep_locked(&self) -> EngineResult<SweepReport> {
        let mut uow = self.ctx.begin().await?;
        let pending = uow.pending_payouts().await?;
        uow.rollback().await?;

        let mut report = SweepReport::default();
        for payout in pending {
            match self.settle_payout(payout.id, SWEEP_ACTOR).await {
                Ok(p) if p.status == PayoutStatus::Paid => report.paid.push(p.id),
                Ok(p) => report.failed.push(p.id),
                Err(err) => {
                    warn!(payout_id = %payout.id, error = %err, "payout not settled");
                    report.errors.insert(payout.id, err.to_string());
                }
            }
        }
        info!(
            paid = report.paid.len(),
            failed = report.failed.len(),
            errors = report.errors.len(),
            "payout sweep finished"
        );
        Ok(report)
    }

    /// Settle one PENDING payout. A rail refusal is not an error here: the
    /// payout comes back FAILED with the reason recorded.
    pub async fn settle_payout(&self, payout_id: Uuid, actor: &str) -> EngineResult<Payout> {
        let key = payout_lock_key(payout_id);
        if !self.ctx.try_lock(&key).await? {
            return Err(EngineError::JobAlreadyRunning(key));
        }
        let outcome = self.settle_locked(payout_id, actor).await;
        self.ctx.unlock(&key).await;
        outcome
    }

    async fn settle_locked(&self, payout_id: Uuid, actor: &str) -> EngineResult<Payout> {
        let now = self.ctx.now();
        let mut uow = self.ctx.begin().await?;
        let mut payout = uow
            .payout(payout_id)
            .await?
            .ok_or(EngineError::PayoutNotFound(payout_id))?;
        transition_payout(&mut payout, PayoutStatus::Processing)?;
        payout.processed_at = Some(now);
        let partner = uow.partner(payout.partner_id).await?;
        let payable: Money = uow
            .payable_earnings(payout.partner_id, &payout.currency)
            .await?
            .iter()
            .map(|e| e.amount_earned)
            .sum();
        uow.save_payout(&payout).await?;
        self.ctx
            .record(AuditAction::new(
                now,
                actor,
                "payout",
                payout.id,
                "PAYOUT_PROCESSING",
                json!({"rail": self.rail.rail_name(), "amount": payout.amount, "currency": payout.currency}),
            ))
            .await?;
        uow.commit().await?;

        let key = &self.policy.account_id_key;
        let destination = partner
            .as_ref()
            .and_then(|p| p.contact_str(key))
            .map(str::to_string);
        let amount_minor = payout.amount.to_minor_units();
        let precondition = match (&destination, amount_minor) {
            (None, _) => Some(format!("partner has no '{key}' in contact metadata")),
            (_, None) => Some(format!("amount {} does not fit minor units", payout.amount)),
            _ if payable < payout.amount => Some(format!(
                "payable earnings {payable} no longer cover payout amount {}",
                payout.amount
            )),
            _ => None,
        };
        if let Some(reason) = precondition {
            warn!(payout_id = %payout.id, %reason, "payout cannot be sent");
            return self.fail_payout(payout.id, &reason, json!({}), actor).await;
        }

        let mut metadata = BTreeMap::new();
        metadata.insert(META_PAYOUT_ID.to_string(), payout.id.to_string());
        metadata.insert(META_PARTNER_ID.to_string(), payout.partner_id.to_string());
        let request = TransferRequest {
            amount_minor: amount_minor.unwrap_or_default(),
            currency: payout.currency.clone(),
            destination: destination.unwrap_or_default(),
            metadata,
        };

        match self.rail.submit_transfer(request).await {
            Ok(transfer) => self
                .complete_payout(payout.id, &transfer, actor)
                .await
                .map_err(|err| {
                    error!(
                        payout_id = %payout.id,
                        transfer_id = %transfer,
                        error = %err,
                        "transfer sent but payout not recorded; reconcile with the rail"
                    );
                    err
                }),
            Err(rail_err) => {
                warn!(payout_id = %payout.id, error = %rail_err, "rail refused payout");
                self.fail_payout(
                    payout.id,
                    &rail_err.to_string(),
                    json!({"rail": self.rail.rail_name(), "rail_error": format!("{rail_err:?}")}),
                    actor,
                )
                .await
            }
        }
    }

    async fn complete_payout(
        &self,
        payout_id: Uuid,
        transfer: &TransferId,
        actor: &str,
    ) -> EngineResult<Payout> {
        let now = self.ctx.now();
        let mut uow = self.ctx.begin().await?;
        let mut payout = uow
            .payout(payout_id)
            .await?
            .ok_or(EngineError::PayoutNotFound(payout_id))?;
        transition_payout(&mut payout, PayoutStatus::Paid)?;
        payout.transaction_id = Some(transfer.0.clone());
        payout.payout_date = Some(now);
        uow.save_payout(&payout).await?;

        let outcome = self
            .apply_payment(
                uow.as_mut(),
                payout.partner_id,
                &payout.currency,
                payout.amount,
                payout.id,
                actor,
                now,
            )
            .await?;
        if let Some(short) = outcome.unapplied {
            warn!(payout_id = %payout.id, unapplied = %short, "payout exceeded payable earnings");
        }

        if let Some(invoice_id) = payout.invoice_id {
            if let Some(mut inv) = uow.invoice(invoice_id).await? {
                if inv.status == InvoiceStatus::Issued {
                    inv.status = InvoiceStatus::Paid;
                    uow.save_invoice(&inv).await?;
                    self.ctx
                        .record(AuditAction::new(
                            now,
                            actor,
                            "invoice",
                            inv.id,
                            "INVOICE_PAID",
                            json!({"invoice_number": inv.invoice_number, "payout_id": payout.id}),
                        ))
                        .await?;
                }
            }
        }

        self.ctx
            .record(AuditAction::new(
                now,
                actor,
                "payout",
                payout.id,
                "PAYOUT_PAID",
                json!({
                    "transaction_id": transfer.0,
                    "amount": payout.amount,
                    "currency": payout.currency,
                    "allocation": outcome,
                }),
            ))
            .await?;
        uow.commit().await?;

        info!(payout_id = %payout.id, transfer_id = %transfer, "payout paid");
        Ok(payout)
    }

    async fn fail_payout(
        &self,
        payout_id: Uuid,
        reason: &str,
        detail: Value,
        actor: &str,
    ) -> EngineResult<Payout> {
        let now = self.ctx.now();
        let mut uow = self.ctx.begin().await?;
        let mut payout = uow
            .payout(payout_id)
            .await?
            .ok_or(EngineError::PayoutNotFound(payout_id))?;
        transition_payout(&mut payout, PayoutStatus::Failed)?;
        payout.failure_reason = Some(reason.to_string());
        uow.save_payout(&payout).await?;
        self.ctx
            .record(AuditAction::new(
                now,
                actor,
                "payout",
                payout.id,
                "PAYOUT_FAILED",
                json!({"reason": reason, "detail": detail}),
            ))
            .await?;
        uow.commit().await?;
        Ok(payout)
    }

    /// Cancel a payout that has not started processing. Voids its invoice.
    pub async fn cancel_payout(&self, payout_id: Uuid, reason: &str, actor: &str) -> EngineResult<Payout> {
        check_reason(reason)?;
        let now = self.ctx.now();

        let mut uow = self.ctx.begin().await?;
        let mut payout = uow
            .payout(payout_id)
            .await?
            .ok_or(EngineError::PayoutNotFound(payout_id))?;
        transition_payout(&mut payout, PayoutStatus::Cancelled)?;
        uow.save_payout(&payout).await?;

        if let Some(invoice_id) = payout.invoice_id {
            if let Some(mut inv) = uow.invoice(invoice_id).await? {
                inv.status = InvoiceStatus::Void;
                uow.save_invoice(&inv).await?;
                self.ctx
                    .record(AuditAction::new(
                        now,
                        actor,
                        "invoice",
                        inv.id,
                        "INVOICE_VOIDED",
                        json!({"invoice_number": inv.invoice_number, "reason": reason}),
                    ))
                    .await?;
            }
        }
        self.ctx
            .record(AuditAction::new(
                now,
                actor,
                "payout",
                payout.id,
                "PAYOUT_CANCELLED",
                json!({"reason": reason}),
            ))
            .await?;
        uow.commit().await?;

        info!(payout_id = %payout.id, "payout cancelled");
        Ok(payout)
    }

    /// Allocate `amount` over the partner's payable earnings in `currency`
    /// in its own unit of work. Settlement does the same inside the unit of
    /// work that marks the payout PAID.
    pub async fn mark_earnings_as_paid(
        &self,
        partner_id: Uuid,
        currency: &str,
        amount: Money,
        payout_id: Uuid,
        actor: &str,
    ) -> EngineResult<SplitOutcome> {
        check_positive(amount, "paid amount")?;
        check_currency(currency)?;
        let now = self.ctx.now();
        let mut uow = self.ctx.begin().await?;
        let outcome = self
            .apply_payment(uow.as_mut(), partner_id, currency, amount, payout_id, actor, now)
            .await?;
        uow.commit().await?;
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_payment(
        &self,
        uow: &mut dyn UnitOfWork,
        partner_id: Uuid,
        currency: &str,
        amount: Money,
        payout_id: Uuid,
        actor: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<SplitOutcome> {
        let payable = uow.payable_earnings(partner_id, currency).await?;
        let plan = plan_split(
            &payable
                .iter()
                .map(|e| (e.id, e.amount_earned))
                .collect::<Vec<_>>(),
            amount,
        );
        let mut rows: HashMap<Uuid, Earning> = payable.into_iter().map(|e| (e.id, e)).collect();
        let mut outcome = SplitOutcome::default();

        for id in &plan.paid_in_full {
            if let Some(mut e) = rows.remove(id) {
                self.pay_earning(uow, &mut e, payout_id, actor, now).await?;
                outcome.paid.push(e.id);
            }
        }

        if let Some(planned) = &plan.split {
            if let Some(mut original) = rows.remove(&planned.earning_id) {
                let mut remainder = Earning {
                    id: Uuid::new_v4(),
                    amount_earned: planned.remainder,
                    status: EarningStatus::Confirmed,
                    notes: Vec::new(),
                    split_from: Some(original.id),
                    created_at: now,
                    updated_at: now,
                    ..original.clone()
                };
                remainder.push_note(note_line(
                    now,
                    actor,
                    &format!(
                        "split from earning {} by payout {payout_id}: remainder {}",
                        original.id, planned.remainder
                    ),
                ));

                original.amount_earned = planned.paid_portion;
                original.push_note(note_line(
                    now,
                    actor,
                    &format!(
                        "split by payout {payout_id}: paid {}, remainder {} moved to earning {}",
                        planned.paid_portion, planned.remainder, remainder.id
                    ),
                ));
                uow.insert_earning(&remainder).await?;
                self.pay_earning(uow, &mut original, payout_id, actor, now).await?;

                self.ctx
                    .record(AuditAction::new(
                        now,
                        actor,
                        "earning",
                        original.id,
                        "EARNING_SPLIT",
                        json!({
                            "payout_id": payout_id,
                            "paid_portion": planned.paid_portion,
                            "remainder": planned.remainder,
                            "remainder_id": remainder.id,
                        }),
                    ))
                    .await?;
                outcome.paid.push(original.id);
                outcome.split = Some(SplitRecord {
                    original_id: original.id,
                    remainder_id: remainder.id,
                    paid_portion: planned.paid_portion,
                    remainder: planned.remainder,
                });
            }
        }

        if plan.unapplied.is_positive() {
            outcome.unapplied = Some(plan.unapplied);
        }
        Ok(outcome)
    }

    /// PENDING earnings are confirmed first so every PAID row went through
    /// CONFIRMED.
    async fn pay_earning(
        &self,
        uow: &mut dyn UnitOfWork,
        earning: &mut Earning,
        payout_id: Uuid,
        actor: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let extra = json!({"payout_id": payout_id});
        if earning.status == EarningStatus::Pending {
            let reason = format!("confirmed for payout {payout_id}");
            let from = transition_earning(earning, EarningStatus::Confirmed, actor, &reason, now)?;
            self.ctx
                .record(status_changed_action(now, actor, earning, from, &reason, extra.clone()))
                .await?;
        }
        let reason = format!("paid by payout {payout_id}");
        let from = transition_earning(earning, EarningStatus::Paid, actor, &reason, now)?;
        uow.save_earning(earning).await?;
        self.ctx
            .record(status_changed_action(now, actor, earning, from, &reason, extra))
            .await
    }
}
