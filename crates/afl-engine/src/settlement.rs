//! Daily settlement: confirm every PENDING earning whose offer still prices
//! it, and record the run as a commission batch.
//!
//! Each earning settles in its own unit of work, so one bad earning is
//! skipped without touching the others. A failure to fetch the PENDING set
//! fails the whole batch.

use chrono::NaiveDate;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use afl_audit::AuditAction;
use afl_schemas::{BatchStatus, CommissionBatch, Earning, EarningStatus, Money};

use crate::calculator::CommissionCalculator;
use crate::error::{EngineError, EngineResult};
use crate::ledger::{status_changed_action, transition_earning};
use crate::{EngineContext, Trigger};

const ACTOR: &str = "system:settlement";

pub fn lock_key(batch_date: NaiveDate) -> String {
    format!("settlement:{batch_date}")
}

pub struct SettlementBatchRunner {
    ctx: EngineContext,
    calculator: CommissionCalculator,
}

impl SettlementBatchRunner {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            calculator: CommissionCalculator::new(),
        }
    }

    /// Run the settlement batch for `batch_date`.
    ///
    /// Manual callers get every error, including lock contention
    /// (`JobAlreadyRunning`). Scheduled callers get `Ok(None)` when the lock
    /// is held or the run fails; the failure is logged and, once the batch
    /// row exists, recorded on it.
    pub async fn run_batch(
        &self,
        batch_date: NaiveDate,
        trigger: Trigger,
    ) -> EngineResult<Option<CommissionBatch>> {
        match (self.run_exclusive(batch_date, trigger).await, trigger) {
            (Err(err), Trigger::Scheduled) => {
                error!(%batch_date, error = %err, kind = err.kind().as_str(), "scheduled settlement failed");
                Ok(None)
            }
            (outcome, _) => outcome,
        }
    }

    async fn run_exclusive(
        &self,
        batch_date: NaiveDate,
        trigger: Trigger,
    ) -> EngineResult<Option<CommissionBatch>> {
        let key = lock_key(batch_date);
        if !self.ctx.try_lock(&key).await? {
            return match trigger {
                Trigger::Manual => Err(EngineError::JobAlreadyRunning(key)),
                Trigger::Scheduled => {
                    info!(%batch_date, "settlement already running; skipping scheduled run");
                    Ok(None)
                }
            };
        }
        let outcome = self.run_locked(batch_date, trigger).await;
        self.ctx.unlock(&key).await;
        outcome.map(Some)
    }

    async fn run_locked(
        &self,
        batch_date: NaiveDate,
        trigger: Trigger,
    ) -> EngineResult<CommissionBatch> {
        let started_at = self.ctx.now();
        let mut batch = CommissionBatch {
            id: Uuid::new_v4(),
            batch_date,
            total_commissions: Money::ZERO,
            processed_count: 0,
            skipped_count: 0,
            status: BatchStatus::Processing,
            error_message: None,
            started_at,
            completed_at: None,
        };

        let mut uow = self.ctx.begin().await?;
        uow.insert_batch(&batch).await?;
        self.ctx
            .record(AuditAction::new(
                started_at,
                ACTOR,
                "commission_batch",
                batch.id,
                "BATCH_STARTED",
                json!({"batch_date": batch_date, "trigger": trigger.as_str()}),
            ))
            .await?;
        uow.commit().await?;
        info!(batch_id = %batch.id, %batch_date, trigger = trigger.as_str(), "settlement batch started");

        let pending = match self.fetch_pending().await {
            Ok(p) => p,
            Err(err) => {
                self.fail_batch(&mut batch, &err).await;
                return Err(err);
            }
        };

        for earning in &pending {
            match self.settle_one(&batch, earning.id).await {
                Ok(Some(amount)) => {
                    batch.processed_count += 1;
                    batch.total_commissions += amount;
                }
                Ok(None) => batch.skipped_count += 1,
                Err(err) => {
                    warn!(
                        batch_id = %batch.id,
                        earning_id = %earning.id,
                        error = %err,
                        kind = err.kind().as_str(),
                        "earning skipped"
                    );
                    batch.skipped_count += 1;
                }
            }
        }

        let now = self.ctx.now();
        batch.status = BatchStatus::Completed;
        batch.completed_at = Some(now);

        let mut uow = self.ctx.begin().await?;
        uow.save_batch(&batch).await?;
        self.ctx
            .record(AuditAction::new(
                now,
                ACTOR,
                "commission_batch",
                batch.id,
                "BATCH_COMPLETED",
                json!({
                    "batch_date": batch_date,
                    "total_commissions": batch.total_commissions,
                    "processed_count": batch.processed_count,
                    "skipped_count": batch.skipped_count,
                }),
            ))
            .await?;
        uow.commit().await?;

        info!(
            batch_id = %batch.id,
            processed = batch.processed_count,
            skipped = batch.skipped_count,
            total = %batch.total_commissions,
            "settlement batch completed"
        );
        Ok(batch)
    }

    async fn fetch_pending(&self) -> EngineResult<Vec<Earning>> {
        let mut uow = self.ctx.begin().await?;
        let pending = uow.pending_earnings().await?;
        uow.rollback().await?;
        Ok(pending)
    }

    async fn fail_batch(&self, batch: &mut CommissionBatch, cause: &EngineError) {
        let now = self.ctx.now();
        batch.status = BatchStatus::Failed;
        batch.error_message = Some(cause.to_string());
        batch.completed_at = Some(now);

        let outcome = self.save_failed(batch, cause).await;

        match outcome {
            Ok(()) => error!(batch_id = %batch.id, error = %cause, "settlement batch failed"),
            Err(err) => error!(
                batch_id = %batch.id,
                error = %cause,
                record_error = %err,
                "settlement batch failed and could not be marked; recovery will close it"
            ),
        }
    }

    async fn save_failed(&self, batch: &CommissionBatch, cause: &EngineError) -> EngineResult<()> {
        let mut uow = self.ctx.begin().await?;
        uow.save_batch(batch).await?;
        self.ctx
            .record(AuditAction::new(
                self.ctx.now(),
                ACTOR,
                "commission_batch",
                batch.id,
                "BATCH_FAILED",
                json!({"batch_date": batch.batch_date, "error": cause.to_string()}),
            ))
            .await?;
        uow.commit().await?;
        Ok(())
    }

    /// Confirm one earning. `Ok(None)` when it is no longer PENDING.
    async fn settle_one(
        &self,
        batch: &CommissionBatch,
        earning_id: Uuid,
    ) -> EngineResult<Option<Money>> {
        let now = self.ctx.now();
        let mut uow = self.ctx.begin().await?;
        let Some(mut earning) = uow.earning(earning_id).await? else {
            return Ok(None);
        };
        if earning.status != EarningStatus::Pending {
            return Ok(None);
        }
        let offer = uow
            .offer(earning.offer_id)
            .await?
            .ok_or(EngineError::OfferNotFound(earning.offer_id))?;
        let partner = uow
            .partner(earning.partner_id)
            .await?
            .ok_or(EngineError::PartnerNotFound(earning.partner_id))?;
        if !partner.is_active {
            return Err(EngineError::PartnerInactive(partner.id));
        }

        let quote = self.calculator.calculate(
            earning.booking_value,
            &offer,
            partner.commission_rate_override,
            now,
        )?;
        let drift = quote.amount != earning.amount_earned;
        if drift {
            warn!(
                earning_id = %earning.id,
                stored = %earning.amount_earned,
                recomputed = %quote.amount,
                "commission changed since recording; keeping stored amount"
            );
        }

        let reason = format!("settled in batch {}", batch.id);
        let from = transition_earning(&mut earning, EarningStatus::Confirmed, ACTOR, &reason, now)?;
        uow.save_earning(&earning).await?;
        self.ctx
            .record(status_changed_action(
                now,
                ACTOR,
                &earning,
                from,
                &reason,
                json!({
                    "batch_id": batch.id,
                    "recomputed_amount": quote.amount,
                    "amount_drift": drift,
                    "tier_fallback": quote.tier_fallback(),
                }),
            ))
            .await?;
        uow.commit().await?;
        Ok(Some(earning.amount_earned))
    }

    /// Most recent batches first.
    pub async fn list_batches(&self, limit: i64) -> EngineResult<Vec<CommissionBatch>> {
        if limit <= 0 {
            return Err(EngineError::Validation(format!("limit must be > 0, got {limit}")));
        }
        let mut uow = self.ctx.begin().await?;
        let batches = uow.recent_batches(limit).await?;
        uow.rollback().await?;
        Ok(batches)
    }
}
