//! Stale-job recovery.
//!
//! A process that dies mid-batch or mid-payout leaves rows in PROCESSING
//! and its job locks behind. This sweep fails those rows (payouts need a
//! human to check the rail) and releases the locks.

use chrono::Duration;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use afl_audit::AuditAction;
use afl_schemas::{BatchStatus, PayoutStatus};

use crate::error::{EngineError, EngineResult};
use crate::payout::transitions::payout_transition_allowed;
use crate::EngineContext;

const ACTOR: &str = "system:recovery";
pub const RECOVERY_LOCK: &str = "recovery";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub failed_batches: Vec<Uuid>,
    pub failed_payouts: Vec<Uuid>,
    pub released_locks: Vec<String>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.failed_batches.is_empty()
            && self.failed_payouts.is_empty()
            && self.released_locks.is_empty()
    }
}

pub struct StaleRecovery {
    ctx: EngineContext,
}

impl StaleRecovery {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Fail PROCESSING batches and payouts older than `stale_after`, then
    /// release job locks of the same age.
    pub async fn recover_stale_processing(&self, stale_after: Duration) -> EngineResult<RecoveryReport> {
        if stale_after <= Duration::zero() {
            return Err(EngineError::Validation(format!(
                "stale_after must be positive, got {stale_after}"
            )));
        }
        // A pass that died holding its own lock would otherwise block every
        // later pass, and with it the release of all other stale locks.
        let cutoff = self.ctx.now() - stale_after;
        if self.ctx.locks.release_if_stale(RECOVERY_LOCK, cutoff).await? {
            warn!(lock = RECOVERY_LOCK, "evicted recovery lock left by a dead pass");
        }
        if !self.ctx.try_lock(RECOVERY_LOCK).await? {
            return Err(EngineError::JobAlreadyRunning(RECOVERY_LOCK.to_string()));
        }
        let outcome = self.recover_locked(stale_after).await;
        self.ctx.unlock(RECOVERY_LOCK).await;
        outcome
    }

    async fn recover_locked(&self, stale_after: Duration) -> EngineResult<RecoveryReport> {
        let now = self.ctx.now();
        let cutoff = now - stale_after;
        let mut report = RecoveryReport::default();

        let mut uow = self.ctx.begin().await?;
        for mut batch in uow.stale_batches(cutoff).await? {
            if batch.status != BatchStatus::Processing {
                continue;
            }
            let message = format!(
                "abandoned: still PROCESSING after {}s",
                stale_after.num_seconds()
            );
            batch.status = BatchStatus::Failed;
            batch.error_message = Some(message.clone());
            batch.completed_at = Some(now);
            uow.save_batch(&batch).await?;
            self.ctx
                .record(AuditAction::new(
                    now,
                    ACTOR,
                    "commission_batch",
                    batch.id,
                    "BATCH_FAILED",
                    json!({"batch_date": batch.batch_date, "error": message, "recovered": true}),
                ))
                .await?;
            report.failed_batches.push(batch.id);
        }

        for mut payout in uow.stale_payouts(cutoff).await? {
            if !payout_transition_allowed(payout.status, PayoutStatus::Failed) {
                continue;
            }
            let reason = "abandoned in PROCESSING; reconcile with the payment rail".to_string();
            payout.status = PayoutStatus::Failed;
            payout.failure_reason = Some(reason.clone());
            uow.save_payout(&payout).await?;
            self.ctx
                .record(AuditAction::new(
                    now,
                    ACTOR,
                    "payout",
                    payout.id,
                    "PAYOUT_FAILED",
                    json!({"reason": reason, "recovered": true, "processed_at": payout.processed_at}),
                ))
                .await?;
            warn!(payout_id = %payout.id, "stale payout failed; check the rail for a landed transfer");
            report.failed_payouts.push(payout.id);
        }
        uow.commit().await?;

        report.released_locks = self
            .ctx
            .locks
            .release_stale(cutoff)
            .await?
            .into_iter()
            .filter(|k| k != RECOVERY_LOCK)
            .collect();

        if !report.is_empty() {
            info!(
                batches = report.failed_batches.len(),
                payouts = report.failed_payouts.len(),
                locks = report.released_locks.len(),
                "stale work recovered"
            );
        }
        Ok(report)
    }
}
