//! Scheduled jobs and the loops that fire them.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use afl_config::EngineConfig;
use afl_engine::{
    Clock, EngineContext, EngineError, PayoutEngine, PayoutPolicy, RecoveryReport,
    SettlementBatchRunner, StaleRecovery, SweepReport, Trigger,
};
use afl_rail::PaymentRail;
use afl_schemas::CommissionBatch;

use crate::schedule::{next_run_after, until};

/// One tick of each job. Never returns an error: the scheduler logs and
/// carries on to the next tick.
pub struct Jobs {
    ctx: EngineContext,
    rail: Arc<dyn PaymentRail>,
    cfg: EngineConfig,
}

impl Jobs {
    pub fn new(ctx: EngineContext, rail: Arc<dyn PaymentRail>, cfg: EngineConfig) -> Self {
        Self { ctx, rail, cfg }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// `None` when another run holds the lock or the batch failed.
    pub async fn settlement_tick(&self, batch_date: NaiveDate) -> Option<CommissionBatch> {
        let runner = SettlementBatchRunner::new(self.ctx.clone());
        match runner.run_batch(batch_date, Trigger::Scheduled).await {
            Ok(Some(batch)) => {
                info!(
                    batch_id = %batch.id,
                    %batch_date,
                    processed = batch.processed_count,
                    skipped = batch.skipped_count,
                    total = %batch.total_commissions,
                    "scheduled settlement finished"
                );
                Some(batch)
            }
            Ok(None) => None,
            Err(err) => {
                error!(%batch_date, error = %err, "scheduled settlement errored");
                None
            }
        }
    }

    pub async fn payout_tick(&self) -> SweepReport {
        let engine = PayoutEngine::new(
            self.ctx.clone(),
            self.rail.clone(),
            PayoutPolicy::from_config(&self.cfg),
        );
        match engine.settle_pending_payouts(Trigger::Scheduled).await {
            Ok(report) => {
                info!(
                    paid = report.paid.len(),
                    failed = report.failed.len(),
                    errors = report.errors.len(),
                    "scheduled payout sweep finished"
                );
                report
            }
            Err(err) => {
                error!(error = %err, "scheduled payout sweep errored");
                SweepReport::default()
            }
        }
    }

    /// `None` when a recovery pass is already running or it failed.
    pub async fn recovery_tick(&self) -> Option<RecoveryReport> {
        let stale_after = chrono::Duration::seconds(self.cfg.recovery.stale_after_secs);
        match StaleRecovery::new(self.ctx.clone())
            .recover_stale_processing(stale_after)
            .await
        {
            Ok(report) => {
                if !report.is_empty() {
                    warn!(
                        failed_batches = report.failed_batches.len(),
                        failed_payouts = report.failed_payouts.len(),
                        released_locks = ?report.released_locks,
                        "recovered stale jobs"
                    );
                }
                Some(report)
            }
            Err(EngineError::JobAlreadyRunning(_)) => {
                info!("recovery already running; skipping");
                None
            }
            Err(err) => {
                error!(error = %err, "recovery errored");
                None
            }
        }
    }
}

/// Start the three loops. They exit once `shutdown` flips to `true` (or its
/// sender is dropped).
pub fn spawn_all(jobs: Arc<Jobs>, shutdown: watch::Receiver<bool>) -> Result<Vec<JoinHandle<()>>> {
    let schedule = &jobs.config().schedule;
    let settle_at = schedule.settlement_time()?;
    let sweep_at = schedule.payout_sweep_time()?;
    let every = std::time::Duration::from_secs(schedule.recovery_interval_secs.max(1));
    let clock = jobs.ctx.clock.clone();

    let settle_jobs = jobs.clone();
    let settlement = tokio::spawn(run_daily(
        "settlement",
        settle_at,
        clock.clone(),
        shutdown.clone(),
        move |fired| {
            let jobs = settle_jobs.clone();
            async move {
                jobs.settlement_tick(fired.date_naive()).await;
            }
        },
    ));

    let sweep_jobs = jobs.clone();
    let sweep = tokio::spawn(run_daily(
        "payout-sweep",
        sweep_at,
        clock,
        shutdown.clone(),
        move |_| {
            let jobs = sweep_jobs.clone();
            async move {
                jobs.payout_tick().await;
            }
        },
    ));

    let recovery = tokio::spawn(run_every(every, shutdown, move || {
        let jobs = jobs.clone();
        async move {
            jobs.recovery_tick().await;
        }
    }));

    Ok(vec![settlement, sweep, recovery])
}

async fn run_daily<F, Fut>(
    name: &'static str,
    at: NaiveTime,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
    job: F,
) where
    F: Fn(DateTime<Utc>) -> Fut,
    Fut: Future<Output = ()>,
{
    while !*shutdown.borrow() {
        let now = clock.now();
        let next = next_run_after(now, at);
        info!(job = name, next_run = %next, "next run scheduled");
        tokio::select! {
            _ = tokio::time::sleep(until(now, next)) => job(next).await,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    info!(job = name, "stopped");
}

/// First tick fires immediately, so a restart recovers right away.
async fn run_every<F, Fut>(every: std::time::Duration, mut shutdown: watch::Receiver<bool>, job: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    while !*shutdown.borrow() {
        tokio::select! {
            _ = ticker.tick() => job().await,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    info!(job = "recovery", "stopped");
}
