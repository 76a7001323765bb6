//! afl-engine
//!
//! Commission calculation, the earning ledger, daily settlement, payouts and
//! stale-job recovery. Everything runs against the ports in `afl-db`
//! (store, job locks), `afl-audit` (audit sink) and `afl-rail` (payment rail),
//! so the same code runs on Postgres in production and on the in-memory
//! store in tests.
//!
//! Mutation pattern used throughout:
//!
//! 1. open one unit of work,
//! 2. read, validate, write,
//! 3. log the audit event(s),
//! 4. commit.
//!
//! An audit failure returns before commit, so the unit of work is dropped
//! and nothing persists. Rail calls happen outside any unit of work.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::warn;

use afl_audit::{AuditAction, AuditSink};
use afl_db::{JobLock, Store, UnitOfWork};
use afl_schemas::Money;

pub mod calculator;
pub mod clock;
pub mod compliance;
pub mod error;
pub mod ledger;
pub mod offers;
pub mod payout;
pub mod recovery;
pub mod settlement;

#[cfg(test)]
pub(crate) mod testutil;

pub use calculator::{CommissionCalculator, CommissionQuote, OverrideAdjustment, QuoteBasis};
pub use clock::{Clock, FixedClock, SystemClock};
pub use compliance::{ComplianceValidator, RateRange};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use ledger::{ConversionDetails, ConversionReport, EarningLedger, StatusTotals};
pub use offers::{NewOffer, OfferCatalog};
pub use payout::{
    PayoutEngine, PayoutPolicy, PayoutReceipt, PayoutRequest, SplitOutcome, SweepReport,
};
pub use recovery::{RecoveryReport, StaleRecovery};
pub use settlement::SettlementBatchRunner;

/// Who started a batch entry point. Decides how lock contention and
/// batch-level failures reach the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Operator or API call: errors are returned.
    Manual,
    /// Background scheduler: errors are logged and swallowed.
    Scheduled,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Scheduled => "scheduled",
        }
    }
}

/// Shared handles every engine component needs.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn Store>,
    pub locks: Arc<dyn JobLock>,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Arc<dyn Clock>,
}

impl EngineContext {
    pub fn new(
        store: Arc<dyn Store>,
        locks: Arc<dyn JobLock>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            locks,
            audit,
            clock,
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) async fn begin(&self) -> EngineResult<Box<dyn UnitOfWork>> {
        Ok(self.store.begin().await?)
    }

    pub(crate) async fn record(&self, action: AuditAction) -> EngineResult<()> {
        self.audit
            .log_action(action)
            .await
            .map(|_| ())
            .map_err(EngineError::Audit)
    }

    pub(crate) async fn try_lock(&self, key: &str) -> EngineResult<bool> {
        let holder = format!("pid:{}", std::process::id());
        Ok(self.locks.try_acquire(key, &holder, self.now()).await?)
    }

    pub(crate) async fn unlock(&self, key: &str) {
        if let Err(err) = self.locks.release(key).await {
            warn!(lock = key, error = %err, "job lock release failed; recovery will clear it");
        }
    }
}

/// One line of an earning's note history.
pub(crate) fn note_line(now: DateTime<Utc>, actor: &str, text: &str) -> String {
    format!("{} [{}] {}", now.to_rfc3339_opts(SecondsFormat::Secs, true), actor, text)
}

pub(crate) fn check_currency(currency: &str) -> EngineResult<()> {
    if currency.len() == 3 && currency.chars().all(|c| c.is_ascii_uppercase()) {
        Ok(())
    } else {
        Err(EngineError::Validation(format!(
            "currency must be a 3-letter ISO code, got '{currency}'"
        )))
    }
}

pub(crate) fn check_positive(amount: Money, what: &str) -> EngineResult<()> {
    if amount.is_positive() {
        Ok(())
    } else {
        Err(EngineError::Validation(format!("{what} must be > 0, got {amount}")))
    }
}

pub(crate) fn check_reason(reason: &str) -> EngineResult<()> {
    if reason.trim().is_empty() {
        Err(EngineError::Validation("a reason is required".into()))
    } else {
        Ok(())
    }
}
