//! afl-db
//!
//! Persistence port for the commission engine plus two implementations:
//! Postgres ([`PgStore`], sqlx with embedded migrations) and in-memory
//! ([`MemStore`], used by the test harness).
//!
//! Every engine mutation runs inside one [`UnitOfWork`]: `Store::begin`,
//! reads and writes, then `commit`. Dropping a unit of work without
//! committing rolls it back. The engine never holds two units of work open
//! at once.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use afl_schemas::{
    AffiliateLink, CommissionBatch, Earning, EarningStatus, Invoice, Offer, Partner, Payout,
};

mod audit_sink;
mod mem;
mod pg;

pub use audit_sink::{export_audit_jsonl, PgAuditSink};
pub use mem::{MemSnapshot, MemStore};
pub use pg::{connect_from_env, migrate, status, DbStatus, PgStore};

pub const ENV_DB_URL: &str = "AFL_DATABASE_URL";

/// A stored commission structure that this build cannot interpret.
///
/// Raised while decoding an offer row; the engine surfaces it as
/// `UnsupportedStructureType` rather than a generic store failure.
#[derive(Debug, thiserror::Error)]
#[error("unsupported commission structure: {0}")]
pub struct UnsupportedStructure(pub String);

/// Filters for a partner's earning list. All fields are optional and ANDed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EarningFilter {
    pub status: Option<EarningStatus>,
    pub currency: Option<String>,
    /// Inclusive lower bound on `transaction_date`.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `transaction_date`.
    pub to: Option<DateTime<Utc>>,
}

impl EarningFilter {
    pub fn matches(&self, e: &Earning) -> bool {
        self.status.map_or(true, |s| e.status == s)
            && self.currency.as_deref().map_or(true, |c| e.currency == c)
            && self.from.map_or(true, |f| e.transaction_date >= f)
            && self.to.map_or(true, |t| e.transaction_date < t)
    }
}

/// Opens units of work.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>>;
}

/// One transactional scope. Reads see the writes made earlier in the same
/// unit; nothing is visible to others until [`UnitOfWork::commit`].
///
/// Earning lists are always ordered oldest first by
/// `(transaction_date, created_at, id)`.
#[async_trait]
pub trait UnitOfWork: Send {
    async fn partner(&mut self, id: Uuid) -> Result<Option<Partner>>;
    async fn insert_partner(&mut self, partner: &Partner) -> Result<()>;
    async fn save_partner(&mut self, partner: &Partner) -> Result<()>;

    async fn link(&mut self, id: Uuid) -> Result<Option<AffiliateLink>>;
    async fn insert_link(&mut self, link: &AffiliateLink) -> Result<()>;

    async fn offer(&mut self, id: Uuid) -> Result<Option<Offer>>;
    async fn insert_offer(&mut self, offer: &Offer) -> Result<()>;
    async fn save_offer(&mut self, offer: &Offer) -> Result<()>;

    /// Postgres locks the returned row until the unit of work ends.
    async fn earning(&mut self, id: Uuid) -> Result<Option<Earning>>;
    async fn insert_earning(&mut self, earning: &Earning) -> Result<()>;
    async fn save_earning(&mut self, earning: &Earning) -> Result<()>;
    /// Every PENDING earning across all partners.
    async fn pending_earnings(&mut self) -> Result<Vec<Earning>>;
    /// PENDING and CONFIRMED earnings of one partner in one currency.
    async fn payable_earnings(&mut self, partner_id: Uuid, currency: &str) -> Result<Vec<Earning>>;
    async fn partner_earnings(
        &mut self,
        partner_id: Uuid,
        filter: &EarningFilter,
    ) -> Result<Vec<Earning>>;

    async fn batch(&mut self, id: Uuid) -> Result<Option<CommissionBatch>>;
    async fn insert_batch(&mut self, batch: &CommissionBatch) -> Result<()>;
    async fn save_batch(&mut self, batch: &CommissionBatch) -> Result<()>;
    /// Most recently started first.
    async fn recent_batches(&mut self, limit: i64) -> Result<Vec<CommissionBatch>>;
    /// PROCESSING batches started before `before`.
    async fn stale_batches(&mut self, before: DateTime<Utc>) -> Result<Vec<CommissionBatch>>;

    async fn payout(&mut self, id: Uuid) -> Result<Option<Payout>>;
    async fn insert_payout(&mut self, payout: &Payout) -> Result<()>;
    async fn save_payout(&mut self, payout: &Payout) -> Result<()>;
    /// PENDING payouts, oldest request first.
    async fn pending_payouts(&mut self) -> Result<Vec<Payout>>;
    /// PROCESSING payouts whose processing began before `before`.
    async fn stale_payouts(&mut self, before: DateTime<Utc>) -> Result<Vec<Payout>>;

    async fn invoice(&mut self, id: Uuid) -> Result<Option<Invoice>>;
    async fn insert_invoice(&mut self, invoice: &Invoice) -> Result<()>;
    async fn save_invoice(&mut self, invoice: &Invoice) -> Result<()>;
    /// Invoices issued at or after `since`. Serialises concurrent numbering
    /// for the rest of the unit of work.
    async fn count_invoices_since(&mut self, since: DateTime<Utc>) -> Result<i64>;

    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Named mutual exclusion for batch entry points (`settlement:<date>`,
/// `payout-sweep`, `payout:<id>`). Survives across processes for Postgres.
#[async_trait]
pub trait JobLock: Send + Sync {
    /// `Ok(false)` when someone else holds the key.
    async fn try_acquire(&self, key: &str, holder: &str, now: DateTime<Utc>) -> Result<bool>;
    async fn release(&self, key: &str) -> Result<()>;
    /// Drop locks acquired before `before` (left behind by a crashed
    /// process). Returns the released keys.
    async fn release_stale(&self, before: DateTime<Utc>) -> Result<Vec<String>>;
    /// Drop `key` only if it was acquired before `before`. `Ok(true)` when
    /// a stale holder was evicted.
    async fn release_if_stale(&self, key: &str, before: DateTime<Utc>) -> Result<bool>;
}

/// Oldest-first ordering shared by both implementations.
pub(crate) fn sort_oldest_first(earnings: &mut [Earning]) {
    earnings.sort_by(|a, b| {
        a.transaction_date
            .cmp(&b.transaction_date)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
}
