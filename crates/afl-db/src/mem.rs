//! In-memory store.
//!
//! A unit of work holds the table lock for its whole lifetime and mutates a
//! working copy; `commit` swaps the copy in, drop discards it. That gives
//! serialisable isolation, which is stronger than the engine needs.
//!
//! Row constraints mirror the Postgres schema (unique ids, unique invoice
//! numbers, non-negative earning amounts) so tests fail the same way.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use afl_schemas::{
    AffiliateLink, BatchStatus, CommissionBatch, Earning, EarningStatus, Invoice, Offer, Partner,
    Payout, PayoutStatus,
};

use crate::{sort_oldest_first, EarningFilter, JobLock, Store, UnitOfWork};

/// Every table, keyed by id. Also what tests inspect after a run.
#[derive(Debug, Clone, Default)]
pub struct MemSnapshot {
    pub partners: BTreeMap<Uuid, Partner>,
    pub links: BTreeMap<Uuid, AffiliateLink>,
    pub offers: BTreeMap<Uuid, Offer>,
    pub earnings: BTreeMap<Uuid, Earning>,
    pub batches: BTreeMap<Uuid, CommissionBatch>,
    pub payouts: BTreeMap<Uuid, Payout>,
    pub invoices: BTreeMap<Uuid, Invoice>,
}

impl MemSnapshot {
    /// Earnings of one partner, oldest first.
    pub fn earnings_of(&self, partner_id: Uuid) -> Vec<Earning> {
        let mut out: Vec<Earning> = self
            .earnings
            .values()
            .filter(|e| e.partner_id == partner_id)
            .cloned()
            .collect();
        sort_oldest_first(&mut out);
        out
    }
}

#[derive(Default)]
struct Faults {
    fail_pending_fetch: RwLock<bool>,
    fail_commit: RwLock<bool>,
    fail_save_earning: RwLock<Option<Uuid>>,
}

#[derive(Clone, Default)]
pub struct MemStore {
    tables: Arc<Mutex<MemSnapshot>>,
    locks: Arc<Mutex<HashMap<String, (String, DateTime<Utc>)>>>,
    faults: Arc<Faults>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of committed state.
    pub async fn snapshot(&self) -> MemSnapshot {
        self.tables.lock().await.clone()
    }

    /// Make `pending_earnings` error.
    pub async fn set_fail_pending_fetch(&self, fail: bool) {
        *self.faults.fail_pending_fetch.write().await = fail;
    }

    /// Make every `commit` error (the working copy is discarded).
    pub async fn set_fail_commit(&self, fail: bool) {
        *self.faults.fail_commit.write().await = fail;
    }

    /// Make `save_earning` error for one earning id.
    pub async fn set_fail_save_earning(&self, id: Option<Uuid>) {
        *self.faults.fail_save_earning.write().await = id;
    }

    pub async fn held_locks(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.locks.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl Store for MemStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let guard = self.tables.clone().lock_owned().await;
        let work = (*guard).clone();
        Ok(Box::new(MemUnitOfWork {
            guard,
            work,
            faults: self.faults.clone(),
        }))
    }
}

#[async_trait]
impl JobLock for MemStore {
    async fn try_acquire(&self, key: &str, holder: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut locks = self.locks.lock().await;
        if locks.contains_key(key) {
            return Ok(false);
        }
        locks.insert(key.to_string(), (holder.to_string(), now));
        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<()> {
        self.locks.lock().await.remove(key);
        Ok(())
    }

    async fn release_stale(&self, before: DateTime<Utc>) -> Result<Vec<String>> {
        let mut locks = self.locks.lock().await;
        let mut stale: Vec<String> = locks
            .iter()
            .filter(|(_, (_, at))| *at < before)
            .map(|(k, _)| k.clone())
            .collect();
        stale.sort();
        for k in &stale {
            locks.remove(k);
        }
        Ok(stale)
    }

    async fn release_if_stale(&self, key: &str, before: DateTime<Utc>) -> Result<bool> {
        let mut locks = self.locks.lock().await;
        match locks.get(key) {
            Some((_, at)) if *at < before => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

struct MemUnitOfWork {
    guard: OwnedMutexGuard<MemSnapshot>,
    work: MemSnapshot,
    faults: Arc<Faults>,
}

fn insert_new<T: Clone>(table: &mut BTreeMap<Uuid, T>, id: Uuid, row: &T, what: &str) -> Result<()> {
    if table.contains_key(&id) {
        bail!("duplicate {what} id {id}");
    }
    table.insert(id, row.clone());
    Ok(())
}

fn replace<T: Clone>(table: &mut BTreeMap<Uuid, T>, id: Uuid, row: &T, what: &str) -> Result<()> {
    let slot = table
        .get_mut(&id)
        .ok_or_else(|| anyhow!("{what} {id} does not exist"))?;
    *slot = row.clone();
    Ok(())
}

fn check_earning_row(e: &Earning) -> Result<()> {
    if e.amount_earned.is_negative() {
        bail!("earning {} violates amount_earned >= 0", e.id);
    }
    Ok(())
}

#[async_trait]
impl UnitOfWork for MemUnitOfWork {
    async fn partner(&mut self, id: Uuid) -> Result<Option<Partner>> {
        Ok(self.work.partners.get(&id).cloned())
    }

    async fn insert_partner(&mut self, partner: &Partner) -> Result<()> {
        insert_new(&mut self.work.partners, partner.id, partner, "partner")
    }

    async fn save_partner(&mut self, partner: &Partner) -> Result<()> {
        replace(&mut self.work.partners, partner.id, partner, "partner")
    }

    async fn link(&mut self, id: Uuid) -> Result<Option<AffiliateLink>> {
        Ok(self.work.links.get(&id).cloned())
    }

    async fn insert_link(&mut self, link: &AffiliateLink) -> Result<()> {
        if self
            .work
            .links
            .values()
            .any(|l| l.tracking_code == link.tracking_code)
        {
            bail!("duplicate tracking code {}", link.tracking_code);
        }
        insert_new(&mut self.work.links, link.id, link, "link")
    }

    async fn offer(&mut self, id: Uuid) -> Result<Option<Offer>> {
        Ok(self.work.offers.get(&id).cloned())
    }

    async fn insert_offer(&mut self, offer: &Offer) -> Result<()> {
        insert_new(&mut self.work.offers, offer.id, offer, "offer")
    }

    async fn save_offer(&mut self, offer: &Offer) -> Result<()> {
        replace(&mut self.work.offers, offer.id, offer, "offer")
    }

    async fn earning(&mut self, id: Uuid) -> Result<Option<Earning>> {
        Ok(self.work.earnings.get(&id).cloned())
    }

    async fn insert_earning(&mut self, earning: &Earning) -> Result<()> {
        check_earning_row(earning)?;
        insert_new(&mut self.work.earnings, earning.id, earning, "earning")
    }

    async fn save_earning(&mut self, earning: &Earning) -> Result<()> {
        if *self.faults.fail_save_earning.read().await == Some(earning.id) {
            bail!("injected save failure for earning {}", earning.id);
        }
        check_earning_row(earning)?;
        replace(&mut self.work.earnings, earning.id, earning, "earning")
    }

    async fn pending_earnings(&mut self) -> Result<Vec<Earning>> {
        if *self.faults.fail_pending_fetch.read().await {
            bail!("injected failure fetching pending earnings");
        }
        let mut out: Vec<Earning> = self
            .work
            .earnings
            .values()
            .filter(|e| e.status == EarningStatus::Pending)
            .cloned()
            .collect();
        sort_oldest_first(&mut out);
        Ok(out)
    }

    async fn payable_earnings(&mut self, partner_id: Uuid, currency: &str) -> Result<Vec<Earning>> {
        let mut out: Vec<Earning> = self
            .work
            .earnings
            .values()
            .filter(|e| e.partner_id == partner_id && e.currency == currency && e.status.is_payable())
            .cloned()
            .collect();
        sort_oldest_first(&mut out);
        Ok(out)
    }

    async fn partner_earnings(
        &mut self,
        partner_id: Uuid,
        filter: &EarningFilter,
    ) -> Result<Vec<Earning>> {
        let mut out: Vec<Earning> = self
            .work
            .earnings
            .values()
            .filter(|e| e.partner_id == partner_id && filter.matches(e))
            .cloned()
            .collect();
        sort_oldest_first(&mut out);
        Ok(out)
    }

    async fn batch(&mut self, id: Uuid) -> Result<Option<CommissionBatch>> {
        Ok(self.work.batches.get(&id).cloned())
    }

    async fn insert_batch(&mut self, batch: &CommissionBatch) -> Result<()> {
        insert_new(&mut self.work.batches, batch.id, batch, "batch")
    }

    async fn save_batch(&mut self, batch: &CommissionBatch) -> Result<()> {
        replace(&mut self.work.batches, batch.id, batch, "batch")
    }

    async fn recent_batches(&mut self, limit: i64) -> Result<Vec<CommissionBatch>> {
        let mut out: Vec<CommissionBatch> = self.work.batches.values().cloned().collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        out.truncate(usize::try_from(limit.max(0)).unwrap_or(0));
        Ok(out)
    }

    async fn stale_batches(&mut self, before: DateTime<Utc>) -> Result<Vec<CommissionBatch>> {
        let mut out: Vec<CommissionBatch> = self
            .work
            .batches
            .values()
            .filter(|b| b.status == BatchStatus::Processing && b.started_at < before)
            .cloned()
            .collect();
        out.sort_by_key(|b| b.started_at);
        Ok(out)
    }

    async fn payout(&mut self, id: Uuid) -> Result<Option<Payout>> {
        Ok(self.work.payouts.get(&id).cloned())
    }

    async fn insert_payout(&mut self, payout: &Payout) -> Result<()> {
        insert_new(&mut self.work.payouts, payout.id, payout, "payout")
    }

    async fn save_payout(&mut self, payout: &Payout) -> Result<()> {
        replace(&mut self.work.payouts, payout.id, payout, "payout")
    }

    async fn pending_payouts(&mut self) -> Result<Vec<Payout>> {
        let mut out: Vec<Payout> = self
            .work
            .payouts
            .values()
            .filter(|p| p.status == PayoutStatus::Pending)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.requested_at.cmp(&b.requested_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn stale_payouts(&mut self, before: DateTime<Utc>) -> Result<Vec<Payout>> {
        let mut out: Vec<Payout> = self
            .work
            .payouts
            .values()
            .filter(|p| {
                p.status == PayoutStatus::Processing
                    && p.processed_at.unwrap_or(p.requested_at) < before
            })
            .cloned()
            .collect();
        out.sort_by_key(|p| p.requested_at);
        Ok(out)
    }

    async fn invoice(&mut self, id: Uuid) -> Result<Option<Invoice>> {
        Ok(self.work.invoices.get(&id).cloned())
    }

    async fn insert_invoice(&mut self, invoice: &Invoice) -> Result<()> {
        if self
            .work
            .invoices
            .values()
            .any(|i| i.invoice_number == invoice.invoice_number)
        {
            bail!("duplicate invoice number {}", invoice.invoice_number);
        }
        insert_new(&mut self.work.invoices, invoice.id, invoice, "invoice")
    }

    async fn save_invoice(&mut self, invoice: &Invoice) -> Result<()> {
        replace(&mut self.work.invoices, invoice.id, invoice, "invoice")
    }

    async fn count_invoices_since(&mut self, since: DateTime<Utc>) -> Result<i64> {
        let n = self
            .work
            .invoices
            .values()
            .filter(|i| i.issued_at >= since)
            .count();
        Ok(i64::try_from(n)?)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemUnitOfWork {
            mut guard,
            work,
            faults,
        } = *self;
        if *faults.fail_commit.read().await {
            bail!("injected commit failure");
        }
        *guard = work;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
