//! afl-testkit
//!
//! Scenario harness: the real engine wired to the in-memory store, the
//! memory audit sink, a fixed clock and the paper rail. Scenario tests under
//! `tests/` drive it end to end and inspect the store snapshot and the audit
//! log afterwards.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

use afl_audit::{AuditEvent, MemoryAuditSink};
use afl_db::{MemSnapshot, MemStore, Store};
use afl_engine::{
    Clock, ConversionDetails, EarningLedger, EngineContext, EngineResult, FixedClock,
    OfferCatalog, PayoutEngine, PayoutPolicy, SettlementBatchRunner, StaleRecovery,
};
use afl_rail::PaperRail;
use afl_schemas::{
    AffiliateLink, CommissionStructure, Earning, EarningStatus, Money, Offer, Partner,
    PartnerCategory,
};

mod seed;

pub use seed::{EarningSeed, PartnerSeed};

/// Noon UTC, mid-month, so invoice numbering and validity windows have room
/// on both sides.
pub fn default_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

pub struct Harness {
    pub store: MemStore,
    pub audit: Arc<MemoryAuditSink>,
    pub clock: Arc<FixedClock>,
    pub rail: Arc<PaperRail>,
    pub ctx: EngineContext,
    pub policy: PayoutPolicy,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::starting_at(default_start())
    }

    pub fn starting_at(now: DateTime<Utc>) -> Self {
        let store = MemStore::new();
        let audit = Arc::new(MemoryAuditSink::new());
        let clock = Arc::new(FixedClock::new(now));
        let ctx = EngineContext::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            audit.clone(),
            clock.clone(),
        );
        Self {
            store,
            audit,
            clock,
            rail: Arc::new(PaperRail::new()),
            ctx,
            policy: PayoutPolicy::default(),
        }
    }

    pub fn with_minimum_payout(mut self, minimum: Money) -> Self {
        self.policy.minimum_amount = minimum;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    pub fn ledger(&self) -> EarningLedger {
        EarningLedger::new(self.ctx.clone())
    }

    pub fn offers(&self) -> OfferCatalog {
        OfferCatalog::new(self.ctx.clone())
    }

    pub fn settlement(&self) -> SettlementBatchRunner {
        SettlementBatchRunner::new(self.ctx.clone())
    }

    pub fn payouts(&self) -> PayoutEngine {
        PayoutEngine::new(self.ctx.clone(), self.rail.clone(), self.policy.clone())
    }

    pub fn recovery(&self) -> StaleRecovery {
        StaleRecovery::new(self.ctx.clone())
    }

    pub async fn snapshot(&self) -> MemSnapshot {
        self.store.snapshot().await
    }

    pub async fn audit_events(&self) -> Vec<AuditEvent> {
        self.audit.events().await
    }

    /// Action names in append order, for compact assertions.
    pub async fn audit_actions(&self) -> Vec<String> {
        self.audit
            .events()
            .await
            .into_iter()
            .map(|e| e.action)
            .collect()
    }

    pub async fn seed_partner(&self, category: PartnerCategory) -> Result<Partner> {
        self.seed_partner_with(PartnerSeed::new(category)).await
    }

    pub async fn seed_partner_with(&self, seed: PartnerSeed) -> Result<Partner> {
        let partner = seed.build(self.now());
        let mut uow = self.store.begin().await?;
        uow.insert_partner(&partner).await?;
        uow.commit().await?;
        Ok(partner)
    }

    /// Inserted directly, without compliance checks, valid for thirty days
    /// either side of now.
    pub async fn seed_offer(&self, partner_id: Uuid, structure: CommissionStructure) -> Result<Offer> {
        let now = self.now();
        let offer = Offer {
            id: Uuid::new_v4(),
            partner_id,
            name: format!("offer {}", structure.kind_str()),
            commission_structure: structure,
            valid_from: now - Duration::days(30),
            valid_to: now + Duration::days(30),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        let mut uow = self.store.begin().await?;
        uow.insert_offer(&offer).await?;
        uow.commit().await?;
        Ok(offer)
    }

    pub async fn seed_link(&self, partner_id: Uuid, offer_id: Uuid) -> Result<AffiliateLink> {
        let link = AffiliateLink {
            id: Uuid::new_v4(),
            partner_id,
            offer_id,
            tracking_code: format!("trk-{}", Uuid::new_v4().simple()),
            is_active: true,
        };
        let mut uow = self.store.begin().await?;
        uow.insert_link(&link).await?;
        uow.commit().await?;
        Ok(link)
    }

    /// Partner, offer and link in one go.
    pub async fn seed_funnel(
        &self,
        category: PartnerCategory,
        rate_override: Option<Decimal>,
        structure: CommissionStructure,
    ) -> Result<(Partner, Offer, AffiliateLink)> {
        let partner = self
            .seed_partner_with(PartnerSeed::new(category).rate_override(rate_override))
            .await?;
        let offer = self.seed_offer(partner.id, structure).await?;
        let link = self.seed_link(partner.id, offer.id).await?;
        Ok((partner, offer, link))
    }

    pub async fn seed_earning(&self, seed: EarningSeed) -> Result<Earning> {
        let earning = seed.build(self.now());
        let mut uow = self.store.begin().await?;
        uow.insert_earning(&earning).await?;
        uow.commit().await?;
        Ok(earning)
    }

    /// `amounts` become earnings of one partner in USD, oldest first, one
    /// minute apart.
    pub async fn seed_earnings(
        &self,
        partner_id: Uuid,
        offer_id: Uuid,
        amounts: &[Money],
        status: EarningStatus,
    ) -> Result<Vec<Earning>> {
        let base = self.now() - Duration::days(2);
        let mut out = Vec::with_capacity(amounts.len());
        for (i, amount) in amounts.iter().enumerate() {
            let seed = EarningSeed::new(partner_id, offer_id, *amount)
                .status(status)
                .at(base + Duration::minutes(i as i64));
            out.push(self.seed_earning(seed).await?);
        }
        Ok(out)
    }

    pub async fn convert(&self, link_id: Uuid, booking_value: Money, currency: &str) -> EngineResult<Earning> {
        self.ledger()
            .record_conversion(
                ConversionDetails {
                    link_id,
                    booking_value,
                    currency: currency.to_string(),
                    booking_id: Some(format!("bk-{}", Uuid::new_v4().simple())),
                    transaction_date: None,
                },
                "tracker",
            )
            .await
    }
}

/// Contact metadata carrying a rail account id under the default key.
pub fn contact_with_account(account: &str) -> serde_json::Value {
    json!({ "payment_account_id": account, "email": "payouts@partner.test" })
}
