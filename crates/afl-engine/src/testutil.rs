//! Shared fixture for the engine's unit tests: in-memory store, memory audit
//! sink, fixed clock, paper rail.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

use afl_audit::MemoryAuditSink;
use afl_db::{MemStore, Store};
use afl_rail::PaperRail;
use afl_schemas::{
    AffiliateLink, CommissionStructure, Earning, EarningStatus, Money, Offer, Partner,
    PartnerCategory,
};

use crate::clock::{Clock, FixedClock};
use crate::ledger::{ConversionDetails, EarningLedger};
use crate::payout::{PayoutEngine, PayoutPolicy};
use crate::EngineContext;

pub const DEFAULT_PARTNER: Uuid = Uuid::from_u128(0xA11);
pub const DEFAULT_OFFER: Uuid = Uuid::from_u128(0x0FF);

pub struct Fixture {
    pub store: MemStore,
    pub audit: Arc<MemoryAuditSink>,
    pub clock: Arc<FixedClock>,
    pub rail: Arc<PaperRail>,
    pub ctx: EngineContext,
    seq: AtomicI64,
}

impl Fixture {
    pub fn new() -> Self {
        let store = MemStore::new();
        let audit = Arc::new(MemoryAuditSink::new());
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap(),
        ));
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
            seq: AtomicI64::new(0),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn next(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn ledger(&self) -> EarningLedger {
        EarningLedger::new(self.ctx.clone())
    }

    pub fn payouts(&self, minimum: &str) -> PayoutEngine {
        let policy = PayoutPolicy {
            minimum_amount: Money::parse(minimum).unwrap(),
            ..PayoutPolicy::default()
        };
        PayoutEngine::new(self.ctx.clone(), self.rail.clone(), policy)
    }

    pub async fn partner(&self, category: PartnerCategory, rate_override: Option<Decimal>) -> Partner {
        let n = self.next();
        let p = Partner {
            id: Uuid::new_v4(),
            name: format!("partner-{n}"),
            category,
            commission_rate_override: rate_override,
            is_active: true,
            contact_metadata: json!({"payment_account_id": format!("acct_{n}")}),
            created_at: self.now(),
        };
        self.insert_partner(&p).await;
        p
    }

    async fn insert_partner(&self, p: &Partner) {
        let mut uow = self.store.begin().await.unwrap();
        uow.insert_partner(p).await.unwrap();
        uow.commit().await.unwrap();
    }

    pub async fn deactivate_partner(&self, id: Uuid) {
        let mut uow = self.store.begin().await.unwrap();
        let mut p = uow.partner(id).await.unwrap().unwrap();
        p.is_active = false;
        uow.save_partner(&p).await.unwrap();
        uow.commit().await.unwrap();
    }

    pub async fn offer(&self, partner_id: Uuid, structure: CommissionStructure) -> Offer {
        let o = Offer {
            id: Uuid::new_v4(),
            partner_id,
            name: format!("offer-{}", self.next()),
            commission_structure: structure,
            valid_from: self.now() - Duration::days(30),
            valid_to: self.now() + Duration::days(30),
            is_active: true,
            created_at: self.now(),
            updated_at: self.now(),
        };
        let mut uow = self.store.begin().await.unwrap();
        uow.insert_offer(&o).await.unwrap();
        uow.commit().await.unwrap();
        o
    }

    pub async fn link(&self, partner_id: Uuid, offer_id: Uuid) -> AffiliateLink {
        let l = AffiliateLink {
            id: Uuid::new_v4(),
            partner_id,
            offer_id,
            tracking_code: format!("trk-{}", self.next()),
            is_active: true,
        };
        let mut uow = self.store.begin().await.unwrap();
        uow.insert_link(&l).await.unwrap();
        uow.commit().await.unwrap();
        l
    }

    pub fn conversion(&self, link_id: Uuid, value: &str, currency: &str) -> ConversionDetails {
        ConversionDetails {
            link_id,
            booking_value: Money::parse(value).unwrap(),
            currency: currency.into(),
            booking_id: None,
            transaction_date: None,
        }
    }

    async fn ensure_default_partner(&self) {
        let mut uow = self.store.begin().await.unwrap();
        if uow.partner(DEFAULT_PARTNER).await.unwrap().is_some() {
            return;
        }
        uow.insert_partner(&Partner {
            id: DEFAULT_PARTNER,
            name: "default".into(),
            category: PartnerCategory::Accommodation,
            commission_rate_override: None,
            is_active: true,
            contact_metadata: json!({"payment_account_id": "acct_default"}),
            created_at: self.now(),
        })
        .await
        .unwrap();
        uow.insert_offer(&Offer {
            id: DEFAULT_OFFER,
            partner_id: DEFAULT_PARTNER,
            name: "default".into(),
            commission_structure: CommissionStructure::Percentage { value: dec!(10) },
            valid_from: self.now() - Duration::days(30),
            valid_to: self.now() + Duration::days(30),
            is_active: true,
            created_at: self.now(),
            updated_at: self.now(),
        })
        .await
        .unwrap();
        uow.commit().await.unwrap();
    }

    /// Earning of the default partner in USD. Booking value is ten times the
    /// amount so a settlement recomputation agrees with it.
    pub async fn seed_earning(&self, amount: &str, status: EarningStatus) -> Earning {
        self.ensure_default_partner().await;
        self.seed_earning_for(DEFAULT_PARTNER, DEFAULT_OFFER, amount, "USD", status)
            .await
    }

    pub async fn seed_earning_for(
        &self,
        partner_id: Uuid,
        offer_id: Uuid,
        amount: &str,
        currency: &str,
        status: EarningStatus,
    ) -> Earning {
        let n = self.next();
        let amount = Money::parse(amount).unwrap();
        let at = self.now() - Duration::days(1) + Duration::seconds(n);
        let e = Earning {
            id: Uuid::new_v4(),
            partner_id,
            offer_id,
            link_id: None,
            booking_id: Some(format!("bk-{n}")),
            booking_value: Money::from_decimal(amount.amount() * dec!(10)),
            amount_earned: amount,
            currency: currency.into(),
            status,
            notes: vec![],
            transaction_date: at,
            split_from: None,
            created_at: at,
            updated_at: at,
        };
        let mut uow = self.store.begin().await.unwrap();
        uow.insert_earning(&e).await.unwrap();
        uow.commit().await.unwrap();
        e
    }
}
