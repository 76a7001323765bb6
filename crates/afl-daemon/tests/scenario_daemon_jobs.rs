//! Scenario: the scheduler's job ticks over the in-memory store.
//!
//! Validates:
//! 1) A settlement tick confirms PENDING earnings and returns the batch.
//! 2) A settlement tick while the day's lock is held returns nothing, does
//!    not error and leaves the earnings PENDING.
//! 3) A payout tick settles requested payouts through the rail.
//! 4) A recovery tick fails a payout stuck in PROCESSING and releases the
//!    dead process's lock.
//! 5) The loops stop once shutdown is signalled.

use std::sync::Arc;

use afl_config::EngineConfig;
use afl_daemon::jobs::{spawn_all, Jobs};
use afl_db::{JobLock, Store};
use afl_engine::{settlement::lock_key, PayoutRequest};
use afl_schemas::{
    CommissionStructure, EarningStatus, Money, PartnerCategory, PaymentMethod, PayoutStatus,
};
use afl_testkit::{EarningSeed, Harness};
use chrono::Duration;
use rust_decimal_macros::dec;
use tokio::sync::watch;

fn money(s: &str) -> Money {
    Money::parse(s).unwrap()
}

fn jobs_for(h: &Harness) -> Jobs {
    Jobs::new(h.ctx.clone(), h.rail.clone(), EngineConfig::default())
}

#[tokio::test]
async fn settlement_tick_confirms_and_backs_off_when_locked() {
    let h = Harness::new();
    let (partner, offer, _) = h
        .seed_funnel(
            PartnerCategory::TourOperator,
            None,
            CommissionStructure::Percentage { value: dec!(10) },
        )
        .await
        .unwrap();
    let jobs = jobs_for(&h);
    let today = h.now().date_naive();

    h.store
        .try_acquire(&lock_key(today), "pid:other", h.now())
        .await
        .unwrap();
    let seeded = h
        .seed_earnings(
            partner.id,
            offer.id,
            &[money("40.00"), money("30.00")],
            EarningStatus::Pending,
        )
        .await
        .unwrap();
    assert!(jobs.settlement_tick(today).await.is_none());
    let mut uow = h.store.begin().await.unwrap();
    let still = uow.earning(seeded[0].id).await.unwrap().unwrap();
    drop(uow);
    assert_eq!(still.status, EarningStatus::Pending);

    h.store.release(&lock_key(today)).await.unwrap();
    let batch = jobs.settlement_tick(today).await.expect("batch ran");
    assert_eq!(batch.processed_count, 2);
    assert_eq!(batch.total_commissions, money("70.00"));
}

#[tokio::test]
async fn payout_tick_settles_requested_payouts() {
    let h = Harness::new();
    let partner = h.seed_partner(PartnerCategory::Accommodation).await.unwrap();
    let offer = h
        .seed_offer(partner.id, CommissionStructure::Percentage { value: dec!(10) })
        .await
        .unwrap();
    h.seed_earning(
        EarningSeed::new(partner.id, offer.id, money("120.00")).status(EarningStatus::Confirmed),
    )
    .await
    .unwrap();
    let receipt = h
        .payouts()
        .request_payout(
            PayoutRequest {
                partner_id: partner.id,
                amount: money("120.00"),
                currency: "USD".into(),
                method: PaymentMethod::Paypal,
            },
            "partner",
        )
        .await
        .unwrap();

    let report = jobs_for(&h).payout_tick().await;
    assert_eq!(report.paid, vec![receipt.payout.id]);
    assert!(report.failed.is_empty());
}

#[tokio::test]
async fn recovery_tick_fails_stuck_payouts() {
    let h = Harness::new();
    let partner = h.seed_partner(PartnerCategory::Accommodation).await.unwrap();
    let offer = h
        .seed_offer(partner.id, CommissionStructure::Percentage { value: dec!(10) })
        .await
        .unwrap();
    h.seed_earning(
        EarningSeed::new(partner.id, offer.id, money("90.00")).status(EarningStatus::Confirmed),
    )
    .await
    .unwrap();
    let receipt = h
        .payouts()
        .request_payout(
            PayoutRequest {
                partner_id: partner.id,
                amount: money("90.00"),
                currency: "USD".into(),
                method: PaymentMethod::Wallet,
            },
            "partner",
        )
        .await
        .unwrap();

    // A process died after moving the payout to PROCESSING.
    let mut uow = h.store.begin().await.unwrap();
    let mut payout = uow.payout(receipt.payout.id).await.unwrap().unwrap();
    payout.status = PayoutStatus::Processing;
    payout.processed_at = Some(h.now());
    uow.save_payout(&payout).await.unwrap();
    uow.commit().await.unwrap();
    h.store
        .try_acquire("payout-sweep", "pid:dead", h.now())
        .await
        .unwrap();

    h.advance(Duration::hours(2));
    let report = jobs_for(&h).recovery_tick().await.expect("recovery ran");
    assert_eq!(report.failed_payouts, vec![receipt.payout.id]);
    assert_eq!(report.released_locks, vec!["payout-sweep".to_string()]);
}

#[tokio::test]
async fn loops_stop_on_shutdown() {
    let h = Harness::new();
    let (stop_tx, stop_rx) = watch::channel(false);
    let handles = spawn_all(Arc::new(jobs_for(&h)), stop_rx).unwrap();
    stop_tx.send(true).unwrap();
    for handle in handles {
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("loop stopped")
            .unwrap();
    }
}
