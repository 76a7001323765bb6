//! Scenario: recovery after a process died mid-settlement.
//!
//! Validates:
//! 1) A batch and a payout left in PROCESSING, plus the sweep lock of the
//!    dead process, are left alone while younger than the threshold.
//! 2) Once stale, recovery fails both rows, releases the lock and audits
//!    each change as recovered.
//! 3) The earnings behind the abandoned payout are still payable, and a
//!    fresh payout request for them succeeds.
//! 4) After recovery a scheduled sweep can take the lock again.

use afl_db::{JobLock, Store};
use afl_engine::{PayoutRequest, Trigger};
use afl_schemas::{
    BatchStatus, CommissionBatch, CommissionStructure, EarningStatus, Money, PartnerCategory,
    PaymentMethod, Payout, PayoutStatus,
};
use afl_testkit::Harness;
use chrono::Duration;
use rust_decimal_macros::dec;
use uuid::Uuid;

fn money(s: &str) -> Money {
    Money::parse(s).unwrap()
}

#[tokio::test]
async fn stale_processing_work_is_failed_and_unlocked() {
    let h = Harness::new();
    let partner = h.seed_partner(PartnerCategory::ECommerce).await.unwrap();
    let offer = h
        .seed_offer(partner.id, CommissionStructure::Percentage { value: dec!(10) })
        .await
        .unwrap();
    let earnings = h
        .seed_earnings(partner.id, offer.id, &[money("80.00")], EarningStatus::Confirmed)
        .await
        .unwrap();

    let t0 = h.now();
    let batch = CommissionBatch {
        id: Uuid::new_v4(),
        batch_date: t0.date_naive(),
        total_commissions: Money::ZERO,
        processed_count: 0,
        skipped_count: 0,
        status: BatchStatus::Processing,
        error_message: None,
        started_at: t0,
        completed_at: None,
    };
    let payout = Payout {
        id: Uuid::new_v4(),
        partner_id: partner.id,
        amount: money("80.00"),
        currency: "USD".into(),
        status: PayoutStatus::Processing,
        payment_method: PaymentMethod::Paypal,
        invoice_id: None,
        transaction_id: None,
        failure_reason: None,
        requested_at: t0,
        processed_at: Some(t0),
        payout_date: None,
    };
    let mut uow = h.store.begin().await.unwrap();
    uow.insert_batch(&batch).await.unwrap();
    uow.insert_payout(&payout).await.unwrap();
    uow.commit().await.unwrap();
    assert!(h.store.try_acquire("payout-sweep", "pid:dead", t0).await.unwrap());

    let recovery = h.recovery();
    h.advance(Duration::minutes(10));
    assert!(recovery
        .recover_stale_processing(Duration::minutes(30))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(h.store.held_locks().await, vec!["payout-sweep".to_string()]);

    h.advance(Duration::hours(1));
    let report = recovery
        .recover_stale_processing(Duration::minutes(30))
        .await
        .unwrap();
    assert_eq!(report.failed_batches, vec![batch.id]);
    assert_eq!(report.failed_payouts, vec![payout.id]);
    assert_eq!(report.released_locks, vec!["payout-sweep".to_string()]);

    let snap = h.snapshot().await;
    assert_eq!(snap.batches[&batch.id].status, BatchStatus::Failed);
    let failed = &snap.payouts[&payout.id];
    assert_eq!(failed.status, PayoutStatus::Failed);
    assert!(failed.failure_reason.is_some());
    assert_eq!(snap.earnings[&earnings[0].id].status, EarningStatus::Confirmed);

    let events = h.audit_events().await;
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.payload["recovered"] == true));

    let engine = h.payouts();
    let retry = engine
        .request_payout(
            PayoutRequest {
                partner_id: partner.id,
                amount: money("80.00"),
                currency: "USD".into(),
                method: PaymentMethod::Paypal,
            },
            "partner",
        )
        .await
        .unwrap();
    let sweep = engine.settle_pending_payouts(Trigger::Scheduled).await.unwrap();
    assert_eq!(sweep.paid, vec![retry.payout.id]);
    assert!(sweep.errors.is_empty());
    assert!(h.store.held_locks().await.is_empty());
}
