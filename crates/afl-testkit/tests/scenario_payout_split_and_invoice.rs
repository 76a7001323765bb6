//! Scenario: payout request, settlement and the earning split.
//!
//! Validates:
//! 1) Earnings of 70.00 and 80.00 paid by a 100.00 payout: the older one is
//!    PAID whole, the newer one is cut to a 30.00 PAID row plus a 50.00
//!    CONFIRMED sibling pointing back at it. The partner total is conserved.
//! 2) A 25.00 request against a 50.00 minimum is refused with BelowMinimum
//!    and writes nothing.
//! 3) Bank-style payouts get invoices numbered INV-YYYYMM-NNNN that restart
//!    at 0001 in a new month; the invoice is PAID with its payout.
//! 4) A rail refusal leaves the payout FAILED with the reason recorded and
//!    the earnings untouched.
//! 5) Cancelling a PENDING payout voids its invoice; a settled payout cannot
//!    be cancelled.

use afl_engine::{EngineError, PayoutRequest};
use afl_schemas::{
    CommissionStructure, EarningStatus, InvoiceStatus, Money, PartnerCategory, PaymentMethod,
    PayoutStatus,
};
use afl_testkit::Harness;
use chrono::Duration;
use rust_decimal_macros::dec;
use uuid::Uuid;

fn money(s: &str) -> Money {
    Money::parse(s).unwrap()
}

fn request(partner_id: Uuid, amount: &str, method: PaymentMethod) -> PayoutRequest {
    PayoutRequest {
        partner_id,
        amount: money(amount),
        currency: "USD".into(),
        method,
    }
}

async fn partner_with_offer(h: &Harness) -> (Uuid, Uuid) {
    let partner = h.seed_partner(PartnerCategory::Accommodation).await.unwrap();
    let offer = h
        .seed_offer(partner.id, CommissionStructure::Percentage { value: dec!(10) })
        .await
        .unwrap();
    (partner.id, offer.id)
}

#[tokio::test]
async fn partial_payout_splits_the_boundary_earning() {
    let h = Harness::new();
    let (partner_id, offer_id) = partner_with_offer(&h).await;
    let seeded = h
        .seed_earnings(
            partner_id,
            offer_id,
            &[money("70.00"), money("80.00")],
            EarningStatus::Confirmed,
        )
        .await
        .unwrap();

    let engine = h.payouts();
    let receipt = engine
        .request_payout(request(partner_id, "100.00", PaymentMethod::Paypal), "partner")
        .await
        .unwrap();
    assert!(receipt.invoice.is_none());
    assert_eq!(receipt.payout.status, PayoutStatus::Pending);

    let paid = engine.settle_payout(receipt.payout.id, "ops").await.unwrap();
    assert_eq!(paid.status, PayoutStatus::Paid);
    assert!(paid.transaction_id.is_some());
    assert_eq!(h.rail.transfers().await.len(), 1);

    let snap = h.snapshot().await;
    let first = &snap.earnings[&seeded[0].id];
    assert_eq!(first.status, EarningStatus::Paid);
    assert_eq!(first.amount_earned, money("70.00"));

    let second = &snap.earnings[&seeded[1].id];
    assert_eq!(second.status, EarningStatus::Paid);
    assert_eq!(second.amount_earned, money("30.00"));

    let sibling = snap
        .earnings
        .values()
        .find(|e| e.split_from == Some(seeded[1].id))
        .expect("remainder row");
    assert_eq!(sibling.status, EarningStatus::Confirmed);
    assert_eq!(sibling.amount_earned, money("50.00"));
    assert_eq!(sibling.booking_id, seeded[1].booking_id);

    let total: Money = snap
        .earnings_of(partner_id)
        .iter()
        .map(|e| e.amount_earned)
        .sum();
    assert_eq!(total, money("150.00"));

    let actions = h.audit_actions().await;
    assert!(actions.contains(&"EARNING_SPLIT".to_string()));
    assert_eq!(actions.last().map(String::as_str), Some("PAYOUT_PAID"));
}

#[tokio::test]
async fn request_below_minimum_is_refused() {
    let h = Harness::new().with_minimum_payout(money("50.00"));
    let (partner_id, offer_id) = partner_with_offer(&h).await;
    h.seed_earnings(partner_id, offer_id, &[money("200.00")], EarningStatus::Confirmed)
        .await
        .unwrap();

    let err = h
        .payouts()
        .request_payout(request(partner_id, "25.00", PaymentMethod::Paypal), "partner")
        .await
        .unwrap_err();
    match err {
        EngineError::BelowMinimum { requested, minimum } => {
            assert_eq!(requested, money("25.00"));
            assert_eq!(minimum, money("50.00"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(h.snapshot().await.payouts.is_empty());
    assert!(h.audit_actions().await.is_empty());
}

#[tokio::test]
async fn invoice_numbers_restart_each_month() {
    let h = Harness::new();
    let (partner_id, offer_id) = partner_with_offer(&h).await;
    h.seed_earnings(
        partner_id,
        offer_id,
        &[money("120.00"), money("90.00")],
        EarningStatus::Confirmed,
    )
    .await
    .unwrap();
    let engine = h.payouts();

    let a = engine
        .request_payout(request(partner_id, "60.00", PaymentMethod::BankTransfer), "partner")
        .await
        .unwrap();
    let b = engine
        .request_payout(request(partner_id, "60.00", PaymentMethod::WireTransfer), "partner")
        .await
        .unwrap();
    let a_inv = a.invoice.expect("bank transfer invoice");
    assert_eq!(a_inv.invoice_number, "INV-202506-0001");
    assert_eq!(b.invoice.expect("wire invoice").invoice_number, "INV-202506-0002");
    assert_eq!(a_inv.amount_due, money("60.00"));
    assert_eq!(a_inv.line_items.len(), 2);
    assert_eq!(a.payout.invoice_id, Some(a_inv.id));

    h.advance(Duration::days(20));
    let c = engine
        .request_payout(request(partner_id, "60.00", PaymentMethod::Ach), "partner")
        .await
        .unwrap();
    assert_eq!(c.invoice.expect("ach invoice").invoice_number, "INV-202507-0001");

    engine.settle_payout(a.payout.id, "ops").await.unwrap();
    let snap = h.snapshot().await;
    assert_eq!(snap.invoices[&a_inv.id].status, InvoiceStatus::Paid);
}

#[tokio::test]
async fn rail_refusal_fails_payout_without_touching_earnings() {
    let h = Harness::new();
    let (partner_id, offer_id) = partner_with_offer(&h).await;
    let seeded = h
        .seed_earnings(partner_id, offer_id, &[money("100.00")], EarningStatus::Confirmed)
        .await
        .unwrap();
    h.rail.reject_with("account_closed", "destination closed").await;

    let engine = h.payouts();
    let receipt = engine
        .request_payout(request(partner_id, "100.00", PaymentMethod::Paypal), "partner")
        .await
        .unwrap();
    let failed = engine.settle_payout(receipt.payout.id, "ops").await.unwrap();
    assert_eq!(failed.status, PayoutStatus::Failed);
    assert!(failed
        .failure_reason
        .as_deref()
        .unwrap_or_default()
        .contains("account_closed"));

    let snap = h.snapshot().await;
    assert_eq!(snap.earnings[&seeded[0].id].status, EarningStatus::Confirmed);
    assert_eq!(snap.payouts[&receipt.payout.id].status, PayoutStatus::Failed);

    let err = engine.settle_payout(receipt.payout.id, "ops").await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
}

#[tokio::test]
async fn cancel_voids_invoice_and_only_applies_to_pending() {
    let h = Harness::new();
    let (partner_id, offer_id) = partner_with_offer(&h).await;
    h.seed_earnings(partner_id, offer_id, &[money("300.00")], EarningStatus::Confirmed)
        .await
        .unwrap();
    let engine = h.payouts();

    let to_cancel = engine
        .request_payout(request(partner_id, "100.00", PaymentMethod::BankTransfer), "partner")
        .await
        .unwrap();
    let cancelled = engine
        .cancel_payout(to_cancel.payout.id, "partner changed bank details", "ops")
        .await
        .unwrap();
    assert_eq!(cancelled.status, PayoutStatus::Cancelled);
    let invoice_id = to_cancel.invoice.expect("invoice").id;
    assert_eq!(h.snapshot().await.invoices[&invoice_id].status, InvoiceStatus::Void);

    let settled = engine
        .request_payout(request(partner_id, "100.00", PaymentMethod::Paypal), "partner")
        .await
        .unwrap();
    engine.settle_payout(settled.payout.id, "ops").await.unwrap();
    let err = engine
        .cancel_payout(settled.payout.id, "too late", "ops")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
}
