//! Scenario: a mutation whose audit event cannot be written does not happen.
//!
//! Validates:
//! 1) Recording a conversion with the audit sink down returns an Audit error
//!    and leaves no earning behind.
//! 2) A status change with the sink down leaves the earning as it was,
//!    notes included.
//! 3) A payout request with the sink down leaves no payout and no invoice,
//!    so the next invoice number is still 0001.
//! 4) A manual batch with the sink down creates no batch row and releases
//!    its lock.

use afl_engine::{EngineError, ErrorKind, PayoutRequest, Trigger};
use afl_schemas::{CommissionStructure, EarningStatus, Money, PartnerCategory, PaymentMethod};
use afl_testkit::Harness;
use rust_decimal_macros::dec;

fn money(s: &str) -> Money {
    Money::parse(s).unwrap()
}

#[tokio::test]
async fn no_audit_no_mutation() {
    let h = Harness::new();
    let (partner, _, link) = h
        .seed_funnel(
            PartnerCategory::Accommodation,
            None,
            CommissionStructure::Percentage { value: dec!(12) },
        )
        .await
        .unwrap();
    let kept = h.convert(link.id, money("1000.00"), "USD").await.unwrap();

    h.audit.set_fail(true);

    let err = h.convert(link.id, money("500.00"), "USD").await.unwrap_err();
    assert!(matches!(err, EngineError::Audit(_)));
    assert_eq!(err.kind(), ErrorKind::Infrastructure);
    assert_eq!(h.snapshot().await.earnings.len(), 1);

    let err = h
        .ledger()
        .update_status(kept.id, EarningStatus::Confirmed, "manual review", "ops")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Audit(_)));
    assert_eq!(h.snapshot().await.earnings[&kept.id], kept);

    let err = h
        .payouts()
        .request_payout(
            PayoutRequest {
                partner_id: partner.id,
                amount: money("100.00"),
                currency: "USD".into(),
                method: PaymentMethod::BankTransfer,
            },
            "partner",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Audit(_)));
    let snap = h.snapshot().await;
    assert!(snap.payouts.is_empty());
    assert!(snap.invoices.is_empty());

    let err = h
        .settlement()
        .run_batch(h.now().date_naive(), Trigger::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Audit(_)));
    assert!(h.snapshot().await.batches.is_empty());
    assert!(h.store.held_locks().await.is_empty());

    h.audit.set_fail(false);
    let receipt = h
        .payouts()
        .request_payout(
            PayoutRequest {
                partner_id: partner.id,
                amount: money("100.00"),
                currency: "USD".into(),
                method: PaymentMethod::BankTransfer,
            },
            "partner",
        )
        .await
        .unwrap();
    assert_eq!(
        receipt.invoice.map(|i| i.invoice_number),
        Some("INV-202506-0001".to_string())
    );
    assert_eq!(h.audit_actions().await.len(), 3);
}
