//! Invoices for bank-style payouts. Numbers are `INV-YYYYMM-NNNN`,
//! restarting at 0001 every calendar month (UTC).

use chrono::{DateTime, Datelike, TimeZone, Utc};
use uuid::Uuid;

use afl_db::UnitOfWork;
use afl_schemas::{Earning, Invoice, InvoiceLineItem, InvoiceStatus, Payout};

use crate::error::{EngineError, EngineResult};

pub fn month_start(now: DateTime<Utc>) -> EngineResult<DateTime<Utc>> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .ok_or_else(|| EngineError::Validation(format!("no month start for {now}")))
}

pub fn format_invoice_number(now: DateTime<Utc>, seq: i64) -> String {
    format!("INV-{}-{:04}", now.format("%Y%m"), seq)
}

fn line_item(e: &Earning) -> InvoiceLineItem {
    let reference = e
        .booking_id
        .clone()
        .unwrap_or_else(|| e.id.to_string());
    InvoiceLineItem {
        earning_id: e.id,
        description: format!(
            "commission on booking {reference} ({}, {})",
            e.transaction_date.format("%Y-%m-%d"),
            e.status.as_str()
        ),
        amount: e.amount_earned,
    }
}

/// Number and insert the invoice for `payout`. Line items are the earnings
/// the payout draws on.
pub(crate) async fn issue_invoice(
    uow: &mut dyn UnitOfWork,
    payout: &Payout,
    payable: &[Earning],
    now: DateTime<Utc>,
) -> EngineResult<Invoice> {
    let seq = uow.count_invoices_since(month_start(now)?).await? + 1;
    let invoice = Invoice {
        id: Uuid::new_v4(),
        partner_id: payout.partner_id,
        payout_id: payout.id,
        invoice_number: format_invoice_number(now, seq),
        line_items: payable.iter().map(line_item).collect(),
        amount_due: payout.amount,
        currency: payout.currency.clone(),
        status: InvoiceStatus::Issued,
        issued_at: now,
    };
    uow.insert_invoice(&invoice).await?;
    Ok(invoice)
}
