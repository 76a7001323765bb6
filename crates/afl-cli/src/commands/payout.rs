//! `afl payout ...`: request, settle, sweep and cancel.

use anyhow::Result;
use clap::Subcommand;

use afl_engine::{PayoutRequest, Trigger};
use afl_schemas::{PaymentMethod, PayoutStatus};

use super::{parse_money, parse_uuid, print_json, GlobalArgs};

#[derive(Subcommand)]
pub enum PayoutCmd {
    /// Request a payout against the partner's payable balance
    Request {
        #[arg(long)]
        partner_id: String,

        #[arg(long)]
        amount: String,

        #[arg(long, default_value = "USD")]
        currency: String,

        /// bank_transfer | wire_transfer | ach | paypal | wallet
        #[arg(long)]
        method: String,
    },

    /// Send one PENDING payout through the payment rail
    Settle {
        #[arg(long)]
        payout_id: String,
    },

    /// Settle every PENDING payout, oldest first
    Sweep,

    /// Cancel a PENDING payout and void its invoice
    Cancel {
        #[arg(long)]
        payout_id: String,

        #[arg(long)]
        reason: String,
    },
}

pub async fn run(global: &GlobalArgs, cmd: PayoutCmd) -> Result<()> {
    let wired = global.connect().await?;
    let engine = wired.payouts();
    let actor = global.actor();

    match cmd {
        PayoutCmd::Request {
            partner_id,
            amount,
            currency,
            method,
        } => {
            let req = PayoutRequest {
                partner_id: parse_uuid(&partner_id, "partner_id")?,
                amount: parse_money(&amount, "amount")?,
                currency: currency.trim().to_uppercase(),
                method: PaymentMethod::parse(method.trim())?,
            };
            let receipt = engine.request_payout(req, &actor).await?;
            print_json(&receipt)?;
        }
        PayoutCmd::Settle { payout_id } => {
            let payout = engine
                .settle_payout(parse_uuid(&payout_id, "payout_id")?, &actor)
                .await?;
            print_json(&payout)?;
            if payout.status == PayoutStatus::Failed {
                anyhow::bail!(
                    "payout {} FAILED: {}",
                    payout.id,
                    payout.failure_reason.unwrap_or_default()
                );
            }
        }
        PayoutCmd::Sweep => {
            let report = engine.settle_pending_payouts(Trigger::Manual).await?;
            print_json(&report)?;
        }
        PayoutCmd::Cancel { payout_id, reason } => {
            let payout = engine
                .cancel_payout(parse_uuid(&payout_id, "payout_id")?, &reason, &actor)
                .await?;
            print_json(&payout)?;
        }
    }
    Ok(())
}
