//! Conversion intake, earning lifecycle and the partner report.

use anyhow::Result;
use clap::{Args, Subcommand};

use afl_db::EarningFilter;
use afl_engine::{ConversionDetails, EarningLedger};
use afl_schemas::EarningStatus;

use super::{parse_instant, parse_money, parse_uuid, print_json, GlobalArgs};

#[derive(Subcommand)]
pub enum ConversionCmd {
    /// Record a tracked booking as a PENDING earning
    Record {
        #[arg(long)]
        link_id: String,

        #[arg(long)]
        booking_value: String,

        #[arg(long, default_value = "USD")]
        currency: String,

        #[arg(long)]
        booking_id: Option<String>,

        /// Defaults to now
        #[arg(long)]
        transaction_date: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum EarningCmd {
    /// Move an earning along its lifecycle (PENDING|CONFIRMED|PAID|CANCELLED)
    Status {
        #[arg(long)]
        earning_id: String,

        #[arg(long)]
        to: String,

        #[arg(long)]
        reason: String,
    },

    /// Add a signed correction to an unpaid earning
    Adjust {
        #[arg(long)]
        earning_id: String,

        /// e.g. -12.50 for a clawback
        #[arg(long, allow_hyphen_values = true)]
        delta: String,

        #[arg(long)]
        reason: String,
    },
}

#[derive(Args)]
pub struct ReportArgs {
    #[arg(long)]
    pub partner_id: String,

    #[arg(long)]
    pub status: Option<String>,

    #[arg(long)]
    pub currency: Option<String>,

    /// Inclusive, YYYY-MM-DD or RFC 3339
    #[arg(long)]
    pub from: Option<String>,

    /// Exclusive, YYYY-MM-DD or RFC 3339
    #[arg(long)]
    pub to: Option<String>,
}

pub async fn run_conversion(global: &GlobalArgs, cmd: ConversionCmd) -> Result<()> {
    let ConversionCmd::Record {
        link_id,
        booking_value,
        currency,
        booking_id,
        transaction_date,
    } = cmd;
    let details = ConversionDetails {
        link_id: parse_uuid(&link_id, "link_id")?,
        booking_value: parse_money(&booking_value, "booking value")?,
        currency: currency.trim().to_uppercase(),
        booking_id,
        transaction_date: transaction_date.as_deref().map(parse_instant).transpose()?,
    };

    let wired = global.connect().await?;
    let earning = EarningLedger::new(wired.ctx.clone())
        .record_conversion(details, &global.actor())
        .await?;
    print_json(&earning)
}

pub async fn run_earning(global: &GlobalArgs, cmd: EarningCmd) -> Result<()> {
    let wired = global.connect().await?;
    let ledger = EarningLedger::new(wired.ctx.clone());
    let actor = global.actor();

    let earning = match cmd {
        EarningCmd::Status {
            earning_id,
            to,
            reason,
        } => {
            let to = EarningStatus::parse(to.trim().to_uppercase().as_str())?;
            ledger
                .update_status(parse_uuid(&earning_id, "earning_id")?, to, &reason, &actor)
                .await?
        }
        EarningCmd::Adjust {
            earning_id,
            delta,
            reason,
        } => {
            ledger
                .apply_adjustment(
                    parse_uuid(&earning_id, "earning_id")?,
                    parse_money(&delta, "delta")?,
                    &reason,
                    &actor,
                )
                .await?
        }
    };
    print_json(&earning)
}

pub async fn report(global: &GlobalArgs, args: ReportArgs) -> Result<()> {
    let filter = EarningFilter {
        status: args
            .status
            .as_deref()
            .map(|s| EarningStatus::parse(s.trim().to_uppercase().as_str()))
            .transpose()?,
        currency: args.currency.map(|c| c.trim().to_uppercase()),
        from: args.from.as_deref().map(parse_instant).transpose()?,
        to: args.to.as_deref().map(parse_instant).transpose()?,
    };
    let partner_id = parse_uuid(&args.partner_id, "partner_id")?;

    let wired = global.connect().await?;
    let report = EarningLedger::new(wired.ctx.clone())
        .get_conversion_report(partner_id, filter)
        .await?;
    print_json(&report)
}
