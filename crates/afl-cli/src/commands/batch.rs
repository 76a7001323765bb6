//! `afl batch ...`: manual settlement trigger. Errors, including a held
//! lock, surface as a non-zero exit.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::Subcommand;

use afl_engine::{SettlementBatchRunner, Trigger};

use super::{print_json, GlobalArgs};

#[derive(Subcommand)]
pub enum BatchCmd {
    /// Confirm all PENDING earnings now
    Run {
        /// Batch date, YYYY-MM-DD; defaults to today (UTC)
        #[arg(long)]
        date: Option<String>,
    },

    /// Most recent batches first
    List {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

pub async fn run(global: &GlobalArgs, cmd: BatchCmd) -> Result<()> {
    let wired = global.connect().await?;
    let runner = SettlementBatchRunner::new(wired.ctx.clone());
    match cmd {
        BatchCmd::Run { date } => {
            let date = match date {
                Some(d) => NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d")
                    .with_context(|| format!("invalid --date '{d}', expected YYYY-MM-DD"))?,
                None => Utc::now().date_naive(),
            };
            let batch = runner
                .run_batch(date, Trigger::Manual)
                .await?
                .context("manual batch run returned no batch")?;
            println!(
                "batch_id={} status={} processed={} skipped={} total={}",
                batch.id,
                batch.status.as_str(),
                batch.processed_count,
                batch.skipped_count,
                batch.total_commissions
            );
        }
        BatchCmd::List { limit } => {
            let batches = runner.list_batches(limit).await?;
            print_json(&batches)?;
        }
    }
    Ok(())
}
