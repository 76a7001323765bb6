//! afl-daemon entry point: tracing, config, wiring, then the schedule loops
//! until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;

use afl_daemon::jobs::{spawn_all, Jobs};
use afl_daemon::wiring::{self, AuditTarget, ENV_CONFIG_PATHS};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let paths = wiring::config_paths(&std::env::var(ENV_CONFIG_PATHS).unwrap_or_default());
    let (cfg, config_hash) = wiring::load_config(&paths)?;
    let audit = AuditTarget::from_env()?;
    let wired = wiring::connect(&cfg, audit).await?;

    info!(
        %config_hash,
        rail = wired.rail.rail_name(),
        audit = ?audit,
        settlement_utc = %cfg.schedule.settlement_utc,
        payout_sweep_utc = %cfg.schedule.payout_sweep_utc,
        "afl-daemon starting"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let jobs = Arc::new(Jobs::new(wired.ctx, wired.rail, cfg));
    let handles = spawn_all(jobs, stop_rx)?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested; waiting for running jobs");
    let _ = stop_tx.send(true);
    for h in handles {
        h.await.context("scheduler task panicked")?;
    }
    info!("afl-daemon stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
