use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

use afl_engine::{EngineError, ErrorKind};

mod commands;

use commands::{batch, earning, offer, payout, GlobalArgs};

#[derive(Parser)]
#[command(name = "afl")]
#[command(about = "Affiliate commission and settlement operator CLI", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> overrides)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Offer catalogue
    Offer {
        #[command(subcommand)]
        cmd: offer::OfferCmd,
    },

    /// Conversion intake
    Conversion {
        #[command(subcommand)]
        cmd: earning::ConversionCmd,
    },

    /// Earning lifecycle
    Earning {
        #[command(subcommand)]
        cmd: earning::EarningCmd,
    },

    /// Settlement batches (manual trigger)
    Batch {
        #[command(subcommand)]
        cmd: batch::BatchCmd,
    },

    /// Payouts and invoices
    Payout {
        #[command(subcommand)]
        cmd: payout::PayoutCmd,
    },

    /// Earnings and per-status totals for one partner
    Report(earning::ReportArgs),

    /// Audit trail utilities
    Audit {
        #[command(subcommand)]
        cmd: AuditCmd,
    },

    /// Fail batches/payouts stuck in PROCESSING and release stale job locks
    Recover {
        /// Override recovery.stale_after_secs
        #[arg(long)]
        stale_after_secs: Option<i64>,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    /// Apply SQL migrations.
    Migrate,
}

#[derive(Subcommand)]
enum AuditCmd {
    /// Verify the hash chain of a JSONL audit log, or of the audit_events
    /// table with --db.
    Verify {
        /// JSONL path; defaults to audit.path from config
        #[arg(long, conflicts_with = "db")]
        path: Option<String>,

        #[arg(long, default_value_t = false)]
        db: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::from_filename(".env.local");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = exit_code(&err);
            match err.downcast_ref::<EngineError>() {
                Some(e) => eprintln!("error[{}]: {e}", e.kind().as_str()),
                None => eprintln!("error: {err:#}"),
            }
            ExitCode::from(code)
        }
    }
}

/// Engine error kinds get distinct exit codes; anything else is 1.
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<EngineError>().map(EngineError::kind) {
        Some(ErrorKind::Validation) => 2,
        Some(ErrorKind::NotFound) => 3,
        Some(ErrorKind::State) => 4,
        Some(ErrorKind::Compliance) => 5,
        Some(ErrorKind::Funds) => 6,
        Some(ErrorKind::ExternalRail) => 7,
        Some(ErrorKind::Infrastructure) | None => 1,
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let global = cli.global;
    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = afl_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = afl_db::status(&pool).await?;
                    println!("db_ok={} has_earnings_table={}", s.ok, s.has_earnings_table);
                }
                DbCmd::Migrate => {
                    afl_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = afl_config::load_layered_yaml(&path_refs)?;
            // Fail early on keys that do not decode.
            loaded.engine()?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Offer { cmd } => offer::run(&global, cmd).await?,
        Commands::Conversion { cmd } => earning::run_conversion(&global, cmd).await?,
        Commands::Earning { cmd } => earning::run_earning(&global, cmd).await?,
        Commands::Batch { cmd } => batch::run(&global, cmd).await?,
        Commands::Payout { cmd } => payout::run(&global, cmd).await?,
        Commands::Report(args) => earning::report(&global, args).await?,

        Commands::Audit { cmd } => match cmd {
            AuditCmd::Verify { path, db } => {
                let (source, result) = if db {
                    let pool = afl_db::connect_from_env().await?;
                    let content = afl_db::export_audit_jsonl(&pool).await?;
                    ("db:audit_events".to_string(), afl_audit::verify_hash_chain_str(&content)?)
                } else {
                    let path = match path {
                        Some(p) => p,
                        None => global.engine_config()?.0.audit.path,
                    };
                    let result = afl_audit::verify_hash_chain(&path)?;
                    (path, result)
                };
                match result {
                    afl_audit::VerifyResult::Valid { lines } => {
                        println!("audit_chain_valid=true source={source} lines={lines}");
                    }
                    afl_audit::VerifyResult::Broken { line, reason } => {
                        anyhow::bail!("AUDIT_CHAIN_BROKEN source={source} line={line} reason={reason}");
                    }
                }
            }
        },

        Commands::Recover { stale_after_secs } => {
            let rt = global.connect().await?;
            let secs = stale_after_secs.unwrap_or(rt.cfg.recovery.stale_after_secs);
            let report = afl_engine::StaleRecovery::new(rt.ctx.clone())
                .recover_stale_processing(chrono::Duration::seconds(secs))
                .await?;
            commands::print_json(&report)?;
        }
    }

    Ok(())
}
