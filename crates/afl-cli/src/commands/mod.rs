//! Command handler modules for the `afl` CLI.
//!
//! Shared wiring (config, database, audit sink, payment rail) lives here.
//! Command-specific logic lives in the submodules.

pub mod batch;
pub mod earning;
pub mod offer;
pub mod payout;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use clap::Args;
use serde::Serialize;
use uuid::Uuid;

use afl_audit::{AuditSink, JsonlAuditSink};
use afl_config::secrets::resolve_secrets;
use afl_config::{ConfigRole, EngineConfig, RailKind, UnusedKeyPolicy};
use afl_db::{PgAuditSink, PgStore};
use afl_engine::{EngineContext, PayoutEngine, PayoutPolicy, SystemClock};
use afl_rail::{HttpRail, PaperRail, PaymentRail};
use afl_schemas::Money;

#[derive(Args)]
pub struct GlobalArgs {
    /// Layered config paths in merge order; defaults apply when omitted
    #[arg(long = "config", global = true)]
    pub config_paths: Vec<String>,

    /// Recorded as the actor on every audit event
    #[arg(long, global = true)]
    pub actor: Option<String>,

    /// Write audit events to the audit_events table instead of audit.path
    #[arg(long, global = true, default_value_t = false)]
    pub audit_db: bool,
}

/// Everything a command needs to drive the engine.
pub struct Wired {
    pub cfg: EngineConfig,
    pub ctx: EngineContext,
    pub rail: Arc<dyn PaymentRail>,
}

impl Wired {
    pub fn payouts(&self) -> PayoutEngine {
        PayoutEngine::new(
            self.ctx.clone(),
            self.rail.clone(),
            PayoutPolicy::from_config(&self.cfg),
        )
    }
}

impl GlobalArgs {
    pub fn actor(&self) -> String {
        match &self.actor {
            Some(a) if !a.trim().is_empty() => a.trim().to_string(),
            _ => {
                let user = std::env::var("USER")
                    .or_else(|_| std::env::var("USERNAME"))
                    .unwrap_or_else(|_| "unknown".to_string());
                format!("operator:{user}")
            }
        }
    }

    /// Typed config plus its hash (`defaults` when no paths were given).
    pub fn engine_config(&self) -> Result<(EngineConfig, String)> {
        if self.config_paths.is_empty() {
            return Ok((EngineConfig::default(), "defaults".to_string()));
        }
        let refs: Vec<&str> = self.config_paths.iter().map(|s| s.as_str()).collect();
        let loaded = afl_config::load_layered_yaml(&refs)?;
        let report =
            afl_config::report_unused_keys(ConfigRole::Cli, &loaded.config_json, UnusedKeyPolicy::Warn)?;
        if !report.is_clean() {
            eprintln!(
                "warning: unused config keys: {}",
                report.unused_leaf_pointers.join(", ")
            );
        }
        Ok((loaded.engine()?, loaded.config_hash))
    }

    pub async fn connect(&self) -> Result<Wired> {
        let (cfg, config_hash) = self.engine_config()?;
        let secrets = resolve_secrets(&cfg)?;
        let pool = afl_db::connect_from_env().await?;
        let store = Arc::new(PgStore::new(pool.clone()));

        let audit: Arc<dyn AuditSink> = if self.audit_db {
            Arc::new(PgAuditSink::open(pool, cfg.audit.hash_chain).await?)
        } else {
            Arc::new(
                JsonlAuditSink::open(&cfg.audit.path, cfg.audit.hash_chain)
                    .with_context(|| format!("open audit log {}", cfg.audit.path))?,
            )
        };

        let rail: Arc<dyn PaymentRail> = match cfg.payments.rail.kind {
            RailKind::Paper => Arc::new(PaperRail::new()),
            RailKind::Http => {
                let base_url = cfg
                    .payments
                    .rail
                    .base_url
                    .clone()
                    .context("payments.rail.base_url is required for the http rail")?;
                let key = secrets
                    .rail_api_key
                    .clone()
                    .context("rail api key not resolved")?;
                Arc::new(HttpRail::new(
                    base_url,
                    key,
                    Duration::from_millis(cfg.payments.rail.timeout_ms),
                )?)
            }
        };

        tracing::debug!(config_hash = %config_hash, rail = rail.rail_name(), "cli wired");
        Ok(Wired {
            ctx: EngineContext::new(store.clone(), store, audit, Arc::new(SystemClock)),
            cfg,
            rail,
        })
    }
}

pub fn parse_uuid(s: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(s.trim()).with_context(|| format!("invalid {what} uuid: {s}"))
}

pub fn parse_money(s: &str, what: &str) -> Result<Money> {
    Money::parse(s).with_context(|| format!("invalid {what}"))
}

/// `YYYY-MM-DD` (start of day UTC) or full RFC 3339.
pub fn parse_instant(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s.trim()) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .with_context(|| format!("expected YYYY-MM-DD or RFC 3339, got '{s}'"))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .with_context(|| format!("no midnight on {date}"))?;
    Ok(Utc.from_utc_datetime(&midnight))
}

pub fn print_json<T: Serialize>(v: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(v).context("serialize output failed")?
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instants_accept_dates_and_rfc3339() {
        let d = parse_instant("2025-06-01").unwrap();
        assert_eq!(d, Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        let t = parse_instant("2025-06-01T10:30:00+02:00").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2025, 6, 1, 8, 30, 0).unwrap());
        assert!(parse_instant("June 1st").is_err());
    }

    #[test]
    fn blank_actor_falls_back_to_operator() {
        let g = GlobalArgs {
            config_paths: Vec::new(),
            actor: Some("  ".into()),
            audit_db: false,
        };
        assert!(g.actor().starts_with("operator:"));
    }
}
