//! Config loading and runtime wiring for the scheduler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

use afl_audit::{AuditSink, JsonlAuditSink};
use afl_config::secrets::resolve_secrets;
use afl_config::{ConfigRole, EngineConfig, RailKind, UnusedKeyPolicy};
use afl_db::{PgAuditSink, PgStore};
use afl_engine::{EngineContext, SystemClock};
use afl_rail::{HttpRail, PaperRail, PaymentRail};

/// Comma-separated layered config paths, in merge order.
pub const ENV_CONFIG_PATHS: &str = "AFL_CONFIG";
/// `jsonl` (default) or `db`.
pub const ENV_AUDIT_SINK: &str = "AFL_AUDIT_SINK";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditTarget {
    Jsonl,
    Db,
}

impl AuditTarget {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "jsonl" => Ok(AuditTarget::Jsonl),
            "db" => Ok(AuditTarget::Db),
            other => anyhow::bail!("{ENV_AUDIT_SINK} must be 'jsonl' or 'db', got '{other}'"),
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::parse(&std::env::var(ENV_AUDIT_SINK).unwrap_or_default())
    }
}

pub fn config_paths(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Typed config plus its hash. Unused keys are fatal for the daemon: a
/// misspelled schedule key would otherwise silently fall back to defaults.
pub fn load_config(paths: &[String]) -> Result<(EngineConfig, String)> {
    if paths.is_empty() {
        warn!("{ENV_CONFIG_PATHS} not set; running on built-in defaults");
        return Ok((EngineConfig::default(), "defaults".to_string()));
    }
    let refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
    let loaded = afl_config::load_layered_yaml(&refs)?;
    afl_config::report_unused_keys(ConfigRole::Daemon, &loaded.config_json, UnusedKeyPolicy::Fail)?;
    Ok((loaded.engine()?, loaded.config_hash))
}

pub struct Wired {
    pub ctx: EngineContext,
    pub rail: Arc<dyn PaymentRail>,
}

pub async fn connect(cfg: &EngineConfig, audit: AuditTarget) -> Result<Wired> {
    let secrets = resolve_secrets(cfg)?;
    let pool = afl_db::connect_from_env().await?;
    let store = Arc::new(PgStore::new(pool.clone()));

    let sink: Arc<dyn AuditSink> = match audit {
        AuditTarget::Db => Arc::new(PgAuditSink::open(pool, cfg.audit.hash_chain).await?),
        AuditTarget::Jsonl => Arc::new(
            JsonlAuditSink::open(&cfg.audit.path, cfg.audit.hash_chain)
                .with_context(|| format!("open audit log {}", cfg.audit.path))?,
        ),
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

    Ok(Wired {
        ctx: EngineContext::new(store.clone(), store, sink, Arc::new(SystemClock)),
        rail,
    })
}
