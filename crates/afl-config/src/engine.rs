//! Typed view of the engine settings.
//!
//! Every section has defaults, so an empty config document is valid for
//! local runs against the paper rail.

use afl_schemas::{Money, PaymentMethod};
use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub payouts: PayoutSettings,
    pub payments: PaymentSettings,
    pub schedule: ScheduleSettings,
    pub recovery: RecoverySettings,
    pub audit: AuditSettings,
}

impl EngineConfig {
    pub fn from_config_json(config_json: &Value) -> Result<Self> {
        let cfg: EngineConfig = serde_json::from_value(config_json.clone())
            .context("engine config does not match the expected shape")?;
        cfg.schedule.settlement_time()?;
        cfg.schedule.payout_sweep_time()?;
        Ok(cfg)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayoutSettings {
    /// Smallest payout a partner may request.
    pub minimum_amount: Money,
    /// Methods for which an invoice is generated at request time.
    pub invoice_methods: Vec<PaymentMethod>,
}

impl Default for PayoutSettings {
    fn default() -> Self {
        Self {
            minimum_amount: Money::from_minor_units(5_000),
            invoice_methods: vec![
                PaymentMethod::BankTransfer,
                PaymentMethod::WireTransfer,
                PaymentMethod::Ach,
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentSettings {
    /// Key inside `Partner::contact_metadata` holding the rail account id.
    pub account_id_key: String,
    pub rail: RailSettings,
}

impl Default for PaymentSettings {
    fn default() -> Self {
        Self {
            account_id_key: "payment_account_id".to_string(),
            rail: RailSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RailKind {
    #[default]
    Paper,
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RailSettings {
    pub kind: RailKind,
    pub base_url: Option<String>,
    /// NAME of the env var holding the rail API key (never the key itself).
    pub api_key_env: String,
    pub timeout_ms: u64,
}

impl Default for RailSettings {
    fn default() -> Self {
        Self {
            kind: RailKind::Paper,
            base_url: None,
            api_key_env: "AFL_RAIL_API_KEY".to_string(),
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    /// UTC wall-clock time of the daily settlement batch, `HH:MM`.
    pub settlement_utc: String,
    /// UTC wall-clock time of the daily payout sweep, `HH:MM`.
    pub payout_sweep_utc: String,
    pub recovery_interval_secs: u64,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            settlement_utc: "02:00".to_string(),
            payout_sweep_utc: "03:00".to_string(),
            recovery_interval_secs: 900,
        }
    }
}

impl ScheduleSettings {
    pub fn settlement_time(&self) -> Result<NaiveTime> {
        parse_hhmm(&self.settlement_utc).context("schedule.settlement_utc")
    }

    pub fn payout_sweep_time(&self) -> Result<NaiveTime> {
        parse_hhmm(&self.payout_sweep_utc).context("schedule.payout_sweep_utc")
    }
}

fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .with_context(|| format!("expected HH:MM, got '{s}'"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    /// Rows stuck in PROCESSING longer than this are closed as FAILED.
    pub stale_after_secs: i64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            stale_after_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub path: String,
    pub hash_chain: bool,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            path: "audit/audit.jsonl".to_string(),
            hash_chain: true,
        }
    }
}
