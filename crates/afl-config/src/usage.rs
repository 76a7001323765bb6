//! Unused-key report: which config leaves no component reads.
//!
//! Each role lists the subtrees it decodes. A leaf outside all of them is
//! almost always a typo (`shedule.settlement_utc`) that would otherwise fall
//! back to a default without anyone noticing.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::leaf_pointers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigRole {
    /// Scheduler process.
    Daemon,
    /// Operator CLI.
    Cli,
}

impl ConfigRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigRole::Daemon => "DAEMON",
            ConfigRole::Cli => "CLI",
        }
    }

    /// Subtrees this role decodes through [`crate::EngineConfig`]. The CLI
    /// never schedules anything but still validates `schedule` on decode.
    pub fn consumed_subtrees(&self) -> &'static [&'static str] {
        const ENGINE: &[&str] = &["/audit", "/payments", "/payouts", "/recovery", "/schedule"];
        match self {
            ConfigRole::Daemon | ConfigRole::Cli => ENGINE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnusedKeyPolicy {
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnusedKeyReport {
    pub role: String,
    pub consumed_prefixes: Vec<String>,
    /// Sorted, unique.
    pub unused_leaf_pointers: Vec<String>,
}

impl UnusedKeyReport {
    pub fn is_clean(&self) -> bool {
        self.unused_leaf_pointers.is_empty()
    }
}

/// Report leaves of `config_json` outside `role`'s subtrees. `Fail` turns a
/// non-empty report into an error naming the first few offenders.
pub fn report_unused_keys(
    role: ConfigRole,
    config_json: &Value,
    policy: UnusedKeyPolicy,
) -> Result<UnusedKeyReport> {
    let subtrees = role.consumed_subtrees();
    let mut unused: Vec<String> = leaf_pointers(config_json)
        .into_iter()
        .filter(|leaf| !subtrees.iter().any(|s| within(s, leaf)))
        .collect();
    unused.sort();
    unused.dedup();

    let report = UnusedKeyReport {
        role: role.as_str().to_string(),
        consumed_prefixes: subtrees.iter().map(|s| s.to_string()).collect(),
        unused_leaf_pointers: unused,
    };

    if policy == UnusedKeyPolicy::Fail && !report.is_clean() {
        let shown: Vec<&str> = report
            .unused_leaf_pointers
            .iter()
            .take(12)
            .map(String::as_str)
            .collect();
        bail!(
            "CONFIG_UNUSED_KEYS role={} count={}: {}",
            report.role,
            report.unused_leaf_pointers.len(),
            shown.join(", ")
        );
    }
    Ok(report)
}

/// `/payouts` covers `/payouts/minimum_amount` but not `/payouts_extra/x`.
fn within(subtree: &str, leaf: &str) -> bool {
    match leaf.strip_prefix(subtree) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subtree_match_respects_segment_boundary() {
        assert!(within("/payouts", "/payouts/minimum_amount"));
        assert!(within("/payouts", "/payouts"));
        assert!(!within("/payouts", "/payouts_extra/x"));
    }

    #[test]
    fn array_leaves_are_indexed() {
        let cfg = json!({"payouts": {"invoice_methods": ["ach"]}, "extra": [1, 2]});
        let report = report_unused_keys(ConfigRole::Cli, &cfg, UnusedKeyPolicy::Warn).unwrap();
        assert_eq!(report.unused_leaf_pointers, vec!["/extra/0", "/extra/1"]);
    }
}
