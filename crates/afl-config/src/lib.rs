//! Layered YAML configuration.
//!
//! Files merge in order (later wins, objects merge key by key), the result is
//! hashed over its canonical JSON, and literal credentials are refused. The
//! typed view lives in [`EngineConfig`]; [`usage`] reports keys nobody reads.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

mod engine;
pub mod secrets;
pub mod usage;

pub use engine::{
    AuditSettings, EngineConfig, PaymentSettings, PayoutSettings, RailKind, RailSettings,
    RecoverySettings, ScheduleSettings,
};
pub use usage::{report_unused_keys, ConfigRole, UnusedKeyPolicy, UnusedKeyReport};

/// Leaf strings starting with one of these abort the load with
/// `CONFIG_SECRET_DETECTED`. Config carries env var NAMES, never keys.
const SECRET_PREFIXES: &[&str] = &[
    // payment processors
    "sk_live", "sk_test", "rk_live", "sk-", "access_token$",
    // cloud and source hosting
    "AKIA", "ghp_", "glpat-",
    "-----BEGIN",
];

/// JSON pointers of every scalar leaf, keys escaped per RFC 6901. An empty
/// object or array contributes nothing.
pub(crate) fn leaf_pointers(v: &Value) -> Vec<String> {
    fn walk(v: &Value, at: String, out: &mut Vec<String>) {
        match v {
            Value::Object(map) => {
                for (k, child) in map {
                    let token = k.replace('~', "~0").replace('/', "~1");
                    walk(child, format!("{at}/{token}"), out);
                }
            }
            Value::Array(items) => {
                for (i, child) in items.iter().enumerate() {
                    walk(child, format!("{at}/{i}"), out);
                }
            }
            _ => out.push(if at.is_empty() { "/".to_string() } else { at }),
        }
    }
    let mut out = Vec::new();
    walk(v, String::new(), &mut out);
    out
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_hash: String,
    pub canonical_json: String,
    pub config_json: Value,
}

impl LoadedConfig {
    /// Decode the typed engine settings; absent keys take their defaults.
    pub fn engine(&self) -> Result<EngineConfig> {
        EngineConfig::from_config_json(&self.config_json)
    }
}

/// Read and layer the files at `paths`, first = base.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let docs = paths
        .iter()
        .map(|p| fs::read_to_string(p).with_context(|| format!("read config layer {p}")))
        .collect::<Result<Vec<String>>>()?;
    let refs: Vec<&str> = docs.iter().map(String::as_str).collect();
    load_layered_yaml_from_strings(&refs)
}

pub fn load_layered_yaml_from_strings(yaml_docs: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(serde_json::Map::new());
    for (i, raw) in yaml_docs.iter().enumerate() {
        let layer: serde_yaml::Value =
            serde_yaml::from_str(raw).with_context(|| format!("config layer {i} is not valid YAML"))?;
        let layer = serde_json::to_value(layer)
            .with_context(|| format!("config layer {i} has no JSON form"))?;
        overlay(&mut merged, layer);
    }

    enforce_no_secret_literals(&merged)?;

    let canonical_json = serde_json::to_string(&sorted(&merged)).context("canonical config json")?;
    Ok(LoadedConfig {
        config_hash: sha256_hex(canonical_json.as_bytes()),
        canonical_json,
        config_json: merged,
    })
}

/// Objects merge key by key; anything else in `top` replaces `base`.
fn overlay(base: &mut Value, top: Value) {
    match (base, top) {
        (Value::Object(base_map), Value::Object(top_map)) => {
            for (k, v) in top_map {
                match base_map.get_mut(&k) {
                    Some(slot) => overlay(slot, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

/// Keys sorted at every depth, so the hash ignores YAML key order.
fn sorted(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k.clone(), sorted(v))).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn enforce_no_secret_literals(v: &Value) -> Result<()> {
    let leaked = leaf_pointers(v).into_iter().find(|ptr| {
        v.pointer(ptr)
            .and_then(Value::as_str)
            .map(str::trim)
            .is_some_and(|s| s.len() >= 8 && SECRET_PREFIXES.iter().any(|p| s.starts_with(p)))
    });
    match leaked {
        Some(ptr) => bail!("CONFIG_SECRET_DETECTED leaf={ptr} value=REDACTED"),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_pointers_escape_keys() {
        let v = serde_json::json!({"a/b": {"c~d": 1}, "empty": {}});
        assert_eq!(leaf_pointers(&v), vec!["/a~1b/c~0d".to_string()]);
    }

    #[test]
    fn later_docs_override_earlier() {
        let base = "payouts:\n  minimum_amount: \"50.00\"\naudit:\n  hash_chain: true\n";
        let env = "payouts:\n  minimum_amount: \"25.00\"\n";
        let loaded = load_layered_yaml_from_strings(&[base, env]).unwrap();
        assert_eq!(
            loaded.config_json.pointer("/payouts/minimum_amount"),
            Some(&Value::String("25.00".into()))
        );
        assert_eq!(
            loaded.config_json.pointer("/audit/hash_chain"),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn scalar_overlay_replaces_object() {
        let loaded =
            load_layered_yaml_from_strings(&["payments:\n  rail:\n    kind: http\n", "payments: 1\n"])
                .unwrap();
        assert_eq!(loaded.config_json, serde_json::json!({"payments": 1}));
    }

    #[test]
    fn hash_is_independent_of_key_order() {
        let a = load_layered_yaml_from_strings(&["a: 1\nb: 2\n"]).unwrap();
        let b = load_layered_yaml_from_strings(&["b: 2\na: 1\n"]).unwrap();
        assert_eq!(a.config_hash, b.config_hash);
    }

    #[test]
    fn literal_secret_is_rejected() {
        let yaml = "payments:\n  rail:\n    api_key_env: \"sk_live_abcdefghijkl\"\n";
        let err = load_layered_yaml_from_strings(&[yaml]).unwrap_err();
        assert!(err.to_string().contains("CONFIG_SECRET_DETECTED"));
        assert!(!err.to_string().contains("abcdefghijkl"));
    }
}
