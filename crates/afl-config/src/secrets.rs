//! Runtime secret resolution.
//!
//! Config YAML stores only env var NAMES (`payments.rail.api_key_env`). The
//! values are read once at startup and handed to the rail constructor.
//! `Debug` output redacts every value and errors name the variable, never
//! its contents.

use anyhow::{bail, Result};

use crate::{EngineConfig, RailKind};

/// Secrets for one engine instantiation. Values are redacted in `Debug`.
#[derive(Clone)]
pub struct ResolvedSecrets {
    /// Payment rail API key. `None` if the named env var was absent or empty.
    pub rail_api_key: Option<String>,
}

impl std::fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSecrets")
            .field(
                "rail_api_key",
                &self.rail_api_key.as_ref().map(|_| "<REDACTED>"),
            )
            .finish()
    }
}

/// Returns `None` if the variable is unset or blank.
fn resolve_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Resolve secrets for the configured rail.
///
/// The HTTP rail requires its key; the paper rail needs nothing.
pub fn resolve_secrets(cfg: &EngineConfig) -> Result<ResolvedSecrets> {
    let var = cfg.payments.rail.api_key_env.trim();
    let rail_api_key = if var.is_empty() {
        None
    } else {
        resolve_env(var)
    };

    if cfg.payments.rail.kind == RailKind::Http && rail_api_key.is_none() {
        bail!(
            "SECRETS_MISSING rail=http: required env var '{}' (rail api_key) is not set or empty",
            var
        );
    }

    Ok(ResolvedSecrets { rail_api_key })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_key() {
        let s = ResolvedSecrets {
            rail_api_key: Some("very-secret-value".into()),
        };
        let out = format!("{s:?}");
        assert!(out.contains("<REDACTED>"));
        assert!(!out.contains("very-secret-value"));
    }

    #[test]
    fn paper_rail_needs_no_key() {
        let mut cfg = EngineConfig::default();
        cfg.payments.rail.api_key_env = "AFL_TEST_UNSET_PAPER_KEY_9f3a".into();
        let s = resolve_secrets(&cfg).unwrap();
        assert!(s.rail_api_key.is_none());
    }

    #[test]
    fn http_rail_without_key_names_the_variable() {
        let mut cfg = EngineConfig::default();
        cfg.payments.rail.kind = RailKind::Http;
        cfg.payments.rail.api_key_env = "AFL_TEST_UNSET_HTTP_KEY_71c2".into();
        let err = resolve_secrets(&cfg).unwrap_err().to_string();
        assert!(err.contains("SECRETS_MISSING"));
        assert!(err.contains("AFL_TEST_UNSET_HTTP_KEY_71c2"));
    }
}
