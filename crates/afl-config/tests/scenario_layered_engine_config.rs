use afl_config::{load_layered_yaml, RailKind};
use std::io::Write;

/// scenario_layered_engine_config
///
/// A base file plus an environment overlay, read from disk, decode into the
/// typed engine settings with the overlay winning and defaults filling gaps.

fn write_tmp(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
    let path = dir.path().join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(body.as_bytes()).unwrap();
    path.to_string_lossy().into_owned()
}

#[test]
fn overlay_wins_and_defaults_fill_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let base = write_tmp(
        &dir,
        "base.yaml",
        r#"
payouts:
  minimum_amount: "50.00"
  invoice_methods: [bank_transfer, ach]
payments:
  rail:
    kind: paper
schedule:
  settlement_utc: "02:00"
"#,
    );
    let prod = write_tmp(
        &dir,
        "prod.yaml",
        r#"
payments:
  rail:
    kind: http
    base_url: "https://rail.example.net"
    api_key_env: "AFL_PROD_RAIL_KEY"
recovery:
  stale_after_secs: 1800
"#,
    );

    let loaded = load_layered_yaml(&[&base, &prod]).unwrap();
    let cfg = loaded.engine().unwrap();

    assert_eq!(cfg.payments.rail.kind, RailKind::Http);
    assert_eq!(cfg.payments.rail.base_url.as_deref(), Some("https://rail.example.net"));
    assert_eq!(cfg.payments.rail.timeout_ms, 10_000);
    assert_eq!(cfg.payouts.invoice_methods.len(), 2);
    assert_eq!(cfg.recovery.stale_after_secs, 1800);
    assert_eq!(cfg.schedule.payout_sweep_utc, "03:00");
    assert_eq!(cfg.audit.path, "audit/audit.jsonl");
    assert_eq!(loaded.config_hash.len(), 64);
}

#[test]
fn missing_file_is_an_error() {
    let err = load_layered_yaml(&["/definitely/not/here.yaml"]).unwrap_err();
    assert!(err.to_string().contains("failed to read yaml path"));
}
