//! Scenario: `afl config-hash` over layered YAML.
//!
//! Validates:
//! 1) Layering the shipped base and paper files prints a stable hash and
//!    the merged canonical JSON.
//! 2) Key order in the YAML does not change the hash.
//! 3) A malformed schedule time is rejected before any hash is printed.
//! 4) A literal secret in config is refused.

use std::path::PathBuf;

use assert_cmd::prelude::*;
use predicates::prelude::*;

fn repo_config(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
        .join("config")
        .join(name)
}

fn hash_of(paths: &[PathBuf]) -> anyhow::Result<String> {
    let mut cmd = std::process::Command::cargo_bin("afl")?;
    cmd.arg("config-hash");
    for p in paths {
        cmd.arg(p);
    }
    let out = cmd.output()?;
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8(out.stdout)?;
    let line = stdout
        .lines()
        .find_map(|l| l.strip_prefix("config_hash="))
        .ok_or_else(|| anyhow::anyhow!("no config_hash line in {stdout}"))?;
    Ok(line.to_string())
}

#[test]
fn layered_shipped_config_hashes_stably() -> anyhow::Result<()> {
    let paths = [repo_config("base.yaml"), repo_config("paper.yaml")];
    let first = hash_of(&paths)?;
    let second = hash_of(&paths)?;
    assert_eq!(first, second);
    assert_eq!(first.len(), 64);

    let base_only = hash_of(&paths[..1])?;
    assert_ne!(first, base_only);

    std::process::Command::cargo_bin("afl")?
        .arg("config-hash")
        .args(&paths)
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""kind":"paper""#));
    Ok(())
}

#[test]
fn key_order_does_not_change_the_hash() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let a = dir.path().join("a.yaml");
    let b = dir.path().join("b.yaml");
    std::fs::write(
        &a,
        "payouts:\n  minimum_amount: \"25.00\"\nrecovery:\n  stale_after_secs: 60\n",
    )?;
    std::fs::write(
        &b,
        "recovery:\n  stale_after_secs: 60\npayouts:\n  minimum_amount: \"25.00\"\n",
    )?;
    assert_eq!(hash_of(&[a])?, hash_of(&[b])?);
    Ok(())
}

#[test]
fn malformed_schedule_is_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let bad = dir.path().join("bad.yaml");
    std::fs::write(&bad, "schedule:\n  settlement_utc: \"25:99\"\n")?;

    std::process::Command::cargo_bin("afl")?
        .arg("config-hash")
        .arg(&bad)
        .assert()
        .failure()
        .stdout(predicate::str::contains("config_hash=").not())
        .stderr(predicate::str::contains("settlement_utc"));
    Ok(())
}

#[test]
fn literal_secret_is_refused() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let leaky = dir.path().join("leaky.yaml");
    std::fs::write(
        &leaky,
        "payments:\n  rail:\n    api_key_env: \"sk_live_0123456789abcdef\"\n",
    )?;

    std::process::Command::cargo_bin("afl")?
        .arg("config-hash")
        .arg(&leaky)
        .assert()
        .failure()
        .stderr(predicate::str::contains("CONFIG_SECRET_DETECTED"))
        .stderr(predicate::str::contains("0123456789abcdef").not());
    Ok(())
}
