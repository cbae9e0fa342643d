//! CLI-level integration tests via `assert_cmd`.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn write_config(tmp: &TempDir, extra: &str) -> std::path::PathBuf {
    let path = tmp.path().join("remit.toml");
    std::fs::write(
        &path,
        format!(
            r#"
[ledger]
mock = true

[billing]
merchant_account = "merchant-usdc"
{}
"#,
            extra
        ),
    )
    .unwrap();
    path
}

#[test]
fn help_lists_subcommands() {
    Command::cargo_bin("remit")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("sweep"));
}

#[test]
fn sweep_on_empty_store_reports_nothing_due() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(&tmp, "");

    Command::cargo_bin("remit")
        .unwrap()
        .arg("sweep")
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stderr(predicate::str::contains("0 due"));
}

#[test]
fn sweep_uses_file_store_from_config() {
    let tmp = TempDir::new().unwrap();
    let store_path = tmp.path().join("subscriptions.json");
    let config = write_config(
        &tmp,
        &format!("\n[store]\npath = \"{}\"", store_path.display()).replace('\\', "/"),
    );

    Command::cargo_bin("remit")
        .unwrap()
        .arg("sweep")
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stderr(predicate::str::contains("Sweep complete"));
}

#[test]
fn missing_merchant_account_fails_fast() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("remit.toml");
    std::fs::write(&path, "[ledger]\nmock = true\n").unwrap();

    Command::cargo_bin("remit")
        .unwrap()
        .arg("sweep")
        .arg("--config")
        .arg(&path)
        .env_remove("REMIT_MERCHANT_ACCOUNT")
        .assert()
        .failure()
        .stderr(predicate::str::contains("merchant account required"));
}
