#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;
use tessera::{EnvOptions, Environment};

fn setup_env(name: &str, options: EnvOptions) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join(format!("{name}.tsr"));
    seed_demo(&path, options).expect("seed demo data");
    (dir, path)
}

/// Two commits: page 1 filled with 0xAB, then page 2 with 0xCD.
fn seed_demo(path: &Path, options: EnvOptions) -> tessera::Result<()> {
    let env = Environment::open(
        path,
        EnvOptions {
            manual_flushing: true,
            ..options
        },
    )?;
    for fill in [0xABu8, 0xCD] {
        let mut tx = env.begin_write()?;
        let page = tx.allocate_page(1)?;
        tx.modify_page(page)?.fill(fill);
        tx.commit()?;
    }
    env.close()
}

fn json_output(args: &[&str], path: &Path) -> Value {
    let output = cargo_bin_cmd!("tessera")
        .args(["--format", "json"])
        .args(args)
        .arg(path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

fn text_output(args: &[&str], path: &Path) -> String {
    let output = cargo_bin_cmd!("tessera")
        .args(args)
        .arg(path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    String::from_utf8(output).expect("utf8 output")
}

#[test]
fn inspect_journal_lists_unflushed_records() {
    let (_tmp, env_path) = setup_env("inspect", EnvOptions::default());

    let files = json_output(&["inspect-journal"], &env_path);
    let files = files.as_array().expect("array of files");
    assert_eq!(files.len(), 1);
    let records = files[0]["records"].as_array().expect("records");
    let txs: Vec<u64> = records
        .iter()
        .map(|r| r["tx"].as_u64().expect("tx"))
        .collect();
    assert_eq!(txs, vec![1, 2]);
    assert!(files[0]["damage"].is_null());

    let text = text_output(&["inspect-journal"], &env_path);
    assert!(text.contains("2 record(s)"), "{text}");
    assert!(text.contains("tx=1"), "{text}");
}

#[test]
fn stats_reports_transaction_counters() {
    let (_tmp, env_path) = setup_env("stats", EnvOptions::default());

    let stats = json_output(&["stats"], &env_path);
    assert_eq!(stats["page_size"].as_u64(), Some(8192));
    assert_eq!(stats["last_committed_tx"].as_u64(), Some(2));
    assert_eq!(stats["last_flushed_tx"].as_u64(), Some(2));
    assert_eq!(stats["next_page"].as_u64(), Some(3));
    assert!(stats["poisoned"].is_null());

    let text = text_output(&["stats"], &env_path);
    assert!(text.contains("committed=2 durable=2 flushed=2"), "{text}");
    assert!(text.contains("poisoned             no"), "{text}");
}

#[test]
fn flush_reports_the_installed_range() {
    let (_tmp, env_path) = setup_env("flush", EnvOptions::default());

    // Opening replays the journal, so the command finds everything installed.
    let report = json_output(&["flush"], &env_path);
    assert_eq!(report["flushed_up_to"].as_u64(), Some(2));

    let text = text_output(&["flush"], &env_path);
    assert!(text.contains("Nothing to flush (flushed up to tx 2)"), "{text}");

    let files = json_output(&["inspect-journal"], &env_path);
    let records = files[0]["records"].as_array().expect("records");
    assert!(records.is_empty());
}

#[test]
fn dump_page_prints_the_committed_image() {
    let (_tmp, env_path) = setup_env("dump", EnvOptions::default());

    let output = cargo_bin_cmd!("tessera")
        .args(["--format", "json", "dump-page"])
        .arg(&env_path)
        .arg("2")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let dump: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(dump["page"].as_u64(), Some(2));
    assert_eq!(dump["snapshot"].as_u64(), Some(2));
    let hex = dump["hex"].as_str().expect("hex string");
    assert_eq!(hex.len(), 2 * 8192);
    assert!(hex.as_bytes().chunks(2).all(|pair| pair == b"cd"));

    let output = cargo_bin_cmd!("tessera")
        .arg("dump-page")
        .arg(&env_path)
        .arg("1")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8 output");
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("page 1 (1 page(s), snapshot 2)"));
    assert_eq!(
        lines.next(),
        Some("00000000  abababababababababababababababab")
    );
    assert_eq!(text.lines().count(), 1 + 8192 / 16);
}

#[test]
fn dump_page_rejects_unallocated_pages() {
    let (_tmp, env_path) = setup_env("unallocated", EnvOptions::default());
    cargo_bin_cmd!("tessera")
        .arg("dump-page")
        .arg(&env_path)
        .arg("40")
        .assert()
        .failure();
}

#[test]
fn config_file_supplies_the_page_size() {
    let options = EnvOptions {
        page_size: 4096,
        ..EnvOptions::default()
    };
    let (tmp, env_path) = setup_env("config", options);

    // The default page size does not match this environment.
    let output = cargo_bin_cmd!("tessera")
        .arg("stats")
        .arg(&env_path)
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    assert!(String::from_utf8_lossy(&output).contains("error:"));

    let config = tmp.path().join("tessera.toml");
    fs::write(&config, "page_size = 4096\n").expect("write config");
    let output = cargo_bin_cmd!("tessera")
        .args(["--format", "json", "stats"])
        .arg(&env_path)
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let stats: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(stats["page_size"].as_u64(), Some(4096));

    cargo_bin_cmd!("tessera")
        .env("TESSERA_CONFIG", &config)
        .arg("stats")
        .arg(&env_path)
        .assert()
        .success();

    cargo_bin_cmd!("tessera")
        .args(["--page-size", "4096", "stats"])
        .arg(&env_path)
        .assert()
        .success();
}

#[test]
fn malformed_config_is_reported() {
    let (tmp, env_path) = setup_env("badconfig", EnvOptions::default());
    let config = tmp.path().join("bad.toml");
    fs::write(&config, "page_sise = 4096\n").expect("write config");
    let output = cargo_bin_cmd!("tessera")
        .arg("--config")
        .arg(&config)
        .arg("stats")
        .arg(&env_path)
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    assert!(String::from_utf8_lossy(&output).contains("failed to load config"));
    assert!(env_path.exists());
}
