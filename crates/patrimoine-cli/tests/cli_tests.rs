use std::path::Path;

use assert_cmd::Command;
use patrimoine_core::keys::KeyEnv;
use patrimoine_core::store::{NewBank, NewUser};
use patrimoine_core::{Vault, VaultPaths, VaultSettings};
use predicates::prelude::*;
use serde_json::Value;
use tempfile::tempdir;

fn patrimoine(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("patrimoine").unwrap();
    cmd.arg("--data-dir")
        .arg(dir)
        .env_remove("PATRIMOINE_SECRET_KEY")
        .env_remove("PATRIMOINE_ENCRYPTION_SALT")
        .env_remove("PATRIMOINE_DATA_DIR")
        .env("RUST_LOG", "warn");
    cmd
}

fn json_stdout(cmd: &mut Command) -> Value {
    let output = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&output).unwrap()
}

fn seed_bank(dir: &Path, name: &str) -> String {
    let vault = Vault::with_key_env(
        VaultPaths::new(dir),
        VaultSettings::default(),
        KeyEnv::default(),
    )
    .unwrap();
    let store = vault.open_store().unwrap();
    let owner = store
        .insert_user(
            &NewUser {
                username: format!("user-{name}"),
                email: Some("someone@example.fr".into()),
            },
            vault.codecs(),
        )
        .unwrap();
    store
        .insert_bank(
            &NewBank {
                owner_id: owner,
                name: name.into(),
                notes: Some("livret A".into()),
            },
            vault.codecs(),
        )
        .unwrap()
}

#[test]
fn init_keys_refuses_to_overwrite_without_force() {
    let dir = tempdir().unwrap();

    let first = json_stdout(patrimoine(dir.path()).arg("init-keys"));
    assert_eq!(first["version"], 1);
    assert!(dir.path().join(".salt").exists());
    assert!(dir.path().join(".key").exists());

    patrimoine(dir.path())
        .arg("init-keys")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("already exist"));

    let forced = json_stdout(patrimoine(dir.path()).args(["init-keys", "--force"]));
    assert_eq!(forced["version"], 2);
    assert_ne!(first["fingerprint"], forced["fingerprint"]);
}

#[test]
fn init_db_reports_database_and_row_counts() {
    let dir = tempdir().unwrap();
    let summary = json_stdout(patrimoine(dir.path()).arg("init-db"));
    assert!(summary["database"].as_str().unwrap().ends_with("patrimoine.db"));
    assert_eq!(summary["rows"].as_object().unwrap().len(), 5);
    assert!(dir.path().join("patrimoine.db").exists());
    assert!(dir.path().join("key_backups").is_dir());

    seed_bank(dir.path(), "Revolut");
    let summary = json_stdout(patrimoine(dir.path()).arg("init-db"));
    assert_eq!(summary["rows"]["banks"], 1);
    assert_eq!(summary["rows"]["users"], 1);
}

#[test]
fn backup_then_restore_round_trips_the_database() {
    let dir = tempdir().unwrap();
    patrimoine(dir.path()).arg("init-db").assert().success();
    seed_bank(dir.path(), "Boursorama");
    let original = std::fs::read(dir.path().join("patrimoine.db")).unwrap();

    let output = patrimoine(dir.path())
        .arg("backup")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let container = String::from_utf8(output).unwrap().trim().to_string();
    assert!(container.ends_with(".zip.enc"));
    assert!(Path::new(&container).exists());

    std::fs::write(dir.path().join("patrimoine.db"), b"clobbered").unwrap();

    let restored = json_stdout(patrimoine(dir.path()).arg("restore").arg(&container));
    assert!(restored["safety_copy"].is_string());
    assert_eq!(
        std::fs::read(dir.path().join("patrimoine.db")).unwrap(),
        original
    );
}

#[test]
fn restore_of_missing_container_fails() {
    let dir = tempdir().unwrap();
    patrimoine(dir.path()).arg("init-keys").assert().success();
    patrimoine(dir.path())
        .args(["restore", "nowhere.zip.enc"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("nowhere.zip.enc"));
}

#[test]
fn check_integrity_exit_codes() {
    let dir = tempdir().unwrap();
    patrimoine(dir.path()).arg("init-db").assert().success();
    let bank = seed_bank(dir.path(), "Hello bank");

    let passed = json_stdout(patrimoine(dir.path()).arg("check-integrity"));
    assert_eq!(passed["passed"], true);
    assert!(passed["safety_backup"].is_string());

    let vault = Vault::with_key_env(
        VaultPaths::new(dir.path()),
        VaultSettings::default(),
        KeyEnv::default(),
    )
    .unwrap();
    vault
        .open_store()
        .unwrap()
        .with_connection(|c| {
            c.execute(
                &format!("UPDATE banks SET name = 'not-an-envelope' WHERE id = '{bank}'"),
                [],
            )
        })
        .unwrap();

    let output = patrimoine(dir.path())
        .args(["check-integrity", "--sample-size", "10"])
        .assert()
        .code(1)
        .get_output()
        .stdout
        .clone();
    let failed: Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(failed["passed"], false);
    assert_eq!(failed["report"]["corrupted"], 1);
    assert_eq!(failed["report"]["corrupted_items"][0]["id"], bank);
}

#[test]
fn check_integrity_rejects_zero_sample_size() {
    let dir = tempdir().unwrap();
    patrimoine(dir.path()).arg("init-db").assert().success();
    let metadata = std::fs::read(dir.path().join(".key_metadata.json")).unwrap();

    patrimoine(dir.path())
        .args(["check-integrity", "--sample-size", "0"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("sample-size"));
    assert_eq!(
        std::fs::read(dir.path().join(".key_metadata.json")).unwrap(),
        metadata
    );
}

#[test]
fn scheduled_backup_with_environment_secret() {
    let dir = tempdir().unwrap();
    let with_secret = |cmd: &mut Command| {
        cmd.env("PATRIMOINE_SECRET_KEY", "une phrase secrète")
            .env("PATRIMOINE_ENCRYPTION_SALT", "0123456789abcdef");
    };

    let mut init = patrimoine(dir.path());
    with_secret(&mut init);
    init.arg("init-db").assert().success();
    assert!(!dir.path().join(".key").exists());

    let mut job = patrimoine(dir.path());
    with_secret(&mut job);
    let report = json_stdout(job.arg("scheduled-backup"));
    assert!(report["backup"].as_str().unwrap().ends_with(".zip.enc"));
    assert!(report["key_backup"].is_null());
}

#[test]
fn check_integrity_without_keys_is_an_error() {
    let dir = tempdir().unwrap();
    patrimoine(dir.path())
        .arg("check-integrity")
        .assert()
        .success();

    seed_bank(dir.path(), "Orange");
    std::fs::remove_file(dir.path().join(".key")).unwrap();
    std::fs::remove_file(dir.path().join(".salt")).unwrap();
    patrimoine(dir.path())
        .arg("check-integrity")
        .assert()
        .code(2);
}

#[test]
fn key_backup_commands() {
    let dir = tempdir().unwrap();
    patrimoine(dir.path()).arg("init-keys").assert().success();

    for _ in 0..3 {
        patrimoine(dir.path())
            .args(["backup-keys", "--prefix", "manual"])
            .assert()
            .success();
    }

    let listed = json_stdout(patrimoine(dir.path()).arg("list-key-backups"));
    let labels: Vec<&str> = listed
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["label"].as_str().unwrap())
        .collect();
    assert_eq!(labels.len(), 4);
    assert!(labels.contains(&"v1_initial"));

    let removed = json_stdout(patrimoine(dir.path()).args(["prune-key-backups", "--keep", "1"]));
    assert_eq!(removed.as_array().unwrap().len(), 2);

    let listed = json_stdout(patrimoine(dir.path()).arg("list-key-backups"));
    assert_eq!(listed.as_array().unwrap().len(), 2);
}

#[test]
fn rotate_version_only_bumps_metadata() {
    let dir = tempdir().unwrap();
    patrimoine(dir.path()).arg("init-keys").assert().success();
    let key_before = std::fs::read(dir.path().join(".key")).unwrap();

    patrimoine(dir.path())
        .arg("rotate-version")
        .assert()
        .success()
        .stdout(predicate::str::diff("2\n"));
    assert_eq!(std::fs::read(dir.path().join(".key")).unwrap(), key_before);
}

#[test]
fn rotate_keys_keeps_existing_data_readable() {
    let dir = tempdir().unwrap();
    patrimoine(dir.path()).arg("init-db").assert().success();
    seed_bank(dir.path(), "Avant");
    let key_before = std::fs::read(dir.path().join(".key")).unwrap();

    patrimoine(dir.path())
        .arg("rotate-keys")
        .assert()
        .success()
        .stdout(predicate::str::diff("2\n"));
    assert_ne!(std::fs::read(dir.path().join(".key")).unwrap(), key_before);

    seed_bank(dir.path(), "Après");
    let report = json_stdout(patrimoine(dir.path()).args(["check-integrity", "--full"]));
    assert_eq!(report["passed"], true);
}

#[test]
fn scheduled_backup_takes_daily_key_backup_once() {
    let dir = tempdir().unwrap();
    patrimoine(dir.path()).arg("init-db").assert().success();

    let first = json_stdout(patrimoine(dir.path()).arg("scheduled-backup"));
    assert!(first["backup"].as_str().unwrap().contains("scheduled_backup_"));
    assert!(first["key_backup"].is_object());

    let second = json_stdout(patrimoine(dir.path()).args(["scheduled-backup", "--keep", "1"]));
    assert!(second["key_backup"].is_null());
    assert_eq!(second["removed"].as_array().unwrap().len(), 1);
}
