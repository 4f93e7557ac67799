use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use patrimoine_core::codec::FieldCodec;
use patrimoine_core::store::{AssetRecord, Component, NewAsset, NewHistoryPoint, NewUser};
use patrimoine_core::{
    IntegrityCheckOutcome, KeyEnv, KeyManager, KeyProvider, Vault, VaultError, VaultPaths,
    VaultSettings,
};
use serde_json::json;
use tempfile::tempdir;

fn settings() -> VaultSettings {
    VaultSettings::default()
}

fn vault(dir: &Path) -> Vault {
    Vault::with_key_env(VaultPaths::new(dir), settings(), KeyEnv::default()).unwrap()
}

fn seed_portfolio(vault: &Vault) -> String {
    let store = vault.open_store().unwrap();
    let owner = store
        .insert_user(
            &NewUser {
                username: "dominique".into(),
                email: Some("dominique@example.fr".into()),
            },
            vault.codecs(),
        )
        .unwrap();
    let asset = store
        .insert_asset(
            &NewAsset {
                owner_id: owner,
                name: "PEA ETF World".into(),
                product_type: "etf".into(),
                category: "actions".into(),
                allocation: BTreeMap::from([("actions".to_string(), 100.0)]),
                geo_allocation: BTreeMap::from([
                    ("europe".to_string(), 30.0),
                    ("usa".to_string(), 70.0),
                ]),
                current_value: 12_500.0,
                cost_basis: Some(10_000.0),
                notes: Some("versements mensuels".into()),
                components: Some(vec![Component {
                    asset_id: "msci-world".into(),
                    percentage: 100.0,
                }]),
                ..Default::default()
            },
            vault.codecs(),
        )
        .unwrap();
    store
        .insert_history_point(
            &NewHistoryPoint {
                date: "2024-01-31".into(),
                assets: json!({ "PEA ETF World": 12500.0 }),
                total: 12_500.0,
            },
            vault.codecs(),
        )
        .unwrap();
    asset
}

fn asset_name(vault: &Vault) -> String {
    let assets: Vec<AssetRecord> = vault.open_store().unwrap().fetch(None).unwrap();
    assets[0].name.open(&vault.codecs().string).unwrap().unwrap()
}

#[test]
fn backup_survives_database_loss() {
    let dir = tempdir().unwrap();
    let vault = vault(dir.path());
    seed_portfolio(&vault);

    let report = vault.scheduled_backup(7).unwrap();
    fs::remove_file(vault.paths().database()).unwrap();

    let outcome = vault
        .backup_service()
        .restore_backup(&report.backup, &vault.paths().database())
        .unwrap();
    assert!(outcome.safety_copy.is_none());
    assert_eq!(asset_name(&vault), "PEA ETF World");
    assert!(vault.integrity_check(5, true).unwrap().passed());
}

#[test]
fn backup_from_another_key_cannot_be_restored() {
    let a = tempdir().unwrap();
    let b = tempdir().unwrap();
    let source = vault(a.path());
    seed_portfolio(&source);
    let container = source
        .backup_service()
        .create_backup(&source.paths().database(), None)
        .unwrap();

    let other = vault(b.path());
    other.keys().active_key().unwrap();
    let target = other.paths().database();
    let err = other
        .backup_service()
        .restore_backup(&container, &target)
        .unwrap_err();
    assert!(matches!(err, VaultError::BackupDecryption(_)));
    assert!(!target.exists());
}

#[test]
fn forced_reinit_keeps_old_rows_readable() {
    let dir = tempdir().unwrap();
    let paths = VaultPaths::new(dir.path());
    KeyManager::init_new_keys(&paths, settings().kdf_iterations, false).unwrap();
    let before = vault(dir.path());
    seed_portfolio(&before);
    drop(before);

    let manager = KeyManager::init_new_keys(&paths, settings().kdf_iterations, true).unwrap();
    assert_eq!(manager.current_version(), 2);
    let labels: Vec<String> = manager
        .list_backups()
        .unwrap()
        .into_iter()
        .map(|r| r.label)
        .collect();
    assert!(labels.iter().any(|l| l.starts_with("pre_init_v1_")));
    assert!(labels.contains(&"v2_initial".to_string()));

    let after = vault(dir.path());
    assert_eq!(after.keys().active_key().unwrap().version, 2);
    assert_eq!(asset_name(&after), "PEA ETF World");
}

#[test]
fn missing_archive_makes_old_rows_corrupt() {
    let dir = tempdir().unwrap();
    let first = vault(dir.path());
    let asset = seed_portfolio(&first);
    first.rotate_keys().unwrap();
    drop(first);

    fs::remove_dir_all(dir.path().join("key_backups")).unwrap();
    let reopened = vault(dir.path());
    match reopened.integrity_check(5, false).unwrap() {
        IntegrityCheckOutcome::Failed { report, .. } => {
            assert!(report.corrupted_items.iter().any(|i| i.id == asset));
            // user email and history point were sealed with the old key too
            assert_eq!(report.corrupted, 3);
        }
        IntegrityCheckOutcome::Passed { .. } => panic!("old rows decoded without their key"),
    }
}

#[test]
fn environment_secret_is_stable_across_opens() {
    let dir = tempdir().unwrap();
    let env = KeyEnv::with_secret("phrase de passe").salt(b"sel-de-test-1234".to_vec());

    let first = Vault::with_key_env(VaultPaths::new(dir.path()), settings(), env.clone()).unwrap();
    let blob = first.codecs().string.encode(Some(&"Livret A".to_string())).unwrap();

    let second = Vault::with_key_env(VaultPaths::new(dir.path()), settings(), env).unwrap();
    assert_eq!(
        second
            .codecs()
            .string
            .decode("name", blob.as_deref())
            .unwrap()
            .as_deref(),
        Some("Livret A")
    );
    assert!(!dir.path().join(".key").exists());
}
