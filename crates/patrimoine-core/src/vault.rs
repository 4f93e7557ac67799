//! Composition root.
//!
//! A [`Vault`] owns the key store for one data directory and hands out the
//! codecs, store, backup service and key manager built on it. Archived key
//! sets found in the key backup directory are retained as decrypt-only
//! fallbacks.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use tracing::{error, info, warn};

use crate::backup::{rotate_backups, BackupService};
use crate::codec::Codecs;
use crate::error::{Result, VaultError};
use crate::integrity::{IntegrityScanner, ScanReport};
use crate::key_manager::{self, KeyBackupPaths, KeyManager};
use crate::keys::{KeyEnv, KeyProvider, KeyStore};
use crate::paths::VaultPaths;
use crate::settings::VaultSettings;
use crate::store::Store;

pub const SCHEDULED_PREFIX: &str = "scheduled_backup";
pub const INTEGRITY_PREFIX: &str = "integrity_check";
pub const DAILY_KEY_PREFIX: &str = "daily";

#[derive(Debug, Clone)]
pub struct ScheduledBackupReport {
    pub backup: PathBuf,
    pub removed: Vec<PathBuf>,
    /// Set when this run took the day's key backup.
    pub key_backup: Option<KeyBackupPaths>,
}

#[derive(Debug, Clone)]
pub enum IntegrityCheckOutcome {
    Passed {
        safety_backup: Option<PathBuf>,
    },
    Failed {
        safety_backup: Option<PathBuf>,
        report: ScanReport,
    },
}

impl IntegrityCheckOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, IntegrityCheckOutcome::Passed { .. })
    }
}

pub struct Vault {
    paths: VaultPaths,
    settings: VaultSettings,
    keys: Arc<KeyStore>,
    codecs: Codecs,
}

impl Vault {
    /// Open an existing vault. Never generates key material.
    pub fn open(paths: VaultPaths) -> Result<Self> {
        let settings = VaultSettings::load(&paths.settings_file())?;
        let keys = KeyStore::read_only(paths.clone(), settings.kdf_iterations);
        Self::assemble(paths, settings, keys)
    }

    /// Open a vault, generating key material on first use and taking the
    /// initial key backup.
    pub fn open_or_initialize(paths: VaultPaths) -> Result<Self> {
        fs::create_dir_all(paths.root())?;
        let settings = VaultSettings::load(&paths.settings_file())?;
        let keys = KeyStore::new(paths.clone(), settings.kdf_iterations);
        let vault = Self::assemble(paths, settings, keys)?;
        vault.keys.active_key()?;

        let manager = KeyManager::open(&vault.paths)?;
        if manager.check_keys_exist() {
            manager.create_initial_keys_backup()?;
        }
        Ok(vault)
    }

    /// Build from explicit parts. Used where the key environment must not come
    /// from the process.
    pub fn with_key_env(paths: VaultPaths, settings: VaultSettings, env: KeyEnv) -> Result<Self> {
        settings.validate()?;
        let keys = KeyStore::new(paths.clone(), settings.kdf_iterations).with_env(env);
        Self::assemble(paths, settings, keys)
    }

    fn assemble(paths: VaultPaths, settings: VaultSettings, keys: KeyStore) -> Result<Self> {
        for material in key_manager::archived_materials(&paths.key_backups_dir())? {
            keys.retain(material);
        }
        let keys = Arc::new(keys);
        let provider: Arc<dyn KeyProvider> = keys.clone();
        Ok(Self {
            paths,
            settings,
            keys,
            codecs: Codecs::new(provider),
        })
    }

    pub fn paths(&self) -> &VaultPaths {
        &self.paths
    }

    pub fn settings(&self) -> &VaultSettings {
        &self.settings
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    pub fn codecs(&self) -> &Codecs {
        &self.codecs
    }

    pub fn open_store(&self) -> Result<Store> {
        fs::create_dir_all(self.paths.root())?;
        Store::open(&self.paths.database())
    }

    pub fn backup_service(&self) -> BackupService {
        BackupService::new(
            self.codecs.cipher().clone(),
            self.settings.backup_description.clone(),
        )
    }

    pub fn key_manager(&self) -> Result<KeyManager> {
        KeyManager::open(&self.paths)
    }

    /// Archive the live keys and switch to fresh material under the next
    /// version. Earlier data stays readable through the archived set.
    pub fn rotate_keys(&self) -> Result<u32> {
        let mut manager = self.key_manager()?;
        let previous = self.keys.active_key()?;
        let (_, material) = manager.rotate_keys(self.settings.kdf_iterations)?;
        self.keys.retain((*previous).clone());
        self.keys.reload();
        Ok(material.version)
    }

    /// Container backup into the backups directory, rotation of older
    /// scheduled containers, and at most one key backup per calendar day.
    pub fn scheduled_backup(&self, keep: usize) -> Result<ScheduledBackupReport> {
        let dir = self.paths.backups_dir();
        let backup = self.backup_service().create_named_backup(
            &self.paths.database(),
            &dir,
            SCHEDULED_PREFIX,
        )?;
        let removed = rotate_backups(&dir, &format!("{SCHEDULED_PREFIX}_"), keep)?;

        let manager = self.key_manager()?;
        let key_backup = if !manager.check_keys_exist() {
            warn!(
                dir = %self.paths.root().display(),
                "no key files to back up, key material comes from the environment"
            );
            None
        } else if manager.has_backup_on(DAILY_KEY_PREFIX, Local::now().date_naive())? {
            None
        } else {
            Some(manager.backup_keys(DAILY_KEY_PREFIX)?)
        };

        info!(
            backup = %backup.display(),
            removed = removed.len(),
            key_backup = key_backup.is_some(),
            "scheduled backup complete"
        );
        Ok(ScheduledBackupReport {
            backup,
            removed,
            key_backup,
        })
    }

    /// Safety backup, sampled check, and a complete scan when the sample
    /// fails or `full` is set. A pass records the verification time.
    pub fn integrity_check(&self, sample_size: usize, full: bool) -> Result<IntegrityCheckOutcome> {
        if sample_size == 0 {
            return Err(VaultError::Config(
                "integrity sample size must be positive".into(),
            ));
        }
        let database = self.paths.database();
        let safety_backup = if database.exists() {
            Some(self.backup_service().create_named_backup(
                &database,
                &self.paths.backups_dir(),
                INTEGRITY_PREFIX,
            )?)
        } else {
            warn!(path = %database.display(), "no database yet, skipping safety backup");
            None
        };

        let store = self.open_store()?;
        let scanner = IntegrityScanner::new(&store, &self.codecs);
        let sample_ok = scanner.quick_check(sample_size)?;

        if sample_ok && !full {
            self.key_manager()?.update_verification_timestamp()?;
            info!(sample_size, "integrity check passed");
            return Ok(IntegrityCheckOutcome::Passed { safety_backup });
        }

        let report = scanner.perform_complete_integrity_scan()?;
        if report.passed {
            self.key_manager()?.update_verification_timestamp()?;
            return Ok(IntegrityCheckOutcome::Passed { safety_backup });
        }
        for item in &report.corrupted_items {
            error!(kind = %item.entity_kind, id = %item.id, error = %item.error, "corrupted record");
        }
        Ok(IntegrityCheckOutcome::Failed {
            safety_backup,
            report,
        })
    }
}
