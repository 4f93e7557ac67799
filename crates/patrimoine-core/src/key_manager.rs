//! Versioned snapshots of the live key files.
//!
//! Every backup set is three files in the key backup directory sharing one
//! label: `salt_backup_{label}`, `key_backup_{label}`, `metadata_backup_{label}`.
//! Labels are `{prefix}_v{version}_{timestamp}` (or `v{version}_{timestamp}`
//! without a prefix) and `v{version}_initial` for the bootstrap snapshot.
//! Existing sets are never overwritten and initial sets are never pruned.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{Result, VaultError};
use crate::files;
use crate::keys::{self, KeyMaterial, KeyMetadata};
use crate::paths::VaultPaths;

const SALT_PREFIX: &str = "salt_backup_";
const KEY_PREFIX: &str = "key_backup_";
const METADATA_PREFIX: &str = "metadata_backup_";
const INITIAL_SUFFIX: &str = "_initial";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyBackupPaths {
    pub salt: PathBuf,
    pub key: PathBuf,
    pub metadata: PathBuf,
}

impl KeyBackupPaths {
    fn for_label(dir: &Path, label: &str) -> Self {
        Self {
            salt: dir.join(format!("{SALT_PREFIX}{label}")),
            key: dir.join(format!("{KEY_PREFIX}{label}")),
            metadata: dir.join(format!("{METADATA_PREFIX}{label}")),
        }
    }

    fn any_exists(&self) -> bool {
        self.salt.exists() || self.key.exists() || self.metadata.exists()
    }

    fn all_exist(&self) -> bool {
        self.salt.exists() && self.key.exists() && self.metadata.exists()
    }

    fn remove(&self) -> Result<()> {
        for path in [&self.salt, &self.key, &self.metadata] {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

/// One archived key set as found on disk.
#[derive(Debug, Clone, Serialize)]
pub struct KeyBackupRecord {
    pub label: String,
    pub version: u32,
    pub initial: bool,
    pub paths: KeyBackupPaths,
    #[serde(skip)]
    modified: SystemTime,
}

pub struct KeyManager {
    paths: VaultPaths,
    metadata: KeyMetadata,
}

impl KeyManager {
    /// Open the manager, creating the backup directory and the metadata file
    /// when missing. Unreadable metadata is an error and the file is left as
    /// it is, so the recorded version is never rolled back.
    pub fn open(paths: &VaultPaths) -> Result<Self> {
        let backups = paths.key_backups_dir();
        fs::create_dir_all(&backups)?;
        files::restrict_dir_permissions(&backups);

        let metadata_file = paths.metadata_file();
        let metadata = match KeyMetadata::load(&metadata_file) {
            Ok(Some(metadata)) => metadata,
            Ok(None) => {
                let metadata = KeyMetadata::initial();
                metadata.save(&metadata_file)?;
                info!(path = %metadata_file.display(), "created key metadata");
                metadata
            }
            Err(e) => {
                error!(path = %metadata_file.display(), error = %e, "key metadata unreadable");
                return Err(e);
            }
        };

        Ok(Self {
            paths: paths.clone(),
            metadata,
        })
    }

    pub fn current_version(&self) -> u32 {
        self.metadata.version
    }

    pub fn metadata(&self) -> &KeyMetadata {
        &self.metadata
    }

    pub fn check_keys_exist(&self) -> bool {
        self.paths.salt_file().exists() && self.paths.key_file().exists()
    }

    /// Bump the key version and persist it. The only version transition.
    pub fn increment_version(&mut self) -> Result<u32> {
        self.metadata.version += 1;
        self.metadata.last_updated = Some(Utc::now());
        self.save_metadata()?;
        info!(version = self.metadata.version, "key version incremented");
        Ok(self.metadata.version)
    }

    pub fn update_verification_timestamp(&mut self) -> Result<()> {
        self.metadata.last_verified = Utc::now();
        self.save_metadata()
    }

    fn save_metadata(&self) -> Result<()> {
        self.metadata.save(&self.paths.metadata_file())
    }

    /// Snapshot the live salt, key and metadata under a fresh label.
    pub fn backup_keys(&self, prefix: &str) -> Result<KeyBackupPaths> {
        let version = self.metadata.version;
        let base = if prefix.is_empty() {
            format!("v{version}_{}", files::now_label())
        } else {
            format!("{prefix}_v{version}_{}", files::now_label())
        };

        let dir = self.paths.key_backups_dir();
        let mut label = base.clone();
        let mut n = 1u32;
        while KeyBackupPaths::for_label(&dir, &label).any_exists() {
            label = format!("{base}_{n}");
            n += 1;
        }

        let target = self.copy_live_files(&label)?;
        info!(label = %label, version, "key backup created");
        Ok(target)
    }

    /// Snapshot labelled `v{version}_initial`. Returns the existing set
    /// untouched when one is already present.
    pub fn create_initial_keys_backup(&self) -> Result<KeyBackupPaths> {
        let label = format!("v{}{INITIAL_SUFFIX}", self.metadata.version);
        let existing = KeyBackupPaths::for_label(&self.paths.key_backups_dir(), &label);
        if existing.any_exists() {
            info!(label = %label, "initial key backup already present");
            return Ok(existing);
        }
        let target = self.copy_live_files(&label)?;
        info!(label = %label, "initial key backup created");
        Ok(target)
    }

    fn copy_live_files(&self, label: &str) -> Result<KeyBackupPaths> {
        let salt = self.paths.salt_file();
        let key = self.paths.key_file();
        for live in [&salt, &key] {
            if !live.exists() {
                error!(path = %live.display(), "cannot back up keys, live file missing");
                return Err(VaultError::NotFound(live.clone()));
            }
        }
        let metadata = self.paths.metadata_file();
        if !metadata.exists() {
            self.save_metadata()?;
        }

        let dir = self.paths.key_backups_dir();
        fs::create_dir_all(&dir)?;
        let target = KeyBackupPaths::for_label(&dir, label);
        files::copy_private(&salt, &target.salt)?;
        files::copy_private(&key, &target.key)?;
        files::copy_private(&metadata, &target.metadata)?;
        Ok(target)
    }

    /// Every complete backup set, oldest first.
    pub fn list_backups(&self) -> Result<Vec<KeyBackupRecord>> {
        list_backup_sets(&self.paths.key_backups_dir())
    }

    /// Rebuild the key material archived under `label`.
    pub fn load_backup_material(&self, label: &str) -> Result<KeyMaterial> {
        let paths = KeyBackupPaths::for_label(&self.paths.key_backups_dir(), label);
        if !paths.key.exists() && !paths.salt.exists() {
            return Err(VaultError::NotFound(paths.key));
        }
        KeyMaterial::load(&paths.salt, &paths.key, Some(&paths.metadata))
    }

    /// True when a `{prefix}_v*` set was taken on `day`.
    pub fn has_backup_on(&self, prefix: &str, day: NaiveDate) -> Result<bool> {
        let head = format!("{prefix}_v");
        let stamp = format!("_{}_", day.format("%Y%m%d"));
        Ok(self
            .list_backups()?
            .iter()
            .any(|r| r.label.starts_with(&head) && r.label.contains(&stamp)))
    }

    /// Keep the newest `keep` non-initial sets. Returns removed labels.
    pub fn prune_backups(&self, keep: usize) -> Result<Vec<String>> {
        let mut rotating: Vec<KeyBackupRecord> = self
            .list_backups()?
            .into_iter()
            .filter(|r| !r.initial)
            .collect();
        if rotating.len() <= keep {
            return Ok(Vec::new());
        }
        let excess = rotating.len() - keep;
        let mut removed = Vec::with_capacity(excess);
        for record in rotating.drain(..excess) {
            record.paths.remove()?;
            info!(label = %record.label, "pruned key backup");
            removed.push(record.label);
        }
        Ok(removed)
    }

    /// Archive the live keys, then replace them with fresh material under
    /// the next version. Data written before the rotation stays readable
    /// through the archived set.
    pub fn rotate_keys(&mut self, iterations: u32) -> Result<(KeyBackupPaths, KeyMaterial)> {
        let archived = self.backup_keys("rotation")?;
        let mut material = keys::generate_material(&self.paths, iterations, self.metadata.version)?;
        self.reload_metadata()?;
        material.version = self.increment_version()?;
        info!(version = material.version, fingerprint = %material.fingerprint(), "keys rotated");
        Ok((archived, material))
    }

    fn reload_metadata(&mut self) -> Result<()> {
        let path = self.paths.metadata_file();
        self.metadata = KeyMetadata::load(&path)?.ok_or(VaultError::NotFound(path))?;
        Ok(())
    }

    /// Bootstrap fresh key material in the data directory and take the
    /// initial backup. Refuses to replace existing key files unless `force`
    /// is set; a forced re-initialisation archives the old set first and
    /// moves to the next version.
    pub fn init_new_keys(paths: &VaultPaths, iterations: u32, force: bool) -> Result<Self> {
        let existing = paths.salt_file().exists() || paths.key_file().exists();
        if existing && !force {
            error!(dir = %paths.root().display(), "key files already exist");
            return Err(VaultError::KeysAlreadyExist(paths.root().to_path_buf()));
        }
        fs::create_dir_all(paths.root())?;
        files::restrict_dir_permissions(paths.root());

        let mut manager = Self::open(paths)?;
        let replacing = existing && manager.check_keys_exist();
        if replacing {
            manager.backup_keys("pre_init")?;
        }

        let material = keys::generate_material(paths, iterations, manager.metadata.version)?;
        manager.reload_metadata()?;
        if existing {
            manager.increment_version()?;
        }
        manager.create_initial_keys_backup()?;
        info!(
            version = manager.metadata.version,
            fingerprint = %material.fingerprint(),
            "new keys initialised"
        );
        Ok(manager)
    }
}

/// Complete backup sets in `dir`, oldest first. Reads only; a missing
/// directory yields an empty list.
pub fn list_backup_sets(dir: &Path) -> Result<Vec<KeyBackupRecord>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(label) = name.to_str().and_then(|n| n.strip_prefix(KEY_PREFIX)) else {
            continue;
        };
        let paths = KeyBackupPaths::for_label(dir, label);
        if !paths.all_exist() {
            warn!(label, "incomplete key backup set skipped");
            continue;
        }
        let version = KeyMetadata::load(&paths.metadata)
            .ok()
            .flatten()
            .map(|m| m.version)
            .or_else(|| version_from_label(label))
            .unwrap_or(1);
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        records.push(KeyBackupRecord {
            label: label.to_string(),
            version,
            initial: label.ends_with(INITIAL_SUFFIX),
            paths,
            modified,
        });
    }
    records.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.label.cmp(&b.label)));
    Ok(records)
}

/// Load every archived key set in `dir`. Unreadable sets are skipped.
pub fn archived_materials(dir: &Path) -> Result<Vec<KeyMaterial>> {
    let mut materials = Vec::new();
    for record in list_backup_sets(dir)? {
        match KeyMaterial::load(&record.paths.salt, &record.paths.key, Some(&record.paths.metadata)) {
            Ok(material) => materials.push(material),
            Err(e) => warn!(label = %record.label, error = %e, "archived key set unreadable"),
        }
    }
    Ok(materials)
}

fn version_from_label(label: &str) -> Option<u32> {
    label
        .split('_')
        .find_map(|part| part.strip_prefix('v').and_then(|v| v.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TEST_ITERATIONS: u32 = 1_000;

    fn fresh(dir: &Path) -> (VaultPaths, KeyManager) {
        let paths = VaultPaths::new(dir);
        let manager = KeyManager::init_new_keys(&paths, TEST_ITERATIONS, false).unwrap();
        (paths, manager)
    }

    #[test]
    fn init_creates_keys_and_initial_backup() {
        let dir = tempdir().unwrap();
        let (paths, manager) = fresh(dir.path());
        assert!(manager.check_keys_exist());
        assert_eq!(manager.current_version(), 1);
        let backups = manager.list_backups().unwrap();
        assert_eq!(backups.len(), 1);
        assert!(backups[0].initial);
        assert_eq!(backups[0].label, "v1_initial");
        assert_eq!(
            fs::read(&backups[0].paths.key).unwrap(),
            fs::read(paths.key_file()).unwrap()
        );
    }

    #[test]
    fn init_refuses_existing_keys_without_force() {
        let dir = tempdir().unwrap();
        let (paths, _) = fresh(dir.path());
        let before = fs::read(paths.key_file()).unwrap();
        let err = KeyManager::init_new_keys(&paths, TEST_ITERATIONS, false).err().unwrap();
        assert!(matches!(err, VaultError::KeysAlreadyExist(_)));
        assert_eq!(fs::read(paths.key_file()).unwrap(), before);
    }

    #[test]
    fn forced_init_archives_previous_set() {
        let dir = tempdir().unwrap();
        let (paths, _) = fresh(dir.path());
        let before = fs::read(paths.key_file()).unwrap();
        let manager = KeyManager::init_new_keys(&paths, TEST_ITERATIONS, true).unwrap();
        assert_ne!(fs::read(paths.key_file()).unwrap(), before);
        assert_eq!(manager.current_version(), 2);
        let labels: Vec<String> = manager
            .list_backups()
            .unwrap()
            .into_iter()
            .map(|r| r.label)
            .collect();
        assert!(labels.iter().any(|l| l == "v1_initial"));
        assert!(labels.iter().any(|l| l == "v2_initial"));
        assert!(labels.iter().any(|l| l.starts_with("pre_init_v1_")));
    }

    #[test]
    fn backups_never_collide() {
        let dir = tempdir().unwrap();
        let (_, manager) = fresh(dir.path());
        let a = manager.backup_keys("manual").unwrap();
        let b = manager.backup_keys("manual").unwrap();
        let c = manager.backup_keys("").unwrap();
        assert_ne!(a.key, b.key);
        assert!(a.key.exists() && b.key.exists() && c.key.exists());
        assert!(c
            .key
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("key_backup_v1_"));
        assert_eq!(manager.list_backups().unwrap().len(), 4);
    }

    #[cfg(unix)]
    #[test]
    fn backup_copies_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let (_, manager) = fresh(dir.path());
        let set = manager.backup_keys("perm").unwrap();
        for path in [&set.salt, &set.key, &set.metadata] {
            let mode = fs::metadata(path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn backup_without_live_files_is_not_found() {
        let dir = tempdir().unwrap();
        let paths = VaultPaths::new(dir.path());
        let manager = KeyManager::open(&paths).unwrap();
        assert!(!manager.check_keys_exist());
        assert!(matches!(
            manager.backup_keys("x"),
            Err(VaultError::NotFound(_))
        ));
    }

    #[test]
    fn version_increments_and_persists() {
        let dir = tempdir().unwrap();
        let (paths, mut manager) = fresh(dir.path());
        assert_eq!(manager.increment_version().unwrap(), 2);
        assert!(manager.metadata().last_updated.is_some());
        let reopened = KeyManager::open(&paths).unwrap();
        assert_eq!(reopened.current_version(), 2);
    }

    #[test]
    fn corrupt_metadata_is_reported_and_left_alone() {
        let dir = tempdir().unwrap();
        let paths = VaultPaths::new(dir.path());
        fs::write(paths.metadata_file(), b"{ not json").unwrap();
        assert!(matches!(
            KeyManager::open(&paths),
            Err(VaultError::Serialization(_))
        ));
        assert_eq!(fs::read(paths.metadata_file()).unwrap(), b"{ not json");
    }

    #[test]
    fn naive_timestamps_keep_their_version() {
        let dir = tempdir().unwrap();
        let paths = VaultPaths::new(dir.path());
        fs::write(
            paths.metadata_file(),
            r#"{"version": 3, "creation_date": "2024-01-01T10:00:00.123456", "last_verified": "2024-01-01T10:00:00.123456"}"#,
        )
        .unwrap();

        let mut manager = KeyManager::open(&paths).unwrap();
        assert_eq!(manager.current_version(), 3);
        assert_eq!(manager.increment_version().unwrap(), 4);
        let saved = KeyMetadata::load(&paths.metadata_file()).unwrap().unwrap();
        assert_eq!(saved.version, 4);
    }

    #[test]
    fn verification_timestamp_moves_forward() {
        let dir = tempdir().unwrap();
        let (paths, mut manager) = fresh(dir.path());
        let before = manager.metadata().last_verified;
        manager.update_verification_timestamp().unwrap();
        let saved = KeyMetadata::load(&paths.metadata_file()).unwrap().unwrap();
        assert!(saved.last_verified >= before);
    }

    #[test]
    fn prune_keeps_newest_and_initial() {
        let dir = tempdir().unwrap();
        let (_, manager) = fresh(dir.path());
        for _ in 0..4 {
            manager.backup_keys("daily").unwrap();
        }
        let removed = manager.prune_backups(1).unwrap();
        assert_eq!(removed.len(), 3);
        let remaining = manager.list_backups().unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().any(|r| r.initial));

        // nothing but the initial set survives keep = 0
        manager.prune_backups(0).unwrap();
        let remaining = manager.list_backups().unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].initial);
    }

    #[test]
    fn archived_material_matches_live_key() {
        let dir = tempdir().unwrap();
        let (paths, manager) = fresh(dir.path());
        let live = KeyMaterial::load(&paths.salt_file(), &paths.key_file(), None).unwrap();
        let archived = manager.load_backup_material("v1_initial").unwrap();
        assert_eq!(live.key(), archived.key());
        assert_eq!(archived.version, 1);
        assert!(matches!(
            manager.load_backup_material("nope"),
            Err(VaultError::NotFound(_))
        ));
    }

    #[test]
    fn rotation_archives_then_replaces() {
        let dir = tempdir().unwrap();
        let (paths, mut manager) = fresh(dir.path());
        let old = KeyMaterial::load(&paths.salt_file(), &paths.key_file(), None).unwrap();
        let (archived, new) = manager.rotate_keys(TEST_ITERATIONS).unwrap();
        assert_eq!(new.version, 2);
        assert_eq!(manager.current_version(), 2);
        assert_ne!(old.key(), new.key());
        let label = archived
            .key
            .file_name()
            .unwrap()
            .to_string_lossy()
            .trim_start_matches(KEY_PREFIX)
            .to_string();
        let restored = manager.load_backup_material(&label).unwrap();
        assert_eq!(restored.key(), old.key());
        assert_eq!(restored.version, 1);
    }

    #[test]
    fn daily_detection_matches_prefix_and_day() {
        let dir = tempdir().unwrap();
        let (_, manager) = fresh(dir.path());
        let today = chrono::Local::now().date_naive();
        assert!(!manager.has_backup_on("daily", today).unwrap());
        manager.backup_keys("daily").unwrap();
        assert!(manager.has_backup_on("daily", today).unwrap());
        assert!(!manager.has_backup_on("weekly", today).unwrap());
    }

    #[test]
    fn version_parsed_from_label() {
        assert_eq!(version_from_label("daily_v3_20240101_101010"), Some(3));
        assert_eq!(version_from_label("v12_initial"), Some(12));
        assert_eq!(version_from_label("nothing"), None);
    }
}
