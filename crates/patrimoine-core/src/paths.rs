use directories::ProjectDirs;
use std::path::{Path, PathBuf};

use crate::error::{Result, VaultError};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "patrimoine";
pub const APP_NAME: &str = "patrimoine";

pub const DATA_DIR_ENV: &str = "PATRIMOINE_DATA_DIR";

pub const SALT_FILE: &str = ".salt";
pub const KEY_FILE: &str = ".key";
pub const METADATA_FILE: &str = ".key_metadata.json";
pub const DATABASE_FILE: &str = "patrimoine.db";

pub fn data_dir() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(DATA_DIR_ENV) {
        if !override_path.is_empty() {
            return Ok(PathBuf::from(override_path));
        }
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| VaultError::Config("cannot determine data directory".into()))?;
    Ok(dirs.data_dir().to_path_buf())
}

/// Every on-disk location the vault touches, rooted at one data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultPaths {
    root: PathBuf,
}

impl VaultPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve from `PATRIMOINE_DATA_DIR` or the platform data directory.
    pub fn discover() -> Result<Self> {
        Ok(Self::new(data_dir()?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn salt_file(&self) -> PathBuf {
        self.root.join(SALT_FILE)
    }

    pub fn key_file(&self) -> PathBuf {
        self.root.join(KEY_FILE)
    }

    pub fn metadata_file(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    pub fn key_backups_dir(&self) -> PathBuf {
        self.root.join("key_backups")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn database(&self) -> PathBuf {
        self.root.join(DATABASE_FILE)
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join("settings.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn env_override_wins() {
        std::env::set_var(DATA_DIR_ENV, "/tmp/patrimoine-test-root");
        let paths = VaultPaths::discover().unwrap();
        std::env::remove_var(DATA_DIR_ENV);
        assert_eq!(paths.root(), Path::new("/tmp/patrimoine-test-root"));
        assert_eq!(
            paths.database(),
            Path::new("/tmp/patrimoine-test-root/patrimoine.db")
        );
    }

    #[test]
    fn key_files_live_in_root() {
        let paths = VaultPaths::new("/data");
        assert_eq!(paths.salt_file(), Path::new("/data/.salt"));
        assert_eq!(paths.key_file(), Path::new("/data/.key"));
        assert_eq!(paths.metadata_file(), Path::new("/data/.key_metadata.json"));
        assert_eq!(paths.key_backups_dir(), Path::new("/data/key_backups"));
    }
}
