use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cipher::MIN_KDF_ITERATIONS;
use crate::error::{Result, VaultError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultSettings {
    /// PBKDF2 rounds used when deriving the data key.
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
    /// Records sampled per entity kind by the fast integrity check.
    #[serde(default = "default_sample_size")]
    pub integrity_sample_size: usize,
    /// Scheduled container backups kept after rotation.
    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,
    #[serde(default = "default_description")]
    pub backup_description: String,
}

fn default_kdf_iterations() -> u32 {
    MIN_KDF_ITERATIONS
}

fn default_sample_size() -> usize {
    5
}

fn default_backup_retention() -> usize {
    7
}

fn default_description() -> String {
    "Patrimoine database backup".into()
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            kdf_iterations: default_kdf_iterations(),
            integrity_sample_size: default_sample_size(),
            backup_retention: default_backup_retention(),
            backup_description: default_description(),
        }
    }
}

impl VaultSettings {
    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kdf_iterations < MIN_KDF_ITERATIONS {
            return Err(VaultError::Config(format!(
                "kdf_iterations must be at least {MIN_KDF_ITERATIONS}, got {}",
                self.kdf_iterations
            )));
        }
        if self.integrity_sample_size == 0 {
            return Err(VaultError::Config(
                "integrity_sample_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let settings = VaultSettings::load(&dir.path().join("settings.json")).unwrap();
        assert_eq!(settings, VaultSettings::default());
        assert_eq!(settings.kdf_iterations, 100_000);
        assert_eq!(settings.backup_retention, 7);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"integrity_sample_size": 12}"#).unwrap();
        let settings = VaultSettings::load(&path).unwrap();
        assert_eq!(settings.integrity_sample_size, 12);
        assert_eq!(settings.kdf_iterations, 100_000);
    }

    #[test]
    fn weak_iteration_count_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"kdf_iterations": 1000}"#).unwrap();
        assert!(matches!(
            VaultSettings::load(&path),
            Err(VaultError::Config(_))
        ));
    }
}
