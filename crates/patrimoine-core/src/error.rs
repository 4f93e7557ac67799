use std::path::PathBuf;

use crate::corruption::CorruptionKind;

/// Result type for vault operations
pub type Result<T> = std::result::Result<T, VaultError>;

/// A ciphertext was present but could not be turned back into a value.
///
/// Carries the field name and a description of the failure. Never carries the
/// ciphertext itself or any key bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("field `{field}` is corrupted ({kind}): {detail}")]
pub struct DataCorruptionError {
    pub field: String,
    pub kind: CorruptionKind,
    pub detail: String,
}

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("no usable key material: {0}")]
    KeyUnavailable(String),

    #[error(
        "inconsistent key files: {} exists but {} is missing",
        .present.display(),
        .missing.display()
    )]
    FileConsistency { present: PathBuf, missing: PathBuf },

    #[error(transparent)]
    DataCorruption(#[from] DataCorruptionError),

    #[error("backup integrity violation: manifest hash {expected}, payload hash {actual}")]
    BackupIntegrity { expected: String, actual: String },

    #[error("backup container {} cannot be decrypted", .0.display())]
    BackupDecryption(PathBuf),

    #[error("backup container is malformed: {0}")]
    MalformedBackup(String),

    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("key files already exist in {} (use force to overwrite)", .0.display())]
    KeysAlreadyExist(PathBuf),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("encryption failed")]
    Encryption,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
