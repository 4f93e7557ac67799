//! Encrypted backup containers.
//!
//! A container is a deflated zip holding the data file and `metadata.json`,
//! sealed as a whole with the active key:
//!
//!   [ format | nonce | XChaCha20-Poly1305(zip) ]
//!
//! Restore never touches the target until the container has decrypted and the
//! data member's SHA-256 matches the manifest.

use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::cipher::{sha256_hex, BACKUP_AAD};
use crate::codec::FieldCipher;
use crate::error::{Result, VaultError};
use crate::files;

pub const BACKUP_FORMAT_VERSION: &str = "1.0";
pub const MANIFEST_MEMBER: &str = "metadata.json";
pub const CONTAINER_EXTENSION: &str = ".zip.enc";

const DEFAULT_MEMBER: &str = "patrimoine.db";

// ── Data Models ─────────────────────────────────────────────────────────────

/// `metadata.json` inside every container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub timestamp: DateTime<Utc>,
    pub db_hash: String,
    pub version: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub target: PathBuf,
    /// Copy of the previous target, when there was one.
    pub safety_copy: Option<PathBuf>,
    pub manifest: BackupManifest,
}

// ── Service ─────────────────────────────────────────────────────────────────

pub struct BackupService {
    cipher: FieldCipher,
    description: String,
}

impl BackupService {
    pub fn new(cipher: FieldCipher, description: impl Into<String>) -> Self {
        Self {
            cipher,
            description: description.into(),
        }
    }

    /// Package `source` into an encrypted container. Defaults to
    /// `backup_{timestamp}.zip.enc` next to the source.
    pub fn create_backup(&self, source: &Path, output: Option<&Path>) -> Result<PathBuf> {
        let output = match output {
            Some(path) => path.to_path_buf(),
            None => files::unique_path(
                parent_or_cwd(source),
                &format!("backup_{}{CONTAINER_EXTENSION}", files::now_label()),
            ),
        };
        self.create_backup_at(source, &output)
    }

    /// Same as [`create_backup`](Self::create_backup) with an explicit
    /// container name inside `dir`.
    pub fn create_named_backup(&self, source: &Path, dir: &Path, prefix: &str) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let output = files::unique_path(
            dir,
            &format!("{prefix}_{}{CONTAINER_EXTENSION}", files::now_label()),
        );
        self.create_backup_at(source, &output)
    }

    fn create_backup_at(&self, source: &Path, output: &Path) -> Result<PathBuf> {
        if !source.is_file() {
            error!(source = %source.display(), "backup source missing");
            return Err(VaultError::NotFound(source.to_path_buf()));
        }

        let data = fs::read(source)?;
        let manifest = BackupManifest {
            timestamp: Utc::now(),
            db_hash: sha256_hex(&data),
            version: BACKUP_FORMAT_VERSION.to_string(),
            description: self.description.clone(),
        };
        let member = source
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| *n != MANIFEST_MEMBER)
            .unwrap_or(DEFAULT_MEMBER);

        let archive = build_archive(member, &data, &manifest)?;
        let sealed = self.cipher.seal_bytes(&archive, BACKUP_AAD)?;
        files::write_atomic(output, &sealed)?;

        info!(
            source = %source.display(),
            output = %output.display(),
            hash = %manifest.db_hash,
            bytes = data.len(),
            "backup created"
        );
        Ok(output.to_path_buf())
    }

    /// Decrypt `backup`, verify its data member against the manifest hash and
    /// replace `target` with it. The previous target is copied aside first.
    pub fn restore_backup(&self, backup: &Path, target: &Path) -> Result<RestoreOutcome> {
        if !backup.is_file() {
            error!(backup = %backup.display(), "backup container missing");
            return Err(VaultError::NotFound(backup.to_path_buf()));
        }

        // ── Step 1: safety copy ─────────────────────────────────────────
        let safety_copy = if target.exists() {
            let name = target
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(DEFAULT_MEMBER);
            let copy = files::unique_path(
                parent_or_cwd(target),
                &format!("{name}.pre_restore_{}", files::now_label()),
            );
            files::copy_private(target, &copy)?;
            info!(target = %target.display(), copy = %copy.display(), "safety copy taken");
            Some(copy)
        } else {
            None
        };

        // ── Step 2: decrypt and unpack ──────────────────────────────────
        let (manifest, data) = self.unpack(backup)?;

        // ── Step 3: verify ──────────────────────────────────────────────
        let actual = sha256_hex(&data);
        if actual != manifest.db_hash {
            error!(
                backup = %backup.display(),
                expected = %manifest.db_hash,
                actual = %actual,
                "backup integrity check failed, target left untouched"
            );
            return Err(VaultError::BackupIntegrity {
                expected: manifest.db_hash,
                actual,
            });
        }

        // ── Step 4: replace ─────────────────────────────────────────────
        files::write_atomic(target, &data)?;
        info!(
            backup = %backup.display(),
            target = %target.display(),
            hash = %actual,
            "backup restored"
        );
        Ok(RestoreOutcome {
            target: target.to_path_buf(),
            safety_copy,
            manifest,
        })
    }

    /// Decrypt a container and return its manifest without restoring.
    pub fn read_manifest(&self, backup: &Path) -> Result<BackupManifest> {
        Ok(self.unpack(backup)?.0)
    }

    fn unpack(&self, backup: &Path) -> Result<(BackupManifest, Vec<u8>)> {
        let sealed = fs::read(backup)?;
        let archive = match self.cipher.open_bytes(&sealed, BACKUP_AAD)? {
            Ok(plain) => plain,
            Err(fault) => {
                error!(backup = %backup.display(), error = %fault, "backup decryption failed");
                return Err(VaultError::BackupDecryption(backup.to_path_buf()));
            }
        };
        read_archive(&archive)
    }
}

fn build_archive(member: &str, data: &[u8], manifest: &BackupManifest) -> Result<Vec<u8>> {
    let options = || SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    zip.start_file(member, options())?;
    zip.write_all(data)?;
    zip.start_file(MANIFEST_MEMBER, options())?;
    zip.write_all(&serde_json::to_vec_pretty(manifest)?)?;
    Ok(zip.finish()?.into_inner())
}

fn read_archive(bytes: &[u8]) -> Result<(BackupManifest, Vec<u8>)> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| VaultError::MalformedBackup(format!("not a zip archive: {e}")))?;

    let manifest: BackupManifest = {
        let mut entry = archive
            .by_name(MANIFEST_MEMBER)
            .map_err(|_| VaultError::MalformedBackup(format!("{MANIFEST_MEMBER} missing")))?;
        let mut raw = Vec::new();
        entry.read_to_end(&mut raw)?;
        serde_json::from_slice(&raw)
            .map_err(|e| VaultError::MalformedBackup(format!("{MANIFEST_MEMBER}: {e}")))?
    };

    let mut data_members = Vec::new();
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        if !entry.is_dir() && entry.name() != MANIFEST_MEMBER {
            data_members.push(i);
        }
    }
    let [index] = data_members.as_slice() else {
        return Err(VaultError::MalformedBackup(format!(
            "expected one data member, found {}",
            data_members.len()
        )));
    };

    let mut data = Vec::new();
    archive.by_index(*index)?.read_to_end(&mut data)?;
    Ok((manifest, data))
}

fn parent_or_cwd(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Delete all but the newest `keep` containers in `dir` whose name starts
/// with `prefix`. Returns the removed paths.
pub fn rotate_backups(dir: &Path, prefix: &str, keep: usize) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut found: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(prefix) || !name.ends_with(CONTAINER_EXTENSION) {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        found.push((modified, entry.path()));
    }
    if found.len() <= keep {
        return Ok(Vec::new());
    }

    // newest first
    found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
    let mut removed = Vec::new();
    for (_, path) in found.into_iter().skip(keep) {
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %path.display(), "old backup removed");
                removed.push(path);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove old backup"),
        }
    }
    Ok(removed)
}
