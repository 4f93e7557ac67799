//! Filesystem helpers shared by the key store, key manager and backup service.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::warn;

use crate::error::{Result, VaultError};

/// Timestamp format embedded in backup names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

pub fn timestamp_label(at: DateTime<Local>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn now_label() -> String {
    timestamp_label(Local::now())
}

/// Write `bytes` to `path` through a sibling temp file, fsync, then rename.
/// Readers never observe a partially written file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    restrict_permissions(tmp.path());
    tmp.persist(path).map_err(|e| VaultError::Io(e.error))?;
    sync_dir(dir);
    Ok(())
}

/// Copy `src` to `dst` and restrict the copy to the owner.
pub fn copy_private(src: &Path, dst: &Path) -> Result<()> {
    if !src.exists() {
        return Err(VaultError::NotFound(src.to_path_buf()));
    }
    fs::copy(src, dst)?;
    restrict_permissions(dst);
    Ok(())
}

/// Owner read/write only. Failure is logged, not fatal.
pub fn restrict_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
            warn!(path = %path.display(), error = %e, "failed to restrict file permissions");
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

pub fn restrict_dir_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
            warn!(path = %path.display(), error = %e, "failed to restrict directory permissions");
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

/// Return `dir/name`, or `dir/name_N` with the first free `N` when taken.
/// `name` is split at its first `.` so extensions stay at the end.
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.find('.') {
        Some(idx) => name.split_at(idx),
        None => (name, ""),
    };
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{stem}_{n}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(handle) = fs::File::open(dir) {
            let _ = handle.sync_all();
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}
