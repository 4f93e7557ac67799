//! Key material discovery, derivation and caching.
//!
//! Resolution order for the active key:
//!
//! 1. `PATRIMOINE_SECRET_KEY` set: derive from the secret and a salt taken from
//!    `PATRIMOINE_ENCRYPTION_SALT`, else the `.salt` file. Nothing is written
//!    in this mode.
//! 2. `.salt` and `.key` both present: load them.
//! 3. Neither present and generation allowed: generate a salt and a random
//!    password, derive, persist both files atomically.
//!
//! Exactly one of `.salt` / `.key` present is a consistency error and is never
//! repaired automatically.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::cipher::{self, KEY_LEN, SALT_LEN};
use crate::error::{Result, VaultError};
use crate::files;
use crate::paths::VaultPaths;

pub const SECRET_ENV: &str = "PATRIMOINE_SECRET_KEY";
pub const SALT_ENV: &str = "PATRIMOINE_ENCRYPTION_SALT";

// ── Key material ────────────────────────────────────────────────────────────

/// A derived data key together with the salt and version it belongs to.
#[derive(Clone)]
pub struct KeyMaterial {
    pub salt: Vec<u8>,
    key: Zeroizing<[u8; KEY_LEN]>,
    pub version: u32,
    pub creation_date: DateTime<Utc>,
    pub last_verified: DateTime<Utc>,
}

impl KeyMaterial {
    /// Derive from a master secret with PBKDF2-HMAC-SHA256.
    pub fn derive(secret: &[u8], salt: &[u8], iterations: u32, version: u32) -> Self {
        let now = Utc::now();
        Self {
            salt: salt.to_vec(),
            key: cipher::derive_key(secret, salt, iterations),
            version,
            creation_date: now,
            last_verified: now,
        }
    }

    pub fn from_parts(salt: Vec<u8>, key: [u8; KEY_LEN], metadata: &KeyMetadata) -> Self {
        Self {
            salt,
            key: Zeroizing::new(key),
            version: metadata.version,
            creation_date: metadata.creation_date,
            last_verified: metadata.last_verified,
        }
    }

    /// Load a salt/key pair from disk. Metadata is optional; without it the
    /// material is treated as version 1.
    pub fn load(salt_path: &Path, key_path: &Path, metadata_path: Option<&Path>) -> Result<Self> {
        match (salt_path.exists(), key_path.exists()) {
            (true, true) => {}
            (true, false) => {
                return Err(VaultError::FileConsistency {
                    present: salt_path.to_path_buf(),
                    missing: key_path.to_path_buf(),
                })
            }
            (false, true) => {
                return Err(VaultError::FileConsistency {
                    present: key_path.to_path_buf(),
                    missing: salt_path.to_path_buf(),
                })
            }
            (false, false) => return Err(VaultError::NotFound(key_path.to_path_buf())),
        }

        let salt = read_salt(salt_path)?;
        let encoded = Zeroizing::new(fs::read_to_string(key_path)?);
        let key = decode_key(encoded.trim())?;

        let metadata = match metadata_path {
            Some(path) => KeyMetadata::load(path).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "unreadable key metadata, assuming version 1");
                None
            }),
            None => None,
        }
        .unwrap_or_else(KeyMetadata::initial);

        Ok(Self::from_parts(salt, *key, &metadata))
    }

    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    /// URL-safe base64 form stored in the `.key` file.
    pub fn encoded_key(&self) -> Zeroizing<String> {
        Zeroizing::new(URL_SAFE.encode(self.key.as_slice()))
    }

    /// Short non-reversible identifier, safe to log.
    pub fn fingerprint(&self) -> String {
        cipher::sha256_hex(self.key.as_slice())[..16].to_string()
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("fingerprint", &self.fingerprint())
            .field("version", &self.version)
            .field("creation_date", &self.creation_date)
            .field("last_verified", &self.last_verified)
            .finish_non_exhaustive()
    }
}

fn read_salt(path: &Path) -> Result<Vec<u8>> {
    let salt = fs::read(path)?;
    if salt.len() != SALT_LEN {
        return Err(VaultError::InvalidKey(format!(
            "salt file {} holds {} bytes, expected {SALT_LEN}",
            path.display(),
            salt.len()
        )));
    }
    Ok(salt)
}

fn decode_key(encoded: &str) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let bytes = Zeroizing::new(
        URL_SAFE
            .decode(encoded)
            .or_else(|_| URL_SAFE_NO_PAD.decode(encoded))
            .map_err(|e| VaultError::InvalidKey(format!("key file is not base64: {e}")))?,
    );
    if bytes.len() != KEY_LEN {
        return Err(VaultError::InvalidKey(format!(
            "key file decodes to {} bytes, expected {KEY_LEN}",
            bytes.len()
        )));
    }
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&bytes);
    Ok(key)
}

// ── Metadata ────────────────────────────────────────────────────────────────

/// Contents of `.key_metadata.json`.
///
/// Timestamps are written as RFC 3339. Files from earlier releases carry
/// naive local ISO 8601 times (`2024-01-01T10:00:00.123456`) and may omit
/// the timestamps entirely; both still load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub version: u32,
    #[serde(default = "Utc::now", deserialize_with = "timestamp::required")]
    pub creation_date: DateTime<Utc>,
    #[serde(default = "Utc::now", deserialize_with = "timestamp::required")]
    pub last_verified: DateTime<Utc>,
    #[serde(
        default,
        deserialize_with = "timestamp::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_updated: Option<DateTime<Utc>>,
}

mod timestamp {
    use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    const NAIVE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

    pub(super) fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
            return Some(at.with_timezone(&Utc));
        }
        let naive = NaiveDateTime::parse_from_str(raw, NAIVE_FORMAT).ok()?;
        Some(
            Local
                .from_local_datetime(&naive)
                .earliest()
                .map_or_else(|| naive.and_utc(), |at| at.with_timezone(&Utc)),
        )
    }

    pub(super) fn required<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).ok_or_else(|| D::Error::custom(format!("invalid timestamp `{raw}`")))
    }

    pub(super) fn optional<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|raw| {
                parse(&raw).ok_or_else(|| D::Error::custom(format!("invalid timestamp `{raw}`")))
            })
            .transpose()
    }
}

impl KeyMetadata {
    pub fn initial() -> Self {
        let now = Utc::now();
        Self {
            version: 1,
            creation_date: now,
            last_verified: now,
            last_updated: None,
        }
    }

    /// `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        files::write_atomic(path, &json)
    }
}

// ── Provider contract ───────────────────────────────────────────────────────

/// Source of the symmetric key used by the column codecs.
pub trait KeyProvider: Send + Sync {
    /// Key used for every new encryption.
    fn active_key(&self) -> Result<Arc<KeyMaterial>>;

    /// Decrypt-only keys from earlier versions, newest first.
    fn retired_keys(&self) -> Vec<Arc<KeyMaterial>> {
        Vec::new()
    }
}

impl KeyProvider for KeyMaterial {
    fn active_key(&self) -> Result<Arc<KeyMaterial>> {
        Ok(Arc::new(self.clone()))
    }
}

// ── Environment override ────────────────────────────────────────────────────

/// Master secret and salt supplied out of band.
#[derive(Clone, Default)]
pub struct KeyEnv {
    pub secret: Option<Zeroizing<String>>,
    pub salt: Option<Vec<u8>>,
}

impl KeyEnv {
    pub fn from_process() -> Self {
        let secret = std::env::var(SECRET_ENV)
            .ok()
            .filter(|s| !s.is_empty())
            .map(Zeroizing::new);
        let salt = std::env::var(SALT_ENV)
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| parse_salt(&s));
        Self { secret, salt }
    }

    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(Zeroizing::new(secret.into())),
            salt: None,
        }
    }

    pub fn salt(mut self, salt: impl Into<Vec<u8>>) -> Self {
        self.salt = Some(salt.into());
        self
    }
}

impl fmt::Debug for KeyEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyEnv")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("salt", &self.salt.as_ref().map(|s| s.len()))
            .finish()
    }
}

/// A salt variable holding URL-safe base64 of exactly 16 bytes is decoded;
/// anything else is taken as raw text.
fn parse_salt(raw: &str) -> Vec<u8> {
    match URL_SAFE
        .decode(raw)
        .or_else(|_| URL_SAFE_NO_PAD.decode(raw))
    {
        Ok(bytes) if bytes.len() == SALT_LEN => bytes,
        _ => raw.as_bytes().to_vec(),
    }
}

// ── Store ───────────────────────────────────────────────────────────────────

/// Caching key provider backed by the data directory.
pub struct KeyStore {
    paths: VaultPaths,
    iterations: u32,
    allow_generation: bool,
    env: KeyEnv,
    active: RwLock<Option<Arc<KeyMaterial>>>,
    retired: RwLock<Vec<Arc<KeyMaterial>>>,
}

impl KeyStore {
    /// Store that may generate fresh material on first use.
    pub fn new(paths: VaultPaths, iterations: u32) -> Self {
        Self {
            paths,
            iterations,
            allow_generation: true,
            env: KeyEnv::from_process(),
            active: RwLock::new(None),
            retired: RwLock::new(Vec::new()),
        }
    }

    /// Store that only loads existing material.
    pub fn read_only(paths: VaultPaths, iterations: u32) -> Self {
        Self {
            allow_generation: false,
            ..Self::new(paths, iterations)
        }
    }

    pub fn with_env(mut self, env: KeyEnv) -> Self {
        self.env = env;
        self
    }

    pub fn paths(&self) -> &VaultPaths {
        &self.paths
    }

    /// Drop the cached key so the next call re-reads the data directory.
    pub fn reload(&self) {
        *self.active.write() = None;
    }

    /// Keep `material` as a decrypt-only fallback.
    pub fn retain(&self, material: KeyMaterial) {
        let mut retired = self.retired.write();
        if retired.iter().any(|k| k.key() == material.key()) {
            return;
        }
        debug!(version = material.version, fingerprint = %material.fingerprint(), "retaining archived key");
        retired.push(Arc::new(material));
        retired.sort_by(|a, b| b.version.cmp(&a.version));
    }

    fn resolve(&self) -> Result<KeyMaterial> {
        let salt_path = self.paths.salt_file();
        let key_path = self.paths.key_file();
        let metadata_path = self.paths.metadata_file();

        if let Some(secret) = &self.env.secret {
            let salt = match &self.env.salt {
                Some(salt) => salt.clone(),
                None if salt_path.exists() => read_salt(&salt_path)?,
                None => {
                    return Err(VaultError::KeyUnavailable(format!(
                        "{SECRET_ENV} is set but neither {SALT_ENV} nor {} provides a salt",
                        salt_path.display()
                    )))
                }
            };
            let version = KeyMetadata::load(&metadata_path)
                .ok()
                .flatten()
                .map_or(1, |m| m.version);
            debug!(version, "deriving key from environment secret");
            return Ok(KeyMaterial::derive(
                secret.as_bytes(),
                &salt,
                self.iterations,
                version,
            ));
        }

        match (salt_path.exists(), key_path.exists()) {
            (false, false) if self.allow_generation => self.generate(),
            (false, false) => Err(VaultError::KeyUnavailable(format!(
                "no key files in {} and generation is disabled",
                self.paths.root().display()
            ))),
            _ => KeyMaterial::load(&salt_path, &key_path, Some(&metadata_path)),
        }
    }

    fn generate(&self) -> Result<KeyMaterial> {
        let material = generate_material(&self.paths, self.iterations, 1)?;
        info!(
            dir = %self.paths.root().display(),
            fingerprint = %material.fingerprint(),
            "generated new key material"
        );
        Ok(material)
    }
}

/// Create a random salt and password, derive a key and persist salt, key and
/// metadata atomically. Existing files are replaced.
pub(crate) fn generate_material(
    paths: &VaultPaths,
    iterations: u32,
    version: u32,
) -> Result<KeyMaterial> {
    let salt = cipher::generate_salt();
    let password = cipher::generate_secret();
    let material = KeyMaterial::derive(password.as_slice(), &salt, iterations, version);

    files::write_atomic(&paths.salt_file(), &salt)?;
    files::write_atomic(&paths.key_file(), material.encoded_key().as_bytes())?;
    KeyMetadata {
        version,
        creation_date: material.creation_date,
        last_verified: material.last_verified,
        last_updated: (version > 1).then_some(material.creation_date),
    }
    .save(&paths.metadata_file())?;
    Ok(material)
}

impl KeyProvider for KeyStore {
    fn active_key(&self) -> Result<Arc<KeyMaterial>> {
        if let Some(key) = self.active.read().as_ref() {
            return Ok(Arc::clone(key));
        }
        let mut slot = self.active.write();
        if let Some(key) = slot.as_ref() {
            return Ok(Arc::clone(key));
        }
        let key = Arc::new(self.resolve()?);
        *slot = Some(Arc::clone(&key));
        Ok(key)
    }

    fn retired_keys(&self) -> Vec<Arc<KeyMaterial>> {
        self.retired.read().clone()
    }
}
