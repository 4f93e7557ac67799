//! Field-level encryption core for the Patrimoine wealth tracker.
//!
//! Sensitive attributes (user email, bank and account labels, asset names,
//! notes and allocation maps) never reach the SQLite file in plaintext. They
//! pass through one of four column codecs which seal values with
//! XChaCha20-Poly1305 under a key derived by PBKDF2-HMAC-SHA256 from a master
//! secret and a persisted salt.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Vault (composition root)                                   │
//! │  ├── KeyStore        active key + archived fallbacks        │
//! │  ├── Codecs          string / json / mapping / sequence     │
//! │  ├── Store           SQLite rows with sealed attributes     │
//! │  ├── IntegrityScanner sampled + exhaustive decode passes    │
//! │  ├── KeyManager      versioned key backups                  │
//! │  └── BackupService   encrypted zip containers               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Decoding distinguishes an absent value (SQL `NULL`) from a value that is
//! present but fails authentication or structural validation. The latter is
//! always reported as [`DataCorruptionError`], never replaced by a default.

pub mod backup;
pub mod cipher;
pub mod codec;
pub mod corruption;
pub mod error;
pub mod files;
pub mod integrity;
pub mod key_manager;
pub mod keys;
pub mod paths;
pub mod settings;
pub mod store;
pub mod vault;

pub use backup::{rotate_backups, BackupManifest, BackupService, RestoreOutcome};
pub use codec::{
    Codecs, FieldCipher, FieldCodec, JsonCodec, ListCodec, MapCodec, Sealed, StringCodec,
};
pub use corruption::{classify, Classification, CorruptionKind, DecodeFault};
pub use error::{DataCorruptionError, Result, VaultError};
pub use integrity::{CorruptedItem, IntegrityScanner, ScanReport};
pub use key_manager::{KeyBackupPaths, KeyBackupRecord, KeyManager};
pub use keys::{KeyEnv, KeyMaterial, KeyMetadata, KeyProvider, KeyStore};
pub use paths::VaultPaths;
pub use settings::VaultSettings;
pub use store::{EntityKind, SealedEntity, Store};
pub use vault::{IntegrityCheckOutcome, ScheduledBackupReport, Vault};
