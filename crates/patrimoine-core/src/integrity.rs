//! Decode-based integrity checks over the store.
//!
//! The fast check opens every encrypted attribute of a small sample per
//! entity kind. The complete scan opens every attribute of every row and
//! collects per-record corruption into a [`ScanReport`] instead of stopping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::codec::Codecs;
use crate::error::{Result, VaultError};
use crate::store::{
    AccountRecord, AssetRecord, BankRecord, EntityKind, HistoryPointRecord, SealedEntity, Store,
    UserRecord,
};

/// Outcome of a complete scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub scanned_at: DateTime<Utc>,
    pub total_scanned: usize,
    pub corrupted: usize,
    pub corrupted_items: Vec<CorruptedItem>,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorruptedItem {
    pub entity_kind: EntityKind,
    pub id: String,
    pub error: String,
}

pub struct IntegrityScanner<'a> {
    store: &'a Store,
    codecs: &'a Codecs,
}

impl<'a> IntegrityScanner<'a> {
    pub fn new(store: &'a Store, codecs: &'a Codecs) -> Self {
        Self { store, codecs }
    }

    /// Open every encrypted attribute of up to `sample_size` rows per kind.
    /// Stops at the first corrupted value; other errors propagate. An empty
    /// sample is a configuration error.
    pub fn quick_check(&self, sample_size: usize) -> Result<bool> {
        if sample_size == 0 {
            return Err(VaultError::Config(
                "integrity sample size must be positive".into(),
            ));
        }
        for kind in EntityKind::ALL {
            let checked = match kind {
                EntityKind::Asset => self.sample::<AssetRecord>(sample_size)?,
                EntityKind::Bank => self.sample::<BankRecord>(sample_size)?,
                EntityKind::Account => self.sample::<AccountRecord>(sample_size)?,
                EntityKind::User => self.sample::<UserRecord>(sample_size)?,
                EntityKind::HistoryPoint => self.sample::<HistoryPointRecord>(sample_size)?,
            };
            match checked {
                Some(n) => debug!(kind = %kind, rows = n, "sample decoded"),
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    /// `true` only when the sampled attributes all decode. Any failure,
    /// including store errors, is logged and reported as `false`.
    pub fn verify_database_integrity(&self, sample_size: usize) -> bool {
        match self.quick_check(sample_size) {
            Ok(true) => {
                info!(sample_size, "database integrity verified");
                true
            }
            Ok(false) => false,
            Err(e) => {
                error!(error = %e, "integrity verification failed");
                false
            }
        }
    }

    /// `Ok(None)` when a sampled row is corrupted.
    fn sample<E: SealedEntity>(&self, sample_size: usize) -> Result<Option<usize>> {
        let rows: Vec<E> = self.store.fetch(Some(sample_size))?;
        for row in &rows {
            match row.open_all(self.codecs) {
                Ok(()) => {}
                Err(VaultError::DataCorruption(e)) => {
                    warn!(kind = %E::KIND, id = row.id(), error = %e, "corrupted value in sample");
                    return Ok(None);
                }
                Err(other) => return Err(other),
            }
        }
        Ok(Some(rows.len()))
    }

    /// Decode every attribute of every row. Per-record corruption becomes a
    /// report entry; any other failure aborts the scan.
    pub fn perform_complete_integrity_scan(&self) -> Result<ScanReport> {
        let mut report = ScanReport {
            scanned_at: Utc::now(),
            total_scanned: 0,
            corrupted: 0,
            corrupted_items: Vec::new(),
            passed: false,
        };

        for kind in EntityKind::ALL {
            match kind {
                EntityKind::Asset => self.scan_all::<AssetRecord>(&mut report)?,
                EntityKind::Bank => self.scan_all::<BankRecord>(&mut report)?,
                EntityKind::Account => self.scan_all::<AccountRecord>(&mut report)?,
                EntityKind::User => self.scan_all::<UserRecord>(&mut report)?,
                EntityKind::HistoryPoint => self.scan_all::<HistoryPointRecord>(&mut report)?,
            }
        }

        report.corrupted = report.corrupted_items.len();
        report.passed = report.corrupted == 0;
        if report.passed {
            info!(total = report.total_scanned, "complete integrity scan passed");
        } else {
            error!(
                total = report.total_scanned,
                corrupted = report.corrupted,
                "complete integrity scan found corrupted records"
            );
        }
        Ok(report)
    }

    fn scan_all<E: SealedEntity>(&self, report: &mut ScanReport) -> Result<()> {
        let rows: Vec<E> = self.store.fetch(None)?;
        for row in &rows {
            report.total_scanned += 1;
            match row.open_all(self.codecs) {
                Ok(()) => {}
                Err(VaultError::DataCorruption(e)) => {
                    warn!(kind = %E::KIND, id = row.id(), field = %e.field, "corrupted record");
                    report.corrupted_items.push(CorruptedItem {
                        entity_kind: E::KIND,
                        id: row.id().to_string(),
                        error: e.to_string(),
                    });
                }
                Err(other) => return Err(other),
            }
        }
        debug!(kind = %E::KIND, rows = rows.len(), "kind scanned");
        Ok(())
    }
}
