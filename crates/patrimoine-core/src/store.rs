//! SQLite persistence for entities with encrypted attributes.
//!
//! Sensitive columns hold codec blobs and are loaded as [`Sealed`] values;
//! nothing is decrypted until an attribute is opened. Plain columns
//! (types, categories, amounts, dates) are stored as-is.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::codec::{Codecs, FieldCodec, Sealed};
use crate::error::Result;

/// Current schema version
const SCHEMA_VERSION: i32 = 1;

// ── Entity kinds ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    User,
    Bank,
    Account,
    Asset,
    HistoryPoint,
}

impl EntityKind {
    /// Every kind, in integrity scan order.
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Asset,
        EntityKind::Bank,
        EntityKind::Account,
        EntityKind::User,
        EntityKind::HistoryPoint,
    ];

    pub fn table(self) -> &'static str {
        match self {
            EntityKind::User => "users",
            EntityKind::Bank => "banks",
            EntityKind::Account => "accounts",
            EntityKind::Asset => "assets",
            EntityKind::HistoryPoint => "history_points",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::User => "User",
            EntityKind::Bank => "Bank",
            EntityKind::Account => "Account",
            EntityKind::Asset => "Asset",
            EntityKind::HistoryPoint => "HistoryPoint",
        };
        f.write_str(name)
    }
}

// ── Plain inputs ────────────────────────────────────────────────────────────

/// One part of a composite asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub asset_id: String,
    pub percentage: f64,
}

#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub username: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewBank {
    pub owner_id: String,
    pub name: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewAccount {
    pub bank_id: String,
    pub kind: String,
    pub label: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewAsset {
    pub owner_id: String,
    pub account_id: Option<String>,
    pub name: String,
    pub product_type: String,
    pub category: String,
    pub allocation: BTreeMap<String, f64>,
    pub geo_allocation: BTreeMap<String, f64>,
    pub current_value: f64,
    pub cost_basis: Option<f64>,
    pub currency: String,
    pub notes: Option<String>,
    pub todo: Option<String>,
    pub components: Option<Vec<Component>>,
}

#[derive(Debug, Clone, Default)]
pub struct NewHistoryPoint {
    pub date: String,
    pub assets: serde_json::Value,
    pub total: f64,
}

// ── Sealed rows ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub email: Sealed,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct BankRecord {
    pub id: String,
    pub owner_id: String,
    pub name: Sealed,
    pub notes: Sealed,
}

#[derive(Debug, Clone)]
pub struct AccountRecord {
    pub id: String,
    pub bank_id: String,
    pub kind: String,
    pub label: Sealed,
}

#[derive(Debug, Clone)]
pub struct AssetRecord {
    pub id: String,
    pub owner_id: String,
    pub account_id: Option<String>,
    pub name: Sealed,
    pub product_type: String,
    pub category: String,
    pub allocation: Sealed,
    pub geo_allocation: Sealed,
    pub current_value: f64,
    pub cost_basis: Option<f64>,
    pub currency: String,
    pub notes: Sealed,
    pub todo: Sealed,
    pub components: Sealed,
}

#[derive(Debug, Clone)]
pub struct HistoryPointRecord {
    pub id: String,
    pub date: String,
    pub assets: Sealed,
    pub total: f64,
}

/// A row type with encrypted attributes.
pub trait SealedEntity: Sized {
    const KIND: EntityKind;

    fn id(&self) -> &str;

    /// Decode every encrypted attribute, stopping at the first failure.
    fn open_all(&self, codecs: &Codecs) -> Result<()>;

    fn load(conn: &Connection, limit: Option<usize>) -> rusqlite::Result<Vec<Self>>;
}

fn sql_limit(limit: Option<usize>) -> i64 {
    // SQLite treats a negative LIMIT as unbounded.
    limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX))
}

fn load_rows<T>(
    conn: &Connection,
    sql: &str,
    limit: Option<usize>,
    map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
) -> rusqlite::Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![sql_limit(limit)], map)?;
    rows.collect()
}

impl SealedEntity for UserRecord {
    const KIND: EntityKind = EntityKind::User;

    fn id(&self) -> &str {
        &self.id
    }

    fn open_all(&self, codecs: &Codecs) -> Result<()> {
        self.email.open(&codecs.string)?;
        Ok(())
    }

    fn load(conn: &Connection, limit: Option<usize>) -> rusqlite::Result<Vec<Self>> {
        load_rows(
            conn,
            "SELECT id, username, email, created_at FROM users ORDER BY rowid LIMIT ?1",
            limit,
            |row| {
                Ok(UserRecord {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    email: Sealed::new("email", row.get(2)?),
                    created_at: row.get(3)?,
                })
            },
        )
    }
}

impl SealedEntity for BankRecord {
    const KIND: EntityKind = EntityKind::Bank;

    fn id(&self) -> &str {
        &self.id
    }

    fn open_all(&self, codecs: &Codecs) -> Result<()> {
        self.name.open(&codecs.string)?;
        self.notes.open(&codecs.string)?;
        Ok(())
    }

    fn load(conn: &Connection, limit: Option<usize>) -> rusqlite::Result<Vec<Self>> {
        load_rows(
            conn,
            "SELECT id, owner_id, name, notes FROM banks ORDER BY rowid LIMIT ?1",
            limit,
            |row| {
                Ok(BankRecord {
                    id: row.get(0)?,
                    owner_id: row.get(1)?,
                    name: Sealed::new("name", row.get(2)?),
                    notes: Sealed::new("notes", row.get(3)?),
                })
            },
        )
    }
}

impl SealedEntity for AccountRecord {
    const KIND: EntityKind = EntityKind::Account;

    fn id(&self) -> &str {
        &self.id
    }

    fn open_all(&self, codecs: &Codecs) -> Result<()> {
        self.label.open(&codecs.string)?;
        Ok(())
    }

    fn load(conn: &Connection, limit: Option<usize>) -> rusqlite::Result<Vec<Self>> {
        load_rows(
            conn,
            "SELECT id, bank_id, kind, label FROM accounts ORDER BY rowid LIMIT ?1",
            limit,
            |row| {
                Ok(AccountRecord {
                    id: row.get(0)?,
                    bank_id: row.get(1)?,
                    kind: row.get(2)?,
                    label: Sealed::new("label", row.get(3)?),
                })
            },
        )
    }
}

impl SealedEntity for AssetRecord {
    const KIND: EntityKind = EntityKind::Asset;

    fn id(&self) -> &str {
        &self.id
    }

    fn open_all(&self, codecs: &Codecs) -> Result<()> {
        self.name.open(&codecs.string)?;
        self.allocation.open(&codecs.allocation)?;
        self.geo_allocation.open(&codecs.allocation)?;
        self.notes.open(&codecs.string)?;
        self.todo.open(&codecs.string)?;
        self.components.open(&codecs.components)?;
        Ok(())
    }

    fn load(conn: &Connection, limit: Option<usize>) -> rusqlite::Result<Vec<Self>> {
        load_rows(
            conn,
            "SELECT id, owner_id, account_id, name, product_type, category, allocation,
                    geo_allocation, current_value, cost_basis, currency, notes, todo, components
             FROM assets ORDER BY rowid LIMIT ?1",
            limit,
            |row| {
                Ok(AssetRecord {
                    id: row.get(0)?,
                    owner_id: row.get(1)?,
                    account_id: row.get(2)?,
                    name: Sealed::new("name", row.get(3)?),
                    product_type: row.get(4)?,
                    category: row.get(5)?,
                    allocation: Sealed::new("allocation", row.get(6)?),
                    geo_allocation: Sealed::new("geo_allocation", row.get(7)?),
                    current_value: row.get(8)?,
                    cost_basis: row.get(9)?,
                    currency: row.get(10)?,
                    notes: Sealed::new("notes", row.get(11)?),
                    todo: Sealed::new("todo", row.get(12)?),
                    components: Sealed::new("components", row.get(13)?),
                })
            },
        )
    }
}

impl SealedEntity for HistoryPointRecord {
    const KIND: EntityKind = EntityKind::HistoryPoint;

    fn id(&self) -> &str {
        &self.id
    }

    fn open_all(&self, codecs: &Codecs) -> Result<()> {
        self.assets.open(&codecs.json)?;
        Ok(())
    }

    fn load(conn: &Connection, limit: Option<usize>) -> rusqlite::Result<Vec<Self>> {
        load_rows(
            conn,
            "SELECT id, date, assets, total FROM history_points ORDER BY rowid LIMIT ?1",
            limit,
            |row| {
                Ok(HistoryPointRecord {
                    id: row.get(0)?,
                    date: row.get(1)?,
                    assets: Sealed::new("assets", row.get(2)?),
                    total: row.get(3)?,
                })
            },
        )
    }
}

// ── Store ───────────────────────────────────────────────────────────────────

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create the database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA synchronous = FULL;",
        )?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        debug!(path = %path.display(), "store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            [],
        )?;
        let current: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;
        if current < 1 {
            Self::migrate_v1(&conn)?;
        }
        Ok(())
    }

    /// Schema version 1. Encrypted columns are TEXT holding codec blobs.
    fn migrate_v1(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                email TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS banks (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT,
                notes TEXT,
                FOREIGN KEY (owner_id) REFERENCES users(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                bank_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                label TEXT,
                FOREIGN KEY (bank_id) REFERENCES banks(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS assets (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                account_id TEXT,
                name TEXT,
                product_type TEXT NOT NULL DEFAULT '',
                category TEXT NOT NULL DEFAULT '',
                allocation TEXT,
                geo_allocation TEXT,
                current_value REAL NOT NULL DEFAULT 0,
                cost_basis REAL,
                currency TEXT NOT NULL DEFAULT 'EUR',
                notes TEXT,
                todo TEXT,
                components TEXT,
                FOREIGN KEY (owner_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE SET NULL
            );

            CREATE INDEX IF NOT EXISTS idx_assets_owner ON assets(owner_id);

            CREATE TABLE IF NOT EXISTS history_points (
                id TEXT PRIMARY KEY,
                date TEXT NOT NULL,
                assets TEXT,
                total REAL NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_history_points_date ON history_points(date);
            "#,
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;
        Ok(())
    }

    // ── Inserts ─────────────────────────────────────────────────────────────

    pub fn insert_user(&self, user: &NewUser, codecs: &Codecs) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let email = codecs.string.encode(user.email.as_ref())?;
        self.conn.lock().execute(
            "INSERT INTO users (id, username, email, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, user.username, email, Utc::now().to_rfc3339()],
        )?;
        Ok(id)
    }

    pub fn insert_bank(&self, bank: &NewBank, codecs: &Codecs) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let name = codecs.string.encode(Some(&bank.name))?;
        let notes = codecs.string.encode(bank.notes.as_ref())?;
        self.conn.lock().execute(
            "INSERT INTO banks (id, owner_id, name, notes) VALUES (?1, ?2, ?3, ?4)",
            params![id, bank.owner_id, name, notes],
        )?;
        Ok(id)
    }

    pub fn insert_account(&self, account: &NewAccount, codecs: &Codecs) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let label = codecs.string.encode(Some(&account.label))?;
        self.conn.lock().execute(
            "INSERT INTO accounts (id, bank_id, kind, label) VALUES (?1, ?2, ?3, ?4)",
            params![id, account.bank_id, account.kind, label],
        )?;
        Ok(id)
    }

    pub fn insert_asset(&self, asset: &NewAsset, codecs: &Codecs) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let name = codecs.string.encode(Some(&asset.name))?;
        let allocation = codecs.allocation.encode(Some(&asset.allocation))?;
        let geo_allocation = codecs.allocation.encode(Some(&asset.geo_allocation))?;
        let notes = codecs.string.encode(asset.notes.as_ref())?;
        let todo = codecs.string.encode(asset.todo.as_ref())?;
        let components = codecs.components.encode(asset.components.as_ref())?;
        let currency = if asset.currency.is_empty() {
            "EUR"
        } else {
            asset.currency.as_str()
        };
        self.conn.lock().execute(
            "INSERT INTO assets (id, owner_id, account_id, name, product_type, category, allocation,
                                 geo_allocation, current_value, cost_basis, currency, notes, todo, components)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                id,
                asset.owner_id,
                asset.account_id,
                name,
                asset.product_type,
                asset.category,
                allocation,
                geo_allocation,
                asset.current_value,
                asset.cost_basis,
                currency,
                notes,
                todo,
                components,
            ],
        )?;
        Ok(id)
    }

    pub fn insert_history_point(&self, point: &NewHistoryPoint, codecs: &Codecs) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let assets = codecs.json.encode(Some(&point.assets))?;
        self.conn.lock().execute(
            "INSERT INTO history_points (id, date, assets, total) VALUES (?1, ?2, ?3, ?4)",
            params![id, point.date, assets, point.total],
        )?;
        Ok(id)
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    /// Rows of `E` in insertion order, at most `limit` of them.
    pub fn fetch<E: SealedEntity>(&self, limit: Option<usize>) -> Result<Vec<E>> {
        let conn = self.conn.lock();
        Ok(E::load(&conn, limit)?)
    }

    pub fn count(&self, kind: EntityKind) -> Result<u64> {
        let conn = self.conn.lock();
        let sql = format!("SELECT COUNT(*) FROM {}", kind.table());
        let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    /// Run `f` against the underlying connection.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock();
        Ok(f(&conn)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyMaterial;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn codecs() -> Codecs {
        Codecs::new(Arc::new(KeyMaterial::derive(
            b"store-test",
            b"0123456789abcdef",
            1_000,
            1,
        )))
    }

    #[test]
    fn sensitive_columns_are_not_plaintext() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("patrimoine.db");
        let codecs = codecs();
        {
            let store = Store::open(&path).unwrap();
            let owner = store
                .insert_user(
                    &NewUser {
                        username: "alice".into(),
                        email: Some("alice@example.fr".into()),
                    },
                    &codecs,
                )
                .unwrap();
            store
                .insert_bank(
                    &NewBank {
                        owner_id: owner,
                        name: "Banque Populaire".into(),
                        notes: Some("agence Lyon".into()),
                    },
                    &codecs,
                )
                .unwrap();
        }
        let raw = std::fs::read(&path).unwrap();
        let haystack = String::from_utf8_lossy(&raw);
        assert!(!haystack.contains("alice@example.fr"));
        assert!(!haystack.contains("Banque Populaire"));
        assert!(haystack.contains("alice"));
    }

    #[test]
    fn asset_roundtrip_through_sealed_rows() {
        let store = Store::open_in_memory().unwrap();
        let codecs = codecs();
        let owner = store
            .insert_user(&NewUser { username: "bob".into(), email: None }, &codecs)
            .unwrap();
        let mut allocation = BTreeMap::new();
        allocation.insert("actions".to_string(), 100.0);
        store
            .insert_asset(
                &NewAsset {
                    owner_id: owner,
                    name: "ETF Monde".into(),
                    allocation: allocation.clone(),
                    current_value: 1520.0,
                    components: Some(vec![Component {
                        asset_id: "x".into(),
                        percentage: 10.0,
                    }]),
                    ..Default::default()
                },
                &codecs,
            )
            .unwrap();

        let assets: Vec<AssetRecord> = store.fetch(None).unwrap();
        assert_eq!(assets.len(), 1);
        let asset = &assets[0];
        assert_eq!(asset.currency, "EUR");
        assert!(asset.notes.is_absent());
        assert_eq!(
            asset.name.open(&codecs.string).unwrap().as_deref(),
            Some("ETF Monde")
        );
        assert_eq!(asset.allocation.open(&codecs.allocation).unwrap(), Some(allocation));
        assert_eq!(
            asset.geo_allocation.open(&codecs.allocation).unwrap(),
            Some(BTreeMap::new())
        );
        asset.open_all(&codecs).unwrap();
    }

    #[test]
    fn fetch_respects_limit_and_count() {
        let store = Store::open_in_memory().unwrap();
        let codecs = codecs();
        for i in 0..7u32 {
            store
                .insert_history_point(
                    &NewHistoryPoint {
                        date: format!("2024-01-0{}", i + 1),
                        assets: serde_json::json!([{"id": i}]),
                        total: f64::from(i),
                    },
                    &codecs,
                )
                .unwrap();
        }
        let sample: Vec<HistoryPointRecord> = store.fetch(Some(5)).unwrap();
        assert_eq!(sample.len(), 5);
        assert_eq!(sample[0].date, "2024-01-01");
        assert_eq!(store.count(EntityKind::HistoryPoint).unwrap(), 7);
        assert_eq!(store.count(EntityKind::User).unwrap(), 0);
    }

    #[test]
    fn reopen_keeps_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("patrimoine.db");
        Store::open(&path).unwrap();
        let store = Store::open(&path).unwrap();
        let version: i32 = store
            .with_connection(|c| c.query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
