// Versioned key-value record storage for the auction state.
//
// A single named record holds the entire serialized aggregate plus a version
// number and a last-modified timestamp. Writes replace the whole value; a
// write may carry the version it expects to replace, turning it into an
// atomic conditional update.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::auction::AuctionState;
use crate::error::StoreError;

/// One stored record.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedRecord {
    pub name: String,
    pub version: u64,
    pub value: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Durable home of the auction state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Latest value stored under `name`, if any.
    async fn read(&self, name: &str) -> Result<Option<VersionedRecord>, StoreError>;

    /// Upsert `value` under `name` with the given `version`.
    ///
    /// With `expected = Some(v)` the write only succeeds if the stored
    /// version is `v` (an absent record counts as version 0); otherwise it
    /// fails with [`StoreError::Conflict`] and nothing is written. With
    /// `expected = None` the write is unconditional.
    async fn write(
        &self,
        name: &str,
        value: serde_json::Value,
        version: u64,
        expected: Option<u64>,
    ) -> Result<VersionedRecord, StoreError>;
}

pub type SharedStore = Arc<dyn StateStore>;

fn check_expected(name: &str, found: Option<u64>, expected: Option<u64>) -> Result<(), StoreError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    if found.unwrap_or(0) != expected {
        return Err(StoreError::Conflict {
            name: name.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Typed helpers
// ---------------------------------------------------------------------------

/// Load and decode the auction state stored under `name`.
pub async fn load_state(
    store: &dyn StateStore,
    name: &str,
) -> Result<Option<AuctionState>, StoreError> {
    let Some(record) = store.read(name).await? else {
        return Ok(None);
    };
    let mut state: AuctionState =
        serde_json::from_value(record.value).map_err(|source| StoreError::Codec {
            name: name.to_string(),
            source,
        })?;
    state.version = record.version;
    Ok(Some(state))
}

/// Encode and write `state` under `name`, using `state.version` as the
/// record version.
pub async fn save_state(
    store: &dyn StateStore,
    name: &str,
    state: &AuctionState,
    expected: Option<u64>,
) -> Result<VersionedRecord, StoreError> {
    let value = serde_json::to_value(state).map_err(|source| StoreError::Codec {
        name: name.to_string(),
        source,
    })?;
    store.write(name, value, state.version, expected).await
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// SQLite-backed record store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database at `path` and ensure the table exists.
    /// Pass `":memory:"` for an ephemeral database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS auction_state (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                version    INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("database mutex poisoned".into()))
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn read(&self, name: &str) -> Result<Option<VersionedRecord>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT value, version, updated_at FROM auction_state WHERE key = ?1",
                params![name],
                |row| {
                    let value: String = row.get(0)?;
                    let version: i64 = row.get(1)?;
                    let updated_at: String = row.get(2)?;
                    Ok((value, version, updated_at))
                },
            )
            .optional()?;

        let Some((value, version, updated_at)) = row else {
            return Ok(None);
        };
        let value = serde_json::from_str(&value).map_err(|source| StoreError::Codec {
            name: name.to_string(),
            source,
        })?;
        Ok(Some(VersionedRecord {
            name: name.to_string(),
            version: version as u64,
            value,
            updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
        }))
    }

    async fn write(
        &self,
        name: &str,
        value: serde_json::Value,
        version: u64,
        expected: Option<u64>,
    ) -> Result<VersionedRecord, StoreError> {
        let json = serde_json::to_string(&value).map_err(|source| StoreError::Codec {
            name: name.to_string(),
            source,
        })?;
        let updated_at = Utc::now();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let found: Option<i64> = tx
            .query_row(
                "SELECT version FROM auction_state WHERE key = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        check_expected(name, found.map(|v| v as u64), expected)?;

        tx.execute(
            "INSERT INTO auction_state (key, value, version, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
                value      = excluded.value,
                version    = excluded.version,
                updated_at = excluded.updated_at",
            params![name, json, version as i64, updated_at.to_rfc3339()],
        )?;
        tx.commit()?;
        debug!("Stored record '{}' at version {}", name, version);

        Ok(VersionedRecord {
            name: name.to_string(),
            version,
            value,
            updated_at,
        })
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// In-memory store. `set_unavailable(true)` makes every call fail, which
/// is how tests simulate a storage outage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, VersionedRecord>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn records(&self) -> Result<MutexGuard<'_, HashMap<String, VersionedRecord>>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        self.records
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store mutex poisoned".into()))
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn read(&self, name: &str) -> Result<Option<VersionedRecord>, StoreError> {
        Ok(self.records()?.get(name).cloned())
    }

    async fn write(
        &self,
        name: &str,
        value: serde_json::Value,
        version: u64,
        expected: Option<u64>,
    ) -> Result<VersionedRecord, StoreError> {
        let mut records = self.records()?;
        check_expected(name, records.get(name).map(|r| r.version), expected)?;
        let record = VersionedRecord {
            name: name.to_string(),
            version,
            value,
            updated_at: Utc::now(),
        };
        records.insert(name.to_string(), record.clone());
        Ok(record)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
