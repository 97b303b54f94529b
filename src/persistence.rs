//! # Persistence bridge
//!
//! ## Responsibility
//! Mirror client state to durable local storage and restore it on startup.
//! Values are stored as JSON under fixed keys, wrapped in a versioned
//! envelope:
//!
//! ```json
//! {"version": 1, "data": [...]}
//! ```
//!
//! Values written before the envelope existed (a bare JSON value) are read as
//! version 0 and migrated on the next write. Unknown versions and shape
//! mismatches are rejected with [`ChatError::Schema`].
//!
//! ## Guarantees
//! - Transcript writes are best-effort: failures are logged and swallowed, the
//!   in-memory operation is never blocked or failed.
//! - A rehydrated transcript never contains a streaming turn.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::{ComparisonResult, ReportRecord};
use crate::error::{ChatError, Result};
use crate::transcript::{Role, Turn};

pub const CHAT_HISTORY_KEY: &str = "docsync_chat_history";
pub const COMPARISON_RESULT_KEY: &str = "docsync_serverResult";
pub const REPORTS_KEY: &str = "docsync_reports";

pub const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Storage backends
// ---------------------------------------------------------------------------

/// String key/value storage.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// SQLite-backed storage: a single `kv` table in one database file.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(SqliteStorage { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Storage for SqliteStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn()
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |r| r.get(0))
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.conn().execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }
}

/// In-memory storage. Clones share the same map, so a test can keep a handle
/// and inspect what the bridge wrote.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    values: Arc<Mutex<HashMap<String, String>>>,
    fail_writes: Arc<Mutex<bool>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set`/`remove` fail, as a full quota would.
    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().unwrap_or_else(PoisonError::into_inner) = fail;
    }

    fn check_writable(&self) -> Result<()> {
        if *self.fail_writes.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(ChatError::Storage("quota exceeded".to_string()));
        }
        Ok(())
    }

    fn values(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check_writable()?;
        self.values().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.check_writable()?;
        self.values().remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Versioned values
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    version: u32,
    data: &'a T,
}

#[derive(Deserialize)]
struct Envelope {
    version: u32,
    data: serde_json::Value,
}

/// Serialize `value` under `key` in the current envelope version.
pub fn save_versioned<T: Serialize>(storage: &dyn Storage, key: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string(&EnvelopeRef { version: SCHEMA_VERSION, data: value })
        .map_err(|e| ChatError::Schema { key: key.to_string(), detail: e.to_string() })?;
    storage.set(key, &raw)
}

/// Read the value under `key`, migrating unversioned data.
pub fn load_versioned<T: DeserializeOwned>(storage: &dyn Storage, key: &str) -> Result<Option<T>> {
    let Some(raw) = storage.get(key)? else {
        return Ok(None);
    };
    let schema_err = |detail: String| ChatError::Schema { key: key.to_string(), detail };

    let value: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| schema_err(e.to_string()))?;

    let is_envelope = value
        .as_object()
        .is_some_and(|o| o.contains_key("version") && o.contains_key("data"));

    let data = if is_envelope {
        let envelope: Envelope =
            serde_json::from_value(value).map_err(|e| schema_err(e.to_string()))?;
        if envelope.version != SCHEMA_VERSION {
            return Err(schema_err(format!(
                "unsupported version {} (expected {})",
                envelope.version, SCHEMA_VERSION
            )));
        }
        envelope.data
    } else {
        info!(key, "migrating unversioned stored value");
        value
    };

    serde_json::from_value(data)
        .map(Some)
        .map_err(|e| schema_err(e.to_string()))
}

// ---------------------------------------------------------------------------
// Transcript bridge
// ---------------------------------------------------------------------------

/// Mirrors the transcript to storage under a fixed key.
pub struct PersistenceBridge {
    storage: Arc<dyn Storage>,
    key: String,
}

impl PersistenceBridge {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_key(storage, CHAT_HISTORY_KEY)
    }

    pub fn with_key(storage: Arc<dyn Storage>, key: impl Into<String>) -> Self {
        PersistenceBridge { storage, key: key.into() }
    }

    /// Write the full transcript. Failures are logged, never returned.
    pub fn save(&self, turns: &[Turn]) {
        if let Err(e) = save_versioned(self.storage.as_ref(), &self.key, &turns) {
            warn!(key = %self.key, error = %e, "transcript snapshot not persisted");
        }
    }

    /// Restore the persisted transcript.
    ///
    /// Missing or rejected data yields an empty transcript. Turns left
    /// streaming by an interrupted process are finalized.
    pub fn load(&self) -> Vec<Turn> {
        let mut turns: Vec<Turn> = match load_versioned(self.storage.as_ref(), &self.key) {
            Ok(Some(turns)) => turns,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(key = %self.key, error = %e, "discarding unreadable transcript");
                return Vec::new();
            }
        };

        let mut interrupted = 0usize;
        for turn in turns.iter_mut().filter(|t| t.streaming) {
            if turn.role == Role::Assistant {
                interrupted += 1;
            }
            turn.streaming = false;
        }
        if interrupted > 0 {
            warn!(key = %self.key, interrupted, "finalized turns left streaming by a previous run");
        }
        turns
    }
}

// ---------------------------------------------------------------------------
// Comparison result and reports
// ---------------------------------------------------------------------------

pub fn save_comparison(storage: &dyn Storage, result: &ComparisonResult) -> Result<()> {
    save_versioned(storage, COMPARISON_RESULT_KEY, result)
}

pub fn load_comparison(storage: &dyn Storage) -> Result<Option<ComparisonResult>> {
    load_versioned(storage, COMPARISON_RESULT_KEY)
}

/// Persisted reports, newest first. Unreadable data is treated as empty.
pub fn load_reports(storage: &dyn Storage) -> Vec<ReportRecord> {
    match load_versioned::<Vec<ReportRecord>>(storage, REPORTS_KEY) {
        Ok(reports) => reports.unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "discarding unreadable reports list");
            Vec::new()
        }
    }
}

/// Put `record` at the front of the reports list.
pub fn prepend_report(storage: &dyn Storage, record: ReportRecord) -> Result<Vec<ReportRecord>> {
    let mut reports = load_reports(storage);
    reports.insert(0, record);
    save_versioned(storage, REPORTS_KEY, &reports)?;
    Ok(reports)
}

pub fn clear_reports(storage: &dyn Storage) -> Result<()> {
    storage.remove(REPORTS_KEY)
}
