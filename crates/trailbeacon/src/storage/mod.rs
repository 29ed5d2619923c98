//! Storage layer for trailbeacon.
//!
//! This module provides the `SQLite` database that backs the durable queue
//! and the small amount of long-lived device state (identity, emergency
//! contact, last known location, last successful delivery).

pub mod migrations;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Metadata key for the device identity.
pub const KEY_DEVICE_ID: &str = "device_id";
/// Metadata key for the emergency contact (JSON).
pub const KEY_EMERGENCY_CONTACT: &str = "emergency_contact";
/// Metadata key for the most recently captured sample (JSON).
pub const KEY_LAST_KNOWN_SAMPLE: &str = "last_known_sample";
/// Metadata key for the time of the last successful delivery (RFC 3339).
pub const KEY_LAST_SUCCESS_AT: &str = "last_success_at";

/// How long a statement waits on another process holding the write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// `SQLite`-backed persistent storage.
///
/// The single connection sits behind one mutex; every operation holds it for
/// the duration of one statement or transaction.
#[derive(Debug)]
pub struct Storage {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Mutex<Connection>,
}

impl Storage {
    /// Open or create a storage database at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening database at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        migrations::initialize_schema(&conn)?;

        info!("Database opened at {}", path.display());
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory storage instance for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;

        migrations::initialize_schema(&conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        })
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` with exclusive access to the connection.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().map_err(|_| Error::StoragePoisoned)?;
        f(&mut conn)
    }

    /// Read a metadata value.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let value = conn
                .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(value)
        })
    }

    /// Write a metadata value, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
                (key, value),
            )
            .map_err(Error::from_sqlite)?;
            Ok(())
        })
    }

    /// Store `value` under `key` unless the key already exists, then return
    /// whichever value is stored. The first writer wins, across connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn insert_meta_if_absent(&self, key: &str, value: &str) -> Result<String> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO metadata (key, value) VALUES (?1, ?2)",
                (key, value),
            )
            .map_err(Error::from_sqlite)?;
            let stored: String = tx.query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                [key],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(stored)
        })
    }

    /// Remove a metadata value. Returns `true` if it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn delete_meta(&self, key: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let affected = conn.execute("DELETE FROM metadata WHERE key = ?1", [key])?;
            Ok(affected > 0)
        })
    }

    /// Read a JSON-encoded metadata value.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails or the stored value
    /// does not decode as `T`.
    pub fn get_meta_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get_meta(key)?
            .map(|raw| serde_json::from_str(&raw).map_err(Error::from))
            .transpose()
    }

    /// Write a JSON-encoded metadata value.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the database operation fails.
    pub fn set_meta_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set_meta(key, &raw)
    }

    /// Time of the last successful delivery, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn last_success_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .get_meta(KEY_LAST_SUCCESS_AT)?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    /// Record the time of a successful delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn set_last_success_at(&self, at: DateTime<Utc>) -> Result<()> {
        self.set_meta(KEY_LAST_SUCCESS_AT, &at.to_rfc3339())
    }

    /// Get database statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<StorageStats> {
        let (queue_depth, oldest, newest) = self.with_conn(|conn| {
            let row = conn.query_row(
                "SELECT COUNT(*), MIN(captured_at), MAX(captured_at) FROM queue",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )?;
            Ok(row)
        })?;

        let parse = |s: Option<String>| {
            s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc))
        };

        let db_size_bytes = if self.path.to_string_lossy() == ":memory:" {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(StorageStats {
            queue_depth: usize::try_from(queue_depth).unwrap_or(0),
            oldest_entry: parse(oldest),
            newest_entry: parse(newest),
            db_size_bytes,
        })
    }
}

/// Statistics about the storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStats {
    /// Number of samples waiting for delivery.
    pub queue_depth: usize,
    /// Capture time of the oldest queued sample.
    pub oldest_entry: Option<DateTime<Utc>>,
    /// Capture time of the newest queued sample.
    pub newest_entry: Option<DateTime<Utc>>,
    /// Size of the database file in bytes.
    pub db_size_bytes: u64,
}
