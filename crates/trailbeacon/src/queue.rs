//! Durable FIFO queue of samples awaiting delivery.
//!
//! Entries are ordered by a monotonically increasing `sequence_id` and are
//! removed only by [`DurableQueue::acknowledge`] or by capacity eviction.
//! When an enqueue pushes the queue over capacity the oldest entries are
//! dropped and logged: bounded storage wins over completeness.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::sample::LocationSample;
use crate::storage::{Storage, KEY_LAST_KNOWN_SAMPLE};

/// Default maximum number of queued samples.
pub const DEFAULT_CAPACITY: usize = 500;

/// A queued sample plus its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    /// Position in the queue; strictly increasing in creation order.
    pub sequence_id: i64,
    /// The sample awaiting delivery.
    pub sample: LocationSample,
    /// Number of completed delivery attempts.
    pub attempts: u32,
    /// When the last completed attempt finished.
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Persistent, capacity-bounded FIFO of [`QueueEntry`] values.
#[derive(Debug, Clone)]
pub struct DurableQueue {
    storage: Arc<Storage>,
    capacity: usize,
}

const SELECT_ENTRY: &str = r"
    SELECT sequence_id, device_id, latitude, longitude, captured_at, attempts, last_attempt_at
    FROM queue
";

impl DurableQueue {
    /// Create a queue on top of `storage`. Entries already persisted there are
    /// picked up as-is.
    ///
    /// A `capacity` of zero is treated as one.
    #[must_use]
    pub fn new(storage: Arc<Storage>, capacity: usize) -> Self {
        Self {
            storage,
            capacity: capacity.max(1),
        }
    }

    /// The configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The storage this queue persists to.
    #[must_use]
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Append a sample, evicting the oldest entries if over capacity.
    ///
    /// The sample is also recorded as the last known location.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageFull`] if the database has no room left, or
    /// another storage error if the write fails.
    pub fn enqueue(&self, sample: &LocationSample) -> Result<QueueEntry> {
        let capacity = i64::try_from(self.capacity).unwrap_or(i64::MAX);
        let last_known = serde_json::to_string(sample)?;

        let (sequence_id, evicted) = self.storage.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                r"
                INSERT INTO queue (device_id, latitude, longitude, captured_at)
                VALUES (?1, ?2, ?3, ?4)
                ",
                params![
                    sample.device_id,
                    sample.latitude,
                    sample.longitude,
                    sample.captured_at.to_rfc3339(),
                ],
            )
            .map_err(Error::from_sqlite)?;
            let sequence_id = tx.last_insert_rowid();

            let depth: i64 = tx.query_row("SELECT COUNT(*) FROM queue", [], |row| row.get(0))?;
            let mut evicted = Vec::new();
            if depth > capacity {
                let mut stmt = tx.prepare(
                    "SELECT sequence_id FROM queue ORDER BY sequence_id ASC LIMIT ?1",
                )?;
                evicted = stmt
                    .query_map([depth - capacity], |row| row.get::<_, i64>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                drop(stmt);
                for id in &evicted {
                    tx.execute("DELETE FROM queue WHERE sequence_id = ?1", [id])?;
                }
            }

            tx.execute(
                "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
                (KEY_LAST_KNOWN_SAMPLE, &last_known),
            )
            .map_err(Error::from_sqlite)?;
            tx.commit().map_err(Error::from_sqlite)?;
            Ok((sequence_id, evicted))
        })?;

        if !evicted.is_empty() {
            warn!(
                evicted = ?evicted,
                capacity = self.capacity,
                "Queue over capacity, dropped oldest samples"
            );
        }
        debug!(sequence_id, "Enqueued sample");

        Ok(QueueEntry {
            sequence_id,
            sample: sample.clone(),
            attempts: 0,
            last_attempt_at: None,
        })
    }

    /// Return the entry with the lowest sequence id without removing it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn peek_oldest(&self) -> Result<Option<QueueEntry>> {
        self.storage.with_conn(|conn| {
            let entry = conn
                .query_row(
                    &format!("{SELECT_ENTRY} ORDER BY sequence_id ASC LIMIT 1"),
                    [],
                    row_to_entry,
                )
                .optional()?;
            Ok(entry)
        })
    }

    /// Remove an entry after successful delivery.
    ///
    /// Acknowledging an id that is not queued is a no-op. Returns `true` if
    /// an entry was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn acknowledge(&self, sequence_id: i64) -> Result<bool> {
        let removed = self.storage.with_conn(|conn| {
            let affected = conn.execute("DELETE FROM queue WHERE sequence_id = ?1", [sequence_id])?;
            Ok(affected > 0)
        })?;
        if removed {
            debug!(sequence_id, "Acknowledged sample");
        }
        Ok(removed)
    }

    /// Count a completed delivery attempt against an entry.
    ///
    /// Returns `false` if the entry is no longer queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn record_attempt(&self, sequence_id: i64) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        self.storage.with_conn(|conn| {
            let affected = conn.execute(
                r"
                UPDATE queue SET attempts = attempts + 1, last_attempt_at = ?1
                WHERE sequence_id = ?2
                ",
                params![now, sequence_id],
            )?;
            Ok(affected > 0)
        })
    }

    /// Every queued entry in FIFO order. Nothing is removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn drain_all(&self) -> Result<Vec<QueueEntry>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_ENTRY} ORDER BY sequence_id ASC"))?;
            let entries = stmt
                .query_map([], row_to_entry)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }

    /// Number of queued entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn depth(&self) -> Result<usize> {
        let count: i64 = self.storage.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM queue", [], |row| row.get(0))?)
        })?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// The most recently enqueued sample, even if it has since been delivered.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn last_known_sample(&self) -> Result<Option<LocationSample>> {
        self.storage.get_meta_json(KEY_LAST_KNOWN_SAMPLE)
    }
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<QueueEntry> {
    let captured_at: String = row.get(4)?;
    let last_attempt_at: Option<String> = row.get(6)?;
    let captured_at = parse_time(&captured_at).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("invalid captured_at: {captured_at}").into(),
        )
    })?;

    Ok(QueueEntry {
        sequence_id: row.get(0)?,
        sample: LocationSample {
            device_id: row.get(1)?,
            latitude: row.get(2)?,
            longitude: row.get(3)?,
            captured_at,
        },
        attempts: row.get(5)?,
        last_attempt_at: last_attempt_at.as_deref().and_then(parse_time),
    })
}
