//! `SQLite` schema definitions for trailbeacon.
//!
//! This module contains the SQL statements for creating and managing
//! the database schema.

/// SQL statement to create the outbound queue table.
///
/// `AUTOINCREMENT` keeps sequence ids strictly increasing: an id is never
/// handed out twice, even after the row holding it has been deleted.
pub const CREATE_QUEUE_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS queue (
    sequence_id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    captured_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_attempt_at TEXT
)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[CREATE_QUEUE_TABLE, CREATE_METADATA_TABLE];
