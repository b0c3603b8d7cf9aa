//! # SQLite Schema for SpiteStream
//!
//! This module defines the database schema used by the SQLite backend and
//! handles initialization.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  streams                    messages                                    │
//! │  ┌──────────────────┐       ┌──────────────────────────┐                │
//! │  │ stream_key (PK)  │◄──────│ stream_key               │                │
//! │  │ stream_id        │       │ stream_version           │ UNIQUE(key,ver)│
//! │  │ last_version     │       │ position (PK)            │                │
//! │  │ last_position    │       │ message_id               │ UNIQUE(key,id) │
//! │  └──────────────────┘       │ message_type, created_ms │                │
//! │                             │ json_data, json_metadata │                │
//! │  stream_limits              └──────────────────────────┘                │
//! │  ┌──────────────────┐                                                   │
//! │  │ stream_key (PK)  │       log_head                                    │
//! │  │ max_age          │       ┌──────────────────┐                        │
//! │  │ max_count        │       │ next_position    │ (single row)           │
//! │  └──────────────────┘       └──────────────────┘                        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Metadata streams (`$$<id>`) and the `$deleted` stream are ordinary rows in
//! `streams`/`messages`. `stream_limits` caches the newest metadata limits so
//! appends and reads don't have to decode metadata messages.
//!
//! ## Design Decisions
//!
//! ### Why a `log_head` row instead of `MAX(position) + 1`?
//!
//! Positions are never reused. If the newest message is deleted, `MAX`
//! would hand its position out again. The head row only moves forward.
//!
//! ### Why are the unique constraints named the way they are?
//!
//! The backend classifies constraint violations by the table/column list in
//! SQLite's error message (`streams.stream_key` vs `messages.message_id`).

use std::time::Duration;

use rusqlite::Connection;

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
///
/// No migrations yet: a mismatch is an error.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// Registry of streams, one row per existing stream.
///
/// # Columns
///
/// - `stream_key`: fixed-width key from [`StreamId::key`](crate::types::StreamId::key)
/// - `stream_id`: original caller id, returned by reads and listings
/// - `last_version`: newest version ever assigned (-1 for an empty stream)
/// - `last_position`: position of that message (-1 for an empty stream)
///
/// A PRIMARY KEY violation on `stream_key` is how "stream already exists"
/// surfaces for `NoStream` appends.
const CREATE_STREAMS: &str = r#"
CREATE TABLE IF NOT EXISTS streams (
    stream_key    TEXT PRIMARY KEY,
    stream_id     TEXT NOT NULL,
    last_version  INTEGER NOT NULL DEFAULT -1,
    last_position INTEGER NOT NULL DEFAULT -1
)
"#;

/// The message log.
///
/// # Invariants
///
/// - `position` strictly increases in commit order, never reused
/// - `stream_version` contiguous from 0 within a stream at append time
/// - `message_id` unique within a stream
const CREATE_MESSAGES: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    position       INTEGER PRIMARY KEY,
    stream_key     TEXT NOT NULL,
    stream_version INTEGER NOT NULL,
    message_id     TEXT NOT NULL,
    message_type   TEXT NOT NULL,
    created_ms     INTEGER NOT NULL,
    json_data      TEXT NOT NULL,
    json_metadata  TEXT
)
"#;

/// Enforces one message per (stream, version). Supports stream range scans.
const CREATE_MESSAGES_STREAM_VERSION_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS messages_stream_version
ON messages(stream_key, stream_version)
"#;

/// Enforces message id uniqueness per stream (the idempotency key).
const CREATE_MESSAGES_MESSAGE_ID_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS messages_stream_message_id
ON messages(stream_key, message_id)
"#;

/// Limits from the newest metadata message of each stream.
///
/// Keyed by the *target* stream's key, so limits set before the stream
/// exists still apply to its first append.
const CREATE_STREAM_LIMITS: &str = r#"
CREATE TABLE IF NOT EXISTS stream_limits (
    stream_key TEXT PRIMARY KEY,
    max_age    INTEGER,
    max_count  INTEGER
)
"#;

/// Single-row table holding the next global position to hand out.
const CREATE_LOG_HEAD: &str = r#"
CREATE TABLE IF NOT EXISTS log_head (
    id            INTEGER PRIMARY KEY CHECK (id = 0),
    next_position INTEGER NOT NULL
)
"#;

const SEED_LOG_HEAD: &str = "INSERT OR IGNORE INTO log_head (id, next_position) VALUES (0, 0)";

/// Key/value table for schema bookkeeping.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS spitestream_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Connection Setup
// =============================================================================

/// Applies per-connection settings.
///
/// WAL mode is a property of the database file and is set once in
/// [`Database::open`]; these pragmas must be set on every connection.
pub(crate) fn configure_connection(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA synchronous = NORMAL")?;
    Ok(())
}

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the SpiteStream schema in place.
///
/// # Ownership
///
/// `Database` owns its `Connection`; dropping it closes the connection.
/// The SQLite backend opens one `Database` to create the schema and then
/// works with short-lived connections of its own.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use spitestream::Database;
    ///
    /// let db = Database::open("messages.db")?;
    /// # Ok::<(), spitestream::Error>(())
    /// ```
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database, mostly for tests.
    ///
    /// In-memory databases are lost when the connection closes.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Consumes the wrapper and hands back the initialized connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    fn initialize(&mut self) -> Result<()> {
        // =====================================================================
        // Pragmas
        // =====================================================================

        // WAL: readers don't block the writer and vice versa.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;

        // =====================================================================
        // Create Tables
        // =====================================================================

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_STREAMS)?;
        self.conn.execute_batch(CREATE_MESSAGES)?;
        self.conn.execute_batch(CREATE_MESSAGES_STREAM_VERSION_INDEX)?;
        self.conn.execute_batch(CREATE_MESSAGES_MESSAGE_ID_INDEX)?;
        self.conn.execute_batch(CREATE_STREAM_LIMITS)?;
        self.conn.execute_batch(CREATE_LOG_HEAD)?;
        self.conn.execute_batch(SEED_LOG_HEAD)?;

        self.verify_or_set_version()?;

        Ok(())
    }

    /// Verifies the schema version, or sets it on a new database.
    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<String> = match self.conn.query_row(
            "SELECT value FROM spitestream_metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => Some(value),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO spitestream_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this build requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    #[cfg(test)]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================
