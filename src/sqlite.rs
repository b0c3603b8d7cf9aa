//! # SQLite Backend
//!
//! [`SqliteBackend`] implements [`Backend`] on top of rusqlite.
//!
//! ## Connection Model
//!
//! ```text
//!   engine call ──► spawn_blocking ──► open connection ──► BEGIN IMMEDIATE
//!                                                              │
//!                                             statements ◄─────┘
//!                                                  │
//!                                   COMMIT (or drop = ROLLBACK) ──► close
//! ```
//!
//! File databases get a fresh connection per operation, so no connection is
//! held across awaits or for a subscription's lifetime. In-memory databases
//! can't be reopened, so they share one connection behind a mutex.
//!
//! Writes use `BEGIN IMMEDIATE`: the write lock is taken up front, which
//! serializes appends and turns lock contention into `SQLITE_BUSY` (retried
//! by the append engine) instead of a failed upgrade halfway through.
//!
//! ## Cancellation
//!
//! While a call runs, a watcher task waits on the call's cancellation token
//! and fires the connection's interrupt handle. The statement in flight fails
//! with `SQLITE_INTERRUPT`, the open transaction is dropped (rolled back), and
//! the call reports [`Error::Cancelled`]. Writes also check the token right
//! before `COMMIT`. A call blocked on a locked database notices the
//! cancellation once the lock frees or the busy timeout runs out.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{ffi, params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{
    AppendOutcome, AppendRequest, Backend, DeleteOutcome, LimitsUpdate, MessageRow, StreamListing,
    StreamSlice, UniqueConstraintKind,
};
use crate::error::{Error, Result};
use crate::schema::{configure_connection, Database};
use crate::types::{
    ExpectedVersion, MessageId, NewStreamMessage, Pattern, Position, ReadDirection, StreamHead,
    StreamId, StreamKey, StreamVersion,
};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for [`SqliteBackend`].
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// How long a connection waits on a locked database before `SQLITE_BUSY`.
    ///
    /// Default: 5 seconds
    pub busy_timeout: Duration,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Columns every message query selects, in [`map_message`] order.
const MESSAGE_COLUMNS: &str =
    "m.position, m.stream_version, m.message_id, m.message_type, m.created_ms, m.json_metadata";

// =============================================================================
// SqliteBackend
// =============================================================================

enum ConnectionSource {
    File(PathBuf),
    Memory(Mutex<Connection>),
}

/// SQLite implementation of [`Backend`].
pub struct SqliteBackend {
    source: ConnectionSource,
    config: SqliteConfig,
}

impl SqliteBackend {
    /// Opens (and if needed creates) a database file.
    pub fn open(path: impl AsRef<Path>, config: SqliteConfig) -> Result<Self> {
        // Creates the schema and switches the file to WAL once.
        let _ = Database::open(path.as_ref())?;
        Ok(Self {
            source: ConnectionSource::File(path.as_ref().to_path_buf()),
            config,
        })
    }

    /// An in-memory database. Everything is lost when the backend drops.
    pub fn open_in_memory() -> Result<Self> {
        let config = SqliteConfig::default();
        let conn = Database::open_in_memory()?.into_connection();
        configure_connection(&conn, config.busy_timeout)?;
        Ok(Self {
            source: ConnectionSource::Memory(Mutex::new(conn)),
            config,
        })
    }

    fn with_conn<T>(
        &self,
        cancel: &CancellationToken,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        check_cancelled(cancel)?;
        match &self.source {
            ConnectionSource::File(path) => {
                let mut conn = Connection::open(path)?;
                configure_connection(&conn, self.config.busy_timeout)?;
                interruptible(&mut conn, cancel, f)
            }
            ConnectionSource::Memory(conn) => {
                let mut guard = conn
                    .lock()
                    .map_err(|_| Error::TaskFailed("in-memory connection lock poisoned".to_string()))?;
                interruptible(&mut guard, cancel, f)
            }
        }
    }
}

/// Runs `f` on `conn`, interrupting it if `cancel` fires meanwhile.
///
/// The watcher needs a Tokio runtime; outside one only the checks at the
/// call boundaries apply.
fn interruptible<T>(
    conn: &mut Connection,
    cancel: &CancellationToken,
    f: impl FnOnce(&mut Connection) -> Result<T>,
) -> Result<T> {
    let watcher = tokio::runtime::Handle::try_current().ok().map(|runtime| {
        let interrupt = conn.get_interrupt_handle();
        let cancel = cancel.clone();
        runtime.spawn(async move {
            cancel.cancelled().await;
            interrupt.interrupt();
        })
    });

    let result = f(conn);
    if let Some(watcher) = watcher {
        watcher.abort();
    }

    match result {
        Err(_) if cancel.is_cancelled() => Err(Error::Cancelled),
        other => other,
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

// =============================================================================
// Transaction Helpers
// =============================================================================

fn stream_head(conn: &Connection, key: &StreamKey) -> Result<Option<StreamHead>> {
    let head = conn
        .query_row(
            "SELECT last_version, last_position FROM streams WHERE stream_key = ?1",
            params![key.as_str()],
            |row| {
                Ok(StreamHead {
                    version: StreamVersion::from_raw(row.get(0)?),
                    position: Position::from_raw(row.get(1)?),
                })
            },
        )
        .optional()?;
    Ok(head)
}

fn stream_limits(conn: &Connection, key: &StreamKey) -> Result<(Option<u64>, Option<usize>)> {
    let limits = conn
        .query_row(
            "SELECT max_age, max_count FROM stream_limits WHERE stream_key = ?1",
            params![key.as_str()],
            |row| Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, Option<i64>>(1)?)),
        )
        .optional()?;
    Ok(match limits {
        Some((max_age, max_count)) => (
            max_age.map(|v| v.max(0) as u64),
            max_count.map(|v| v.max(0) as usize),
        ),
        None => (None, None),
    })
}

fn write_limits(conn: &Connection, limits: &LimitsUpdate) -> Result<()> {
    conn.execute(
        "INSERT INTO stream_limits (stream_key, max_age, max_count) VALUES (?1, ?2, ?3)
         ON CONFLICT(stream_key) DO UPDATE SET max_age = excluded.max_age, max_count = excluded.max_count",
        params![
            limits.key.as_str(),
            limits.max_age.map(|v| v as i64),
            limits.max_count.map(|v| v as i64),
        ],
    )?;
    Ok(())
}

/// Appends inside an open transaction. The caller commits.
fn append_in_tx(
    conn: &Connection,
    stream_id: &StreamId,
    key: &StreamKey,
    expected: ExpectedVersion,
    messages: &[NewStreamMessage],
    created_ms: u64,
) -> Result<AppendOutcome> {
    let current = match expected {
        ExpectedVersion::NoStream => {
            // PK violation here is the "stream exists" conflict signal.
            conn.execute(
                "INSERT INTO streams (stream_key, stream_id) VALUES (?1, ?2)",
                params![key.as_str(), stream_id.as_str()],
            )?;
            StreamHead {
                version: StreamVersion::NONE,
                position: Position::END,
            }
        }
        ExpectedVersion::Any => {
            conn.execute(
                "INSERT OR IGNORE INTO streams (stream_key, stream_id) VALUES (?1, ?2)",
                params![key.as_str(), stream_id.as_str()],
            )?;
            stream_head(conn, key)?
                .ok_or_else(|| Error::Schema(format!("stream row for '{}' missing after insert", stream_id)))?
        }
        ExpectedVersion::EmptyStream | ExpectedVersion::Exact(_) => {
            let want = match expected {
                ExpectedVersion::Exact(v) => v,
                _ => StreamVersion::NONE,
            };
            match stream_head(conn, key)? {
                Some(head) if head.version == want => head,
                _ => return Ok(AppendOutcome::VersionMismatch),
            }
        }
    };

    let head = insert_messages(conn, key, current, messages, created_ms)?;
    let (_, max_count) = stream_limits(conn, key)?;
    Ok(AppendOutcome::Committed { head, max_count })
}

fn insert_messages(
    conn: &Connection,
    key: &StreamKey,
    current: StreamHead,
    messages: &[NewStreamMessage],
    created_ms: u64,
) -> Result<StreamHead> {
    if messages.is_empty() {
        return Ok(current);
    }

    let first_position: i64 =
        conn.query_row("SELECT next_position FROM log_head WHERE id = 0", [], |row| row.get(0))?;

    let mut version = current.version.as_raw();
    let mut position = first_position - 1;
    {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO messages
                 (position, stream_key, stream_version, message_id, message_type, created_ms, json_data, json_metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for message in messages {
            version += 1;
            position += 1;
            stmt.execute(params![
                position,
                key.as_str(),
                version,
                message.message_id.to_string(),
                message.message_type,
                created_ms as i64,
                message.json_data,
                message.json_metadata,
            ])?;
        }
    }

    conn.execute(
        "UPDATE log_head SET next_position = ?1 WHERE id = 0",
        params![position + 1],
    )?;
    conn.execute(
        "UPDATE streams SET last_version = ?2, last_position = ?3 WHERE stream_key = ?1",
        params![key.as_str(), version, position],
    )?;

    Ok(StreamHead {
        version: StreamVersion::from_raw(version),
        position: Position::from_raw(position),
    })
}

/// Appends a tombstone to `$deleted` inside an open transaction.
fn append_tombstone(conn: &Connection, tombstone: &NewStreamMessage, created_ms: u64) -> Result<Position> {
    let deleted = StreamId::deleted();
    match append_in_tx(
        conn,
        &deleted,
        &deleted.key(),
        ExpectedVersion::Any,
        std::slice::from_ref(tombstone),
        created_ms,
    )? {
        AppendOutcome::Committed { head, .. } => Ok(head.position),
        AppendOutcome::VersionMismatch => Err(Error::Schema(
            "version check failed on an unconditional tombstone append".to_string(),
        )),
    }
}

fn delete_stream_rows(conn: &Connection, key: &StreamKey) -> Result<()> {
    conn.execute("DELETE FROM messages WHERE stream_key = ?1", params![key.as_str()])?;
    conn.execute("DELETE FROM streams WHERE stream_key = ?1", params![key.as_str()])?;
    Ok(())
}

/// Maps the leading [`MESSAGE_COLUMNS`] plus the payload column at index 6.
fn map_message(row: &Row<'_>, stream_id: StreamId, key: StreamKey, max_age: Option<u64>) -> rusqlite::Result<MessageRow> {
    let raw_id: String = row.get(2)?;
    let uuid = Uuid::parse_str(&raw_id).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let created_ms: i64 = row.get(4)?;

    Ok(MessageRow {
        stream_id,
        key,
        message_id: MessageId::from_uuid(uuid),
        message_type: row.get(3)?,
        stream_version: StreamVersion::from_raw(row.get(1)?),
        position: Position::from_raw(row.get(0)?),
        created_ms: created_ms.max(0) as u64,
        json_metadata: row.get(5)?,
        json_data: row.get(6)?,
        max_age,
    })
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn is_unique_violation(code: &ffi::Error) -> bool {
    code.code == ErrorCode::ConstraintViolation
        && (code.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
            || code.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
}

// =============================================================================
// Backend Implementation
// =============================================================================

impl Backend for SqliteBackend {
    fn append(&self, request: &AppendRequest, cancel: &CancellationToken) -> Result<AppendOutcome> {
        self.with_conn(cancel, |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let outcome = append_in_tx(
                &tx,
                &request.stream_id,
                &request.key,
                request.expected,
                &request.messages,
                request.created_ms,
            )?;

            if let AppendOutcome::Committed { .. } = outcome {
                if let Some(limits) = &request.limits {
                    write_limits(&tx, limits)?;
                }
                check_cancelled(cancel)?;
                tx.commit()?;
            }
            Ok(outcome)
        })
    }

    fn unique_constraint_kind(&self, err: &Error) -> UniqueConstraintKind {
        match err {
            Error::Sqlite(rusqlite::Error::SqliteFailure(code, message)) if is_unique_violation(code) => {
                let message = message.as_deref().unwrap_or_default();
                if message.contains("streams.stream_key") {
                    UniqueConstraintKind::StreamExists
                } else if message.contains("messages.message_id") {
                    UniqueConstraintKind::MessageIdExists
                } else {
                    UniqueConstraintKind::Other
                }
            }
            _ => UniqueConstraintKind::Other,
        }
    }

    fn is_deadlock(&self, err: &Error) -> bool {
        matches!(
            err,
            Error::Sqlite(rusqlite::Error::SqliteFailure(code, _))
                if matches!(code.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    }

    fn read_stream(
        &self,
        key: &StreamKey,
        from: StreamVersion,
        direction: ReadDirection,
        limit: usize,
        prefetch: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<StreamSlice>> {
        self.with_conn(cancel, |conn| {
            // One read transaction so header and rows come from the same snapshot.
            let tx = conn.transaction()?;

            let header = tx
                .query_row(
                    "SELECT stream_id, last_version, last_position FROM streams WHERE stream_key = ?1",
                    params![key.as_str()],
                    |row| {
                        Ok((
                            StreamId::new(row.get::<_, String>(0)?),
                            StreamHead {
                                version: StreamVersion::from_raw(row.get(1)?),
                                position: Position::from_raw(row.get(2)?),
                            },
                        ))
                    },
                )
                .optional()?;
            let Some((stream_id, head)) = header else {
                return Ok(None);
            };
            let (max_age, max_count) = stream_limits(&tx, key)?;

            let data_column = if prefetch { "m.json_data" } else { "NULL" };
            let sql = match direction {
                ReadDirection::Forwards => format!(
                    "SELECT {MESSAGE_COLUMNS}, {data_column} FROM messages m
                     WHERE m.stream_key = ?1 AND m.stream_version >= ?2
                     ORDER BY m.stream_version ASC LIMIT ?3"
                ),
                ReadDirection::Backwards => format!(
                    "SELECT {MESSAGE_COLUMNS}, {data_column} FROM messages m
                     WHERE m.stream_key = ?1 AND m.stream_version <= ?2
                     ORDER BY m.stream_version DESC LIMIT ?3"
                ),
            };

            let rows = {
                let mut stmt = tx.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![key.as_str(), from.as_raw(), sql_limit(limit)], |row| {
                        map_message(row, stream_id.clone(), key.clone(), max_age)
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };

            Ok(Some(StreamSlice {
                head,
                max_age,
                max_count,
                rows,
            }))
        })
    }

    fn read_all(
        &self,
        from: Position,
        direction: ReadDirection,
        limit: usize,
        prefetch: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(cancel, |conn| {
            let data_column = if prefetch { "m.json_data" } else { "NULL" };
            let (comparison, order) = match direction {
                ReadDirection::Forwards => (">=", "ASC"),
                ReadDirection::Backwards => ("<=", "DESC"),
            };
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS}, {data_column}, m.stream_key, s.stream_id, l.max_age
                 FROM messages m
                 JOIN streams s ON s.stream_key = m.stream_key
                 LEFT JOIN stream_limits l ON l.stream_key = m.stream_key
                 WHERE m.position {comparison} ?1
                 ORDER BY m.position {order} LIMIT ?2"
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![from.as_raw(), sql_limit(limit)], |row| {
                    let key = StreamKey::from_raw(row.get::<_, String>(7)?);
                    let stream_id = StreamId::new(row.get::<_, String>(8)?);
                    let max_age = row.get::<_, Option<i64>>(9)?.map(|v| v.max(0) as u64);
                    map_message(row, stream_id, key, max_age)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn read_json_data(
        &self,
        key: &StreamKey,
        version: StreamVersion,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        self.with_conn(cancel, |conn| {
            let data = conn
                .query_row(
                    "SELECT json_data FROM messages WHERE stream_key = ?1 AND stream_version = ?2",
                    params![key.as_str(), version.as_raw()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(data)
        })
    }

    fn read_head_position(&self, cancel: &CancellationToken) -> Result<Position> {
        self.with_conn(cancel, |conn| {
            let next: i64 =
                conn.query_row("SELECT next_position FROM log_head WHERE id = 0", [], |row| row.get(0))?;
            Ok(Position::from_raw(next - 1))
        })
    }

    fn read_stream_head(&self, key: &StreamKey, cancel: &CancellationToken) -> Result<Option<StreamHead>> {
        self.with_conn(cancel, |conn| stream_head(conn, key))
    }

    fn message_version(
        &self,
        key: &StreamKey,
        message_id: MessageId,
        cancel: &CancellationToken,
    ) -> Result<Option<StreamVersion>> {
        self.with_conn(cancel, |conn| {
            let version = conn
                .query_row(
                    "SELECT stream_version FROM messages WHERE stream_key = ?1 AND message_id = ?2",
                    params![key.as_str(), message_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(version.map(StreamVersion::from_raw))
        })
    }

    fn stream_message_count(&self, key: &StreamKey, cancel: &CancellationToken) -> Result<usize> {
        self.with_conn(cancel, |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE stream_key = ?1",
                params![key.as_str()],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as usize)
        })
    }

    fn delete_stream(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        tombstone: Option<NewStreamMessage>,
        created_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<DeleteOutcome> {
        self.with_conn(cancel, |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let key = stream_id.key();

            match (expected, stream_head(&tx, &key)?) {
                (ExpectedVersion::Any | ExpectedVersion::NoStream, None) => return Ok(DeleteOutcome::NotFound),
                (ExpectedVersion::Any, Some(_)) => {}
                (ExpectedVersion::EmptyStream, Some(head)) if head.version == StreamVersion::NONE => {}
                (ExpectedVersion::Exact(v), Some(head)) if head.version == v => {}
                _ => return Ok(DeleteOutcome::VersionMismatch),
            }

            delete_stream_rows(&tx, &key)?;
            delete_stream_rows(&tx, &stream_id.metadata_stream().key())?;
            tx.execute("DELETE FROM stream_limits WHERE stream_key = ?1", params![key.as_str()])?;

            let position = match &tombstone {
                Some(message) => Some(append_tombstone(&tx, message, created_ms)?),
                None => None,
            };
            check_cancelled(cancel)?;
            tx.commit()?;
            Ok(DeleteOutcome::Deleted { tombstone: position })
        })
    }

    fn delete_message(
        &self,
        stream_id: &StreamId,
        message_id: MessageId,
        tombstone: Option<NewStreamMessage>,
        created_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<DeleteOutcome> {
        self.with_conn(cancel, |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let removed = tx.execute(
                "DELETE FROM messages WHERE stream_key = ?1 AND message_id = ?2",
                params![stream_id.key().as_str(), message_id.to_string()],
            )?;
            if removed == 0 {
                return Ok(DeleteOutcome::NotFound);
            }

            let position = match &tombstone {
                Some(message) => Some(append_tombstone(&tx, message, created_ms)?),
                None => None,
            };
            check_cancelled(cancel)?;
            tx.commit()?;
            Ok(DeleteOutcome::Deleted { tombstone: position })
        })
    }

    fn list_streams(
        &self,
        pattern: &Pattern,
        max_count: usize,
        continuation: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<StreamListing> {
        let after: i64 = match continuation {
            Some(token) => token
                .parse()
                .map_err(|_| Error::InvalidArgument(format!("invalid continuation token '{}'", token)))?,
            None => 0,
        };
        let (mode, operand) = match pattern {
            Pattern::Anything => (0, ""),
            Pattern::StartsWith(prefix) => (1, prefix.as_str()),
            Pattern::EndsWith(suffix) => (2, suffix.as_str()),
        };

        self.with_conn(cancel, |conn| {
            let mut stmt = conn.prepare(
                "SELECT rowid, stream_id FROM streams
                 WHERE rowid > ?1 AND (
                     ?3 = 0
                     OR (?3 = 1 AND substr(stream_id, 1, length(?4)) = ?4)
                     OR (?3 = 2 AND length(stream_id) >= length(?4)
                                AND substr(stream_id, length(stream_id) - length(?4) + 1) = ?4))
                 ORDER BY rowid LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![after, sql_limit(max_count), mode, operand], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let next = match rows.last() {
                Some((rowid, _)) if rows.len() == max_count => Some(rowid.to_string()),
                _ => None,
            };
            Ok(StreamListing {
                stream_ids: rows.into_iter().map(|(_, id)| StreamId::new(id)).collect(),
                next,
            })
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
