//! # Backend Capability Set
//!
//! The engines in this crate never talk SQL. They are written once against
//! the [`Backend`] trait, and each storage engine only implements the
//! primitives:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │        Append Engine   Read Engine   Subscription Engine      │
//! └───────────────────────────────┬──────────────────────────────┘
//!                                 │  Backend trait
//!            ┌────────────────────┼────────────────────┐
//!            ▼                    ▼                    ▼
//!      append / delete      read_stream / read_all   unique_constraint_kind
//!      (one transaction)    read_json_data           is_deadlock
//! ```
//!
//! ## Contract
//!
//! - Every mutating method runs in exactly one transaction: it commits fully
//!   or not at all, on every exit path.
//! - Methods are synchronous. The engines call them through [`run_blocking`],
//!   which moves the work onto Tokio's blocking pool.
//! - Every call that touches storage takes a [`CancellationToken`]. Once it
//!   fires, the backend aborts the statement in flight, rolls back, and
//!   reports [`Error::Cancelled`]. A call that already committed still
//!   returns its result.
//! - Conflicts come back in two shapes: [`AppendOutcome::VersionMismatch`]
//!   for an explicit version check, or an `Err` that
//!   [`Backend::unique_constraint_kind`] recognizes. The engine decides
//!   whether either one is a real conflict or an idempotent replay.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::types::{
    ExpectedVersion, MessageId, NewStreamMessage, Pattern, Position, ReadDirection, StreamHead,
    StreamId, StreamKey, StreamVersion,
};

// =============================================================================
// Requests and Outcomes
// =============================================================================

/// Everything a backend needs to attempt one append.
#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub stream_id: StreamId,
    pub key: StreamKey,
    pub expected: ExpectedVersion,
    pub messages: Vec<NewStreamMessage>,
    /// Commit timestamp stamped on every message, Unix milliseconds.
    pub created_ms: u64,
    /// Limits to record for a target stream in the same transaction
    /// (set on metadata-stream appends).
    pub limits: Option<LimitsUpdate>,
}

/// New MaxAge/MaxCount for a stream, written alongside its metadata message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitsUpdate {
    pub key: StreamKey,
    pub max_age: Option<u64>,
    pub max_count: Option<usize>,
}

/// Result of an append attempt that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The transaction committed. Carries the new head and the stream's
    /// current MaxCount, so the engine can decide whether to truncate.
    Committed {
        head: StreamHead,
        max_count: Option<usize>,
    },
    /// The explicit expected version did not match. Nothing was written.
    VersionMismatch,
}

/// Which uniqueness rule an error violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueConstraintKind {
    /// The stream-existence key: a `NoStream` append raced a creator.
    StreamExists,
    /// The per-stream message id: the message was already appended.
    MessageIdExists,
    /// Not a uniqueness violation we know how to resolve.
    Other,
}

/// Outcome of a stream or message delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The stream was deleted. Carries the tombstone position if one was written.
    Deleted { tombstone: Option<Position> },
    /// Nothing to delete and the expected version allowed that.
    NotFound,
    /// The expected version did not match. Nothing was deleted.
    VersionMismatch,
}

// =============================================================================
// Rows
// =============================================================================

/// One stored message as a backend returns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub stream_id: StreamId,
    pub key: StreamKey,
    pub message_id: MessageId,
    pub message_type: String,
    pub stream_version: StreamVersion,
    pub position: Position,
    pub created_ms: u64,
    pub json_metadata: Option<String>,
    /// Present only when the read asked for prefetch.
    pub json_data: Option<String>,
    /// MaxAge of the owning stream, in seconds.
    pub max_age: Option<u64>,
}

/// Rows of one stream plus its header, or nothing if the stream is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSlice {
    pub head: StreamHead,
    pub max_age: Option<u64>,
    pub max_count: Option<usize>,
    pub rows: Vec<MessageRow>,
}

/// Ids from one listing query plus the cursor to continue from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamListing {
    pub stream_ids: Vec<StreamId>,
    pub next: Option<String>,
}

// =============================================================================
// Backend Trait
// =============================================================================

/// The primitive operations a storage engine must provide.
///
/// # Rust Pattern: One Engine, Many Adapters
///
/// The engines are generic over `B: Backend` instead of being re-implemented
/// per database. Only this adapter layer varies.
pub trait Backend: Send + Sync + 'static {
    /// Attempts an append in one transaction.
    ///
    /// # Semantics by expected version
    ///
    /// - `NoStream`: creates the stream row; an existing row must surface as
    ///   an error classified [`UniqueConstraintKind::StreamExists`].
    /// - `Any`: creates the stream if needed, then appends after its last version.
    /// - `EmptyStream`/`Exact(v)`: the stream must exist at version -1/`v`,
    ///   otherwise [`AppendOutcome::VersionMismatch`].
    ///
    /// A duplicate message id in the stream surfaces as an error classified
    /// [`UniqueConstraintKind::MessageIdExists`]. An empty message list only
    /// creates (or checks) the stream.
    fn append(&self, request: &AppendRequest, cancel: &CancellationToken) -> Result<AppendOutcome>;

    /// Classifies a uniqueness violation returned by [`Backend::append`].
    fn unique_constraint_kind(&self, err: &Error) -> UniqueConstraintKind;

    /// True for transient deadlock/serialization/busy errors worth retrying.
    fn is_deadlock(&self, err: &Error) -> bool;

    /// Reads up to `limit` rows of a stream starting at `from` (inclusive).
    ///
    /// `from` is already resolved: the engine passes `i64::MAX` for "end".
    /// Returns `None` if the stream does not exist.
    fn read_stream(
        &self,
        key: &StreamKey,
        from: StreamVersion,
        direction: ReadDirection,
        limit: usize,
        prefetch: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<StreamSlice>>;

    /// Reads up to `limit` rows of the global log starting at `from` (inclusive).
    fn read_all(
        &self,
        from: Position,
        direction: ReadDirection,
        limit: usize,
        prefetch: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<MessageRow>>;

    /// Fetches one payload. `None` if the message no longer exists.
    fn read_json_data(
        &self,
        key: &StreamKey,
        version: StreamVersion,
        cancel: &CancellationToken,
    ) -> Result<Option<String>>;

    /// The newest position ever assigned, or `Position::END` for an empty log.
    fn read_head_position(&self, cancel: &CancellationToken) -> Result<Position>;

    /// Head of one stream, `None` if it doesn't exist.
    fn read_stream_head(&self, key: &StreamKey, cancel: &CancellationToken) -> Result<Option<StreamHead>>;

    /// The version a message id occupies in a stream.
    fn message_version(
        &self,
        key: &StreamKey,
        message_id: MessageId,
        cancel: &CancellationToken,
    ) -> Result<Option<StreamVersion>>;

    /// Number of messages currently stored for a stream.
    fn stream_message_count(&self, key: &StreamKey, cancel: &CancellationToken) -> Result<usize>;

    /// Deletes a stream, its metadata stream and its limits in one transaction,
    /// appending `tombstone` to `$deleted` in that same transaction.
    ///
    /// - `Any`: a missing stream is [`DeleteOutcome::NotFound`]
    /// - `NoStream`: an existing stream is a mismatch, a missing one `NotFound`
    /// - `EmptyStream`/`Exact(v)`: must exist at -1/`v`
    fn delete_stream(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        tombstone: Option<NewStreamMessage>,
        created_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<DeleteOutcome>;

    /// Deletes one message; appends `tombstone` only if a row was removed.
    ///
    /// Never reports [`DeleteOutcome::VersionMismatch`].
    fn delete_message(
        &self,
        stream_id: &StreamId,
        message_id: MessageId,
        tombstone: Option<NewStreamMessage>,
        created_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<DeleteOutcome>;

    /// Lists stream ids matching `pattern`, resuming after `continuation`.
    fn list_streams(
        &self,
        pattern: &Pattern,
        max_count: usize,
        continuation: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<StreamListing>;
}

// =============================================================================
// Blocking Bridge
// =============================================================================

/// Runs a backend call on Tokio's blocking pool.
///
/// # Cancellation
///
/// A token that already fired fails fast with [`Error::Cancelled`]. After
/// that the token is handed to the backend, which aborts its own work. The
/// closure always runs to completion (commit or rollback) before this
/// returns, so the result reports what actually happened.
pub(crate) async fn run_blocking<B, T, F>(backend: &Arc<B>, cancel: &CancellationToken, f: F) -> Result<T>
where
    B: Backend,
    T: Send + 'static,
    F: FnOnce(&B, &CancellationToken) -> Result<T> + Send + 'static,
{
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let backend = Arc::clone(backend);
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || f(&backend, &cancel))
        .await
        .map_err(|e| Error::TaskFailed(e.to_string()))?
}
