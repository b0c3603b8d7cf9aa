//! # Error Handling for SpiteStream
//!
//! A single error enum ([`Error`]) covers every failure mode of the store, so
//! callers match on one type regardless of which engine produced it.
//!
//! ## Rust Pattern: thiserror
//!
//! `thiserror` derives `Display`, `std::error::Error` and the `From`
//! conversions marked with `#[from]`. Backend failures keep their original
//! error as `source()`, so diagnostics always reach the root cause.
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Conflict | `WrongExpectedVersion` | Re-read the stream, retry with the actual version |
//! | Caller bug | `InvalidArgument`, `Disposed` | Fix the call site, never retried internally |
//! | Cancellation | `Cancelled` | Expected after firing a token; nothing was committed |
//! | Backend | `Sqlite`, `Backend`, `TaskFailed` | Log and investigate (deadlocks are retried first) |
//! | Data | `Schema`, `Json` | Manual intervention |
//! | Subscription | `Subscriber` | Only seen through a drop notification |
//!
//! A missing stream is *not* an error: reads report it through
//! [`PageReadStatus::StreamNotFound`](crate::types::PageReadStatus).

use thiserror::Error;

use crate::types::ExpectedVersion;

/// A boxed error from outside the crate (handlers, foreign backends).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in SpiteStream operations.
///
/// # Example
///
/// ```rust,ignore
/// use spitestream::{Error, ExpectedVersion};
///
/// match store.append("order-1", ExpectedVersion::Exact(3.into()), messages).await {
///     Ok(result) => println!("now at {}", result.current_version),
///     Err(Error::WrongExpectedVersion { .. }) => { /* re-read and retry */ }
///     Err(other) => return Err(other),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Conflict Errors (Client can retry with updated data)
    // =========================================================================

    /// The declared expected version did not hold and the append was not an
    /// idempotent replay of messages already in the stream.
    ///
    /// # Recovery
    ///
    /// 1. Re-read the stream to get current state
    /// 2. Re-apply business logic with new data
    /// 3. Retry with the actual version
    ///
    /// When the conflict was detected through a backend constraint violation,
    /// that violation is kept as `source`.
    #[error("wrong expected version {expected} for stream '{stream_id}'")]
    WrongExpectedVersion {
        /// The stream where the conflict occurred
        stream_id: String,
        /// What the caller asserted about the stream
        expected: ExpectedVersion,
        /// The backend error that signalled the conflict, if any
        #[source]
        source: Option<Box<Error>>,
    },

    // =========================================================================
    // Caller Errors
    // =========================================================================

    /// An argument was rejected before touching the backend.
    ///
    /// Empty stream ids, ids containing whitespace, writes to reserved `$`
    /// streams and a `max_count` of zero all end up here.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The store or subscription has been disposed.
    #[error("stream store has been disposed")]
    Disposed,

    /// The operation's cancellation token fired before it committed.
    ///
    /// Any transaction it had open was rolled back.
    #[error("operation cancelled")]
    Cancelled,

    // =========================================================================
    // Backend Errors
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// # Rust Pattern: #[from]
    ///
    /// `#[from]` generates `impl From<rusqlite::Error> for Error`, so `?`
    /// converts rusqlite errors automatically inside the SQLite backend.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failure reported by a non-SQLite [`Backend`](crate::backend::Backend).
    #[error("backend error: {0}")]
    Backend(#[source] BoxError),

    /// A blocking backend task panicked or was cancelled before finishing.
    #[error("backend task failed: {0}")]
    TaskFailed(String),

    /// Schema version mismatch or corruption detected.
    #[error("schema error: {0}")]
    Schema(String),

    /// A system message (metadata, tombstone) carried a malformed payload.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // =========================================================================
    // Subscription Errors
    // =========================================================================

    /// A subscription handler returned an error or panicked.
    ///
    /// Only ever handed to a subscription's drop callback; store calls never
    /// return it.
    #[error("subscriber failed: {0}")]
    Subscriber(#[source] BoxError),
}

impl Error {
    /// Builds a [`Error::WrongExpectedVersion`] with no backend cause.
    pub fn wrong_expected_version(stream_id: impl Into<String>, expected: ExpectedVersion) -> Self {
        Error::WrongExpectedVersion {
            stream_id: stream_id.into(),
            expected,
            source: None,
        }
    }

    /// Returns true for optimistic concurrency conflicts.
    pub fn is_wrong_expected_version(&self) -> bool {
        matches!(self, Error::WrongExpectedVersion { .. })
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
