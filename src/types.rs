//! # Domain Types for SpiteStream
//!
//! This module defines the value types that flow through every engine:
//! stream identity, cursors, expected versions and the request/result shapes
//! of the public API.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! - **Type safety**: a [`Position`] can't be passed where a [`StreamVersion`] is expected
//! - **Sentinels as consts**: `StreamVersion::END`, `Position::START` instead of magic numbers
//! - **Raw access at the edges**: `from_raw`/`as_raw` only where the backend stores integers
//!
//! ## Cursor Model
//!
//! ```text
//!   stream "order-1"           global log
//!   ┌───┬───┬───┬───┐          ┌───┬───┬───┬───┬───┬───┐
//!   │ 0 │ 1 │ 2 │ 3 │ version  │ 0 │ 1 │ 2 │ 3 │ 4 │ 5 │ position
//!   └───┴───┴───┴───┘          └───┴───┴───┴───┴───┴───┘
//!     ▲           ▲              ▲                   ▲
//!   START      last version    START              head position
//! ```
//!
//! Both cursors are 0-based. `-1` means "nothing yet" when reported by the
//! store and "the current tail" (`END`) when passed in as a read cursor.

use std::fmt;

use uuid::Uuid;

use crate::error::{Error, Result};

/// Name of the reserved stream that collects deletion tombstones.
pub const DELETED_STREAM_ID: &str = "$deleted";

/// Prefix of the metadata stream paired with every stream.
pub const METADATA_STREAM_PREFIX: &str = "$$";

// =============================================================================
// Stream Identification
// =============================================================================

/// A caller-chosen identifier for a stream.
///
/// Any non-empty string without whitespace is a valid id. Ids starting with
/// `$` are reserved for the store's own streams ([`DELETED_STREAM_ID`] and
/// metadata streams) and are rejected by write operations.
///
/// # Example
///
/// ```rust
/// use spitestream::types::StreamId;
///
/// let stream = StreamId::new("order-1");
/// assert_eq!(stream.metadata_stream().as_str(), "$$order-1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamId(String);

impl StreamId {
    /// Creates a stream id without validating it.
    ///
    /// Validation happens at the operation boundary, where the rules differ
    /// between reads and writes.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The reserved stream holding `$stream-deleted`/`$message-deleted` tombstones.
    pub fn deleted() -> Self {
        Self(DELETED_STREAM_ID.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the metadata stream for this stream (`"$$" + id`).
    pub fn metadata_stream(&self) -> StreamId {
        StreamId(format!("{}{}", METADATA_STREAM_PREFIX, self.0))
    }

    /// True for every store-owned stream (`$deleted`, `$$...`).
    pub fn is_reserved(&self) -> bool {
        self.0.starts_with('$')
    }

    /// True for metadata streams.
    pub fn is_metadata_stream(&self) -> bool {
        self.0.starts_with(METADATA_STREAM_PREFIX)
    }

    /// Checks the id is usable at all: non-empty, no whitespace.
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::InvalidArgument("stream id must not be empty".to_string()));
        }
        if self.0.chars().any(char::is_whitespace) {
            return Err(Error::InvalidArgument(format!(
                "stream id '{}' must not contain whitespace",
                self.0
            )));
        }
        Ok(())
    }

    /// Checks the id is valid *and* not reserved. Used by every write path.
    pub fn validate_writable(&self) -> Result<()> {
        self.validate()?;
        if self.is_reserved() {
            return Err(Error::InvalidArgument(format!(
                "stream id '{}' must not start with '$'",
                self.0
            )));
        }
        Ok(())
    }

    /// Maps this id to its fixed-width backend key.
    ///
    /// # Algorithm
    ///
    /// - Ids that already parse as a UUID pass through in canonical hyphenated form.
    /// - Everything else is hashed with XXH3-128 and rendered as 32 hex digits.
    ///
    /// The mapping is pure: no lookup table, same key on every platform and
    /// every version, which is what makes it safe to persist.
    pub fn key(&self) -> StreamKey {
        match Uuid::parse_str(&self.0) {
            Ok(uuid) => StreamKey(uuid.hyphenated().to_string()),
            Err(_) => StreamKey(format!("{:032x}", xxhash_rust::xxh3::xxh3_128(self.0.as_bytes()))),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&StreamId> for StreamId {
    fn from(s: &StreamId) -> Self {
        s.clone()
    }
}

/// The backend's fixed-width key for a [`StreamId`].
///
/// Produced only by [`StreamId::key`]; backends treat it as opaque text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey(String);

impl StreamKey {
    /// Rebuilds a key read back from storage.
    pub fn from_raw(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-supplied identity of a message; the idempotency key of appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(Uuid);

impl MessageId {
    /// A fresh random (v4) id.
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for MessageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// =============================================================================
// Positions and Versions
// =============================================================================

/// 0-based ordinal of a message within its stream.
///
/// # Sentinels
///
/// - [`StreamVersion::START`] (0): first message of a stream
/// - [`StreamVersion::END`] (-1): as a read cursor, "the current last version"
/// - [`StreamVersion::NONE`] (-1): as a reported version, "no messages yet"
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamVersion(i64);

impl StreamVersion {
    pub const START: StreamVersion = StreamVersion(0);
    pub const END: StreamVersion = StreamVersion(-1);
    pub const NONE: StreamVersion = StreamVersion(-1);

    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> i64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn is_end(&self) -> bool {
        self.0 == -1
    }
}

impl fmt::Display for StreamVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for StreamVersion {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Globally monotonic ordinal of a message across all streams.
///
/// # Invariants
///
/// - Assigned at commit time, strictly increasing in commit order
/// - Never reused, even after deletes
/// - Messages of a single append are contiguous
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position(i64);

impl Position {
    pub const START: Position = Position(0);

    /// As a read cursor: "the current tail". As a reported head: "empty log".
    pub const END: Position = Position(-1);

    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> i64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn is_end(&self) -> bool {
        self.0 == -1
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Position {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

// =============================================================================
// Expected Version
// =============================================================================

/// The caller's assertion about a stream's state before a write.
///
/// | Variant | Holds when |
/// |---------|------------|
/// | `Any` | always |
/// | `NoStream` | the stream does not exist |
/// | `EmptyStream` | the stream exists and has no messages (version -1) |
/// | `Exact(v)` | the stream exists and its last version is `v` |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpectedVersion {
    Any,
    NoStream,
    EmptyStream,
    Exact(StreamVersion),
}

impl ExpectedVersion {
    /// The version the first new message would take if this assertion held.
    ///
    /// `None` for `Any`, whose slot depends on the stream's current state.
    pub fn first_new_version(&self) -> Option<StreamVersion> {
        match self {
            ExpectedVersion::Any => None,
            ExpectedVersion::NoStream | ExpectedVersion::EmptyStream => Some(StreamVersion::START),
            ExpectedVersion::Exact(v) => Some(v.next()),
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => write!(f, "Any"),
            ExpectedVersion::NoStream => write!(f, "NoStream"),
            ExpectedVersion::EmptyStream => write!(f, "EmptyStream"),
            ExpectedVersion::Exact(v) => write!(f, "{}", v),
        }
    }
}

impl From<StreamVersion> for ExpectedVersion {
    fn from(v: StreamVersion) -> Self {
        ExpectedVersion::Exact(v)
    }
}

// =============================================================================
// Append Types
// =============================================================================

/// A message to be appended.
///
/// # Example
///
/// ```rust
/// use spitestream::types::{MessageId, NewStreamMessage};
///
/// let msg = NewStreamMessage::new(MessageId::new_v4(), "OrderPlaced", r#"{"total":42}"#)
///     .with_metadata(r#"{"user":"alice"}"#);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStreamMessage {
    pub message_id: MessageId,
    pub message_type: String,
    pub json_data: String,
    pub json_metadata: Option<String>,
}

impl NewStreamMessage {
    pub fn new(message_id: MessageId, message_type: impl Into<String>, json_data: impl Into<String>) -> Self {
        Self {
            message_id,
            message_type: message_type.into(),
            json_data: json_data.into(),
            json_metadata: None,
        }
    }

    pub fn with_metadata(mut self, json_metadata: impl Into<String>) -> Self {
        self.json_metadata = Some(json_metadata.into());
        self
    }
}

/// Outcome of a successful append (including idempotent replays).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    /// Last version of the stream after the append.
    pub current_version: StreamVersion,
    /// Global position of the stream's last message after the append.
    pub current_position: Position,
}

/// The last version and position of an existing stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHead {
    pub version: StreamVersion,
    pub position: Position,
}

// =============================================================================
// Read Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadDirection {
    Forwards,
    Backwards,
}

/// Whether a stream read found the stream at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageReadStatus {
    Success,
    StreamNotFound,
}

/// Where a subscription starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeFrom<C> {
    /// Replay all history.
    Start,
    /// Resume after a checkpoint the caller persisted (exclusive).
    After(C),
    /// Skip history, deliver only messages committed from now on.
    End,
}

// =============================================================================
// Metadata Types
// =============================================================================

/// Parameters of [`StreamStore::set_stream_metadata`](crate::StreamStore::set_stream_metadata).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetStreamMetadata {
    /// Expected version of the *metadata* stream.
    pub expected_version: ExpectedVersion,
    /// Messages older than this many seconds are hidden from reads.
    pub max_age: Option<u64>,
    /// Only the newest `max_count` messages are retained.
    pub max_count: Option<usize>,
    /// Free-form caller JSON.
    pub metadata_json: Option<String>,
}

impl Default for SetStreamMetadata {
    fn default() -> Self {
        Self {
            expected_version: ExpectedVersion::Any,
            max_age: None,
            max_count: None,
            metadata_json: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetStreamMetadataResult {
    /// Version of the metadata stream after the update.
    pub current_version: StreamVersion,
}

/// Current metadata of a stream.
///
/// A stream that never had metadata reports `metadata_stream_version == -1`
/// and no limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMetadataResult {
    pub stream_id: StreamId,
    pub metadata_stream_version: StreamVersion,
    pub max_age: Option<u64>,
    pub max_count: Option<usize>,
    pub metadata_json: Option<String>,
}

impl StreamMetadataResult {
    pub(crate) fn none(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            metadata_stream_version: StreamVersion::NONE,
            max_age: None,
            max_count: None,
            metadata_json: None,
        }
    }
}

// =============================================================================
// Listing
// =============================================================================

/// Filter for [`StreamStore::list_streams`](crate::StreamStore::list_streams).
///
/// Matching happens in the backend's query, against the original stream id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Anything,
    StartsWith(String),
    EndsWith(String),
}

/// One page of stream ids. Pass `continuation_token` back to get the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListStreamsPage {
    pub stream_ids: Vec<StreamId>,
    pub continuation_token: Option<String>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // StreamId
    // =========================================================================

    #[test]
    fn test_stream_id_validation() {
        assert!(StreamId::new("order-1").validate().is_ok());
        assert!(StreamId::new("$deleted").validate().is_ok());

        assert!(matches!(StreamId::new("").validate(), Err(Error::InvalidArgument(_))));
        assert!(matches!(StreamId::new("a b").validate(), Err(Error::InvalidArgument(_))));
        assert!(matches!(StreamId::new("a\tb").validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_reserved_ids_are_not_writable() {
        assert!(StreamId::new("order-1").validate_writable().is_ok());
        assert!(StreamId::new("$deleted").validate_writable().is_err());
        assert!(StreamId::new("$$order-1").validate_writable().is_err());
        assert!(StreamId::new("$anything").validate_writable().is_err());
    }

    #[test]
    fn test_metadata_stream_naming() {
        let id = StreamId::new("order-1");
        let meta = id.metadata_stream();

        assert_eq!(meta.as_str(), "$$order-1");
        assert!(meta.is_metadata_stream());
        assert!(meta.is_reserved());
        assert!(!id.is_reserved());
        assert!(StreamId::deleted().is_reserved());
        assert!(!StreamId::deleted().is_metadata_stream());
    }

    /// Same id, same key, every time. Different ids, different keys.
    #[test]
    fn test_key_is_deterministic() {
        let a1 = StreamId::new("order-1").key();
        let a2 = StreamId::new("order-1").key();
        let b = StreamId::new("order-2").key();

        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_eq!(a1.as_str().len(), 32);
    }

    #[test]
    fn test_key_passes_uuids_through() {
        let uuid = Uuid::new_v4();
        let upper = uuid.hyphenated().to_string().to_uppercase();

        assert_eq!(StreamId::new(upper).key().as_str(), uuid.hyphenated().to_string());
    }

    // =========================================================================
    // Versions
    // =========================================================================

    #[test]
    fn test_expected_version_first_slot() {
        assert_eq!(ExpectedVersion::Any.first_new_version(), None);
        assert_eq!(ExpectedVersion::NoStream.first_new_version(), Some(StreamVersion::START));
        assert_eq!(ExpectedVersion::EmptyStream.first_new_version(), Some(StreamVersion::START));
        assert_eq!(
            ExpectedVersion::Exact(StreamVersion::from_raw(4)).first_new_version(),
            Some(StreamVersion::from_raw(5))
        );
    }

    #[test]
    fn test_sentinels() {
        assert!(StreamVersion::END.is_end());
        assert!(Position::END.is_end());
        assert_eq!(StreamVersion::NONE.next(), StreamVersion::START);
        assert_eq!(Position::END.next(), Position::START);
    }
}
