//! # SpiteStream - Stream Store on SQLite
//!
//! SpiteStream is an append-only message store organized as named streams
//! plus one global log. It provides:
//!
//! - **Optimistic concurrency**: every append states what it expects the
//!   stream to look like (`Any`, `NoStream`, `EmptyStream`, or a version)
//! - **Idempotent appends**: retrying an append whose messages are already
//!   stored succeeds instead of conflicting
//! - **Paged reads**: per stream and over the global log, in both directions
//! - **Catch-up subscriptions**: replay history, then follow new commits
//! - **Stream metadata**: MaxAge and MaxCount retention, free-form JSON
//! - **Deletion tombstones**: deletes are visible in the `$deleted` stream
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     StreamStore (api)                           │
//! │         append, read, delete, metadata, subscribe               │
//! └──────────┬──────────────────┬──────────────────┬────────────────┘
//!            │                  │                  │
//!            ▼                  ▼                  ▼
//! ┌──────────────────┐ ┌─────────────────┐ ┌──────────────────────┐
//! │  Append Engine   │ │   Read Engine   │ │ Subscription Engine  │
//! │    (writer)      │ │    (reader)     │ │   (subscription)     │
//! └────────┬─────────┘ └────────┬────────┘ └──────────┬───────────┘
//!          │                    │                     │
//!          └────────────────────┼─────────────────────┘
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │             Backend trait  ◄──  SqliteBackend (rusqlite)         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Durable ordering**: `position` strictly increases in commit order, never reused
//! 2. **Stream correctness**: versions within a stream are contiguous from 0 at append time
//! 3. **Atomicity**: every append or delete is one backend transaction
//! 4. **Replay safety**: a message id is stored at most once per stream
//!
//! ## Module Organization
//!
//! - [`error`]: The crate-wide error type
//! - [`types`]: Stream ids, versions, positions, request and result types
//! - [`message`]: Stored messages and lazily loaded payloads
//! - [`codec`]: JSON payloads of the store's own messages
//! - [`schema`]: SQLite DDL and database initialization
//! - [`backend`]: The storage capability trait
//! - [`sqlite`]: The SQLite backend
//! - [`writer`]: Append engine
//! - [`reader`]: Read engine
//! - [`purge`]: Background deletion of expired messages
//! - [`notifier`]: Head-change notifications
//! - [`subscription`]: Catch-up subscriptions
//! - [`api`]: Async API (main entry point)

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for SpiteStream operations.
pub mod error;

/// Domain types.
///
/// Uses the newtype pattern so stream versions, positions and ids can't be
/// mixed up.
pub mod types;

/// Stored messages and the lazy payload field.
pub mod message;

/// Encoding of tombstone and metadata messages.
pub mod codec;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// The primitive operations a storage engine implements.
pub mod backend;

/// SQLite implementation of [`backend::Backend`].
pub mod sqlite;

/// Append engine: expected-version checks, idempotent replay, deadlock
/// retry, MaxCount truncation and deletes.
pub mod writer;

/// Read engine: paged reads with end detection, MaxAge filtering.
pub mod reader;

/// Background purge of expired messages.
pub mod purge;

/// Store-scoped head-change notifier.
pub mod notifier;

/// Catch-up subscriptions to a stream or to the global log.
///
/// See [`subscription::SubscriptionBuilder`] for how to start one.
pub mod subscription;

/// Async API for SpiteStream.
///
/// The main entry point is [`StreamStore`](api::StreamStore).
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::{StoreConfig, StreamStore};
pub use backend::Backend;
pub use error::{BoxError, Error, Result};
pub use message::{JsonData, StreamMessage};
pub use reader::{ReadAllPage, ReadStreamPage};
pub use schema::Database;
pub use sqlite::{SqliteBackend, SqliteConfig};
pub use writer::WriterConfig;

pub use types::{
    AppendResult, ExpectedVersion, ListStreamsPage, MessageId, NewStreamMessage, PageReadStatus,
    Pattern, Position, ReadDirection, SetStreamMetadata, SetStreamMetadataResult, StreamHead,
    StreamId, StreamMetadataResult, StreamVersion, SubscribeFrom,
};

/// Token accepted by [`StreamStore::with_cancellation`] and every
/// [`Backend`] method.
pub use tokio_util::sync::CancellationToken;

pub use subscription::{
    DropReason, Subscription, SubscriptionBuilder, SubscriptionOptions, SubscriptionState,
};
