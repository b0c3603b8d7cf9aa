//! # Async API for SpiteStream
//!
//! [`StreamStore`] is the public face of the crate: one cloneable handle over
//! the append engine, the read engine, the notifier and every running
//! subscription.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         StreamStore<B> (Clone)                           │
//! │                                                                          │
//! │   append / delete / set_metadata      read_* / list / heads              │
//! │              │                                 │                         │
//! │              ▼                                 ▼                         │
//! │        ┌──────────┐   notify(head)       ┌──────────┐                    │
//! │        │  Writer  │ ───────────────┐     │  Reader  │ ──expired──┐       │
//! │        └────┬─────┘                │     └────┬─────┘            │       │
//! │             │                      ▼          │                  ▼       │
//! │             │               ┌──────────┐      │           ┌───────────┐  │
//! │             │               │ Notifier │      │           │  purge    │  │
//! │             │               └────┬─────┘      │           │  worker   │  │
//! │             │                    ▼            │           └─────┬─────┘  │
//! │             │             subscriptions ◄─────┘                 │        │
//! │             ▼                                                   ▼        │
//! │   ┌────────────────────────────────────────────────────────────────┐    │
//! │   │            Backend (spawn_blocking, one tx per call)            │    │
//! │   └────────────────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Cancellation
//!
//! Every operation runs under the handle's cancellation token. For a handle
//! from [`StreamStore::open`] that is the store's own token, fired by
//! [`StreamStore::dispose`]. [`StreamStore::with_cancellation`] returns a
//! handle bound to a caller token instead:
//!
//! ```text
//!   let scoped = store.with_cancellation(token.clone());
//!   scoped.append(..)  ──► Writer ──► run_blocking ──► SqliteBackend
//!                                                          │
//!   token.cancel() ──────────────► interrupt handle ───────┘ ROLLBACK
//!                                                          │
//!                                      Err(Error::Cancelled) ◄┘
//! ```
//!
//! A cancelled operation has committed nothing.
//!
//! ## Disposal
//!
//! [`StreamStore::dispose`] drops every subscription with
//! [`DropReason::Disposed`](crate::DropReason::Disposed), stops the background
//! tasks, and makes every later call fail with [`Error::Disposed`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::{run_blocking, Backend};
use crate::codec::{system_clock, Clock};
use crate::error::{Error, Result};
use crate::message::StreamMessage;
use crate::notifier::Notifier;
use crate::purge::{spawn_purge_worker, PurgeQueue};
use crate::reader::{ReadAllPage, ReadStreamPage, Reader};
use crate::sqlite::{SqliteBackend, SqliteConfig};
use crate::subscription::{Subscription, SubscriptionBuilder, Target};
use crate::types::{
    AppendResult, ExpectedVersion, ListStreamsPage, MessageId, NewStreamMessage, Pattern,
    Position, ReadDirection, SetStreamMetadata, SetStreamMetadataResult, StreamHead, StreamId,
    StreamMetadataResult, StreamVersion, SubscribeFrom,
};
use crate::writer::{Writer, WriterConfig, DEFAULT_DEADLOCK_RETRY_ATTEMPTS};

// =============================================================================
// Configuration
// =============================================================================

/// Default interval of the head poll that wakes subscriptions for commits
/// made by other processes.
pub const DEFAULT_NOTIFIER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default capacity of the expired-message purge queue.
pub const DEFAULT_PURGE_QUEUE_CAPACITY: usize = 1024;

/// Configuration for a [`StreamStore`].
#[derive(Clone)]
pub struct StoreConfig {
    /// Retries after a deadlock/busy error before it is returned.
    pub deadlock_retry_attempts: usize,

    /// Record deletions as tombstones in `$deleted`.
    pub track_deletions: bool,

    /// How often subscriptions' notifier polls the head position.
    pub notifier_poll_interval: Duration,

    /// Expired messages queued for deletion before further ones are skipped.
    pub purge_queue_capacity: usize,

    /// Source of "now" for commit timestamps and MaxAge.
    pub clock: Clock,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            deadlock_retry_attempts: DEFAULT_DEADLOCK_RETRY_ATTEMPTS,
            track_deletions: true,
            notifier_poll_interval: DEFAULT_NOTIFIER_POLL_INTERVAL,
            purge_queue_capacity: DEFAULT_PURGE_QUEUE_CAPACITY,
            clock: system_clock(),
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("deadlock_retry_attempts", &self.deadlock_retry_attempts)
            .field("track_deletions", &self.track_deletions)
            .field("notifier_poll_interval", &self.notifier_poll_interval)
            .field("purge_queue_capacity", &self.purge_queue_capacity)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// StreamStore
// =============================================================================

/// Handle to an event store.
///
/// # Thread Safety
///
/// `StreamStore` is `Clone`, `Send` and `Sync`. All clones share the same
/// backend, notifier and subscriptions.
///
/// # Example
///
/// ```rust,no_run
/// use spitestream::{ExpectedVersion, MessageId, NewStreamMessage, StoreConfig, StreamStore, StreamVersion};
///
/// # async fn example() -> spitestream::Result<()> {
/// let store = StreamStore::open("events.db", StoreConfig::default()).await?;
///
/// let message = NewStreamMessage::new(MessageId::new_v4(), "OrderPlaced", r#"{"total":42}"#);
/// store.append("order-1", ExpectedVersion::NoStream, vec![message]).await?;
///
/// let page = store.read_stream_forwards("order-1", StreamVersion::START, 100, true).await?;
/// assert_eq!(page.messages.len(), 1);
///
/// store.dispose().await;
/// # Ok(())
/// # }
/// ```
pub struct StreamStore<B: Backend> {
    inner: Arc<StoreInner<B>>,
    scope: CancellationToken,
}

struct StoreInner<B: Backend> {
    backend: Arc<B>,
    writer: Writer<B>,
    reader: Reader<B>,
    notifier: Arc<Notifier>,
    subscriptions: Mutex<Vec<Subscription>>,
    cancel: CancellationToken,
    disposed: AtomicBool,
    notifier_poll_interval: Duration,
}

impl<B: Backend> Clone for StreamStore<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            scope: self.scope.clone(),
        }
    }
}

impl StreamStore<SqliteBackend> {
    /// Opens a store on a SQLite file, creating it if needed.
    pub async fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        Self::open_with_sqlite_config(path, config, SqliteConfig::default()).await
    }

    pub async fn open_with_sqlite_config(
        path: impl AsRef<Path>,
        config: StoreConfig,
        sqlite_config: SqliteConfig,
    ) -> Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let backend = tokio::task::spawn_blocking(move || SqliteBackend::open(path, sqlite_config))
            .await
            .map_err(|e| Error::TaskFailed(e.to_string()))??;
        Ok(Self::new(backend, config))
    }

    /// A store on an in-memory SQLite database, mostly for tests.
    pub fn open_in_memory(config: StoreConfig) -> Result<Self> {
        Ok(Self::new(SqliteBackend::open_in_memory()?, config))
    }
}

impl<B: Backend> StreamStore<B> {
    /// Builds a store over any backend.
    ///
    /// Spawns the purge worker, so this must run inside a Tokio runtime.
    pub fn new(backend: B, config: StoreConfig) -> Self {
        let backend = Arc::new(backend);
        let notifier = Arc::new(Notifier::new());
        let cancel = CancellationToken::new();

        let writer = Writer::new(
            Arc::clone(&backend),
            WriterConfig {
                deadlock_retry_attempts: config.deadlock_retry_attempts,
                track_deletions: config.track_deletions,
            },
            Arc::clone(&config.clock),
            Arc::clone(&notifier),
        );

        let (purge, purge_rx) = PurgeQueue::new(config.purge_queue_capacity);
        let reader = Reader::new(Arc::clone(&backend), Arc::clone(&config.clock), purge);
        spawn_purge_worker(writer.clone(), purge_rx, cancel.child_token());

        debug!(?config, "stream store created");

        Self {
            inner: Arc::new(StoreInner {
                backend,
                writer,
                reader,
                notifier,
                subscriptions: Mutex::new(Vec::new()),
                cancel: cancel.clone(),
                disposed: AtomicBool::new(false),
                notifier_poll_interval: config.notifier_poll_interval,
            }),
            scope: cancel,
        }
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// A handle on the same store whose operations abort once `cancel` fires.
    ///
    /// The aborted operation rolls back and returns [`Error::Cancelled`].
    /// Payloads of messages read through this handle are fetched under the
    /// same token. Disposing the store does not fire `cancel`.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let cancel = CancellationToken::new();
    /// let scoped = store.with_cancellation(cancel.clone());
    /// tokio::spawn(async move {
    ///     tokio::time::sleep(Duration::from_secs(1)).await;
    ///     cancel.cancel();
    /// });
    /// match scoped.append("order-1", ExpectedVersion::Any, messages).await {
    ///     Err(Error::Cancelled) => { /* nothing was written */ }
    ///     other => { other?; }
    /// }
    /// ```
    pub fn with_cancellation(&self, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            scope: cancel,
        }
    }

    // =========================================================================
    // Append
    // =========================================================================

    /// Appends messages to a stream.
    ///
    /// Retrying an append whose messages are already stored, at the same
    /// slots, succeeds and reports the stream's current head.
    ///
    /// # Errors
    ///
    /// - `WrongExpectedVersion` if `expected` didn't hold
    /// - `InvalidArgument` for an empty, whitespace or `$`-prefixed stream id
    /// - `Disposed` after [`dispose`](Self::dispose)
    /// - `Cancelled` if the handle's token fired first
    pub async fn append(
        &self,
        stream_id: impl Into<StreamId>,
        expected: ExpectedVersion,
        messages: Vec<NewStreamMessage>,
    ) -> Result<AppendResult> {
        self.check_open()?;
        self.inner
            .writer
            .append(&stream_id.into(), expected, messages, &self.scope)
            .await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn read_stream_forwards(
        &self,
        stream_id: impl Into<StreamId>,
        from: StreamVersion,
        max_count: usize,
        prefetch: bool,
    ) -> Result<ReadStreamPage> {
        self.read_stream(stream_id.into(), from, ReadDirection::Forwards, max_count, prefetch)
            .await
    }

    /// Reads a stream newest-first. Pass `StreamVersion::END` to start at the tail.
    pub async fn read_stream_backwards(
        &self,
        stream_id: impl Into<StreamId>,
        from: StreamVersion,
        max_count: usize,
        prefetch: bool,
    ) -> Result<ReadStreamPage> {
        self.read_stream(stream_id.into(), from, ReadDirection::Backwards, max_count, prefetch)
            .await
    }

    async fn read_stream(
        &self,
        stream_id: StreamId,
        from: StreamVersion,
        direction: ReadDirection,
        max_count: usize,
        prefetch: bool,
    ) -> Result<ReadStreamPage> {
        self.check_open()?;
        check_max_count(max_count)?;
        self.inner
            .reader
            .read_stream(&stream_id, from, direction, max_count, prefetch, &self.scope)
            .await
    }

    pub async fn read_all_forwards(&self, from: Position, max_count: usize, prefetch: bool) -> Result<ReadAllPage> {
        self.read_all(from, ReadDirection::Forwards, max_count, prefetch).await
    }

    /// Reads the global log newest-first. Pass `Position::END` to start at the tail.
    pub async fn read_all_backwards(&self, from: Position, max_count: usize, prefetch: bool) -> Result<ReadAllPage> {
        self.read_all(from, ReadDirection::Backwards, max_count, prefetch).await
    }

    async fn read_all(
        &self,
        from: Position,
        direction: ReadDirection,
        max_count: usize,
        prefetch: bool,
    ) -> Result<ReadAllPage> {
        self.check_open()?;
        check_max_count(max_count)?;
        self.inner
            .reader
            .read_all(from, direction, max_count, prefetch, &self.scope)
            .await
    }

    /// Every message of a stream from `from` on, read `page_size` at a time.
    pub fn stream_messages(
        &self,
        stream_id: impl Into<StreamId>,
        from: StreamVersion,
        page_size: usize,
    ) -> impl Stream<Item = Result<StreamMessage>> + Send + 'static {
        self.inner
            .reader
            .stream_messages(stream_id.into(), from, page_size, true, self.scope.clone())
    }

    /// Every message of the global log from `from` on, read `page_size` at a time.
    pub fn all_messages(
        &self,
        from: Position,
        page_size: usize,
    ) -> impl Stream<Item = Result<StreamMessage>> + Send + 'static {
        self.inner
            .reader
            .all_messages(from, page_size, true, self.scope.clone())
    }

    /// Position of the newest message ever written, `Position::END` if none.
    pub async fn read_head_position(&self) -> Result<Position> {
        self.check_open()?;
        self.inner.reader.read_head_position(&self.scope).await
    }

    pub async fn read_stream_head(&self, stream_id: impl Into<StreamId>) -> Result<Option<StreamHead>> {
        self.check_open()?;
        self.inner.reader.read_stream_head(&stream_id.into(), &self.scope).await
    }

    /// Lists stream ids matching `pattern`, `max_count` at a time.
    pub async fn list_streams(
        &self,
        pattern: Pattern,
        max_count: usize,
        continuation_token: Option<String>,
    ) -> Result<ListStreamsPage> {
        self.check_open()?;
        check_max_count(max_count)?;

        let listing = run_blocking(&self.inner.backend, &self.scope, move |b, cancel| {
            b.list_streams(&pattern, max_count, continuation_token.as_deref(), cancel)
        })
        .await?;

        Ok(ListStreamsPage {
            stream_ids: listing.stream_ids,
            continuation_token: listing.next,
        })
    }

    // =========================================================================
    // Deletes
    // =========================================================================

    /// Deletes a stream together with its metadata.
    ///
    /// With deletion tracking on, a `$stream-deleted` message is appended to
    /// `$deleted` in the same transaction. `ExpectedVersion::Any` on a missing
    /// stream does nothing.
    pub async fn delete_stream(&self, stream_id: impl Into<StreamId>, expected: ExpectedVersion) -> Result<()> {
        self.check_open()?;
        let stream_id = stream_id.into();
        stream_id.validate_writable()?;
        self.inner.writer.delete_stream(&stream_id, expected, &self.scope).await
    }

    /// Deletes one message. Deleting a message that isn't there does nothing.
    pub async fn delete_message(&self, stream_id: impl Into<StreamId>, message_id: MessageId) -> Result<()> {
        self.check_open()?;
        let stream_id = stream_id.into();
        stream_id.validate_writable()?;
        self.inner
            .writer
            .delete_message(&stream_id, message_id, &self.scope)
            .await
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    pub async fn set_stream_metadata(
        &self,
        stream_id: impl Into<StreamId>,
        request: SetStreamMetadata,
    ) -> Result<SetStreamMetadataResult> {
        self.check_open()?;
        self.inner
            .writer
            .set_stream_metadata(&stream_id.into(), request, &self.scope)
            .await
    }

    /// Current metadata of a stream. Works for `$deleted` too.
    pub async fn get_stream_metadata(&self, stream_id: impl Into<StreamId>) -> Result<StreamMetadataResult> {
        self.check_open()?;
        self.inner
            .reader
            .read_stream_metadata(&stream_id.into(), &self.scope)
            .await
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Subscribes to one stream. Call [`SubscriptionBuilder::start`] to run it.
    pub fn subscribe_to_stream(
        &self,
        stream_id: impl Into<StreamId>,
        from: SubscribeFrom<StreamVersion>,
    ) -> SubscriptionBuilder<B> {
        SubscriptionBuilder::new(self.clone(), Target::Stream(stream_id.into(), from))
    }

    /// Subscribes to the global log. Call [`SubscriptionBuilder::start`] to run it.
    pub fn subscribe_to_all(&self, from: SubscribeFrom<Position>) -> SubscriptionBuilder<B> {
        SubscriptionBuilder::new(self.clone(), Target::All(from))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Disposes every subscription, stops background tasks, and rejects
    /// further calls. Idempotent.
    ///
    /// Waits for each subscription's handler call in flight, except when
    /// called from a subscription handler: that subscription is stopped
    /// without waiting on itself.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let subscriptions = std::mem::take(
            &mut *self
                .inner
                .subscriptions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for subscription in &subscriptions {
            subscription.dispose().await;
        }

        self.inner.cancel.cancel();
        info!(subscriptions = subscriptions.len(), "stream store disposed");
    }

    // =========================================================================
    // Crate Internals
    // =========================================================================

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.is_disposed() {
            Err(Error::Disposed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn reader(&self) -> &Reader<B> {
        &self.inner.reader
    }

    pub(crate) fn notifier(&self) -> &Arc<Notifier> {
        &self.inner.notifier
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub(crate) fn start_head_polling(&self) {
        self.inner.notifier.ensure_polling(
            Arc::clone(&self.inner.backend),
            self.inner.notifier_poll_interval,
            self.inner.cancel.child_token(),
        );
    }

    pub(crate) fn register_subscription(&self, subscription: Subscription) {
        let mut subscriptions = self
            .inner
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscriptions.retain(|s| !s.is_dropped());

        if self.is_disposed() {
            // Lost the race with dispose(): nobody else will stop it.
            drop(subscriptions);
            tokio::spawn(async move { subscription.dispose().await });
        } else {
            subscriptions.push(subscription);
        }
    }
}

impl<B: Backend> fmt::Debug for StreamStore<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamStore")
            .field("disposed", &self.is_disposed())
            .field("head", &self.inner.notifier.current())
            .finish_non_exhaustive()
    }
}

fn check_max_count(max_count: usize) -> Result<()> {
    if max_count == 0 {
        Err(Error::InvalidArgument("max_count must be at least 1".to_string()))
    } else {
        Ok(())
    }
}

// =============================================================================
// Page Continuations
// =============================================================================

impl ReadStreamPage {
    /// Reads the page after this one, in the same direction.
    pub async fn read_next<B: Backend>(&self, store: &StreamStore<B>) -> Result<ReadStreamPage> {
        store
            .read_stream(
                self.stream_id.clone(),
                self.next_stream_version,
                self.direction,
                self.max_count,
                self.prefetch,
            )
            .await
    }
}

impl ReadAllPage {
    /// Reads the page after this one, in the same direction.
    pub async fn read_next<B: Backend>(&self, store: &StreamStore<B>) -> Result<ReadAllPage> {
        store
            .read_all(self.next_position, self.direction, self.max_count, self.prefetch)
            .await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> NewStreamMessage {
        NewStreamMessage::new(MessageId::new_v4(), "Tested", "{}")
    }

    #[tokio::test]
    async fn test_calls_after_dispose_fail() {
        let store = StreamStore::open_in_memory(StoreConfig::default()).unwrap();
        store.append("s", ExpectedVersion::Any, vec![message()]).await.unwrap();

        store.dispose().await;
        store.dispose().await;

        let err = store.append("s", ExpectedVersion::Any, vec![message()]).await.unwrap_err();
        assert!(matches!(err, Error::Disposed));
        let err = store.read_head_position().await.unwrap_err();
        assert!(matches!(err, Error::Disposed));
    }

    #[tokio::test]
    async fn test_zero_max_count_rejected() {
        let store = StreamStore::open_in_memory(StoreConfig::default()).unwrap();
        let err = store
            .read_stream_forwards("s", StreamVersion::START, 0, true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_read_next_follows_direction() {
        let store = StreamStore::open_in_memory(StoreConfig::default()).unwrap();
        store
            .append("s", ExpectedVersion::NoStream, (0..5).map(|_| message()).collect())
            .await
            .unwrap();

        let page = store.read_stream_backwards("s", StreamVersion::END, 2, true).await.unwrap();
        let page = page.read_next(&store).await.unwrap();
        let versions: Vec<i64> = page.messages.iter().map(|m| m.stream_version.as_raw()).collect();
        assert_eq!(versions, vec![2, 1]);

        let page = page.read_next(&store).await.unwrap();
        assert!(page.is_end);
        assert_eq!(page.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_handle_leaves_store_usable() {
        let store = StreamStore::open_in_memory(StoreConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        let scoped = store.with_cancellation(cancel.clone());
        scoped.append("s", ExpectedVersion::NoStream, vec![message()]).await.unwrap();

        cancel.cancel();
        let err = scoped.append("s", ExpectedVersion::Any, vec![message()]).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        let err = scoped.read_head_position().await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        let head = store.read_stream_head("s").await.unwrap().unwrap();
        assert_eq!(head.version, StreamVersion::START);
        assert!(!store.is_disposed());
    }

    #[test]
    fn test_config_debug_omits_clock() {
        let rendered = format!("{:?}", StoreConfig::default());
        assert!(rendered.contains("deadlock_retry_attempts: 2"));
        assert!(!rendered.contains("clock"));
    }
}
