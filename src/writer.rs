//! # Append Engine
//!
//! Appends, deletes and metadata updates, with optimistic concurrency and
//! idempotent replay.
//!
//! ## Optimistic Write, Then Explain the Conflict
//!
//! Every append is attempted as one backend transaction. A conflict is not
//! an immediate failure:
//!
//! ```text
//!   append(s, expected, [m1, m2])
//!        │
//!        ▼
//!   backend.append ──── Committed ────────────────────────► Ok(head)
//!        │
//!        ├── VersionMismatch / unique violation
//!        ▼
//!   re-read s from the slot m1 would have taken, 2 rows
//!        │
//!        ├── ids == [m1, m2] ──► Ok(actual head)   (idempotent replay)
//!        └── otherwise ───────► WrongExpectedVersion
//! ```
//!
//! Where the re-read starts:
//!
//! | Expected | First slot |
//! |----------|------------|
//! | `NoStream`, `EmptyStream` | version 0 |
//! | `Exact(v)` | version `v + 1` |
//! | `Any` | wherever the first message id is already stored |
//!
//! Correctness rests on `MessageId` equality alone: a client that times out
//! and retries the same messages gets the same result back.
//!
//! ## Deadlocks
//!
//! Transient backend errors ([`Backend::is_deadlock`]) restart the whole
//! attempt, without backoff, up to `deadlock_retry_attempts` times. After
//! that the original error is returned unchanged.
//!
//! ## MaxCount
//!
//! After a committed append to a stream with MaxCount, the oldest excess
//! messages are deleted through the regular delete-message path. The append
//! already committed, so failures here are logged and never returned.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{
    run_blocking, AppendOutcome, AppendRequest, Backend, DeleteOutcome, LimitsUpdate,
    UniqueConstraintKind,
};
use crate::codec::{self, Clock};
use crate::error::{Error, Result};
use crate::notifier::Notifier;
use crate::types::{
    AppendResult, ExpectedVersion, MessageId, NewStreamMessage, ReadDirection, SetStreamMetadata,
    SetStreamMetadataResult, StreamId, StreamVersion,
};

// =============================================================================
// Writer Configuration
// =============================================================================

/// Default number of retries after a deadlock/busy error.
pub const DEFAULT_DEADLOCK_RETRY_ATTEMPTS: usize = 2;

/// Configuration for the append engine.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Retries after a transient backend error before giving up.
    pub deadlock_retry_attempts: usize,

    /// Append a tombstone to `$deleted` for every stream or message delete.
    pub track_deletions: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            deadlock_retry_attempts: DEFAULT_DEADLOCK_RETRY_ATTEMPTS,
            track_deletions: true,
        }
    }
}

// =============================================================================
// Writer
// =============================================================================

/// The append engine. Cheap to clone.
pub struct Writer<B: Backend> {
    backend: Arc<B>,
    config: WriterConfig,
    clock: Clock,
    notifier: Arc<Notifier>,
}

impl<B: Backend> Clone for Writer<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            config: self.config.clone(),
            clock: Arc::clone(&self.clock),
            notifier: Arc::clone(&self.notifier),
        }
    }
}

impl<B: Backend> Writer<B> {
    pub(crate) fn new(backend: Arc<B>, config: WriterConfig, clock: Clock, notifier: Arc<Notifier>) -> Self {
        Self {
            backend,
            config,
            clock,
            notifier,
        }
    }

    // =========================================================================
    // Append
    // =========================================================================

    /// Appends `messages` to a caller stream.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for an invalid or reserved stream id
    /// - `WrongExpectedVersion` if `expected` didn't hold and this wasn't a replay
    /// - `Cancelled` if `cancel` fired before the commit
    /// - backend errors, after deadlock retries ran out
    pub async fn append(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        messages: Vec<NewStreamMessage>,
        cancel: &CancellationToken,
    ) -> Result<AppendResult> {
        stream_id.validate_writable()?;
        let attempt = self.append_internal(stream_id, expected, messages, None, cancel).await?;
        Ok(attempt.result)
    }

    async fn append_internal(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        messages: Vec<NewStreamMessage>,
        limits: Option<LimitsUpdate>,
        cancel: &CancellationToken,
    ) -> Result<Attempt> {
        let request = Arc::new(AppendRequest {
            stream_id: stream_id.clone(),
            key: stream_id.key(),
            expected,
            messages,
            created_ms: (self.clock)(),
            limits,
        });

        let attempt = self
            .retry_on_deadlock(stream_id, || self.try_append(Arc::clone(&request), cancel))
            .await?;

        if let Some(max_count) = attempt.max_count {
            self.enforce_max_count(stream_id, max_count, cancel).await;
        }
        Ok(attempt)
    }

    /// One append attempt plus conflict resolution.
    async fn try_append(&self, request: Arc<AppendRequest>, cancel: &CancellationToken) -> Result<Attempt> {
        let attempt = Arc::clone(&request);
        let outcome = run_blocking(&self.backend, cancel, move |b, cancel| b.append(&attempt, cancel)).await;

        match outcome {
            Ok(AppendOutcome::Committed { head, max_count }) => {
                let wrote = !request.messages.is_empty();
                if wrote {
                    self.notifier.notify(head.position);
                }
                Ok(Attempt {
                    result: AppendResult {
                        current_version: head.version,
                        current_position: head.position,
                    },
                    wrote,
                    max_count: if wrote { max_count } else { None },
                })
            }
            Ok(AppendOutcome::VersionMismatch) => {
                let result = self
                    .resolve_conflict(&request, UniqueConstraintKind::Other, None, cancel)
                    .await?;
                Ok(Attempt::replayed(result))
            }
            Err(e) => match self.backend.unique_constraint_kind(&e) {
                UniqueConstraintKind::Other => Err(e),
                kind => {
                    let result = self.resolve_conflict(&request, kind, Some(e), cancel).await?;
                    Ok(Attempt::replayed(result))
                }
            },
        }
    }

    /// Decides whether a rejected append is an idempotent replay.
    async fn resolve_conflict(
        &self,
        request: &AppendRequest,
        kind: UniqueConstraintKind,
        cause: Option<Error>,
        cancel: &CancellationToken,
    ) -> Result<AppendResult> {
        let conflict = |cause: Option<Error>| Error::WrongExpectedVersion {
            stream_id: request.stream_id.to_string(),
            expected: request.expected,
            source: cause.map(Box::new),
        };

        let Some(first) = request.messages.first() else {
            return Err(conflict(cause));
        };

        let start = match request.expected.first_new_version() {
            Some(version) => version,
            None if kind == UniqueConstraintKind::MessageIdExists => {
                let key = request.key.clone();
                let id = first.message_id;
                match run_blocking(&self.backend, cancel, move |b, cancel| b.message_version(&key, id, cancel)).await? {
                    Some(version) => version,
                    None => return Err(conflict(cause)),
                }
            }
            None => return Err(conflict(cause)),
        };

        let key = request.key.clone();
        let len = request.messages.len();
        let slice = run_blocking(&self.backend, cancel, move |b, cancel| {
            b.read_stream(&key, start, ReadDirection::Forwards, len, false, cancel)
        })
        .await?;

        let Some(slice) = slice else {
            return Err(conflict(cause));
        };
        let replayed = slice.rows.len() == len
            && slice
                .rows
                .iter()
                .zip(&request.messages)
                .all(|(row, message)| row.message_id == message.message_id);
        if !replayed {
            return Err(conflict(cause));
        }

        debug!(
            stream_id = %request.stream_id,
            expected = %request.expected,
            messages = len,
            "idempotent append replay"
        );
        Ok(AppendResult {
            current_version: slice.head.version,
            current_position: slice.head.position,
        })
    }

    /// Runs `op`, restarting it on transient backend errors.
    ///
    /// Once the retries are spent, the error of the first attempt is returned.
    async fn retry_on_deadlock<T, F, Fut>(&self, stream_id: &StreamId, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        let mut original: Option<Error> = None;
        loop {
            match op().await {
                Err(e) if self.backend.is_deadlock(&e) => {
                    if retries >= self.config.deadlock_retry_attempts {
                        return Err(original.unwrap_or(e));
                    }
                    retries += 1;
                    warn!(
                        stream_id = %stream_id,
                        attempt = retries,
                        error = %e,
                        "deadlock detected, retrying"
                    );
                    original.get_or_insert(e);
                }
                other => return other,
            }
        }
    }

    // =========================================================================
    // MaxCount
    // =========================================================================

    /// Deletes the oldest messages beyond `max_count`. Never fails the caller.
    async fn enforce_max_count(&self, stream_id: &StreamId, max_count: usize, cancel: &CancellationToken) {
        if let Err(e) = self.truncate(stream_id, max_count, cancel).await {
            warn!(
                stream_id = %stream_id,
                max_count,
                error = %e,
                "max count truncation failed"
            );
        }
    }

    async fn truncate(&self, stream_id: &StreamId, max_count: usize, cancel: &CancellationToken) -> Result<()> {
        let key = stream_id.key();
        let count_key = key.clone();
        let count = run_blocking(&self.backend, cancel, move |b, cancel| {
            b.stream_message_count(&count_key, cancel)
        })
        .await?;
        if count <= max_count {
            return Ok(());
        }

        let excess = count - max_count;
        let slice = run_blocking(&self.backend, cancel, move |b, cancel| {
            b.read_stream(&key, StreamVersion::START, ReadDirection::Forwards, excess, false, cancel)
        })
        .await?;

        let rows = slice.map(|s| s.rows).unwrap_or_default();
        debug!(stream_id = %stream_id, deleting = rows.len(), max_count, "truncating stream");
        for row in rows {
            self.delete_message(stream_id, row.message_id, cancel).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Deletes
    // =========================================================================

    /// Deletes a stream, its metadata and (if tracked) records a tombstone.
    ///
    /// `Any` on a missing stream is a no-op.
    pub async fn delete_stream(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let tombstone = if self.config.track_deletions {
            Some(codec::stream_deleted_message(stream_id)?)
        } else {
            None
        };
        let created_ms = (self.clock)();

        let outcome = self
            .retry_on_deadlock(stream_id, || {
                let stream_id = stream_id.clone();
                let tombstone = tombstone.clone();
                run_blocking(&self.backend, cancel, move |b, cancel| {
                    b.delete_stream(&stream_id, expected, tombstone, created_ms, cancel)
                })
            })
            .await?;

        match outcome {
            DeleteOutcome::Deleted { tombstone } => {
                debug!(stream_id = %stream_id, "stream deleted");
                if let Some(position) = tombstone {
                    self.notifier.notify(position);
                }
                Ok(())
            }
            DeleteOutcome::NotFound => Ok(()),
            DeleteOutcome::VersionMismatch => Err(Error::wrong_expected_version(stream_id.as_str(), expected)),
        }
    }

    /// Deletes one message. A message that isn't there is a no-op.
    pub async fn delete_message(
        &self,
        stream_id: &StreamId,
        message_id: MessageId,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let tombstone = if self.config.track_deletions {
            Some(codec::message_deleted_message(stream_id, message_id)?)
        } else {
            None
        };
        let created_ms = (self.clock)();

        let outcome = self
            .retry_on_deadlock(stream_id, || {
                let stream_id = stream_id.clone();
                let tombstone = tombstone.clone();
                run_blocking(&self.backend, cancel, move |b, cancel| {
                    b.delete_message(&stream_id, message_id, tombstone, created_ms, cancel)
                })
            })
            .await?;

        if let DeleteOutcome::Deleted { tombstone: Some(position) } = outcome {
            self.notifier.notify(position);
        }
        Ok(())
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Appends a metadata message to the stream's `$$` stream.
    ///
    /// The message id is derived from the update itself, so retrying the same
    /// update is an idempotent replay. A replay writes nothing and truncates
    /// nothing: the stored limits may since have moved on. A MaxCount that
    /// was actually written truncates the stream right away.
    pub async fn set_stream_metadata(
        &self,
        stream_id: &StreamId,
        request: SetStreamMetadata,
        cancel: &CancellationToken,
    ) -> Result<SetStreamMetadataResult> {
        stream_id.validate_writable()?;
        if request.max_count == Some(0) {
            return Err(Error::InvalidArgument("max_count must be at least 1".to_string()));
        }

        let message = codec::metadata_message(stream_id, &request)?;
        let limits = LimitsUpdate {
            key: stream_id.key(),
            max_age: request.max_age,
            max_count: request.max_count,
        };

        let attempt = self
            .append_internal(
                &stream_id.metadata_stream(),
                request.expected_version,
                vec![message],
                Some(limits),
                cancel,
            )
            .await?;

        match request.max_count {
            Some(max_count) if attempt.wrote => self.enforce_max_count(stream_id, max_count, cancel).await,
            Some(_) => debug!(stream_id = %stream_id, "metadata replay, limits unchanged"),
            None => {}
        }

        Ok(SetStreamMetadataResult {
            current_version: attempt.result.current_version,
        })
    }
}

/// What an append call did.
struct Attempt {
    result: AppendResult,
    /// New messages were committed, as opposed to a replay or an empty append.
    wrote: bool,
    /// The stream's MaxCount, set only when `wrote`.
    max_count: Option<usize>,
}

impl Attempt {
    fn replayed(result: AppendResult) -> Self {
        Self {
            result,
            wrote: false,
            max_count: None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
