//! # Read Engine
//!
//! Paged reads of a single stream or of the global log, on top of any
//! [`Backend`].
//!
//! ## End-of-Page Detection
//!
//! Every read asks the backend for `max_count + 1` rows:
//!
//! ```text
//!   max_count = 3
//!   backend returns:  [v0][v1][v2][v3]      4 rows → not the end, drop v3
//!   backend returns:  [v0][v1][v2]          3 rows → end
//! ```
//!
//! The extra row costs nothing compared to a second round-trip asking
//! "is there more?".
//!
//! ## Expiry
//!
//! Messages of a stream with MaxAge are hidden once `created + max_age <= now`.
//! Hidden messages are handed to the purge queue; correctness never depends
//! on the purge actually running.
//!
//! ## Lazy Payloads
//!
//! With `prefetch = false` each message's [`JsonData`] holds a pull function
//! bound to `(stream key, version)` instead of the payload itself. The pull
//! runs under the cancellation token of the read that produced the message.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, Stream, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{run_blocking, Backend, MessageRow};
use crate::codec::{decode_metadata, Clock};
use crate::error::{Error, Result};
use crate::message::{JsonData, StreamMessage};
use crate::purge::PurgeQueue;
use crate::types::{
    PageReadStatus, Position, ReadDirection, StreamHead, StreamId, StreamMetadataResult,
    StreamVersion,
};

// =============================================================================
// Pages
// =============================================================================

/// One page of a stream read.
#[derive(Debug, Clone)]
pub struct ReadStreamPage {
    pub stream_id: StreamId,
    pub status: PageReadStatus,
    /// The cursor this page was read from, as passed in.
    pub from_stream_version: StreamVersion,
    /// The cursor to read the following page from.
    pub next_stream_version: StreamVersion,
    /// The stream's last version at read time (-1 if not found).
    pub last_stream_version: StreamVersion,
    /// Position of the stream's last message at read time (-1 if not found).
    pub last_stream_position: Position,
    pub direction: ReadDirection,
    pub is_end: bool,
    pub messages: Vec<StreamMessage>,
    pub(crate) max_count: usize,
    pub(crate) prefetch: bool,
}

/// One page of a global log read.
#[derive(Debug, Clone)]
pub struct ReadAllPage {
    pub from_position: Position,
    pub next_position: Position,
    pub direction: ReadDirection,
    pub is_end: bool,
    pub messages: Vec<StreamMessage>,
    pub(crate) max_count: usize,
    pub(crate) prefetch: bool,
}

// =============================================================================
// Reader
// =============================================================================

/// The read engine. Cheap to clone.
pub struct Reader<B: Backend> {
    backend: Arc<B>,
    clock: Clock,
    purge: PurgeQueue,
}

impl<B: Backend> Clone for Reader<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            clock: Arc::clone(&self.clock),
            purge: self.purge.clone(),
        }
    }
}

impl<B: Backend> Reader<B> {
    pub(crate) fn new(backend: Arc<B>, clock: Clock, purge: PurgeQueue) -> Self {
        Self { backend, clock, purge }
    }

    /// Reads one page of a stream.
    ///
    /// `from = StreamVersion::END` starts at the stream's last version, which
    /// is what a backwards read from the tail wants.
    pub async fn read_stream(
        &self,
        stream_id: &StreamId,
        from: StreamVersion,
        direction: ReadDirection,
        max_count: usize,
        prefetch: bool,
        cancel: &CancellationToken,
    ) -> Result<ReadStreamPage> {
        stream_id.validate()?;

        let key = stream_id.key();
        let resolved = if from.is_end() {
            StreamVersion::from_raw(i64::MAX)
        } else {
            from
        };
        let limit = max_count.saturating_add(1);

        let slice = run_blocking(&self.backend, cancel, move |b, cancel| {
            b.read_stream(&key, resolved, direction, limit, prefetch, cancel)
        })
        .await?;

        let Some(slice) = slice else {
            return Ok(ReadStreamPage {
                stream_id: stream_id.clone(),
                status: PageReadStatus::StreamNotFound,
                from_stream_version: from,
                next_stream_version: StreamVersion::END,
                last_stream_version: StreamVersion::NONE,
                last_stream_position: Position::END,
                direction,
                is_end: true,
                messages: Vec::new(),
                max_count,
                prefetch,
            });
        };

        let mut rows = slice.rows;
        let is_end = rows.len() <= max_count;
        rows.truncate(max_count);

        let next_stream_version = match (direction, rows.last()) {
            (ReadDirection::Forwards, Some(last)) => last.stream_version.next(),
            (ReadDirection::Forwards, None) => slice.head.version.next(),
            (ReadDirection::Backwards, Some(last)) => StreamVersion::from_raw(last.stream_version.as_raw() - 1),
            (ReadDirection::Backwards, None) => StreamVersion::END,
        };

        let messages = self.materialize(rows, prefetch, cancel);

        Ok(ReadStreamPage {
            stream_id: stream_id.clone(),
            status: PageReadStatus::Success,
            from_stream_version: from,
            next_stream_version,
            last_stream_version: slice.head.version,
            last_stream_position: slice.head.position,
            direction,
            is_end,
            messages,
            max_count,
            prefetch,
        })
    }

    /// Reads one page of the global log.
    pub async fn read_all(
        &self,
        from: Position,
        direction: ReadDirection,
        max_count: usize,
        prefetch: bool,
        cancel: &CancellationToken,
    ) -> Result<ReadAllPage> {
        let resolved = if from.is_end() {
            Position::from_raw(i64::MAX)
        } else {
            from
        };
        let limit = max_count.saturating_add(1);

        let mut rows = run_blocking(&self.backend, cancel, move |b, cancel| {
            b.read_all(resolved, direction, limit, prefetch, cancel)
        })
        .await?;

        let extra = if rows.len() > max_count {
            rows.truncate(max_count + 1);
            rows.pop()
        } else {
            None
        };
        let is_end = extra.is_none();

        let next_position = match (direction, rows.last()) {
            (ReadDirection::Forwards, Some(last)) => last.position.next(),
            (ReadDirection::Forwards, None) => from,
            // Backwards resumes at the first row this page didn't return.
            (ReadDirection::Backwards, _) => match (&extra, rows.last()) {
                (Some(extra), _) => extra.position,
                (None, Some(last)) => last.position,
                (None, None) => from,
            },
        };

        let messages = self.materialize(rows, prefetch, cancel);

        Ok(ReadAllPage {
            from_position: from,
            next_position,
            direction,
            is_end,
            messages,
            max_count,
            prefetch,
        })
    }

    /// The newest position ever assigned, `Position::END` for an empty log.
    pub async fn read_head_position(&self, cancel: &CancellationToken) -> Result<Position> {
        run_blocking(&self.backend, cancel, |b, cancel| b.read_head_position(cancel)).await
    }

    pub async fn read_stream_head(&self, stream_id: &StreamId, cancel: &CancellationToken) -> Result<Option<StreamHead>> {
        stream_id.validate()?;
        let key = stream_id.key();
        run_blocking(&self.backend, cancel, move |b, cancel| b.read_stream_head(&key, cancel)).await
    }

    /// The newest metadata of `stream_id`, read from its `$$` stream.
    pub async fn read_stream_metadata(
        &self,
        stream_id: &StreamId,
        cancel: &CancellationToken,
    ) -> Result<StreamMetadataResult> {
        stream_id.validate()?;

        let page = self
            .read_stream(
                &stream_id.metadata_stream(),
                StreamVersion::END,
                ReadDirection::Backwards,
                1,
                true,
                cancel,
            )
            .await?;
        let Some(message) = page.messages.into_iter().next() else {
            return Ok(StreamMetadataResult::none(stream_id.clone()));
        };

        let json = message.get_json_data().await?.unwrap_or_default();
        let decoded = decode_metadata(&json)?;
        Ok(StreamMetadataResult {
            stream_id: stream_id.clone(),
            metadata_stream_version: message.stream_version,
            max_age: decoded.max_age,
            max_count: decoded.max_count,
            metadata_json: decoded.meta_json,
        })
    }

    /// All messages of a stream from `from` onwards, fetched page by page.
    ///
    /// The next page is only read once the previous one is consumed.
    pub fn stream_messages(
        &self,
        stream_id: StreamId,
        from: StreamVersion,
        page_size: usize,
        prefetch: bool,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<StreamMessage>> + Send + 'static {
        let reader = self.clone();
        let page_size = page_size.max(1);

        stream::try_unfold(Some(from), move |cursor| {
            let reader = reader.clone();
            let stream_id = stream_id.clone();
            let cancel = cancel.clone();
            async move {
                let Some(from) = cursor else {
                    return Ok::<_, Error>(None);
                };
                let page = reader
                    .read_stream(&stream_id, from, ReadDirection::Forwards, page_size, prefetch, &cancel)
                    .await?;
                let next = if page.is_end {
                    None
                } else {
                    Some(page.next_stream_version)
                };
                Ok(Some((stream::iter(page.messages.into_iter().map(Ok)), next)))
            }
        })
        .try_flatten()
    }

    /// All messages of the global log from `from` onwards, page by page.
    pub fn all_messages(
        &self,
        from: Position,
        page_size: usize,
        prefetch: bool,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<StreamMessage>> + Send + 'static {
        let reader = self.clone();
        let page_size = page_size.max(1);

        stream::try_unfold(Some(from), move |cursor| {
            let reader = reader.clone();
            let cancel = cancel.clone();
            async move {
                let Some(from) = cursor else {
                    return Ok::<_, Error>(None);
                };
                let page = reader
                    .read_all(from, ReadDirection::Forwards, page_size, prefetch, &cancel)
                    .await?;
                let next = if page.is_end { None } else { Some(page.next_position) };
                Ok(Some((stream::iter(page.messages.into_iter().map(Ok)), next)))
            }
        })
        .try_flatten()
    }

    // =========================================================================
    // Row Conversion
    // =========================================================================

    /// Drops expired rows (queuing them for purge) and builds messages.
    fn materialize(&self, rows: Vec<MessageRow>, prefetch: bool, cancel: &CancellationToken) -> Vec<StreamMessage> {
        let now = (self.clock)();
        let mut messages = Vec::with_capacity(rows.len());

        for row in rows {
            if is_expired(&row, now) {
                debug!(
                    stream_id = %row.stream_id,
                    stream_version = row.stream_version.as_raw(),
                    "hiding expired message"
                );
                self.purge.enqueue(row.stream_id.clone(), row.message_id);
                continue;
            }
            messages.push(self.to_message(row, prefetch, cancel));
        }
        messages
    }

    fn to_message(&self, row: MessageRow, prefetch: bool, cancel: &CancellationToken) -> StreamMessage {
        let json_data = if prefetch {
            JsonData::loaded(row.json_data.unwrap_or_default())
        } else {
            let backend = Arc::clone(&self.backend);
            let key = row.key.clone();
            let version = row.stream_version;
            let cancel = cancel.clone();
            JsonData::deferred(Arc::new(move || -> BoxFuture<'static, Result<Option<String>>> {
                let backend = Arc::clone(&backend);
                let key = key.clone();
                let cancel = cancel.clone();
                Box::pin(async move {
                    run_blocking(&backend, &cancel, move |b, cancel| b.read_json_data(&key, version, cancel)).await
                })
            }))
        };

        StreamMessage {
            stream_id: row.stream_id,
            message_id: row.message_id,
            message_type: row.message_type,
            stream_version: row.stream_version,
            position: row.position,
            created_utc_ms: row.created_ms,
            json_metadata: row.json_metadata,
            json_data,
        }
    }
}

fn is_expired(row: &MessageRow, now_ms: u64) -> bool {
    match row.max_age {
        Some(max_age) => row.created_ms.saturating_add(max_age.saturating_mul(1000)) <= now_ms,
        None => false,
    }
}

// =============================================================================
// Tests
// =============================================================================
