//! # Stored Messages
//!
//! [`StreamMessage`] is what reads and subscriptions hand back. Its payload is
//! a [`JsonData`] lazy field: either already materialized (prefetch) or a pull
//! function that fetches it by stream and version on first access.
//!
//! ```text
//!   read(prefetch = true)            read(prefetch = false)
//!   ┌──────────────────────┐         ┌──────────────────────┐
//!   │ JsonData::Loaded     │         │ JsonData::Deferred   │
//!   │   "{...}"            │         │   fetch ──► backend  │  (at most once)
//!   └──────────────────────┘         └──────────────────────┘
//! ```
//!
//! A deferred fetch of a message deleted after the read returns `Ok(None)`.
//! That race is expected, not an error.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::OnceCell;

use crate::error::Result;
use crate::types::{MessageId, Position, StreamId, StreamVersion};

/// Pull function behind a deferred payload.
pub type JsonDataFetch = Arc<dyn Fn() -> BoxFuture<'static, Result<Option<String>>> + Send + Sync>;

// =============================================================================
// JsonData
// =============================================================================

/// A message payload that may not have been loaded yet.
///
/// # Rust Pattern: Shared Once-Cell
///
/// Clones share one `Arc<OnceCell>`, so no matter how many clones of a
/// message exist, the backend is asked for the payload at most once per
/// successful fetch. A failed fetch leaves the cell empty so it can be retried.
#[derive(Clone)]
pub struct JsonData {
    inner: Arc<JsonDataInner>,
}

struct JsonDataInner {
    cell: OnceCell<Option<String>>,
    fetch: Option<JsonDataFetch>,
}

impl JsonData {
    /// A payload that was read together with the message.
    pub fn loaded(json: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(JsonDataInner {
                cell: OnceCell::new_with(Some(Some(json.into()))),
                fetch: None,
            }),
        }
    }

    /// A payload fetched on demand through `fetch`.
    pub fn deferred(fetch: JsonDataFetch) -> Self {
        Self {
            inner: Arc::new(JsonDataInner {
                cell: OnceCell::new(),
                fetch: Some(fetch),
            }),
        }
    }

    /// Returns the payload, fetching it first if needed.
    ///
    /// `Ok(None)` means the message no longer exists.
    pub async fn get(&self) -> Result<Option<String>> {
        let value = self
            .inner
            .cell
            .get_or_try_init(|| async {
                match &self.inner.fetch {
                    Some(fetch) => fetch().await,
                    None => Ok(None),
                }
            })
            .await?;
        Ok(value.clone())
    }

    /// True once the payload is in memory.
    pub fn is_loaded(&self) -> bool {
        self.inner.cell.initialized()
    }
}

impl fmt::Debug for JsonData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.cell.get() {
            Some(Some(json)) => f.debug_tuple("JsonData").field(json).finish(),
            Some(None) => f.write_str("JsonData(<deleted>)"),
            None => f.write_str("JsonData(<deferred>)"),
        }
    }
}

// =============================================================================
// StreamMessage
// =============================================================================

/// A committed message as returned by reads and subscriptions.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub stream_id: StreamId,
    pub message_id: MessageId,
    pub message_type: String,
    pub stream_version: StreamVersion,
    pub position: Position,
    /// Commit time, Unix milliseconds.
    pub created_utc_ms: u64,
    pub json_metadata: Option<String>,
    pub json_data: JsonData,
}

impl StreamMessage {
    /// Shorthand for `self.json_data.get()`.
    pub async fn get_json_data(&self) -> Result<Option<String>> {
        self.json_data.get().await
    }
}
