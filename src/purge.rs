//! # Expired Message Purge
//!
//! Reads hide messages past their stream's MaxAge; this module deletes them
//! in the background.
//!
//! ```text
//!   Reader ──try_send──► [ bounded queue ] ──► purge worker ──► Writer::delete_message
//!            (full: drop)                       (errors: warn)
//! ```
//!
//! The queue is lossy. A dropped request leaves the message on disk until a
//! later read sees it again; reads filter expired messages regardless.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::types::{MessageId, StreamId};
use crate::writer::Writer;

/// One expired message to remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeRequest {
    pub stream_id: StreamId,
    pub message_id: MessageId,
}

/// Sending half of the purge queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PurgeQueue {
    tx: mpsc::Sender<PurgeRequest>,
}

impl PurgeQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PurgeRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queues a delete without waiting. Never fails the caller.
    pub fn enqueue(&self, stream_id: StreamId, message_id: MessageId) {
        if let Err(e) = self.tx.try_send(PurgeRequest { stream_id, message_id }) {
            debug!(error = %e, "purge request dropped");
        }
    }
}

/// Spawns the worker that drains the purge queue until `cancel` fires.
pub fn spawn_purge_worker<B: Backend>(
    writer: Writer<B>,
    mut rx: mpsc::Receiver<PurgeRequest>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let request = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("purge worker shutting down");
                    break;
                }
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            match writer.delete_message(&request.stream_id, request.message_id, &cancel).await {
                Ok(()) => debug!(
                    stream_id = %request.stream_id,
                    message_id = %request.message_id,
                    "purged expired message"
                ),
                Err(e) => warn!(
                    stream_id = %request.stream_id,
                    message_id = %request.message_id,
                    error = %e,
                    "failed to purge expired message"
                ),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_queue_drops_silently() {
        let (queue, mut rx) = PurgeQueue::new(1);
        queue.enqueue(StreamId::new("a"), MessageId::new_v4());
        queue.enqueue(StreamId::new("b"), MessageId::new_v4());

        assert_eq!(rx.recv().await.unwrap().stream_id.as_str(), "a");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_queue_is_harmless() {
        let (queue, rx) = PurgeQueue::new(4);
        drop(rx);
        queue.enqueue(StreamId::new("a"), MessageId::new_v4());
    }
}
