//! # Head Position Notifier
//!
//! Wakes live subscriptions when the log head moves.
//!
//! ```text
//!   Writer::append ──notify(head)──┐
//!                                  ▼
//!   poll task ──read_head_position─► watch<Position> ──► listener 1
//!   (every notifier_poll_interval)                   ├─► listener 2
//!                                                    └─► ...
//! ```
//!
//! Local writes notify immediately. The poll task covers writers in other
//! processes sharing the same database file; it starts with the first
//! subscription and runs until the store shuts down.
//!
//! A notification is only a hint that "something may have changed". Listeners
//! always re-read from their own cursor, so coalesced or spurious wake-ups
//! are harmless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{run_blocking, Backend};
use crate::error::Error;
use crate::types::Position;

/// Broadcasts the newest known head position.
#[derive(Debug)]
pub struct Notifier {
    head: watch::Sender<Position>,
    polling: AtomicBool,
}

impl Notifier {
    pub fn new() -> Self {
        let (head, _) = watch::channel(Position::END);
        Self {
            head,
            polling: AtomicBool::new(false),
        }
    }

    /// Records a new head. Positions only move forward; older values are ignored.
    pub fn notify(&self, head: Position) {
        self.head.send_if_modified(|current| {
            if current.is_end() || head.as_raw() > current.as_raw() {
                *current = head;
                true
            } else {
                false
            }
        });
    }

    /// The newest head seen so far.
    pub fn current(&self) -> Position {
        *self.head.borrow()
    }

    pub fn listener(&self) -> NotifierListener {
        NotifierListener {
            rx: self.head.subscribe(),
        }
    }

    /// Starts the poll task once. Later calls are no-ops.
    pub fn ensure_polling<B: Backend>(
        self: &Arc<Self>,
        backend: Arc<B>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        if self
            .polling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let notifier = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("head poller shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        match run_blocking(&backend, &cancel, |b, cancel| b.read_head_position(cancel)).await {
                            Ok(head) if !head.is_end() => notifier.notify(head),
                            Ok(_) | Err(Error::Cancelled) => {}
                            Err(e) => warn!(error = %e, "head poll failed"),
                        }
                    }
                }
            }
        });
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's view of the notifier.
#[derive(Debug)]
pub struct NotifierListener {
    rx: watch::Receiver<Position>,
}

impl NotifierListener {
    /// Marks the current head as seen.
    ///
    /// Call this *before* sweeping pages: a commit that lands during the
    /// sweep then still counts as a change for the next wait.
    pub fn mark_seen(&mut self) {
        self.rx.borrow_and_update();
    }

    /// Waits for a head change. Returns `false` on cancellation or when the
    /// notifier is gone.
    pub async fn wait_for_change(&mut self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            changed = self.rx.changed() => changed.is_ok(),
        }
    }
}
