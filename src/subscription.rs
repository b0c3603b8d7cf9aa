//! # Subscriptions
//!
//! Catch-up subscriptions to one stream or to the whole log.
//!
//! ## Two Tasks per Subscription
//!
//! ```text
//! ┌──────────────────────────┐   bounded queue   ┌──────────────────────────┐
//! │      catch-up task       │ ───────────────►  │      delivery task       │
//! │                          │  Message(m)       │                          │
//! │  sweep: read pages from  │  CaughtUp(bool)   │  one handler call at a   │
//! │  the cursor until IsEnd  │                   │  time, in queue order    │
//! │  wait: notifier change   │                   │                          │
//! └──────────────────────────┘                   └──────────────────────────┘
//! ```
//!
//! The catch-up task owns the read cursor; the delivery task owns the
//! handler. Neither shares mutable state with the other beyond the queue.
//!
//! ## State Machine
//!
//! ```text
//!   Starting ──► CatchingUp ──► Live ──┐
//!                    ▲                 │ notified, new messages
//!                    └─────────────────┘
//!
//!   any state ──► Dropped(reason)   (terminal)
//! ```
//!
//! On every notification the catch-up task performs one sweep, so a burst of
//! commits costs one read round instead of one per commit. `on_caught_up`
//! fires `true` when a sweep reaches the end and `false` when a sweep of a
//! caught-up subscription finds new messages.
//!
//! ## Backpressure
//!
//! If the queue is full when the catch-up task wants to enqueue a message,
//! the subscription drops with [`DropReason::Backpressure`]. A slow handler
//! loses its subscription; it never stalls the store.
//!
//! A catch-up read never asks for more messages than the queue holds, so a
//! handler that keeps up is never dropped, whatever the two knobs are set
//! to. Caught-up signals wait for room instead of counting as overflow.
//!
//! ## Dropping
//!
//! The drop callback fires exactly once, whatever ends the subscription:
//! dispose, handler error or panic, read error, backpressure.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::Future;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::StreamStore;
use crate::backend::Backend;
use crate::error::{BoxError, Error, Result};
use crate::message::StreamMessage;
use crate::notifier::NotifierListener;
use crate::reader::Reader;
use crate::types::{PageReadStatus, Position, ReadDirection, StreamId, StreamVersion, SubscribeFrom};

// =============================================================================
// Configuration
// =============================================================================

/// Default number of messages per catch-up read.
pub const DEFAULT_MAX_COUNT_PER_READ: usize = 50;

/// Default capacity of the delivery queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Tuning knobs of one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    /// Messages per catch-up read. Values below 1 are treated as 1, values
    /// above `queue_capacity` as `queue_capacity`.
    pub max_count_per_read: usize,

    /// Capacity of the delivery queue before the subscription drops.
    /// Values below 1 are treated as 1.
    pub queue_capacity: usize,

    /// Load payloads with each page instead of on first access.
    pub prefetch_json_data: bool,

    /// Name used in logs. Defaults to a random UUID.
    pub name: Option<String>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            max_count_per_read: DEFAULT_MAX_COUNT_PER_READ,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            prefetch_json_data: true,
            name: None,
        }
    }
}

// =============================================================================
// State
// =============================================================================

/// Why a subscription stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// The subscription or its store was disposed.
    Disposed,
    /// The handler returned an error or panicked.
    SubscriberError,
    /// A catch-up read failed.
    StreamStoreError,
    /// The delivery queue was full.
    Backpressure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Starting,
    CatchingUp,
    Live,
    Dropped(DropReason),
}

impl SubscriptionState {
    pub fn is_dropped(&self) -> bool {
        matches!(self, SubscriptionState::Dropped(_))
    }
}

type CaughtUpCallback = Box<dyn Fn(bool) + Send + Sync>;
type DropCallback = Box<dyn FnOnce(DropReason, Option<Error>) + Send>;

/// What the catch-up task hands to the delivery task.
enum Delivery {
    Message(StreamMessage),
    CaughtUp(bool),
}

// =============================================================================
// Subscription Handle
// =============================================================================

/// A running subscription. Clones refer to the same subscription.
#[derive(Clone)]
pub struct Subscription {
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    target: String,
    cancel: CancellationToken,
    state: watch::Sender<SubscriptionState>,
    dropped: AtomicBool,
    on_dropped: Mutex<Option<DropCallback>>,
    last_version: AtomicI64,
    last_position: AtomicI64,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn set_state(&self, next: SubscriptionState) {
        self.state.send_if_modified(|state| {
            if state.is_dropped() || *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
    }

    /// Ends the subscription. Only the first call has any effect.
    fn drop_with(&self, reason: DropReason, error: Option<Error>) {
        if self.dropped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();

        match &error {
            Some(e) => warn!(
                subscription = %self.name,
                target = %self.target,
                reason = ?reason,
                error = %e,
                "subscription dropped"
            ),
            None => info!(
                subscription = %self.name,
                target = %self.target,
                reason = ?reason,
                "subscription dropped"
            ),
        }

        let callback = self
            .on_dropped
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(callback) = callback {
            if std::panic::catch_unwind(AssertUnwindSafe(|| callback(reason, error))).is_err() {
                warn!(subscription = %self.name, "drop callback panicked");
            }
        }

        self.state.send_replace(SubscriptionState::Dropped(reason));
    }
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> SubscriptionState {
        *self.shared.state.borrow()
    }

    pub fn is_dropped(&self) -> bool {
        self.shared.dropped.load(Ordering::Acquire)
    }

    /// Stream version of the last message the handler completed.
    pub fn last_version(&self) -> Option<StreamVersion> {
        match self.shared.last_version.load(Ordering::Acquire) {
            v if v < 0 => None,
            v => Some(StreamVersion::from_raw(v)),
        }
    }

    /// Global position of the last message the handler completed.
    pub fn last_position(&self) -> Option<Position> {
        match self.shared.last_position.load(Ordering::Acquire) {
            p if p < 0 => None,
            p => Some(Position::from_raw(p)),
        }
    }

    /// Waits until the subscription is dropped and returns why.
    ///
    /// The drop callback has already run when this returns.
    pub async fn dropped(&self) -> DropReason {
        let mut rx = self.shared.state.subscribe();
        loop {
            if let SubscriptionState::Dropped(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return DropReason::Disposed;
            }
        }
    }

    /// Stops the subscription and waits for its tasks.
    ///
    /// A handler call in flight finishes first. Safe to call more than once;
    /// only the first drop is reported.
    ///
    /// Called from the subscription's own handler (directly or through
    /// [`StreamStore::dispose`]), it doesn't wait for the delivery task it
    /// is running on. That task stops as soon as the handler returns.
    pub async fn dispose(&self) {
        self.shared.cancel.cancel();

        let current = tokio::task::try_id();
        let handles = std::mem::take(&mut *self.shared.tasks.lock().await);
        for handle in handles {
            if Some(handle.id()) == current {
                debug!(subscription = %self.shared.name, "disposed from its own handler");
                continue;
            }
            if let Err(e) = handle.await {
                warn!(subscription = %self.shared.name, error = %e, "subscription task failed");
            }
        }

        self.shared.drop_with(DropReason::Disposed, None);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.shared.name)
            .field("target", &self.shared.target)
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// Cursors
// =============================================================================

/// Read position of the catch-up task.
enum Cursor {
    Stream { stream_id: StreamId, next: StreamVersion },
    All { next: Position },
}

/// Where a subscription is pointed, before its cursor is resolved.
#[derive(Debug, Clone)]
pub(crate) enum Target {
    Stream(StreamId, SubscribeFrom<StreamVersion>),
    All(SubscribeFrom<Position>),
}

impl Target {
    fn describe(&self) -> String {
        match self {
            Target::Stream(stream_id, _) => stream_id.to_string(),
            Target::All(_) => "$all".to_string(),
        }
    }

    /// Turns `Start`/`After`/`End` into a concrete first cursor.
    async fn resolve<B: Backend>(&self, reader: &Reader<B>, cancel: &CancellationToken) -> Result<Cursor> {
        match self {
            Target::Stream(stream_id, from) => {
                let next = match from {
                    SubscribeFrom::Start => StreamVersion::START,
                    SubscribeFrom::After(version) => version.next(),
                    SubscribeFrom::End => {
                        let page = reader
                            .read_stream(stream_id, StreamVersion::END, ReadDirection::Backwards, 1, false, cancel)
                            .await?;
                        match page.status {
                            PageReadStatus::Success => page.last_stream_version.next(),
                            PageReadStatus::StreamNotFound => StreamVersion::START,
                        }
                    }
                };
                Ok(Cursor::Stream {
                    stream_id: stream_id.clone(),
                    next,
                })
            }
            Target::All(from) => {
                let next = match from {
                    SubscribeFrom::Start => Position::START,
                    SubscribeFrom::After(position) => position.next(),
                    SubscribeFrom::End => reader.read_head_position(cancel).await?.next(),
                };
                Ok(Cursor::All { next })
            }
        }
    }
}

impl Cursor {
    /// Reads one forward page and advances past it.
    ///
    /// Returns the page's messages and whether it reached the end.
    async fn read_page<B: Backend>(
        &mut self,
        reader: &Reader<B>,
        max_count: usize,
        prefetch: bool,
        cancel: &CancellationToken,
    ) -> Result<(Vec<StreamMessage>, bool)> {
        match self {
            Cursor::Stream { stream_id, next } => {
                let page = reader
                    .read_stream(stream_id, *next, ReadDirection::Forwards, max_count, prefetch, cancel)
                    .await?;
                if page.status == PageReadStatus::Success {
                    *next = page.next_stream_version;
                }
                Ok((page.messages, page.is_end))
            }
            Cursor::All { next } => {
                let page = reader
                    .read_all(*next, ReadDirection::Forwards, max_count, prefetch, cancel)
                    .await?;
                *next = page.next_position;
                Ok((page.messages, page.is_end))
            }
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Configures and starts a subscription.
///
/// # Example
///
/// ```rust,ignore
/// let subscription = store
///     .subscribe_to_stream("order-1", SubscribeFrom::Start)
///     .max_count_per_read(100)
///     .on_dropped(|reason, error| eprintln!("dropped: {reason:?} {error:?}"))
///     .start(|message| async move {
///         println!("{} v{}", message.message_type, message.stream_version);
///         Ok(())
///     })?;
/// ```
pub struct SubscriptionBuilder<B: Backend> {
    store: StreamStore<B>,
    target: Target,
    options: SubscriptionOptions,
    on_caught_up: Option<CaughtUpCallback>,
    on_dropped: Option<DropCallback>,
}

impl<B: Backend> SubscriptionBuilder<B> {
    pub(crate) fn new(store: StreamStore<B>, target: Target) -> Self {
        Self {
            store,
            target,
            options: SubscriptionOptions::default(),
            on_caught_up: None,
            on_dropped: None,
        }
    }

    pub fn options(mut self, options: SubscriptionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn max_count_per_read(mut self, max_count: usize) -> Self {
        self.options.max_count_per_read = max_count;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.options.queue_capacity = capacity;
        self
    }

    pub fn prefetch_json_data(mut self, prefetch: bool) -> Self {
        self.options.prefetch_json_data = prefetch;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.options.name = Some(name.into());
        self
    }

    /// Called with `true` when the subscription reaches the end of what's
    /// stored, and `false` when it starts reading again.
    pub fn on_caught_up(mut self, callback: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_caught_up = Some(Box::new(callback));
        self
    }

    /// Called exactly once when the subscription stops.
    pub fn on_dropped(mut self, callback: impl FnOnce(DropReason, Option<Error>) + Send + 'static) -> Self {
        self.on_dropped = Some(Box::new(callback));
        self
    }

    /// Starts the subscription. Must be called inside a Tokio runtime.
    ///
    /// `handler` is awaited once per message, in order, never concurrently.
    /// An `Err` or a panic drops the subscription with
    /// [`DropReason::SubscriberError`].
    pub fn start<F, Fut>(self, handler: F) -> Result<Subscription>
    where
        F: FnMut(StreamMessage) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.store.check_open()?;
        if let Target::Stream(stream_id, _) = &self.target {
            stream_id.validate()?;
        }

        let name = self
            .options
            .name
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let (state, _) = watch::channel(SubscriptionState::Starting);
        let shared = Arc::new(Shared {
            name,
            target: self.target.describe(),
            cancel: self.store.cancel_token().child_token(),
            state,
            dropped: AtomicBool::new(false),
            on_dropped: Mutex::new(self.on_dropped),
            last_version: AtomicI64::new(-1),
            last_position: AtomicI64::new(-1),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        });

        let queue_capacity = self.options.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(queue_capacity);

        // Subscribe before the first read so no commit falls between the two.
        let listener = self.store.notifier().listener();
        self.store.start_head_polling();

        let catch_up = CatchUpTask {
            shared: Arc::clone(&shared),
            reader: self.store.reader().clone(),
            target: self.target,
            listener,
            tx,
            max_count_per_read: self.options.max_count_per_read.clamp(1, queue_capacity),
            prefetch: self.options.prefetch_json_data,
        };
        let delivery = DeliveryTask {
            shared: Arc::clone(&shared),
            rx,
            handler,
            on_caught_up: self.on_caught_up,
        };

        let handles = vec![tokio::spawn(catch_up.run()), tokio::spawn(delivery.run())];
        // Fresh mutex, nobody else can hold it yet.
        if let Ok(mut tasks) = shared.tasks.try_lock() {
            *tasks = handles;
        }

        let subscription = Subscription { shared };
        info!(
            subscription = %subscription.name(),
            target = %subscription.shared.target,
            "subscription started"
        );
        self.store.register_subscription(subscription.clone());
        Ok(subscription)
    }
}

// =============================================================================
// Catch-Up Task
// =============================================================================

struct CatchUpTask<B: Backend> {
    shared: Arc<Shared>,
    reader: Reader<B>,
    target: Target,
    listener: NotifierListener,
    tx: mpsc::Sender<Delivery>,
    max_count_per_read: usize,
    prefetch: bool,
}

/// Why the catch-up loop stopped early.
enum Halt {
    /// Cancelled or the delivery side is gone. Nothing to report.
    Quiet,
    Dropped(DropReason, Option<Error>),
}

impl<B: Backend> CatchUpTask<B> {
    async fn run(mut self) {
        if let Err(Halt::Dropped(reason, error)) = self.run_inner().await {
            self.shared.drop_with(reason, error);
        }
    }

    async fn run_inner(&mut self) -> std::result::Result<(), Halt> {
        let mut cursor = self
            .target
            .resolve(&self.reader, &self.shared.cancel)
            .await
            .map_err(|e| self.read_failed(e))?;

        let mut caught_up = false;
        loop {
            self.listener.mark_seen();
            self.shared.set_state(SubscriptionState::CatchingUp);

            loop {
                if self.shared.cancel.is_cancelled() {
                    return Err(Halt::Quiet);
                }
                if self.tx.capacity() < self.max_count_per_read {
                    // Let the delivery task drain the last page first.
                    tokio::task::yield_now().await;
                }

                let (messages, is_end) = cursor
                    .read_page(&self.reader, self.max_count_per_read, self.prefetch, &self.shared.cancel)
                    .await
                    .map_err(|e| self.read_failed(e))?;

                if caught_up && !messages.is_empty() {
                    caught_up = false;
                    self.signal(false).await?;
                }
                for message in messages {
                    self.enqueue(message)?;
                }
                if is_end {
                    break;
                }
            }

            if !caught_up {
                caught_up = true;
                self.signal(true).await?;
                debug!(subscription = %self.shared.name, "subscription caught up");
            }
            self.shared.set_state(SubscriptionState::Live);

            if !self.listener.wait_for_change(&self.shared.cancel).await {
                return Err(Halt::Quiet);
            }
        }
    }

    fn read_failed(&self, error: Error) -> Halt {
        if self.shared.cancel.is_cancelled() {
            Halt::Quiet
        } else {
            Halt::Dropped(DropReason::StreamStoreError, Some(error))
        }
    }

    fn enqueue(&self, message: StreamMessage) -> std::result::Result<(), Halt> {
        match self.tx.try_send(Delivery::Message(message)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Halt::Dropped(DropReason::Backpressure, None)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Halt::Quiet),
        }
    }

    /// Queues a caught-up signal, waiting for room if the handler is behind.
    async fn signal(&self, caught_up: bool) -> std::result::Result<(), Halt> {
        tokio::select! {
            _ = self.shared.cancel.cancelled() => Err(Halt::Quiet),
            sent = self.tx.send(Delivery::CaughtUp(caught_up)) => sent.map_err(|_| Halt::Quiet),
        }
    }
}

// =============================================================================
// Delivery Task
// =============================================================================

struct DeliveryTask<F> {
    shared: Arc<Shared>,
    rx: mpsc::Receiver<Delivery>,
    handler: F,
    on_caught_up: Option<CaughtUpCallback>,
}

impl<F, Fut> DeliveryTask<F>
where
    F: FnMut(StreamMessage) -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
{
    async fn run(mut self) {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => return,
                delivery = self.rx.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => return,
                },
            };

            match delivery {
                Delivery::Message(message) => {
                    let version = message.stream_version;
                    let position = message.position;
                    if let Err(error) = self.invoke(message).await {
                        self.shared.drop_with(DropReason::SubscriberError, Some(error));
                        return;
                    }
                    self.shared.last_version.store(version.as_raw(), Ordering::Release);
                    self.shared.last_position.store(position.as_raw(), Ordering::Release);
                }
                Delivery::CaughtUp(value) => {
                    if let Some(callback) = &self.on_caught_up {
                        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                            let error = Error::Subscriber("caught-up callback panicked".into());
                            self.shared.drop_with(DropReason::SubscriberError, Some(error));
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn invoke(&mut self, message: StreamMessage) -> Result<()> {
        let handler = &mut self.handler;
        match AssertUnwindSafe(async move { handler(message).await })
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Subscriber(e)),
            Err(panic) => Err(Error::Subscriber(panic_message(panic.as_ref()).into())),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================
