mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use spitestream::{
    BoxError, DropReason, Error, ExpectedVersion, Position, StreamVersion, SubscribeFrom,
    SubscriptionState,
};

const WAIT: Duration = Duration::from_secs(5);
const TICK: Duration = Duration::from_millis(10);

/// Records every drop notification a subscription reports.
type Drops = Arc<Mutex<Vec<(DropReason, Option<String>)>>>;

fn drops() -> Drops {
    Arc::new(Mutex::new(Vec::new()))
}

fn record_drop(drops: Drops) -> impl FnOnce(DropReason, Option<Error>) + Send + 'static {
    move |reason, error| {
        drops
            .lock()
            .unwrap()
            .push((reason, error.map(|e| e.to_string())));
    }
}

fn collect(
    seen: common::Seen,
) -> impl FnMut(spitestream::StreamMessage) -> futures::future::Ready<Result<(), BoxError>> + Send + 'static {
    move |message| {
        seen.lock().unwrap().push(message);
        futures::future::ready(Ok(()))
    }
}

// =============================================================================
// Catch-up and Live
// =============================================================================

#[tokio::test]
async fn stream_subscription_catches_up_then_goes_live() {
    let (_dir, _path, store) = common::create_temp_store("sub-live.db");
    store
        .append("orders-1", ExpectedVersion::NoStream, common::messages(3))
        .await
        .unwrap();
    store
        .append("other", ExpectedVersion::NoStream, common::messages(2))
        .await
        .unwrap();

    let seen = common::seen();
    let caught_up = Arc::new(Mutex::new(Vec::new()));
    let flags = Arc::clone(&caught_up);

    let subscription = store
        .subscribe_to_stream("orders-1", SubscribeFrom::Start)
        .name("orders-projection")
        .max_count_per_read(2)
        .on_caught_up(move |value| flags.lock().unwrap().push(value))
        .start(collect(Arc::clone(&seen)))
        .unwrap();
    assert_eq!(subscription.name(), "orders-projection");

    common::eventually(WAIT, TICK, || (caught_up.lock().unwrap().as_slice() == [true]).then_some(())).await;
    assert_eq!(common::seen_versions(&seen), vec![0, 1, 2]);
    common::eventually(WAIT, TICK, || (subscription.state() == SubscriptionState::Live).then_some(())).await;

    store
        .append("orders-1", ExpectedVersion::Exact(StreamVersion::from_raw(2)), common::messages(2))
        .await
        .unwrap();

    common::eventually(WAIT, TICK, || (common::seen_versions(&seen).len() == 5).then_some(())).await;
    assert_eq!(common::seen_versions(&seen), vec![0, 1, 2, 3, 4]);
    common::eventually(WAIT, TICK, || {
        (caught_up.lock().unwrap().as_slice() == [true, false, true]).then_some(())
    })
    .await;
    assert_eq!(subscription.last_version(), Some(StreamVersion::from_raw(4)));

    subscription.dispose().await;
}

#[tokio::test]
async fn all_subscription_delivers_in_position_order() {
    let (_dir, _path, store) = common::create_temp_store("sub-all.db");
    for stream in ["a", "b"] {
        store
            .append(stream, ExpectedVersion::NoStream, common::messages(2))
            .await
            .unwrap();
    }

    let seen = common::seen();
    let subscription = store
        .subscribe_to_all(SubscribeFrom::Start)
        .max_count_per_read(3)
        .start(collect(Arc::clone(&seen)))
        .unwrap();

    store
        .append("c", ExpectedVersion::NoStream, common::messages(3))
        .await
        .unwrap();

    common::eventually(WAIT, TICK, || (common::seen_positions(&seen).len() == 7).then_some(())).await;
    assert_eq!(common::seen_positions(&seen), (0..7).collect::<Vec<_>>());
    assert_eq!(subscription.last_position(), Some(Position::from_raw(6)));

    subscription.dispose().await;
}

#[tokio::test]
async fn subscription_sees_commits_from_another_store_via_polling() {
    let (_dir, path, store) = common::create_temp_store("sub-poll.db");
    let seen = common::seen();
    let subscription = store
        .subscribe_to_all(SubscribeFrom::Start)
        .start(collect(Arc::clone(&seen)))
        .unwrap();
    common::eventually(WAIT, TICK, || (subscription.state() == SubscriptionState::Live).then_some(())).await;

    // A second store over the same file has its own notifier.
    let other = spitestream::StreamStore::open(&path, common::fast_config())
        .await
        .unwrap();
    other
        .append("elsewhere", ExpectedVersion::NoStream, common::messages(2))
        .await
        .unwrap();

    common::eventually(WAIT, TICK, || (common::seen_positions(&seen).len() == 2).then_some(())).await;

    subscription.dispose().await;
    other.dispose().await;
}

// =============================================================================
// Cursors
// =============================================================================

#[tokio::test]
async fn subscribe_from_end_skips_history() {
    let (_dir, _path, store) = common::create_temp_store("sub-end.db");
    store
        .append("orders-1", ExpectedVersion::NoStream, common::messages(3))
        .await
        .unwrap();

    let stream_seen = common::seen();
    let all_seen = common::seen();
    let on_stream = store
        .subscribe_to_stream("orders-1", SubscribeFrom::End)
        .start(collect(Arc::clone(&stream_seen)))
        .unwrap();
    let on_all = store
        .subscribe_to_all(SubscribeFrom::End)
        .start(collect(Arc::clone(&all_seen)))
        .unwrap();
    common::eventually(WAIT, TICK, || {
        (on_stream.state() == SubscriptionState::Live && on_all.state() == SubscriptionState::Live).then_some(())
    })
    .await;

    store
        .append("orders-1", ExpectedVersion::Any, common::messages(1))
        .await
        .unwrap();

    common::eventually(WAIT, TICK, || {
        (common::seen_versions(&stream_seen) == [3] && common::seen_positions(&all_seen) == [3]).then_some(())
    })
    .await;

    on_stream.dispose().await;
    on_all.dispose().await;
}

#[tokio::test]
async fn subscribe_after_checkpoint_resumes_exclusively() {
    let (_dir, _path, store) = common::create_temp_store("sub-after.db");
    store
        .append("orders-1", ExpectedVersion::NoStream, common::messages(5))
        .await
        .unwrap();

    let seen = common::seen();
    let subscription = store
        .subscribe_to_stream("orders-1", SubscribeFrom::After(StreamVersion::from_raw(2)))
        .start(collect(Arc::clone(&seen)))
        .unwrap();

    common::eventually(WAIT, TICK, || (common::seen_versions(&seen) == [3, 4]).then_some(())).await;
    subscription.dispose().await;
}

#[tokio::test]
async fn subscription_to_missing_stream_waits_for_it() {
    let (_dir, _path, store) = common::create_temp_store("sub-missing.db");

    let seen = common::seen();
    let subscription = store
        .subscribe_to_stream("later", SubscribeFrom::Start)
        .start(collect(Arc::clone(&seen)))
        .unwrap();
    common::eventually(WAIT, TICK, || (subscription.state() == SubscriptionState::Live).then_some(())).await;

    store
        .append("later", ExpectedVersion::NoStream, common::messages(2))
        .await
        .unwrap();

    common::eventually(WAIT, TICK, || (common::seen_versions(&seen) == [0, 1]).then_some(())).await;
    subscription.dispose().await;
}

// =============================================================================
// Drops
// =============================================================================

#[tokio::test]
async fn dispose_reports_one_drop() {
    let (_dir, _path, store) = common::create_temp_store("sub-dispose.db");
    let drops = drops();

    let subscription = store
        .subscribe_to_all(SubscribeFrom::Start)
        .on_dropped(record_drop(Arc::clone(&drops)))
        .start(|_| async { Ok::<(), BoxError>(()) })
        .unwrap();

    subscription.dispose().await;
    subscription.dispose().await;

    assert_eq!(subscription.dropped().await, DropReason::Disposed);
    assert_eq!(subscription.state(), SubscriptionState::Dropped(DropReason::Disposed));
    assert_eq!(drops.lock().unwrap().as_slice(), [(DropReason::Disposed, None)]);
}

#[tokio::test]
async fn handler_error_drops_the_subscription() {
    let (_dir, _path, store) = common::create_temp_store("sub-error.db");
    store
        .append("orders-1", ExpectedVersion::NoStream, common::messages(3))
        .await
        .unwrap();

    let drops = drops();
    let seen = common::seen();
    let handled = Arc::clone(&seen);
    let subscription = store
        .subscribe_to_stream("orders-1", SubscribeFrom::Start)
        .on_dropped(record_drop(Arc::clone(&drops)))
        .start(move |message| {
            let handled = Arc::clone(&handled);
            async move {
                if message.stream_version.as_raw() == 1 {
                    return Err(BoxError::from("projection rejected message"));
                }
                handled.lock().unwrap().push(message);
                Ok(())
            }
        })
        .unwrap();

    assert_eq!(subscription.dropped().await, DropReason::SubscriberError);
    assert_eq!(common::seen_versions(&seen), vec![0]);
    assert_eq!(subscription.last_version(), Some(StreamVersion::START));

    let recorded = drops.lock().unwrap().clone();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].0, DropReason::SubscriberError);
    assert!(recorded[0].1.as_deref().unwrap().contains("projection rejected message"));

    // Disposing after the drop reports nothing new.
    subscription.dispose().await;
    assert_eq!(drops.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn handler_panic_counts_as_subscriber_error() {
    let (_dir, _path, store) = common::create_temp_store("sub-panic.db");
    store
        .append("orders-1", ExpectedVersion::NoStream, common::messages(1))
        .await
        .unwrap();

    let drops = drops();
    let subscription = store
        .subscribe_to_stream("orders-1", SubscribeFrom::Start)
        .on_dropped(record_drop(Arc::clone(&drops)))
        .start(|message| async move {
            if message.stream_version == StreamVersion::START {
                panic!("handler blew up");
            }
            Ok::<(), BoxError>(())
        })
        .unwrap();

    assert_eq!(subscription.dropped().await, DropReason::SubscriberError);
    let recorded = drops.lock().unwrap().clone();
    assert!(recorded[0].1.as_deref().unwrap().contains("handler blew up"));
}

#[tokio::test]
async fn full_queue_drops_with_backpressure() {
    let (_dir, _path, store) = common::create_temp_store("sub-backpressure.db");
    store
        .append("orders-1", ExpectedVersion::NoStream, common::messages(10))
        .await
        .unwrap();

    let drops = drops();
    let subscription = store
        .subscribe_to_stream("orders-1", SubscribeFrom::Start)
        .queue_capacity(1)
        .on_dropped(record_drop(Arc::clone(&drops)))
        .start(|_| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<(), BoxError>(())
        })
        .unwrap();

    assert_eq!(subscription.dropped().await, DropReason::Backpressure);
    assert_eq!(drops.lock().unwrap().as_slice(), [(DropReason::Backpressure, None)]);
}

#[tokio::test]
async fn small_queue_keeps_up_with_a_fast_handler() {
    let (_dir, _path, store) = common::create_temp_store("sub-small-queue.db");
    store
        .append("orders-1", ExpectedVersion::NoStream, common::messages(20))
        .await
        .unwrap();

    let drops = drops();
    let seen = common::seen();
    // Smaller than the default read size.
    let subscription = store
        .subscribe_to_stream("orders-1", SubscribeFrom::Start)
        .queue_capacity(1)
        .on_dropped(record_drop(Arc::clone(&drops)))
        .start(collect(Arc::clone(&seen)))
        .unwrap();

    common::eventually(WAIT, TICK, || (common::seen_versions(&seen).len() == 20).then_some(())).await;
    assert_eq!(common::seen_versions(&seen), (0..20).collect::<Vec<_>>());
    common::eventually(WAIT, TICK, || (subscription.state() == SubscriptionState::Live).then_some(())).await;
    assert!(drops.lock().unwrap().is_empty());

    subscription.dispose().await;
}

#[tokio::test]
async fn disposing_the_store_drops_its_subscriptions() {
    let (_dir, _path, store) = common::create_temp_store("sub-store-dispose.db");
    let first_drops = drops();
    let second_drops = drops();

    let first = store
        .subscribe_to_all(SubscribeFrom::Start)
        .on_dropped(record_drop(Arc::clone(&first_drops)))
        .start(|_| async { Ok::<(), BoxError>(()) })
        .unwrap();
    let second = store
        .subscribe_to_stream("orders-1", SubscribeFrom::Start)
        .on_dropped(record_drop(Arc::clone(&second_drops)))
        .start(|_| async { Ok::<(), BoxError>(()) })
        .unwrap();

    store.dispose().await;

    assert_eq!(first.dropped().await, DropReason::Disposed);
    assert_eq!(second.dropped().await, DropReason::Disposed);
    assert_eq!(first_drops.lock().unwrap().len(), 1);
    assert_eq!(second_drops.lock().unwrap().len(), 1);

    let err = store
        .subscribe_to_all(SubscribeFrom::Start)
        .start(|_| async { Ok::<(), BoxError>(()) })
        .unwrap_err();
    assert!(matches!(err, Error::Disposed));
}

#[tokio::test]
async fn store_can_be_disposed_from_a_handler() {
    let (_dir, _path, store) = common::create_temp_store("sub-dispose-inside.db");
    store
        .append("orders-1", ExpectedVersion::NoStream, common::messages(3))
        .await
        .unwrap();

    let drops = drops();
    let handle = store.clone();
    let subscription = store
        .subscribe_to_stream("orders-1", SubscribeFrom::Start)
        .on_dropped(record_drop(Arc::clone(&drops)))
        .start(move |_| {
            let store = handle.clone();
            async move {
                store.dispose().await;
                Ok::<(), BoxError>(())
            }
        })
        .unwrap();

    let reason = tokio::time::timeout(WAIT, subscription.dropped())
        .await
        .expect("dispose from inside a handler finishes");
    assert_eq!(reason, DropReason::Disposed);
    assert!(store.is_disposed());
    assert_eq!(drops.lock().unwrap().as_slice(), [(DropReason::Disposed, None)]);

    // Disposing again from outside returns at once.
    tokio::time::timeout(WAIT, subscription.dispose())
        .await
        .expect("second dispose finishes");
}
