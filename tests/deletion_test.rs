mod common;

use spitestream::codec;
use spitestream::{
    Error, ExpectedVersion, PageReadStatus, SetStreamMetadata, StoreConfig, StreamId, StreamVersion,
};

async fn deleted_stream(store: &spitestream::StreamStore<spitestream::SqliteBackend>) -> Vec<spitestream::StreamMessage> {
    store
        .read_stream_forwards(StreamId::deleted(), StreamVersion::START, 100, true)
        .await
        .unwrap()
        .messages
}

#[tokio::test]
async fn deleted_stream_reads_as_not_found_and_leaves_a_tombstone() {
    let (_dir, _path, store) = common::create_temp_store("delete.db");
    store
        .append("orders-1", ExpectedVersion::NoStream, common::messages(3))
        .await
        .unwrap();

    store.delete_stream("orders-1", ExpectedVersion::Any).await.unwrap();

    let page = store
        .read_stream_forwards("orders-1", StreamVersion::START, 10, true)
        .await
        .unwrap();
    assert_eq!(page.status, PageReadStatus::StreamNotFound);

    let tombstones = deleted_stream(&store).await;
    assert_eq!(tombstones.len(), 1);
    assert_eq!(tombstones[0].message_type, codec::STREAM_DELETED_TYPE);
    assert_eq!(tombstones[0].position.as_raw(), 3);

    let json = tombstones[0].get_json_data().await.unwrap().unwrap();
    let payload = codec::decode_stream_deleted(&json).unwrap();
    assert_eq!(payload.stream_id, "orders-1");

    // The id is free again.
    let recreated = store
        .append("orders-1", ExpectedVersion::NoStream, common::messages(1))
        .await
        .unwrap();
    assert_eq!(recreated.current_version, StreamVersion::START);
}

#[tokio::test]
async fn delete_checks_expected_version() {
    let (_dir, _path, store) = common::create_temp_store("delete-occ.db");
    store
        .append("orders-1", ExpectedVersion::NoStream, common::messages(3))
        .await
        .unwrap();

    let err = store
        .delete_stream("orders-1", ExpectedVersion::Exact(StreamVersion::from_raw(1)))
        .await
        .unwrap_err();
    assert!(err.is_wrong_expected_version());

    let err = store
        .delete_stream("orders-1", ExpectedVersion::NoStream)
        .await
        .unwrap_err();
    assert!(err.is_wrong_expected_version());
    assert!(store.read_stream_head("orders-1").await.unwrap().is_some());

    store
        .delete_stream("orders-1", ExpectedVersion::Exact(StreamVersion::from_raw(2)))
        .await
        .unwrap();
    assert!(store.read_stream_head("orders-1").await.unwrap().is_none());
}

#[tokio::test]
async fn deleting_a_missing_stream_does_nothing() {
    let (_dir, _path, store) = common::create_temp_store("delete-missing.db");

    store.delete_stream("ghost", ExpectedVersion::Any).await.unwrap();
    assert!(deleted_stream(&store).await.is_empty());

    let err = store
        .delete_stream("ghost", ExpectedVersion::Exact(StreamVersion::START))
        .await
        .unwrap_err();
    assert!(err.is_wrong_expected_version());
}

#[tokio::test]
async fn deleting_a_stream_removes_its_metadata() {
    let (_dir, _path, store) = common::create_temp_store("delete-meta.db");
    store
        .append("orders-1", ExpectedVersion::NoStream, common::messages(1))
        .await
        .unwrap();
    store
        .set_stream_metadata(
            "orders-1",
            SetStreamMetadata {
                max_count: Some(5),
                ..SetStreamMetadata::default()
            },
        )
        .await
        .unwrap();

    store.delete_stream("orders-1", ExpectedVersion::Any).await.unwrap();

    let meta = store.get_stream_metadata("orders-1").await.unwrap();
    assert_eq!(meta.metadata_stream_version, StreamVersion::NONE);
    assert_eq!(meta.max_count, None);
}

#[tokio::test]
async fn delete_message_leaves_a_tombstone() {
    let (_dir, _path, store) = common::create_temp_store("delete-message.db");
    let ids = common::new_ids(3);
    store
        .append("orders-1", ExpectedVersion::NoStream, common::with_ids(&ids))
        .await
        .unwrap();

    store.delete_message("orders-1", ids[1]).await.unwrap();
    // A second delete of the same message is a no-op.
    store.delete_message("orders-1", ids[1]).await.unwrap();

    let page = store
        .read_stream_forwards("orders-1", StreamVersion::START, 10, true)
        .await
        .unwrap();
    let versions: Vec<i64> = page.messages.iter().map(|m| m.stream_version.as_raw()).collect();
    assert_eq!(versions, vec![0, 2]);

    let tombstones = deleted_stream(&store).await;
    assert_eq!(tombstones.len(), 1);
    assert_eq!(tombstones[0].message_type, codec::MESSAGE_DELETED_TYPE);
    let json = tombstones[0].get_json_data().await.unwrap().unwrap();
    let payload = codec::decode_message_deleted(&json).unwrap();
    assert_eq!(payload.stream_id, "orders-1");
    assert_eq!(payload.message_id, ids[1].as_uuid());
}

#[tokio::test]
async fn untracked_deletions_are_silent() {
    let config = StoreConfig {
        track_deletions: false,
        ..common::fast_config()
    };
    let (_dir, _path, store) = common::create_temp_store_with("untracked.db", config);
    let ids = common::new_ids(2);
    store
        .append("orders-1", ExpectedVersion::NoStream, common::with_ids(&ids))
        .await
        .unwrap();

    store.delete_message("orders-1", ids[0]).await.unwrap();
    store.delete_stream("orders-1", ExpectedVersion::Any).await.unwrap();

    let page = store
        .read_stream_forwards(StreamId::deleted(), StreamVersion::START, 10, true)
        .await
        .unwrap();
    assert_eq!(page.status, PageReadStatus::StreamNotFound);
}

#[tokio::test]
async fn reserved_streams_cannot_be_deleted() {
    let (_dir, _path, store) = common::create_temp_store("delete-reserved.db");

    let err = store
        .delete_stream(StreamId::deleted(), ExpectedVersion::Any)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let err = store
        .delete_message("$$orders-1", spitestream::MessageId::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn deleted_rows_are_physically_removed() {
    let (_dir, path, store) = common::create_temp_store("delete-rows.db");
    store
        .append("orders-1", ExpectedVersion::NoStream, common::messages(4))
        .await
        .unwrap();
    store
        .set_stream_metadata("orders-1", SetStreamMetadata::default())
        .await
        .unwrap();

    store.delete_stream("orders-1", ExpectedVersion::Any).await.unwrap();

    let conn = common::open_read_only(&path);
    let count_rows = |stream: &str| -> i64 {
        conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE stream_key = ?1",
            [StreamId::new(stream).key().as_str()],
            |row| row.get(0),
        )
        .unwrap()
    };
    assert_eq!(count_rows("orders-1"), 0);
    assert_eq!(count_rows("$$orders-1"), 0);
    assert_eq!(count_rows("$deleted"), 1);
}
