#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use spitestream::{
    MessageId, NewStreamMessage, SqliteBackend, StoreConfig, StreamMessage, StreamStore,
};

pub fn create_temp_store_with(name: &str, config: StoreConfig) -> (tempfile::TempDir, PathBuf, StreamStore<SqliteBackend>) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let backend = SqliteBackend::open(&path, Default::default()).expect("open backend");
    let store = StreamStore::new(backend, config);
    (dir, path, store)
}

pub fn create_temp_store(name: &str) -> (tempfile::TempDir, PathBuf, StreamStore<SqliteBackend>) {
    create_temp_store_with(name, fast_config())
}

/// Default config with a short head poll, so tests don't wait on it.
pub fn fast_config() -> StoreConfig {
    StoreConfig {
        notifier_poll_interval: Duration::from_millis(20),
        ..StoreConfig::default()
    }
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

pub fn message(message_type: &str) -> NewStreamMessage {
    NewStreamMessage::new(MessageId::new_v4(), message_type, r#"{"ok":true}"#)
}

pub fn messages(count: usize) -> Vec<NewStreamMessage> {
    (0..count)
        .map(|i| NewStreamMessage::new(MessageId::new_v4(), "Tested", format!(r#"{{"n":{}}}"#, i)))
        .collect()
}

pub fn with_ids(ids: &[MessageId]) -> Vec<NewStreamMessage> {
    ids.iter()
        .map(|id| NewStreamMessage::new(*id, "Tested", "{}"))
        .collect()
}

pub fn new_ids(count: usize) -> Vec<MessageId> {
    (0..count).map(|_| MessageId::new_v4()).collect()
}

/// Messages a subscription handler has seen, shared with the test body.
pub type Seen = Arc<Mutex<Vec<StreamMessage>>>;

pub fn seen() -> Seen {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn seen_versions(seen: &Seen) -> Vec<i64> {
    seen.lock().unwrap().iter().map(|m| m.stream_version.as_raw()).collect()
}

pub fn seen_positions(seen: &Seen) -> Vec<i64> {
    seen.lock().unwrap().iter().map(|m| m.position.as_raw()).collect()
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
