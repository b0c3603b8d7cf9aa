//! # System Message Encoding
//!
//! The store writes three kinds of messages of its own. They are ordinary
//! stream messages whose `json_data` is a small serde_json document:
//!
//! | Type | Stream | Payload |
//! |------|--------|---------|
//! | `$stream-deleted` | `$deleted` | `{"StreamId": "..."}` |
//! | `$message-deleted` | `$deleted` | `{"StreamId": "...", "MessageId": "..."}` |
//! | `$stream-metadata` | `$$<id>` | `{"StreamId", "MaxAge", "MaxCount", "MetaJson"}` |
//!
//! Field names are PascalCase so the documents stay readable by other
//! clients of the same log.
//!
//! ## Deterministic Metadata Ids
//!
//! A metadata update gets a UUID v5 id derived from the stream id, the
//! expected version and the payload. Retrying the exact same update yields
//! the exact same message id, so a retry after a timeout becomes an
//! idempotent replay instead of a conflict.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::types::{ExpectedVersion, MessageId, NewStreamMessage, SetStreamMetadata, StreamId};

pub const STREAM_DELETED_TYPE: &str = "$stream-deleted";
pub const MESSAGE_DELETED_TYPE: &str = "$message-deleted";
pub const METADATA_MESSAGE_TYPE: &str = "$stream-metadata";

/// Namespace for metadata message ids (UUID v5).
const METADATA_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6f, 0x3a, 0x1c, 0x52, 0x8e, 0x0d, 0x4b, 0x7a, 0x9c, 0x41, 0x2e, 0x55, 0xd3, 0x18, 0xa0, 0x77,
]);

// =============================================================================
// Payloads
// =============================================================================

/// Tombstone payload for a deleted stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StreamDeleted {
    pub stream_id: String,
}

/// Tombstone payload for a single deleted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageDeleted {
    pub stream_id: String,
    pub message_id: Uuid,
}

/// Payload of a `$stream-metadata` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetadataMessage {
    pub stream_id: String,
    #[serde(default)]
    pub max_age: Option<u64>,
    #[serde(default)]
    pub max_count: Option<usize>,
    #[serde(default)]
    pub meta_json: Option<String>,
}

// =============================================================================
// Encoding
// =============================================================================

/// Builds the `$stream-deleted` tombstone for `stream_id`.
pub fn stream_deleted_message(stream_id: &StreamId) -> Result<NewStreamMessage> {
    let payload = StreamDeleted {
        stream_id: stream_id.as_str().to_string(),
    };
    Ok(NewStreamMessage::new(
        MessageId::new_v4(),
        STREAM_DELETED_TYPE,
        serde_json::to_string(&payload)?,
    ))
}

/// Builds the `$message-deleted` tombstone for one message of `stream_id`.
pub fn message_deleted_message(stream_id: &StreamId, message_id: MessageId) -> Result<NewStreamMessage> {
    let payload = MessageDeleted {
        stream_id: stream_id.as_str().to_string(),
        message_id: message_id.as_uuid(),
    };
    Ok(NewStreamMessage::new(
        MessageId::new_v4(),
        MESSAGE_DELETED_TYPE,
        serde_json::to_string(&payload)?,
    ))
}

/// Builds the `$stream-metadata` message for a metadata update.
pub fn metadata_message(stream_id: &StreamId, request: &SetStreamMetadata) -> Result<NewStreamMessage> {
    let payload = MetadataMessage {
        stream_id: stream_id.as_str().to_string(),
        max_age: request.max_age,
        max_count: request.max_count,
        meta_json: request.metadata_json.clone(),
    };
    let json = serde_json::to_string(&payload)?;
    let id = metadata_message_id(stream_id, request.expected_version, &json);
    Ok(NewStreamMessage::new(id, METADATA_MESSAGE_TYPE, json))
}

/// Derives the id of a metadata message from everything that defines it.
pub fn metadata_message_id(stream_id: &StreamId, expected: ExpectedVersion, json: &str) -> MessageId {
    let name = format!("{}\n{}\n{}", stream_id, expected, json);
    MessageId::from_uuid(Uuid::new_v5(&METADATA_ID_NAMESPACE, name.as_bytes()))
}

// =============================================================================
// Decoding
// =============================================================================

pub fn decode_metadata(json: &str) -> Result<MetadataMessage> {
    Ok(serde_json::from_str(json)?)
}

pub fn decode_stream_deleted(json: &str) -> Result<StreamDeleted> {
    Ok(serde_json::from_str(json)?)
}

pub fn decode_message_deleted(json: &str) -> Result<MessageDeleted> {
    Ok(serde_json::from_str(json)?)
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Source of "now" in Unix milliseconds. Injectable so MaxAge is testable.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// The wall clock.
pub fn system_clock() -> Clock {
    Arc::new(current_time_ms)
}

/// Returns current Unix time in milliseconds.
///
/// A clock set before 1970 reads as 0 rather than failing.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tombstone_json_shape() {
        let msg = stream_deleted_message(&StreamId::new("order-1")).unwrap();
        assert_eq!(msg.message_type, STREAM_DELETED_TYPE);
        assert_eq!(msg.json_data, r#"{"StreamId":"order-1"}"#);

        let id = MessageId::new_v4();
        let msg = message_deleted_message(&StreamId::new("order-1"), id).unwrap();
        let decoded = decode_message_deleted(&msg.json_data).unwrap();
        assert_eq!(decoded.stream_id, "order-1");
        assert_eq!(decoded.message_id, id.as_uuid());
    }

    #[test]
    fn test_metadata_payload_uses_pascal_case() {
        let request = SetStreamMetadata {
            max_count: Some(3),
            metadata_json: Some(r#"{"owner":"ops"}"#.to_string()),
            ..SetStreamMetadata::default()
        };
        let msg = metadata_message(&StreamId::new("order-1"), &request).unwrap();
        let value: serde_json::Value = serde_json::from_str(&msg.json_data).unwrap();

        assert_eq!(value["StreamId"], "order-1");
        assert_eq!(value["MaxCount"], 3);
        assert!(value["MaxAge"].is_null());
        assert_eq!(value["MetaJson"], r#"{"owner":"ops"}"#);
    }

    /// Retrying the same update must produce the same id; anything else differs.
    #[test]
    fn test_metadata_id_is_deterministic() {
        let stream = StreamId::new("order-1");
        let request = SetStreamMetadata {
            max_age: Some(60),
            ..SetStreamMetadata::default()
        };

        let first = metadata_message(&stream, &request).unwrap();
        let retry = metadata_message(&stream, &request).unwrap();
        assert_eq!(first.message_id, retry.message_id);

        let other_version = SetStreamMetadata {
            expected_version: ExpectedVersion::NoStream,
            ..request.clone()
        };
        let other = metadata_message(&stream, &other_version).unwrap();
        assert_ne!(first.message_id, other.message_id);

        let other_stream = metadata_message(&StreamId::new("order-2"), &request).unwrap();
        assert_ne!(first.message_id, other_stream.message_id);
    }

    #[test]
    fn test_decode_metadata_tolerates_missing_fields() {
        let decoded = decode_metadata(r#"{"StreamId":"s"}"#).unwrap();
        assert_eq!(decoded.stream_id, "s");
        assert_eq!(decoded.max_age, None);
        assert_eq!(decoded.max_count, None);
        assert_eq!(decoded.meta_json, None);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_metadata("not json").is_err());
        assert!(decode_stream_deleted("{}").is_err());
    }
}
