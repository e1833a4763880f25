//! Encoding of the `message` column.
//!
//! Blobs are a versioned JSON envelope tagged by `type`:
//!
//! ```json
//! {"type":"message","v":1,"message":{"kind":"success","payload":"ok"}}
//! {"type":"record","v":1,"status_code":3,"last_execution_time":1700000000,"message":{...}}
//! ```
//!
//! The `record` form is what older writers stored: a whole last-record in
//! place of the message. It is still read so existing rows keep their
//! history. Blobs that are not JSON at all are kept as a raw payload.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::message::{Message, MessageKind};
use crate::types::Status;

pub const PAYLOAD_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoredPayload {
    Message {
        #[serde(default = "payload_version")]
        v: u32,
        message: Message,
    },
    Record(LegacyRecord),
}

/// Record-shaped payload written by older versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyRecord {
    #[serde(default = "payload_version")]
    pub v: u32,
    #[serde(default)]
    pub status_code: i64,
    #[serde(default)]
    pub last_execution_time: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

fn payload_version() -> u32 {
    PAYLOAD_VERSION
}

/// What a stored blob turned out to contain.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedPayload {
    Message(Message),
    Legacy(LegacyRecord),
    /// Not an envelope; the text is kept verbatim.
    Raw(String),
}

pub fn encode(message: &Message) -> Result<String> {
    Ok(serde_json::to_string(&StoredPayload::Message {
        v: PAYLOAD_VERSION,
        message: message.clone(),
    })?)
}

pub fn decode(blob: &str) -> DecodedPayload {
    match serde_json::from_str::<StoredPayload>(blob) {
        Ok(StoredPayload::Message { message, .. }) => DecodedPayload::Message(message),
        Ok(StoredPayload::Record(legacy)) => DecodedPayload::Legacy(legacy),
        Err(e) => {
            debug!(error = %e, "message column is not an envelope; keeping raw text");
            DecodedPayload::Raw(blob.to_string())
        }
    }
}

/// Merge the row columns with whatever the blob held.
///
/// A legacy record only overrides the columns when the column status is a
/// placeholder (Unknown/Queue) and the embedded status is specific; its
/// time wins in that case too, unless it is unset.
pub fn reconcile(
    column_status: Status,
    column_time: i64,
    payload: DecodedPayload,
) -> (Status, i64, Message) {
    match payload {
        DecodedPayload::Message(message) => (column_status, column_time, message),
        DecodedPayload::Legacy(legacy) => {
            let inner_status = Status::from_code(legacy.status_code);
            if !column_status.is_specific() && inner_status.is_specific() {
                let time = if legacy.last_execution_time > 0 {
                    legacy.last_execution_time
                } else {
                    column_time
                };
                let message = legacy
                    .message
                    .unwrap_or_else(|| Message::empty(MessageKind::from_status(inner_status)));
                (inner_status, time, message)
            } else {
                let message = legacy
                    .message
                    .unwrap_or_else(|| Message::empty(MessageKind::from_status(column_status)));
                (column_status, column_time, message)
            }
        }
        DecodedPayload::Raw(text) => {
            let payload = (!text.trim().is_empty()).then_some(text);
            (
                column_status,
                column_time,
                Message::new(MessageKind::from_status(column_status), payload),
            )
        }
    }
}
