//! Transport channel envelope
//!
//! Every message on an established channel is a JSON object with a `type` field:
//!
//! ```json
//! { "type": "text", "message": "hello" }
//! { "type": "file-offer", "id": "...", "name": "notes.txt", "size": 40000 }
//! { "type": "file-accept", "id": "..." }
//! { "type": "file-reject", "id": "..." }
//! { "type": "file-chunk", "id": "...", "data": "<base64>" }
//! { "type": "file-done", "id": "..." }
//! ```

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::session::TransportPayload;
use crate::types::{Result, TransferId};

/// A file offered by the remote peer, waiting on a local accept/reject decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOffer {
    pub id: TransferId,
    pub name: String,
    pub size: u64,
}

/// Tagged channel message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    Text { message: String },
    FileOffer(FileOffer),
    FileAccept { id: TransferId },
    FileReject { id: TransferId },
    FileChunk { id: TransferId, data: String },
    FileDone { id: TransferId },
}

const KNOWN_TYPES: &[&str] = &[
    "text",
    "file-offer",
    "file-accept",
    "file-reject",
    "file-chunk",
    "file-done",
];

impl Message {
    pub fn text(message: impl Into<String>) -> Self {
        Message::Text {
            message: message.into(),
        }
    }

    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Text { .. } => "text",
            Message::FileOffer(_) => "file-offer",
            Message::FileAccept { .. } => "file-accept",
            Message::FileReject { .. } => "file-reject",
            Message::FileChunk { .. } => "file-chunk",
            Message::FileDone { .. } => "file-done",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_payload(&self) -> Result<TransportPayload> {
        Ok(TransportPayload::Text(self.to_json()?))
    }

    /// Parse an inbound text payload.
    ///
    /// Never fails: anything that is not a well-formed envelope of a known type
    /// comes back as [`Message::Text`] carrying the raw payload.
    pub fn parse(raw: &str) -> Self {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(_) => return Message::text(raw),
        };

        let Some(kind) = value.get("type").and_then(|t| t.as_str()) else {
            return Message::text(raw);
        };

        if !KNOWN_TYPES.contains(&kind) {
            warn!(kind, "Unknown message type, showing as text");
            return Message::text(raw);
        }

        match serde_json::from_value::<Message>(value.clone()) {
            Ok(message) => message,
            Err(e) => {
                warn!(kind, "Malformed {} message, showing as text: {}", kind, e);
                Message::text(raw)
            }
        }
    }
}
