//! Relay wire format
//!
//! Line-oriented JSON over WebSocket text frames.
//!
//! Server -> client:
//! - `{"type":"init","id":<PeerId>}` once, right after connect
//! - `{"type":"peer-list","peers":[<PeerId>,...]}` after every membership change,
//!   never containing the recipient's own id
//!
//! Client -> server: any JSON object with a string `to` field. The relay does not
//! interpret the rest; it sets `from` to the sender's id and forwards the object.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::PeerId;

/// Messages originated by the relay itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Identity assignment
    Init { id: PeerId },
    /// Current peer set, excluding the recipient
    PeerList { peers: Vec<PeerId> },
}

impl ServerMessage {
    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> String {
        // Plain enum of strings, cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Parse a client frame and stamp it with the sender's id.
///
/// Returns the destination and the frame to forward, or `None` when the frame is
/// not a JSON object with a string `to` field. A sender-supplied `from` is
/// overwritten.
pub fn stamp_sender(raw: &str, from: &PeerId) -> Option<(PeerId, String)> {
    let mut value: Value = serde_json::from_str(raw).ok()?;
    let obj = value.as_object_mut()?;
    let to = PeerId::from(obj.get("to")?.as_str()?);
    obj.insert("from".to_string(), Value::String(from.to_string()));
    Some((to, value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_shapes() {
        let init = ServerMessage::Init { id: "a".into() };
        assert_eq!(init.to_json(), r#"{"type":"init","id":"a"}"#);

        let list = ServerMessage::PeerList {
            peers: vec!["b".into(), "c".into()],
        };
        assert_eq!(list.to_json(), r#"{"type":"peer-list","peers":["b","c"]}"#);
    }

    #[test]
    fn test_stamp_sender_injects_from() {
        let raw = r#"{"to":"b","type":"signal","signal":{"type":"offer"}}"#;
        let (to, out) = stamp_sender(raw, &PeerId::from("a")).unwrap();
        assert_eq!(to.as_str(), "b");

        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["from"], "a");
        assert_eq!(v["signal"]["type"], "offer");
    }

    #[test]
    fn test_stamp_sender_overwrites_spoofed_from() {
        let raw = r#"{"to":"b","from":"mallory","type":"signal"}"#;
        let (_, out) = stamp_sender(raw, &PeerId::from("a")).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["from"], "a");
    }

    #[test]
    fn test_stamp_sender_rejects_garbage() {
        let me = PeerId::from("a");
        assert!(stamp_sender("not json", &me).is_none());
        assert!(stamp_sender("[1,2,3]", &me).is_none());
        assert!(stamp_sender(r#"{"type":"signal"}"#, &me).is_none());
        assert!(stamp_sender(r#"{"to":42}"#, &me).is_none());
    }
}
