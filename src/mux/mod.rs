//! Message multiplexer
//!
//! Routes each inbound transport payload to exactly one handler method by its
//! `type` tag. Handlers are a trait object rather than per-type callback slots, so
//! registering one concern never replaces another.

mod message;

pub use message::{FileOffer, Message};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::session::TransportPayload;
use crate::types::{PeerId, TransferId};

/// Receives the messages of one or more sessions after dispatch
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Chat text, including payloads that could not be parsed as an envelope
    async fn on_text(&self, from: &PeerId, text: String);

    async fn on_file_offer(&self, from: &PeerId, offer: FileOffer);

    /// `file-accept` (`accepted == true`) or `file-reject`
    async fn on_file_response(&self, from: &PeerId, id: TransferId, accepted: bool);

    async fn on_chunk(&self, from: &PeerId, id: TransferId, data: String);

    async fn on_done(&self, from: &PeerId, id: TransferId);
}

/// Dispatch one payload from `from` to `handler`
pub async fn dispatch(handler: &dyn MessageHandler, from: &PeerId, payload: TransportPayload) {
    let raw = match payload {
        TransportPayload::Text(raw) => raw,
        TransportPayload::Binary(bytes) => {
            warn!(from = %from, len = bytes.len(), "Binary message dropped");
            return;
        }
    };

    let message = Message::parse(&raw);
    debug!(from = %from, kind = message.kind(), "Dispatching message");

    match message {
        Message::Text { message } => handler.on_text(from, message).await,
        Message::FileOffer(offer) => handler.on_file_offer(from, offer).await,
        Message::FileAccept { id } => handler.on_file_response(from, id, true).await,
        Message::FileReject { id } => handler.on_file_response(from, id, false).await,
        Message::FileChunk { id, data } => handler.on_chunk(from, id, data).await,
        Message::FileDone { id } => handler.on_done(from, id).await,
    }
}
