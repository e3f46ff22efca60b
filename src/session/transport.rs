//! Transport abstraction
//!
//! The negotiation primitive (offer/answer/candidate plumbing plus a reliable,
//! ordered message channel) is a black box behind [`Transport`]. Asynchronous
//! happenings on the transport arrive as [`TransportEvent`]s on a channel handed out
//! together with the transport.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::signaling::{IceCandidate, SessionDescription};
use crate::types::{PeerId, Result};

/// One message on the established channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportPayload {
    Text(String),
    Binary(Vec<u8>),
}

/// Asynchronous notifications from a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local ICE candidate was discovered and should be relayed
    LocalCandidate(IceCandidate),
    /// The message channel is open
    Open,
    /// Inbound message
    Message(TransportPayload),
    /// The channel closed (either side)
    Closed,
}

/// Receiving half of a transport's event stream
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Negotiation primitive plus message channel for one remote peer
#[async_trait]
pub trait Transport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Apply a remote candidate. Fails if no remote description is set yet.
    async fn add_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Send one message; only valid once the channel is open
    async fn send(&self, payload: TransportPayload) -> Result<()>;

    async fn close(&self);
}

/// Creates one transport per session
pub trait TransportFactory: Send + Sync {
    fn create(&self, remote: &PeerId) -> Result<(Arc<dyn Transport>, TransportEvents)>;
}
