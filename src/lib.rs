//! Peerdrop - peer-to-peer chat and file drop
//!
//! Peers find each other through a rendezvous relay, negotiate a direct channel,
//! then exchange chat text and files over it.
//!
//! ## Modules
//!
//! - **relay**: Rendezvous server assigning peer ids and forwarding signals
//! - **signaling**: Relay client and the fan-out event hub
//! - **session**: Offer/answer/candidate state machine over a pluggable transport
//! - **mux**: Tagged message envelope and dispatch
//! - **transfer**: Chunked file transfer with accept/reject handshake
//! - **peer**: The local peer tying it all together

pub mod config;
pub mod mux;
pub mod peer;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod transfer;
pub mod types;

pub use config::{Args, PeerConfig, TransferConfig};
pub use peer::{Peer, PeerEvent};
pub use relay::RelayServer;
pub use types::{PeerId, PeerdropError, Result, TransferId};
