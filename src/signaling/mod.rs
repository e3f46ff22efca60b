//! Signaling: relay client and negotiation payloads
//!
//! The relay client is an explicit object owned by the local peer, not ambient
//! global state. Relay frames are fanned out through an [`EventHub`] so several
//! consumers (negotiator, UI, tests) can listen without clobbering each other.

mod client;
pub mod hub;
pub mod protocol;

pub use client::{SignalClient, SignalEvent, SignalSink};
pub use hub::EventHub;
pub use protocol::{IceCandidate, RelayFrame, SdpKind, SessionDescription, Signal, SignalEnvelope};
