//! Peer sessions
//!
//! One [`Session`] per remote peer, driven by the [`Negotiator`] over an abstract
//! [`Transport`]. [`MemoryNetwork`] provides an in-process transport for tests and
//! local demos.

mod memory;
mod negotiator;
mod state;
mod transport;

pub use memory::{MemoryNetwork, MemoryTransport};
#[cfg(test)]
pub(crate) use memory::connected_pair;
pub use negotiator::{Negotiator, SessionEvent};
pub use state::{Session, SessionState};
pub use transport::{Transport, TransportEvent, TransportEvents, TransportFactory, TransportPayload};
