//! Events a peer publishes for its UI

use crate::mux::FileOffer;
use crate::transfer::{TransferDirection, TransferOutcome, TransferProgress};
use crate::types::{PeerId, TransferId};

#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Relay peer set changed; never contains our own id
    PeerList(Vec<PeerId>),
    SessionConnected(PeerId),
    SessionClosed(PeerId),
    Chat { from: PeerId, text: String },
    /// A remote peer offers a file; answer with `Peer::respond_to_offer`
    FileOffered { from: PeerId, offer: FileOffer },
    TransferProgress(TransferProgress),
    /// A file was reassembled and handed to the sink
    FileReceived {
        from: PeerId,
        id: TransferId,
        name: String,
        size: u64,
    },
    TransferFinished {
        remote: PeerId,
        id: TransferId,
        direction: TransferDirection,
        outcome: TransferOutcome,
    },
    /// Lost the relay connection; every session has been closed
    RelayDisconnected,
}
