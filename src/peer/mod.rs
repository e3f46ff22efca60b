//! Local peer
//!
//! Wires the pieces together: the relay client feeds signals to the negotiator,
//! connected sessions get a transfer engine, and every inbound channel message is
//! dispatched through the multiplexer. The UI drives a [`Peer`] through its methods
//! and observes it through [`PeerEvent`]s.
//!
//! Incoming session offers are answered automatically. Incoming file offers are
//! not: they surface as [`PeerEvent::FileOffered`] and wait for
//! [`Peer::respond_to_offer`].

mod events;
mod handler;

pub use events::PeerEvent;

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PeerConfig;
use crate::mux::FileOffer;
use crate::session::{Negotiator, SessionEvent, SessionState, TransportFactory};
use crate::signaling::{EventHub, SignalClient, SignalEvent};
use crate::transfer::{FileSink, TransferOutcome};
use crate::types::{PeerId, PeerdropError, Result};
use handler::PeerHandler;

/// A peer joined to a relay
pub struct Peer {
    client: Arc<SignalClient>,
    negotiator: Arc<Negotiator>,
    handler: Arc<PeerHandler>,
    pump: JoinHandle<()>,
}

impl Peer {
    /// Join the relay at `config.relay_url`.
    ///
    /// The returned receiver is subscribed before the first event is published,
    /// so it sees the initial peer list.
    pub async fn connect(
        config: PeerConfig,
        factory: Arc<dyn TransportFactory>,
        sink: Arc<dyn FileSink>,
    ) -> Result<(Self, broadcast::Receiver<PeerEvent>)> {
        config.transfer.validate().map_err(PeerdropError::Config)?;

        let (client, signals) = SignalClient::connect(&config.relay_url, config.init_timeout).await?;
        let client = Arc::new(client);

        let (negotiator, sessions) = Negotiator::new(client.id().clone(), client.clone(), factory);

        let events = EventHub::default();
        let subscription = events.subscribe();
        let handler = Arc::new(PeerHandler::new(config.transfer, sink, events));

        let pump = tokio::spawn(pump(
            signals,
            sessions,
            Arc::clone(&negotiator),
            Arc::clone(&handler),
        ));

        info!(peer = %client.id(), "Peer ready");
        let peer = Self {
            client,
            negotiator,
            handler,
            pump,
        };
        Ok((peer, subscription))
    }

    pub fn id(&self) -> &PeerId {
        self.client.id()
    }

    /// Peers currently registered at the relay, excluding ourselves
    pub fn peers(&self) -> Vec<PeerId> {
        self.client.peers()
    }

    /// Peers with an open channel
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.handler.connected()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.handler.events().subscribe()
    }

    pub fn session_state(&self, remote: &PeerId) -> Option<SessionState> {
        self.negotiator.session_state(remote)
    }

    /// Offer a session to `remote`. Connection is reported as
    /// [`PeerEvent::SessionConnected`].
    pub async fn start_session(&self, remote: &PeerId) -> Result<()> {
        self.negotiator.start_session(remote).await
    }

    pub async fn send_text(&self, remote: &PeerId, text: impl Into<String>) -> Result<()> {
        self.handler.link(remote)?.send_text(text).await
    }

    /// Offer a file and, if accepted, stream it. Resolves with the final outcome.
    pub async fn send_file(
        &self,
        remote: &PeerId,
        name: &str,
        content: &[u8],
    ) -> Result<TransferOutcome> {
        self.handler.link(remote)?.send_file(name, content).await
    }

    /// Answer a [`PeerEvent::FileOffered`]
    pub async fn respond_to_offer(
        &self,
        remote: &PeerId,
        offer: &FileOffer,
        accept: bool,
    ) -> Result<()> {
        let link = self.handler.link(remote)?;
        if accept {
            link.accept_offer(offer).await
        } else {
            link.reject_offer(offer).await
        }
    }

    pub fn close_session(&self, remote: &PeerId) {
        self.negotiator.close_session(remote);
    }

    /// Close every session and leave the relay
    pub fn close(&self) {
        self.negotiator.close_all();
        self.client.close();
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.negotiator.close_all();
        self.pump.abort();
    }
}

/// Route relay events to the negotiator and session events to the handler.
///
/// Nothing here awaits application work: inbound messages are queued on their
/// session's dispatch task.
async fn pump(
    mut signals: mpsc::UnboundedReceiver<SignalEvent>,
    mut sessions: mpsc::UnboundedReceiver<SessionEvent>,
    negotiator: Arc<Negotiator>,
    handler: Arc<PeerHandler>,
) {
    loop {
        tokio::select! {
            event = signals.recv() => match event {
                Some(SignalEvent::PeerList(peers)) => {
                    debug!(count = peers.len(), "Peer list updated");
                    negotiator.retain_peers(&peers);
                    handler.events().emit(PeerEvent::PeerList(peers));
                }
                Some(SignalEvent::Signal { from, signal }) => {
                    debug!(from = %from, kind = signal.kind(), "Signal received");
                    negotiator.handle_signal(from, signal);
                }
                Some(SignalEvent::Disconnected) => {
                    warn!("Relay connection lost, closing sessions");
                    negotiator.close_all();
                    handler.events().emit(PeerEvent::RelayDisconnected);
                }
                None => break,
            },
            event = sessions.recv() => match event {
                Some(SessionEvent::Connected { remote, transport }) => {
                    handler.attach(remote, transport);
                }
                Some(SessionEvent::Message { remote, payload }) => {
                    handler.enqueue(&remote, payload);
                }
                Some(SessionEvent::Closed { remote }) => {
                    handler.detach(&remote);
                }
                None => break,
            },
        }
    }
    debug!("Peer event pump stopped");
}
