//! Session negotiator
//!
//! Owns the map of live sessions (at most one per remote peer) and runs each one as
//! an actor task. Signals for a session are queued on its mailbox in arrival order,
//! so one slow negotiation never holds up another peer. The actor also drains its
//! transport's events: local candidates are relayed as soon as they appear, channel
//! open completes the negotiation, and inbound messages are surfaced as
//! [`SessionEvent::Message`].
//!
//! When both sides offer at once, the peer with the lower id abandons its own
//! offer and answers the remote one; the other side ignores the crossing offer.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::state::{Session, SessionState};
use super::transport::{Transport, TransportEvent, TransportEvents, TransportFactory, TransportPayload};
use crate::signaling::{Signal, SignalSink};
use crate::types::{PeerId, PeerdropError, Result};

/// Notifications for the layer above the negotiator
#[derive(Clone)]
pub enum SessionEvent {
    /// Channel open; the transport is ready for application traffic
    Connected {
        remote: PeerId,
        transport: Arc<dyn Transport>,
    },
    /// Application message on a connected session
    Message {
        remote: PeerId,
        payload: TransportPayload,
    },
    /// Session torn down (transport closed, peer gone, or local close)
    Closed { remote: PeerId },
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::Connected { remote, .. } => write!(f, "Connected({:?})", remote),
            SessionEvent::Message { remote, payload } => {
                write!(f, "Message({:?}, {:?})", remote, payload)
            }
            SessionEvent::Closed { remote } => write!(f, "Closed({:?})", remote),
        }
    }
}

enum SessionCommand {
    /// Local request to open a session
    Start { reply: oneshot::Sender<Result<()>> },
    /// Signal from the remote peer
    Signal(Signal),
    Close,
}

/// Mailbox and state view of a running session actor
struct SessionHandle {
    generation: u64,
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionState>,
}

/// Drives offer/answer/candidate exchange for every remote peer
pub struct Negotiator {
    local_id: PeerId,
    signals: Arc<dyn SignalSink>,
    factory: Arc<dyn TransportFactory>,
    sessions: DashMap<PeerId, SessionHandle>,
    next_generation: AtomicU64,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Negotiator {
    pub fn new(
        local_id: PeerId,
        signals: Arc<dyn SignalSink>,
        factory: Arc<dyn TransportFactory>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let negotiator = Arc::new(Self {
            local_id,
            signals,
            factory,
            sessions: DashMap::new(),
            next_generation: AtomicU64::new(1),
            events,
        });
        (negotiator, events_rx)
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Current state of the session with `remote`, if one is live
    pub fn session_state(&self, remote: &PeerId) -> Option<SessionState> {
        self.sessions.get(remote).map(|h| *h.state.borrow())
    }

    /// Watch the state of the session with `remote`
    pub fn watch_state(&self, remote: &PeerId) -> Option<watch::Receiver<SessionState>> {
        self.sessions.get(remote).map(|h| h.state.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Open a session toward `remote` as the offering side.
    ///
    /// Fails with [`PeerdropError::SessionExists`] if a session with `remote` is
    /// already negotiating or connected. Returns once the offer has been relayed.
    pub async fn start_session(self: &Arc<Self>, remote: &PeerId) -> Result<()> {
        if remote == &self.local_id {
            return Err(PeerdropError::Protocol("cannot open a session to self".into()));
        }

        let commands = match self.sessions.entry(remote.clone()) {
            Entry::Occupied(_) => return Err(PeerdropError::SessionExists(remote.clone())),
            Entry::Vacant(slot) => {
                let handle = self.spawn_session(remote.clone())?;
                let commands = handle.commands.clone();
                slot.insert(handle);
                commands
            }
        };

        let (reply, reply_rx) = oneshot::channel();
        commands
            .send(SessionCommand::Start { reply })
            .map_err(|_| PeerdropError::ChannelClosed)?;
        reply_rx.await.map_err(|_| PeerdropError::ChannelClosed)?
    }

    /// Route a signal from the relay to the session it belongs to.
    ///
    /// An offer from an unknown peer creates a session on the answering side.
    /// Answers and candidates with no session are ignored.
    pub fn handle_signal(self: &Arc<Self>, from: PeerId, signal: Signal) {
        let command = SessionCommand::Signal(signal);

        let result = match self.sessions.entry(from.clone()) {
            Entry::Occupied(entry) => entry.get().commands.send(command),
            Entry::Vacant(slot) => {
                let SessionCommand::Signal(Signal::Offer { .. }) = &command else {
                    debug!(from = %from, "Signal for unknown session ignored");
                    return;
                };
                match self.spawn_session(from.clone()) {
                    Ok(handle) => {
                        let sent = handle.commands.send(command);
                        slot.insert(handle);
                        sent
                    }
                    Err(e) => {
                        warn!(from = %from, "Could not create session for offer: {}", e);
                        return;
                    }
                }
            }
        };

        if result.is_err() {
            debug!(from = %from, "Session mailbox closed, signal dropped");
        }
    }

    /// Close the session with `remote`, if any
    pub fn close_session(&self, remote: &PeerId) {
        if let Some(handle) = self.sessions.get(remote) {
            let _ = handle.commands.send(SessionCommand::Close);
        }
    }

    /// Close every session whose peer is no longer registered at the relay
    pub fn retain_peers(&self, live: &[PeerId]) {
        for entry in self.sessions.iter() {
            if !live.contains(entry.key()) {
                info!(remote = %entry.key(), "Peer left the relay, closing session");
                let _ = entry.value().commands.send(SessionCommand::Close);
            }
        }
    }

    /// Close all sessions (relay connection lost or shutdown)
    pub fn close_all(&self) {
        for entry in self.sessions.iter() {
            let _ = entry.value().commands.send(SessionCommand::Close);
        }
    }

    fn spawn_session(self: &Arc<Self>, remote: PeerId) -> Result<SessionHandle> {
        let (transport, transport_events) = self.factory.create(&remote)?;
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let actor = SessionActor {
            negotiator: Arc::clone(self),
            session: Session::new(remote, transport),
            generation,
            state: state_tx,
        };
        tokio::spawn(actor.run(commands_rx, transport_events));

        Ok(SessionHandle {
            generation,
            commands,
            state: state_rx,
        })
    }
}

/// Task owning one [`Session`]
struct SessionActor {
    negotiator: Arc<Negotiator>,
    session: Session,
    generation: u64,
    state: watch::Sender<SessionState>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut transport_events: TransportEvents,
    ) {
        let remote = self.session.remote().clone();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Start { reply }) => {
                        let result = self.start().await;
                        let failed = result.is_err();
                        let _ = reply.send(result);
                        if failed {
                            break;
                        }
                    }
                    Some(SessionCommand::Signal(signal)) => {
                        if self.yields_to(&signal) {
                            match self.abandon_offer().await {
                                Ok(events) => transport_events = events,
                                Err(e) => {
                                    warn!(remote = %remote, "Could not restart session: {}", e);
                                    break;
                                }
                            }
                        }
                        if let Err(e) = self.apply_signal(signal).await {
                            warn!(remote = %remote, "Signal not applied: {}", e);
                            if self.session.state() == SessionState::Idle {
                                break;
                            }
                        }
                    }
                    Some(SessionCommand::Close) | None => break,
                },
                event = transport_events.recv() => match event {
                    Some(TransportEvent::LocalCandidate(candidate)) => {
                        let signal = Signal::Candidate { candidate };
                        if let Err(e) = self.negotiator.signals.send_signal(&remote, signal) {
                            warn!(remote = %remote, "Failed to relay local candidate: {}", e);
                        }
                    }
                    Some(TransportEvent::Open) => {
                        if self.session.mark_open() {
                            self.publish_state();
                            info!(remote = %remote, "Session connected");
                            let _ = self.negotiator.events.send(SessionEvent::Connected {
                                remote: remote.clone(),
                                transport: self.session.transport(),
                            });
                        }
                    }
                    Some(TransportEvent::Message(payload)) => {
                        if self.session.state() == SessionState::Connected {
                            let _ = self.negotiator.events.send(SessionEvent::Message {
                                remote: remote.clone(),
                                payload,
                            });
                        } else {
                            debug!(remote = %remote, "Message before channel open dropped");
                        }
                    }
                    Some(TransportEvent::Closed) | None => break,
                },
            }
        }

        let was_connected = self.session.state() == SessionState::Connected;
        self.session.close().await;
        self.publish_state();
        self.negotiator
            .sessions
            .remove_if(&remote, |_, h| h.generation == self.generation);

        info!(remote = %remote, was_connected, "Session closed");
        let _ = self.negotiator.events.send(SessionEvent::Closed { remote });
    }

    async fn start(&mut self) -> Result<()> {
        let offer = self.session.begin_offer().await?;
        self.publish_state();
        info!(remote = %self.session.remote(), "Sending offer");
        self.negotiator
            .signals
            .send_signal(self.session.remote(), Signal::Offer { sdp: offer })
    }

    /// A remote offer crossed ours and the remote side wins the tie-break
    fn yields_to(&self, signal: &Signal) -> bool {
        matches!(signal, Signal::Offer { .. })
            && self.session.state() == SessionState::Offering
            && !self.session.has_remote_description()
            && self.negotiator.local_id < *self.session.remote()
    }

    /// Drop our offer and its transport; the session is Idle on a fresh transport
    async fn abandon_offer(&mut self) -> Result<TransportEvents> {
        let remote = self.session.remote().clone();
        info!(remote = %remote, "Offers crossed, answering the remote offer");
        let (transport, events) = self.negotiator.factory.create(&remote)?;
        let abandoned = self.session.restart(transport)?;
        abandoned.close().await;
        self.publish_state();
        Ok(events)
    }

    async fn apply_signal(&mut self, signal: Signal) -> Result<()> {
        let remote = self.session.remote().clone();
        match signal {
            Signal::Offer { sdp } => {
                if self.session.state() != SessionState::Idle {
                    warn!(remote = %remote, state = ?self.session.state(), "Offer for active session ignored");
                    return Ok(());
                }
                info!(remote = %remote, "Answering offer");
                let answer = self.session.accept_offer(sdp).await?;
                self.publish_state();
                self.negotiator
                    .signals
                    .send_signal(&remote, Signal::Answer { sdp: answer })
            }
            Signal::Answer { sdp } => {
                if self.session.state() != SessionState::Offering {
                    warn!(remote = %remote, state = ?self.session.state(), "Answer without matching offer ignored");
                    return Ok(());
                }
                debug!(remote = %remote, "Applying answer");
                self.session.accept_answer(sdp).await
            }
            Signal::Candidate { candidate } => self.session.add_remote_candidate(candidate).await,
        }
    }

    fn publish_state(&self) {
        let _ = self.state.send(self.session.state());
    }
}
