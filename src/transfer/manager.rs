//! Per-session transfer engine
//!
//! A [`TransferManager`] exists for each connected session. It runs the sender
//! side (offer, wait for decision, stream chunks, done) and the receiver side
//! (records for accepted offers, chunk reassembly, delivery to the sink). Closing
//! the session aborts everything still open on it.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::codec::{chunk_count, decode_chunk, encode_chunk, split_chunks};
use super::pending::{Decision, PendingResponses};
use super::record::{TransferDirection, TransferRecord, TransferState};
use super::sink::{FileSink, ReceivedFile};
use crate::config::TransferConfig;
use crate::mux::{FileOffer, Message};
use crate::peer::PeerEvent;
use crate::session::Transport;
use crate::signaling::EventHub;
use crate::types::{PeerId, PeerdropError, Result, TransferId};

/// Final result of a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Delivered { chunks: usize, bytes: u64 },
    Rejected,
    TimedOut,
    /// Session closed before the transfer finished
    Aborted,
}

/// Progress report for one transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub remote: PeerId,
    pub id: TransferId,
    pub direction: TransferDirection,
    pub bytes: u64,
    pub size: u64,
    pub fraction: f64,
}

impl TransferProgress {
    fn of(remote: &PeerId, record: &TransferRecord) -> Self {
        Self {
            remote: remote.clone(),
            id: record.id.clone(),
            direction: record.direction,
            bytes: record.received_bytes,
            size: record.size,
            fraction: record.progress(),
        }
    }
}

pub struct TransferManager {
    remote: PeerId,
    transport: Arc<dyn Transport>,
    config: TransferConfig,
    pending: PendingResponses,
    outgoing: DashMap<TransferId, TransferRecord>,
    incoming: DashMap<TransferId, TransferRecord>,
    closed: AtomicBool,
    events: EventHub<PeerEvent>,
}

impl TransferManager {
    pub fn new(
        remote: PeerId,
        transport: Arc<dyn Transport>,
        config: TransferConfig,
        events: EventHub<PeerEvent>,
    ) -> Self {
        Self {
            remote,
            transport,
            config,
            pending: PendingResponses::new(),
            outgoing: DashMap::new(),
            incoming: DashMap::new(),
            closed: AtomicBool::new(false),
            events,
        }
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Transfers currently open in either direction
    pub fn active_count(&self) -> usize {
        self.outgoing.len() + self.incoming.len()
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        self.send_message(Message::text(text)).await
    }

    // ------------------------------------------------------------------
    // Sender
    // ------------------------------------------------------------------

    /// Offer `content` as `name`, wait for the decision, then stream it.
    ///
    /// Returns once the transfer reached a final state. Errors are local
    /// failures (session not open, transport send failed).
    pub async fn send_file(&self, name: &str, content: &[u8]) -> Result<TransferOutcome> {
        self.ensure_open()?;

        let id = TransferId::generate();
        let size = content.len() as u64;

        let pending = self.pending.register(id.clone())?;
        // abort_all may have run before the waiter existed to be cancelled
        if self.is_closed() {
            self.pending.cancel(&id);
            return Ok(TransferOutcome::Aborted);
        }
        self.outgoing
            .insert(id.clone(), TransferRecord::outgoing(id.clone(), name, size));

        info!(remote = %self.remote, transfer = %id, name, size, "Offering file");
        let offer = Message::FileOffer(FileOffer {
            id: id.clone(),
            name: name.to_string(),
            size,
        });
        if let Err(e) = self.send_message(offer).await {
            self.pending.cancel(&id);
            self.outgoing.remove(&id);
            return Err(e);
        }

        let decision = self.pending.wait(pending, self.config.response_timeout).await;
        debug!(remote = %self.remote, transfer = %id, ?decision, "Offer decided");

        let outcome = match decision {
            Decision::Accepted => self.stream(&id, content).await,
            Decision::Rejected => {
                self.set_outgoing_state(&id, TransferState::Rejected);
                Ok(TransferOutcome::Rejected)
            }
            Decision::TimedOut => {
                warn!(remote = %self.remote, transfer = %id, "No response to file offer");
                Ok(TransferOutcome::TimedOut)
            }
            Decision::Cancelled => Ok(TransferOutcome::Aborted),
        };
        self.outgoing.remove(&id);

        let outcome = outcome?;
        info!(remote = %self.remote, transfer = %id, outcome = ?outcome, "Outgoing transfer finished");
        self.events.emit(PeerEvent::TransferFinished {
            remote: self.remote.clone(),
            id,
            direction: TransferDirection::Send,
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }

    /// Stream accepted content back-to-back, then `file-done`
    async fn stream(&self, id: &TransferId, content: &[u8]) -> Result<TransferOutcome> {
        self.set_outgoing_state(id, TransferState::Accepted);
        let total = chunk_count(content.len(), self.config.chunk_size);
        let mut sent = 0;

        for chunk in split_chunks(content, self.config.chunk_size) {
            if self.send_aborted(id) {
                warn!(remote = %self.remote, transfer = %id, sent, total, "Transfer aborted mid-stream");
                return Ok(TransferOutcome::Aborted);
            }

            let message = Message::FileChunk {
                id: id.clone(),
                data: encode_chunk(chunk),
            };
            if let Err(e) = self.send_message(message).await {
                return self.abort_or(id, e);
            }
            sent += 1;

            let progress = self.outgoing.get_mut(id).map(|mut record| {
                record.record_sent(chunk.len());
                TransferProgress::of(&self.remote, &record)
            });
            if let Some(progress) = progress {
                self.events.emit(PeerEvent::TransferProgress(progress));
            }
        }

        if self.send_aborted(id) {
            return Ok(TransferOutcome::Aborted);
        }
        if let Err(e) = self.send_message(Message::FileDone { id: id.clone() }).await {
            return self.abort_or(id, e);
        }
        self.set_outgoing_state(id, TransferState::Complete);

        Ok(TransferOutcome::Delivered {
            chunks: sent,
            bytes: content.len() as u64,
        })
    }

    /// `file-accept` / `file-reject` from the receiver
    pub fn handle_response(&self, id: &TransferId, accepted: bool) {
        if !self.pending.resolve(id, accepted) {
            warn!(remote = %self.remote, transfer = %id, accepted, "Late or unknown transfer response ignored");
        }
    }

    // ------------------------------------------------------------------
    // Receiver
    // ------------------------------------------------------------------

    /// Accept a remote offer: open a record and reply `file-accept`
    pub async fn accept_offer(&self, offer: &FileOffer) -> Result<()> {
        self.ensure_open()?;
        match self.incoming.entry(offer.id.clone()) {
            Entry::Occupied(_) => {
                return Err(PeerdropError::Transfer(format!(
                    "transfer {} already accepted",
                    offer.id
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(TransferRecord::incoming(
                    offer.id.clone(),
                    offer.name.clone(),
                    offer.size,
                ));
            }
        }

        info!(remote = %self.remote, transfer = %offer.id, name = %offer.name, size = offer.size, "Accepting file");
        let reply = Message::FileAccept {
            id: offer.id.clone(),
        };
        if let Err(e) = self.send_message(reply).await {
            self.incoming.remove(&offer.id);
            return Err(e);
        }
        Ok(())
    }

    /// Decline a remote offer; no record is created
    pub async fn reject_offer(&self, offer: &FileOffer) -> Result<()> {
        self.ensure_open()?;
        info!(remote = %self.remote, transfer = %offer.id, name = %offer.name, "Rejecting file");
        self.send_message(Message::FileReject {
            id: offer.id.clone(),
        })
        .await
    }

    /// Append one chunk to its transfer; unknown ids are dropped
    pub fn handle_chunk(&self, id: &TransferId, data: &str) {
        let Some(mut record) = self.incoming.get_mut(id) else {
            warn!(remote = %self.remote, transfer = %id, "Chunk for unknown transfer dropped");
            return;
        };
        let bytes = match decode_chunk(data) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(remote = %self.remote, transfer = %id, "Undecodable chunk dropped: {}", e);
                return;
            }
        };
        record.append_chunk(bytes);
        let progress = TransferProgress::of(&self.remote, &record);
        drop(record);

        debug!(transfer = %id, bytes = progress.bytes, size = progress.size, "Chunk received");
        self.events.emit(PeerEvent::TransferProgress(progress));
    }

    /// `file-done`: reassemble, hand to `sink`, close the record
    pub async fn handle_done(&self, id: &TransferId, sink: &dyn FileSink) {
        let Some((_, mut record)) = self.incoming.remove(id) else {
            warn!(remote = %self.remote, transfer = %id, "Completion for unknown transfer dropped");
            return;
        };

        if record.received_bytes != record.size {
            warn!(
                remote = %self.remote,
                transfer = %id,
                received = record.received_bytes,
                expected = record.size,
                "Transfer size mismatch, delivering anyway"
            );
        }

        let chunks = record.chunk_count();
        let bytes = record.assemble();
        let len = bytes.len() as u64;
        let file = ReceivedFile {
            from: self.remote.clone(),
            id: id.clone(),
            name: record.name.clone(),
            bytes,
        };

        let outcome = match sink.deliver(file).await {
            Ok(()) => {
                info!(remote = %self.remote, transfer = %id, name = %record.name, bytes = len, "File received");
                self.events.emit(PeerEvent::FileReceived {
                    from: self.remote.clone(),
                    id: id.clone(),
                    name: record.name.clone(),
                    size: len,
                });
                TransferOutcome::Delivered { chunks, bytes: len }
            }
            Err(e) => {
                warn!(remote = %self.remote, transfer = %id, "File sink failed: {}", e);
                TransferOutcome::Aborted
            }
        };

        self.events.emit(PeerEvent::TransferFinished {
            remote: self.remote.clone(),
            id: id.clone(),
            direction: TransferDirection::Receive,
            outcome,
        });
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Session closed: cancel decision waits, stop streams, drop partial receives
    pub fn abort_all(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let waiting = self.pending.cancel_all();
        for mut record in self.outgoing.iter_mut() {
            if !record.state.is_terminal() {
                record.state = TransferState::Aborted;
            }
        }

        let partial: Vec<TransferId> = self.incoming.iter().map(|e| e.key().clone()).collect();
        for id in &partial {
            if let Some((_, mut record)) = self.incoming.remove(id) {
                record.state = TransferState::Aborted;
                self.events.emit(PeerEvent::TransferFinished {
                    remote: self.remote.clone(),
                    id: record.id,
                    direction: TransferDirection::Receive,
                    outcome: TransferOutcome::Aborted,
                });
            }
        }

        if waiting > 0 || !partial.is_empty() || !self.outgoing.is_empty() {
            info!(
                remote = %self.remote,
                waiting,
                sending = self.outgoing.len(),
                receiving = partial.len(),
                "Aborted open transfers"
            );
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(PeerdropError::NotConnected(self.remote.clone()))
        } else {
            Ok(())
        }
    }

    async fn send_message(&self, message: Message) -> Result<()> {
        self.transport.send(message.to_payload()?).await
    }

    fn set_outgoing_state(&self, id: &TransferId, state: TransferState) {
        if let Some(mut record) = self.outgoing.get_mut(id) {
            if record.state != TransferState::Aborted {
                record.state = state;
            }
        }
    }

    fn send_aborted(&self, id: &TransferId) -> bool {
        self.is_closed()
            || self
                .outgoing
                .get(id)
                .map(|r| r.state == TransferState::Aborted)
                .unwrap_or(true)
    }

    /// A failed send during streaming is an abort if the session is going away
    fn abort_or(&self, id: &TransferId, err: PeerdropError) -> Result<TransferOutcome> {
        if self.send_aborted(id) {
            Ok(TransferOutcome::Aborted)
        } else {
            Err(err)
        }
    }
}
