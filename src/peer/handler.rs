//! Message handling for all connected sessions of one peer
//!
//! Each connected session has its own dispatch task fed by an inbox, so messages
//! of one session are handled in order while a slow file sink on one session never
//! holds up another session or the signaling pump.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::events::PeerEvent;
use crate::config::TransferConfig;
use crate::mux::{self, FileOffer, MessageHandler};
use crate::session::{Transport, TransportPayload};
use crate::signaling::EventHub;
use crate::transfer::{FileSink, TransferManager};
use crate::types::{PeerId, PeerdropError, Result, TransferId};

/// Transfer engine and inbox of one connected session
struct Link {
    manager: Arc<TransferManager>,
    inbox: mpsc::UnboundedSender<TransportPayload>,
}

/// Connected sessions and their transfer engines
pub(crate) struct PeerHandler {
    links: DashMap<PeerId, Link>,
    transfer: TransferConfig,
    sink: Arc<dyn FileSink>,
    events: EventHub<PeerEvent>,
}

impl PeerHandler {
    pub fn new(transfer: TransferConfig, sink: Arc<dyn FileSink>, events: EventHub<PeerEvent>) -> Self {
        Self {
            links: DashMap::new(),
            transfer,
            sink,
            events,
        }
    }

    pub fn events(&self) -> &EventHub<PeerEvent> {
        &self.events
    }

    /// Session opened: start a transfer engine and a dispatch task on its transport
    pub fn attach(self: &Arc<Self>, remote: PeerId, transport: Arc<dyn Transport>) {
        let manager = TransferManager::new(
            remote.clone(),
            transport,
            self.transfer.clone(),
            self.events.clone(),
        );
        let (inbox, queue) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_in_order(Arc::downgrade(self), remote.clone(), queue));

        let link = Link {
            manager: Arc::new(manager),
            inbox,
        };
        if let Some(old) = self.links.insert(remote.clone(), link) {
            old.manager.abort_all();
        }
        self.events.emit(PeerEvent::SessionConnected(remote));
    }

    /// Queue an inbound channel message on its session's dispatch task
    pub fn enqueue(&self, remote: &PeerId, payload: TransportPayload) {
        match self.links.get(remote) {
            Some(link) => {
                if link.inbox.send(payload).is_err() {
                    debug!(from = %remote, "Dispatch task gone, message dropped");
                }
            }
            None => warn!(from = %remote, "Message from peer without session dropped"),
        }
    }

    /// Session closed: abort whatever was still open on it
    pub fn detach(&self, remote: &PeerId) {
        if let Some((_, link)) = self.links.remove(remote) {
            link.manager.abort_all();
        }
        self.events.emit(PeerEvent::SessionClosed(remote.clone()));
    }

    pub fn link(&self, remote: &PeerId) -> Result<Arc<TransferManager>> {
        self.links
            .get(remote)
            .map(|link| Arc::clone(&link.manager))
            .ok_or_else(|| PeerdropError::NotConnected(remote.clone()))
    }

    pub fn connected(&self) -> Vec<PeerId> {
        self.links.iter().map(|e| e.key().clone()).collect()
    }

    fn link_for(&self, from: &PeerId, what: &str) -> Option<Arc<TransferManager>> {
        let link = self.links.get(from).map(|link| Arc::clone(&link.manager));
        if link.is_none() {
            warn!(from = %from, "{} from peer without session dropped", what);
        }
        link
    }
}

/// Dispatch one session's messages in arrival order until its inbox closes
async fn dispatch_in_order(
    handler: Weak<PeerHandler>,
    remote: PeerId,
    mut queue: mpsc::UnboundedReceiver<TransportPayload>,
) {
    while let Some(payload) = queue.recv().await {
        let Some(handler) = handler.upgrade() else {
            break;
        };
        mux::dispatch(handler.as_ref(), &remote, payload).await;
    }
    debug!(remote = %remote, "Session dispatch stopped");
}

#[async_trait]
impl MessageHandler for PeerHandler {
    async fn on_text(&self, from: &PeerId, text: String) {
        info!(from = %from, len = text.len(), "Chat message");
        self.events.emit(PeerEvent::Chat {
            from: from.clone(),
            text,
        });
    }

    async fn on_file_offer(&self, from: &PeerId, offer: FileOffer) {
        info!(from = %from, transfer = %offer.id, name = %offer.name, size = offer.size, "File offered");
        self.events.emit(PeerEvent::FileOffered {
            from: from.clone(),
            offer,
        });
    }

    async fn on_file_response(&self, from: &PeerId, id: TransferId, accepted: bool) {
        if let Some(link) = self.link_for(from, "Transfer response") {
            link.handle_response(&id, accepted);
        }
    }

    async fn on_chunk(&self, from: &PeerId, id: TransferId, data: String) {
        if let Some(link) = self.link_for(from, "Chunk") {
            link.handle_chunk(&id, &data);
        }
    }

    async fn on_done(&self, from: &PeerId, id: TransferId) {
        if let Some(link) = self.link_for(from, "Completion") {
            link.handle_done(&id, self.sink.as_ref()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::Message;
    use crate::session::connected_pair;
    use crate::transfer::{codec, MemorySink, ReceivedFile};
    use std::time::Duration;
    use tokio::sync::{broadcast, Semaphore};

    /// Holds every delivery until a permit is added
    struct GatedSink {
        gate: Semaphore,
        inner: MemorySink,
    }

    #[async_trait]
    impl FileSink for GatedSink {
        async fn deliver(&self, file: ReceivedFile) -> Result<()> {
            let _permit = self.gate.acquire().await.unwrap();
            self.inner.deliver(file).await
        }
    }

    async fn next_matching(
        events: &mut broadcast::Receiver<PeerEvent>,
        mut pick: impl FnMut(&PeerEvent) -> bool,
    ) -> PeerEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                if pick(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for peer event")
    }

    fn payload(message: Message) -> TransportPayload {
        message.to_payload().unwrap()
    }

    #[tokio::test]
    async fn test_slow_sink_does_not_block_other_sessions() {
        let sink = Arc::new(GatedSink {
            gate: Semaphore::new(0),
            inner: MemorySink::new(),
        });
        let events = EventHub::default();
        let mut rx = events.subscribe();
        let handler = Arc::new(PeerHandler::new(
            TransferConfig::default(),
            sink.clone(),
            events,
        ));

        let (to_b, _to_b_events, _at_b, _at_b_events) = connected_pair().await;
        let (to_c, _to_c_events, _at_c, _at_c_events) = connected_pair().await;
        let b = PeerId::from("b");
        let c = PeerId::from("c");
        handler.attach(b.clone(), to_b);
        handler.attach(c.clone(), to_c);

        let offer = FileOffer {
            id: "t1".into(),
            name: "slow.bin".into(),
            size: 3,
        };
        handler.link(&b).unwrap().accept_offer(&offer).await.unwrap();

        handler.enqueue(
            &b,
            payload(Message::FileChunk {
                id: "t1".into(),
                data: codec::encode_chunk(b"abc"),
            }),
        );
        handler.enqueue(&b, payload(Message::FileDone { id: "t1".into() }));
        handler.enqueue(&c, payload(Message::text("still here")));

        let chat = next_matching(&mut rx, |e| matches!(e, PeerEvent::Chat { .. })).await;
        match chat {
            PeerEvent::Chat { from, text } => {
                assert_eq!(from, c);
                assert_eq!(text, "still here");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(sink.inner.files().is_empty());

        sink.gate.add_permits(1);
        next_matching(&mut rx, |e| matches!(e, PeerEvent::FileReceived { .. })).await;
        assert_eq!(sink.inner.files()[0].bytes, b"abc");
    }

    #[tokio::test]
    async fn test_messages_of_one_session_keep_their_order() {
        let events = EventHub::default();
        let mut rx = events.subscribe();
        let handler = Arc::new(PeerHandler::new(
            TransferConfig::default(),
            Arc::new(MemorySink::new()),
            events,
        ));
        let (to_b, _to_b_events, _at_b, _at_b_events) = connected_pair().await;
        let b = PeerId::from("b");
        handler.attach(b.clone(), to_b);

        for i in 0..20 {
            handler.enqueue(&b, payload(Message::text(i.to_string())));
        }
        for i in 0..20 {
            match next_matching(&mut rx, |e| matches!(e, PeerEvent::Chat { .. })).await {
                PeerEvent::Chat { text, .. } => assert_eq!(text, i.to_string()),
                other => panic!("unexpected {:?}", other),
            }
        }
    }
}
