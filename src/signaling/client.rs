//! Relay client
//!
//! One `SignalClient` per local peer owns the WebSocket to the relay. A writer task
//! drains an outbound queue; a reader task parses frames and publishes them. The
//! owner of the client gets every event on an unbounded queue, so negotiation
//! messages are never lost to a lagging consumer; extra observers subscribe to the
//! client's event hub. Dropping the client stops both tasks.

use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::hub::EventHub;
use super::protocol::{RelayFrame, Signal, SignalEnvelope};
use crate::types::{PeerId, PeerdropError, Result};

/// Something that can deliver a signal to a remote peer via the relay
pub trait SignalSink: Send + Sync {
    fn send_signal(&self, to: &PeerId, signal: Signal) -> Result<()>;
}

/// Events published by the relay client
#[derive(Debug, Clone)]
pub enum SignalEvent {
    /// Current peer set (never contains our own id)
    PeerList(Vec<PeerId>),
    /// Negotiation message from a remote peer
    Signal { from: PeerId, signal: Signal },
    /// Relay connection lost
    Disconnected,
}

/// Where parsed relay events go: the owner's queue first, then the hub
struct Outlet {
    primary: mpsc::UnboundedSender<SignalEvent>,
    hub: Arc<EventHub<SignalEvent>>,
}

impl Outlet {
    fn publish(&self, event: SignalEvent) {
        if self.primary.send(event.clone()).is_err() {
            debug!("Signal event queue closed");
        }
        self.hub.emit(event);
    }
}

/// Connection to the rendezvous relay
pub struct SignalClient {
    id: PeerId,
    outbound: mpsc::UnboundedSender<Message>,
    hub: Arc<EventHub<SignalEvent>>,
    peers: Arc<RwLock<Vec<PeerId>>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SignalClient {
    /// Connect to the relay and wait for our id.
    ///
    /// The returned queue exists before any frame after `init` is read, so it
    /// observes the first peer list. It is unbounded and never drops events.
    pub async fn connect(
        url: &str,
        init_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalEvent>)> {
        info!("Connecting to relay at {}", url);
        let (ws, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut write, mut read) = ws.split();

        let id = tokio::time::timeout(init_timeout, async {
            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                        Ok(RelayFrame::Init { id }) => return Ok(id),
                        Ok(other) => debug!("Ignoring frame before init: {:?}", other),
                        Err(e) => debug!("Ignoring malformed frame before init: {}", e),
                    },
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(PeerdropError::from(e)),
                    None => {
                        return Err(PeerdropError::Signaling(
                            "relay closed before init".to_string(),
                        ))
                    }
                }
            }
        })
        .await
        .map_err(|_| PeerdropError::Signaling("timed out waiting for init".to_string()))??;

        info!(peer = %id, "Registered with relay");

        let hub = Arc::new(EventHub::default());
        let (primary, events) = mpsc::unbounded_channel();
        let peers = Arc::new(RwLock::new(Vec::new()));

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    debug!("Relay write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader = {
            let outlet = Outlet {
                primary,
                hub: Arc::clone(&hub),
            };
            let peers = Arc::clone(&peers);
            let me = id.clone();
            tokio::spawn(async move {
                while let Some(msg) = read.next().await {
                    let text = match msg {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            debug!("Relay read failed: {}", e);
                            break;
                        }
                    };
                    handle_frame(&me, &text, &outlet, &peers);
                }
                info!(peer = %me, "Relay connection closed");
                outlet.publish(SignalEvent::Disconnected);
            })
        };

        let client = Self {
            id,
            outbound,
            hub,
            peers,
            reader,
            writer,
        };
        Ok((client, events))
    }

    /// Our relay-assigned id
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Last peer list received from the relay
    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.read().map(|p| p.clone()).unwrap_or_default()
    }

    /// Additional independent subscription to relay events
    pub fn subscribe(&self) -> broadcast::Receiver<SignalEvent> {
        self.hub.subscribe()
    }

    /// Send a close frame; the reader publishes `Disconnected` once the relay acks
    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }

    fn send_frame(&self, frame: &RelayFrame) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| PeerdropError::ChannelClosed)
    }
}

impl SignalSink for SignalClient {
    fn send_signal(&self, to: &PeerId, signal: Signal) -> Result<()> {
        debug!(to = %to, kind = signal.kind(), "Sending signal");
        self.send_frame(&RelayFrame::Signal(SignalEnvelope {
            to: to.clone(),
            from: None,
            signal,
        }))
    }
}

impl Drop for SignalClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Parse one relay frame and publish it. Malformed frames are dropped.
fn handle_frame(
    me: &PeerId,
    text: &str,
    outlet: &Outlet,
    peers: &RwLock<Vec<PeerId>>,
) {
    let frame: RelayFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("Dropping malformed relay frame: {}", e);
            return;
        }
    };

    match frame {
        RelayFrame::PeerList { peers: list } => {
            let list: Vec<PeerId> = list.into_iter().filter(|p| p != me).collect();
            if let Ok(mut guard) = peers.write() {
                *guard = list.clone();
            }
            outlet.publish(SignalEvent::PeerList(list));
        }
        RelayFrame::Signal(envelope) => match envelope.from {
            Some(from) => {
                debug!(from = %from, kind = envelope.signal.kind(), "Received signal");
                outlet.publish(SignalEvent::Signal {
                    from,
                    signal: envelope.signal,
                });
            }
            None => warn!("Dropping signal without sender"),
        },
        RelayFrame::Init { id } => warn!(peer = %id, "Unexpected second init frame"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outlet() -> (Outlet, mpsc::UnboundedReceiver<SignalEvent>, broadcast::Receiver<SignalEvent>) {
        let (primary, rx) = mpsc::unbounded_channel();
        let hub = Arc::new(EventHub::default());
        let observer = hub.subscribe();
        (Outlet { primary, hub }, rx, observer)
    }

    #[tokio::test]
    async fn test_handle_frame_publishes_peer_list_without_self() {
        let (outlet, mut rx, mut observer) = outlet();
        let peers = RwLock::new(Vec::new());
        let me = PeerId::from("me");

        handle_frame(&me, r#"{"type":"peer-list","peers":["me","b"]}"#, &outlet, &peers);

        match rx.recv().await.unwrap() {
            SignalEvent::PeerList(list) => assert_eq!(list, vec![PeerId::from("b")]),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(observer.recv().await.unwrap(), SignalEvent::PeerList(_)));
        assert_eq!(peers.read().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_handle_frame_drops_garbage_and_unsigned_signals() {
        let (outlet, mut rx, _observer) = outlet();
        let peers = RwLock::new(Vec::new());
        let me = PeerId::from("me");

        handle_frame(&me, "not json", &outlet, &peers);
        handle_frame(
            &me,
            r#"{"type":"signal","to":"me","signal":{"type":"candidate","candidate":{"candidate":"c"}}}"#,
            &outlet,
            &peers,
        );
        assert!(rx.try_recv().is_err());

        handle_frame(
            &me,
            r#"{"type":"signal","to":"me","from":"b","signal":{"type":"candidate","candidate":{"candidate":"c"}}}"#,
            &outlet,
            &peers,
        );
        match rx.try_recv().unwrap() {
            SignalEvent::Signal { from, signal } => {
                assert_eq!(from, PeerId::from("b"));
                assert_eq!(signal.kind(), "candidate");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_owner_queue_keeps_events_past_hub_capacity() {
        let (primary, mut rx) = mpsc::unbounded_channel();
        let hub = Arc::new(EventHub::new(4));
        let mut observer = hub.subscribe();
        let outlet = Outlet { primary, hub };
        let peers = RwLock::new(Vec::new());
        let me = PeerId::from("me");

        let frame = r#"{"type":"signal","to":"me","from":"b","signal":{"type":"candidate","candidate":{"candidate":"c"}}}"#;
        for _ in 0..50 {
            handle_frame(&me, frame, &outlet, &peers);
        }

        let mut queued = 0;
        while let Ok(SignalEvent::Signal { .. }) = rx.try_recv() {
            queued += 1;
        }
        assert_eq!(queued, 50);
        assert!(matches!(
            observer.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(_))
        ));
    }
}
