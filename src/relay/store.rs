//! Relay peer registry
//!
//! Maps live peer ids to their outbound queues. Membership changes and the
//! peer-set broadcast that follows them are serialized, so every recipient sees
//! peer lists in the order the changes happened. Forwarding only reads the map.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::protocol::{stamp_sender, ServerMessage};
use crate::types::PeerId;

/// Outbound queue drained by a connection's writer task
pub type PeerSink = mpsc::UnboundedSender<Message>;

/// Connection entry in the registry
struct PeerEntry {
    sink: PeerSink,
    /// Remote address, kept for logging
    addr: Option<SocketAddr>,
}

/// Relay registry: the single authority on which peers are connected
pub struct PeerRegistry {
    peers: DashMap<PeerId, PeerEntry>,
    /// Held across a membership change and its broadcast
    membership: Mutex<()>,
    max_peers: usize,
}

impl PeerRegistry {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: DashMap::new(),
            membership: Mutex::new(()),
            max_peers,
        }
    }

    pub fn is_at_capacity(&self) -> bool {
        self.peers.len() >= self.max_peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    /// All registered ids
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Register a connection under a fresh id.
    ///
    /// Queues `init` for the new peer, then broadcasts the peer set to everyone.
    /// Returns `None` when the relay is full; the limit is checked under the
    /// membership lock, so concurrent joins cannot exceed it.
    pub fn register(&self, sink: PeerSink, addr: Option<SocketAddr>) -> Option<PeerId> {
        let _guard = self.membership.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_at_capacity() {
            warn!(addr = ?addr, max = self.max_peers, "Relay: full, peer not registered");
            return None;
        }

        let mut id = PeerId::generate();
        while self.peers.contains_key(&id) {
            id = PeerId::generate();
        }

        let init = ServerMessage::Init { id: id.clone() };
        let _ = sink.send(Message::Text(init.to_json()));
        self.peers.insert(id.clone(), PeerEntry { sink, addr });

        info!(peer = %id, addr = ?addr, count = self.peers.len(), "Relay: peer registered");
        self.broadcast_peer_set();
        Some(id)
    }

    /// Remove a connection and broadcast the new peer set
    pub fn deregister(&self, id: &PeerId) {
        let _guard = self.membership.lock().unwrap_or_else(|e| e.into_inner());

        if let Some((_, entry)) = self.peers.remove(id) {
            info!(
                peer = %id,
                addr = ?entry.addr,
                count = self.peers.len(),
                "Relay: peer disconnected"
            );
            self.broadcast_peer_set();
        }
    }

    /// Forward a client frame to its destination with `from` set to the sender.
    ///
    /// Unknown destinations and frames without a `to` are dropped silently.
    /// Returns whether the frame was queued for delivery.
    pub fn relay(&self, from: &PeerId, raw: &str) -> bool {
        let Some((to, stamped)) = stamp_sender(raw, from) else {
            debug!(peer = %from, "Relay: dropping frame without destination");
            return false;
        };

        match self.peers.get(&to) {
            Some(entry) => {
                debug!(from = %from, to = %to, bytes = stamped.len(), "Relay: forwarding");
                entry.sink.send(Message::Text(stamped)).is_ok()
            }
            None => {
                debug!(from = %from, to = %to, "Relay: unknown destination, dropped");
                false
            }
        }
    }

    /// Send every live connection the current id set minus itself
    fn broadcast_peer_set(&self) {
        let ids = self.peer_ids();
        for entry in self.peers.iter() {
            let peers = ids.iter().filter(|p| *p != entry.key()).cloned().collect();
            let msg = ServerMessage::PeerList { peers };
            let _ = entry.sink.send(Message::Text(msg.to_json()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn drain(rx: &mut UnboundedReceiver<Message>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Text(text) = msg {
                if let Ok(parsed) = serde_json::from_str(&text) {
                    out.push(parsed);
                }
            }
        }
        out
    }

    fn last_peer_list(msgs: &[ServerMessage]) -> Vec<PeerId> {
        msgs.iter()
            .rev()
            .find_map(|m| match m {
                ServerMessage::PeerList { peers } => Some(peers.clone()),
                _ => None,
            })
            .expect("peer list")
    }

    #[test]
    fn test_register_sends_init_then_peer_list() {
        let registry = PeerRegistry::new(10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = registry.register(tx, None).unwrap();

        let msgs = drain(&mut rx);
        assert_eq!(msgs[0], ServerMessage::Init { id: id.clone() });
        assert_eq!(msgs[1], ServerMessage::PeerList { peers: vec![] });
        assert!(registry.contains(&id));
    }

    #[test]
    fn test_broadcast_excludes_recipient() {
        let registry = PeerRegistry::new(10);
        let mut conns = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = registry.register(tx, None).unwrap();
            conns.push((id, rx));
        }

        let all = registry.peer_ids();
        for (id, rx) in conns.iter_mut() {
            let peers = last_peer_list(&drain(rx));
            let expected: Vec<PeerId> = all.iter().filter(|p| *p != id).cloned().collect();
            assert_eq!(peers, expected);
        }
    }

    #[test]
    fn test_deregister_broadcasts_remaining_set() {
        let registry = PeerRegistry::new(10);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = registry.register(tx_a, None).unwrap();
        let b = registry.register(tx_b, None).unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        registry.deregister(&b);
        assert_eq!(last_peer_list(&drain(&mut rx_a)), Vec::<PeerId>::new());
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(registry.peer_ids(), vec![a]);

        // Second deregister is a no-op
        registry.deregister(&b);
        assert!(drain(&mut rx_a).is_empty());
    }

    #[test]
    fn test_unknown_destination_is_dropped_without_broadcast() {
        let registry = PeerRegistry::new(10);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = registry.register(tx_a, None).unwrap();
        registry.register(tx_b, None).unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        let delivered = registry.relay(&a, r#"{"to":"nobody","type":"signal","signal":{}}"#);
        assert!(!delivered);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_relay_forwards_with_sender_id() {
        let registry = PeerRegistry::new(10);
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = registry.register(tx_a, None).unwrap();
        let b = registry.register(tx_b, None).unwrap();
        while rx_b.try_recv().is_ok() {}

        let raw = format!(r#"{{"to":"{}","type":"signal","signal":{{"type":"offer"}}}}"#, b);
        assert!(registry.relay(&a, &raw));

        let Message::Text(text) = rx_b.try_recv().unwrap() else {
            panic!("expected text frame");
        };
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["from"], a.as_str());
        assert_eq!(v["to"], b.as_str());
    }

    #[test]
    fn test_capacity() {
        let registry = PeerRegistry::new(1);
        assert!(!registry.is_at_capacity());
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(registry.register(tx, None).is_some());
        assert!(registry.is_at_capacity());

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(registry.register(tx, None).is_none());
        assert!(drain(&mut rx).is_empty());
        assert_eq!(registry.peer_count(), 1);
    }

    #[test]
    fn test_concurrent_joins_respect_capacity() {
        let registry = std::sync::Arc::new(PeerRegistry::new(4));
        let joins: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let (tx, rx) = mpsc::unbounded_channel();
                    let id = registry.register(tx, None);
                    (id, rx)
                })
            })
            .collect();

        let mut accepted = Vec::new();
        for join in joins {
            let (id, rx) = join.join().unwrap();
            if let Some(id) = id {
                accepted.push((id, rx));
            }
        }
        assert_eq!(accepted.len(), 4);
        assert_eq!(registry.peer_count(), 4);
    }
}
