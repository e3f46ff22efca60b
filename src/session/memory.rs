//! In-process transport
//!
//! A reliable, ordered message channel between two endpoints of the same
//! [`MemoryNetwork`], negotiated the way a browser data channel is:
//!
//! - descriptions name the endpoint that produced them (`memory:<n>`)
//! - setting the local description emits one local candidate
//! - adding a candidate before the remote description is set is an error
//! - both ends see `Open` once each has a local description, a remote description
//!   and the other side's candidate

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

use super::transport::{Transport, TransportEvent, TransportEvents, TransportFactory, TransportPayload};
use crate::signaling::{IceCandidate, SessionDescription};
use crate::types::{PeerId, PeerdropError, Result};

const SDP_PREFIX: &str = "memory:";
const CANDIDATE_PREFIX: &str = "candidate:memory ";

struct Endpoint {
    events: mpsc::UnboundedSender<TransportEvent>,
    has_local: bool,
    remote: Option<u64>,
    remote_candidate: bool,
    open: bool,
}

impl Endpoint {
    fn ready(&self) -> bool {
        self.has_local && self.remote.is_some() && self.remote_candidate
    }
}

#[derive(Default)]
struct NetworkInner {
    endpoints: Mutex<HashMap<u64, Endpoint>>,
    next_id: AtomicU64,
}

/// Shared medium for [`MemoryTransport`]s; also their factory
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of endpoints not yet closed
    pub fn endpoint_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Endpoint>> {
        self.inner
            .endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn with_endpoint<T>(
        &self,
        id: u64,
        f: impl FnOnce(&mut HashMap<u64, Endpoint>) -> Result<T>,
    ) -> Result<T> {
        let mut endpoints = self.lock();
        if !endpoints.contains_key(&id) {
            return Err(PeerdropError::Transport("transport closed".into()));
        }
        f(&mut *endpoints)
    }
}

impl TransportFactory for MemoryNetwork {
    fn create(&self, remote: &PeerId) -> Result<(Arc<dyn Transport>, TransportEvents)> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (events, events_rx) = mpsc::unbounded_channel();
        self.lock().insert(
            id,
            Endpoint {
                events,
                has_local: false,
                remote: None,
                remote_candidate: false,
                open: false,
            },
        );
        debug!(endpoint = id, remote = %remote, "Memory transport created");

        let transport = MemoryTransport {
            id,
            network: self.clone(),
        };
        Ok((Arc::new(transport), events_rx))
    }
}

/// One end of an in-process channel
pub struct MemoryTransport {
    id: u64,
    network: MemoryNetwork,
}

fn parse_suffix(value: &str, prefix: &str) -> Result<u64> {
    value
        .strip_prefix(prefix)
        .and_then(|rest| rest.trim().parse().ok())
        .ok_or_else(|| PeerdropError::Transport(format!("unrecognized value {:?}", value)))
}

/// Open both ends if both are ready and point at each other
fn try_open(endpoints: &mut HashMap<u64, Endpoint>, id: u64) {
    let Some(peer_id) = endpoints.get(&id).and_then(|e| e.remote) else {
        return;
    };
    let ready = |e: Option<&Endpoint>, other: u64| {
        e.map(|e| e.ready() && !e.open && e.remote == Some(other))
            .unwrap_or(false)
    };
    if !ready(endpoints.get(&id), peer_id) || !ready(endpoints.get(&peer_id), id) {
        return;
    }
    for end in [id, peer_id] {
        if let Some(e) = endpoints.get_mut(&end) {
            e.open = true;
            let _ = e.events.send(TransportEvent::Open);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.network
            .with_endpoint(self.id, |_| Ok(SessionDescription::offer(format!("{}{}", SDP_PREFIX, self.id))))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.network.with_endpoint(self.id, |endpoints| {
            if endpoints.get(&self.id).and_then(|e| e.remote).is_none() {
                return Err(PeerdropError::Transport("no remote offer to answer".into()));
            }
            Ok(SessionDescription::answer(format!("{}{}", SDP_PREFIX, self.id)))
        })
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<()> {
        self.network.with_endpoint(self.id, |endpoints| {
            if let Some(e) = endpoints.get_mut(&self.id) {
                e.has_local = true;
                let _ = e.events.send(TransportEvent::LocalCandidate(IceCandidate {
                    candidate: format!("{}{}", CANDIDATE_PREFIX, self.id),
                    sdp_mid: Some("0".to_string()),
                    sdp_mline_index: Some(0),
                }));
            }
            try_open(endpoints, self.id);
            Ok(())
        })
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let peer = parse_suffix(&desc.sdp, SDP_PREFIX)?;
        self.network.with_endpoint(self.id, |endpoints| {
            if !endpoints.contains_key(&peer) {
                return Err(PeerdropError::Transport(format!("unknown endpoint {}", peer)));
            }
            if let Some(e) = endpoints.get_mut(&self.id) {
                e.remote = Some(peer);
            }
            try_open(endpoints, self.id);
            Ok(())
        })
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let from = parse_suffix(&candidate.candidate, CANDIDATE_PREFIX)?;
        self.network.with_endpoint(self.id, |endpoints| {
            let Some(e) = endpoints.get_mut(&self.id) else {
                return Ok(());
            };
            match e.remote {
                None => Err(PeerdropError::Transport("remote description not set".into())),
                Some(peer) if peer != from => Err(PeerdropError::Transport(format!(
                    "candidate from endpoint {} does not match remote {}",
                    from, peer
                ))),
                Some(_) => {
                    e.remote_candidate = true;
                    try_open(endpoints, self.id);
                    Ok(())
                }
            }
        })
    }

    async fn send(&self, payload: TransportPayload) -> Result<()> {
        self.network.with_endpoint(self.id, |endpoints| {
            let peer = match endpoints.get(&self.id) {
                Some(e) if e.open => e.remote,
                _ => None,
            }
            .ok_or_else(|| PeerdropError::Transport("channel not open".into()))?;

            let peer = endpoints
                .get(&peer)
                .ok_or_else(|| PeerdropError::Transport("remote end closed".into()))?;
            peer.events
                .send(TransportEvent::Message(payload))
                .map_err(|_| PeerdropError::Transport("remote end closed".into()))
        })
    }

    async fn close(&self) {
        let mut endpoints = self.network.lock();
        if let Some(e) = endpoints.remove(&self.id) {
            let _ = e.events.send(TransportEvent::Closed);
            if let Some(peer) = e.remote.and_then(|p| endpoints.get(&p)) {
                if peer.remote == Some(self.id) {
                    let _ = peer.events.send(TransportEvent::Closed);
                }
            }
            debug!(endpoint = self.id, "Memory transport closed");
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.lock().remove(&self.id);
    }
}

/// Negotiate two in-process endpoints directly and wait until both are open
#[cfg(test)]
pub(crate) async fn connected_pair() -> (
    Arc<dyn Transport>,
    TransportEvents,
    Arc<dyn Transport>,
    TransportEvents,
) {
    async fn candidate(rx: &mut TransportEvents) -> IceCandidate {
        loop {
            if let Some(TransportEvent::LocalCandidate(c)) = rx.recv().await {
                return c;
            }
        }
    }
    async fn opened(rx: &mut TransportEvents) {
        while !matches!(rx.recv().await, Some(TransportEvent::Open) | None) {}
    }

    let net = MemoryNetwork::new();
    let (a, mut a_rx) = net.create(&"b".into()).unwrap();
    let (b, mut b_rx) = net.create(&"a".into()).unwrap();

    let offer = a.create_offer().await.unwrap();
    a.set_local_description(offer.clone()).await.unwrap();
    b.set_remote_description(offer).await.unwrap();
    let answer = b.create_answer().await.unwrap();
    b.set_local_description(answer.clone()).await.unwrap();
    a.set_remote_description(answer).await.unwrap();
    b.add_candidate(candidate(&mut a_rx).await).await.unwrap();
    a.add_candidate(candidate(&mut b_rx).await).await.unwrap();

    opened(&mut a_rx).await;
    opened(&mut b_rx).await;
    (a, a_rx, b, b_rx)
}
