//! Per-peer negotiation state
//!
//! A [`Session`] holds the description pair, the candidate buffer and the transport
//! for one remote peer. It performs no I/O of its own beyond calling the transport;
//! the negotiator's session actor decides when each step runs.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::transport::Transport;
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use crate::types::{PeerId, PeerdropError, Result};

/// Negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, nothing exchanged yet
    Idle,
    /// Offer sent, waiting for answer and channel open
    Offering,
    /// Offer received and answered, waiting for channel open
    Answering,
    /// Channel open
    Connected,
    /// Torn down
    Closed,
}

impl SessionState {
    /// Whether this state blocks a new session toward the same peer
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Closed)
    }
}

/// Negotiation state for one remote peer
pub struct Session {
    remote: PeerId,
    state: SessionState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    /// Remote candidates received before the remote description, in arrival order
    pending_candidates: Vec<IceCandidate>,
    transport: Arc<dyn Transport>,
}

impl Session {
    pub fn new(remote: PeerId, transport: Arc<dyn Transport>) -> Self {
        Self {
            remote,
            state: SessionState::Idle,
            local_description: None,
            remote_description: None,
            pending_candidates: Vec::new(),
            transport,
        }
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description.is_some()
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Idle -> Offering: create the offer and install it as local description
    pub async fn begin_offer(&mut self) -> Result<SessionDescription> {
        self.expect_state(SessionState::Idle, "offer")?;
        let offer = self.transport.create_offer().await?;
        self.set_local_description(offer.clone()).await?;
        self.state = SessionState::Offering;
        Ok(offer)
    }

    /// Idle -> Answering: install the remote offer and produce our answer
    pub async fn accept_offer(&mut self, offer: SessionDescription) -> Result<SessionDescription> {
        self.expect_state(SessionState::Idle, "incoming offer")?;
        if offer.kind != SdpKind::Offer {
            return Err(PeerdropError::Protocol("offer signal without offer sdp".into()));
        }
        self.set_remote_description(offer).await?;
        self.state = SessionState::Answering;

        let answer = self.transport.create_answer().await?;
        self.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// Offering: install the remote answer. Connected waits for channel open.
    pub async fn accept_answer(&mut self, answer: SessionDescription) -> Result<()> {
        self.expect_state(SessionState::Offering, "answer")?;
        if answer.kind != SdpKind::Answer {
            return Err(PeerdropError::Protocol("answer signal without answer sdp".into()));
        }
        self.set_remote_description(answer).await
    }

    /// Apply a remote candidate, or buffer it until the remote description exists
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if self.remote_description.is_some() {
            self.transport.add_candidate(candidate).await
        } else {
            debug!(
                remote = %self.remote,
                buffered = self.pending_candidates.len() + 1,
                "Buffering candidate until remote description is set"
            );
            self.pending_candidates.push(candidate);
            Ok(())
        }
    }

    /// Offering -> Idle on a fresh transport, for when our offer crossed the
    /// remote's and we answer theirs instead.
    ///
    /// Buffered remote candidates are kept; they belong to the remote offer.
    /// Returns the abandoned transport for the caller to close.
    pub fn restart(&mut self, transport: Arc<dyn Transport>) -> Result<Arc<dyn Transport>> {
        self.expect_state(SessionState::Offering, "restart")?;
        if self.remote_description.is_some() {
            return Err(PeerdropError::Protocol(
                "restart after the answer was applied".into(),
            ));
        }
        self.state = SessionState::Idle;
        self.local_description = None;
        Ok(std::mem::replace(&mut self.transport, transport))
    }

    /// Transport reported channel open.
    ///
    /// Moves to Connected only when both descriptions are in place; returns whether
    /// the transition happened.
    pub fn mark_open(&mut self) -> bool {
        let negotiating = matches!(self.state, SessionState::Offering | SessionState::Answering);
        if negotiating && self.local_description.is_some() && self.remote_description.is_some() {
            self.state = SessionState::Connected;
            true
        } else {
            warn!(
                remote = %self.remote,
                state = ?self.state,
                "Channel open before negotiation finished, ignored"
            );
            false
        }
    }

    /// Any -> Closed. Idempotent.
    pub async fn close(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Closed;
            self.pending_candidates.clear();
            self.transport.close().await;
        }
    }

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<()> {
        if self.local_description.is_some() {
            return Err(PeerdropError::DescriptionAlreadySet("local"));
        }
        self.transport.set_local_description(desc.clone()).await?;
        self.local_description = Some(desc);
        Ok(())
    }

    /// Install the remote description once, then flush buffered candidates in order
    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<()> {
        if self.remote_description.is_some() {
            return Err(PeerdropError::DescriptionAlreadySet("remote"));
        }
        self.transport.set_remote_description(desc.clone()).await?;
        self.remote_description = Some(desc);

        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            debug!(remote = %self.remote, count = pending.len(), "Flushing buffered candidates");
        }
        for candidate in pending {
            // Candidates of an abandoned offer no longer match
            if let Err(e) = self.transport.add_candidate(candidate).await {
                warn!(remote = %self.remote, "Buffered candidate rejected: {}", e);
            }
        }
        Ok(())
    }

    fn expect_state(&self, expected: SessionState, what: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(PeerdropError::Protocol(format!(
                "{} not valid in state {:?}",
                what, self.state
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::transport::TransportPayload;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records calls in order; rejects candidates before a remote description
    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<String>>,
        remote_set: Mutex<bool>,
    }

    impl RecordingTransport {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn create_offer(&self) -> Result<SessionDescription> {
            self.record("create_offer".into());
            Ok(SessionDescription::offer("o"))
        }

        async fn create_answer(&self) -> Result<SessionDescription> {
            self.record("create_answer".into());
            Ok(SessionDescription::answer("a"))
        }

        async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
            self.record(format!("set_local:{}", desc.sdp));
            Ok(())
        }

        async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
            *self.remote_set.lock().unwrap() = true;
            self.record(format!("set_remote:{}", desc.sdp));
            Ok(())
        }

        async fn add_candidate(&self, candidate: IceCandidate) -> Result<()> {
            if !*self.remote_set.lock().unwrap() {
                return Err(PeerdropError::Transport("no remote description".into()));
            }
            self.record(format!("candidate:{}", candidate.candidate));
            Ok(())
        }

        async fn send(&self, _payload: TransportPayload) -> Result<()> {
            Ok(())
        }

        async fn close(&self) {
            self.record("close".into());
        }
    }

    fn candidate(name: &str) -> IceCandidate {
        IceCandidate {
            candidate: name.to_string(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }

    #[tokio::test]
    async fn test_candidates_before_answer_are_flushed_in_order() {
        let transport = Arc::new(RecordingTransport::default());
        let mut session = Session::new("b".into(), transport.clone());

        session.begin_offer().await.unwrap();
        session.add_remote_candidate(candidate("c1")).await.unwrap();
        session.add_remote_candidate(candidate("c2")).await.unwrap();
        assert_eq!(session.pending_candidate_count(), 2);

        session.accept_answer(SessionDescription::answer("a")).await.unwrap();
        assert_eq!(session.pending_candidate_count(), 0);

        session.add_remote_candidate(candidate("c3")).await.unwrap();
        assert_eq!(
            transport.calls(),
            vec![
                "create_offer",
                "set_local:o",
                "set_remote:a",
                "candidate:c1",
                "candidate:c2",
                "candidate:c3",
            ]
        );
    }

    #[tokio::test]
    async fn test_connected_only_after_descriptions_and_open() {
        let transport = Arc::new(RecordingTransport::default());
        let mut session = Session::new("b".into(), transport);

        session.begin_offer().await.unwrap();
        assert_eq!(session.state(), SessionState::Offering);

        // Open before the answer does not connect
        assert!(!session.mark_open());
        assert_eq!(session.state(), SessionState::Offering);

        session.accept_answer(SessionDescription::answer("a")).await.unwrap();
        assert_eq!(session.state(), SessionState::Offering);

        assert!(session.mark_open());
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_answerer_path() {
        let transport = Arc::new(RecordingTransport::default());
        let mut session = Session::new("a".into(), transport.clone());

        let answer = session.accept_offer(SessionDescription::offer("o")).await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        assert_eq!(session.state(), SessionState::Answering);
        assert!(session.mark_open());
        assert_eq!(
            transport.calls(),
            vec!["set_remote:o", "create_answer", "set_local:a"]
        );
    }

    #[tokio::test]
    async fn test_out_of_order_answer_is_rejected() {
        let transport = Arc::new(RecordingTransport::default());
        let mut session = Session::new("b".into(), transport);

        assert!(session
            .accept_answer(SessionDescription::answer("a"))
            .await
            .is_err());

        session.begin_offer().await.unwrap();
        session.accept_answer(SessionDescription::answer("a")).await.unwrap();
        // Remote description is immutable once set
        assert!(matches!(
            session.accept_answer(SessionDescription::answer("again")).await,
            Err(PeerdropError::DescriptionAlreadySet("remote"))
        ));
    }

    #[tokio::test]
    async fn test_restart_keeps_buffered_candidates() {
        let first = Arc::new(RecordingTransport::default());
        let second = Arc::new(RecordingTransport::default());
        let mut session = Session::new("b".into(), first.clone());

        assert!(session.restart(second.clone()).is_err());

        session.begin_offer().await.unwrap();
        session.add_remote_candidate(candidate("c1")).await.unwrap();
        let abandoned = session.restart(second.clone()).unwrap();
        abandoned.close().await;
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.pending_candidate_count(), 1);

        session.accept_offer(SessionDescription::offer("o")).await.unwrap();
        assert_eq!(session.state(), SessionState::Answering);
        assert_eq!(first.calls(), vec!["create_offer", "set_local:o", "close"]);
        assert_eq!(
            second.calls(),
            vec!["set_remote:o", "candidate:c1", "create_answer", "set_local:a"]
        );
    }

    #[tokio::test]
    async fn test_restart_refused_once_answer_applied() {
        let transport = Arc::new(RecordingTransport::default());
        let mut session = Session::new("b".into(), transport);
        session.begin_offer().await.unwrap();
        session.accept_answer(SessionDescription::answer("a")).await.unwrap();

        let fresh = Arc::new(RecordingTransport::default());
        assert!(session.restart(fresh).is_err());
        assert_eq!(session.state(), SessionState::Offering);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = Arc::new(RecordingTransport::default());
        let mut session = Session::new("b".into(), transport.clone());

        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(transport.calls(), vec!["close"]);
        assert!(!session.state().is_active());
    }
}
