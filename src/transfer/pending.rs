//! Accept/reject correlation table
//!
//! Each outgoing offer registers a waiter keyed by transfer id. The first matching
//! response removes the entry and wakes the waiter; later responses find nothing.
//! Waits always carry a timeout, and closing the session cancels every waiter.

use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

use crate::types::{PeerdropError, Result, TransferId};

/// How a wait for the receiver's decision ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accepted,
    Rejected,
    TimedOut,
    /// Session closed while waiting
    Cancelled,
}

/// Waiter handed out by [`PendingResponses::register`]
pub struct PendingResponse {
    id: TransferId,
    rx: oneshot::Receiver<bool>,
}

#[derive(Default)]
pub struct PendingResponses {
    waiters: DashMap<TransferId, oneshot::Sender<bool>>,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `id`. Must happen before the offer goes out.
    pub fn register(&self, id: TransferId) -> Result<PendingResponse> {
        let (tx, rx) = oneshot::channel();
        match self.waiters.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(PeerdropError::Transfer(format!(
                "transfer {} already awaiting a response",
                id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx);
                Ok(PendingResponse { id, rx })
            }
        }
    }

    /// Deliver the receiver's decision. Returns false if nobody was waiting
    /// (unknown id, duplicate response, or the wait already timed out).
    pub fn resolve(&self, id: &TransferId, accepted: bool) -> bool {
        match self.waiters.remove(id) {
            Some((_, tx)) => tx.send(accepted).is_ok(),
            None => {
                debug!(transfer = %id, accepted, "Response with no waiter ignored");
                false
            }
        }
    }

    /// Wait for the decision on `pending`, at most `timeout`
    pub async fn wait(&self, pending: PendingResponse, timeout: Duration) -> Decision {
        let PendingResponse { id, rx } = pending;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(true)) => Decision::Accepted,
            Ok(Ok(false)) => Decision::Rejected,
            Ok(Err(_)) => Decision::Cancelled,
            Err(_) => {
                self.waiters.remove(&id);
                Decision::TimedOut
            }
        }
    }

    /// Forget the waiter for `id` without resolving it
    pub fn cancel(&self, id: &TransferId) -> bool {
        self.waiters.remove(id).is_some()
    }

    /// Drop every waiter; each resolves as [`Decision::Cancelled`]
    pub fn cancel_all(&self) -> usize {
        let count = self.waiters.len();
        self.waiters.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
