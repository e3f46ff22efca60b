//! Transfer bookkeeping

use serde::Serialize;

use crate::types::TransferId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Offered,
    Accepted,
    Rejected,
    InProgress,
    Complete,
    Aborted,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Rejected | TransferState::Complete | TransferState::Aborted
        )
    }
}

/// One file transfer on a session, from either side
#[derive(Debug)]
pub struct TransferRecord {
    pub id: TransferId,
    pub name: String,
    pub size: u64,
    pub direction: TransferDirection,
    pub state: TransferState,
    /// Bytes moved so far: sent for [`TransferDirection::Send`], received otherwise
    pub received_bytes: u64,
    chunks: Vec<Vec<u8>>,
}

impl TransferRecord {
    /// Outgoing transfer, created when the offer is sent
    pub fn outgoing(id: TransferId, name: impl Into<String>, size: u64) -> Self {
        Self::new(id, name.into(), size, TransferDirection::Send, TransferState::Offered)
    }

    /// Incoming transfer, created when the local side accepts the offer
    pub fn incoming(id: TransferId, name: impl Into<String>, size: u64) -> Self {
        Self::new(id, name.into(), size, TransferDirection::Receive, TransferState::Accepted)
    }

    fn new(
        id: TransferId,
        name: String,
        size: u64,
        direction: TransferDirection,
        state: TransferState,
    ) -> Self {
        Self {
            id,
            name,
            size,
            direction,
            state,
            received_bytes: 0,
            chunks: Vec::new(),
        }
    }

    /// Fraction complete; an empty file counts as done
    pub fn progress(&self) -> f64 {
        if self.size == 0 {
            1.0
        } else {
            self.received_bytes as f64 / self.size as f64
        }
    }

    /// Count bytes handed to the transport
    pub fn record_sent(&mut self, len: usize) {
        self.state = TransferState::InProgress;
        self.received_bytes += len as u64;
    }

    /// Append a decoded chunk in arrival order
    pub fn append_chunk(&mut self, chunk: Vec<u8>) {
        self.state = TransferState::InProgress;
        self.received_bytes += chunk.len() as u64;
        self.chunks.push(chunk);
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Concatenate the chunks into the final artifact
    pub fn assemble(&mut self) -> Vec<u8> {
        self.state = TransferState::Complete;
        let mut out = Vec::with_capacity(self.received_bytes as usize);
        for chunk in self.chunks.drain(..) {
            out.extend_from_slice(&chunk);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_progress_and_assembly() {
        let mut record = TransferRecord::incoming("t".into(), "a.bin", 5);
        assert_eq!(record.state, TransferState::Accepted);
        assert_eq!(record.progress(), 0.0);

        record.append_chunk(vec![1, 2]);
        assert_eq!(record.state, TransferState::InProgress);
        assert_eq!(record.received_bytes, 2);
        assert!((record.progress() - 0.4).abs() < f64::EPSILON);

        record.append_chunk(vec![3, 4, 5]);
        assert_eq!(record.chunk_count(), 2);
        assert_eq!(record.assemble(), vec![1, 2, 3, 4, 5]);
        assert_eq!(record.state, TransferState::Complete);
        assert!(record.state.is_terminal());
    }

    #[test]
    fn test_empty_file_is_complete_progress() {
        let record = TransferRecord::incoming("t".into(), "empty", 0);
        assert_eq!(record.progress(), 1.0);
    }
}
