//! File transfer protocol
//!
//! Sender: `file-offer` → wait for `file-accept`/`file-reject` (bounded by
//! [`TransferConfig::response_timeout`](crate::config::TransferConfig)) → one
//! `file-chunk` per chunk, in order, back-to-back → `file-done`.
//!
//! Receiver: an accepted offer opens a [`TransferRecord`]; chunks are appended in
//! arrival order and `file-done` hands the concatenation to a [`FileSink`].
//!
//! The transport is reliable and ordered, so chunks carry no sequence numbers.

pub mod codec;
mod manager;
mod pending;
mod record;
mod sink;

pub use manager::{TransferManager, TransferOutcome, TransferProgress};
pub use pending::{Decision, PendingResponse, PendingResponses};
pub use record::{TransferDirection, TransferRecord, TransferState};
pub use sink::{sanitize_file_name, DirectorySink, FileSink, MemorySink, ReceivedFile};
