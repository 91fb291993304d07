//! Transfer error taxonomy.
//!
//! Every failure that can end a transfer attempt is a [`TransferError`].
//! The scheduler only needs [`TransferError::is_transient`]; the API and
//! logs use [`TransferError::kind`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use ferry_core::model::SessionStatus;
use ferry_core::{PlanError, WireError};
use serde::Serialize;

use crate::chunk_store::StoreError;
use crate::session::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Unreachable, refused, idle timeout. Retried by the scheduler.
    Network,
    /// Unreadable source, write failure, verification failure. Terminal.
    Storage,
    /// Malformed frame, short read, rejected chunk. Retried per chunk.
    Protocol,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("no data for {0:?}")]
    Timeout(Duration),

    #[error("connection closed by peer")]
    Closed,

    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("expected {expected}, got {got}")]
    Unexpected { expected: &'static str, got: String },

    #[error("peer rejected chunk {index}: {reason}")]
    ChunkRejected { index: u32, reason: String },

    #[error("peer reported: {0}")]
    Remote(String),

    #[error("transfer {0} by the receiver")]
    Halted(SessionStatus),

    #[error("chunk {index} of {file_id} used all {retries} retries")]
    RetriesExhausted {
        file_id: String,
        index: u32,
        retries: u32,
    },

    #[error("cannot read {path}: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("source ended after {got} of {expected} bytes")]
    SourceTruncated { expected: u64, got: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connect { .. } | Self::Timeout(_) | Self::Closed | Self::Io(_) => {
                ErrorKind::Network
            }
            Self::Wire(_)
            | Self::Unexpected { .. }
            | Self::ChunkRejected { .. }
            | Self::Remote(_)
            | Self::Halted(_)
            | Self::RetriesExhausted { .. } => ErrorKind::Protocol,
            Self::Source { .. }
            | Self::SourceTruncated { .. }
            | Self::Store(_)
            | Self::Plan(_)
            | Self::Session(_) => ErrorKind::Storage,
        }
    }

    /// Worth another scheduler attempt. Chunk caps are enforced separately
    /// by the runner, which reports [`TransferError::RetriesExhausted`].
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RetriesExhausted { .. } => false,
            other => matches!(other.kind(), ErrorKind::Network | ErrorKind::Protocol),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_and_protocol_errors_are_transient() {
        assert!(TransferError::Timeout(Duration::from_secs(30)).is_transient());
        assert!(TransferError::Closed.is_transient());
        assert!(TransferError::ChunkRejected { index: 1, reason: "x".into() }.is_transient());
        assert!(TransferError::Wire(WireError::FrameTooLarge(1 << 20)).is_transient());
    }

    #[test]
    fn storage_and_exhausted_errors_are_terminal() {
        let exhausted = TransferError::RetriesExhausted {
            file_id: "f".into(),
            index: 0,
            retries: 3,
        };
        assert_eq!(exhausted.kind(), ErrorKind::Protocol);
        assert!(!exhausted.is_transient());

        let source = TransferError::Source {
            path: "/nope".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(source.kind(), ErrorKind::Storage);
        assert!(!source.is_transient());
    }
}
