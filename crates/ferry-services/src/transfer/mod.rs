//! The transfer protocol: one TCP connection per file, header handshake,
//! then one chunk at a time with an acknowledgment for each.

pub mod frame;
pub mod outbound;
pub mod receiver;
pub mod sender;

use std::sync::Arc;

use ferry_core::model::ChunkSetMetadata;

use crate::session::SessionManager;

pub use outbound::OutboundRunner;
pub use receiver::{Accepted, InboundHandler};
pub use sender::{send_file, SendOptions, SendOutcome};

/// Observer for protocol events on one connection.
pub trait ProgressSink: Send + Sync {
    /// The peer answered the header; chunk exchange is about to start.
    fn handshake(&self, _file_id: &str) {}

    /// Chunk bookkeeping changed after an acknowledgment.
    fn progress(&self, _metadata: &ChunkSetMetadata) {}
}

impl ProgressSink for () {}

/// Forwards protocol events into a session.
pub struct SessionProgress {
    pub sessions: Arc<SessionManager>,
    pub session_id: String,
}

impl ProgressSink for SessionProgress {
    fn handshake(&self, _file_id: &str) {
        if let Err(e) = self.sessions.mark_in_progress(&self.session_id) {
            tracing::warn!(error = %e, session_id = %self.session_id, "failed to mark session in progress");
        }
    }

    fn progress(&self, metadata: &ChunkSetMetadata) {
        let result = self.sessions.record_progress(
            &self.session_id,
            &metadata.file_id,
            metadata.transferred_bytes,
        );
        if let Err(e) = result {
            tracing::warn!(error = %e, session_id = %self.session_id, "failed to record progress");
        }
    }
}
