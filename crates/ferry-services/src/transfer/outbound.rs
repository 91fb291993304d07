//! Outbound runner: drives one outbound session for the scheduler.
//!
//! Files go one connection each, in session order. Files whose chunks are
//! all acknowledged are skipped, so a re-run continues with the first
//! unfinished file.

use std::sync::Arc;
use std::time::Duration;

use ferry_core::model::{SessionStatus, TransferSession};
use futures::future::BoxFuture;
use tokio::net::TcpStream;

use super::sender::{send_file, SendOptions};
use super::SessionProgress;
use crate::chunk_store::{ChunkStore, StoreError};
use crate::error::TransferError;
use crate::scheduler::TransferRunner;
use crate::session::{SessionError, SessionManager};

#[derive(Clone)]
pub struct OutboundRunner {
    sessions: Arc<SessionManager>,
    opts: SendOptions,
    connect_timeout: Duration,
    max_chunk_retries: u32,
}

impl OutboundRunner {
    pub fn new(
        sessions: Arc<SessionManager>,
        opts: SendOptions,
        connect_timeout: Duration,
        max_chunk_retries: u32,
    ) -> Self {
        Self {
            sessions,
            opts,
            connect_timeout,
            max_chunk_retries,
        }
    }

    /// One attempt at the whole session.
    pub async fn run_session(&self, session_id: &str) -> Result<(), TransferError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if session.status.is_terminal() || session.status == SessionStatus::Paused {
            tracing::debug!(session_id, status = %session.status, "nothing to run");
            return Ok(());
        }
        self.sessions.start(session_id)?;

        let store = self.sessions.outbound_store().clone();
        for file in &session.files {
            if !self.prepare(&store, &file.id)? {
                tracing::debug!(session_id, file_id = %file.id, "file already delivered");
                continue;
            }
            if let Err(e) = std::fs::File::open(file.content.path()) {
                return Err(TransferError::Source {
                    path: file.content.path().to_path_buf(),
                    source: e,
                });
            }

            let mut stream = self.connect(&session).await?;
            let sink = SessionProgress {
                sessions: self.sessions.clone(),
                session_id: session_id.to_string(),
            };
            let outcome = send_file(&mut stream, file, &store, &self.opts, &sink).await?;
            tracing::info!(
                session_id,
                file_id = %file.id,
                sent = outcome.sent.len(),
                skipped = outcome.skipped.len(),
                "file delivered"
            );
        }

        self.sessions.complete(session_id)?;
        Ok(())
    }

    /// Bring a file's chunks into a sendable state. Returns false when every
    /// chunk is already acknowledged.
    fn prepare(&self, store: &ChunkStore, file_id: &str) -> Result<bool, TransferError> {
        let meta = store
            .metadata(file_id)
            .ok_or_else(|| StoreError::UnknownFile(file_id.to_string()))?;
        if meta.is_complete() {
            return Ok(false);
        }

        store.recover_interrupted(file_id)?;
        store.reset_failed(file_id, Some(self.max_chunk_retries))?;
        if let Some(chunk) = store.exhausted(file_id, self.max_chunk_retries).first() {
            return Err(TransferError::RetriesExhausted {
                file_id: file_id.to_string(),
                index: chunk.index,
                retries: chunk.retry_count,
            });
        }
        Ok(true)
    }

    async fn connect(&self, session: &TransferSession) -> Result<TcpStream, TransferError> {
        let addr = session.peer.addr;
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransferError::Connect {
                addr,
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .map_err(|e| TransferError::Connect { addr, source: e })?;
        stream.set_nodelay(true)?;
        tracing::debug!(session_id = %session.id, peer = %session.peer.name, %addr, "connected");
        Ok(stream)
    }
}

impl TransferRunner for OutboundRunner {
    fn run(&self, session_id: &str) -> BoxFuture<'static, Result<(), TransferError>> {
        let this = self.clone();
        let id = session_id.to_string();
        Box::pin(async move { this.run_session(&id).await })
    }

    fn give_up(&self, session_id: &str, error: &TransferError) {
        let live = self
            .sessions
            .get(session_id)
            .is_some_and(|s| !s.status.is_terminal() && s.status != SessionStatus::Paused);
        if live {
            if let Err(e) = self.sessions.fail(session_id, &error.to_string()) {
                tracing::warn!(error = %e, session_id, "failed to fail session");
            }
        }
    }

    fn requeued(&self, session_id: &str, error: &TransferError) {
        let waiting = self.sessions.get(session_id).is_some_and(|s| {
            matches!(s.status, SessionStatus::InProgress | SessionStatus::Connecting)
        });
        if waiting {
            if let Err(e) = self.sessions.requeue(session_id, &error.to_string()) {
                tracing::warn!(error = %e, session_id, "failed to requeue session");
            }
        }
    }
}
