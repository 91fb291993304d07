//! Receiving side: one accepted connection carries either a discovery
//! probe or exactly one file.
//!
//! Each payload is persisted and verified through the inbound
//! [`ChunkStore`] before it is acknowledged. Once every chunk is held the
//! file is assembled into the download directory and its chunk storage
//! is released. Pausing or cancelling the session closes a live
//! connection at once.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ferry_core::model::{ContentRef, FileDescriptor, PeerRef, SessionStatus, TransferSession};
use ferry_core::plan::plan_chunks;
use ferry_core::wire::{ready_tokens, Control, FileHeader, HEADER_FRAMES};
use ferry_core::WireError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use super::frame::{read_frame, read_payload, read_token, write_token};
use super::{ProgressSink, SessionProgress};
use crate::chunk_store::{ChunkStore, StoreError};
use crate::error::TransferError;
use crate::peer::PeerRegistry;
use crate::session::SessionManager;

/// What an accepted connection turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accepted {
    /// A discovery probe, answered with our identity.
    Probe,
    /// A file, fully received and assembled at `path`.
    File { session_id: String, path: PathBuf },
    /// The receiving session does not accept data right now.
    Refused(String),
}

pub struct InboundHandler {
    pub store: Arc<ChunkStore>,
    pub sessions: Arc<SessionManager>,
    pub peers: Arc<PeerRegistry>,
    pub download_dir: PathBuf,
    pub idle_timeout: Duration,
    /// Failed chunks at this many retries are not reset on reconnect.
    pub max_chunk_retries: u32,
    pub device_id: String,
    pub device_name: String,
}

impl InboundHandler {
    /// Serve one connection to completion.
    pub async fn handle<S>(&self, stream: &mut S, remote: SocketAddr) -> Result<Accepted, TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let first = read_frame(stream, self.idle_timeout).await?;
        if first == b"HELLO" {
            let me = Control::Peer {
                id: self.device_id.clone(),
                name: self.device_name.clone(),
            };
            write_token(stream, &me, self.idle_timeout).await?;
            tracing::trace!(%remote, "answered probe");
            return Ok(Accepted::Probe);
        }

        let mut frames = Vec::with_capacity(HEADER_FRAMES);
        frames.push(first);
        for _ in 1..HEADER_FRAMES {
            frames.push(read_frame(stream, self.idle_timeout).await?);
        }
        let header = match FileHeader::from_frames(&frames) {
            Ok(header) => header,
            Err(e) => return Err(reject(stream, e.into(), self.idle_timeout).await),
        };
        tracing::debug!(%remote, file_id = %header.file_id, name = %header.name, size = header.size, "incoming file");

        if let Err(e) = self.open_chunks(&header) {
            return Err(reject(stream, e, self.idle_timeout).await);
        }

        let session = match self.admit(&header, remote) {
            Ok(Some(session)) => session,
            Ok(None) => {
                let reason = "transfer is paused or cancelled by the receiver".to_string();
                write_token(stream, &Control::Error(reason.clone()), self.idle_timeout).await?;
                return Ok(Accepted::Refused(reason));
            }
            Err(e) => return Err(reject(stream, e, self.idle_timeout).await),
        };

        if let Some(chunk) = self.store.exhausted(&header.file_id, self.max_chunk_retries).first() {
            let e = TransferError::RetriesExhausted {
                file_id: header.file_id.clone(),
                index: chunk.index,
                retries: chunk.retry_count,
            };
            if let Err(fail) = self.sessions.fail(&session.id, &e.to_string()) {
                tracing::warn!(error = %fail, session_id = %session.id, "failed to fail session");
            }
            return Err(reject(stream, e, self.idle_timeout).await);
        }

        let mut updates = self.sessions.subscribe();
        let result = tokio::select! {
            result = self.exchange(stream, &session.id, &header) => result,
            status = halted(&mut updates, &session.id) => Err(TransferError::Halted(status)),
        };
        match result {
            Ok(()) => self.finish(&session.id, &header),
            Err(e @ TransferError::Halted(_)) => {
                tracing::info!(session_id = %session.id, reason = %e, "closing inbound connection");
                Err(reject(stream, e, self.idle_timeout).await)
            }
            Err(e) => {
                self.interrupted(&session.id, &e);
                Err(e)
            }
        }
    }

    /// Register (or resume) the chunk layout announced in the header.
    fn open_chunks(&self, header: &FileHeader) -> Result<(), TransferError> {
        let (meta, chunks) = plan_chunks(
            &header.file_id,
            &header.name,
            header.size,
            Some(header.chunk_size),
        )?;
        if meta.total_chunks != header.total_chunks {
            return Err(WireError::Malformed(format!(
                "{} bytes in chunks of {} is {} chunks, header says {}",
                header.size, header.chunk_size, meta.total_chunks, header.total_chunks
            ))
            .into());
        }

        match self.store.open_file(meta.clone(), chunks.clone()) {
            Err(StoreError::LayoutMismatch(_)) => {
                tracing::warn!(file_id = %header.file_id, "discarding chunks with a stale layout");
                self.store.cleanup(&header.file_id);
                self.store.open_file(meta, chunks)?;
            }
            other => {
                other?;
            }
        }
        self.store.recover_interrupted(&header.file_id)?;
        self.store.reset_failed(&header.file_id, Some(self.max_chunk_retries))?;
        Ok(())
    }

    /// Find or create the inbound session and move it to `InProgress`.
    /// `None` means the user paused or cancelled it.
    fn admit(
        &self,
        header: &FileHeader,
        remote: SocketAddr,
    ) -> Result<Option<TransferSession>, TransferError> {
        let session = match self.sessions.find_inbound(&header.file_id) {
            Some(existing) => existing,
            None => {
                let peer = self
                    .peers
                    .find_by_ip(remote.ip())
                    .map(|p| p.peer_ref())
                    .unwrap_or_else(|| PeerRef {
                        id: remote.ip().to_string(),
                        name: remote.ip().to_string(),
                        addr: remote,
                    });
                let file = FileDescriptor {
                    id: header.file_id.clone(),
                    name: header.name.clone(),
                    size: header.size,
                    content_type: header.content_type.clone(),
                    content: ContentRef::new(self.download_dir.join(safe_name(&header.name))),
                    checksum: header.checksum.clone(),
                };
                self.sessions.create_inbound(peer, file)?
            }
        };

        let id = session.id.as_str();
        match session.status {
            SessionStatus::Paused | SessionStatus::Cancelled => return Ok(None),
            SessionStatus::Failed => {
                self.sessions.retry(id)?;
                self.sessions.start(id)?;
            }
            SessionStatus::Pending => {
                self.sessions.start(id)?;
            }
            _ => {}
        }
        Ok(Some(self.sessions.mark_in_progress(id)?))
    }

    async fn exchange<S>(
        &self,
        stream: &mut S,
        session_id: &str,
        header: &FileHeader,
    ) -> Result<(), TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let file_id = header.file_id.as_str();
        let sink = SessionProgress {
            sessions: self.sessions.clone(),
            session_id: session_id.to_string(),
        };

        for token in ready_tokens(&self.store.completed(file_id)) {
            write_token(stream, &token, self.idle_timeout).await?;
        }
        self.report(file_id, &sink);

        while !self.is_complete(file_id) {
            let (index, len) = match read_token(stream, self.idle_timeout).await? {
                Control::Chunk { index, len } => (index, len),
                Control::Error(reason) => return Err(TransferError::Remote(reason)),
                other => {
                    return Err(reject(
                        stream,
                        TransferError::Unexpected {
                            expected: "CHUNK",
                            got: other.to_string(),
                        },
                        self.idle_timeout,
                    )
                    .await)
                }
            };
            if index >= header.total_chunks || len > u64::from(header.chunk_size) {
                let e = WireError::Malformed(format!("chunk {index} of {len} bytes is out of range"));
                return Err(reject(stream, e.into(), self.idle_timeout).await);
            }

            self.store.mark_in_progress(file_id, index)?;
            let mut payload = vec![0u8; len as usize];
            if let Err(e) = read_payload(stream, &mut payload, self.idle_timeout).await {
                self.store.mark_failed(file_id, index, &e.to_string())?;
                return Err(e);
            }

            match self.store.save_chunk(file_id, index, &payload) {
                Ok(()) => {
                    write_token(stream, &Control::ChunkCompleted { index }, self.idle_timeout).await?;
                    self.report(file_id, &sink);
                    tracing::debug!(file_id, chunk = index, bytes = len, "chunk stored");
                }
                Err(e) => {
                    let nack = Control::ChunkFailed {
                        index,
                        reason: e.to_string(),
                    };
                    write_token(stream, &nack, self.idle_timeout).await?;
                    return Err(match e {
                        StoreError::SizeMismatch { .. } | StoreError::VerifyFailed { .. } => {
                            TransferError::ChunkRejected {
                                index,
                                reason: e.to_string(),
                            }
                        }
                        other => other.into(),
                    });
                }
            }
        }

        write_token(stream, &Control::Completed, self.idle_timeout).await?;
        Ok(())
    }

    fn is_complete(&self, file_id: &str) -> bool {
        self.store.metadata(file_id).is_some_and(|m| m.is_complete())
    }

    fn report(&self, file_id: &str, sink: &dyn ProgressSink) {
        if let Some(meta) = self.store.metadata(file_id) {
            sink.progress(&meta);
        }
    }

    /// Every chunk is held: verify, assemble, release storage.
    fn finish(&self, session_id: &str, header: &FileHeader) -> Result<Accepted, TransferError> {
        let file_id = header.file_id.as_str();
        let result = (|| -> Result<PathBuf, TransferError> {
            if let Some(expected) = &header.checksum {
                let actual = self.store.checksum(file_id)?;
                if !actual.eq_ignore_ascii_case(expected) {
                    self.sessions.add_warning(
                        session_id,
                        &format!("{}: checksum mismatch (expected {expected}, got {actual})", header.name),
                    )?;
                }
            }
            let dest = unique_destination(&self.download_dir, &header.name);
            self.store.assemble(file_id, &dest)?;
            self.sessions.set_content(session_id, file_id, ContentRef::new(&dest))?;
            Ok(dest)
        })();

        match result {
            Ok(path) => {
                self.store.cleanup(file_id);
                self.sessions.complete(session_id)?;
                tracing::info!(session_id, file_id, path = %path.display(), "file received");
                Ok(Accepted::File {
                    session_id: session_id.to_string(),
                    path,
                })
            }
            Err(e) => {
                if let Err(fail) = self.sessions.fail(session_id, &e.to_string()) {
                    tracing::warn!(error = %fail, session_id, "failed to fail session");
                }
                Err(e)
            }
        }
    }

    /// The connection ended early. Transient problems leave the session
    /// waiting for the sender to reconnect; anything else fails it.
    fn interrupted(&self, session_id: &str, error: &TransferError) {
        tracing::warn!(error = %error, session_id, "inbound transfer interrupted");
        let status = self.sessions.get(session_id).map(|s| s.status);
        let result = match status {
            Some(SessionStatus::InProgress | SessionStatus::Connecting) if error.is_transient() => {
                self.sessions.requeue(session_id, &error.to_string())
            }
            Some(s) if !s.is_terminal() && s != SessionStatus::Paused => {
                self.sessions.fail(session_id, &error.to_string())
            }
            _ => return,
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, session_id, "failed to update interrupted session");
        }
    }
}

/// Resolves once the session is paused or cancelled.
async fn halted(
    updates: &mut watch::Receiver<Vec<TransferSession>>,
    session_id: &str,
) -> SessionStatus {
    loop {
        let status = updates
            .borrow_and_update()
            .iter()
            .find(|s| s.id == session_id)
            .map(|s| s.status);
        if let Some(status @ (SessionStatus::Paused | SessionStatus::Cancelled)) = status {
            return status;
        }
        if updates.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

/// Send `ERROR:<reason>` (best effort) and hand the error back.
async fn reject<S>(stream: &mut S, error: TransferError, timeout: Duration) -> TransferError
where
    S: AsyncWrite + Unpin,
{
    if let Err(e) = write_token(stream, &Control::Error(error.to_string()), timeout).await {
        tracing::debug!(error = %e, "could not deliver error token");
    }
    error
}

/// The last path component of a sender-supplied name, never empty.
fn safe_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("download")
        .to_string()
}

/// `dir/name`, or `dir/stem (n).ext` for the first free `n`.
pub fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let name = safe_name(name);
    let candidate = dir.join(&name);
    if !candidate.exists() {
        return candidate;
    }

    let path = Path::new(&name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(&name)
        .to_string();
    let ext = path.extension().and_then(|e| e.to_str()).map(str::to_string);
    (1u32..)
        .map(|n| match &ext {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}
