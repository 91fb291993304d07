//! Sending side of one file transfer.
//!
//! Strictly synchronous: one chunk is written, then its acknowledgment is
//! awaited before the next one goes out. Any failure marks the chunk in
//! flight as failed and ends the connection; retrying is the caller's job.

use std::io::SeekFrom;
use std::time::Duration;

use ferry_core::model::{ChunkSetMetadata, FileDescriptor};
use ferry_core::wire::{Control, FileHeader, IndexRuns};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite};

use super::frame::{read_token, write_all, write_frame};
use super::ProgressSink;
use crate::chunk_store::ChunkStore;
use crate::error::TransferError;
use crate::qos::SpeedLimit;

/// Payload is streamed in pieces of this size.
const IO_BUF: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct SendOptions {
    pub idle_timeout: Duration,
    /// Bytes per second. 0 = unlimited.
    pub speed_limit: u64,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(ferry_core::wire::IDLE_TIMEOUT_SECS),
            speed_limit: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOutcome {
    /// Indices actually written to the stream, in order.
    pub sent: Vec<u32>,
    /// Indices the receiver already held.
    pub skipped: Vec<u32>,
}

/// Transfer `file` over `stream`. Chunk state lives in `store`, which must
/// already hold the file's planned layout.
pub async fn send_file<S>(
    stream: &mut S,
    file: &FileDescriptor,
    store: &ChunkStore,
    opts: &SendOptions,
    sink: &dyn ProgressSink,
) -> Result<SendOutcome, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let meta = store
        .metadata(&file.id)
        .ok_or_else(|| crate::chunk_store::StoreError::UnknownFile(file.id.clone()))?;

    let header = FileHeader {
        name: file.name.clone(),
        size: file.size,
        content_type: file.content_type.clone(),
        checksum: file.checksum.clone(),
        total_chunks: meta.total_chunks,
        chunk_size: meta.chunk_size,
        file_id: file.id.clone(),
    };
    write_all(stream, &header.encode(), opts.idle_timeout).await?;

    let held = read_held(stream, opts).await?;
    let mut is_held = vec![false; meta.total_chunks as usize];
    let mut outcome = SendOutcome::default();
    let last = meta.total_chunks.saturating_sub(1);
    for run in held {
        for index in *run.start()..=(*run.end()).min(last) {
            if !is_held[index as usize] {
                is_held[index as usize] = true;
                outcome.skipped.push(index);
            }
        }
    }
    store.mark_completed_many(&file.id, outcome.skipped.iter().copied())?;
    sink.handshake(&file.id);
    report(store, &file.id, sink);
    tracing::debug!(file_id = %file.id, held = outcome.skipped.len(), total = meta.total_chunks, "handshake complete");

    let mut source = tokio::fs::File::open(file.content.path())
        .await
        .map_err(|e| TransferError::Source {
            path: file.content.path().to_path_buf(),
            source: e,
        })?;
    let mut limit = SpeedLimit::new(opts.speed_limit);

    for index in (0..meta.total_chunks).filter(|&i| !is_held[i as usize]) {
        store.mark_in_progress(&file.id, index)?;
        let exchange = send_chunk(stream, &mut source, file, store, &meta, index, opts, &mut limit);
        if let Err(e) = exchange.await {
            if let Err(mark) = store.mark_failed(&file.id, index, &e.to_string()) {
                tracing::warn!(error = %mark, file_id = %file.id, chunk = index, "failed to record chunk failure");
            }
            return Err(e);
        }
        store.mark_completed(&file.id, index)?;
        outcome.sent.push(index);
        report(store, &file.id, sink);
        tracing::debug!(file_id = %file.id, chunk = index, "chunk acknowledged");
    }

    match read_token(stream, opts.idle_timeout).await? {
        Control::Completed => Ok(outcome),
        Control::Error(reason) => Err(TransferError::Remote(reason)),
        other => Err(TransferError::Unexpected {
            expected: "COMPLETED",
            got: other.to_string(),
        }),
    }
}

/// Collect the receiver's held runs: any number of `HELD` tokens, then
/// `READY`.
async fn read_held<S>(stream: &mut S, opts: &SendOptions) -> Result<IndexRuns, TransferError>
where
    S: AsyncRead + Unpin,
{
    let mut runs = IndexRuns::new();
    loop {
        match read_token(stream, opts.idle_timeout).await? {
            Control::Held { held } => runs.extend(held),
            Control::Ready { held } => {
                runs.extend(held);
                return Ok(runs);
            }
            Control::Error(reason) => return Err(TransferError::Remote(reason)),
            other => {
                return Err(TransferError::Unexpected {
                    expected: "READY",
                    got: other.to_string(),
                })
            }
        }
    }
}

fn report(store: &ChunkStore, file_id: &str, sink: &dyn ProgressSink) {
    if let Some(meta) = store.metadata(file_id) {
        sink.progress(&meta);
    }
}

#[allow(clippy::too_many_arguments)]
async fn send_chunk<S, F>(
    stream: &mut S,
    source: &mut F,
    file: &FileDescriptor,
    store: &ChunkStore,
    meta: &ChunkSetMetadata,
    index: u32,
    opts: &SendOptions,
    limit: &mut SpeedLimit,
) -> Result<(), TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: AsyncRead + AsyncSeek + Unpin,
{
    let chunk = store.chunk(&meta.file_id, index)?;
    let source_err = |e: std::io::Error| TransferError::Source {
        path: file.content.path().to_path_buf(),
        source: e,
    };

    source
        .seek(SeekFrom::Start(chunk.start_offset))
        .await
        .map_err(source_err)?;

    write_frame(
        stream,
        Control::Chunk {
            index,
            len: chunk.size,
        }
        .to_string()
        .as_bytes(),
        opts.idle_timeout,
    )
    .await?;

    let mut buf = vec![0u8; IO_BUF.min(chunk.size as usize).max(1)];
    let mut remaining = chunk.size;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = source.read(&mut buf[..want]).await.map_err(source_err)?;
        if n == 0 {
            return Err(TransferError::SourceTruncated {
                expected: chunk.size,
                got: chunk.size - remaining,
            });
        }
        limit.acquire(n as u64).await;
        write_all(stream, &buf[..n], opts.idle_timeout).await?;
        remaining -= n as u64;
    }

    match read_token(stream, opts.idle_timeout).await? {
        Control::ChunkCompleted { index: acked } if acked == index => Ok(()),
        Control::ChunkFailed { index: acked, reason } if acked == index => {
            Err(TransferError::ChunkRejected { index, reason })
        }
        Control::Error(reason) => Err(TransferError::Remote(reason)),
        other => Err(TransferError::Unexpected {
            expected: "chunk acknowledgment",
            got: other.to_string(),
        }),
    }
}
