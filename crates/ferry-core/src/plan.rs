//! Chunk planning: maps a file size to chunk boundaries.
//!
//! Pure and deterministic. Resume works by chunk index, so the same
//! `(file_id, size, chunk_size)` must always produce the same layout.

use std::collections::BTreeSet;

use crate::model::{Chunk, ChunkSetMetadata, ChunkStatus};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Adaptive chunk size tiers.
pub fn adaptive_chunk_size(file_size: u64) -> u32 {
    let size = if file_size < 10 * MIB {
        256 * KIB
    } else if file_size < 100 * MIB {
        MIB
    } else if file_size < GIB {
        2 * MIB
    } else {
        4 * MIB
    };
    size as u32
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,

    #[error("file of {size} bytes needs more than u32::MAX chunks of {chunk_size} bytes")]
    TooManyChunks { size: u64, chunk_size: u32 },
}

/// Plan the chunk layout for one file.
///
/// `chunk_size` of `None` picks the adaptive tier. A zero-byte file still
/// yields one zero-size chunk so that completion is observable.
pub fn plan_chunks(
    file_id: &str,
    name: &str,
    file_size: u64,
    chunk_size: Option<u32>,
) -> Result<(ChunkSetMetadata, Vec<Chunk>), PlanError> {
    let chunk_size = chunk_size.unwrap_or_else(|| adaptive_chunk_size(file_size));
    if chunk_size == 0 {
        return Err(PlanError::ZeroChunkSize);
    }

    let step = u64::from(chunk_size);
    let total = file_size.div_ceil(step).max(1);
    let total_chunks = u32::try_from(total).map_err(|_| PlanError::TooManyChunks {
        size: file_size,
        chunk_size,
    })?;

    let chunks = (0..total_chunks)
        .map(|index| {
            let start_offset = u64::from(index) * step;
            let end_offset = (start_offset + step).min(file_size);
            Chunk {
                file_id: file_id.to_string(),
                index,
                start_offset,
                end_offset,
                size: end_offset - start_offset,
                status: ChunkStatus::Pending,
                retry_count: 0,
                last_attempt_ms: None,
                error: None,
            }
        })
        .collect();

    let metadata = ChunkSetMetadata {
        file_id: file_id.to_string(),
        name: name.to_string(),
        size: file_size,
        chunk_size,
        total_chunks,
        completed: BTreeSet::new(),
        failed: BTreeSet::new(),
        transferred_bytes: 0,
    };

    Ok((metadata, chunks))
}
