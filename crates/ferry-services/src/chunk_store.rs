//! Chunk store: durable per-file chunk records and payload bytes.
//!
//! Layout under the store root:
//!   {file_id}/meta.json       versioned ChunkSetMetadata + chunk list
//!   {file_id}/{index}.chunk   payload bytes (receiving side only)
//!
//! Records are cached in a DashMap and written through on every mutation.
//! Every write is atomic: temp file, sync, rename. A payload only counts
//! once it has been read back and matched against what was written.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ferry_core::model::{now_ms, Chunk, ChunkSetMetadata, ChunkStatus};
use ferry_core::record::{self, RecordError};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

const META_FILE: &str = "meta.json";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Everything persisted for one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ledger {
    metadata: ChunkSetMetadata,
    chunks: Vec<Chunk>,
}

impl Ledger {
    fn chunk_mut(&mut self, index: u32) -> Result<&mut Chunk, StoreError> {
        let file_id = &self.metadata.file_id;
        self.chunks
            .get_mut(index as usize)
            .ok_or_else(|| StoreError::UnknownChunk {
                file_id: file_id.clone(),
                index,
            })
    }

    fn complete(&mut self, index: u32) -> Result<(), StoreError> {
        let chunk = self.chunk_mut(index)?;
        let was_completed = chunk.status == ChunkStatus::Completed;
        let size = chunk.size;
        chunk.status = ChunkStatus::Completed;
        chunk.error = None;
        chunk.last_attempt_ms = Some(now_ms());

        if !was_completed {
            self.metadata.transferred_bytes += size;
        }
        self.metadata.completed.insert(index);
        self.metadata.failed.remove(&index);
        Ok(())
    }

    fn fail(&mut self, index: u32, reason: &str) -> Result<Chunk, StoreError> {
        let chunk = self.chunk_mut(index)?;
        let was_completed = chunk.status == ChunkStatus::Completed;
        chunk.status = ChunkStatus::Failed;
        chunk.retry_count += 1;
        chunk.error = Some(reason.to_string());
        chunk.last_attempt_ms = Some(now_ms());
        let snapshot = chunk.clone();

        if was_completed {
            self.metadata.transferred_bytes -= snapshot.size;
            self.metadata.completed.remove(&index);
        }
        self.metadata.failed.insert(index);
        Ok(snapshot)
    }

    fn is_consistent(&self) -> bool {
        self.chunks.len() as u64 == u64::from(self.metadata.total_chunks)
            && self
                .chunks
                .iter()
                .enumerate()
                .all(|(i, c)| c.index as usize == i && c.file_id == self.metadata.file_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid file id {0:?}")]
    InvalidFileId(String),

    #[error("no chunk record for file {0}")]
    UnknownFile(String),

    #[error("file {file_id} has no chunk {index}")]
    UnknownChunk { file_id: String, index: u32 },

    #[error("chunk layout for {0} differs from the persisted record")]
    LayoutMismatch(String),

    #[error("chunk {index} of {file_id} is {got} bytes, expected {expected}")]
    SizeMismatch {
        file_id: String,
        index: u32,
        expected: u64,
        got: u64,
    },

    #[error("chunk {index} of {file_id} failed read-back verification")]
    VerifyFailed { file_id: String, index: u32 },

    #[error("chunk {index} of {file_id} failed and has not been reset")]
    NotReset { file_id: String, index: u32 },

    #[error("chunk {index} of {file_id} is not completed")]
    NotCompleted { file_id: String, index: u32 },

    #[error("file {file_id} has {completed}/{total} chunks")]
    Incomplete {
        file_id: String,
        completed: usize,
        total: u32,
    },

    #[error("chunk record for {0} is inconsistent")]
    Corrupt(String),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Record(#[from] RecordError),
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Summary for status output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub files: usize,
    pub chunks_total: u64,
    pub chunks_completed: u64,
    pub chunks_failed: u64,
    pub payload_bytes: u64,
}

/// Durable chunk records and payloads for one transfer direction.
pub struct ChunkStore {
    root: PathBuf,
    records: DashMap<String, Ledger>,
}

impl ChunkStore {
    /// Open a store rooted at `root`, loading any persisted records.
    ///
    /// Unreadable records are skipped with a warning so one bad file
    /// cannot keep the daemon from starting.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        let store = Self {
            root,
            records: DashMap::new(),
        };
        store.load_all();
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn load_all(&self) {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return;
        };
        let mut loaded = 0usize;
        for entry in entries.flatten() {
            let path = entry.path().join(META_FILE);
            if !path.is_file() {
                continue;
            }
            match read_ledger(&path) {
                Ok(ledger) => {
                    self.records.insert(ledger.metadata.file_id.clone(), ledger);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "skipping unreadable chunk record");
                }
            }
        }
        if loaded > 0 {
            tracing::info!(count = loaded, root = %self.root.display(), "loaded persisted chunk records");
        }
    }

    // ── Registration ──────────────────────────────────────────────────────────

    /// Register a planned layout, or return the persisted record when the
    /// same layout already exists (resume).
    pub fn open_file(
        &self,
        metadata: ChunkSetMetadata,
        chunks: Vec<Chunk>,
    ) -> Result<ChunkSetMetadata, StoreError> {
        validate_file_id(&metadata.file_id)?;
        let ledger = Ledger { metadata, chunks };
        if !ledger.is_consistent() {
            return Err(StoreError::Corrupt(ledger.metadata.file_id));
        }

        match self.records.entry(ledger.metadata.file_id.clone()) {
            Entry::Occupied(existing) => {
                if existing.get().metadata.same_layout(&ledger.metadata) {
                    Ok(existing.get().metadata.clone())
                } else {
                    Err(StoreError::LayoutMismatch(ledger.metadata.file_id))
                }
            }
            Entry::Vacant(slot) => {
                self.persist(&ledger)?;
                let metadata = ledger.metadata.clone();
                slot.insert(ledger);
                tracing::debug!(file_id = %metadata.file_id, chunks = metadata.total_chunks, "chunk record created");
                Ok(metadata)
            }
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn contains(&self, file_id: &str) -> bool {
        self.records.contains_key(file_id)
    }

    pub fn metadata(&self, file_id: &str) -> Option<ChunkSetMetadata> {
        self.records.get(file_id).map(|l| l.metadata.clone())
    }

    pub fn chunks(&self, file_id: &str) -> Option<Vec<Chunk>> {
        self.records.get(file_id).map(|l| l.chunks.clone())
    }

    pub fn chunk(&self, file_id: &str, index: u32) -> Result<Chunk, StoreError> {
        let ledger = self
            .records
            .get(file_id)
            .ok_or_else(|| StoreError::UnknownFile(file_id.to_string()))?;
        ledger
            .chunks
            .get(index as usize)
            .cloned()
            .ok_or_else(|| StoreError::UnknownChunk {
                file_id: file_id.to_string(),
                index,
            })
    }

    fn select(&self, file_id: &str, keep: impl Fn(&Chunk) -> bool) -> Vec<Chunk> {
        self.records
            .get(file_id)
            .map(|l| l.chunks.iter().filter(|c| keep(c)).cloned().collect())
            .unwrap_or_default()
    }

    /// Chunks waiting to be sent or received, in index order.
    pub fn pending(&self, file_id: &str) -> Vec<Chunk> {
        self.select(file_id, |c| c.status == ChunkStatus::Pending)
    }

    /// Indices of completed chunks, ascending.
    pub fn completed(&self, file_id: &str) -> Vec<u32> {
        self.records
            .get(file_id)
            .map(|l| l.metadata.completed.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Failed chunks still under `max_retries`.
    pub fn retryable(&self, file_id: &str, max_retries: u32) -> Vec<Chunk> {
        self.select(file_id, |c| c.is_retryable(max_retries))
    }

    /// Failed chunks that have used up `max_retries`.
    pub fn exhausted(&self, file_id: &str, max_retries: u32) -> Vec<Chunk> {
        self.select(file_id, |c| {
            c.status == ChunkStatus::Failed && c.retry_count >= max_retries
        })
    }

    pub fn file_ids(&self) -> Vec<String> {
        self.records.iter().map(|e| e.key().clone()).collect()
    }

    // ── Transitions ───────────────────────────────────────────────────────────

    fn update<R>(
        &self,
        file_id: &str,
        f: impl FnOnce(&mut Ledger) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut ledger = self
            .records
            .get_mut(file_id)
            .ok_or_else(|| StoreError::UnknownFile(file_id.to_string()))?;
        let out = f(ledger.value_mut())?;
        self.persist(ledger.value())?;
        Ok(out)
    }

    /// `pending → in-progress`. Completed chunks are left alone; failed
    /// chunks must go through [`ChunkStore::reset_failed`] first.
    pub fn mark_in_progress(&self, file_id: &str, index: u32) -> Result<(), StoreError> {
        self.update(file_id, |l| {
            let chunk = l.chunk_mut(index)?;
            match chunk.status {
                ChunkStatus::Completed => {}
                ChunkStatus::Failed => {
                    return Err(StoreError::NotReset {
                        file_id: chunk.file_id.clone(),
                        index,
                    })
                }
                _ => {
                    chunk.status = ChunkStatus::InProgress;
                    chunk.last_attempt_ms = Some(now_ms());
                }
            }
            Ok(())
        })
    }

    /// Record a chunk as delivered without storing its payload (sender side).
    pub fn mark_completed(&self, file_id: &str, index: u32) -> Result<(), StoreError> {
        self.update(file_id, |l| l.complete(index))
    }

    /// [`ChunkStore::mark_completed`] for a batch, written through once.
    /// Indices past the end of the layout are ignored. Returns the indices
    /// that were not already completed.
    pub fn mark_completed_many(
        &self,
        file_id: &str,
        indices: impl IntoIterator<Item = u32>,
    ) -> Result<Vec<u32>, StoreError> {
        self.update(file_id, |l| {
            let mut newly = Vec::new();
            for index in indices {
                if index >= l.metadata.total_chunks {
                    continue;
                }
                if !l.metadata.completed.contains(&index) {
                    newly.push(index);
                }
                l.complete(index)?;
            }
            Ok(newly)
        })
    }

    /// Mark a chunk failed. Increments its retry count.
    pub fn mark_failed(&self, file_id: &str, index: u32, reason: &str) -> Result<Chunk, StoreError> {
        let chunk = self.update(file_id, |l| l.fail(index, reason))?;
        tracing::debug!(file_id, chunk = index, retries = chunk.retry_count, reason, "chunk failed");
        Ok(chunk)
    }

    /// Persist a payload, verify it by reading it back, then mark the chunk
    /// completed. Any failure marks the chunk failed and is returned.
    pub fn save_chunk(&self, file_id: &str, index: u32, data: &[u8]) -> Result<(), StoreError> {
        let expected = self.chunk(file_id, index)?.size;

        let result = if data.len() as u64 != expected {
            Err(StoreError::SizeMismatch {
                file_id: file_id.to_string(),
                index,
                expected,
                got: data.len() as u64,
            })
        } else {
            let path = self.payload_path(file_id, index);
            write_atomic(&path, data).and_then(|()| verify(&path, data, file_id, index))
        };

        match result {
            Ok(()) => self.update(file_id, |l| l.complete(index)),
            Err(e) => {
                if let Err(mark) = self.mark_failed(file_id, index, &e.to_string()) {
                    tracing::warn!(error = %mark, file_id, chunk = index, "failed to record chunk failure");
                }
                Err(e)
            }
        }
    }

    /// `failed → pending`. With a `limit`, only chunks whose retry count is
    /// still below it are reset. Retry counts are kept.
    pub fn reset_failed(&self, file_id: &str, limit: Option<u32>) -> Result<usize, StoreError> {
        self.update(file_id, |l| {
            let mut reset = Vec::new();
            for chunk in l.chunks.iter_mut() {
                let eligible = chunk.status == ChunkStatus::Failed
                    && limit.map_or(true, |max| chunk.retry_count < max);
                if eligible {
                    chunk.status = ChunkStatus::Pending;
                    reset.push(chunk.index);
                }
            }
            for index in &reset {
                l.metadata.failed.remove(index);
            }
            Ok(reset.len())
        })
    }

    /// Return chunks left in-progress by an interrupted run to pending.
    pub fn recover_interrupted(&self, file_id: &str) -> Result<usize, StoreError> {
        self.update(file_id, |l| {
            let mut n = 0;
            for chunk in l.chunks.iter_mut() {
                if chunk.status == ChunkStatus::InProgress {
                    chunk.status = ChunkStatus::Pending;
                    n += 1;
                }
            }
            Ok(n)
        })
    }

    // ── Payloads ──────────────────────────────────────────────────────────────

    fn file_dir(&self, file_id: &str) -> PathBuf {
        self.root.join(file_id)
    }

    fn payload_path(&self, file_id: &str, index: u32) -> PathBuf {
        self.file_dir(file_id).join(format!("{index}.chunk"))
    }

    /// Stored payload of a completed chunk.
    pub fn read_chunk(&self, file_id: &str, index: u32) -> Result<Bytes, StoreError> {
        if self.chunk(file_id, index)?.status != ChunkStatus::Completed {
            return Err(StoreError::NotCompleted {
                file_id: file_id.to_string(),
                index,
            });
        }
        read_payload(&self.payload_path(file_id, index))
    }

    /// Hex BLAKE3 over completed payloads in index order.
    pub fn checksum(&self, file_id: &str) -> Result<String, StoreError> {
        let mut hasher = blake3::Hasher::new();
        for index in self.completed(file_id) {
            hasher.update(&self.read_chunk(file_id, index)?);
        }
        Ok(hasher.finalize().to_hex().to_string())
    }

    /// Concatenate every payload in index order into `dest`. Returns the
    /// number of bytes written.
    pub fn assemble(&self, file_id: &str, dest: &Path) -> Result<u64, StoreError> {
        let metadata = self
            .metadata(file_id)
            .ok_or_else(|| StoreError::UnknownFile(file_id.to_string()))?;
        if !metadata.is_complete() {
            return Err(StoreError::Incomplete {
                file_id: file_id.to_string(),
                completed: metadata.completed.len(),
                total: metadata.total_chunks,
            });
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let tmp = tmp_path(dest);
        let mut written = 0u64;
        {
            let mut out = fs::File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
            for index in 0..metadata.total_chunks {
                let payload = self.read_chunk(file_id, index)?;
                out.write_all(&payload).map_err(|e| StoreError::io(&tmp, e))?;
                written += payload.len() as u64;
            }
            out.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
        }
        fs::rename(&tmp, dest).map_err(|e| StoreError::io(dest, e))?;

        tracing::debug!(file_id, dest = %dest.display(), bytes = written, "file assembled");
        Ok(written)
    }

    // ── Housekeeping ──────────────────────────────────────────────────────────

    /// Remove every trace of `file_id`. Returns false when nothing was there.
    pub fn cleanup(&self, file_id: &str) -> bool {
        if validate_file_id(file_id).is_err() {
            return false;
        }
        let mut removed = self.records.remove(file_id).is_some();
        let dir = self.file_dir(file_id);
        if dir.exists() {
            match fs::remove_dir_all(&dir) {
                Ok(()) => removed = true,
                Err(e) => {
                    tracing::warn!(error = %e, path = %dir.display(), "failed to remove chunk directory")
                }
            }
        }
        if removed {
            tracing::debug!(file_id, "chunk storage released");
        }
        removed
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        for entry in self.records.iter() {
            let ledger = entry.value();
            stats.files += 1;
            stats.chunks_total += u64::from(ledger.metadata.total_chunks);
            stats.chunks_completed += ledger.metadata.completed.len() as u64;
            stats.chunks_failed += ledger.metadata.failed.len() as u64;

            if let Ok(payloads) = fs::read_dir(self.file_dir(entry.key())) {
                stats.payload_bytes += payloads
                    .flatten()
                    .filter(|p| p.path().extension().is_some_and(|ext| ext == "chunk"))
                    .filter_map(|p| p.metadata().ok())
                    .map(|m| m.len())
                    .sum::<u64>();
            }
        }
        stats
    }

    fn persist(&self, ledger: &Ledger) -> Result<(), StoreError> {
        let dir = self.file_dir(&ledger.metadata.file_id);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        write_atomic(&dir.join(META_FILE), &record::encode(ledger)?)
    }
}

// ── File helpers ──────────────────────────────────────────────────────────────

/// File ids become directory names, so only a safe alphabet is accepted.
pub(crate) fn validate_file_id(file_id: &str) -> Result<(), StoreError> {
    let ok = !file_id.is_empty()
        && file_id.len() <= 128
        && file_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidFileId(file_id.to_string()))
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}-{}.tmp", std::process::id(), n));
    path.with_file_name(name)
}

pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    let tmp = tmp_path(path);
    {
        let mut file = fs::File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(data).map_err(|e| StoreError::io(&tmp, e))?;
        file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))
}

fn read_payload(path: &Path) -> Result<Bytes, StoreError> {
    let file = fs::File::open(path).map_err(|e| StoreError::io(path, e))?;
    let len = file.metadata().map_err(|e| StoreError::io(path, e))?.len();
    if len == 0 {
        return Ok(Bytes::new());
    }
    // Safety: payload files are only ever replaced by rename, never written
    // in place, so the mapping cannot change underneath us.
    let mmap = unsafe { Mmap::map(&file).map_err(|e| StoreError::io(path, e))? };
    Ok(Bytes::copy_from_slice(&mmap))
}

fn verify(path: &Path, expected: &[u8], file_id: &str, index: u32) -> Result<(), StoreError> {
    let stored = read_payload(path)?;
    if blake3::hash(&stored) == blake3::hash(expected) {
        Ok(())
    } else {
        Err(StoreError::VerifyFailed {
            file_id: file_id.to_string(),
            index,
        })
    }
}

fn read_ledger(path: &Path) -> Result<Ledger, StoreError> {
    let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    let ledger: Ledger = record::decode(&bytes)?;
    if !ledger.is_consistent() {
        return Err(StoreError::Corrupt(ledger.metadata.file_id));
    }
    Ok(ledger)
}
