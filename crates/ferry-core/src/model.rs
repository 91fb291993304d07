//! Data model shared by every ferry crate.
//!
//! Everything here is plain data. Ownership rules live with the services:
//! chunk records belong to the ChunkStore, sessions to the SessionManager.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Read;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Random 128-bit identifier, hex encoded.
pub fn new_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

// ── Files ─────────────────────────────────────────────────────────────────────

/// Opaque reference to the bytes behind a [`FileDescriptor`].
///
/// On the sending side this is the source file; on the receiving side it
/// is where the assembled file lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentRef(PathBuf);

impl ContentRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Whether the referenced content can still be opened for reading.
    pub fn is_openable(&self) -> bool {
        std::fs::File::open(&self.0).is_ok()
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// A transferable file. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub content_type: String,
    pub content: ContentRef,
    /// Hex BLAKE3 of the whole file, when the producer computed one.
    pub checksum: Option<String>,
}

impl FileDescriptor {
    /// Describe a single regular file on disk. No checksum is computed.
    pub fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let meta = std::fs::metadata(path)?;
        if !meta.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let content_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        Ok(Self {
            id: new_id(),
            name,
            size: meta.len(),
            content_type,
            content: ContentRef::new(path),
            checksum: None,
        })
    }

    /// Same descriptor with a freshly computed whole-file checksum.
    pub fn with_checksum(mut self) -> std::io::Result<Self> {
        let mut file = std::fs::File::open(self.content.path())?;
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        self.checksum = Some(hasher.finalize().to_hex().to_string());
        Ok(self)
    }
}

// ── Chunks ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

/// A contiguous byte range of one file; the unit of transfer and retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub file_id: String,
    pub index: u32,
    pub start_offset: u64,
    /// Exclusive.
    pub end_offset: u64,
    pub size: u64,
    pub status: ChunkStatus,
    pub retry_count: u32,
    pub last_attempt_ms: Option<u64>,
    pub error: Option<String>,
}

impl Chunk {
    /// Failed, and still under the retry cap.
    pub fn is_retryable(&self, max_retries: u32) -> bool {
        self.status == ChunkStatus::Failed && self.retry_count < max_retries
    }
}

/// Aggregate bookkeeping for one file's chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSetMetadata {
    pub file_id: String,
    pub name: String,
    pub size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub completed: BTreeSet<u32>,
    pub failed: BTreeSet<u32>,
    pub transferred_bytes: u64,
}

impl ChunkSetMetadata {
    pub fn is_complete(&self) -> bool {
        self.completed.len() as u64 == u64::from(self.total_chunks)
    }

    /// Same file layout, ignoring progress.
    pub fn same_layout(&self, other: &ChunkSetMetadata) -> bool {
        self.file_id == other.file_id
            && self.size == other.size
            && self.chunk_size == other.chunk_size
            && self.total_chunks == other.total_chunks
    }
}

// ── Sessions ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Connecting,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// The session state machine. `Failed → Pending` is the explicit retry
    /// edge; `InProgress → Connecting` is a scheduler re-queue.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Pending, Connecting | Cancelled | Failed) => true,
            (Connecting, InProgress | Paused | Cancelled | Failed) => true,
            (InProgress, Connecting | Paused | Completed | Failed | Cancelled) => true,
            (Paused, Connecting | Cancelled | Failed) => true,
            (Failed, Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Connecting => "connecting",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The remote side of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRef {
    pub id: String,
    pub name: String,
    pub addr: SocketAddr,
}

/// The unit of user-visible transfer work: one or more files to one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSession {
    pub id: String,
    pub direction: Direction,
    pub status: SessionStatus,
    pub files: Vec<FileDescriptor>,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub started_at_ms: u64,
    pub ended_at_ms: Option<u64>,
    pub updated_at_ms: u64,
    pub peer: PeerRef,
    pub error: Option<String>,
    /// Non-fatal problems, e.g. a whole-file checksum mismatch.
    pub warnings: Vec<String>,
    pub paused: bool,
    /// Acknowledged bytes per file id.
    #[serde(default)]
    pub file_progress: BTreeMap<String, u64>,
}

impl TransferSession {
    pub fn new(direction: Direction, peer: PeerRef, files: Vec<FileDescriptor>) -> Self {
        let now = now_ms();
        Self {
            id: new_id(),
            direction,
            status: SessionStatus::Pending,
            total_bytes: files.iter().map(|f| f.size).sum(),
            files,
            transferred_bytes: 0,
            started_at_ms: now,
            ended_at_ms: None,
            updated_at_ms: now,
            peer,
            error: None,
            warnings: Vec::new(),
            paused: false,
            file_progress: BTreeMap::new(),
        }
    }

    /// Set one file's acknowledged bytes and recompute the session total.
    pub fn set_file_progress(&mut self, file_id: &str, bytes: u64) {
        self.file_progress.insert(file_id.to_string(), bytes);
        self.transferred_bytes = self.file_progress.values().sum();
    }

    /// Transferred bytes over total bytes, in percent. An empty session
    /// reports 100 once completed and 0 before.
    pub fn progress_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.status == SessionStatus::Completed { 100.0 } else { 0.0 };
        }
        self.transferred_bytes as f64 / self.total_bytes as f64 * 100.0
    }

    pub fn file(&self, file_id: &str) -> Option<&FileDescriptor> {
        self.files.iter().find(|f| f.id == file_id)
    }
}
