//! Ferry wire format: the per-connection transfer protocol and the
//! discovery datagram.
//!
//! Transfer protocol: every field and control token travels as a frame,
//! a big-endian `u32` length followed by that many bytes. Chunk payloads
//! are the one exception: they follow a `CHUNK:<index>:<len>` token as raw
//! bytes. Changing anything here breaks interoperability with deployed
//! peers.
//!
//! Discovery datagram: [`ServiceAnnouncement`], a fixed-size zerocopy
//! struct multicast on the local link.

use std::fmt;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Constants ─────────────────────────────────────────────────────────────────

/// TCP port of the listening endpoint.
pub const DEFAULT_PORT: u16 = 4242;

/// Service token shared by every endpoint.
pub const SERVICE_TOKEN: &str = "_ferry._tcp";

/// Current protocol version, carried in announcements.
pub const PROTOCOL_VERSION: u32 = 1;

/// IPv4 multicast group for service announcements (organisation-local scope).
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 42, 99);

/// UDP port on which announcements are sent and received.
pub const ANNOUNCE_PORT: u16 = 4243;

/// Default announcement interval in seconds.
pub const ANNOUNCE_INTERVAL_SECS: u64 = 2;

/// Default discovery refresh tick in seconds.
pub const REFRESH_INTERVAL_SECS: u64 = 5;

/// Default window after which an unseen peer is evicted.
pub const PEER_TIMEOUT_SECS: u64 = 15;

/// Idle read timeout applied by both ends of a transfer connection.
pub const IDLE_TIMEOUT_SECS: u64 = 30;

/// Active-scan concurrency cap.
pub const MAX_CONCURRENT_PROBES: usize = 10;

/// Largest control frame accepted. Chunk payloads are not frames.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// BLAKE3 of the service token, carried in every announcement.
pub fn service_hash() -> [u8; 32] {
    *blake3::hash(SERVICE_TOKEN.as_bytes()).as_bytes()
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// Append one length-prefixed frame to `buf`.
pub fn put_frame(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

// ── File header ───────────────────────────────────────────────────────────────

/// Number of frames that make up a [`FileHeader`].
pub const HEADER_FRAMES: usize = 7;

/// The handshake a sender opens every connection with.
///
/// Sent as seven frames, in order: name, size (u64), content type,
/// checksum (empty if absent), total chunks (u32), chunk size (u32), file id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub name: String,
    pub size: u64,
    pub content_type: String,
    pub checksum: Option<String>,
    pub total_chunks: u32,
    pub chunk_size: u32,
    pub file_id: String,
}

impl FileHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.name.len() + self.file_id.len());
        put_frame(&mut buf, self.name.as_bytes());
        put_frame(&mut buf, &self.size.to_be_bytes());
        put_frame(&mut buf, self.content_type.as_bytes());
        put_frame(&mut buf, self.checksum.as_deref().unwrap_or("").as_bytes());
        put_frame(&mut buf, &self.total_chunks.to_be_bytes());
        put_frame(&mut buf, &self.chunk_size.to_be_bytes());
        put_frame(&mut buf, self.file_id.as_bytes());
        buf
    }

    /// Rebuild a header from its frame bodies.
    pub fn from_frames(frames: &[Vec<u8>]) -> Result<Self, WireError> {
        if frames.len() != HEADER_FRAMES {
            return Err(WireError::Malformed(format!(
                "file header needs {} frames, got {}",
                HEADER_FRAMES,
                frames.len()
            )));
        }

        let checksum = utf8(&frames[3], "checksum")?;
        let header = Self {
            name: utf8(&frames[0], "name")?,
            size: u64::from_be_bytes(fixed(&frames[1], "size")?),
            content_type: utf8(&frames[2], "content type")?,
            checksum: (!checksum.is_empty()).then_some(checksum),
            total_chunks: u32::from_be_bytes(fixed(&frames[4], "total chunks")?),
            chunk_size: u32::from_be_bytes(fixed(&frames[5], "chunk size")?),
            file_id: utf8(&frames[6], "file id")?,
        };

        if header.file_id.is_empty() {
            return Err(WireError::Malformed("empty file id".into()));
        }
        if header.total_chunks == 0 || header.chunk_size == 0 {
            return Err(WireError::Malformed("zero chunk layout".into()));
        }
        Ok(header)
    }
}

fn utf8(bytes: &[u8], field: &str) -> Result<String, WireError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| WireError::Malformed(format!("{field} is not UTF-8")))
}

fn fixed<const N: usize>(bytes: &[u8], field: &str) -> Result<[u8; N], WireError> {
    bytes.try_into().map_err(|_| {
        WireError::Malformed(format!("{field} must be {N} bytes, got {}", bytes.len()))
    })
}

// ── Control tokens ────────────────────────────────────────────────────────────

/// Runs of chunk indices, rendered as `0-4,7,9-12`.
pub type IndexRuns = Vec<RangeInclusive<u32>>;

/// Every token exchanged after the header, one per frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Receiver is ready. `held` lists chunks it already stores (resume).
    Ready { held: IndexRuns },
    /// Receiver: more held chunks, always followed by [`Control::Ready`].
    Held { held: IndexRuns },
    /// Sender: raw payload of `len` bytes follows.
    Chunk { index: u32, len: u64 },
    /// Receiver: chunk persisted and verified.
    ChunkCompleted { index: u32 },
    /// Receiver: chunk rejected.
    ChunkFailed { index: u32, reason: String },
    /// Receiver: every chunk of the file is stored.
    Completed,
    /// Receiver: fatal error, connection closes.
    Error(String),
    /// Discovery probe in place of a file header.
    Hello,
    /// Reply to [`Control::Hello`].
    Peer { id: String, name: String },
}

impl Control {
    pub fn parse(token: &str) -> Result<Self, WireError> {
        let bad = || WireError::UnknownToken(token.chars().take(64).collect());

        match token {
            "READY" => return Ok(Self::Ready { held: Vec::new() }),
            "COMPLETED" => return Ok(Self::Completed),
            "HELLO" => return Ok(Self::Hello),
            _ => {}
        }

        if let Some(list) = token.strip_prefix("READY:") {
            let held = parse_runs(list).ok_or_else(bad)?;
            return Ok(Self::Ready { held });
        }

        if let Some(list) = token.strip_prefix("HELD:") {
            let held = parse_runs(list).ok_or_else(bad)?;
            return Ok(Self::Held { held });
        }

        if let Some(reason) = token.strip_prefix("ERROR:") {
            return Ok(Self::Error(reason.to_string()));
        }

        if let Some(rest) = token.strip_prefix("PEER:") {
            let (id, name) = rest.split_once(':').ok_or_else(bad)?;
            return Ok(Self::Peer {
                id: id.to_string(),
                name: name.to_string(),
            });
        }

        if let Some(rest) = token.strip_prefix("CHUNK:") {
            let mut parts = rest.splitn(3, ':');
            let index = parts
                .next()
                .and_then(|s| s.parse::<u32>().ok())
                .ok_or_else(bad)?;
            return match (parts.next(), parts.next()) {
                (Some("COMPLETED"), None) => Ok(Self::ChunkCompleted { index }),
                (Some("FAILED"), reason) => Ok(Self::ChunkFailed {
                    index,
                    reason: reason.unwrap_or("").to_string(),
                }),
                (Some(len), None) => len
                    .parse::<u64>()
                    .map(|len| Self::Chunk { index, len })
                    .map_err(|_| bad()),
                _ => Err(bad()),
            };
        }

        Err(bad())
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready { held } if held.is_empty() => f.write_str("READY"),
            Self::Ready { held } => write!(f, "READY:{}", render_runs(held)),
            Self::Held { held } => write!(f, "HELD:{}", render_runs(held)),
            Self::Chunk { index, len } => write!(f, "CHUNK:{index}:{len}"),
            Self::ChunkCompleted { index } => write!(f, "CHUNK:{index}:COMPLETED"),
            Self::ChunkFailed { index, reason } => write!(f, "CHUNK:{index}:FAILED:{reason}"),
            Self::Completed => f.write_str("COMPLETED"),
            Self::Error(reason) => write!(f, "ERROR:{reason}"),
            Self::Hello => f.write_str("HELLO"),
            Self::Peer { id, name } => write!(f, "PEER:{id}:{name}"),
        }
    }
}

fn parse_runs(list: &str) -> Option<IndexRuns> {
    list.split(',')
        .filter(|s| !s.is_empty())
        .map(|item| match item.split_once('-') {
            Some((lo, hi)) => {
                let (lo, hi) = (lo.parse::<u32>().ok()?, hi.parse::<u32>().ok()?);
                (lo <= hi).then_some(lo..=hi)
            }
            None => item.parse::<u32>().ok().map(|i| i..=i),
        })
        .collect()
}

fn render_run(run: &RangeInclusive<u32>) -> String {
    if run.start() == run.end() {
        run.start().to_string()
    } else {
        format!("{}-{}", run.start(), run.end())
    }
}

fn render_runs(runs: &[RangeInclusive<u32>]) -> String {
    runs.iter().map(render_run).collect::<Vec<_>>().join(",")
}

/// Collapse chunk indices into ascending runs.
pub fn index_runs(indices: &[u32]) -> IndexRuns {
    let mut sorted = indices.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut runs: IndexRuns = Vec::new();
    for index in sorted {
        match runs.last_mut() {
            Some(run) if index.checked_sub(1) == Some(*run.end()) => *run = *run.start()..=index,
            _ => runs.push(index..=index),
        }
    }
    runs
}

/// The receiver's answer to a header: zero or more [`Control::Held`]
/// tokens and a final [`Control::Ready`], each within [`MAX_FRAME_LEN`].
pub fn ready_tokens(held: &[u32]) -> Vec<Control> {
    // "READY:" is the longer prefix; one run never exceeds 21 bytes.
    let budget = MAX_FRAME_LEN - "READY:".len();
    let mut groups: Vec<IndexRuns> = vec![Vec::new()];
    let mut used = 0;
    for run in index_runs(held) {
        let cost = render_run(&run).len() + 1;
        if used + cost > budget {
            groups.push(Vec::new());
            used = 0;
        }
        used += cost;
        if let Some(group) = groups.last_mut() {
            group.push(run);
        }
    }

    let last = groups.pop().unwrap_or_default();
    groups
        .into_iter()
        .map(|held| Control::Held { held })
        .chain(std::iter::once(Control::Ready { held: last }))
        .collect()
}

// ── Service announcement ──────────────────────────────────────────────────────

/// Announcement kinds.
pub mod announce {
    /// Peer is (still) available. Adds or refreshes the registry entry.
    pub const ANNOUNCE: u8 = 0x01;
    /// Peer is leaving. Removes the registry entry immediately.
    pub const GOODBYE: u8 = 0x02;
}

/// Display names longer than this are truncated on the wire.
pub const ANNOUNCE_NAME_LEN: usize = 48;

/// Multicast to announce this endpoint under the shared service token.
///
/// All fields are byte-aligned, so the layout has no padding and integer
/// fields are big-endian regardless of host.
///
/// Wire size: 104 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct ServiceAnnouncement {
    /// BLAKE3 of [`SERVICE_TOKEN`]. Datagrams with any other value are ignored.
    pub service_hash: [u8; 32],
    /// Stable device identifier of the announcing endpoint.
    pub device_id: [u8; 16],
    /// UTF-8 display name, NUL padded.
    pub name: [u8; ANNOUNCE_NAME_LEN],
    pub version: U32<BigEndian>,
    /// TCP port of the listening endpoint.
    pub port: U16<BigEndian>,
    /// See [`announce`].
    pub kind: u8,
    /// Reserved, must be zero.
    pub flags: u8,
}

assert_eq_size!(ServiceAnnouncement, [u8; 104]);

impl ServiceAnnouncement {
    pub fn new(kind: u8, device_id: [u8; 16], name: &str, port: u16) -> Self {
        let mut name_buf = [0u8; ANNOUNCE_NAME_LEN];
        // Truncate on a char boundary so the name stays valid UTF-8.
        let mut end = name.len().min(ANNOUNCE_NAME_LEN);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name_buf[..end].copy_from_slice(&name.as_bytes()[..end]);

        Self {
            service_hash: service_hash(),
            device_id,
            name: name_buf,
            version: U32::new(PROTOCOL_VERSION),
            port: U16::new(port),
            kind,
            flags: 0,
        }
    }

    /// Parse a datagram, rejecting foreign services and unknown kinds.
    pub fn parse(datagram: &[u8]) -> Result<Self, WireError> {
        let ann = Self::read_from_prefix(datagram).ok_or(WireError::Truncated {
            expected: std::mem::size_of::<Self>(),
            got: datagram.len(),
        })?;
        if ann.service_hash != service_hash() {
            return Err(WireError::ForeignService);
        }
        if ann.kind != announce::ANNOUNCE && ann.kind != announce::GOODBYE {
            return Err(WireError::UnknownKind(ann.kind));
        }
        if ann.flags != 0 {
            return Err(WireError::ReservedFlagsSet(ann.flags));
        }
        Ok(ann)
    }

    pub fn display_name(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    pub fn device_id_hex(&self) -> String {
        hex::encode(self.device_id)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unknown control token: {0:?}")]
    UnknownToken(String),

    #[error("frame length {0} exceeds maximum {}", MAX_FRAME_LEN)]
    FrameTooLarge(usize),

    #[error("datagram truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("announcement for a foreign service")]
    ForeignService,

    #[error("unknown announcement kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
