//! Ferry integration test harness.
//!
//! Every test runs whole endpoints in-process and talks to them over
//! loopback TCP: real chunk stores on disk, real session persistence,
//! the real scheduler and protocol. Nothing here needs root or a LAN.
//!
//!   cargo test --test integration
//!
//! Each node owns a private temp directory removed on drop.

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use ferry_core::model::{FileDescriptor, PeerRef, TransferSession};
use ferry_core::wire::{ready_tokens, Control, FileHeader, HEADER_FRAMES};
use ferry_services::transfer::frame::{read_frame, read_payload, read_token, write_token};
use ferry_services::{
    new_registry, ChunkStore, InboundHandler, NoConstraints, OutboundRunner, PeerRegistry,
    SchedulerSettings, SendOptions, SessionManager, SessionStore, TaskScheduler,
};

mod api;
mod lifecycle;
mod resume;
mod retry;
mod transfer;

// ── Harness ───────────────────────────────────────────────────────────────────

static COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn temp_root(tag: &str) -> PathBuf {
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let root = std::env::temp_dir().join(format!("ferry-it-{tag}-{}-{id}", std::process::id()));
    let _ = std::fs::remove_dir_all(&root);
    std::fs::create_dir_all(&root).unwrap();
    root
}

/// Tunables that differ between tests.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub idle_timeout: Duration,
    pub max_attempts: u32,
    pub max_chunk_retries: u32,
    pub chunk_size: Option<u32>,
    /// Start the dispatch loop. Off to let work pile up in the queue.
    pub run_scheduler: bool,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(5),
            max_attempts: 3,
            max_chunk_retries: 3,
            chunk_size: None,
            run_scheduler: true,
        }
    }
}

/// One complete endpoint: stores, sessions, scheduler and a listening
/// inbound handler.
pub struct Node {
    pub root: PathBuf,
    pub name: String,
    pub addr: SocketAddr,
    pub sessions: Arc<SessionManager>,
    pub scheduler: Arc<TaskScheduler>,
    pub registry: Arc<PeerRegistry>,
    pub opts: NodeOptions,
    shutdown: broadcast::Sender<()>,
    keep_root: bool,
}

impl Node {
    pub async fn start(name: &str) -> Self {
        Self::start_with(name, NodeOptions::default()).await
    }

    pub async fn start_with(name: &str, opts: NodeOptions) -> Self {
        let root = temp_root(name);
        Self::start_at(name, root, opts).await
    }

    /// Start a node over an existing data directory, as after a restart.
    pub async fn start_at(name: &str, root: PathBuf, opts: NodeOptions) -> Self {
        let outbound = Arc::new(ChunkStore::open(root.join("chunks/outbound")).unwrap());
        let inbound = Arc::new(ChunkStore::open(root.join("chunks/inbound")).unwrap());
        let sessions = Arc::new(SessionManager::new(
            SessionStore::open(root.join("sessions")).unwrap(),
            outbound,
            inbound.clone(),
        ));
        let registry = new_registry();

        let runner = OutboundRunner::new(
            sessions.clone(),
            SendOptions {
                idle_timeout: opts.idle_timeout,
                speed_limit: 0,
            },
            Duration::from_secs(2),
            opts.max_chunk_retries,
        );
        let scheduler = Arc::new(TaskScheduler::open(
            root.join("queue.json"),
            Arc::new(runner),
            Box::new(NoConstraints),
            SchedulerSettings {
                max_attempts: opts.max_attempts,
                backoff_step: Duration::ZERO,
                max_concurrent: 2,
                tick: Duration::from_millis(50),
            },
        ));

        let (shutdown, _) = broadcast::channel(1);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler = Arc::new(InboundHandler {
            store: inbound,
            sessions: sessions.clone(),
            peers: registry.clone(),
            download_dir: root.join("downloads"),
            idle_timeout: opts.idle_timeout,
            max_chunk_retries: opts.max_chunk_retries,
            device_id: format!("{name}-id"),
            device_name: name.to_string(),
        });
        tokio::spawn(serve(listener, handler, shutdown.subscribe()));
        if opts.run_scheduler {
            tokio::spawn(scheduler.clone().run(shutdown.subscribe()));
        }

        Self {
            root,
            name: name.to_string(),
            addr,
            sessions,
            scheduler,
            registry,
            opts,
            shutdown,
            keep_root: false,
        }
    }

    pub fn peer_ref(&self) -> PeerRef {
        PeerRef {
            id: format!("{}-id", self.name),
            name: self.name.clone(),
            addr: self.addr,
        }
    }

    /// Write `data` under this node's source directory.
    pub fn source(&self, name: &str, data: &[u8]) -> FileDescriptor {
        let dir = self.root.join("src");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        FileDescriptor::from_path(&path).unwrap().with_checksum().unwrap()
    }

    /// Create an outbound session to `to` and hand it to the scheduler.
    pub fn send(&self, to: PeerRef, files: Vec<FileDescriptor>) -> TransferSession {
        let session = self
            .sessions
            .create_outbound(to, files, self.opts.chunk_size)
            .unwrap();
        assert!(self.scheduler.enqueue(&session.id));
        session
    }

    pub fn downloads(&self) -> PathBuf {
        self.root.join("downloads")
    }

    /// Shut the node down, leaving its data directory for a restart.
    pub fn stop(mut self) -> PathBuf {
        self.keep_root = true;
        self.root.clone()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if !self.keep_root {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }
}

async fn serve(
    listener: TcpListener,
    handler: Arc<InboundHandler>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let (mut stream, remote) = tokio::select! {
            _ = shutdown.recv() => return,
            r = listener.accept() => match r {
                Ok(r) => r,
                Err(_) => continue,
            },
        };
        let handler = handler.clone();
        tokio::spawn(async move {
            let _ = handler.handle(&mut stream, remote).await;
        });
    }
}

// ── Scripted receiver ─────────────────────────────────────────────────────────

/// Decides whether to go silent instead of acknowledging `(connection, chunk)`.
pub type StallRule = Box<dyn Fn(usize, u32) -> bool + Send + Sync>;

/// A receiving peer that follows the protocol but misbehaves on cue.
/// Connections are served one at a time; acknowledged chunks are
/// remembered across connections and offered back in READY.
pub struct ScriptedReceiver {
    pub addr: SocketAddr,
    /// `(connection, chunk)` for every payload that arrived.
    pub log: Arc<Mutex<Vec<(usize, u32)>>>,
}

impl ScriptedReceiver {
    pub async fn start(held: Vec<u32>, stall: StallRule) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let task_log = log.clone();
        tokio::spawn(async move {
            let mut held = held;
            let mut conn = 0;
            while let Ok((mut stream, _)) = listener.accept().await {
                let _ = scripted_connection(&mut stream, conn, &mut held, &stall, &task_log).await;
                conn += 1;
            }
        });
        Self { addr, log }
    }

    pub fn peer_ref(&self) -> PeerRef {
        PeerRef {
            id: "scripted".into(),
            name: "scripted".into(),
            addr: self.addr,
        }
    }

    pub fn received(&self) -> Vec<(usize, u32)> {
        self.log.lock().unwrap().clone()
    }
}

async fn scripted_connection(
    stream: &mut tokio::net::TcpStream,
    conn: usize,
    held: &mut Vec<u32>,
    stall: &StallRule,
    log: &Mutex<Vec<(usize, u32)>>,
) -> Result<()> {
    let t = Duration::from_secs(10);
    let mut frames = Vec::with_capacity(HEADER_FRAMES);
    for _ in 0..HEADER_FRAMES {
        frames.push(read_frame(stream, t).await?);
    }
    let header = FileHeader::from_frames(&frames)?;
    for token in ready_tokens(held) {
        write_token(stream, &token, t).await?;
    }

    loop {
        let Control::Chunk { index, len } = read_token(stream, t).await? else {
            bail!("expected a chunk");
        };
        let mut payload = vec![0u8; len as usize];
        read_payload(stream, &mut payload, t).await?;
        log.lock().unwrap().push((conn, index));

        if stall(conn, index) {
            // Hold the connection open until the sender gives up on it.
            let _ = read_frame(stream, Duration::from_secs(30)).await;
            return Ok(());
        }
        if !held.contains(&index) {
            held.push(index);
        }
        write_token(stream, &Control::ChunkCompleted { index }, t).await?;
        if held.len() as u32 == header.total_chunks {
            write_token(stream, &Control::Completed, t).await?;
            return Ok(());
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_for<F>(what: &str, timeout: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    bail!("timed out waiting for {what}")
}

/// Run `fut` under a hard deadline so a hung protocol fails the test.
pub async fn within<T>(timeout: Duration, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, fut)
        .await
        .expect("test step timed out")
}

pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn read(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}
