//! Task scheduler: a durable work queue of outbound sessions.
//!
//! Each queued item is one session to drive to completion. The dispatch
//! loop wakes on a tick or when new work arrives, checks the execution
//! constraints, and spawns at most `max_concurrent` runs. Transient
//! failures are re-queued with linear back-off until `max_attempts` is
//! reached; anything else gives up immediately.
//!
//! The queue is persisted to `queue.json` on every change. Items stay in
//! the queue while they run, so a restart picks them up again.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ferry_core::config::SchedulerConfig;
use ferry_core::model::now_ms;
use ferry_core::record;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify, Semaphore};
use tokio::task::AbortHandle;

use crate::chunk_store::{write_atomic, StoreError};
use crate::error::TransferError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub session_id: String,
    /// Failed runs so far.
    pub attempt: u32,
    /// Not dispatched before this unix-ms timestamp.
    pub not_before_ms: u64,
}

/// Executes one session. Implemented by the outbound runner; tests supply
/// scripted ones.
pub trait TransferRunner: Send + Sync + 'static {
    fn run(&self, session_id: &str) -> BoxFuture<'static, Result<(), TransferError>>;

    /// The scheduler stopped retrying `session_id`.
    fn give_up(&self, session_id: &str, error: &TransferError);

    /// `session_id` will be tried again after back-off.
    fn requeued(&self, session_id: &str, error: &TransferError);
}

/// Gate checked before any work is dispatched. `Err` carries the reason.
pub trait ExecutionConstraints: Send + Sync {
    fn check(&self) -> Result<(), String>;
}

/// Always satisfied.
pub struct NoConstraints;

impl ExecutionConstraints for NoConstraints {
    fn check(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Network up, enough free space under the data directory, battery not
/// critical.
pub struct SystemConstraints {
    pub data_dir: PathBuf,
    pub min_free_bytes: u64,
    pub min_battery_percent: u8,
}

impl SystemConstraints {
    pub fn from_config(config: &SchedulerConfig, data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            min_free_bytes: config.min_free_bytes,
            min_battery_percent: config.min_battery_percent,
        }
    }
}

impl ExecutionConstraints for SystemConstraints {
    fn check(&self) -> Result<(), String> {
        if !network_up() {
            return Err("no network interface is up".into());
        }
        if let Some(free) = free_bytes(&self.data_dir) {
            if free < self.min_free_bytes {
                return Err(format!("only {free} bytes free under {}", self.data_dir.display()));
            }
        }
        if let Some(percent) = discharging_battery_percent() {
            if percent < self.min_battery_percent {
                return Err(format!("battery at {percent}%"));
            }
        }
        Ok(())
    }
}

/// Any non-loopback interface that is up and has an IPv4 or IPv6 address.
fn network_up() -> bool {
    use nix::net::if_::InterfaceFlags;

    let Ok(addrs) = nix::ifaddrs::getifaddrs() else {
        return true;
    };
    addrs.into_iter().any(|ifa| {
        ifa.flags.contains(InterfaceFlags::IFF_UP)
            && !ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK)
            && ifa.address.is_some_and(|a| {
                a.as_sockaddr_in().is_some() || a.as_sockaddr_in6().is_some()
            })
    })
}

fn free_bytes(dir: &Path) -> Option<u64> {
    // The directory may not exist yet on first start; its parent decides.
    let probe = dir.ancestors().find(|p| p.exists())?;
    let stat = nix::sys::statvfs::statvfs(probe).ok()?;
    #[allow(clippy::unnecessary_cast)]
    let free = stat.blocks_available() as u64 * stat.fragment_size() as u64;
    Some(free)
}

/// Lowest capacity of any battery currently discharging.
fn discharging_battery_percent() -> Option<u8> {
    let entries = std::fs::read_dir("/sys/class/power_supply").ok()?;
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let dir = e.path();
            let read = |name: &str| std::fs::read_to_string(dir.join(name)).ok();
            if read("type")?.trim() != "Battery" || read("status")?.trim() != "Discharging" {
                return None;
            }
            read("capacity")?.trim().parse::<u8>().ok()
        })
        .min()
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_attempts: u32,
    /// Back-off before attempt n+1 is `backoff_step * n`.
    pub backoff_step: Duration,
    pub max_concurrent: usize,
    /// Poll interval of the dispatch loop.
    pub tick: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

impl SchedulerSettings {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_step: Duration::from_secs(config.backoff_step_secs),
            max_concurrent: config.max_concurrent.max(1),
            tick: Duration::from_secs(1),
        }
    }
}

pub struct TaskScheduler {
    path: PathBuf,
    queue: DashMap<String, WorkItem>,
    /// Dispatched sessions. Inserted under the entry lock together with
    /// the spawn, so `cancel` always finds a handle.
    running: DashMap<String, AbortHandle>,
    runner: Arc<dyn TransferRunner>,
    constraints: Box<dyn ExecutionConstraints>,
    settings: SchedulerSettings,
    permits: Arc<Semaphore>,
    wake: Notify,
}

impl TaskScheduler {
    /// Load the persisted queue at `path`. An unreadable queue is logged
    /// and replaced by an empty one.
    pub fn open(
        path: impl Into<PathBuf>,
        runner: Arc<dyn TransferRunner>,
        constraints: Box<dyn ExecutionConstraints>,
        settings: SchedulerSettings,
    ) -> Self {
        let path = path.into();
        let queue = DashMap::new();
        match std::fs::read(&path) {
            Ok(bytes) => match record::decode::<Vec<WorkItem>>(&bytes) {
                Ok(items) => {
                    for item in items {
                        queue.insert(item.session_id.clone(), item);
                    }
                    if !queue.is_empty() {
                        tracing::info!(count = queue.len(), "restored work queue");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "discarding unreadable work queue")
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(error = %e, path = %path.display(), "failed to read work queue"),
        }

        Self {
            path,
            queue,
            running: DashMap::new(),
            runner,
            constraints,
            permits: Arc::new(Semaphore::new(settings.max_concurrent)),
            settings,
            wake: Notify::new(),
        }
    }

    /// Queue `session_id` for immediate dispatch with a fresh attempt
    /// count. A session that is already queued or running is left alone.
    pub fn enqueue(&self, session_id: &str) -> bool {
        if self.queue.contains_key(session_id) {
            return false;
        }
        self.queue.insert(
            session_id.to_string(),
            WorkItem {
                session_id: session_id.to_string(),
                attempt: 0,
                not_before_ms: now_ms(),
            },
        );
        tracing::debug!(session_id, "work enqueued");
        self.persist();
        self.wake.notify_one();
        true
    }

    /// Remove queued work and abort a running attempt. The session is not
    /// touched; callers set its status. Returns true if anything was there.
    pub fn cancel(&self, session_id: &str) -> bool {
        let queued = self.queue.remove(session_id).is_some();
        let running = match self.running.remove(session_id) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        };
        if queued {
            self.persist();
        }
        if queued || running {
            tracing::debug!(session_id, running, "work cancelled");
        }
        queued || running
    }

    /// Queued items, soonest first. Includes items that are running.
    pub fn queued(&self) -> Vec<WorkItem> {
        let mut items: Vec<WorkItem> = self.queue.iter().map(|e| e.clone()).collect();
        items.sort_by(|a, b| {
            a.not_before_ms
                .cmp(&b.not_before_ms)
                .then(a.session_id.cmp(&b.session_id))
        });
        items
    }

    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.running.contains_key(session_id)
    }

    /// Dispatch loop. Runs until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            max_concurrent = self.settings.max_concurrent,
            max_attempts = self.settings.max_attempts,
            "scheduler started"
        );
        let mut tick = tokio::time::interval(self.settings.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tick.tick() => {}
                _ = self.wake.notified() => {}
            }
            self.dispatch();
        }

        for entry in self.running.iter() {
            entry.value().abort();
        }
        tracing::info!("scheduler stopped");
    }

    /// Start every due item a permit is available for.
    fn dispatch(self: &Arc<Self>) {
        let now = now_ms();
        let due: Vec<WorkItem> = self
            .queued()
            .into_iter()
            .filter(|item| item.not_before_ms <= now && !self.running.contains_key(&item.session_id))
            .collect();
        if due.is_empty() {
            return;
        }
        if let Err(reason) = self.constraints.check() {
            tracing::debug!(reason, waiting = due.len(), "execution constraints not met");
            return;
        }

        for item in due {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            let Entry::Vacant(slot) = self.running.entry(item.session_id.clone()) else {
                continue;
            };
            let id = item.session_id;
            tracing::debug!(session_id = %id, attempt = item.attempt + 1, "dispatching");

            let this = Arc::clone(self);
            let run = self.runner.run(&id);
            let handle = tokio::spawn(async move {
                let result = run.await;
                this.finish(&id, result);
                drop(permit);
                this.wake.notify_one();
            });
            slot.insert(handle.abort_handle());
        }
    }

    fn finish(&self, session_id: &str, result: Result<(), TransferError>) {
        if self.running.remove(session_id).is_none() {
            // cancelled while finishing
            return;
        }
        match result {
            Ok(()) => {
                self.queue.remove(session_id);
                tracing::debug!(session_id, "work finished");
            }
            Err(e) => {
                let Some(mut item) = self.queue.get(session_id).map(|i| i.clone()) else {
                    return;
                };
                item.attempt += 1;
                if e.is_transient() && item.attempt < self.settings.max_attempts {
                    let delay = self.settings.backoff_step * item.attempt;
                    item.not_before_ms = now_ms() + delay.as_millis() as u64;
                    tracing::warn!(
                        error = %e,
                        session_id,
                        attempt = item.attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "attempt failed, re-queued"
                    );
                    self.queue.insert(session_id.to_string(), item);
                    self.runner.requeued(session_id, &e);
                } else {
                    self.queue.remove(session_id);
                    tracing::warn!(error = %e, session_id, attempts = item.attempt, "giving up");
                    self.runner.give_up(session_id, &e);
                }
            }
        }
        self.persist();
    }

    fn persist(&self) {
        let result = record::encode(&self.queued())
            .map_err(StoreError::from)
            .and_then(|bytes| write_atomic(&self.path, &bytes));
        if let Err(e) = result {
            tracing::warn!(error = %e, path = %self.path.display(), "failed to persist work queue");
        }
    }
}
