//! Session manager: owns every `TransferSession`.
//!
//! All status changes go through [`SessionManager::transition`], which
//! checks the state machine, stamps times, persists the record and
//! publishes a fresh snapshot on the watch channel. Chunk storage is
//! released when a session finishes or is cleaned up.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use ferry_core::model::{
    now_ms, ContentRef, Direction, FileDescriptor, PeerRef, SessionStatus, TransferSession,
};
use ferry_core::plan::plan_chunks;
use tokio::sync::watch;

use crate::chunk_store::{ChunkStore, StoreError};
use crate::session_store::SessionStore;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no session {0}")]
    NotFound(String),

    #[error("session {id}: cannot go from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("a session needs at least one file")]
    NoFiles,

    #[error(transparent)]
    Plan(#[from] ferry_core::PlanError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct SessionManager {
    sessions: DashMap<String, TransferSession>,
    store: SessionStore,
    outbound: Arc<ChunkStore>,
    inbound: Arc<ChunkStore>,
    tx: watch::Sender<Vec<TransferSession>>,
}

impl SessionManager {
    /// Load persisted sessions and start publishing snapshots.
    pub fn new(store: SessionStore, outbound: Arc<ChunkStore>, inbound: Arc<ChunkStore>) -> Self {
        let sessions = DashMap::new();
        for session in store.load_all() {
            sessions.insert(session.id.clone(), session);
        }
        if !sessions.is_empty() {
            tracing::info!(count = sessions.len(), "loaded persisted sessions");
        }

        let (tx, _) = watch::channel(Vec::new());
        let manager = Self {
            sessions,
            store,
            outbound,
            inbound,
            tx,
        };
        manager.publish();
        manager
    }

    pub fn outbound_store(&self) -> &Arc<ChunkStore> {
        &self.outbound
    }

    pub fn inbound_store(&self) -> &Arc<ChunkStore> {
        &self.inbound
    }

    fn chunks_for(&self, direction: Direction) -> &ChunkStore {
        match direction {
            Direction::Outbound => &self.outbound,
            Direction::Inbound => &self.inbound,
        }
    }

    // ── Observation ───────────────────────────────────────────────────────────

    /// Latest snapshot of every session, oldest first.
    pub fn subscribe(&self) -> watch::Receiver<Vec<TransferSession>> {
        self.tx.subscribe()
    }

    fn publish(&self) {
        self.tx.send_replace(self.list());
    }

    pub fn get(&self, id: &str) -> Option<TransferSession> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn list(&self) -> Vec<TransferSession> {
        let mut all: Vec<TransferSession> = self.sessions.iter().map(|s| s.clone()).collect();
        all.sort_by(|a, b| a.started_at_ms.cmp(&b.started_at_ms).then(a.id.cmp(&b.id)));
        all
    }

    pub fn list_active(&self) -> Vec<TransferSession> {
        self.list().into_iter().filter(|s| !s.status.is_terminal()).collect()
    }

    pub fn list_completed(&self) -> Vec<TransferSession> {
        self.list().into_iter().filter(|s| s.status.is_terminal()).collect()
    }

    /// The unfinished inbound session for `file_id`, if any. Cancelled
    /// sessions are included so a reconnecting sender can be refused.
    pub fn find_inbound(&self, file_id: &str) -> Option<TransferSession> {
        self.sessions
            .iter()
            .find(|s| {
                s.direction == Direction::Inbound
                    && s.status != SessionStatus::Completed
                    && s.file(file_id).is_some()
            })
            .map(|s| s.clone())
    }

    // ── Creation ──────────────────────────────────────────────────────────────

    /// Create an outbound session and plan the chunk layout of every file.
    pub fn create_outbound(
        &self,
        peer: PeerRef,
        files: Vec<FileDescriptor>,
        chunk_size: Option<u32>,
    ) -> Result<TransferSession, SessionError> {
        if files.is_empty() {
            return Err(SessionError::NoFiles);
        }
        for file in &files {
            let (meta, chunks) = plan_chunks(&file.id, &file.name, file.size, chunk_size)?;
            self.outbound.open_file(meta, chunks)?;
        }
        self.insert(TransferSession::new(Direction::Outbound, peer, files))
    }

    /// Create the receiving side of one incoming file.
    pub fn create_inbound(
        &self,
        peer: PeerRef,
        file: FileDescriptor,
    ) -> Result<TransferSession, SessionError> {
        self.insert(TransferSession::new(Direction::Inbound, peer, vec![file]))
    }

    fn insert(&self, session: TransferSession) -> Result<TransferSession, SessionError> {
        self.store.save(&session)?;
        self.sessions.insert(session.id.clone(), session.clone());
        tracing::info!(
            session_id = %session.id,
            direction = ?session.direction,
            peer = %session.peer.name,
            files = session.files.len(),
            bytes = session.total_bytes,
            "session created"
        );
        self.publish();
        Ok(session)
    }

    // ── Transitions ───────────────────────────────────────────────────────────

    /// Apply `edit` to a session under its entry lock, persist and publish.
    fn update(
        &self,
        id: &str,
        edit: impl FnOnce(&mut TransferSession) -> Result<(), SessionError>,
    ) -> Result<TransferSession, SessionError> {
        let snapshot = {
            let mut session = self
                .sessions
                .get_mut(id)
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            edit(&mut *session)?;
            session.updated_at_ms = now_ms();
            self.store.save(&session)?;
            session.clone()
        };
        self.publish();
        Ok(snapshot)
    }

    fn transition(
        &self,
        id: &str,
        to: SessionStatus,
        edit: impl FnOnce(&mut TransferSession),
    ) -> Result<TransferSession, SessionError> {
        let session = self.update(id, |s| {
            if !s.status.can_transition_to(to) {
                return Err(SessionError::InvalidTransition {
                    id: s.id.clone(),
                    from: s.status,
                    to,
                });
            }
            s.status = to;
            s.paused = to == SessionStatus::Paused;
            if to.is_terminal() {
                s.ended_at_ms = Some(now_ms());
            }
            edit(s);
            Ok(())
        })?;
        tracing::debug!(session_id = id, status = %to, "session transition");
        Ok(session)
    }

    /// `Pending | Paused → Connecting`. Already connecting is a no-op.
    pub fn start(&self, id: &str) -> Result<TransferSession, SessionError> {
        if self.status(id)? == SessionStatus::Connecting {
            return self.get(id).ok_or_else(|| SessionError::NotFound(id.to_string()));
        }
        self.transition(id, SessionStatus::Connecting, |_| {})
    }

    /// Handshake done. Further files of an in-progress session are a no-op.
    pub fn mark_in_progress(&self, id: &str) -> Result<TransferSession, SessionError> {
        if self.status(id)? == SessionStatus::InProgress {
            return self.get(id).ok_or_else(|| SessionError::NotFound(id.to_string()));
        }
        self.transition(id, SessionStatus::InProgress, |_| {})
    }

    /// Back to `Connecting` after a transient failure, waiting for the next
    /// attempt (outbound) or for the sender to reconnect (inbound).
    pub fn requeue(&self, id: &str, reason: &str) -> Result<TransferSession, SessionError> {
        match self.status(id)? {
            SessionStatus::Connecting => self.update(id, |s| {
                s.error = Some(reason.to_string());
                Ok(())
            }),
            _ => self.transition(id, SessionStatus::Connecting, |s| {
                s.error = Some(reason.to_string());
            }),
        }
    }

    pub fn record_progress(
        &self,
        id: &str,
        file_id: &str,
        file_bytes: u64,
    ) -> Result<TransferSession, SessionError> {
        self.update(id, |s| {
            s.set_file_progress(file_id, file_bytes);
            Ok(())
        })
    }

    pub fn add_warning(&self, id: &str, warning: &str) -> Result<TransferSession, SessionError> {
        tracing::warn!(session_id = id, warning, "session warning");
        self.update(id, |s| {
            s.warnings.push(warning.to_string());
            Ok(())
        })
    }

    /// Point a file at where its bytes now live (receiver, after assembly).
    pub fn set_content(
        &self,
        id: &str,
        file_id: &str,
        content: ContentRef,
    ) -> Result<TransferSession, SessionError> {
        self.update(id, |s| {
            if let Some(file) = s.files.iter_mut().find(|f| f.id == file_id) {
                file.content = content;
            }
            Ok(())
        })
    }

    pub fn pause(&self, id: &str) -> Result<TransferSession, SessionError> {
        let session = self.transition(id, SessionStatus::Paused, |_| {})?;
        tracing::info!(session_id = id, "session paused");
        Ok(session)
    }

    /// `Paused → Connecting`. The caller re-enqueues the work.
    pub fn resume(&self, id: &str) -> Result<TransferSession, SessionError> {
        let session = self.transition(id, SessionStatus::Connecting, |s| s.error = None)?;
        tracing::info!(session_id = id, "session resumed");
        Ok(session)
    }

    pub fn cancel(&self, id: &str) -> Result<TransferSession, SessionError> {
        let session = self.transition(id, SessionStatus::Cancelled, |_| {})?;
        self.release_chunks(&session);
        tracing::info!(session_id = id, "session cancelled");
        Ok(session)
    }

    pub fn complete(&self, id: &str) -> Result<TransferSession, SessionError> {
        let session = self.transition(id, SessionStatus::Completed, |s| {
            s.error = None;
            s.transferred_bytes = s.total_bytes;
        })?;
        self.release_chunks(&session);
        tracing::info!(
            session_id = id,
            bytes = session.total_bytes,
            warnings = session.warnings.len(),
            "session completed"
        );
        Ok(session)
    }

    /// Terminal failure. Chunk storage is kept so an explicit retry can
    /// pick up where this attempt stopped.
    pub fn fail(&self, id: &str, reason: &str) -> Result<TransferSession, SessionError> {
        let session = self.transition(id, SessionStatus::Failed, |s| {
            s.error = Some(reason.to_string());
        })?;
        tracing::warn!(session_id = id, reason, "session failed");
        Ok(session)
    }

    /// `Failed → Pending`: clear the error and reset every failed chunk,
    /// including those that used up their retries. The caller re-enqueues.
    pub fn retry(&self, id: &str) -> Result<TransferSession, SessionError> {
        let before = self.get(id).ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if before.status != SessionStatus::Failed {
            return Err(SessionError::InvalidTransition {
                id: id.to_string(),
                from: before.status,
                to: SessionStatus::Pending,
            });
        }

        let chunks = self.chunks_for(before.direction);
        for file in &before.files {
            if chunks.contains(&file.id) {
                let reset = chunks.reset_failed(&file.id, None)?;
                tracing::debug!(session_id = id, file_id = %file.id, reset, "failed chunks reset");
            }
        }

        let session = self.transition(id, SessionStatus::Pending, |s| {
            s.error = None;
            s.ended_at_ms = None;
        })?;
        tracing::info!(session_id = id, "session retried");
        Ok(session)
    }

    fn status(&self, id: &str) -> Result<SessionStatus, SessionError> {
        self.sessions
            .get(id)
            .map(|s| s.status)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    fn release_chunks(&self, session: &TransferSession) {
        let chunks = self.chunks_for(session.direction);
        for file in &session.files {
            chunks.cleanup(&file.id);
        }
    }

    // ── Startup & housekeeping ────────────────────────────────────────────────

    /// Decide, for every session a previous process left mid-transfer,
    /// whether it can resume. Returns the outbound sessions to re-enqueue.
    ///
    /// A session resumes only if chunk records exist for at least one of
    /// its files, at least one chunk is completed, and (outbound) every
    /// source file can still be opened. Everything else is failed with
    /// the reason.
    pub fn resume_interrupted(&self) -> Vec<String> {
        let interrupted: Vec<TransferSession> = self
            .list()
            .into_iter()
            .filter(|s| matches!(s.status, SessionStatus::InProgress | SessionStatus::Connecting))
            .collect();

        let mut requeue = Vec::new();
        for session in interrupted {
            let id = session.id.as_str();
            match self.check_resumable(&session) {
                Ok(()) => {
                    let chunks = self.chunks_for(session.direction);
                    for file in &session.files {
                        if let Err(e) = chunks
                            .recover_interrupted(&file.id)
                            .or_else(|e| match e {
                                StoreError::UnknownFile(_) => Ok(0),
                                other => Err(other),
                            })
                        {
                            tracing::warn!(error = %e, session_id = id, file_id = %file.id, "chunk recovery failed");
                        }
                    }
                    if let Err(e) = self.requeue(id, "interrupted by restart") {
                        tracing::warn!(error = %e, session_id = id, "failed to requeue session");
                        continue;
                    }
                    tracing::info!(session_id = id, direction = ?session.direction, "session resumable");
                    if session.direction == Direction::Outbound {
                        requeue.push(session.id.clone());
                    }
                }
                Err(reason) => {
                    if let Err(e) = self.fail(id, &reason) {
                        tracing::warn!(error = %e, session_id = id, "failed to fail session");
                    }
                }
            }
        }
        requeue
    }

    fn check_resumable(&self, session: &TransferSession) -> Result<(), String> {
        let chunks = self.chunks_for(session.direction);

        let tracked: Vec<_> = session
            .files
            .iter()
            .filter_map(|f| chunks.metadata(&f.id))
            .collect();
        if tracked.is_empty() {
            return Err("no chunk records survived restart".into());
        }
        if tracked.iter().all(|m| m.completed.is_empty()) {
            return Err("no completed chunks to resume from".into());
        }
        if session.direction == Direction::Outbound {
            if let Some(gone) = session.files.iter().find(|f| !f.content.is_openable()) {
                return Err(format!("source {} is no longer readable", gone.content));
            }
        }
        Ok(())
    }

    /// Remove finished sessions older than `max_age` and any chunk storage
    /// they still hold. Returns how many were removed.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let cutoff = now_ms().saturating_sub(max_age.as_millis() as u64);
        let expired: Vec<TransferSession> = self
            .sessions
            .iter()
            .filter(|s| s.status.is_terminal() && s.ended_at_ms.unwrap_or(s.updated_at_ms) <= cutoff)
            .map(|s| s.clone())
            .collect();

        for session in &expired {
            self.release_chunks(session);
            self.store.remove(&session.id);
            self.sessions.remove(&session.id);
            tracing::debug!(session_id = %session.id, status = %session.status, "session cleaned up");
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "stale sessions removed");
            self.publish();
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    struct Fixture {
        root: PathBuf,
        manager: SessionManager,
    }

    impl Fixture {
        fn new() -> Self {
            let id = COUNTER.fetch_add(1, Ordering::Relaxed);
            let root = std::env::temp_dir()
                .join(format!("ferry-session-test-{}-{}", std::process::id(), id));
            let _ = std::fs::remove_dir_all(&root);
            let manager = Self::open(&root);
            Self { root, manager }
        }

        fn open(root: &std::path::Path) -> SessionManager {
            SessionManager::new(
                SessionStore::open(root.join("sessions")).unwrap(),
                Arc::new(ChunkStore::open(root.join("chunks/outbound")).unwrap()),
                Arc::new(ChunkStore::open(root.join("chunks/inbound")).unwrap()),
            )
        }

        fn reopen(&mut self) {
            self.manager = Self::open(&self.root);
        }

        fn source(&self, name: &str, len: usize) -> FileDescriptor {
            let path = self.root.join(name);
            std::fs::create_dir_all(&self.root).unwrap();
            std::fs::write(&path, vec![9u8; len]).unwrap();
            FileDescriptor::from_path(&path).unwrap()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    fn peer() -> PeerRef {
        PeerRef {
            id: "peer".into(),
            name: "Peer".into(),
            addr: "127.0.0.1:4242".parse().unwrap(),
        }
    }

    #[test]
    fn lifecycle_happy_path() {
        let fx = Fixture::new();
        let file = fx.source("a.bin", 100);
        let s = fx.manager.create_outbound(peer(), vec![file.clone()], Some(40)).unwrap();
        assert_eq!(fx.manager.outbound_store().metadata(&file.id).unwrap().total_chunks, 3);

        fx.manager.start(&s.id).unwrap();
        fx.manager.mark_in_progress(&s.id).unwrap();
        let mid = fx.manager.record_progress(&s.id, &file.id, 40).unwrap();
        assert_eq!(mid.progress_percent(), 40.0);

        let done = fx.manager.complete(&s.id).unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert!(done.ended_at_ms.is_some());
        assert_eq!(done.progress_percent(), 100.0);
        // outbound chunk records released
        assert!(fx.manager.outbound_store().metadata(&file.id).is_none());
        assert_eq!(fx.manager.list_completed().len(), 1);
    }

    #[test]
    fn empty_session_is_rejected() {
        let fx = Fixture::new();
        assert!(matches!(
            fx.manager.create_outbound(peer(), vec![], None),
            Err(SessionError::NoFiles)
        ));
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let fx = Fixture::new();
        let s = fx.manager.create_outbound(peer(), vec![fx.source("a", 1)], None).unwrap();

        assert!(matches!(
            fx.manager.complete(&s.id),
            Err(SessionError::InvalidTransition { from: SessionStatus::Pending, .. })
        ));
        fx.manager.cancel(&s.id).unwrap();
        assert!(fx.manager.start(&s.id).is_err());
        assert!(fx.manager.retry(&s.id).is_err());
    }

    #[test]
    fn pause_then_resume_goes_through_connecting() {
        let fx = Fixture::new();
        let s = fx.manager.create_outbound(peer(), vec![fx.source("a", 1)], None).unwrap();
        fx.manager.start(&s.id).unwrap();
        fx.manager.mark_in_progress(&s.id).unwrap();

        let paused = fx.manager.pause(&s.id).unwrap();
        assert!(paused.paused);
        assert!(fx.manager.mark_in_progress(&s.id).is_err());

        let resumed = fx.manager.resume(&s.id).unwrap();
        assert_eq!(resumed.status, SessionStatus::Connecting);
        assert!(!resumed.paused);
    }

    #[test]
    fn retry_resets_exhausted_chunks() {
        let fx = Fixture::new();
        let file = fx.source("a.bin", 30);
        let s = fx.manager.create_outbound(peer(), vec![file.clone()], Some(10)).unwrap();
        let store = fx.manager.outbound_store();
        for _ in 0..3 {
            store.mark_failed(&file.id, 1, "timeout").unwrap();
        }
        fx.manager.start(&s.id).unwrap();
        fx.manager.fail(&s.id, "chunk 1 exhausted").unwrap();

        let retried = fx.manager.retry(&s.id).unwrap();
        assert_eq!(retried.status, SessionStatus::Pending);
        assert_eq!(retried.error, None);
        assert_eq!(retried.ended_at_ms, None);
        let chunk = store.chunk(&file.id, 1).unwrap();
        assert_eq!(chunk.status, ferry_core::ChunkStatus::Pending);
        assert_eq!(chunk.retry_count, 3);
    }

    #[test]
    fn snapshot_channel_tracks_changes() {
        let fx = Fixture::new();
        let mut rx = fx.manager.subscribe();
        assert!(rx.borrow_and_update().is_empty());

        let s = fx.manager.create_outbound(peer(), vec![fx.source("a", 1)], None).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update()[0].id, s.id);

        fx.manager.start(&s.id).unwrap();
        assert_eq!(rx.borrow_and_update()[0].status, SessionStatus::Connecting);
    }

    #[test]
    fn sessions_survive_restart() {
        let mut fx = Fixture::new();
        let s = fx.manager.create_outbound(peer(), vec![fx.source("a", 5)], None).unwrap();
        fx.manager.start(&s.id).unwrap();

        fx.reopen();
        let loaded = fx.manager.get(&s.id).unwrap();
        assert_eq!(loaded.status, SessionStatus::Connecting);
        assert_eq!(loaded.files, s.files);
    }

    #[test]
    fn restart_resumes_only_sessions_with_progress() {
        let mut fx = Fixture::new();
        let with_progress = fx.source("a.bin", 50);
        let without = fx.source("b.bin", 50);
        let vanished = fx.source("c.bin", 50);

        let s1 = fx.manager.create_outbound(peer(), vec![with_progress.clone()], Some(10)).unwrap();
        let s2 = fx.manager.create_outbound(peer(), vec![without], Some(10)).unwrap();
        let s3 = fx.manager.create_outbound(peer(), vec![vanished.clone()], Some(10)).unwrap();
        for s in [&s1, &s2, &s3] {
            fx.manager.start(&s.id).unwrap();
            fx.manager.mark_in_progress(&s.id).unwrap();
        }
        let store = fx.manager.outbound_store().clone();
        store.mark_completed(&with_progress.id, 0).unwrap();
        store.mark_completed(&with_progress.id, 1).unwrap();
        store.mark_in_progress(&with_progress.id, 2).unwrap();
        store.mark_completed(&vanished.id, 0).unwrap();
        std::fs::remove_file(vanished.content.path()).unwrap();

        fx.reopen();
        let requeue = fx.manager.resume_interrupted();
        assert_eq!(requeue, vec![s1.id.clone()]);

        let s1 = fx.manager.get(&s1.id).unwrap();
        assert_eq!(s1.status, SessionStatus::Connecting);
        let pending: Vec<u32> = fx
            .manager
            .outbound_store()
            .pending(&with_progress.id)
            .iter()
            .map(|c| c.index)
            .collect();
        assert_eq!(pending, vec![2, 3, 4]);

        let s2 = fx.manager.get(&s2.id).unwrap();
        assert_eq!(s2.status, SessionStatus::Failed);
        assert!(s2.error.unwrap().contains("no completed chunks"));

        let s3 = fx.manager.get(&s3.id).unwrap();
        assert_eq!(s3.status, SessionStatus::Failed);
        assert!(s3.error.unwrap().contains("no longer readable"));
    }

    #[test]
    fn cleanup_removes_only_old_finished_sessions() {
        let fx = Fixture::new();
        let done = fx.manager.create_outbound(peer(), vec![fx.source("a", 1)], None).unwrap();
        let live = fx.manager.create_outbound(peer(), vec![fx.source("b", 1)], None).unwrap();
        fx.manager.cancel(&done.id).unwrap();

        assert_eq!(fx.manager.cleanup(Duration::from_secs(3600)), 0);
        assert_eq!(fx.manager.cleanup(Duration::ZERO), 1);
        assert!(fx.manager.get(&done.id).is_none());
        assert!(fx.manager.get(&live.id).is_some());
        assert_eq!(fx.manager.cleanup(Duration::ZERO), 0);
    }

    #[test]
    fn find_inbound_ignores_completed_sessions() {
        let fx = Fixture::new();
        let file = FileDescriptor {
            id: "incoming".into(),
            name: "x".into(),
            size: 1,
            content_type: "application/octet-stream".into(),
            content: ContentRef::new("/tmp/x"),
            checksum: None,
        };
        let s = fx.manager.create_inbound(peer(), file.clone()).unwrap();
        fx.manager.cancel(&s.id).unwrap();
        assert_eq!(fx.manager.find_inbound("incoming").unwrap().id, s.id);

        let fx = Fixture::new();
        let s = fx.manager.create_inbound(peer(), file).unwrap();
        fx.manager.start(&s.id).unwrap();
        fx.manager.mark_in_progress(&s.id).unwrap();
        fx.manager.complete(&s.id).unwrap();
        assert!(fx.manager.find_inbound("incoming").is_none());
    }
}
