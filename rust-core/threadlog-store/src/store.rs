// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ThreadLog Store - LogStore facade
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Owns the shared pieces (catalog, WAL, per-session handles) and the plumbing
// every operation needs: handle lookup, the per-session write lock with
// bounded retries, lazy loading of a session's tail state and background
// index rebuild scheduling. The operations themselves live in `writer`,
// `reader`, `sessions`, `search`, `rebuild` and `recovery`.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use threadlog_wal::WalWriter;

use crate::catalog::{Catalog, SessionStatus};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::id::SessionId;
use crate::index::{self, LogSummary, SessionIndex};
use crate::layout::Layout;
use crate::logfile;
use crate::record::RecordCodec;
use crate::recovery::RecoveryReport;

// ---------------------------------------------------------------------------
// Per-session state
// ---------------------------------------------------------------------------

/// Writer-side state of a session, guarded by the session's write lock.
pub(crate) struct SessionTail {
    /// Next sequence to assign.
    pub next_sequence: u64,
    /// Length of the log in bytes (complete lines only).
    pub log_len: u64,
    /// The live index, extended on every sampled append.
    pub index: SessionIndex,
    /// Append handle, opened on first write.
    pub file: Option<File>,
    /// Whether the fields above reflect the log on disk.
    pub loaded: bool,
}

/// Shared state of one session.
pub(crate) struct SessionHandle {
    pub session_id: String,
    pub log_path: PathBuf,
    pub index_path: PathBuf,
    /// The exclusive write lock.
    pub tail: Mutex<SessionTail>,
    /// Bytes of the log readers may see. Only advanced after the record's
    /// WAL entry and log line are flushed.
    pub committed_len: AtomicU64,
    /// Odd while an index rebuild is in progress.
    pub index_generation: AtomicU64,
    /// Last index published by a lock holder.
    pub index_snapshot: std::sync::RwLock<Option<Arc<SessionIndex>>>,
    pub archived: AtomicBool,
    pub purged: AtomicBool,
}

impl SessionHandle {
    fn new(layout: &Layout, session_id: &str, committed_len: u64, archived: bool) -> Self {
        Self {
            session_id: session_id.to_string(),
            log_path: layout.log_path(session_id),
            index_path: layout.index_path(session_id),
            tail: Mutex::new(SessionTail {
                next_sequence: 0,
                log_len: committed_len,
                index: SessionIndex::new(1),
                file: None,
                loaded: false,
            }),
            committed_len: AtomicU64::new(committed_len),
            index_generation: AtomicU64::new(0),
            index_snapshot: std::sync::RwLock::new(None),
            archived: AtomicBool::new(archived),
            purged: AtomicBool::new(false),
        }
    }

    pub fn committed_len(&self) -> u64 {
        self.committed_len.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> Option<Arc<SessionIndex>> {
        self.index_snapshot.read().ok().and_then(|guard| (*guard).clone())
    }

    pub fn publish_index(&self, index: &SessionIndex) {
        if let Ok(mut guard) = self.index_snapshot.write() {
            *guard = Some(Arc::new(index.clone()));
        }
    }
}

/// Index and record count recovered from a session log on disk.
pub(crate) struct TailState {
    pub index: SessionIndex,
    pub summary: LogSummary,
    /// The index differs from what is saved on disk.
    pub index_dirty: bool,
}

/// Bring a session log into a writable state: drop a torn tail, then reuse
/// the saved index if its last entry still checks out, otherwise rebuild it.
pub(crate) fn load_tail_state(
    layout: &Layout,
    session_id: &str,
    interval: u64,
) -> StoreResult<TailState> {
    let log = layout.log_path(session_id);
    let extent = logfile::measure(&log)?;
    if extent.is_torn() {
        logfile::truncate_to(&log, extent.complete)?;
    }
    let end = extent.complete;

    let saved = match SessionIndex::load(&layout.index_path(session_id), session_id) {
        Ok(saved) => saved,
        Err(StoreError::CorruptIndex { reason, .. }) => {
            warn!(session_id, reason = %reason, "Discarding corrupt index");
            None
        }
        Err(e) => return Err(e),
    };

    if let Some(mut idx) = saved.filter(|i| i.interval == interval) {
        let trusted = match idx.last() {
            None => true,
            Some(last) => last.offset < end && index::verify_entry(&log, last, end)?,
        };
        if trusted {
            let before = idx.len();
            let (start, base) = idx.last().map_or((0, 0), |e| (e.offset, e.sequence));
            let summary = index::scan_positions(&log, start, base, end, |sequence, offset| {
                idx.observe(sequence, offset);
            })?;
            return Ok(TailState {
                index_dirty: idx.len() != before,
                index: idx,
                summary,
            });
        }
        warn!(session_id, "Saved index does not match the log; rebuilding");
    }

    let (idx, summary) = SessionIndex::build_from_log(&log, interval, end)?;
    Ok(TailState {
        index: idx,
        summary,
        index_dirty: true,
    })
}

pub(crate) fn open_append(path: &Path) -> StoreResult<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// A cached handle, unless the session was purged while it was cached.
fn live_handle(id: &SessionId, handle: &Arc<SessionHandle>) -> StoreResult<Arc<SessionHandle>> {
    if handle.purged.load(Ordering::Acquire) {
        return Err(StoreError::NotFound(format!("session {id}")));
    }
    Ok(handle.clone())
}

// ---------------------------------------------------------------------------
// WAL state
// ---------------------------------------------------------------------------

/// The shared WAL writer plus the number of appends it has not yet seen
/// resolved.
pub(crate) struct WalState {
    pub writer: WalWriter,
    pub outstanding: u64,
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Point-in-time counters for the whole store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub data_dir: PathBuf,
    pub sessions_total: usize,
    pub sessions_active: usize,
    pub sessions_archived: usize,
    pub sessions_open: usize,
    pub wal_pending: u64,
    pub wal_bytes: u64,
    pub bytes_used: u64,
    pub storage_quota_bytes: Option<u64>,
}

// ---------------------------------------------------------------------------
// LogStore
// ---------------------------------------------------------------------------

/// Durable, append-only conversation log store.
///
/// Cheap to clone; every clone shares the same files, locks and caches.
#[derive(Clone)]
pub struct LogStore {
    pub(crate) config: Arc<StoreConfig>,
    pub(crate) layout: Layout,
    pub(crate) codec: RecordCodec,
    /// Append-only master session list.
    pub(crate) catalog: Arc<Catalog>,
    /// Shared WAL across all sessions.
    pub(crate) wal: Arc<Mutex<WalState>>,
    /// Handles for sessions touched since startup.
    pub(crate) sessions: Arc<RwLock<HashMap<String, Arc<SessionHandle>>>>,
    /// Approximate bytes used under the data directory.
    pub(crate) usage: Arc<AtomicU64>,
    /// Sessions with a background index rebuild queued.
    pub(crate) rebuilds: Arc<std::sync::Mutex<HashSet<String>>>,
    pub(crate) last_recovery: Arc<std::sync::Mutex<Option<RecoveryReport>>>,
}

impl LogStore {
    /// Open the store rooted at `config.data_dir` and run WAL recovery.
    ///
    /// Failing to open the WAL is fatal. Individual WAL entries that cannot
    /// be recovered are quarantined or left pending and reported.
    pub async fn open(config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let layout = Layout::new(&config.data_dir);
        layout.ensure()?;

        let writer = WalWriter::open(layout.wal_path(), config.wal_sync.to_sync_mode())?;
        let catalog = Catalog::open(layout.catalog_path())?;
        let usage = layout.disk_usage()?;

        let store = Self {
            codec: RecordCodec::new(&config),
            config: Arc::new(config),
            layout,
            catalog: Arc::new(catalog),
            wal: Arc::new(Mutex::new(WalState {
                writer,
                outstanding: 0,
            })),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            usage: Arc::new(AtomicU64::new(usage)),
            rebuilds: Arc::new(std::sync::Mutex::new(HashSet::new())),
            last_recovery: Arc::new(std::sync::Mutex::new(None)),
        };

        let report = store.recover_from_wal().await?;
        store.refresh_usage();
        if let Ok(mut slot) = store.last_recovery.lock() {
            *slot = Some(report);
        }

        info!(
            data_dir = %store.layout.root().display(),
            bytes_used = store.usage.load(Ordering::Relaxed),
            "Log store ready"
        );
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        self.layout.root()
    }

    /// The report of the recovery sweep run when the store was opened.
    pub fn last_recovery(&self) -> Option<RecoveryReport> {
        self.last_recovery.lock().ok().and_then(|r| r.clone())
    }

    // -----------------------------------------------------------------------
    // Handles and locking
    // -----------------------------------------------------------------------

    /// Look up (or create) the handle of an existing session.
    pub(crate) async fn session_handle(&self, id: &SessionId) -> StoreResult<Arc<SessionHandle>> {
        if let Some(handle) = self.sessions.read().await.get(id.as_str()) {
            return live_handle(id, handle);
        }

        let view = self.catalog.load()?;
        let session = view
            .get(id.as_str())
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))?;
        let archived = session.status == SessionStatus::Archived;

        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(id.as_str()) {
            return live_handle(id, handle);
        }
        let extent = logfile::measure(&self.layout.log_path(id.as_str()))?;
        let handle = Arc::new(SessionHandle::new(
            &self.layout,
            id.as_str(),
            extent.complete,
            archived,
        ));
        sessions.insert(id.as_str().to_string(), handle.clone());
        Ok(handle)
    }

    /// Register the handle of a session that was just created.
    pub(crate) async fn register_new_session(&self, id: &SessionId, file: File) {
        let mut handle = SessionHandle::new(&self.layout, id.as_str(), 0, false);
        {
            let tail = handle.tail.get_mut();
            tail.index = SessionIndex::new(self.config.index_interval);
            tail.file = Some(file);
            tail.loaded = true;
        }
        handle.publish_index(&SessionIndex::new(self.config.index_interval));
        self.sessions
            .write()
            .await
            .insert(id.as_str().to_string(), Arc::new(handle));
    }

    pub(crate) async fn forget_session(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    /// Acquire a session's write lock, retrying timed-out attempts with a
    /// doubling backoff before giving up with `LockTimeout`.
    pub(crate) async fn lock_session<'a>(
        &self,
        handle: &'a SessionHandle,
    ) -> StoreResult<MutexGuard<'a, SessionTail>> {
        let attempts = self.config.lock_retries + 1;
        for attempt in 1..=attempts {
            match tokio::time::timeout(self.config.lock_timeout(), handle.tail.lock()).await {
                Ok(guard) => return Ok(guard),
                Err(_) => {
                    debug!(
                        session_id = %handle.session_id,
                        attempt,
                        "Timed out waiting for session write lock"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.config.lock_backoff(attempt)).await;
                    }
                }
            }
        }
        warn!(session_id = %handle.session_id, attempts, "Giving up on session write lock");
        Err(StoreError::LockTimeout {
            session_id: handle.session_id.clone(),
            attempts,
        })
    }

    /// Populate a session's tail from disk on its first locked use.
    pub(crate) fn load_tail(&self, handle: &SessionHandle, tail: &mut SessionTail) -> StoreResult<()> {
        if tail.loaded {
            return Ok(());
        }
        let state = load_tail_state(&self.layout, &handle.session_id, self.config.index_interval)?;
        if state.index_dirty && handle.log_path.exists() {
            if let Err(e) = state.index.save(&handle.index_path) {
                warn!(session_id = %handle.session_id, error = %e, "Failed to save index");
            }
        }

        tail.next_sequence = state.summary.record_count;
        tail.log_len = state.summary.end_offset;
        tail.file = Some(open_append(&handle.log_path)?);
        handle.publish_index(&state.index);
        tail.index = state.index;
        tail.loaded = true;
        handle.committed_len.store(tail.log_len, Ordering::Release);

        debug!(
            session_id = %handle.session_id,
            next_sequence = tail.next_sequence,
            log_len = tail.log_len,
            "Loaded session tail"
        );
        Ok(())
    }

    /// Bytes of `session_id`'s log visible to readers, without creating a
    /// handle.
    pub(crate) async fn committed_end(&self, session_id: &str) -> StoreResult<u64> {
        if let Some(handle) = self.sessions.read().await.get(session_id) {
            return Ok(handle.committed_len());
        }
        Ok(logfile::measure(&self.layout.log_path(session_id))?.complete)
    }

    /// Queue a background index rebuild for a session, at most one at a
    /// time. Outside a tokio runtime this does nothing.
    pub(crate) fn schedule_rebuild(&self, session_id: &str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let Ok(mut queued) = self.rebuilds.lock() else {
            return;
        };
        if !queued.insert(session_id.to_string()) {
            return;
        }
        drop(queued);

        info!(session_id, "Scheduled background index rebuild");
        let store = self.clone();
        let session_id = session_id.to_string();
        runtime.spawn(async move {
            if let Err(e) = store.build_message_index(&session_id).await {
                warn!(session_id = %session_id, error = %e, "Background index rebuild failed");
            }
            if let Ok(mut queued) = store.rebuilds.lock() {
                queued.remove(&session_id);
            }
        });
    }

    // -----------------------------------------------------------------------
    // Quota
    // -----------------------------------------------------------------------

    pub(crate) fn check_quota(&self, extra: u64) -> StoreResult<()> {
        if let Some(quota) = self.config.storage_quota_bytes {
            let used = self.usage.load(Ordering::Relaxed);
            if used.saturating_add(extra) > quota {
                return Err(StoreError::StorageFull(format!(
                    "{used} of {quota} bytes used, {extra} more requested"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn add_usage(&self, bytes: u64) {
        self.usage.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn refresh_usage(&self) {
        match self.layout.disk_usage() {
            Ok(bytes) => self.usage.store(bytes, Ordering::Relaxed),
            Err(e) => warn!(error = %e, "Failed to measure disk usage"),
        }
    }

    // -----------------------------------------------------------------------
    // Administration
    // -----------------------------------------------------------------------

    /// Truncate the WAL if every entry in it is resolved and no session
    /// write is in flight. Returns whether the WAL was compacted.
    pub async fn compact_wal(&self) -> StoreResult<bool> {
        let mut wal = self.wal.lock().await;
        let sessions = self.sessions.read().await;

        let mut guards = Vec::with_capacity(sessions.len());
        for handle in sessions.values() {
            match handle.tail.try_lock() {
                Ok(guard) => guards.push(guard),
                Err(_) => {
                    debug!(session_id = %handle.session_id, "Session busy; skipping WAL compaction");
                    return Ok(false);
                }
            }
        }

        if wal.outstanding > 0 {
            debug!(outstanding = wal.outstanding, "WAL has unresolved entries; not compacting");
            return Ok(false);
        }
        if wal.writer.is_empty() {
            return Ok(true);
        }

        wal.writer.truncate()?;
        drop(guards);
        drop(sessions);
        drop(wal);
        self.refresh_usage();
        Ok(true)
    }

    /// Counters for the whole store.
    pub async fn stats(&self) -> StoreResult<StoreStats> {
        let view = self.catalog.load()?;
        let (wal_pending, wal_bytes) = {
            let wal = self.wal.lock().await;
            (wal.outstanding, wal.writer.len())
        };
        Ok(StoreStats {
            data_dir: self.layout.root().to_path_buf(),
            sessions_total: view.len(),
            sessions_active: view.count(SessionStatus::Active),
            sessions_archived: view.count(SessionStatus::Archived),
            sessions_open: self.sessions.read().await.len(),
            wal_pending,
            wal_bytes,
            bytes_used: self.usage.load(Ordering::Relaxed),
            storage_quota_bytes: self.config.storage_quota_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Content, Metadata};
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> LogStore {
        let config = StoreConfig {
            index_interval: 4,
            ..StoreConfig::with_data_dir(dir.path())
        };
        LogStore::open(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_layout() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        assert!(dir.path().join("sessions").is_dir());
        assert!(dir.path().join("wal.jsonl").exists());
        assert!(dir.path().join("catalog.jsonl").exists());
        assert!(store.last_recovery().is_some());
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let id = SessionId::parse("missing").unwrap();
        assert!(matches!(
            store.session_handle(&id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_lock_timeout_after_retries() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            lock_timeout_ms: 10,
            lock_retries: 2,
            lock_backoff_ms: 1,
            ..StoreConfig::with_data_dir(dir.path())
        };
        let store = LogStore::open(config).await.unwrap();
        let id = store.create_session(None, None).await.unwrap();
        let handle = store.session_handle(&id).await.unwrap();

        let _held = handle.tail.lock().await;
        let err = store
            .append_message(id.as_str(), "user", Content::new("blocked"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { attempts: 3, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_load_tail_state_recovers_from_stale_index() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let id = store.create_session(None, None).await.unwrap();
        for i in 0..10 {
            store
                .append_message(id.as_str(), "user", Content::new(format!("m{i}")), None)
                .await
                .unwrap();
        }

        // An index from a different interval is rebuilt rather than trusted.
        let mut stale = SessionIndex::new(3);
        stale.observe(0, 0);
        stale.save(&store.layout.index_path(id.as_str())).unwrap();

        let state = load_tail_state(&store.layout, id.as_str(), 4).unwrap();
        assert_eq!(state.summary.record_count, 10);
        assert!(state.index_dirty);
        let sampled: Vec<u64> = state.index.entries.iter().map(|e| e.sequence).collect();
        assert_eq!(sampled, vec![0, 4, 8]);
    }

    #[tokio::test]
    async fn test_quota_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            storage_quota_bytes: Some(1),
            ..StoreConfig::with_data_dir(dir.path())
        };
        let store = LogStore::open(config).await.unwrap();
        let err = store
            .create_session(Some("t".into()), Some(Metadata::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StorageFull(_)));
    }

    #[tokio::test]
    async fn test_compact_wal_after_writes() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let id = store.create_session(None, None).await.unwrap();
        store
            .append_message(id.as_str(), "user", Content::new("hello"), None)
            .await
            .unwrap();
        assert!(store.stats().await.unwrap().wal_bytes > 0);

        assert!(store.compact_wal().await.unwrap());
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.wal_bytes, 0);
        assert_eq!(stats.wal_pending, 0);
    }

    #[tokio::test]
    async fn test_compact_wal_skips_busy_session() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let id = store.create_session(None, None).await.unwrap();
        let handle = store.session_handle(&id).await.unwrap();
        let _held = handle.tail.lock().await;
        assert!(!store.compact_wal().await.unwrap());
    }

    #[tokio::test]
    async fn test_scheduled_rebuild_restores_index() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let id = store.create_session(None, None).await.unwrap();
        for i in 0..6 {
            store
                .append_message(id.as_str(), "user", Content::new(format!("m{i}")), None)
                .await
                .unwrap();
        }
        let index_path = store.layout.index_path(id.as_str());
        std::fs::remove_file(&index_path).unwrap();

        store.schedule_rebuild(id.as_str());
        // A second request while one is queued is a no-op.
        store.schedule_rebuild(id.as_str());
        for _ in 0..200 {
            if store.rebuilds.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(store.rebuilds.lock().unwrap().is_empty());

        let index = SessionIndex::load(&index_path, id.as_str()).unwrap().unwrap();
        let sampled: Vec<u64> = index.entries.iter().map(|e| e.sequence).collect();
        assert_eq!(sampled, vec![0, 4]);
    }

    #[tokio::test]
    async fn test_purged_handle_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let id = store.create_session(None, None).await.unwrap();
        let handle = store.session_handle(&id).await.unwrap();

        // A handle still cached when the session is purged must not be
        // handed out again.
        handle.purged.store(true, Ordering::Release);
        assert!(matches!(
            store.session_handle(&id).await,
            Err(StoreError::NotFound(_))
        ));
        let err = store
            .append_message(id.as_str(), "user", Content::new("late"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
