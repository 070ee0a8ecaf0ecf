// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ThreadLog Store - Session manager
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Session lifecycle on top of the catalog: create, look up, list, rename,
// archive and the administrative cleanup of old empty sessions.

use std::fs;
use std::io::ErrorKind;
use std::sync::atomic::Ordering;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::catalog::{CatalogEvent, Session, SessionStatus};
use crate::error::{StoreError, StoreResult};
use crate::id::SessionId;
use crate::index::SessionIndex;
use crate::record::Metadata;
use crate::store::{open_append, LogStore};

/// Outcome of [`LogStore::cleanup_empty_sessions`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub cleaned_count: usize,
    pub error_count: usize,
}

impl LogStore {
    /// Create a session with an empty log and return its id.
    #[instrument(skip(self, metadata))]
    pub async fn create_session(
        &self,
        title: Option<String>,
        metadata: Option<Metadata>,
    ) -> StoreResult<SessionId> {
        let metadata = metadata.unwrap_or_default();
        if let Some(title) = &title {
            self.codec.check_title(title)?;
        }
        self.codec.check_metadata(&metadata)?;

        let id = SessionId::generate();
        let event = CatalogEvent::Created {
            session_id: id.as_str().to_string(),
            at: Utc::now(),
            title,
            metadata,
        };
        let estimate = serde_json::to_vec(&event)?.len() as u64 + 1;
        self.check_quota(estimate)?;

        let file = open_append(&self.layout.log_path(id.as_str()))?;
        SessionIndex::new(self.config.index_interval).save(&self.layout.index_path(id.as_str()))?;
        self.catalog.append(&event).await?;
        self.add_usage(estimate);
        self.register_new_session(&id, file).await;

        info!(session_id = %id, "Created session");
        Ok(id)
    }

    /// Look up one session.
    pub async fn get_session(&self, session_id: &str) -> StoreResult<Session> {
        let id = SessionId::parse(session_id)?;
        self.catalog
            .load()?
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    /// Sessions most recently updated first.
    pub async fn list_sessions(
        &self,
        limit: usize,
        status: Option<SessionStatus>,
    ) -> StoreResult<Vec<Session>> {
        let mut sessions = self.catalog.load()?.recent(status);
        sessions.truncate(limit);
        Ok(sessions)
    }

    /// Replace a session's title.
    pub async fn rename_session(&self, session_id: &str, title: Option<String>) -> StoreResult<Session> {
        let id = SessionId::parse(session_id)?;
        if let Some(title) = &title {
            self.codec.check_title(title)?;
        }
        if !self.catalog.load()?.contains(id.as_str()) {
            return Err(StoreError::NotFound(format!("session {id}")));
        }
        self.catalog
            .append(&CatalogEvent::Renamed {
                session_id: id.as_str().to_string(),
                at: Utc::now(),
                title,
            })
            .await?;
        self.get_session(id.as_str()).await
    }

    /// Mark a session archived. Archiving an archived session is a no-op.
    ///
    /// Takes the session write lock so it cannot interleave with an
    /// in-flight append.
    #[instrument(skip(self))]
    pub async fn archive_session(&self, session_id: &str) -> StoreResult<Session> {
        let id = SessionId::parse(session_id)?;
        let handle = self.session_handle(&id).await?;
        let _tail = self.lock_session(&handle).await?;

        let current = self.get_session(id.as_str()).await?;
        if current.status == SessionStatus::Archived {
            handle.archived.store(true, Ordering::Release);
            return Ok(current);
        }

        self.catalog
            .append(&CatalogEvent::Archived {
                session_id: id.as_str().to_string(),
                at: Utc::now(),
            })
            .await?;
        handle.archived.store(true, Ordering::Release);
        info!("Archived session");
        self.get_session(id.as_str()).await
    }

    /// Purge sessions that never received a record and were created more
    /// than `max_age_hours` ago. Failures are counted, not propagated.
    pub async fn cleanup_empty_sessions(&self, max_age_hours: u64) -> StoreResult<CleanupReport> {
        let hours = i64::try_from(max_age_hours).unwrap_or(i64::MAX);
        let cutoff = Duration::try_hours(hours)
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let mut report = CleanupReport::default();
        let candidates: Vec<Session> = self
            .catalog
            .load()?
            .recent(None)
            .into_iter()
            .filter(|s| s.created_at < cutoff && s.message_count == 0)
            .collect();

        for session in candidates {
            match self.purge_if_empty(&session.session_id).await {
                Ok(true) => report.cleaned_count += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(session_id = %session.session_id, error = %e, "Failed to clean up session");
                    report.error_count += 1;
                }
            }
        }

        if report.cleaned_count > 0 {
            self.refresh_usage();
        }
        info!(
            cleaned = report.cleaned_count,
            errors = report.error_count,
            max_age_hours,
            "Cleaned up empty sessions"
        );
        Ok(report)
    }

    async fn purge_if_empty(&self, session_id: &str) -> StoreResult<bool> {
        let id = SessionId::parse(session_id)?;
        let handle = self.session_handle(&id).await?;
        let mut tail = self.lock_session(&handle).await?;
        self.load_tail(&handle, &mut tail)?;
        if tail.next_sequence > 0 {
            return Ok(false);
        }

        // The purged event lands first so that no new handle can be built
        // for the session once its directory starts disappearing.
        handle.purged.store(true, Ordering::Release);
        let purged = self
            .catalog
            .append(&CatalogEvent::Purged {
                session_id: session_id.to_string(),
                at: Utc::now(),
            })
            .await;
        if let Err(e) = purged {
            handle.purged.store(false, Ordering::Release);
            return Err(e);
        }
        tail.file = None;
        let removed = match fs::remove_dir_all(self.layout.session_dir(session_id)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        };
        drop(tail);
        self.forget_session(session_id).await;
        if let Err(e) = removed {
            warn!(session_id, error = %e, "Purged session directory could not be removed");
            return Err(e.into());
        }
        info!(session_id, "Purged empty session");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::record::Content;
    use serde_json::json;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> LogStore {
        LogStore::open(StoreConfig::with_data_dir(dir.path())).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let mut meta = Metadata::new();
        meta.insert("agent", json!("planner"));
        let id = store
            .create_session(Some("Planning".into()), Some(meta))
            .await
            .unwrap();

        let session = store.get_session(id.as_str()).await.unwrap();
        assert_eq!(session.title.as_deref(), Some("Planning"));
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.message_count, 0);
        assert_eq!(session.metadata.get("agent"), Some(&json!("planner")));
        assert!(dir.path().join("sessions").join(id.as_str()).join("log.jsonl").exists());
    }

    #[tokio::test]
    async fn test_create_writes_empty_index() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let id = store.create_session(None, None).await.unwrap();

        let path = dir.path().join("sessions").join(id.as_str()).join("index.json");
        let index = SessionIndex::load(&path, id.as_str()).unwrap().unwrap();
        assert!(index.entries.is_empty());
        assert_eq!(index.interval, store.config.index_interval);
    }

    #[tokio::test]
    async fn test_get_missing_session() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        assert!(matches!(
            store.get_session("0000000000000000-deadbeef").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_title_bound() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let err = store
            .create_session(Some("t".repeat(513)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_list_recent_activity_first() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let a = store.create_session(Some("a".into()), None).await.unwrap();
        let b = store.create_session(Some("b".into()), None).await.unwrap();
        let c = store.create_session(Some("c".into()), None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .append_message(a.as_str(), "user", Content::new("bump"), None)
            .await
            .unwrap();

        let ids: Vec<String> = store
            .list_sessions(10, None)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(ids, vec![a.to_string(), c.to_string(), b.to_string()]);

        assert_eq!(store.list_sessions(2, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_archive_is_idempotent_and_blocks_writes() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let id = store.create_session(None, None).await.unwrap();

        let first = store.archive_session(id.as_str()).await.unwrap();
        let second = store.archive_session(id.as_str()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(second.status, SessionStatus::Archived);

        let archived = store
            .list_sessions(10, Some(SessionStatus::Archived))
            .await
            .unwrap();
        assert_eq!(archived.len(), 1);
        assert!(store
            .list_sessions(10, Some(SessionStatus::Active))
            .await
            .unwrap()
            .is_empty());

        assert!(matches!(
            store
                .append_message(id.as_str(), "user", Content::new("late"), None)
                .await,
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_rename() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let id = store.create_session(Some("old".into()), None).await.unwrap();
        let renamed = store
            .rename_session(id.as_str(), Some("new".into()))
            .await
            .unwrap();
        assert_eq!(renamed.title.as_deref(), Some("new"));
        assert!(matches!(
            store.rename_session("missing", None).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_purges_only_old_empty_sessions() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let empty = store.create_session(Some("empty".into()), None).await.unwrap();
        let used = store.create_session(Some("used".into()), None).await.unwrap();
        store
            .append_message(used.as_str(), "user", Content::new("keep me"), None)
            .await
            .unwrap();

        // Nothing is older than a day yet.
        let report = store.cleanup_empty_sessions(24).await.unwrap();
        assert_eq!(report, CleanupReport::default());

        let report = store.cleanup_empty_sessions(0).await.unwrap();
        assert_eq!(report.cleaned_count, 1);
        assert_eq!(report.error_count, 0);

        assert!(matches!(
            store.get_session(empty.as_str()).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(!dir.path().join("sessions").join(empty.as_str()).exists());
        assert!(store.get_session(used.as_str()).await.is_ok());
        assert!(matches!(
            store
                .append_message(empty.as_str(), "user", Content::new("x"), None)
                .await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_purge_invalidates_cached_handle() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let id = store.create_session(None, None).await.unwrap();
        let held = store.session_handle(&id).await.unwrap();

        assert!(store.purge_if_empty(id.as_str()).await.unwrap());
        assert!(held.purged.load(Ordering::Acquire));
        assert!(matches!(
            store
                .append_message(id.as_str(), "user", Content::new("late"), None)
                .await,
            Err(StoreError::NotFound(_))
        ));
        assert!(!dir.path().join("sessions").join(id.as_str()).exists());

        drop(store);
        let reopened = LogStore::open(StoreConfig::with_data_dir(dir.path())).await.unwrap();
        assert!(matches!(
            reopened.get_session(id.as_str()).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
