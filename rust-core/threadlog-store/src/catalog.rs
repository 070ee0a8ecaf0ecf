// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ThreadLog Store - Session catalog
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The master list of sessions is an append-only `catalog.jsonl`: one JSON
// line per lifecycle event, never rewritten in place. Appends go through a
// single writer lock and are synced. Readers keep a folded `CatalogView`
// plus the byte offset it covers and only parse lines appended since; a
// partial trailing line is left for the next load.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::record::Metadata;

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Archived,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Archived => "archived",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(SessionStatus::Active),
            "archived" => Ok(SessionStatus::Archived),
            other => Err(StoreError::invalid(format!("unknown session status: {other}"))),
        }
    }
}

/// A conversation container, as folded from the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub title: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Cached record count. May lag by one in-flight write until the next
    /// recovery reconciles it.
    pub message_count: u64,
    #[serde(default)]
    pub metadata: Metadata,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// One line of `catalog.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CatalogEvent {
    Created {
        session_id: String,
        at: DateTime<Utc>,
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Metadata::is_empty")]
        metadata: Metadata,
    },
    Renamed {
        session_id: String,
        at: DateTime<Utc>,
        title: Option<String>,
    },
    /// A write landed; carries the new record count.
    Touched {
        session_id: String,
        at: DateTime<Utc>,
        message_count: u64,
    },
    Archived {
        session_id: String,
        at: DateTime<Utc>,
    },
    /// An empty session was cleaned up and no longer exists.
    Purged {
        session_id: String,
        at: DateTime<Utc>,
    },
}

impl CatalogEvent {
    pub fn session_id(&self) -> &str {
        match self {
            CatalogEvent::Created { session_id, .. }
            | CatalogEvent::Renamed { session_id, .. }
            | CatalogEvent::Touched { session_id, .. }
            | CatalogEvent::Archived { session_id, .. }
            | CatalogEvent::Purged { session_id, .. } => session_id,
        }
    }
}

// ---------------------------------------------------------------------------
// CatalogView
// ---------------------------------------------------------------------------

/// Point-in-time fold of the catalog.
#[derive(Debug, Clone, Default)]
pub struct CatalogView {
    sessions: HashMap<String, Session>,
}

impl CatalogView {
    /// Apply one event. Events for unknown sessions are ignored, except
    /// `Created`.
    pub fn apply(&mut self, event: CatalogEvent) {
        match event {
            CatalogEvent::Created {
                session_id,
                at,
                title,
                metadata,
            } => {
                self.sessions.insert(
                    session_id.clone(),
                    Session {
                        session_id,
                        title,
                        status: SessionStatus::Active,
                        created_at: at,
                        updated_at: at,
                        message_count: 0,
                        metadata,
                    },
                );
            }
            CatalogEvent::Renamed {
                session_id,
                at,
                title,
            } => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.title = title;
                    session.updated_at = session.updated_at.max(at);
                }
            }
            CatalogEvent::Touched {
                session_id,
                at,
                message_count,
            } => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.message_count = message_count;
                    session.updated_at = session.updated_at.max(at);
                }
            }
            CatalogEvent::Archived { session_id, .. } => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.status = SessionStatus::Archived;
                }
            }
            CatalogEvent::Purged { session_id, .. } => {
                self.sessions.remove(&session_id);
            }
        }
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions most recently updated first, optionally filtered by status.
    pub fn recent(&self, status: Option<SessionStatus>) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .values()
            .filter(|s| status.map_or(true, |wanted| s.status == wanted))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.session_id.cmp(&a.session_id))
        });
        sessions
    }

    /// Number of sessions with the given status.
    pub fn count(&self, status: SessionStatus) -> usize {
        self.sessions.values().filter(|s| s.status == status).count()
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// The folded view and how much of the file it covers.
#[derive(Default)]
struct Folded {
    view: CatalogView,
    offset: u64,
    lines: usize,
}

/// The append-only master session catalog.
pub struct Catalog {
    path: PathBuf,
    writer: Mutex<File>,
    folded: std::sync::Mutex<Folded>,
}

impl Catalog {
    /// Open (or create) the catalog, dropping a torn trailing line.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let data = fs::read(&path)?;
        let complete = data.iter().rposition(|&b| b == b'\n').map_or(0, |p| p + 1);
        if complete < data.len() {
            warn!(
                path = %path.display(),
                torn_bytes = data.len() - complete,
                "Truncating torn trailing catalog line"
            );
            file.set_len(complete as u64)?;
            file.sync_all()?;
        }

        Ok(Self {
            path,
            writer: Mutex::new(file),
            folded: std::sync::Mutex::new(Folded::default()),
        })
    }

    /// Append an event under the single writer lock and sync it.
    pub async fn append(&self, event: &CatalogEvent) -> StoreResult<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = self.writer.lock().await;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        debug!(session_id = event.session_id(), "Appended catalog event");
        Ok(())
    }

    /// Current view of the catalog, without taking the writer lock. Only
    /// complete lines past the last load are read.
    pub fn load(&self) -> StoreResult<CatalogView> {
        let mut folded = self.folded.lock().unwrap_or_else(|p| p.into_inner());

        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(CatalogView::default()),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();
        if len < folded.offset {
            warn!(path = %self.path.display(), "Catalog shrank; refolding from the start");
            *folded = Folded::default();
        }
        if len == folded.offset {
            return Ok(folded.view.clone());
        }

        file.seek(SeekFrom::Start(folded.offset))?;
        let mut data = Vec::with_capacity((len - folded.offset) as usize);
        file.take(len - folded.offset).read_to_end(&mut data)?;
        let Some(last_newline) = data.iter().rposition(|&b| b == b'\n') else {
            return Ok(folded.view.clone());
        };

        for line in data[..last_newline].split(|&b| b == b'\n') {
            folded.lines += 1;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<CatalogEvent>(line) {
                Ok(event) => folded.view.apply(event),
                Err(e) => warn!(
                    line_number = folded.lines,
                    error = %e,
                    path = %self.path.display(),
                    "Skipping unreadable catalog line"
                ),
            }
        }
        folded.offset += last_newline as u64 + 1;
        Ok(folded.view.clone())
    }

    /// Bytes of the catalog already folded into the cached view.
    pub fn folded_len(&self) -> u64 {
        self.folded.lock().unwrap_or_else(|p| p.into_inner()).offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn created(id: &str, at: DateTime<Utc>) -> CatalogEvent {
        CatalogEvent::Created {
            session_id: id.to_string(),
            at,
            title: Some(format!("title {id}")),
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn test_fold_lifecycle() {
        let t0 = Utc::now();
        let mut view = CatalogView::default();
        view.apply(created("a", t0));
        view.apply(CatalogEvent::Touched {
            session_id: "a".into(),
            at: t0 + Duration::seconds(5),
            message_count: 2,
        });
        view.apply(CatalogEvent::Renamed {
            session_id: "a".into(),
            at: t0 + Duration::seconds(6),
            title: Some("renamed".into()),
        });
        view.apply(CatalogEvent::Archived {
            session_id: "a".into(),
            at: t0 + Duration::seconds(7),
        });

        let session = view.get("a").unwrap();
        assert_eq!(session.message_count, 2);
        assert_eq!(session.title.as_deref(), Some("renamed"));
        assert_eq!(session.status, SessionStatus::Archived);
        assert_eq!(session.updated_at, t0 + Duration::seconds(6));
    }

    #[test]
    fn test_recent_orders_by_update() {
        let t0 = Utc::now();
        let mut view = CatalogView::default();
        view.apply(created("a", t0));
        view.apply(created("b", t0 + Duration::seconds(1)));
        view.apply(CatalogEvent::Touched {
            session_id: "a".into(),
            at: t0 + Duration::seconds(10),
            message_count: 1,
        });
        let ids: Vec<String> = view.recent(None).into_iter().map(|s| s.session_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_purged_sessions_disappear() {
        let mut view = CatalogView::default();
        view.apply(created("a", Utc::now()));
        view.apply(CatalogEvent::Purged {
            session_id: "a".into(),
            at: Utc::now(),
        });
        assert!(view.is_empty());
    }

    #[test]
    fn test_event_line_format() {
        let line = serde_json::to_string(&CatalogEvent::Archived {
            session_id: "a".into(),
            at: Utc::now(),
        })
        .unwrap();
        assert!(line.starts_with("{\"event\":\"archived\""));
    }

    #[tokio::test]
    async fn test_append_and_load_skips_torn_and_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.jsonl");
        {
            let catalog = Catalog::open(&path).unwrap();
            catalog.append(&created("a", Utc::now())).await.unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"not json\n{\"event\":\"crea").unwrap();
        drop(file);

        // Reopening drops the torn tail; the garbage line is skipped on load.
        let catalog = Catalog::open(&path).unwrap();
        catalog.append(&created("b", Utc::now())).await.unwrap();
        let view = catalog.load().unwrap();
        assert_eq!(view.len(), 2);
        assert!(view.contains("a") && view.contains("b"));
    }

    #[tokio::test]
    async fn test_load_folds_only_new_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.jsonl");
        let catalog = Catalog::open(&path).unwrap();
        catalog.append(&created("a", Utc::now())).await.unwrap();
        catalog.append(&created("b", Utc::now())).await.unwrap();

        assert_eq!(catalog.load().unwrap().len(), 2);
        let covered = catalog.folded_len();
        assert_eq!(covered, fs::metadata(&path).unwrap().len());

        catalog
            .append(&CatalogEvent::Purged {
                session_id: "a".into(),
                at: Utc::now(),
            })
            .await
            .unwrap();
        catalog.append(&created("c", Utc::now())).await.unwrap();

        // A half-written line from a concurrent writer waits for the next load.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"event\":\"crea").unwrap();
        drop(file);

        let view = catalog.load().unwrap();
        assert!(catalog.folded_len() > covered);
        assert!(catalog.folded_len() < fs::metadata(&path).unwrap().len());
        assert!(!view.contains("a"));
        assert!(view.contains("b") && view.contains("c"));

        let fresh = Catalog::open(&path).unwrap().load().unwrap();
        assert_eq!(fresh.recent(None), view.recent(None));
    }

    #[tokio::test]
    async fn test_load_refolds_after_shrink() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.jsonl");
        let catalog = Catalog::open(&path).unwrap();
        catalog.append(&created("a", Utc::now())).await.unwrap();
        catalog.append(&created("b", Utc::now())).await.unwrap();
        assert_eq!(catalog.load().unwrap().len(), 2);

        let line = serde_json::to_string(&created("z", Utc::now())).unwrap();
        fs::write(&path, format!("{line}\n")).unwrap();
        let view = catalog.load().unwrap();
        assert_eq!(view.len(), 1);
        assert!(view.contains("z"));
    }
}
