// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ThreadLog Store - Index builder
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Full index rebuilds. A rebuild holds the session write lock and bumps the
// session's index generation to odd for its duration, so concurrent readers
// know to ignore any index they picked up meanwhile. The log itself is only
// read.

use std::sync::atomic::Ordering;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{StoreError, StoreResult};
use crate::id::SessionId;
use crate::index::SessionIndex;
use crate::logfile;
use crate::store::{open_append, LogStore, SessionHandle, SessionTail};

/// Result of rebuilding one session's index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexReport {
    pub session_id: String,
    pub records: u64,
    pub entries: usize,
}

/// Result of a sweep over every session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildReport {
    pub rebuilt: usize,
    pub failed: usize,
    pub records: u64,
}

impl LogStore {
    /// Rebuild a session's index by scanning its log from offset 0.
    pub async fn build_message_index(&self, session_id: &str) -> StoreResult<IndexReport> {
        let id = SessionId::parse(session_id)?;
        let handle = self.session_handle(&id).await?;
        let mut tail = self.lock_session(&handle).await?;
        if handle.purged.load(Ordering::Acquire) {
            return Err(StoreError::NotFound(format!("session {id}")));
        }

        handle.index_generation.fetch_add(1, Ordering::AcqRel);
        let result = self.rebuild_locked(&handle, &mut tail);
        handle.index_generation.fetch_add(1, Ordering::AcqRel);

        let report = result?;
        info!(
            session_id = %id,
            records = report.records,
            entries = report.entries,
            "Rebuilt index"
        );
        Ok(report)
    }

    fn rebuild_locked(&self, handle: &SessionHandle, tail: &mut SessionTail) -> StoreResult<IndexReport> {
        let extent = logfile::measure(&handle.log_path)?;
        if extent.is_torn() {
            logfile::truncate_to(&handle.log_path, extent.complete)?;
        }

        let (index, summary) =
            SessionIndex::build_from_log(&handle.log_path, self.config.index_interval, extent.complete)?;
        if handle.log_path.exists() {
            index.save(&handle.index_path)?;
        }

        if tail.file.is_none() {
            tail.file = Some(open_append(&handle.log_path)?);
        }
        tail.next_sequence = summary.record_count;
        tail.log_len = summary.end_offset;
        handle.publish_index(&index);
        let entries = index.len();
        tail.index = index;
        tail.loaded = true;
        handle.committed_len.store(tail.log_len, Ordering::Release);

        Ok(IndexReport {
            session_id: handle.session_id.clone(),
            records: summary.record_count,
            entries,
        })
    }

    /// Rebuild every session's index. Safe to run alongside writers; a
    /// failing session is counted and skipped.
    pub async fn rebuild_all_indexes(&self) -> StoreResult<RebuildReport> {
        let sessions = self.catalog.load()?.recent(None);
        let mut report = RebuildReport::default();
        for session in sessions {
            match self.build_message_index(&session.session_id).await {
                Ok(one) => {
                    report.rebuilt += 1;
                    report.records += one.records;
                }
                Err(e) => {
                    warn!(session_id = %session.session_id, error = %e, "Index rebuild failed");
                    report.failed += 1;
                }
            }
        }
        info!(rebuilt = report.rebuilt, failed = report.failed, "Rebuilt all indexes");
        Ok(report)
    }

    /// Run [`rebuild_all_indexes`](Self::rebuild_all_indexes) on a
    /// background task.
    pub fn spawn_rebuild_all(&self) -> JoinHandle<StoreResult<RebuildReport>> {
        let store = self.clone();
        tokio::spawn(async move { store.rebuild_all_indexes().await })
    }
}
