// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ThreadLog Store - Message reader
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Pages are served from the committed prefix of a session log. The nearest
// index entry at or before the first wanted sequence gives a byte offset to
// seek to; if the index is missing, fails validation or was being rebuilt
// while we used it, the page is recomputed by a linear scan and a background
// rebuild is queued. Readers never take the session write lock.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::id::SessionId;
use crate::index::{self, SessionIndex};
use crate::logfile::LineCursor;
use crate::record::{Record, RecordCodec};
use crate::store::{LogStore, SessionHandle};

/// Largest page a single request may return.
pub const MAX_PAGE_SIZE: usize = 1000;

// ---------------------------------------------------------------------------
// Requests and pages
// ---------------------------------------------------------------------------

/// Which records a page should contain.
///
/// Without a cursor the page holds the `limit` most recent records. With
/// `before_sequence` it holds the `limit` records just before that sequence;
/// with `after_sequence` the `limit` records just after it. Records are
/// returned oldest first unless `reverse` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub limit: usize,
    #[serde(default)]
    pub before_sequence: Option<u64>,
    #[serde(default)]
    pub after_sequence: Option<u64>,
    #[serde(default)]
    pub reverse: bool,
    #[serde(skip)]
    pub deadline: Option<Instant>,
}

impl PageRequest {
    /// The `limit` most recent records.
    pub fn latest(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn before(mut self, sequence: u64) -> Self {
        self.before_sequence = Some(sequence);
        self
    }

    pub fn after(mut self, sequence: u64) -> Self {
        self.after_sequence = Some(sequence);
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }
}

/// One page of records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub records: Vec<Record>,
    /// The deadline expired before the page was complete.
    pub truncated: bool,
}

/// The half-open sequence range a page covers, once known.
#[derive(Debug, Clone, Copy)]
enum Window {
    /// `[start, end)`.
    Range { start: u64, end: u64 },
    /// The last `limit` records below `upper` (unbounded if `None`).
    Tail { upper: Option<u64>, limit: usize },
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

impl LogStore {
    /// Read a page of committed records from a session.
    pub async fn get_messages(&self, session_id: &str, request: &PageRequest) -> StoreResult<Page> {
        let id = SessionId::parse(session_id)?;
        if request.before_sequence.is_some() && request.after_sequence.is_some() {
            return Err(StoreError::invalid(
                "before_sequence and after_sequence are mutually exclusive",
            ));
        }
        let handle = self.session_handle(&id).await?;
        let limit = request.limit.min(MAX_PAGE_SIZE);
        if limit == 0 {
            return Ok(Page::default());
        }

        let end = handle.committed_len();
        let generation = handle.index_generation.load(Ordering::Acquire);

        let mut page = None;
        if generation % 2 == 0 {
            if let Some(index) = self.reader_index(&handle) {
                page = self.indexed_page(&handle, &index, end, limit, request)?;
            }
            if page.is_some() && handle.index_generation.load(Ordering::Acquire) != generation {
                debug!(session_id = %id, "Index rebuilt during read; rescanning");
                page = None;
            }
        }

        let mut page = match page {
            Some(page) => page,
            None => self.scanned_page(&handle, end, limit, request)?,
        };
        if request.reverse {
            page.records.reverse();
        }
        Ok(page)
    }

    /// Point lookup of one record.
    pub async fn get_message(&self, session_id: &str, record_id: u64) -> StoreResult<Record> {
        let id = SessionId::parse(session_id)?;
        let handle = self.session_handle(&id).await?;
        let end = handle.committed_len();

        let mut start = 0;
        if let Some(entry) = self
            .reader_index(&handle)
            .and_then(|index| index.floor(record_id))
            .filter(|entry| entry.offset < end)
        {
            if index::verify_entry(&handle.log_path, entry, end)? {
                start = entry.offset;
            } else {
                self.index_mismatch(&handle);
            }
        }

        let window = Window::Range {
            start: record_id,
            end: record_id.saturating_add(1),
        };
        let (mut records, _) = collect(&self.codec, &handle, start, end, window, None)?;
        records
            .pop()
            .ok_or_else(|| StoreError::NotFound(format!("record {record_id} in session {id}")))
    }

    /// The index a reader may use: the published snapshot, else the saved
    /// file. A corrupt file queues a rebuild.
    fn reader_index(&self, handle: &SessionHandle) -> Option<Arc<SessionIndex>> {
        if handle.index_generation.load(Ordering::Acquire) % 2 == 1 {
            return None;
        }
        if let Some(index) = handle.snapshot() {
            return Some(index);
        }
        match SessionIndex::load(&handle.index_path, &handle.session_id) {
            Ok(Some(index)) => Some(Arc::new(index)),
            Ok(None) => {
                if handle.committed_len() > 0 {
                    warn!(session_id = %handle.session_id, "Index missing; falling back to scan");
                    self.schedule_rebuild(&handle.session_id);
                }
                None
            }
            Err(e) => {
                warn!(session_id = %handle.session_id, error = %e, "Index unusable; falling back to scan");
                self.schedule_rebuild(&handle.session_id);
                None
            }
        }
    }

    fn index_mismatch(&self, handle: &SessionHandle) {
        warn!(session_id = %handle.session_id, "Index entry does not match log; falling back to scan");
        self.schedule_rebuild(&handle.session_id);
    }

    /// Serve a page via the index. `None` means the index could not be
    /// trusted for this request.
    fn indexed_page(
        &self,
        handle: &SessionHandle,
        index: &SessionIndex,
        end: u64,
        limit: usize,
        request: &PageRequest,
    ) -> StoreResult<Option<Page>> {
        let (start, stop) = match (request.after_sequence, request.before_sequence) {
            (Some(after), _) => {
                let start = after.saturating_add(1);
                (start, start.saturating_add(limit as u64))
            }
            (None, before) => {
                let Some(count) = self.count_with_index(handle, index, end)? else {
                    return Ok(None);
                };
                // A cursor past the end pages from the newest record.
                let upper = before.map_or(count, |before| before.min(count));
                (upper.saturating_sub(limit as u64), upper)
            }
        };
        if start >= stop {
            return Ok(Some(Page::default()));
        }

        let seek = match index.floor(start).filter(|e| e.offset < end) {
            Some(entry) => {
                if !index::verify_entry(&handle.log_path, entry, end)? {
                    self.index_mismatch(handle);
                    return Ok(None);
                }
                entry.offset
            }
            None => 0,
        };

        let window = Window::Range { start, end: stop };
        let (records, truncated) = collect(&self.codec, handle, seek, end, window, request.deadline)?;
        Ok(Some(Page { records, truncated }))
    }

    /// Committed record count, scanning forward from the last usable index
    /// entry.
    fn count_with_index(
        &self,
        handle: &SessionHandle,
        index: &SessionIndex,
        end: u64,
    ) -> StoreResult<Option<u64>> {
        let (start, base) = match index.last_within(end) {
            Some(entry) => {
                if !index::verify_entry(&handle.log_path, entry, end)? {
                    self.index_mismatch(handle);
                    return Ok(None);
                }
                (entry.offset, entry.sequence)
            }
            None => (0, 0),
        };
        let summary = index::scan_positions(&handle.log_path, start, base, end, |_, _| {})?;
        Ok(Some(summary.record_count))
    }

    /// Serve a page by scanning from offset 0.
    fn scanned_page(
        &self,
        handle: &SessionHandle,
        end: u64,
        limit: usize,
        request: &PageRequest,
    ) -> StoreResult<Page> {
        let window = match (request.after_sequence, request.before_sequence) {
            (Some(after), _) => {
                let start = after.saturating_add(1);
                Window::Range {
                    start,
                    end: start.saturating_add(limit as u64),
                }
            }
            (None, upper) => Window::Tail { upper, limit },
        };
        let (records, truncated) = collect(&self.codec, handle, 0, end, window, request.deadline)?;
        Ok(Page { records, truncated })
    }
}

/// Scan `[from, end)` of a session log and gather the records in `window`.
fn collect(
    codec: &RecordCodec,
    handle: &SessionHandle,
    from: u64,
    end: u64,
    window: Window,
    deadline: Option<Instant>,
) -> StoreResult<(Vec<Record>, bool)> {
    let mut ring: VecDeque<Record> = VecDeque::new();
    let mut truncated = false;

    let Some(mut cursor) = LineCursor::open(&handle.log_path, from, end)? else {
        return Ok((Vec::new(), false));
    };

    while let Some((offset, line)) = cursor.next_line()? {
        if expired(deadline) {
            truncated = true;
            break;
        }
        let Some(sequence) = index::line_sequence(line) else {
            warn!(session_id = %handle.session_id, offset, "Skipping unreadable log line");
            continue;
        };

        let keep = match window {
            Window::Range { start, end } => {
                if sequence >= end {
                    break;
                }
                sequence >= start
            }
            Window::Tail { upper, .. } => {
                if upper.is_some_and(|u| sequence >= u) {
                    break;
                }
                true
            }
        };
        if !keep {
            continue;
        }

        let record = match std::str::from_utf8(line)
            .map_err(|e| StoreError::invalid(e.to_string()))
            .and_then(|text| codec.decode(text))
        {
            Ok(record) => record,
            Err(e) => {
                warn!(session_id = %handle.session_id, offset, error = %e, "Skipping undecodable record");
                continue;
            }
        };
        ring.push_back(record);
        if let Window::Tail { limit, .. } = window {
            if ring.len() > limit {
                ring.pop_front();
            }
        }
    }

    Ok((ring.into(), truncated))
}
