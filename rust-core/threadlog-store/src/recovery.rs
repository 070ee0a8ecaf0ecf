// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ThreadLog Store - Recovery manager
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Runs once while the store opens, before any request is served. Every WAL
// append without a commit or abort marker is driven through
//
//   pending -> applied -> committed        (record was missing, re-appended)
//   pending -> committed                   (record already in the log)
//   pending -> quarantined                 (cannot be applied, kept aside)
//
// Unreadable WAL lines and quarantined entries are copied to
// `wal.jsonl.rejected`. An entry that hits an I/O error stays pending and the
// sweep moves on. When nothing is left pending the WAL is truncated.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use threadlog_wal::{WalEntry, WalReader};

use crate::catalog::{CatalogEvent, CatalogView};
use crate::error::{StoreError, StoreResult};
use crate::id::SessionId;
use crate::index::SessionIndex;
use crate::store::{load_tail_state, open_append, LogStore, WalState};

// ---------------------------------------------------------------------------
// Replay state machine
// ---------------------------------------------------------------------------

/// Where a pending WAL entry ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayState {
    /// Not yet resolved (or an I/O error stopped it).
    Pending,
    /// Written to the session log, commit marker not yet recorded.
    Applied,
    /// Present in the session log and marked committed in the WAL.
    Committed,
    /// Set aside in the rejected file; never applied.
    Quarantined,
}

impl ReplayState {
    /// Whether `next` is a legal successor of this state.
    pub fn can_advance_to(self, next: ReplayState) -> bool {
        matches!(
            (self, next),
            (ReplayState::Pending, ReplayState::Applied)
                | (ReplayState::Pending, ReplayState::Committed)
                | (ReplayState::Pending, ReplayState::Quarantined)
                | (ReplayState::Applied, ReplayState::Committed)
        )
    }

    /// Committed and quarantined entries need no further attention.
    pub fn is_terminal(self) -> bool {
        matches!(self, ReplayState::Committed | ReplayState::Quarantined)
    }
}

/// What happened to one pending WAL entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayOutcome {
    pub wal_seq: u64,
    pub session_id: String,
    pub sequence: u64,
    pub state: ReplayState,
    /// Whether the record had to be re-appended to its log.
    pub replayed: bool,
    pub note: Option<String>,
}

impl ReplayOutcome {
    fn new(entry: &WalEntry) -> Self {
        Self {
            wal_seq: entry.wal_seq,
            session_id: entry.session_id.clone(),
            sequence: entry.sequence,
            state: ReplayState::Pending,
            replayed: false,
            note: None,
        }
    }

    fn advance(&mut self, next: ReplayState) {
        if self.state.can_advance_to(next) {
            self.state = next;
        } else {
            warn!(
                wal_seq = self.wal_seq,
                from = ?self.state,
                to = ?next,
                "Ignoring illegal replay transition"
            );
        }
    }
}

/// Summary of a recovery sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Pending WAL entries examined.
    pub scanned: usize,
    /// Entries re-appended to their session log.
    pub replayed: usize,
    /// Entries whose record was already in the log.
    pub already_present: usize,
    /// Entries set aside as unusable.
    pub quarantined: usize,
    /// WAL lines that could not be decoded at all.
    pub rejected_lines: usize,
    /// Entries still pending because of I/O errors.
    pub left_pending: usize,
    /// Sessions whose cached message count was corrected.
    pub sessions_reconciled: usize,
    /// Whether the WAL was truncated at the end of the sweep.
    pub compacted: bool,
    pub outcomes: Vec<ReplayOutcome>,
}

// ---------------------------------------------------------------------------
// Quarantine file
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct QuarantineLine<'a> {
    quarantined_at: DateTime<Utc>,
    kind: &'a str,
    line_number: Option<usize>,
    wal_seq: Option<u64>,
    session_id: Option<&'a str>,
    sequence: Option<u64>,
    reason: &'a str,
    raw: &'a str,
}

struct Quarantine {
    path: PathBuf,
    file: Option<File>,
}

impl Quarantine {
    fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }

    fn write(&mut self, line: &QuarantineLine<'_>) -> StoreResult<()> {
        if self.file.is_none() {
            self.file = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?,
            );
        }
        let mut text = serde_json::to_string(line)?;
        text.push('\n');
        if let Some(file) = self.file.as_mut() {
            file.write_all(text.as_bytes())?;
            file.sync_data()?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-session replay state
// ---------------------------------------------------------------------------

struct ReplaySession {
    next_sequence: u64,
    log_len: u64,
    index: SessionIndex,
    file: Option<File>,
    index_dirty: bool,
    replayed: bool,
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

impl LogStore {
    /// Replay every unresolved WAL entry. Called by [`LogStore::open`]
    /// before the store is handed out.
    pub(crate) async fn recover_from_wal(&self) -> StoreResult<RecoveryReport> {
        let mut wal = self.wal.lock().await;
        let scan = WalReader::open(wal.writer.path())?.scan()?;
        let mut report = RecoveryReport::default();
        let mut quarantine = Quarantine::new(self.layout.rejected_path());
        let mut quarantine_failed = false;

        for rejected in &scan.rejected {
            error!(
                line_number = rejected.line_number,
                reason = %rejected.reason,
                "Quarantining unreadable WAL line"
            );
            let written = quarantine.write(&QuarantineLine {
                quarantined_at: Utc::now(),
                kind: "unreadable_line",
                line_number: Some(rejected.line_number),
                wal_seq: None,
                session_id: None,
                sequence: None,
                reason: &rejected.reason,
                raw: &rejected.raw,
            });
            if let Err(e) = written {
                error!(error = %e, "Failed to write rejected WAL line");
                quarantine_failed = true;
            }
            report.rejected_lines += 1;
        }

        let view = self.catalog.load()?;
        let mut sessions: HashMap<String, ReplaySession> = HashMap::new();

        for entry in &scan.pending {
            report.scanned += 1;
            let outcome = self.replay_entry(entry, &view, &mut sessions, &mut wal, &mut quarantine);
            match outcome.state {
                ReplayState::Committed if outcome.replayed => report.replayed += 1,
                ReplayState::Committed => report.already_present += 1,
                ReplayState::Quarantined => report.quarantined += 1,
                ReplayState::Pending | ReplayState::Applied => report.left_pending += 1,
            }
            report.outcomes.push(outcome);
        }

        for (session_id, state) in &sessions {
            if state.index_dirty {
                if let Err(e) = state.index.save(&self.layout.index_path(session_id)) {
                    warn!(session_id = %session_id, error = %e, "Failed to save index after replay");
                }
            }
        }

        report.sessions_reconciled = self.reconcile_counts(&view, &sessions).await;

        wal.writer.sync()?;
        wal.outstanding = report.left_pending as u64;
        if report.left_pending == 0 && !quarantine_failed && !wal.writer.is_empty() {
            wal.writer.truncate()?;
            report.compacted = true;
        }

        info!(
            scanned = report.scanned,
            replayed = report.replayed,
            already_present = report.already_present,
            quarantined = report.quarantined,
            rejected_lines = report.rejected_lines,
            left_pending = report.left_pending,
            sessions_reconciled = report.sessions_reconciled,
            compacted = report.compacted,
            "WAL recovery complete"
        );
        Ok(report)
    }

    fn replay_entry(
        &self,
        entry: &WalEntry,
        view: &CatalogView,
        sessions: &mut HashMap<String, ReplaySession>,
        wal: &mut WalState,
        quarantine: &mut Quarantine,
    ) -> ReplayOutcome {
        let mut outcome = ReplayOutcome::new(entry);

        if let Err(cause) = self.check_entry(entry, view) {
            self.quarantine_entry(entry, &cause, wal, quarantine, &mut outcome);
            return outcome;
        }

        if !sessions.contains_key(&entry.session_id) {
            match load_tail_state(&self.layout, &entry.session_id, self.config.index_interval) {
                Ok(state) => {
                    sessions.insert(
                        entry.session_id.clone(),
                        ReplaySession {
                            next_sequence: state.summary.record_count,
                            log_len: state.summary.end_offset,
                            index: state.index,
                            file: None,
                            index_dirty: state.index_dirty,
                            replayed: false,
                        },
                    );
                }
                Err(e) => {
                    error!(session_id = %entry.session_id, error = %e, "Cannot open session log for replay");
                    outcome.note = Some(e.to_string());
                    return outcome;
                }
            }
        }
        let Some(session) = sessions.get_mut(&entry.session_id) else {
            return outcome;
        };

        if entry.sequence > session.next_sequence {
            let cause = StoreError::corrupt_wal_entry(
                entry.wal_seq,
                format!(
                    "sequence {} would leave a gap after {}",
                    entry.sequence, session.next_sequence
                ),
            );
            self.quarantine_entry(entry, &cause, wal, quarantine, &mut outcome);
            return outcome;
        }

        if entry.sequence == session.next_sequence {
            if let Err(e) = append_replayed(self, entry, session) {
                error!(wal_seq = entry.wal_seq, error = %e, "Failed to replay WAL entry");
                outcome.note = Some(e.to_string());
                return outcome;
            }
            outcome.replayed = true;
            outcome.advance(ReplayState::Applied);
        } else {
            outcome.note = Some("already present".to_string());
        }

        match wal
            .writer
            .mark_committed(entry.wal_seq, &entry.session_id, entry.sequence)
        {
            Ok(_) => outcome.advance(ReplayState::Committed),
            Err(e) => {
                error!(wal_seq = entry.wal_seq, error = %e, "Failed to mark WAL entry committed");
                outcome.note = Some(e.to_string());
            }
        }
        outcome
    }

    /// Reasons an entry can never be applied.
    fn check_entry(&self, entry: &WalEntry, view: &CatalogView) -> StoreResult<()> {
        let corrupt = |reason: String| StoreError::corrupt_wal_entry(entry.wal_seq, reason);
        SessionId::parse(&entry.session_id).map_err(|e| corrupt(e.to_string()))?;
        if !view.contains(&entry.session_id) {
            return Err(corrupt(format!("session {} is not in the catalog", entry.session_id)));
        }
        let record = self
            .codec
            .decode(&entry.payload)
            .map_err(|e| corrupt(format!("undecodable payload: {e}")))?;
        if record.session_id != entry.session_id || record.sequence != entry.sequence {
            return Err(corrupt(format!(
                "payload is {}#{} but entry targets {}#{}",
                record.session_id, record.sequence, entry.session_id, entry.sequence
            )));
        }
        Ok(())
    }

    fn quarantine_entry(
        &self,
        entry: &WalEntry,
        cause: &StoreError,
        wal: &mut WalState,
        quarantine: &mut Quarantine,
        outcome: &mut ReplayOutcome,
    ) {
        error!(
            session_id = %entry.session_id,
            sequence = entry.sequence,
            error = %cause,
            "Quarantining WAL entry"
        );
        let reason = match cause {
            StoreError::CorruptWalEntry { reason, .. } => reason.clone(),
            other => other.to_string(),
        };
        let reason = reason.as_str();
        let written = quarantine.write(&QuarantineLine {
            quarantined_at: Utc::now(),
            kind: cause.kind(),
            line_number: None,
            wal_seq: Some(entry.wal_seq),
            session_id: Some(&entry.session_id),
            sequence: Some(entry.sequence),
            reason,
            raw: &entry.payload,
        });
        if let Err(e) = written {
            error!(wal_seq = entry.wal_seq, error = %e, "Failed to write quarantined entry");
            outcome.note = Some(e.to_string());
            return;
        }
        if let Err(e) = wal
            .writer
            .mark_aborted(entry.wal_seq, &entry.session_id, entry.sequence, reason)
        {
            warn!(wal_seq = entry.wal_seq, error = %e, "Failed to abort quarantined WAL entry");
        }
        outcome.note = Some(reason.to_string());
        outcome.advance(ReplayState::Quarantined);
    }

    /// Correct cached message counts in the catalog. Returns how many
    /// sessions were corrected.
    async fn reconcile_counts(
        &self,
        view: &CatalogView,
        replayed: &HashMap<String, ReplaySession>,
    ) -> usize {
        let mut reconciled = 0;
        for session in view.recent(None) {
            let (count, at) = match replayed.get(&session.session_id) {
                Some(state) => {
                    let at = if state.replayed { Utc::now() } else { session.updated_at };
                    (state.next_sequence, at)
                }
                None => {
                    match load_tail_state(&self.layout, &session.session_id, self.config.index_interval) {
                        Ok(state) => {
                            if state.index_dirty && self.layout.log_path(&session.session_id).exists() {
                                if let Err(e) = state.index.save(&self.layout.index_path(&session.session_id)) {
                                    warn!(session_id = %session.session_id, error = %e, "Failed to save index");
                                }
                            }
                            (state.summary.record_count, session.updated_at)
                        }
                        Err(e) => {
                            warn!(session_id = %session.session_id, error = %e, "Cannot count session records");
                            continue;
                        }
                    }
                }
            };

            if count == session.message_count {
                continue;
            }
            let event = CatalogEvent::Touched {
                session_id: session.session_id.clone(),
                at,
                message_count: count,
            };
            match self.catalog.append(&event).await {
                Ok(()) => {
                    info!(
                        session_id = %session.session_id,
                        cached = session.message_count,
                        actual = count,
                        "Reconciled message count"
                    );
                    reconciled += 1;
                }
                Err(e) => warn!(session_id = %session.session_id, error = %e, "Failed to reconcile count"),
            }
        }
        reconciled
    }
}

fn append_replayed(store: &LogStore, entry: &WalEntry, session: &mut ReplaySession) -> StoreResult<()> {
    if session.file.is_none() {
        session.file = Some(open_append(&store.layout.log_path(&entry.session_id))?);
    }
    let Some(file) = session.file.as_mut() else {
        return Err(StoreError::invalid("session log is not open"));
    };

    let mut line = Vec::with_capacity(entry.payload.len() + 1);
    line.extend_from_slice(entry.payload.as_bytes());
    line.push(b'\n');
    if let Err(e) = file.write_all(&line).and_then(|_| file.sync_data()) {
        if let Err(trunc) = file.set_len(session.log_len) {
            error!(error = %trunc, "Failed to roll back partial replay");
        }
        return Err(e.into());
    }

    let offset = session.log_len;
    session.log_len += line.len() as u64;
    session.next_sequence += 1;
    session.replayed = true;
    if session.index.observe(entry.sequence, offset) {
        session.index_dirty = true;
    }
    info!(
        session_id = %entry.session_id,
        sequence = entry.sequence,
        wal_seq = entry.wal_seq,
        "Replayed WAL entry"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use ReplayState::*;
        assert!(Pending.can_advance_to(Applied));
        assert!(Pending.can_advance_to(Committed));
        assert!(Pending.can_advance_to(Quarantined));
        assert!(Applied.can_advance_to(Committed));

        assert!(!Applied.can_advance_to(Quarantined));
        assert!(!Committed.can_advance_to(Pending));
        assert!(!Quarantined.can_advance_to(Committed));
        assert!(Committed.is_terminal() && Quarantined.is_terminal());
        assert!(!Pending.is_terminal() && !Applied.is_terminal());
    }

    #[test]
    fn test_outcome_ignores_illegal_transition() {
        let entry = WalEntry::append("s", 0, "{}");
        let mut outcome = ReplayOutcome::new(&entry);
        outcome.advance(ReplayState::Quarantined);
        outcome.advance(ReplayState::Committed);
        assert_eq!(outcome.state, ReplayState::Quarantined);
    }
}
