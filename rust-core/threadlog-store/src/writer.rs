// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ThreadLog Store - Message writer
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Appends one record to a session under the session's write lock:
//
//   assign sequence -> WAL pending (flushed) -> log line (flushed)
//     -> publish to readers -> index sample -> catalog touch -> WAL commit
//
// Everything that can reject the record is checked before the WAL append,
// so a rejected record leaves no trace on disk.

use std::io::Write;
use std::sync::atomic::Ordering;

use chrono::Utc;
use tracing::{debug, error, instrument, warn};

use crate::catalog::CatalogEvent;
use crate::error::{StoreError, StoreResult};
use crate::id::SessionId;
use crate::record::{Content, Metadata, Record};
use crate::store::LogStore;

impl LogStore {
    /// Append a record to a session and return it once it is durable.
    ///
    /// The record's `sequence` (and `record_id`) is the next contiguous
    /// position in the session. Oversized content fails with
    /// `RecordTooLarge` before anything is written.
    #[instrument(skip(self, content, metadata))]
    pub async fn append_message(
        &self,
        session_id: &str,
        record_type: &str,
        content: Content,
        metadata: Option<Metadata>,
    ) -> StoreResult<Record> {
        let id = SessionId::parse(session_id)?;
        let metadata = metadata.unwrap_or_default();
        self.codec.check_type(record_type)?;
        self.codec.check_content(&content)?;
        self.codec.check_metadata(&metadata)?;

        let handle = self.session_handle(&id).await?;
        if handle.archived.load(Ordering::Acquire) {
            return Err(StoreError::invalid(format!("session {id} is archived")));
        }

        let mut tail = self.lock_session(&handle).await?;
        if handle.purged.load(Ordering::Acquire) {
            return Err(StoreError::NotFound(format!("session {id}")));
        }
        if handle.archived.load(Ordering::Acquire) {
            return Err(StoreError::invalid(format!("session {id} is archived")));
        }
        self.load_tail(&handle, &mut tail)?;

        let sequence = tail.next_sequence;
        let record = Record {
            record_id: sequence,
            session_id: id.as_str().to_string(),
            sequence,
            record_type: record_type.to_string(),
            content,
            timestamp: Utc::now(),
            metadata,
        };
        let line = self.codec.encode(&record)?;
        self.check_quota(2 * (line.len() as u64 + 1))?;

        // Past this point the write is not cancellable.
        let (wal_seq, wal_growth) = {
            let mut wal = self.wal.lock().await;
            let before = wal.writer.len();
            let wal_seq = wal.writer.append_pending(id.as_str(), sequence, &line)?;
            wal.outstanding += 1;
            (wal_seq, wal.writer.len().saturating_sub(before))
        };

        let offset = tail.log_len;
        let written = match tail.file.as_mut() {
            Some(file) => write_line(file, &line),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "session log is not open",
            )),
        };
        if let Err(e) = written {
            if let Some(file) = tail.file.as_ref() {
                if let Err(trunc) = file.set_len(offset) {
                    error!(error = %trunc, "Failed to roll back partial log append");
                }
            }
            let mut wal = self.wal.lock().await;
            match wal
                .writer
                .mark_aborted(wal_seq, id.as_str(), sequence, &e.to_string())
            {
                Ok(_) => wal.outstanding = wal.outstanding.saturating_sub(1),
                Err(abort) => error!(error = %abort, wal_seq, "Failed to abort WAL entry"),
            }
            return Err(e.into());
        }

        let line_len = line.len() as u64 + 1;
        tail.log_len += line_len;
        tail.next_sequence += 1;
        handle.committed_len.store(tail.log_len, Ordering::Release);

        if tail.index.observe(sequence, offset) {
            handle.publish_index(&tail.index);
            if let Err(e) = tail.index.save(&handle.index_path) {
                warn!(error = %e, "Failed to save index; it will be rebuilt on demand");
            }
        }

        if let Err(e) = self
            .catalog
            .append(&CatalogEvent::Touched {
                session_id: id.as_str().to_string(),
                at: record.timestamp,
                message_count: tail.next_sequence,
            })
            .await
        {
            warn!(error = %e, "Failed to update catalog; count reconciles on restart");
        }

        {
            let mut wal = self.wal.lock().await;
            match wal.writer.mark_committed(wal_seq, id.as_str(), sequence) {
                Ok(_) => wal.outstanding = wal.outstanding.saturating_sub(1),
                Err(e) => warn!(error = %e, wal_seq, "Failed to write WAL commit marker"),
            }
        }

        self.add_usage(line_len + wal_growth);
        debug!(sequence, offset, "Appended record");
        Ok(record)
    }
}

fn write_line(file: &mut std::fs::File, line: &str) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    file.write_all(&buf)?;
    file.sync_data()
}
