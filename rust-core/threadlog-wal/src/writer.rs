// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ThreadLog Write-Ahead Log - Append-only writer
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The `WalWriter` appends entries to the single shared WAL file, assigns WAL
// sequence numbers and controls fsync behavior according to the configured
// `SyncMode`. On open it repairs a torn trailing line left by a crash so the
// next append always starts on a fresh line.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::entry::{WalEntry, WalOperation};
use crate::error::WalResult;

// ---------------------------------------------------------------------------
// SyncMode
// ---------------------------------------------------------------------------

/// Controls how aggressively the WAL writer calls `fsync` to flush pending
/// appends to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Call `fsync` after every pending append. Acknowledged writes survive
    /// a crash.
    Fsync,

    /// Call `fsync` at most once per the specified duration. Appends between
    /// syncs may be lost on crash.
    Periodic(Duration),

    /// Never explicitly call `fsync`; rely on the OS page cache.
    Async,
}

// ---------------------------------------------------------------------------
// WalWriter
// ---------------------------------------------------------------------------

/// An append-only writer for the shared WAL file.
pub struct WalWriter {
    /// Path of the WAL file.
    path: PathBuf,

    /// Open handle in append mode.
    file: File,

    /// Next WAL sequence number to assign.
    next_wal_seq: u64,

    /// Current file length in bytes.
    len: u64,

    /// How fsync is managed.
    sync_mode: SyncMode,

    /// Timestamp of the last fsync call (for `SyncMode::Periodic`).
    last_sync: Instant,
}

impl WalWriter {
    /// Open the WAL file at `path`, creating it (and its parent directory)
    /// if needed.
    ///
    /// An existing file is scanned to resume the WAL sequence counter. A
    /// trailing partial line (crash mid-write) is truncated away.
    pub fn open(path: impl AsRef<Path>, sync_mode: SyncMode) -> WalResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                info!(dir = %parent.display(), "Created WAL directory");
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let data = fs::read(&path)?;
        let complete_len = match data.iter().rposition(|&b| b == b'\n') {
            Some(pos) => pos + 1,
            None => 0,
        };

        if complete_len < data.len() {
            warn!(
                path = %path.display(),
                torn_bytes = data.len() - complete_len,
                "Truncating torn trailing WAL line"
            );
            file.set_len(complete_len as u64)?;
            file.sync_all()?;
        }

        let last_wal_seq = String::from_utf8_lossy(&data[..complete_len])
            .lines()
            .filter_map(|line| WalEntry::decode_line(line).ok())
            .map(|entry| entry.wal_seq)
            .max()
            .unwrap_or(0);

        info!(
            path = %path.display(),
            next_wal_seq = last_wal_seq + 1,
            bytes = complete_len,
            "Opened WAL"
        );

        Ok(Self {
            path,
            file,
            next_wal_seq: last_wal_seq + 1,
            len: complete_len as u64,
            sync_mode,
            last_sync: Instant::now(),
        })
    }

    /// Append a pending mutation and flush it according to the sync mode.
    ///
    /// Returns the assigned WAL sequence number.
    pub fn append_pending(
        &mut self,
        session_id: &str,
        sequence: u64,
        payload: &str,
    ) -> WalResult<u64> {
        let wal_seq = self.write_entry(WalEntry::append(session_id, sequence, payload))?;
        self.maybe_sync()?;
        debug!(wal_seq, session_id, sequence, "Appended pending WAL entry");
        Ok(wal_seq)
    }

    /// Record that the append with WAL sequence `target` reached its session
    /// log.
    ///
    /// Markers are not synced on their own: a lost commit marker only costs an
    /// idempotent presence check during the next recovery.
    pub fn mark_committed(&mut self, target: u64, session_id: &str, sequence: u64) -> WalResult<u64> {
        self.write_entry(WalEntry::marker(
            WalOperation::Commit,
            target,
            session_id,
            sequence,
            "",
        ))
    }

    /// Record that the append with WAL sequence `target` must never be
    /// applied. Aborts are synced, because replaying an aborted append would
    /// resurrect a write the caller saw fail.
    pub fn mark_aborted(
        &mut self,
        target: u64,
        session_id: &str,
        sequence: u64,
        reason: &str,
    ) -> WalResult<u64> {
        let wal_seq = self.write_entry(WalEntry::marker(
            WalOperation::Abort,
            target,
            session_id,
            sequence,
            reason,
        ))?;
        self.sync()?;
        Ok(wal_seq)
    }

    /// Force an immediate `fsync` of the WAL file, regardless of the
    /// configured `SyncMode`.
    pub fn sync(&mut self) -> WalResult<()> {
        self.file.sync_data()?;
        self.last_sync = Instant::now();
        Ok(())
    }

    /// Discard every line in the WAL.
    ///
    /// Callers must have established that every append is resolved and that
    /// no write is in flight.
    pub fn truncate(&mut self) -> WalResult<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        self.len = 0;
        info!(path = %self.path.display(), "WAL truncated");
        Ok(())
    }

    /// Returns the sequence number that will be assigned to the next entry.
    pub fn next_wal_seq(&self) -> u64 {
        self.next_wal_seq
    }

    /// Returns the current size of the WAL file in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` if the WAL file holds no lines.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the path of the WAL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    fn write_entry(&mut self, mut entry: WalEntry) -> WalResult<u64> {
        let wal_seq = self.next_wal_seq;
        entry.wal_seq = wal_seq;

        let mut line = entry.encode_line()?;
        line.push('\n');

        self.file.write_all(line.as_bytes())?;
        self.next_wal_seq += 1;
        self.len += line.len() as u64;
        Ok(wal_seq)
    }

    /// Conditionally call fsync based on the configured sync mode.
    fn maybe_sync(&mut self) -> WalResult<()> {
        match self.sync_mode {
            SyncMode::Fsync => self.sync()?,
            SyncMode::Periodic(interval) => {
                if self.last_sync.elapsed() >= interval {
                    self.sync()?;
                }
            }
            SyncMode::Async => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn wal_path(dir: &TempDir) -> PathBuf {
        dir.path().join("wal.jsonl")
    }

    #[test]
    fn test_open_fresh_file() {
        let dir = TempDir::new().unwrap();
        let writer = WalWriter::open(wal_path(&dir), SyncMode::Async).unwrap();
        assert_eq!(writer.next_wal_seq(), 1);
        assert!(writer.is_empty());
    }

    #[test]
    fn test_append_increments_sequence() {
        let dir = TempDir::new().unwrap();
        let mut writer = WalWriter::open(wal_path(&dir), SyncMode::Async).unwrap();

        let seq1 = writer.append_pending("s", 0, "a").unwrap();
        let seq2 = writer.append_pending("s", 1, "b").unwrap();
        let seq3 = writer.mark_committed(seq1, "s", 0).unwrap();

        assert_eq!((seq1, seq2, seq3), (1, 2, 3));
        assert_eq!(writer.next_wal_seq(), 4);
        assert!(!writer.is_empty());
    }

    #[test]
    fn test_resume_after_close() {
        let dir = TempDir::new().unwrap();
        {
            let mut writer = WalWriter::open(wal_path(&dir), SyncMode::Fsync).unwrap();
            writer.append_pending("s", 0, "a").unwrap();
            writer.append_pending("s", 1, "b").unwrap();
            writer.append_pending("s", 2, "c").unwrap();
        }

        let mut writer = WalWriter::open(wal_path(&dir), SyncMode::Fsync).unwrap();
        let seq = writer.append_pending("s", 3, "d").unwrap();
        assert_eq!(seq, 4, "Expected WAL sequence 4 after resuming, got {seq}");
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = wal_path(&dir);
        {
            let mut writer = WalWriter::open(&path, SyncMode::Fsync).unwrap();
            writer.append_pending("s", 0, "a").unwrap();
        }
        let intact_len = fs::metadata(&path).unwrap().len();

        // Simulate a crash halfway through writing a second line.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"crc\":12,\"entry\":{\"wal_").unwrap();
        drop(file);

        let mut writer = WalWriter::open(&path, SyncMode::Fsync).unwrap();
        assert_eq!(writer.len(), intact_len);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);

        writer.append_pending("s", 1, "b").unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        for line in text.lines() {
            WalEntry::decode_line(line).unwrap();
        }
    }

    #[test]
    fn test_truncate_empties_file() {
        let dir = TempDir::new().unwrap();
        let path = wal_path(&dir);
        let mut writer = WalWriter::open(&path, SyncMode::Async).unwrap();
        let seq = writer.append_pending("s", 0, "a").unwrap();
        writer.mark_committed(seq, "s", 0).unwrap();

        writer.truncate().unwrap();
        assert!(writer.is_empty());
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);

        // Appends keep working after truncation.
        writer.append_pending("s", 1, "b").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_open_creates_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("wal.jsonl");
        let _writer = WalWriter::open(&path, SyncMode::Async).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_periodic_sync_mode() {
        let dir = TempDir::new().unwrap();
        let mut writer = WalWriter::open(
            wal_path(&dir),
            SyncMode::Periodic(Duration::from_millis(10)),
        )
        .unwrap();

        for i in 0..5 {
            writer.append_pending("s", i, "x").unwrap();
        }
        writer.sync().unwrap();
    }
}
