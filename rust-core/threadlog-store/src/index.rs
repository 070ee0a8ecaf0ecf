// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ThreadLog Store - Sparse session index
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Maps every N-th sequence of a session log to the byte offset where its
// line starts. The index is derived data: it is stamped with a version and a
// CRC32 over its contents, replaced on disk by atomic rename, and can always
// be rebuilt by scanning the log from offset 0.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::Path;

use crc32fast::Hasher as Crc32Hasher;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::logfile::LineCursor;

/// On-disk format version.
pub const INDEX_VERSION: u32 = 1;

/// One sampled position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub sequence: u64,
    pub offset: u64,
}

/// The sparse index of one session log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIndex {
    pub version: u32,
    pub interval: u64,
    pub checksum: u32,
    pub entries: Vec<IndexEntry>,
}

#[derive(Serialize)]
struct IndexFile<'a> {
    version: u32,
    interval: u64,
    checksum: u32,
    entries: &'a [IndexEntry],
}

/// What a scan of a log found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogSummary {
    /// The next sequence to assign (last sequence seen + 1).
    pub record_count: u64,
    /// Offset just past the last complete line scanned.
    pub end_offset: u64,
}

/// The only field the index cares about when scanning a log line.
#[derive(Deserialize)]
struct SequenceOnly {
    sequence: u64,
}

/// Sequence number of an encoded record line, if it parses.
pub fn line_sequence(line: &[u8]) -> Option<u64> {
    serde_json::from_slice::<SequenceOnly>(line)
        .ok()
        .map(|s| s.sequence)
}

impl SessionIndex {
    /// An empty index sampling every `interval` sequences.
    pub fn new(interval: u64) -> Self {
        Self {
            version: INDEX_VERSION,
            interval: interval.max(1),
            checksum: 0,
            entries: Vec::new(),
        }
    }

    /// Whether `sequence` falls on the sampling interval.
    pub fn should_sample(&self, sequence: u64) -> bool {
        sequence % self.interval == 0
    }

    /// Record a position if it falls on the interval. Returns `true` if an
    /// entry was added.
    pub fn observe(&mut self, sequence: u64, offset: u64) -> bool {
        if !self.should_sample(sequence) {
            return false;
        }
        if self.entries.last().is_some_and(|last| last.sequence >= sequence) {
            return false;
        }
        self.entries.push(IndexEntry { sequence, offset });
        true
    }

    /// The nearest entry at or before `sequence`.
    pub fn floor(&self, sequence: u64) -> Option<IndexEntry> {
        let idx = self.entries.partition_point(|e| e.sequence <= sequence);
        idx.checked_sub(1).map(|i| self.entries[i])
    }

    pub fn last(&self) -> Option<IndexEntry> {
        self.entries.last().copied()
    }

    /// The last entry whose line starts before byte `end`.
    pub fn last_within(&self, end: u64) -> Option<IndexEntry> {
        let idx = self.entries.partition_point(|e| e.offset < end);
        idx.checked_sub(1).map(|i| self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// CRC32 over the interval and every entry.
    pub fn compute_checksum(&self) -> u32 {
        let mut hasher = Crc32Hasher::new();
        hasher.update(&self.version.to_le_bytes());
        hasher.update(&self.interval.to_le_bytes());
        for entry in &self.entries {
            hasher.update(&entry.sequence.to_le_bytes());
            hasher.update(&entry.offset.to_le_bytes());
        }
        hasher.finalize()
    }

    /// Load and validate an index. A missing file is `Ok(None)`; a file that
    /// fails validation is `CorruptIndex`.
    pub fn load(path: &Path, session_id: &str) -> StoreResult<Option<Self>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let index: SessionIndex = serde_json::from_slice(&data)
            .map_err(|e| StoreError::corrupt_index(session_id, e.to_string()))?;

        if index.version != INDEX_VERSION {
            return Err(StoreError::corrupt_index(
                session_id,
                format!("unsupported version {}", index.version),
            ));
        }
        if index.interval == 0 {
            return Err(StoreError::corrupt_index(session_id, "zero interval"));
        }
        let actual = index.compute_checksum();
        if actual != index.checksum {
            return Err(StoreError::corrupt_index(
                session_id,
                format!("checksum {:#010x} does not match {actual:#010x}", index.checksum),
            ));
        }
        let ordered = index.entries.windows(2).all(|w| {
            w[0].sequence < w[1].sequence && w[0].offset < w[1].offset
        });
        if !ordered {
            return Err(StoreError::corrupt_index(session_id, "entries out of order"));
        }

        Ok(Some(index))
    }

    /// Write the index atomically: temp file, sync, rename.
    pub fn save(&self, path: &Path) -> StoreResult<()> {
        let file = IndexFile {
            version: self.version,
            interval: self.interval,
            checksum: self.compute_checksum(),
            entries: &self.entries,
        };
        let bytes = serde_json::to_vec(&file)?;

        let tmp = path.with_extension("json.tmp");
        {
            let mut out = File::create(&tmp)?;
            out.write_all(&bytes)?;
            out.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), entries = self.entries.len(), "Saved index");
        Ok(())
    }

    /// Rebuild by scanning `log` from offset 0 up to `end`.
    pub fn build_from_log(log: &Path, interval: u64, end: u64) -> StoreResult<(Self, LogSummary)> {
        let mut index = Self::new(interval);
        let summary = scan_positions(log, 0, 0, end, |sequence, offset| {
            index.observe(sequence, offset);
        })?;
        Ok((index, summary))
    }
}

/// Walk every complete line in `[start, end)`, reporting each decoded
/// sequence and its offset. `base_count` is the record count before `start`.
pub fn scan_positions<F>(
    log: &Path,
    start: u64,
    base_count: u64,
    end: u64,
    mut visit: F,
) -> StoreResult<LogSummary>
where
    F: FnMut(u64, u64),
{
    let mut summary = LogSummary {
        record_count: base_count,
        end_offset: start,
    };
    let Some(mut cursor) = LineCursor::open(log, start, end)? else {
        return Ok(summary);
    };
    while let Some((offset, line)) = cursor.next_line()? {
        if let Some(sequence) = line_sequence(line) {
            visit(sequence, offset);
            summary.record_count = summary.record_count.max(sequence + 1);
        }
    }
    summary.end_offset = cursor.offset();
    Ok(summary)
}

/// Check that the line at `entry.offset` carries `entry.sequence`.
pub fn verify_entry(log: &Path, entry: IndexEntry, end: u64) -> StoreResult<bool> {
    let Some(mut cursor) = LineCursor::open(log, entry.offset, end)? else {
        return Ok(false);
    };
    Ok(match cursor.next_line()? {
        Some((_, line)) => line_sequence(line) == Some(entry.sequence),
        None => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_log(path: &Path, count: u64) -> Vec<u64> {
        let mut offsets = Vec::new();
        let mut data = String::new();
        for seq in 0..count {
            offsets.push(data.len() as u64);
            data.push_str(&format!("{{\"record_id\":{seq},\"sequence\":{seq},\"content\":\"m{seq}\"}}\n"));
        }
        fs::write(path, data).unwrap();
        offsets
    }

    #[test]
    fn test_observe_samples_on_interval() {
        let mut index = SessionIndex::new(4);
        for seq in 0..10 {
            index.observe(seq, seq * 100);
        }
        let sampled: Vec<u64> = index.entries.iter().map(|e| e.sequence).collect();
        assert_eq!(sampled, vec![0, 4, 8]);
        assert!(!index.observe(8, 800), "duplicate sample must be ignored");
    }

    #[test]
    fn test_floor_lookup() {
        let mut index = SessionIndex::new(4);
        for seq in 0..12 {
            index.observe(seq, seq * 10);
        }
        assert_eq!(index.floor(0).unwrap().sequence, 0);
        assert_eq!(index.floor(7).unwrap().sequence, 4);
        assert_eq!(index.floor(8).unwrap().offset, 80);
        assert_eq!(index.floor(1000).unwrap().sequence, 8);
        assert!(SessionIndex::new(4).floor(3).is_none());
        assert_eq!(index.last_within(80).unwrap().sequence, 4);
        assert_eq!(index.last_within(81).unwrap().sequence, 8);
        assert!(index.last_within(0).is_none());
    }

    #[test]
    fn test_build_from_log_matches_offsets() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("log.jsonl");
        let offsets = write_log(&log, 20);
        let end = fs::metadata(&log).unwrap().len();

        let (index, summary) = SessionIndex::build_from_log(&log, 8, end).unwrap();
        assert_eq!(summary.record_count, 20);
        assert_eq!(summary.end_offset, end);
        assert_eq!(index.entries.len(), 3);
        for entry in &index.entries {
            assert_eq!(entry.offset, offsets[entry.sequence as usize]);
            assert!(verify_entry(&log, *entry, end).unwrap());
        }
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.json");
        let mut index = SessionIndex::new(2);
        for seq in 0..6 {
            index.observe(seq, seq * 50);
        }
        index.save(&path).unwrap();

        let loaded = SessionIndex::load(&path, "s").unwrap().unwrap();
        assert_eq!(loaded.entries, index.entries);
        assert_eq!(loaded.checksum, index.compute_checksum());
        assert!(!dir.path().join("index.json.tmp").exists());
    }

    #[test]
    fn test_load_detects_tampering() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.json");
        let mut index = SessionIndex::new(2);
        index.observe(0, 0);
        index.observe(2, 120);
        index.save(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, text.replace("120", "121")).unwrap();
        assert!(matches!(
            SessionIndex::load(&path, "s"),
            Err(StoreError::CorruptIndex { .. })
        ));

        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            SessionIndex::load(&path, "s"),
            Err(StoreError::CorruptIndex { .. })
        ));
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(SessionIndex::load(&dir.path().join("index.json"), "s")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_verify_entry_rejects_wrong_offset() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("log.jsonl");
        let offsets = write_log(&log, 4);
        let end = fs::metadata(&log).unwrap().len();
        let wrong = IndexEntry {
            sequence: 2,
            offset: offsets[1],
        };
        assert!(!verify_entry(&log, wrong, end).unwrap());
    }
}
