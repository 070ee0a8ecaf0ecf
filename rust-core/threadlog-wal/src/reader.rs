// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ThreadLog Write-Ahead Log - Reader for crash recovery
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The `WalReader` reads the WAL file once at startup and classifies every
// line: appends that were never resolved by a marker are pending, lines that
// fail to decode are rejected, and a partial final line (crash mid-write) is
// reported as a torn tail and ignored.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::entry::{WalEntry, WalOperation};
use crate::error::WalResult;

// ---------------------------------------------------------------------------
// Scan results
// ---------------------------------------------------------------------------

/// A complete WAL line that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedLine {
    /// 1-based line number in the WAL file.
    pub line_number: usize,
    /// Byte offset of the start of the line.
    pub offset: u64,
    /// The raw line text (lossily decoded).
    pub raw: String,
    /// Why decoding failed.
    pub reason: String,
}

/// The classified contents of a WAL file.
#[derive(Debug, Clone, Default)]
pub struct WalScan {
    /// Appends with no commit or abort marker, ordered by WAL sequence.
    pub pending: Vec<WalEntry>,
    /// Number of appends resolved by a commit marker.
    pub committed: usize,
    /// Number of appends resolved by an abort marker.
    pub aborted: usize,
    /// Complete lines that failed to decode.
    pub rejected: Vec<RejectedLine>,
    /// Whether the file ended with a partial line.
    pub torn_tail: bool,
}

impl WalScan {
    /// Returns `true` when nothing in the WAL still needs attention.
    pub fn is_resolved(&self) -> bool {
        self.pending.is_empty() && self.rejected.is_empty()
    }
}

// ---------------------------------------------------------------------------
// WalReader
// ---------------------------------------------------------------------------

/// A reader over the shared WAL file.
pub struct WalReader {
    path: PathBuf,
}

impl WalReader {
    /// Prepare to read the WAL at `path`. A missing file reads as empty.
    pub fn open(path: impl AsRef<Path>) -> WalResult<Self> {
        Ok(Self {
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Read and classify every line of the WAL.
    pub fn scan(&self) -> WalResult<WalScan> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(WalScan::default()),
            Err(e) => return Err(e.into()),
        };

        let mut scan = WalScan::default();
        let mut appends: BTreeMap<u64, WalEntry> = BTreeMap::new();
        let mut commits: HashSet<u64> = HashSet::new();
        let mut aborts: HashSet<u64> = HashSet::new();

        let mut offset = 0usize;
        let mut line_number = 0usize;

        while offset < data.len() {
            let Some(rel_end) = data[offset..].iter().position(|&b| b == b'\n') else {
                debug!(
                    offset,
                    bytes = data.len() - offset,
                    path = %self.path.display(),
                    "Torn line at end of WAL (expected after crash)"
                );
                scan.torn_tail = true;
                break;
            };
            line_number += 1;

            let raw = &data[offset..offset + rel_end];
            let line_offset = offset;
            offset += rel_end + 1;

            let text = String::from_utf8_lossy(raw);
            if text.trim().is_empty() {
                continue;
            }

            match WalEntry::decode_line(&text) {
                Ok(entry) => match entry.operation {
                    WalOperation::Append => {
                        appends.insert(entry.wal_seq, entry);
                    }
                    WalOperation::Commit => {
                        commits.extend(entry.target);
                    }
                    WalOperation::Abort => {
                        aborts.extend(entry.target);
                    }
                },
                Err(e) => {
                    warn!(
                        line_number,
                        offset = line_offset,
                        error = %e,
                        path = %self.path.display(),
                        "Unreadable WAL line"
                    );
                    scan.rejected.push(RejectedLine {
                        line_number,
                        offset: line_offset as u64,
                        raw: text.into_owned(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        for (wal_seq, entry) in appends {
            if aborts.contains(&wal_seq) {
                scan.aborted += 1;
            } else if commits.contains(&wal_seq) {
                scan.committed += 1;
            } else {
                scan.pending.push(entry);
            }
        }

        debug!(
            pending = scan.pending.len(),
            committed = scan.committed,
            aborted = scan.aborted,
            rejected = scan.rejected.len(),
            "Scanned WAL"
        );

        Ok(scan)
    }

    /// Count appends that are still pending.
    pub fn pending_count(&self) -> WalResult<usize> {
        Ok(self.scan()?.pending.len())
    }
}
