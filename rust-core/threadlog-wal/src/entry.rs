// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ThreadLog Write-Ahead Log - Entry types
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Defines the WAL entry struct and its operation enum, plus the line codec
// used for the on-disk format. Every entry occupies exactly one line of
// JSON so the WAL stays inspectable with ordinary text tools:
//
//   {"crc":3735928559,"entry":{"wal_seq":7,"timestamp":"...","operation":"append",
//    "session_id":"...","sequence":3,"target":null,"payload":"<record line>"}}
//
// The CRC32 covers the canonical JSON serialization of `entry`. Decoding
// re-serializes the parsed entry and compares checksums, so an edited or
// bit-flipped line is reported as `CrcMismatch` rather than replayed.

use chrono::{DateTime, Utc};
use crc32fast::Hasher as Crc32Hasher;
use serde::{Deserialize, Serialize};

use crate::error::{WalError, WalResult};

/// Maximum accepted line length: 64 MiB. Any longer line is treated as
/// corrupted.
pub const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

// ---------------------------------------------------------------------------
// WalOperation
// ---------------------------------------------------------------------------

/// The kind of line recorded in the WAL.
///
/// `Append` lines carry a pending mutation. `Commit` and `Abort` lines are
/// markers that resolve an earlier `Append` by its `wal_seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalOperation {
    /// A record that must end up in the target session log.
    Append,
    /// The referenced append was applied to the session log.
    Commit,
    /// The referenced append must never be applied (failed write or
    /// quarantined during recovery).
    Abort,
}

impl WalOperation {
    /// Returns `true` for marker operations that resolve an earlier append.
    pub fn is_marker(self) -> bool {
        matches!(self, Self::Commit | Self::Abort)
    }
}

// ---------------------------------------------------------------------------
// WalEntry
// ---------------------------------------------------------------------------

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing WAL sequence number assigned by the writer.
    pub wal_seq: u64,

    /// UTC timestamp of when the entry was created.
    pub timestamp: DateTime<Utc>,

    /// What this line records.
    pub operation: WalOperation,

    /// The session the mutation targets. Markers repeat the session of the
    /// append they resolve so the file can be grepped per session.
    pub session_id: String,

    /// The record sequence inside the target session.
    pub sequence: u64,

    /// For markers, the `wal_seq` of the append being resolved.
    pub target: Option<u64>,

    /// For appends, the encoded record line. For aborts, the reason.
    pub payload: String,
}

/// The serialized shape of one WAL line.
#[derive(Serialize, Deserialize)]
struct WalLine {
    crc: u32,
    entry: WalEntry,
}

impl WalEntry {
    /// Build a pending append. The `wal_seq` is assigned by the writer.
    pub fn append(session_id: impl Into<String>, sequence: u64, payload: impl Into<String>) -> Self {
        Self {
            wal_seq: 0,
            timestamp: Utc::now(),
            operation: WalOperation::Append,
            session_id: session_id.into(),
            sequence,
            target: None,
            payload: payload.into(),
        }
    }

    /// Build a marker resolving the append with `target` as its `wal_seq`.
    pub fn marker(
        operation: WalOperation,
        target: u64,
        session_id: impl Into<String>,
        sequence: u64,
        note: impl Into<String>,
    ) -> Self {
        Self {
            wal_seq: 0,
            timestamp: Utc::now(),
            operation,
            session_id: session_id.into(),
            sequence,
            target: Some(target),
            payload: note.into(),
        }
    }

    /// Encode this entry as a single line of JSON, without the trailing
    /// newline.
    pub fn encode_line(&self) -> WalResult<String> {
        let crc = compute_crc32(&serde_json::to_vec(self)?);
        let line = serde_json::to_string(&WalLine {
            crc,
            entry: self.clone(),
        })?;
        Ok(line)
    }

    /// Decode and verify one WAL line (without the trailing newline).
    pub fn decode_line(line: &str) -> WalResult<Self> {
        if line.len() > MAX_LINE_BYTES {
            return Err(WalError::LineTooLong {
                length: line.len(),
                max_length: MAX_LINE_BYTES,
            });
        }

        let parsed: WalLine =
            serde_json::from_str(line).map_err(|e| WalError::Malformed(e.to_string()))?;

        let actual = compute_crc32(&serde_json::to_vec(&parsed.entry)?);
        if actual != parsed.crc {
            return Err(WalError::CrcMismatch {
                wal_seq: parsed.entry.wal_seq,
                expected: parsed.crc,
                actual,
            });
        }

        if parsed.entry.operation.is_marker() && parsed.entry.target.is_none() {
            return Err(WalError::Malformed(format!(
                "marker at WAL sequence {} has no target",
                parsed.entry.wal_seq
            )));
        }

        Ok(parsed.entry)
    }
}

/// Compute a CRC32 checksum over the given byte slice using the IEEE
/// polynomial (same as zlib/gzip).
pub fn compute_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
