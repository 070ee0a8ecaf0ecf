// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ThreadLog Write-Ahead Log - Error types
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Defines all error conditions that can arise during WAL operations including
// I/O failures, checksum mismatches and lines that cannot be parsed.

use thiserror::Error;

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// An I/O error occurred while reading or writing the WAL file.
    #[error("WAL I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CRC32 checksum mismatch detected while decoding a line.
    /// The line parsed as JSON but its body was altered after it was written.
    #[error("CRC mismatch at WAL sequence {wal_seq}: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch {
        /// The WAL sequence number recorded in the damaged line.
        wal_seq: u64,
        /// The CRC32 value stored in the line.
        expected: u32,
        /// The CRC32 value computed from the decoded entry.
        actual: u32,
    },

    /// A line could not be parsed as a WAL entry at all.
    #[error("Malformed WAL line: {0}")]
    Malformed(String),

    /// A line exceeds the maximum accepted length, indicating corruption.
    #[error("WAL line of {length} bytes exceeds maximum {max_length}")]
    LineTooLong {
        /// The length of the offending line in bytes.
        length: usize,
        /// The maximum accepted line length.
        max_length: usize,
    },

    /// JSON serialization of an entry failed.
    #[error("JSON error in WAL entry: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience type alias for WAL results.
pub type WalResult<T> = Result<T, WalError>;
