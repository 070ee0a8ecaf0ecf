// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Error types for the ThreadLog store.
//
// One enum covers the whole store taxonomy. Caller errors (`NotFound`,
// `InvalidArgument`, `RecordTooLarge`) are returned as-is, `LockTimeout` is
// retried internally before it surfaces, `CorruptIndex` is absorbed by the
// reader's fallback scan, and `Io`/`StorageFull` fail only the affected
// operation.

use thiserror::Error;
use threadlog_wal::WalError;

/// Errors that can occur when interacting with the log store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested session or record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A title, metadata map, query or identifier was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Record content exceeds the configured maximum.
    #[error("record too large: {size} bytes (max: {max})")]
    RecordTooLarge {
        /// Actual content size in bytes.
        size: usize,
        /// Maximum allowed content size in bytes.
        max: usize,
    },

    /// The disk quota is exhausted or the filesystem is full.
    #[error("storage full: {0}")]
    StorageFull(String),

    /// The per-session write lock could not be acquired in time.
    #[error("timed out waiting for the write lock on session {session_id} after {attempts} attempt(s)")]
    LockTimeout {
        /// The contended session.
        session_id: String,
        /// How many acquisition attempts were made.
        attempts: u32,
    },

    /// A session index failed its version or checksum validation.
    #[error("corrupt index for session {session_id}: {reason}")]
    CorruptIndex {
        /// The session whose index is unusable.
        session_id: String,
        /// What the validation found.
        reason: String,
    },

    /// A WAL entry can never be applied and was quarantined by recovery.
    #[error("corrupt WAL entry {wal_seq}: {reason}")]
    CorruptWalEntry {
        /// The entry's WAL sequence number.
        wal_seq: u64,
        /// What was wrong with the entry.
        reason: String,
    },

    /// An underlying filesystem error, surfaced verbatim.
    #[error("I/O error: {0}")]
    Io(std::io::Error),

    /// The WAL itself failed (opening, scanning or appending).
    #[error("WAL error: {0}")]
    Wal(WalError),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for store results.
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Stable snake_case code for the error, used in tool responses.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "not_found",
            StoreError::InvalidArgument(_) => "invalid_argument",
            StoreError::RecordTooLarge { .. } => "record_too_large",
            StoreError::StorageFull(_) => "storage_full",
            StoreError::LockTimeout { .. } => "lock_timeout",
            StoreError::CorruptIndex { .. } => "corrupt_index",
            StoreError::CorruptWalEntry { .. } => "corrupt_wal_entry",
            StoreError::Io(_) | StoreError::Wal(_) => "io_failure",
            StoreError::Serialization(_) => "serialization",
        }
    }

    /// Whether the store itself retries this error before surfacing it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::LockTimeout { .. })
    }

    /// Whether the caller supplied something the store will never accept.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound(_)
                | StoreError::InvalidArgument(_)
                | StoreError::RecordTooLarge { .. }
        )
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        StoreError::InvalidArgument(message.into())
    }

    pub(crate) fn corrupt_wal_entry(wal_seq: u64, reason: impl Into<String>) -> Self {
        StoreError::CorruptWalEntry {
            wal_seq,
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt_index(session_id: &str, reason: impl Into<String>) -> Self {
        StoreError::CorruptIndex {
            session_id: session_id.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::StorageFull {
            StoreError::StorageFull(err.to_string())
        } else {
            StoreError::Io(err)
        }
    }
}

impl From<WalError> for StoreError {
    fn from(err: WalError) -> Self {
        match err {
            WalError::Io(io) => StoreError::from(io),
            other => StoreError::Wal(other),
        }
    }
}
