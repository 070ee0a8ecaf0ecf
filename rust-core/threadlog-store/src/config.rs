// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ThreadLog Store - Configuration
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Store settings with defaults, an environment overlay (`THREADLOG_*`) and
// validation. Durations are kept as milliseconds so the struct serializes
// to plain JSON.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use threadlog_wal::SyncMode;

use crate::error::{StoreError, StoreResult};

/// How the shared WAL is flushed after a pending append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalSyncPolicy {
    /// fsync after every append.
    Fsync,
    /// fsync at most once per interval, in milliseconds.
    Periodic(u64),
    /// Leave flushing to the OS.
    Async,
}

impl WalSyncPolicy {
    /// The equivalent WAL writer sync mode.
    pub fn to_sync_mode(self) -> SyncMode {
        match self {
            WalSyncPolicy::Fsync => SyncMode::Fsync,
            WalSyncPolicy::Periodic(ms) => SyncMode::Periodic(Duration::from_millis(ms)),
            WalSyncPolicy::Async => SyncMode::Async,
        }
    }
}

impl FromStr for WalSyncPolicy {
    type Err = StoreError;

    /// Accepts `fsync`, `async` or `periodic:<ms>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "fsync" => Ok(WalSyncPolicy::Fsync),
            "async" => Ok(WalSyncPolicy::Async),
            other => match other.strip_prefix("periodic:") {
                Some(ms) => ms
                    .parse::<u64>()
                    .map(WalSyncPolicy::Periodic)
                    .map_err(|_| StoreError::invalid(format!("invalid periodic interval: {ms}"))),
                None => Err(StoreError::invalid(format!("unknown WAL sync policy: {other}"))),
            },
        }
    }
}

/// Configuration for a [`LogStore`](crate::LogStore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory of every file the store owns.
    pub data_dir: PathBuf,
    /// Index sampling interval: every N-th sequence gets an index entry.
    pub index_interval: u64,
    /// Maximum record content size in bytes.
    pub max_content_bytes: usize,
    /// Maximum encoded metadata size in bytes (sessions and records).
    pub max_metadata_bytes: usize,
    /// Maximum session title length in characters.
    pub max_title_chars: usize,
    /// Maximum record type tag length in characters.
    pub max_type_chars: usize,
    /// Optional disk quota for the whole data directory.
    pub storage_quota_bytes: Option<u64>,
    /// Per-attempt bound on acquiring a session write lock.
    pub lock_timeout_ms: u64,
    /// How many further attempts follow a timed-out acquisition.
    pub lock_retries: u32,
    /// Base backoff between attempts, doubled each retry.
    pub lock_backoff_ms: u64,
    /// WAL flush policy.
    pub wal_sync: WalSyncPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./threadlog-data"),
            index_interval: 16,
            max_content_bytes: 256 * 1024,
            max_metadata_bytes: 16 * 1024,
            max_title_chars: 512,
            max_type_chars: 64,
            storage_quota_bytes: None,
            lock_timeout_ms: 2_000,
            lock_retries: 3,
            lock_backoff_ms: 25,
            wal_sync: WalSyncPolicy::Fsync,
        }
    }
}

impl StoreConfig {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Defaults overlaid with any `THREADLOG_*` environment variables.
    pub fn from_env() -> StoreResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`, keyed by variable name.
    pub fn from_lookup<F>(lookup: F) -> StoreResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup("THREADLOG_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = lookup("THREADLOG_INDEX_INTERVAL") {
            config.index_interval = parse_var("THREADLOG_INDEX_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("THREADLOG_MAX_CONTENT_BYTES") {
            config.max_content_bytes = parse_var("THREADLOG_MAX_CONTENT_BYTES", &v)?;
        }
        if let Some(v) = lookup("THREADLOG_MAX_METADATA_BYTES") {
            config.max_metadata_bytes = parse_var("THREADLOG_MAX_METADATA_BYTES", &v)?;
        }
        if let Some(v) = lookup("THREADLOG_MAX_TITLE_CHARS") {
            config.max_title_chars = parse_var("THREADLOG_MAX_TITLE_CHARS", &v)?;
        }
        if let Some(v) = lookup("THREADLOG_MAX_TYPE_CHARS") {
            config.max_type_chars = parse_var("THREADLOG_MAX_TYPE_CHARS", &v)?;
        }
        if let Some(v) = lookup("THREADLOG_STORAGE_QUOTA_BYTES") {
            config.storage_quota_bytes = Some(parse_var("THREADLOG_STORAGE_QUOTA_BYTES", &v)?);
        }
        if let Some(v) = lookup("THREADLOG_LOCK_TIMEOUT_MS") {
            config.lock_timeout_ms = parse_var("THREADLOG_LOCK_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("THREADLOG_LOCK_RETRIES") {
            config.lock_retries = parse_var("THREADLOG_LOCK_RETRIES", &v)?;
        }
        if let Some(v) = lookup("THREADLOG_LOCK_BACKOFF_MS") {
            config.lock_backoff_ms = parse_var("THREADLOG_LOCK_BACKOFF_MS", &v)?;
        }
        if let Some(v) = lookup("THREADLOG_WAL_SYNC") {
            config.wal_sync = v.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the store cannot run with.
    pub fn validate(&self) -> StoreResult<()> {
        if self.index_interval == 0 {
            return Err(StoreError::invalid("index_interval must be at least 1"));
        }
        if self.max_content_bytes == 0 {
            return Err(StoreError::invalid("max_content_bytes must be positive"));
        }
        if self.max_metadata_bytes == 0 {
            return Err(StoreError::invalid("max_metadata_bytes must be positive"));
        }
        if self.max_title_chars == 0 || self.max_type_chars == 0 {
            return Err(StoreError::invalid("title and type bounds must be positive"));
        }
        if self.lock_timeout_ms == 0 {
            return Err(StoreError::invalid("lock_timeout_ms must be positive"));
        }
        Ok(())
    }

    /// Per-attempt lock timeout.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn lock_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.lock_backoff_ms.saturating_mul(factor))
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> StoreResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| StoreError::invalid(format!("{name} has an invalid value: {value}")))
}
