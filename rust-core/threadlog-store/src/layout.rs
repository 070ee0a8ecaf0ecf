// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ThreadLog Store - On-disk layout
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
//   {data_dir}/catalog.jsonl
//   {data_dir}/wal.jsonl
//   {data_dir}/wal.jsonl.rejected
//   {data_dir}/sessions/{session_id}/log.jsonl
//   {data_dir}/sessions/{session_id}/index.json

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::StoreResult;

/// Resolves every path the store reads or writes.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the root and sessions directories if missing.
    pub fn ensure(&self) -> StoreResult<()> {
        let sessions = self.sessions_dir();
        if !sessions.exists() {
            fs::create_dir_all(&sessions)?;
            info!(dir = %self.root.display(), "Created data directory");
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.root.join("catalog.jsonl")
    }

    pub fn wal_path(&self) -> PathBuf {
        self.root.join("wal.jsonl")
    }

    pub fn rejected_path(&self) -> PathBuf {
        self.root.join("wal.jsonl.rejected")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(session_id)
    }

    pub fn log_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("log.jsonl")
    }

    pub fn index_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("index.json")
    }

    /// Total bytes of every regular file under the root.
    pub fn disk_usage(&self) -> StoreResult<u64> {
        fn walk(dir: &Path) -> std::io::Result<u64> {
            let mut total = 0;
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let meta = entry.metadata()?;
                if meta.is_dir() {
                    total += walk(&entry.path())?;
                } else {
                    total += meta.len();
                }
            }
            Ok(total)
        }

        if !self.root.exists() {
            return Ok(0);
        }
        Ok(walk(&self.root)?)
    }
}
