// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ThreadLog Write-Ahead Log (WAL) crate
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Provides crash recovery for the ThreadLog conversation store by recording
// every record append in a single shared, append-only WAL file before it is
// written to its session log. On restart the WAL is scanned and every append
// without a resolving marker is handed to the store's recovery manager.
//
// # Format
//
// One JSON object per line, so the file can be read with ordinary
// line-oriented tools:
//
// ```text
// {"crc":<u32>,"entry":{"wal_seq":1,"timestamp":"...","operation":"append",
//   "session_id":"...","sequence":0,"target":null,"payload":"<record line>"}}
// {"crc":<u32>,"entry":{"wal_seq":2,...,"operation":"commit","target":1,...}}
// ```
//
// An append is *pending* until a `commit` or `abort` marker names its
// `wal_seq`. A trailing line without a newline is a torn write and is
// ignored by the reader and truncated by the writer.
//
// ## Usage
//
// ```no_run
// use threadlog_wal::{SyncMode, WalReader, WalWriter};
//
// let mut writer = WalWriter::open("/tmp/threadlog/wal.jsonl", SyncMode::Fsync).unwrap();
// let wal_seq = writer.append_pending("session-1", 0, "{\"content\":\"hi\"}").unwrap();
// // ... append the record to the session log ...
// writer.mark_committed(wal_seq, "session-1", 0).unwrap();
//
// let scan = WalReader::open("/tmp/threadlog/wal.jsonl").unwrap().scan().unwrap();
// assert!(scan.pending.is_empty());
// ```

pub mod entry;
pub mod error;
pub mod reader;
pub mod writer;

pub use entry::{compute_crc32, WalEntry, WalOperation, MAX_LINE_BYTES};
pub use error::{WalError, WalResult};
pub use reader::{RejectedLine, WalReader, WalScan};
pub use writer::{SyncMode, WalWriter};
