// SPDX-License-Identifier: PMPL-1.0-or-later
//! ThreadLog Store
//!
//! A durable, append-only conversation log store. Each session owns a
//! line-delimited JSON log, a sparse byte-offset index and its entries in a
//! shared write-ahead log; a master catalog records session lifecycle
//! events. Every file stays readable with ordinary line-oriented tools.
//!
//! Writes to one session are serialized by that session's write lock and go
//! through the WAL before they reach the session log. Readers never lock:
//! they see the committed prefix of a log and never a partial record. On
//! open, [`LogStore`] replays any WAL entry that was logged but not
//! confirmed applied.
//!
//! ```rust,no_run
//! use threadlog_store::{Content, LogStore, PageRequest, StoreConfig};
//!
//! # async fn demo() -> threadlog_store::StoreResult<()> {
//! let store = LogStore::open(StoreConfig::with_data_dir("/var/lib/threadlog")).await?;
//! let session = store.create_session(Some("Incident review".into()), None).await?;
//! store.append_message(session.as_str(), "user", Content::new("hello"), None).await?;
//! let page = store.get_messages(session.as_str(), &PageRequest::latest(10)).await?;
//! assert_eq!(page.records.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod id;
pub mod index;
pub mod layout;
pub mod logfile;
pub mod reader;
pub mod rebuild;
pub mod record;
pub mod recovery;
pub mod search;
pub mod sessions;
pub mod store;
pub mod writer;

pub use catalog::{CatalogEvent, Session, SessionStatus};
pub use config::{StoreConfig, WalSyncPolicy};
pub use error::{StoreError, StoreResult};
pub use id::SessionId;
pub use index::{IndexEntry, SessionIndex};
pub use reader::{Page, PageRequest, MAX_PAGE_SIZE};
pub use rebuild::{IndexReport, RebuildReport};
pub use record::{Content, Metadata, Record, RecordCodec};
pub use recovery::{RecoveryReport, ReplayOutcome, ReplayState};
pub use search::{MessageMatch, MessageMatches, SearchOptions, TitleMatch};
pub use sessions::CleanupReport;
pub use store::{LogStore, StoreStats};
