// SPDX-License-Identifier: PMPL-1.0-or-later
//! Session identifiers.
//!
//! A `SessionId` is 16 hex digits of microseconds since the Unix epoch, a
//! dash, then 8 hex digits of randomness: `0006191c5e3a41f2-9b1c07d4`. The
//! timestamp part is forced to increase across calls within one process, so
//! ids sort lexicographically in creation order.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Maximum accepted identifier length.
pub const MAX_SESSION_ID_LEN: usize = 64;

static LAST_MICROS: AtomicU64 = AtomicU64::new(0);

/// Unique, sortable identifier of a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh identifier, strictly greater than any generated
    /// earlier in this process.
    pub fn generate() -> Self {
        let now = Utc::now().timestamp_micros().max(0) as u64;
        let mut last = LAST_MICROS.load(Ordering::Relaxed);
        let micros = loop {
            let next = now.max(last + 1);
            match LAST_MICROS.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => break next,
                Err(actual) => last = actual,
            }
        };
        let random = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{micros:016x}-{}", &random[..8]))
    }

    /// Validate an identifier supplied by a caller.
    ///
    /// Ids become directory names, so only ASCII alphanumerics, `-` and `_`
    /// are accepted.
    pub fn parse(raw: &str) -> StoreResult<Self> {
        if raw.is_empty() {
            return Err(StoreError::invalid("session_id must not be empty"));
        }
        if raw.len() > MAX_SESSION_ID_LEN {
            return Err(StoreError::invalid(format!(
                "session_id longer than {MAX_SESSION_ID_LEN} characters"
            )));
        }
        if !raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(StoreError::invalid(format!(
                "session_id contains unsupported characters: {raw}"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// Get the ID as a string reference
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_sort_in_creation_order() {
        let ids: Vec<SessionId> = (0..200).map(|_| SessionId::generate()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        sorted.dedup();
        assert_eq!(sorted.len(), 200);
    }

    #[test]
    fn test_generated_id_shape() {
        let id = SessionId::generate();
        let (time, rand) = id.as_str().split_once('-').unwrap();
        assert_eq!(time.len(), 16);
        assert_eq!(rand.len(), 8);
        assert!(SessionId::parse(id.as_str()).is_ok());
    }

    #[test]
    fn test_parse_rejects_path_characters() {
        assert!(SessionId::parse("../etc").is_err());
        assert!(SessionId::parse("a/b").is_err());
        assert!(SessionId::parse("").is_err());
        assert!(SessionId::parse(&"x".repeat(65)).is_err());
        assert!(SessionId::parse("legacy_session-01").is_ok());
    }
}
