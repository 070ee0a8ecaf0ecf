// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ThreadLog Store - Record codec
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A record is one immutable event in a session log, stored as exactly one
// line of JSON. `Content` and `Metadata` are opaque to the store; the codec
// checks their size bounds before anything is written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};

// ---------------------------------------------------------------------------
// Opaque payload types
// ---------------------------------------------------------------------------

/// Opaque record payload. The size bound is enforced by [`RecordCodec`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Content(String);

impl Content {
    /// Wrap a payload.
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// The payload text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` for an empty payload.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque key/value map attached to sessions and records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(Map<String, Value>);

impl Metadata {
    /// An empty map.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Convert an arbitrary JSON value; only objects (or null) are accepted.
    pub fn from_value(value: Value) -> StoreResult<Self> {
        match value {
            Value::Null => Ok(Self::new()),
            Value::Object(map) => Ok(Self(map)),
            other => Err(StoreError::invalid(format!(
                "metadata must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Insert a key.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Look up a key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns `true` if the map has no keys.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Size of the encoded map in bytes.
    pub fn encoded_len(&self) -> StoreResult<usize> {
        if self.0.is_empty() {
            return Ok(0);
        }
        Ok(serde_json::to_vec(&self.0)?.len())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One immutable event in a session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Identifier within the session. Equal to `sequence`.
    pub record_id: u64,
    /// Owning session.
    pub session_id: String,
    /// 0-based, gapless position in the session log.
    pub sequence: u64,
    /// Free-form tag such as a role or event kind.
    #[serde(rename = "type")]
    pub record_type: String,
    /// Opaque payload.
    pub content: Content,
    /// When the record was written.
    pub timestamp: DateTime<Utc>,
    /// Opaque metadata.
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

// ---------------------------------------------------------------------------
// RecordCodec
// ---------------------------------------------------------------------------

/// Encodes records as single lines and enforces the configured bounds.
#[derive(Debug, Clone, Copy)]
pub struct RecordCodec {
    max_content_bytes: usize,
    max_metadata_bytes: usize,
    max_type_chars: usize,
    max_title_chars: usize,
}

impl RecordCodec {
    /// Build a codec from store settings.
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            max_content_bytes: config.max_content_bytes,
            max_metadata_bytes: config.max_metadata_bytes,
            max_type_chars: config.max_type_chars,
            max_title_chars: config.max_title_chars,
        }
    }

    /// The content bound in bytes.
    pub fn max_content_bytes(&self) -> usize {
        self.max_content_bytes
    }

    pub fn check_content(&self, content: &Content) -> StoreResult<()> {
        if content.len() > self.max_content_bytes {
            return Err(StoreError::RecordTooLarge {
                size: content.len(),
                max: self.max_content_bytes,
            });
        }
        Ok(())
    }

    pub fn check_metadata(&self, metadata: &Metadata) -> StoreResult<()> {
        let size = metadata.encoded_len()?;
        if size > self.max_metadata_bytes {
            return Err(StoreError::invalid(format!(
                "metadata is {size} bytes (max: {})",
                self.max_metadata_bytes
            )));
        }
        Ok(())
    }

    pub fn check_type(&self, record_type: &str) -> StoreResult<()> {
        if record_type.trim().is_empty() {
            return Err(StoreError::invalid("message type must not be empty"));
        }
        if record_type.chars().count() > self.max_type_chars {
            return Err(StoreError::invalid(format!(
                "message type longer than {} characters",
                self.max_type_chars
            )));
        }
        Ok(())
    }

    pub fn check_title(&self, title: &str) -> StoreResult<()> {
        if title.chars().count() > self.max_title_chars {
            return Err(StoreError::invalid(format!(
                "title longer than {} characters",
                self.max_title_chars
            )));
        }
        Ok(())
    }

    /// Encode a record as one line, without the trailing newline.
    ///
    /// Bounds are checked first so an oversized record never produces
    /// output.
    pub fn encode(&self, record: &Record) -> StoreResult<String> {
        self.check_type(&record.record_type)?;
        self.check_content(&record.content)?;
        self.check_metadata(&record.metadata)?;
        Ok(serde_json::to_string(record)?)
    }

    /// Decode one line (with or without its trailing newline).
    pub fn decode(&self, line: &str) -> StoreResult<Record> {
        Ok(serde_json::from_str(line.trim_end_matches(['\n', '\r']))?)
    }
}
