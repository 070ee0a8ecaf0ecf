// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ThreadLog API - Tool router
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Maps `{tool, arguments}` requests onto `LogStore` operations. Every call
// produces a response: failures are rendered as `{success:false, error, code}`
// inside the usual text content block, never as a transport error.

use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, instrument};

use threadlog_store::{
    Content, LogStore, Metadata, PageRequest, SearchOptions, SessionStatus, StoreError,
};

const DEFAULT_LIST_LIMIT: usize = 50;
const DEFAULT_PAGE_LIMIT: usize = 50;
const DEFAULT_SEARCH_LIMIT: usize = 10;
const DEFAULT_CLEANUP_AGE_HOURS: u64 = 24;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// An incoming tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolRequest {
    pub fn new(tool: impl Into<String>, arguments: Value) -> Self {
        Self {
            tool: tool.into(),
            arguments,
        }
    }
}

/// One block of tool output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

/// The result of a tool invocation: a single text block holding JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub content: Vec<ToolContent>,
}

impl ToolResponse {
    fn from_json(body: &Value) -> Self {
        Self {
            content: vec![ToolContent {
                kind: "text".to_string(),
                text: body.to_string(),
            }],
        }
    }

    /// Parse the JSON carried in the first text block.
    pub fn payload(&self) -> Option<Value> {
        self.content
            .first()
            .and_then(|block| serde_json::from_str(&block.text).ok())
    }
}

/// Name, description and argument schema of one tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a tool call failed.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ToolError {
    /// Stable snake_case code for the response body.
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::UnknownTool(_) => "unknown_tool",
            ToolError::InvalidArguments(_) => "invalid_argument",
            ToolError::Store(e) => e.kind(),
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, ToolError::Store(e) if e.is_retryable())
    }

    fn is_caller_error(&self) -> bool {
        match self {
            ToolError::UnknownTool(_) | ToolError::InvalidArguments(_) => true,
            ToolError::Store(e) => e.is_caller_error(),
        }
    }
}

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateSessionArgs {
    title: Option<String>,
    metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SessionArgs {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct ListSessionsArgs {
    #[serde(default = "default_list_limit")]
    limit: usize,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AppendMessageArgs {
    /// Omitted: a new session is created for the message.
    session_id: Option<String>,
    #[serde(alias = "type")]
    message_type: String,
    content: String,
    metadata: Option<Value>,
    /// Title for a session created by this call.
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetMessagesArgs {
    session_id: String,
    #[serde(default = "default_page_limit")]
    limit: usize,
    #[serde(default)]
    reverse: bool,
    before_sequence: Option<u64>,
    after_sequence: Option<u64>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GetMessageArgs {
    session_id: String,
    #[serde(alias = "message_id")]
    record_id: u64,
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default = "default_search_limit")]
    limit: usize,
    #[serde(default)]
    include_archived: bool,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RenameSessionArgs {
    session_id: String,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CleanupArgs {
    #[serde(default = "default_cleanup_age")]
    max_age_hours: u64,
}

#[derive(Debug, Default, Deserialize)]
struct RebuildAllArgs {
    #[serde(default)]
    background: bool,
}

fn default_list_limit() -> usize {
    DEFAULT_LIST_LIMIT
}

fn default_page_limit() -> usize {
    DEFAULT_PAGE_LIMIT
}

fn default_search_limit() -> usize {
    DEFAULT_SEARCH_LIMIT
}

fn default_cleanup_age() -> u64 {
    DEFAULT_CLEANUP_AGE_HOURS
}

fn parse_args<T: DeserializeOwned>(arguments: Value) -> Result<T, ToolError> {
    let arguments = match arguments {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(arguments).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

fn parse_metadata(value: Option<Value>) -> Result<Option<Metadata>, ToolError> {
    value.map(Metadata::from_value).transpose().map_err(ToolError::from)
}

fn deadline(timeout_ms: Option<u64>) -> Option<Instant> {
    timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Dispatches tool calls to a [`LogStore`].
#[derive(Clone)]
pub struct ToolRouter {
    store: LogStore,
}

impl ToolRouter {
    pub fn new(store: LogStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &LogStore {
        &self.store
    }

    /// Run one tool call. Never fails; errors are part of the payload.
    #[instrument(skip(self, request), fields(tool = %request.tool))]
    pub async fn call(&self, request: ToolRequest) -> ToolResponse {
        let body = match self.dispatch(&request.tool, request.arguments).await {
            Ok(body) => {
                debug!("Tool call succeeded");
                body
            }
            Err(e) => {
                if e.is_caller_error() {
                    info!(code = e.code(), error = %e, "Tool call rejected");
                } else {
                    error!(code = e.code(), error = %e, "Tool call failed");
                }
                json!({
                    "success": false,
                    "error": e.to_string(),
                    "code": e.code(),
                    "retryable": e.retryable(),
                })
            }
        };
        ToolResponse::from_json(&body)
    }

    async fn dispatch(&self, tool: &str, arguments: Value) -> Result<Value, ToolError> {
        match tool {
            "create_session" => {
                let args: CreateSessionArgs = parse_args(arguments)?;
                let metadata = parse_metadata(args.metadata)?;
                let id = self.store.create_session(args.title, metadata).await?;
                Ok(json!({ "success": true, "session_id": id }))
            }
            "get_session" => {
                let args: SessionArgs = parse_args(arguments)?;
                let session = self.store.get_session(&args.session_id).await?;
                Ok(json!({ "success": true, "session": session }))
            }
            "list_sessions" => {
                let args: ListSessionsArgs = parse_args(arguments)?;
                let status = args
                    .status
                    .as_deref()
                    .map(str::parse::<SessionStatus>)
                    .transpose()?;
                let sessions = self.store.list_sessions(args.limit, status).await?;
                Ok(json!({ "success": true, "sessions": sessions }))
            }
            "append_message" => {
                let args: AppendMessageArgs = parse_args(arguments)?;
                let metadata = parse_metadata(args.metadata)?;
                let session_id = match args.session_id {
                    Some(id) => id,
                    None => self
                        .store
                        .create_session(args.title, None)
                        .await?
                        .as_str()
                        .to_string(),
                };
                let record = self
                    .store
                    .append_message(&session_id, &args.message_type, Content::new(args.content), metadata)
                    .await?;
                Ok(json!({
                    "success": true,
                    "session_id": session_id,
                    "message_id": record.record_id,
                    "sequence": record.sequence,
                    "timestamp": record.timestamp,
                }))
            }
            "get_messages" => {
                let args: GetMessagesArgs = parse_args(arguments)?;
                let mut request = PageRequest::latest(args.limit);
                request.before_sequence = args.before_sequence;
                request.after_sequence = args.after_sequence;
                request.reverse = args.reverse;
                if let Some(ms) = args.timeout_ms {
                    request = request.with_timeout(Duration::from_millis(ms));
                }
                let page = self.store.get_messages(&args.session_id, &request).await?;
                Ok(json!({
                    "success": true,
                    "count": page.records.len(),
                    "messages": page.records,
                    "truncated": page.truncated,
                }))
            }
            "get_message" => {
                let args: GetMessageArgs = parse_args(arguments)?;
                let record = self.store.get_message(&args.session_id, args.record_id).await?;
                Ok(json!({ "success": true, "message": record }))
            }
            "search_titles" => {
                let args: SearchArgs = parse_args(arguments)?;
                let results = self.store.search_titles(&args.query, args.limit).await?;
                Ok(json!({ "success": true, "results": results }))
            }
            "search_messages" => {
                let args: SearchArgs = parse_args(arguments)?;
                let options = SearchOptions {
                    limit: args.limit,
                    include_archived: args.include_archived,
                    deadline: deadline(args.timeout_ms),
                };
                let found = self.store.search_messages(&args.query, &options).await?;
                Ok(json!({
                    "success": true,
                    "results": found.results,
                    "truncated": found.truncated,
                }))
            }
            "rebuild_index" => {
                let args: SessionArgs = parse_args(arguments)?;
                let report = self.store.build_message_index(&args.session_id).await?;
                Ok(json!({
                    "success": true,
                    "session_id": report.session_id,
                    "records": report.records,
                    "entries": report.entries,
                }))
            }
            "rebuild_all_indexes" => {
                let args: RebuildAllArgs = parse_args(arguments)?;
                if args.background {
                    // Detached: the sweep logs its own summary.
                    drop(self.store.spawn_rebuild_all());
                    return Ok(json!({ "success": true, "started": true }));
                }
                let report = self.store.rebuild_all_indexes().await?;
                Ok(json!({
                    "success": true,
                    "rebuilt": report.rebuilt,
                    "failed": report.failed,
                    "records": report.records,
                }))
            }
            "cleanup_empty_sessions" => {
                let args: CleanupArgs = parse_args(arguments)?;
                let report = self.store.cleanup_empty_sessions(args.max_age_hours).await?;
                Ok(json!({
                    "success": true,
                    "cleaned_count": report.cleaned_count,
                    "error_count": report.error_count,
                }))
            }
            "archive_session" => {
                let args: SessionArgs = parse_args(arguments)?;
                let session = self.store.archive_session(&args.session_id).await?;
                Ok(json!({ "success": true, "session": session }))
            }
            "rename_session" => {
                let args: RenameSessionArgs = parse_args(arguments)?;
                let session = self.store.rename_session(&args.session_id, args.title).await?;
                Ok(json!({ "success": true, "session": session }))
            }
            "compact_wal" => {
                let compacted = self.store.compact_wal().await?;
                Ok(json!({ "success": true, "compacted": compacted }))
            }
            "store_stats" => {
                let stats = self.store.stats().await?;
                Ok(json!({ "success": true, "stats": stats }))
            }
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Tool catalog
// ---------------------------------------------------------------------------

fn object(properties: Value, required: &[&str]) -> Value {
    json!({ "type": "object", "properties": properties, "required": required })
}

/// Every tool the router understands, with JSON schemas for its arguments.
pub fn tool_catalog() -> Vec<ToolSpec> {
    let session_id = json!({ "type": "string", "description": "Session identifier" });
    let limit = json!({ "type": "integer", "minimum": 0 });
    let timeout = json!({ "type": "integer", "minimum": 0, "description": "Deadline in milliseconds" });

    vec![
        ToolSpec {
            name: "create_session",
            description: "Create a new conversation session",
            parameters: object(
                json!({ "title": { "type": "string" }, "metadata": { "type": "object" } }),
                &[],
            ),
        },
        ToolSpec {
            name: "get_session",
            description: "Fetch one session",
            parameters: object(json!({ "session_id": session_id }), &["session_id"]),
        },
        ToolSpec {
            name: "list_sessions",
            description: "List sessions, most recently updated first",
            parameters: object(
                json!({
                    "limit": limit,
                    "status": { "type": "string", "enum": ["active", "archived"] },
                }),
                &[],
            ),
        },
        ToolSpec {
            name: "append_message",
            description: "Append a message to a session, creating the session if none is given",
            parameters: object(
                json!({
                    "session_id": session_id,
                    "message_type": { "type": "string" },
                    "content": { "type": "string" },
                    "metadata": { "type": "object" },
                    "title": { "type": "string" },
                }),
                &["message_type", "content"],
            ),
        },
        ToolSpec {
            name: "get_messages",
            description: "Read a page of messages from a session",
            parameters: object(
                json!({
                    "session_id": session_id,
                    "limit": limit,
                    "reverse": { "type": "boolean" },
                    "before_sequence": { "type": "integer", "minimum": 0 },
                    "after_sequence": { "type": "integer", "minimum": 0 },
                    "timeout_ms": timeout,
                }),
                &["session_id"],
            ),
        },
        ToolSpec {
            name: "get_message",
            description: "Fetch one message by record id",
            parameters: object(
                json!({ "session_id": session_id, "record_id": { "type": "integer", "minimum": 0 } }),
                &["session_id", "record_id"],
            ),
        },
        ToolSpec {
            name: "search_titles",
            description: "Search session titles",
            parameters: object(json!({ "query": { "type": "string" }, "limit": limit }), &["query"]),
        },
        ToolSpec {
            name: "search_messages",
            description: "Search message content across sessions",
            parameters: object(
                json!({
                    "query": { "type": "string" },
                    "limit": limit,
                    "include_archived": { "type": "boolean" },
                    "timeout_ms": timeout,
                }),
                &["query"],
            ),
        },
        ToolSpec {
            name: "rebuild_index",
            description: "Rebuild one session's index from its log",
            parameters: object(json!({ "session_id": session_id }), &["session_id"]),
        },
        ToolSpec {
            name: "rebuild_all_indexes",
            description: "Rebuild every session index",
            parameters: object(json!({ "background": { "type": "boolean" } }), &[]),
        },
        ToolSpec {
            name: "cleanup_empty_sessions",
            description: "Purge sessions that never received a message",
            parameters: object(
                json!({ "max_age_hours": { "type": "integer", "minimum": 0 } }),
                &[],
            ),
        },
        ToolSpec {
            name: "archive_session",
            description: "Archive a session",
            parameters: object(json!({ "session_id": session_id }), &["session_id"]),
        },
        ToolSpec {
            name: "rename_session",
            description: "Set or clear a session title",
            parameters: object(
                json!({ "session_id": session_id, "title": { "type": ["string", "null"] } }),
                &["session_id"],
            ),
        },
        ToolSpec {
            name: "compact_wal",
            description: "Truncate the write-ahead log if every entry is resolved",
            parameters: object(json!({}), &[]),
        },
        ToolSpec {
            name: "store_stats",
            description: "Session counts, WAL backlog and disk usage",
            parameters: object(json!({}), &[]),
        },
    ]
}
