// SPDX-License-Identifier: PMPL-1.0-or-later
//! End-to-end tests for the tool-invocation contract.
//!
//! Drives the HTTP router with `tower::ServiceExt::oneshot` and checks the
//! `{content:[{type:"text", text}]}` envelope and the JSON inside it.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use threadlog_api::{build_router, AppState, ToolResponse};
use threadlog_store::{LogStore, StoreConfig};
use tower::ServiceExt;

async fn app(dir: &TempDir) -> Router {
    let store = LogStore::open(StoreConfig::with_data_dir(dir.path())).await.unwrap();
    build_router(AppState::new(store))
}

async fn call(app: &Router, tool: &str, arguments: Value) -> Value {
    let request = Request::builder()
        .method("POST")
        .uri("/tools/call")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "tool": tool, "arguments": arguments }).to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let envelope: ToolResponse = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(envelope.content.len(), 1);
    assert_eq!(envelope.content[0].kind, "text");
    envelope.payload().unwrap()
}

// ===========================================================================
// Scenarios
// ===========================================================================

#[tokio::test]
async fn test_lifecycle_through_tools() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;

    let created = call(&app, "create_session", json!({ "title": "T" })).await;
    assert_eq!(created["success"], true);
    let session = created["session_id"].as_str().unwrap().to_string();

    let first = call(
        &app,
        "append_message",
        json!({ "session_id": session, "message_type": "user", "content": "hello" }),
    )
    .await;
    let second = call(
        &app,
        "append_message",
        json!({ "session_id": session, "message_type": "assistant", "content": "hi" }),
    )
    .await;
    assert_eq!(first["message_id"], 0);
    assert_eq!(second["message_id"], 1);

    let page = call(
        &app,
        "get_messages",
        json!({ "session_id": session, "limit": 10, "reverse": false }),
    )
    .await;
    let contents: Vec<&str> = page["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["content"].as_str().unwrap())
        .collect();
    assert_eq!(contents, vec!["hello", "hi"]);
    assert_eq!(page["messages"][1]["type"], "assistant");
    assert_eq!(page["truncated"], false);

    let one = call(&app, "get_message", json!({ "session_id": session, "record_id": 1 })).await;
    assert_eq!(one["message"]["content"], "hi");

    let missing = call(&app, "get_message", json!({ "session_id": session, "record_id": 7 })).await;
    assert_eq!(missing["success"], false);
    assert_eq!(missing["code"], "not_found");
}

#[tokio::test]
async fn test_pagination_through_tools() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;
    let session = call(&app, "create_session", json!({})).await["session_id"]
        .as_str()
        .unwrap()
        .to_string();
    for i in 0..30 {
        call(
            &app,
            "append_message",
            json!({ "session_id": session, "message_type": "user", "content": format!("m{i}") }),
        )
        .await;
    }

    let page = call(
        &app,
        "get_messages",
        json!({ "session_id": session, "limit": 10, "reverse": true }),
    )
    .await;
    let sequences: Vec<u64> = page["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["sequence"].as_u64().unwrap())
        .collect();
    assert_eq!(sequences, (20..30).rev().collect::<Vec<_>>());

    let older = call(
        &app,
        "get_messages",
        json!({ "session_id": session, "limit": 10, "reverse": true, "before_sequence": 20 }),
    )
    .await;
    assert_eq!(older["messages"][0]["sequence"], 19);
    assert_eq!(older["messages"][9]["sequence"], 10);

    let both = call(
        &app,
        "get_messages",
        json!({ "session_id": session, "before_sequence": 5, "after_sequence": 1 }),
    )
    .await;
    assert_eq!(both["code"], "invalid_argument");
}

#[tokio::test]
async fn test_search_and_archive_through_tools() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;
    let a = call(&app, "create_session", json!({ "title": "Audit A" })).await["session_id"]
        .as_str()
        .unwrap()
        .to_string();
    let b = call(&app, "create_session", json!({ "title": "Chat B" })).await["session_id"]
        .as_str()
        .unwrap()
        .to_string();
    call(
        &app,
        "append_message",
        json!({ "session_id": a, "message_type": "tool", "content": "possible vulnerability in login" }),
    )
    .await;
    call(
        &app,
        "append_message",
        json!({ "session_id": b, "message_type": "user", "content": "how is the weather" }),
    )
    .await;

    let hits = call(&app, "search_messages", json!({ "query": "vulnerability", "limit": 5 })).await;
    assert_eq!(hits["results"].as_array().unwrap().len(), 1);
    assert_eq!(hits["results"][0]["session_id"], a.as_str());

    let titles = call(&app, "search_titles", json!({ "query": "audit", "limit": 5 })).await;
    assert_eq!(titles["results"][0]["session_id"], a.as_str());
    assert_eq!(titles["results"][0]["score"], 3.0);

    for _ in 0..2 {
        let archived = call(&app, "archive_session", json!({ "session_id": a })).await;
        assert_eq!(archived["success"], true);
        assert_eq!(archived["session"]["status"], "archived");
    }

    let hidden = call(&app, "search_messages", json!({ "query": "vulnerability" })).await;
    assert!(hidden["results"].as_array().unwrap().is_empty());
    let shown = call(
        &app,
        "search_messages",
        json!({ "query": "vulnerability", "include_archived": true }),
    )
    .await;
    assert_eq!(shown["results"].as_array().unwrap().len(), 1);

    let active = call(&app, "list_sessions", json!({ "limit": 10, "status": "active" })).await;
    let ids: Vec<&str> = active["sessions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["session_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec![b.as_str()]);
}

#[tokio::test]
async fn test_search_timeout_reports_truncation() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;
    let session = call(&app, "create_session", json!({})).await["session_id"]
        .as_str()
        .unwrap()
        .to_string();
    call(
        &app,
        "append_message",
        json!({ "session_id": session, "message_type": "user", "content": "needle" }),
    )
    .await;

    let expired = call(
        &app,
        "search_messages",
        json!({ "query": "needle", "timeout_ms": 0 }),
    )
    .await;
    assert_eq!(expired["success"], true);
    assert_eq!(expired["truncated"], true);

    let relaxed = call(
        &app,
        "search_messages",
        json!({ "query": "needle", "timeout_ms": 60000 }),
    )
    .await;
    assert_eq!(relaxed["truncated"], false);
    assert_eq!(relaxed["results"].as_array().unwrap().len(), 1);
}

// ===========================================================================
// Administration
// ===========================================================================

#[tokio::test]
async fn test_admin_tools() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;
    let session = call(&app, "create_session", json!({ "title": "kept" })).await["session_id"]
        .as_str()
        .unwrap()
        .to_string();
    call(&app, "create_session", json!({ "title": "empty" })).await;
    call(
        &app,
        "append_message",
        json!({ "session_id": session, "message_type": "user", "content": "x" }),
    )
    .await;

    let rebuilt = call(&app, "rebuild_index", json!({ "session_id": session })).await;
    assert_eq!(rebuilt["success"], true);
    assert_eq!(rebuilt["records"], 1);

    let all = call(&app, "rebuild_all_indexes", json!({})).await;
    assert_eq!(all["rebuilt"], 2);
    assert_eq!(all["failed"], 0);

    let cleaned = call(&app, "cleanup_empty_sessions", json!({ "max_age_hours": 0 })).await;
    assert_eq!(cleaned["cleaned_count"], 1);
    assert_eq!(cleaned["error_count"], 0);

    let renamed = call(&app, "rename_session", json!({ "session_id": session, "title": "renamed" })).await;
    assert_eq!(renamed["session"]["title"], "renamed");

    let compacted = call(&app, "compact_wal", json!({})).await;
    assert_eq!(compacted["success"], true);

    let stats = call(&app, "store_stats", json!({})).await;
    assert_eq!(stats["stats"]["sessions_total"], 1);
    assert_eq!(stats["stats"]["wal_pending"], 0);
}

#[tokio::test]
async fn test_tool_listing() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;
    let response = app
        .oneshot(Request::builder().uri("/tools").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let tools: Vec<Value> = serde_json::from_slice(&bytes).unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
    for required in [
        "create_session",
        "get_session",
        "list_sessions",
        "append_message",
        "get_messages",
        "get_message",
        "search_titles",
        "search_messages",
        "rebuild_index",
        "cleanup_empty_sessions",
    ] {
        assert!(names.contains(&required), "missing {required}");
    }
}
