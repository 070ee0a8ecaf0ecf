// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ThreadLog Store - Search
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Title search folds the catalog and scores each title. Content search scans
// session logs, most recently updated session first, and stops as soon as
// `limit` hits are found. There is no persistent inverted index.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::catalog::{Session, SessionStatus};
use crate::error::{StoreError, StoreResult};
use crate::logfile::LineCursor;
use crate::store::LogStore;

/// Bytes of context kept either side of a match in a snippet.
const SNIPPET_CONTEXT: usize = 40;

/// A scored title match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TitleMatch {
    pub score: f64,
    #[serde(flatten)]
    pub session: Session,
}

/// One content search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMatch {
    pub session_id: String,
    pub record_id: u64,
    #[serde(rename = "type")]
    pub record_type: String,
    pub timestamp: DateTime<Utc>,
    pub snippet: String,
}

/// Options for [`LogStore::search_messages`].
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: usize,
    pub include_archived: bool,
    pub deadline: Option<Instant>,
}

impl SearchOptions {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }
}

/// Content search results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMatches {
    pub results: Vec<MessageMatch>,
    /// The deadline expired before every session was scanned.
    pub truncated: bool,
}

impl LogStore {
    /// Sessions whose title matches `query`, best match first.
    ///
    /// A title starting with the query scores 3, one containing it scores 2,
    /// otherwise the score is the fraction of query words found in the title.
    pub async fn search_titles(&self, query: &str, limit: usize) -> StoreResult<Vec<TitleMatch>> {
        let query = normalize_query(query)?;
        let mut matches: Vec<TitleMatch> = self
            .catalog
            .load()?
            .recent(None)
            .into_iter()
            .filter_map(|session| {
                let score = title_score(session.title.as_deref()?, &query);
                (score > 0.0).then_some(TitleMatch { score, session })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.session.updated_at.cmp(&a.session.updated_at))
        });
        matches.truncate(limit);
        Ok(matches)
    }

    /// Records whose content contains `query` (ASCII case-insensitive).
    pub async fn search_messages(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> StoreResult<MessageMatches> {
        let query = normalize_query(query)?;
        let mut out = MessageMatches::default();
        if options.limit == 0 {
            return Ok(out);
        }

        let sessions = self.catalog.load()?.recent(if options.include_archived {
            None
        } else {
            Some(SessionStatus::Active)
        });

        'sessions: for session in sessions {
            let end = self.committed_end(&session.session_id).await?;
            let log = self.layout.log_path(&session.session_id);
            let Some(mut cursor) = LineCursor::open(&log, 0, end)? else {
                continue;
            };

            while let Some((offset, line)) = cursor.next_line()? {
                if options.deadline.is_some_and(|d| Instant::now() >= d) {
                    out.truncated = true;
                    break 'sessions;
                }
                let Some(text) = std::str::from_utf8(line).ok() else {
                    continue;
                };
                let record = match self.codec.decode(text) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(session_id = %session.session_id, offset, error = %e, "Skipping undecodable record");
                        continue;
                    }
                };
                if let Some(at) = find_ignore_ascii_case(record.content.as_str(), &query) {
                    out.results.push(MessageMatch {
                        session_id: record.session_id,
                        record_id: record.record_id,
                        record_type: record.record_type,
                        timestamp: record.timestamp,
                        snippet: snippet(record.content.as_str(), at, query.len()),
                    });
                    if out.results.len() >= options.limit {
                        break 'sessions;
                    }
                }
            }
        }

        debug!(hits = out.results.len(), truncated = out.truncated, "Searched messages");
        Ok(out)
    }
}

fn normalize_query(query: &str) -> StoreResult<String> {
    let query = query.trim();
    if query.is_empty() {
        return Err(StoreError::invalid("query must not be empty"));
    }
    Ok(query.to_string())
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn title_score(title: &str, query: &str) -> f64 {
    let title_lower = title.to_lowercase();
    let query_lower = query.to_lowercase();
    if title_lower.starts_with(&query_lower) {
        return 3.0;
    }
    if title_lower.contains(&query_lower) {
        return 2.0;
    }

    let wanted = tokens(query);
    if wanted.is_empty() {
        return 0.0;
    }
    let have = tokens(title);
    let hits = wanted
        .iter()
        .filter(|w| have.iter().any(|h| h.starts_with(w.as_str())))
        .count();
    hits as f64 / wanted.len() as f64
}

/// Byte offset of the first ASCII case-insensitive occurrence of `needle`.
fn find_ignore_ascii_case(haystack: &str, needle: &str) -> Option<usize> {
    let (h, n) = (haystack.as_bytes(), needle.as_bytes());
    if n.len() > h.len() {
        return None;
    }
    (0..=h.len() - n.len()).find(|&i| h[i..i + n.len()].eq_ignore_ascii_case(n))
}

/// About `SNIPPET_CONTEXT` bytes either side of the match, cut on character
/// boundaries, on one line.
fn snippet(content: &str, at: usize, len: usize) -> String {
    let mut start = at.saturating_sub(SNIPPET_CONTEXT);
    while !content.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (at + len + SNIPPET_CONTEXT).min(content.len());
    while !content.is_char_boundary(end) {
        end += 1;
    }

    let mut out = String::with_capacity(end - start + 8);
    if start > 0 {
        out.push('…');
    }
    out.extend(
        content[start..end]
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c }),
    );
    if end < content.len() {
        out.push('…');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::record::Content;
    use tempfile::TempDir;

    #[test]
    fn test_title_scoring_order() {
        assert_eq!(title_score("Security review", "secu"), 3.0);
        assert_eq!(title_score("Weekly security review", "security"), 2.0);
        assert_eq!(title_score("Review of the deploy", "deploy review"), 1.0);
        assert_eq!(title_score("Review of the deploy", "deploy rollback"), 0.5);
        assert_eq!(title_score("Unrelated", "deploy"), 0.0);
    }

    #[test]
    fn test_find_ignore_ascii_case() {
        assert_eq!(find_ignore_ascii_case("Found a VULNERABILITY", "vulnerability"), Some(8));
        assert_eq!(find_ignore_ascii_case("short", "longer needle"), None);
        assert_eq!(find_ignore_ascii_case("héllo wörld", "WÖ"), None);
        assert_eq!(find_ignore_ascii_case("héllo world", "WORLD"), Some(7));
    }

    #[test]
    fn test_snippet_respects_char_boundaries() {
        let content = format!("{}needle{}", "é".repeat(30), "ü".repeat(30));
        let at = content.find("needle").unwrap();
        let s = snippet(&content, at, 6);
        assert!(s.starts_with('…'));
        assert!(s.ends_with('…'));
        assert!(s.contains("needle"));

        assert_eq!(snippet("a\nneedle", 2, 6), "a needle");
    }

    #[tokio::test]
    async fn test_search_titles_ranked() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::open(StoreConfig::with_data_dir(dir.path())).await.unwrap();
        store.create_session(Some("Deploy checklist".into()), None).await.unwrap();
        store.create_session(Some("Friday deploy".into()), None).await.unwrap();
        store.create_session(Some("Lunch".into()), None).await.unwrap();
        store.create_session(None, None).await.unwrap();

        let hits = store.search_titles("deploy", 10).await.unwrap();
        let titles: Vec<_> = hits
            .iter()
            .map(|h| h.session.title.clone().unwrap())
            .collect();
        assert_eq!(titles, vec!["Deploy checklist", "Friday deploy"]);
        assert!(matches!(
            store.search_titles("   ", 10).await,
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_search_messages_limit_and_archived() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::open(StoreConfig::with_data_dir(dir.path())).await.unwrap();
        let a = store.create_session(Some("a".into()), None).await.unwrap();
        let b = store.create_session(Some("b".into()), None).await.unwrap();
        for i in 0..3 {
            store
                .append_message(a.as_str(), "user", Content::new(format!("needle {i}")), None)
                .await
                .unwrap();
        }
        store
            .append_message(b.as_str(), "user", Content::new("a NEEDLE here"), None)
            .await
            .unwrap();

        let hits = store.search_messages("needle", &SearchOptions::new(2)).await.unwrap();
        assert_eq!(hits.results.len(), 2);
        // Session b was updated most recently, so it is scanned first.
        assert_eq!(hits.results[0].session_id, b.as_str());

        store.archive_session(b.as_str()).await.unwrap();
        let hits = store.search_messages("needle", &SearchOptions::new(10)).await.unwrap();
        assert_eq!(hits.results.len(), 3);
        assert!(hits.results.iter().all(|h| h.session_id == a.as_str()));

        let options = SearchOptions {
            include_archived: true,
            ..SearchOptions::new(10)
        };
        let hits = store.search_messages("needle", &options).await.unwrap();
        assert_eq!(hits.results.len(), 4);
    }

    #[tokio::test]
    async fn test_expired_deadline_truncates_search() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::open(StoreConfig::with_data_dir(dir.path())).await.unwrap();
        let id = store.create_session(None, None).await.unwrap();
        for i in 0..5 {
            store
                .append_message(id.as_str(), "user", Content::new(format!("needle {i}")), None)
                .await
                .unwrap();
        }

        let expired = SearchOptions {
            deadline: Some(Instant::now()),
            ..SearchOptions::new(10)
        };
        let hits = store.search_messages("needle", &expired).await.unwrap();
        assert!(hits.truncated);
        assert!(hits.results.is_empty());

        let open = SearchOptions {
            deadline: Some(Instant::now() + std::time::Duration::from_secs(60)),
            ..SearchOptions::new(10)
        };
        let hits = store.search_messages("needle", &open).await.unwrap();
        assert!(!hits.truncated);
        assert_eq!(hits.results.len(), 5);
    }
}
