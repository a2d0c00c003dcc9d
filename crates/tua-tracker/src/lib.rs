// SPDX-License-Identifier: MIT OR Apache-2.0
//! Issue tracker client: search, fetch, comment, transition, and attachment
//! transfer against a JIRA-Cloud-shaped REST API.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use tua_core::{Attachment, Comment, CommentAuthor, Ticket, TicketStatus};
use tua_error::{ErrorCode, TuaError};

/// A status transition offered by the tracker for a given ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Tracker-assigned transition id, opaque to the caller.
    pub id: String,
    /// The status this transition leads to.
    pub to_status: TicketStatus,
}

/// Find the transition whose target status matches `target`, by the status's
/// [`std::fmt::Display`] form (case-insensitive).
pub fn find_transition<'a>(transitions: &'a [Transition], target: &TicketStatus) -> Option<&'a Transition> {
    let target_name = target.to_string().to_lowercase();
    transitions
        .iter()
        .find(|t| t.to_status.to_string().to_lowercase() == target_name)
}

/// Issue tracker contract. Implementations need only satisfy the calls the
/// Orchestrator issues; comment bodies are always returned already flattened
/// to plain text (structured-document bodies are collapsed by the client).
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Run a search query (the tracker's native query language) and return
    /// matching ticket keys.
    async fn search(&self, query: &str) -> Result<Vec<String>, TuaError>;

    /// Fetch a single ticket by key, with attachments and comments.
    async fn fetch(&self, key: &str) -> Result<Ticket, TuaError>;

    /// List the transitions currently available on a ticket.
    async fn list_transitions(&self, key: &str) -> Result<Vec<Transition>, TuaError>;

    /// Perform a transition, optionally posting a comment atomically with it.
    async fn perform_transition(
        &self,
        key: &str,
        transition: &Transition,
        comment: Option<&str>,
    ) -> Result<(), TuaError>;

    /// Post a plain-text comment, returning the comment as recorded by the
    /// tracker (with its assigned id, author, and timestamp).
    async fn add_comment(&self, key: &str, body: &str) -> Result<Comment, TuaError>;

    /// Download an attachment's bytes from its `download_url`.
    async fn download_attachment(&self, attachment: &Attachment) -> Result<Vec<u8>, TuaError>;

    /// Upload a generated attachment (e.g. `users-for-approval.csv`) to a
    /// ticket.
    async fn upload_attachment(
        &self,
        key: &str,
        filename: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<(), TuaError>;
}

// ---------------------------------------------------------------------------
// Mock tracker
// ---------------------------------------------------------------------------

struct MockState {
    tickets: HashMap<String, Ticket>,
    attachment_bytes: HashMap<String, Vec<u8>>,
}

/// Deterministic in-memory [`Tracker`] for offline tests and `--dry-run`.
///
/// `search` ignores the query string entirely and returns every stored
/// ticket key in insertion order; this is sufficient for tests that seed
/// exactly the tickets they want processed.
pub struct MockTracker {
    state: Mutex<MockState>,
    order: Mutex<Vec<String>>,
    next_comment_id: AtomicU64,
    next_timestamp: AtomicI64,
    bot_author: CommentAuthor,
}

impl MockTracker {
    /// Construct an empty mock tracker whose bot-authored comments use
    /// `bot_author`.
    pub fn new(bot_author: CommentAuthor) -> Self {
        MockTracker {
            state: Mutex::new(MockState {
                tickets: HashMap::new(),
                attachment_bytes: HashMap::new(),
            }),
            order: Mutex::new(Vec::new()),
            next_comment_id: AtomicU64::new(1),
            next_timestamp: AtomicI64::new(0),
            bot_author,
        }
    }

    /// Seed a ticket into the mock store.
    pub fn seed(&self, ticket: Ticket) {
        let mut state = self.state.lock().expect("mock lock poisoned");
        for attachment in &ticket.attachments {
            if let Some(bytes) = &attachment.bytes {
                state.attachment_bytes.insert(attachment.download_url.clone(), bytes.clone());
            }
        }
        self.order.lock().expect("mock lock poisoned").push(ticket.key.clone());
        state.tickets.insert(ticket.key.clone(), ticket);
    }

    fn next_id(&self) -> String {
        format!("c{}", self.next_comment_id.fetch_add(1, Ordering::SeqCst))
    }

    fn next_time(&self) -> DateTime<Utc> {
        let secs = self.next_timestamp.fetch_add(1, Ordering::SeqCst);
        DateTime::from_timestamp(secs, 0).expect("monotonic counter is a valid unix timestamp")
    }

    fn not_found(key: &str) -> TuaError {
        TuaError::new(ErrorCode::TrackerPermanent, "no such ticket").with_context("ticket_key", key.to_string())
    }
}

#[async_trait]
impl Tracker for MockTracker {
    async fn search(&self, _query: &str) -> Result<Vec<String>, TuaError> {
        Ok(self.order.lock().expect("mock lock poisoned").clone())
    }

    async fn fetch(&self, key: &str) -> Result<Ticket, TuaError> {
        self.state
            .lock()
            .expect("mock lock poisoned")
            .tickets
            .get(key)
            .cloned()
            .ok_or_else(|| Self::not_found(key))
    }

    async fn list_transitions(&self, key: &str) -> Result<Vec<Transition>, TuaError> {
        if !self.state.lock().expect("mock lock poisoned").tickets.contains_key(key) {
            return Err(Self::not_found(key));
        }
        Ok(vec![
            Transition {
                id: "open".into(),
                to_status: TicketStatus::Open,
            },
            Transition {
                id: "review".into(),
                to_status: TicketStatus::Review,
            },
            Transition {
                id: "info-required".into(),
                to_status: TicketStatus::InfoRequired,
            },
            Transition {
                id: "done".into(),
                to_status: TicketStatus::Done,
            },
        ])
    }

    async fn perform_transition(
        &self,
        key: &str,
        transition: &Transition,
        comment: Option<&str>,
    ) -> Result<(), TuaError> {
        if let Some(body) = comment {
            self.add_comment(key, body).await?;
        }
        let mut state = self.state.lock().expect("mock lock poisoned");
        let ticket = state.tickets.get_mut(key).ok_or_else(|| Self::not_found(key))?;
        ticket.status = transition.to_status.clone();
        Ok(())
    }

    async fn add_comment(&self, key: &str, body: &str) -> Result<Comment, TuaError> {
        let comment = Comment {
            id: self.next_id(),
            author: self.bot_author.clone(),
            created_at: self.next_time(),
            body: body.to_string(),
        };
        let mut state = self.state.lock().expect("mock lock poisoned");
        let ticket = state.tickets.get_mut(key).ok_or_else(|| Self::not_found(key))?;
        ticket.comments.push(comment.clone());
        Ok(comment)
    }

    async fn download_attachment(&self, attachment: &Attachment) -> Result<Vec<u8>, TuaError> {
        if let Some(bytes) = &attachment.bytes {
            return Ok(bytes.clone());
        }
        self.state
            .lock()
            .expect("mock lock poisoned")
            .attachment_bytes
            .get(&attachment.download_url)
            .cloned()
            .ok_or_else(|| {
                TuaError::new(ErrorCode::TrackerPermanent, "attachment bytes not seeded in mock")
                    .with_context("filename", attachment.filename.clone())
            })
    }

    async fn upload_attachment(
        &self,
        key: &str,
        filename: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<(), TuaError> {
        let url = format!("mock://{key}/{filename}");
        let mut state = self.state.lock().expect("mock lock poisoned");
        let ticket = state.tickets.get_mut(key).ok_or_else(|| Self::not_found(key))?;
        let size = bytes.len() as u64;
        ticket.attachments.push(Attachment {
            filename: filename.to_string(),
            mime_type: mime_type.to_string(),
            size,
            download_url: url.clone(),
            bytes: Some(bytes.clone()),
        });
        state.attachment_bytes.insert(url, bytes);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HTTP tracker
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SearchResponse {
    issues: Vec<SearchIssue>,
}

#[derive(Deserialize)]
struct SearchIssue {
    key: String,
}

#[derive(Deserialize)]
struct IssueResponse {
    fields: IssueFields,
}

#[derive(Deserialize)]
struct IssueFields {
    summary: String,
    #[serde(default)]
    description: Option<serde_json::Value>,
    status: StatusField,
    #[serde(default)]
    attachment: Vec<AttachmentField>,
    #[serde(default)]
    comment: CommentField,
}

#[derive(Deserialize)]
struct StatusField {
    name: String,
}

#[derive(Deserialize)]
struct AttachmentField {
    filename: String,
    #[serde(rename = "mimeType", default)]
    mime_type: String,
    size: u64,
    content: String,
}

#[derive(Deserialize, Default)]
struct CommentField {
    #[serde(default)]
    comments: Vec<CommentEntry>,
}

#[derive(Deserialize)]
struct CommentEntry {
    id: String,
    author: AuthorField,
    created: DateTime<Utc>,
    #[serde(default)]
    body: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct AuthorField {
    #[serde(rename = "accountId")]
    account_id: String,
    #[serde(rename = "displayName")]
    display_name: String,
}

#[derive(Deserialize)]
struct TransitionsResponse {
    transitions: Vec<TransitionEntry>,
}

#[derive(Deserialize)]
struct TransitionEntry {
    id: String,
    to: TransitionTarget,
}

#[derive(Deserialize)]
struct TransitionTarget {
    name: String,
}

/// Flatten a JIRA Atlassian Document Format body (or a plain string) to
/// plain text by concatenating every `"text"` leaf, depth-first.
fn flatten_adf(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(text)) = map.get("text") {
                return text.clone();
            }
            let mut parts = Vec::new();
            if let Some(serde_json::Value::Array(content)) = map.get("content") {
                for item in content {
                    parts.push(flatten_adf(item));
                }
            }
            parts.join("\n")
        }
        serde_json::Value::Array(items) => items.iter().map(flatten_adf).collect::<Vec<_>>().join("\n"),
        _ => String::new(),
    }
}

fn ticket_status_from_name(name: &str) -> TicketStatus {
    match name {
        "Open" => TicketStatus::Open,
        "Review" => TicketStatus::Review,
        "Info Required" => TicketStatus::InfoRequired,
        "Done" => TicketStatus::Done,
        other => TicketStatus::Other(other.to_string()),
    }
}

/// HTTP-backed [`Tracker`] against a JIRA-Cloud-shaped REST v3 API, using
/// basic auth with an account email and API token.
pub struct HttpTracker {
    client: reqwest::Client,
    base_url: String,
    email: String,
    api_token: String,
}

impl HttpTracker {
    /// Construct a client against `base_url` (e.g. `https://acme.atlassian.net`)
    /// with the timeouts named in `spec.md` §5 (30s connect, 120s read).
    pub fn new(base_url: impl Into<String>, email: impl Into<String>, api_token: impl Into<String>) -> Result<Self, TuaError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| TuaError::new(ErrorCode::Internal, format!("failed to build HTTP client: {e}")))?;
        Ok(HttpTracker {
            client,
            base_url: base_url.into(),
            email: email.into(),
            api_token: api_token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn classify_status(status: reqwest::StatusCode) -> ErrorCode {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            ErrorCode::TrackerTransient
        } else {
            ErrorCode::TrackerPermanent
        }
    }

    async fn failure(context: &str, response: reqwest::Response) -> TuaError {
        let status = response.status();
        let code = Self::classify_status(status);
        let body = response.text().await.unwrap_or_default();
        TuaError::new(code, format!("{context} returned HTTP {status}"))
            .with_context("status", status.as_u16())
            .with_context("body", body)
    }
}

#[async_trait]
impl Tracker for HttpTracker {
    async fn search(&self, query: &str) -> Result<Vec<String>, TuaError> {
        let response = self
            .client
            .get(self.url("/rest/api/3/search"))
            .basic_auth(&self.email, Some(&self.api_token))
            .query(&[("jql", query)])
            .send()
            .await
            .map_err(|e| TuaError::new(ErrorCode::TrackerTransient, format!("search request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Self::failure("search", response).await);
        }
        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| TuaError::new(ErrorCode::TrackerPermanent, format!("search response not valid JSON: {e}")))?;
        Ok(parsed.issues.into_iter().map(|i| i.key).collect())
    }

    async fn fetch(&self, key: &str) -> Result<Ticket, TuaError> {
        let response = self
            .client
            .get(self.url(&format!("/rest/api/3/issue/{key}")))
            .basic_auth(&self.email, Some(&self.api_token))
            .query(&[("fields", "summary,description,status,attachment,comment")])
            .send()
            .await
            .map_err(|e| TuaError::new(ErrorCode::TrackerTransient, format!("fetch request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Self::failure("fetch", response).await.with_context("ticket_key", key.to_string()));
        }
        let parsed: IssueResponse = response
            .json()
            .await
            .map_err(|e| TuaError::new(ErrorCode::TrackerPermanent, format!("fetch response not valid JSON: {e}")))?;

        let description = parsed.fields.description.as_ref().map(flatten_adf).unwrap_or_default();
        let attachments = parsed
            .fields
            .attachment
            .into_iter()
            .map(|a| Attachment {
                filename: a.filename,
                mime_type: a.mime_type,
                size: a.size,
                download_url: a.content,
                bytes: None,
            })
            .collect();
        let comments = parsed
            .fields
            .comment
            .comments
            .into_iter()
            .map(|c| Comment {
                id: c.id,
                author: CommentAuthor {
                    id: c.author.account_id,
                    display_name: c.author.display_name,
                },
                created_at: c.created,
                body: c.body.as_ref().map(flatten_adf).unwrap_or_default(),
            })
            .collect();

        Ok(Ticket {
            key: key.to_string(),
            summary: parsed.fields.summary,
            description,
            status: ticket_status_from_name(&parsed.fields.status.name),
            attachments,
            comments,
        })
    }

    async fn list_transitions(&self, key: &str) -> Result<Vec<Transition>, TuaError> {
        let response = self
            .client
            .get(self.url(&format!("/rest/api/3/issue/{key}/transitions")))
            .basic_auth(&self.email, Some(&self.api_token))
            .send()
            .await
            .map_err(|e| TuaError::new(ErrorCode::TrackerTransient, format!("list_transitions request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Self::failure("list_transitions", response).await.with_context("ticket_key", key.to_string()));
        }
        let parsed: TransitionsResponse = response
            .json()
            .await
            .map_err(|e| TuaError::new(ErrorCode::TrackerPermanent, format!("list_transitions response not valid JSON: {e}")))?;
        Ok(parsed
            .transitions
            .into_iter()
            .map(|t| Transition {
                id: t.id,
                to_status: ticket_status_from_name(&t.to.name),
            })
            .collect())
    }

    async fn perform_transition(
        &self,
        key: &str,
        transition: &Transition,
        comment: Option<&str>,
    ) -> Result<(), TuaError> {
        let mut body = serde_json::json!({ "transition": { "id": transition.id } });
        if let Some(text) = comment {
            body["update"] = serde_json::json!({
                "comment": [{ "add": { "body": text } }]
            });
        }
        let response = self
            .client
            .post(self.url(&format!("/rest/api/3/issue/{key}/transitions")))
            .basic_auth(&self.email, Some(&self.api_token))
            .json(&body)
            .send()
            .await
            .map_err(|e| TuaError::new(ErrorCode::TrackerTransient, format!("perform_transition request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Self::failure("perform_transition", response).await.with_context("ticket_key", key.to_string()));
        }
        Ok(())
    }

    async fn add_comment(&self, key: &str, body: &str) -> Result<Comment, TuaError> {
        let response = self
            .client
            .post(self.url(&format!("/rest/api/3/issue/{key}/comment")))
            .basic_auth(&self.email, Some(&self.api_token))
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await
            .map_err(|e| TuaError::new(ErrorCode::TrackerTransient, format!("add_comment request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Self::failure("add_comment", response).await.with_context("ticket_key", key.to_string()));
        }
        let parsed: CommentEntry = response
            .json()
            .await
            .map_err(|e| TuaError::new(ErrorCode::TrackerPermanent, format!("add_comment response not valid JSON: {e}")))?;
        Ok(Comment {
            id: parsed.id,
            author: CommentAuthor {
                id: parsed.author.account_id,
                display_name: parsed.author.display_name,
            },
            created_at: parsed.created,
            body: body.to_string(),
        })
    }

    async fn download_attachment(&self, attachment: &Attachment) -> Result<Vec<u8>, TuaError> {
        let response = self
            .client
            .get(&attachment.download_url)
            .basic_auth(&self.email, Some(&self.api_token))
            .send()
            .await
            .map_err(|e| TuaError::new(ErrorCode::TrackerTransient, format!("download_attachment request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Self::failure("download_attachment", response).await.with_context("filename", attachment.filename.clone()));
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| TuaError::new(ErrorCode::TrackerTransient, format!("download_attachment body read failed: {e}")))
    }

    async fn upload_attachment(
        &self,
        key: &str,
        filename: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<(), TuaError> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime_type)
            .map_err(|e| TuaError::new(ErrorCode::Internal, format!("invalid mime type '{mime_type}': {e}")))?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let response = self
            .client
            .post(self.url(&format!("/rest/api/3/issue/{key}/attachments")))
            .basic_auth(&self.email, Some(&self.api_token))
            .header("X-Atlassian-Token", "no-check")
            .multipart(form)
            .send()
            .await
            .map_err(|e| TuaError::new(ErrorCode::TrackerTransient, format!("upload_attachment request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Self::failure("upload_attachment", response).await.with_context("filename", filename.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bot() -> CommentAuthor {
        CommentAuthor {
            id: "bot-1".into(),
            display_name: "Upload Bot".into(),
        }
    }

    fn ticket(key: &str) -> Ticket {
        Ticket {
            key: key.to_string(),
            summary: "please upload users".into(),
            description: "customersolutions+acme@x.io".into(),
            status: TicketStatus::Open,
            attachments: vec![],
            comments: vec![],
        }
    }

    #[tokio::test]
    async fn search_returns_seeded_keys_in_insertion_order() {
        let tracker = MockTracker::new(bot());
        tracker.seed(ticket("T-1"));
        tracker.seed(ticket("T-2"));
        assert_eq!(tracker.search("ignored").await.unwrap(), vec!["T-1", "T-2"]);
    }

    #[tokio::test]
    async fn add_comment_assigns_monotonic_timestamps() {
        let tracker = MockTracker::new(bot());
        tracker.seed(ticket("T-1"));
        let c1 = tracker.add_comment("T-1", "first").await.unwrap();
        let c2 = tracker.add_comment("T-1", "second").await.unwrap();
        assert!(c1.created_at < c2.created_at);
    }

    #[tokio::test]
    async fn perform_transition_updates_status_and_posts_comment() {
        let tracker = MockTracker::new(bot());
        tracker.seed(ticket("T-1"));
        let transitions = tracker.list_transitions("T-1").await.unwrap();
        let target = find_transition(&transitions, &TicketStatus::Review).unwrap();
        tracker.perform_transition("T-1", target, Some("moving to review")).await.unwrap();
        let refreshed = tracker.fetch("T-1").await.unwrap();
        assert_eq!(refreshed.status, TicketStatus::Review);
        assert_eq!(refreshed.comments.len(), 1);
        assert_eq!(refreshed.comments[0].body, "moving to review");
    }

    #[tokio::test]
    async fn upload_then_download_round_trips_bytes() {
        let tracker = MockTracker::new(bot());
        tracker.seed(ticket("T-1"));
        tracker
            .upload_attachment("T-1", "users-for-approval.csv", "text/csv", b"email\na@x.io\n".to_vec())
            .await
            .unwrap();
        let refreshed = tracker.fetch("T-1").await.unwrap();
        let attachment = &refreshed.attachments[0];
        let bytes = tracker.download_attachment(attachment).await.unwrap();
        assert_eq!(bytes, b"email\na@x.io\n");
    }

    #[test]
    fn flatten_adf_collapses_nested_document() {
        let doc = serde_json::json!({
            "type": "doc",
            "content": [
                { "type": "paragraph", "content": [{ "type": "text", "text": "approved" }] }
            ]
        });
        assert_eq!(flatten_adf(&doc), "approved");
    }

    #[test]
    fn find_transition_matches_status_case_insensitively() {
        let transitions = vec![
            Transition {
                id: "1".into(),
                to_status: TicketStatus::InfoRequired,
            },
            Transition {
                id: "2".into(),
                to_status: TicketStatus::Done,
            },
        ];
        let found = find_transition(&transitions, &TicketStatus::InfoRequired).unwrap();
        assert_eq!(found.id, "1");
    }
}
