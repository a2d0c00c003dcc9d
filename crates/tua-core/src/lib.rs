// SPDX-License-Identifier: MIT OR Apache-2.0
//! tua-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable domain contract for the ticket upload agent: the types every
//! other crate in the workspace exchanges, plus the handful of pure
//! functions (fingerprinting, tenant parsing, ordering) that have no
//! external-system dependency of their own.

/// Validated datasets, rows, and field-level validation reports.
pub mod report;

use base64::Engine;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

// ---------------------------------------------------------------------------
// Ticket
// ---------------------------------------------------------------------------

/// A ticket's lifecycle status as understood by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    /// Newly seen or reset to the start of the pipeline.
    Open,
    /// Awaiting or re-checking an approval response.
    Review,
    /// Blocked on a human providing missing information.
    InfoRequired,
    /// Terminal: fully processed.
    Done,
    /// Any tracker status this agent does not act on.
    Other(String),
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TicketStatus::Open => write!(f, "Open"),
            TicketStatus::Review => write!(f, "Review"),
            TicketStatus::InfoRequired => write!(f, "Info Required"),
            TicketStatus::Done => write!(f, "Done"),
            TicketStatus::Other(s) => write!(f, "{s}"),
        }
    }
}

/// An issue-tracker ticket, as far as this agent needs to know about one.
///
/// Immutable to the agent except through explicit tracker API calls; the
/// agent never mutates a `Ticket` value in place to mean "I changed the
/// tracker" — it issues a call and, on the next fetch, observes the result.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Ticket {
    /// Opaque tracker-assigned key, e.g. `"UP-142"`.
    pub key: String,
    /// One-line summary.
    pub summary: String,
    /// Free-text description, searched for tenant hints.
    pub description: String,
    /// Current tracker status.
    pub status: TicketStatus,
    /// Attachments in tracker-reported order (re-sorted by filename before
    /// processing; see [`sort_attachments_by_filename`]).
    pub attachments: Vec<Attachment>,
    /// Comments, authoritative order is by `created_at` then `id` ascending.
    pub comments: Vec<Comment>,
}

impl Ticket {
    /// Comments in authoritative order: `created_at` ascending, ties broken
    /// by `id` ascending.
    pub fn comments_in_order(&self) -> Vec<&Comment> {
        let mut ordered: Vec<&Comment> = self.comments.iter().collect();
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        ordered
    }
}

/// An attachment referenced by a [`Ticket`].
///
/// Byte contents are populated only for the duration of one processing pass
/// (after a fetch) and are never persisted between passes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Attachment {
    /// Original filename as reported by the tracker.
    pub filename: String,
    /// Reported MIME type.
    pub mime_type: String,
    /// Reported byte size.
    pub size: u64,
    /// URL the agent downloads the content from.
    pub download_url: String,
    /// Content bytes, present only after a fetch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<Vec<u8>>,
}

/// Sort attachments by filename, ascending, for deterministic processing
/// and concatenation order (`spec.md` §5).
pub fn sort_attachments_by_filename(attachments: &mut [Attachment]) {
    attachments.sort_by(|a, b| a.filename.cmp(&b.filename));
}

/// The author of a [`Comment`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CommentAuthor {
    /// Tracker-assigned account id.
    pub id: String,
    /// Display name at the time the comment was fetched.
    pub display_name: String,
}

/// A single comment on a [`Ticket`].
///
/// `body` is already collapsed to plain text (structured-document bodies
/// are flattened by the tracker client before this type is constructed).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Comment {
    /// Tracker-assigned comment id.
    pub id: String,
    /// Who posted it.
    pub author: CommentAuthor,
    /// When it was posted; authoritative for ordering.
    pub created_at: DateTime<Utc>,
    /// Plain-text body.
    pub body: String,
}

impl Comment {
    /// `body`, lowercased with internal whitespace collapsed to single
    /// spaces and leading/trailing whitespace trimmed — the normalized
    /// form the Approval Engine compares against the literal `"approved"`.
    pub fn normalized_body(&self) -> String {
        self.body.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
    }

    /// True if [`Self::normalized_body`] is exactly `"approved"`.
    pub fn is_approval(&self) -> bool {
        self.normalized_body() == "approved"
    }
}

// ---------------------------------------------------------------------------
// User role
// ---------------------------------------------------------------------------

/// The closed set of roles a [`report::UserRow`] may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum UserRole {
    /// `TEAM MEMBER`
    TeamMember,
    /// `MANAGER`
    Manager,
    /// `MONITOR`
    Monitor,
    /// `ADMINISTRATOR`
    Administrator,
    /// `COMPANY ADMINISTRATOR`
    CompanyAdministrator,
}

impl UserRole {
    /// The canonical upper-case wire form, e.g. `"TEAM MEMBER"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::TeamMember => "TEAM MEMBER",
            UserRole::Manager => "MANAGER",
            UserRole::Monitor => "MONITOR",
            UserRole::Administrator => "ADMINISTRATOR",
            UserRole::CompanyAdministrator => "COMPANY ADMINISTRATOR",
        }
    }

    /// Parse a role from an already trimmed, upper-cased string.
    ///
    /// Returns `None` if `s` is not one of the closed set of roles.
    pub fn parse_upper(s: &str) -> Option<Self> {
        match s {
            "TEAM MEMBER" => Some(UserRole::TeamMember),
            "MANAGER" => Some(UserRole::Manager),
            "MONITOR" => Some(UserRole::Monitor),
            "ADMINISTRATOR" => Some(UserRole::Administrator),
            "COMPANY ADMINISTRATOR" => Some(UserRole::CompanyAdministrator),
            _ => None,
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tenant
// ---------------------------------------------------------------------------

/// Error returned when a candidate tenant identifier fails validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantIdError {
    /// The rejected candidate string.
    pub candidate: String,
}

impl fmt::Display for TenantIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' is not a valid tenant id (expected 2-50 lowercase alphanumeric, '-' or '_' characters)",
            self.candidate
        )
    }
}

impl std::error::Error for TenantIdError {}

/// A validated tenant identifier: lowercase, 2-50 chars, alphanumeric plus
/// `-`/`_`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Validate and construct a [`TenantId`] from an already-lowercased
    /// candidate string.
    pub fn new(candidate: impl Into<String>) -> Result<Self, TenantIdError> {
        let candidate = candidate.into();
        let len_ok = (2..=50).contains(&candidate.chars().count());
        let charset_ok = !candidate.is_empty()
            && candidate
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if len_ok && charset_ok {
            Ok(TenantId(candidate))
        } else {
            Err(TenantIdError { candidate })
        }
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tenant: a validated identifier bound to a service-account email and,
/// once acquired, a vault-sourced password.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Tenant {
    /// The validated identifier.
    pub id: TenantId,
    /// Service-account email, derived from `vault.email_template`.
    pub service_account_email: String,
}

// ---------------------------------------------------------------------------
// Fingerprints
// ---------------------------------------------------------------------------

/// `{filename, size, sha256_base64}` over an attachment's raw bytes.
///
/// The hash is content-only; filename and size are descriptive metadata
/// pinned alongside it, not inputs to the digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AttachmentFingerprint {
    /// Attachment filename at fingerprint time.
    pub filename: String,
    /// Byte length of the fingerprinted content.
    pub size: u64,
    /// Standard (padded) Base64 encoding of the SHA-256 digest.
    pub sha256_base64: String,
}

impl AttachmentFingerprint {
    /// Compute the fingerprint of `bytes` under `filename`.
    ///
    /// # Examples
    ///
    /// ```
    /// use tua_core::AttachmentFingerprint;
    ///
    /// let fp = AttachmentFingerprint::compute("u.csv", b"hello");
    /// assert_eq!(fp.filename, "u.csv");
    /// assert_eq!(fp.size, 5);
    /// ```
    pub fn compute(filename: impl Into<String>, bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        let sha256_base64 = base64::engine::general_purpose::STANDARD.encode(digest);
        AttachmentFingerprint {
            filename: filename.into(),
            size: bytes.len() as u64,
            sha256_base64,
        }
    }

    /// True if `self` and `other` describe the same content under the same
    /// filename (same filename, same size, same hash).
    pub fn matches(&self, other: &AttachmentFingerprint) -> bool {
        self.filename == other.filename && self.size == other.size && self.sha256_base64 == other.sha256_base64
    }
}

// ---------------------------------------------------------------------------
// Approval context
// ---------------------------------------------------------------------------

/// The payload materialized into an approval marker comment.
///
/// Round-trip serializable from/to the comment body by `tua-approval`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalContext {
    /// The ticket this context was generated for.
    pub ticket_key: String,
    /// Resolved tenant identifier.
    pub tenant: TenantId,
    /// Number of valid users proposed for creation.
    pub user_count: usize,
    /// Number of distinct teams involved.
    pub team_count: usize,
    /// Fingerprints of every attachment considered, in attachment order.
    pub attachments: Vec<AttachmentFingerprint>,
    /// When this context (and its marker) was generated.
    pub generated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Processing result
// ---------------------------------------------------------------------------

/// Outcome of advancing a single ticket by one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    /// Everything requested succeeded.
    Success,
    /// Some but not all requested creations succeeded.
    Partial,
    /// Waiting on an external actor (approval, vault, tracker retry).
    Pending,
    /// Not a user-upload ticket, or otherwise out of scope; no action taken.
    Skipped,
    /// The pass failed outright (e.g. a tracker error) with no state change.
    Failed,
}

/// What failed, for a [`Failure`] entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum FailureSubject {
    /// A user creation failed, keyed by email.
    Email(String),
    /// A team creation failed, keyed by team name.
    Team(String),
}

/// A single per-item failure surfaced in a completion comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Failure {
    /// The user or team that failed.
    pub subject: FailureSubject,
    /// Human-readable reason, suitable for a ticket comment.
    pub reason: String,
}

/// Per-ticket outcome of one orchestrator pass.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProcessingResult {
    /// Overall status of this pass.
    pub status: ProcessingStatus,
    /// Emails of users created this pass.
    pub created_users: Vec<String>,
    /// Emails of users found to already exist.
    pub existing_users: Vec<String>,
    /// Names of teams created this pass.
    pub created_teams: Vec<String>,
    /// Per-item failures, if any.
    pub failures: Vec<Failure>,
    /// Tracker status the ticket should transition to, if any.
    pub next_state: Option<TicketStatus>,
}

impl ProcessingResult {
    /// A result representing "not a user-upload ticket, nothing done".
    pub fn skipped() -> Self {
        ProcessingResult {
            status: ProcessingStatus::Skipped,
            created_users: Vec::new(),
            existing_users: Vec::new(),
            created_teams: Vec::new(),
            failures: Vec::new(),
            next_state: None,
        }
    }

    /// A result representing "nothing to do yet, still pending".
    pub fn pending(next_state: Option<TicketStatus>) -> Self {
        ProcessingResult {
            status: ProcessingStatus::Pending,
            created_users: Vec::new(),
            existing_users: Vec::new(),
            created_teams: Vec::new(),
            failures: Vec::new(),
            next_state,
        }
    }

    /// A result representing "the pass failed, nothing changed".
    pub fn failed() -> Self {
        ProcessingResult {
            status: ProcessingStatus::Failed,
            created_users: Vec::new(),
            existing_users: Vec::new(),
            created_teams: Vec::new(),
            failures: Vec::new(),
            next_state: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Run summary
// ---------------------------------------------------------------------------

/// An in-memory tally of [`ProcessingResult`]s across one run, used by the
/// CLI/daemon to decide the process exit code and by telemetry to emit a
/// single end-of-run summary log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RunSummary {
    /// Tickets seen this run.
    pub total: u32,
    /// Tickets that ended `Success`.
    pub succeeded: u32,
    /// Tickets that ended `Partial`.
    pub partial: u32,
    /// Tickets that ended `Pending`.
    pub pending: u32,
    /// Tickets that ended `Skipped`.
    pub skipped: u32,
    /// Tickets that ended `Failed`.
    pub failed: u32,
}

impl RunSummary {
    /// Fold one ticket's result into the running tally.
    pub fn record(&mut self, result: &ProcessingResult) {
        self.total += 1;
        match result.status {
            ProcessingStatus::Success => self.succeeded += 1,
            ProcessingStatus::Partial => self.partial += 1,
            ProcessingStatus::Pending => self.pending += 1,
            ProcessingStatus::Skipped => self.skipped += 1,
            ProcessingStatus::Failed => self.failed += 1,
        }
    }

    /// `0` if no ticket failed outright this run, `1` otherwise — the
    /// process exit code per `spec.md` §6.
    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 {
            1
        } else {
            0
        }
    }
}
