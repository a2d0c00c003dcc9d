// SPDX-License-Identifier: MIT OR Apache-2.0
//! tua-approval
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Render and parse the versioned approval marker comment, and decide the
//! approval verdict for a ticket: `approved`, `pending`, `no-request`, or
//! `invalidated`.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tua_core::{ApprovalContext, AttachmentFingerprint, Comment, TenantId, Ticket};
use tua_error::{ErrorCode, TuaError};

pub use tua_config::APPROVAL_MARKER_PREFIX as MARKER_PREFIX;

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Render an [`ApprovalContext`] into a marker comment body.
///
/// `splitting_notice`, when present, is appended as a human-readable block
/// describing a Team Splitter rewrite (`spec.md` §4.5 step 5).
pub fn render_marker(ctx: &ApprovalContext, splitting_notice: Option<&str>) -> String {
    let mut body = String::new();
    body.push_str(MARKER_PREFIX);
    body.push('\n');
    body.push_str(&format!("Ticket: {}\n", ctx.ticket_key));
    body.push_str(&format!("Tenant: {}\n", ctx.tenant));
    body.push_str(&format!("Users to create: {}\n", ctx.user_count));
    body.push_str(&format!("Teams involved: {}\n", ctx.team_count));
    body.push_str(&format!("Generated: {}\n", ctx.generated_at.to_rfc3339()));
    body.push_str("Attachments:\n");
    for fp in &ctx.attachments {
        body.push_str(&format!("  {}: {} size: {}\n", fp.filename, fp.sha256_base64, fp.size));
    }
    if let Some(notice) = splitting_notice {
        body.push_str("Note: ");
        body.push_str(notice);
        body.push('\n');
    }
    body
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// A parsed marker: the structured payload plus any team-splitting notice
/// text.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMarker {
    /// The extracted payload.
    pub context: ApprovalContext,
    /// The `Note:` line, if the marker carries one.
    pub splitting_notice: Option<String>,
}

/// Parse a marker comment body produced by [`render_marker`].
///
/// Returns [`ErrorCode::Internal`] if `body` begins with [`MARKER_PREFIX`]
/// but is otherwise malformed — this would mean a marker the agent itself
/// posted could not be read back, which is always a bug rather than
/// externally caused.
pub fn parse_marker(body: &str) -> Result<ParsedMarker, TuaError> {
    if !body.starts_with(MARKER_PREFIX) {
        return Err(TuaError::new(ErrorCode::Internal, "body does not begin with the approval marker prefix"));
    }

    let malformed = || TuaError::new(ErrorCode::Internal, "marker body is malformed").with_context("body", body);

    let mut ticket_key = None;
    let mut tenant = None;
    let mut user_count = None;
    let mut team_count = None;
    let mut generated_at = None;
    let mut attachments = Vec::new();
    let mut splitting_notice = None;
    let mut in_attachments = false;

    for line in body.lines().skip(1) {
        let trimmed = line.trim();
        if let Some(rest) = line.strip_prefix("Ticket: ") {
            ticket_key = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("Tenant: ") {
            tenant = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("Users to create: ") {
            user_count = rest.trim().parse::<usize>().ok();
        } else if let Some(rest) = line.strip_prefix("Teams involved: ") {
            team_count = rest.trim().parse::<usize>().ok();
        } else if let Some(rest) = line.strip_prefix("Generated: ") {
            generated_at = DateTime::parse_from_rfc3339(rest.trim()).ok().map(|d| d.with_timezone(&Utc));
        } else if trimmed == "Attachments:" {
            in_attachments = true;
        } else if let Some(rest) = line.strip_prefix("Note: ") {
            splitting_notice = Some(rest.trim_end().to_string());
            in_attachments = false;
        } else if in_attachments && !trimmed.is_empty() {
            attachments.push(parse_attachment_line(trimmed).ok_or_else(malformed)?);
        }
    }

    let tenant = tenant.ok_or_else(malformed)?;
    Ok(ParsedMarker {
        context: ApprovalContext {
            ticket_key: ticket_key.ok_or_else(malformed)?,
            tenant: TenantId::new(tenant).map_err(|_| malformed())?,
            user_count: user_count.ok_or_else(malformed)?,
            team_count: team_count.ok_or_else(malformed)?,
            attachments,
            generated_at: generated_at.ok_or_else(malformed)?,
        },
        splitting_notice,
    })
}

fn parse_attachment_line(line: &str) -> Option<AttachmentFingerprint> {
    // `<filename>: <base64> size: <N>`
    let (filename, rest) = line.split_once(": ")?;
    let (sha256_base64, size_part) = rest.split_once(" size: ")?;
    let size = size_part.trim().parse::<u64>().ok()?;
    Some(AttachmentFingerprint {
        filename: filename.to_string(),
        size,
        sha256_base64: sha256_base64.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// The outcome of consulting a ticket's comment history for approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalVerdict {
    /// No marker has ever been posted.
    NoRequest,
    /// A marker exists but no distinct-author `approved` response follows it.
    Pending {
        /// Id of the active marker comment.
        marker_comment_id: String,
    },
    /// An `approved` response follows the active marker and current
    /// attachment fingerprints match those it pinned.
    Approved {
        /// Id of the active marker comment.
        marker_comment_id: String,
        /// Id of the qualifying approval comment.
        approval_comment_id: String,
    },
    /// An `approved` response follows the active marker but current
    /// attachment fingerprints no longer match.
    Invalidated {
        /// Id of the active marker comment.
        marker_comment_id: String,
        /// Id of the approval comment that no longer applies.
        approval_comment_id: String,
    },
}

/// Determine the approval verdict for `ticket` given the fingerprints of
/// its current attachments.
///
/// Algorithm (`spec.md` §4.7):
/// 1. Find the chronologically latest comment beginning with
///    [`MARKER_PREFIX`] — the active marker. None → [`ApprovalVerdict::NoRequest`].
/// 2. Among comments strictly later than it, whose author id differs from
///    the active marker's author id (`spec.md` §3, "Approval Response"),
///    find the earliest whose normalized body is exactly `"approved"`. None
///    → [`ApprovalVerdict::Pending`].
/// 3. If `current_fingerprints` exactly match the marker's pinned set →
///    [`ApprovalVerdict::Approved`]; otherwise → [`ApprovalVerdict::Invalidated`].
pub fn determine_verdict(
    ticket: &Ticket,
    current_fingerprints: &[AttachmentFingerprint],
) -> Result<ApprovalVerdict, TuaError> {
    let ordered = ticket.comments_in_order();

    let marker_index = ordered.iter().rposition(|c| c.body.starts_with(MARKER_PREFIX));
    let Some(marker_index) = marker_index else {
        return Ok(ApprovalVerdict::NoRequest);
    };
    let marker = ordered[marker_index];
    let parsed = parse_marker(&marker.body)?;

    let approval = ordered[marker_index + 1..]
        .iter()
        .find(|c| c.author.id != marker.author.id && c.is_approval());

    let Some(approval) = approval else {
        return Ok(ApprovalVerdict::Pending {
            marker_comment_id: marker.id.clone(),
        });
    };

    if fingerprint_sets_match(current_fingerprints, &parsed.context.attachments) {
        Ok(ApprovalVerdict::Approved {
            marker_comment_id: marker.id.clone(),
            approval_comment_id: approval.id.clone(),
        })
    } else {
        Ok(ApprovalVerdict::Invalidated {
            marker_comment_id: marker.id.clone(),
            approval_comment_id: approval.id.clone(),
        })
    }
}

/// Compare two fingerprint lists as sets keyed by filename: same filenames
/// present, same hash and size for each.
fn fingerprint_sets_match(a: &[AttachmentFingerprint], b: &[AttachmentFingerprint]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let index = |list: &[AttachmentFingerprint]| -> BTreeMap<&str, &AttachmentFingerprint> {
        list.iter().map(|fp| (fp.filename.as_str(), fp)).collect()
    };
    let a_index = index(a);
    let b_index = index(b);
    if a_index.len() != b_index.len() {
        return false;
    }
    a_index.iter().all(|(filename, fp)| b_index.get(filename).is_some_and(|other| fp.matches(other)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tua_core::CommentAuthor;

    fn ctx(ticket_key: &str, attachments: Vec<AttachmentFingerprint>) -> ApprovalContext {
        ApprovalContext {
            ticket_key: ticket_key.to_string(),
            tenant: TenantId::new("acme").unwrap(),
            user_count: 1,
            team_count: 1,
            attachments,
            generated_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    fn comment(id: &str, author_id: &str, secs: i64, body: &str) -> Comment {
        Comment {
            id: id.to_string(),
            author: CommentAuthor {
                id: author_id.to_string(),
                display_name: author_id.to_string(),
            },
            created_at: DateTime::from_timestamp(secs, 0).unwrap(),
            body: body.to_string(),
        }
    }

    fn ticket_with(comments: Vec<Comment>) -> Ticket {
        Ticket {
            key: "T-1".to_string(),
            summary: String::new(),
            description: String::new(),
            status: tua_core::TicketStatus::Review,
            attachments: Vec::new(),
            comments,
        }
    }

    #[test]
    fn render_then_parse_round_trips() {
        let fp = AttachmentFingerprint::compute("u.csv", b"hello");
        let context = ctx("T-1", vec![fp]);
        let body = render_marker(&context, None);
        let parsed = parse_marker(&body).unwrap();
        assert_eq!(parsed.context, context);
        assert!(parsed.splitting_notice.is_none());
    }

    #[test]
    fn render_then_parse_with_splitting_notice() {
        let context = ctx("T-1", vec![]);
        let body = render_marker(&context, Some("teams were split on whitespace"));
        let parsed = parse_marker(&body).unwrap();
        assert_eq!(parsed.splitting_notice.as_deref(), Some("teams were split on whitespace"));
    }

    #[test]
    fn parse_rejects_body_without_prefix() {
        let err = parse_marker("not a marker").unwrap_err();
        assert_eq!(err.code, ErrorCode::Internal);
    }

    #[test]
    fn no_marker_is_no_request() {
        let ticket = ticket_with(vec![comment("c1", "human", 0, "hello")]);
        let verdict = determine_verdict(&ticket, &[]).unwrap();
        assert_eq!(verdict, ApprovalVerdict::NoRequest);
    }

    #[test]
    fn marker_with_no_approval_is_pending() {
        let fp = AttachmentFingerprint::compute("u.csv", b"hello");
        let marker_body = render_marker(&ctx("T-1", vec![fp]), None);
        let ticket = ticket_with(vec![comment("m1", "bot", 0, &marker_body)]);
        let verdict = determine_verdict(&ticket, &[]).unwrap();
        assert_eq!(verdict, ApprovalVerdict::Pending { marker_comment_id: "m1".into() });
    }

    /// Testable property #4 (`spec.md` §8): an `approved` comment whose
    /// author id equals the *marker's* author id is ignored, regardless of
    /// whether that author is a configured bot identity.
    #[test]
    fn approval_by_marker_author_is_ignored() {
        let fp = AttachmentFingerprint::compute("u.csv", b"hello");
        let marker_body = render_marker(&ctx("T-1", vec![fp.clone()]), None);
        let ticket = ticket_with(vec![
            comment("m1", "bot", 0, &marker_body),
            comment("c1", "bot", 10, "approved"),
        ]);
        let verdict = determine_verdict(&ticket, &[fp]).unwrap();
        assert_eq!(verdict, ApprovalVerdict::Pending { marker_comment_id: "m1".into() });
    }

    /// Same property, but the marker's author is not a bot at all (e.g. a
    /// human re-posted a request manually) — author-id equality with the
    /// marker, not a configured bot identity, is what excludes the comment.
    #[test]
    fn approval_by_non_bot_marker_author_is_ignored() {
        let fp = AttachmentFingerprint::compute("u.csv", b"hello");
        let marker_body = render_marker(&ctx("T-1", vec![fp.clone()]), None);
        let ticket = ticket_with(vec![
            comment("m1", "human-a", 0, &marker_body),
            comment("c1", "human-a", 10, "approved"),
        ]);
        let verdict = determine_verdict(&ticket, &[fp]).unwrap();
        assert_eq!(verdict, ApprovalVerdict::Pending { marker_comment_id: "m1".into() });
    }

    #[test]
    fn matching_fingerprints_after_approval_is_approved() {
        let fp = AttachmentFingerprint::compute("u.csv", b"hello");
        let marker_body = render_marker(&ctx("T-1", vec![fp.clone()]), None);
        let ticket = ticket_with(vec![
            comment("m1", "bot", 0, &marker_body),
            comment("c1", "human", 10, "approved"),
        ]);
        let verdict = determine_verdict(&ticket, &[fp]).unwrap();
        assert_eq!(
            verdict,
            ApprovalVerdict::Approved {
                marker_comment_id: "m1".into(),
                approval_comment_id: "c1".into()
            }
        );
    }

    #[test]
    fn mutated_attachment_invalidates_the_approval() {
        let fp_a = AttachmentFingerprint::compute("u.csv", b"hello");
        let fp_b = AttachmentFingerprint::compute("u.csv", b"hellO");
        let marker_body = render_marker(&ctx("T-1", vec![fp_a]), None);
        let ticket = ticket_with(vec![
            comment("m1", "bot", 0, &marker_body),
            comment("c1", "human", 10, "approved"),
        ]);
        let verdict = determine_verdict(&ticket, &[fp_b]).unwrap();
        assert_eq!(
            verdict,
            ApprovalVerdict::Invalidated {
                marker_comment_id: "m1".into(),
                approval_comment_id: "c1".into()
            }
        );
    }

    #[test]
    fn latest_of_two_markers_wins_and_earlier_approval_is_ignored() {
        let fp = AttachmentFingerprint::compute("u.csv", b"hello");
        let m1 = render_marker(&ctx("T-1", vec![fp.clone()]), None);
        let m2 = render_marker(&ctx("T-1", vec![fp.clone()]), None);
        let ticket = ticket_with(vec![
            comment("m1", "bot", 0, &m1),
            comment("c1", "human", 5, "approved"),
            comment("m2", "bot", 10, &m2),
        ]);
        let verdict = determine_verdict(&ticket, &[fp]).unwrap();
        assert_eq!(verdict, ApprovalVerdict::Pending { marker_comment_id: "m2".into() });
    }

    #[test]
    fn earliest_qualifying_approval_after_marker_is_taken() {
        let fp = AttachmentFingerprint::compute("u.csv", b"hello");
        let marker_body = render_marker(&ctx("T-1", vec![fp.clone()]), None);
        let ticket = ticket_with(vec![
            comment("m1", "bot", 0, &marker_body),
            comment("c1", "human-a", 10, "approved"),
            comment("c2", "human-b", 20, "approved"),
        ]);
        let verdict = determine_verdict(&ticket, &[fp]).unwrap();
        assert_eq!(
            verdict,
            ApprovalVerdict::Approved {
                marker_comment_id: "m1".into(),
                approval_comment_id: "c1".into()
            }
        );
    }
}
