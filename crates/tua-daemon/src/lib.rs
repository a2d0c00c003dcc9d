// SPDX-License-Identifier: MIT OR Apache-2.0
//! The run loop that drives [`tua_orchestrator`] against a ticket query:
//! a single pass (`--once`/`--single-ticket`) or a `--watch` loop that
//! sleeps [`tua_config::AgentConfig::poll_interval_seconds`] between passes.
//!
//! Cancellation is signal-aware but never interrupts a ticket mid-flight
//! (`spec.md` §5): the [`ShutdownSignal`] flag is only consulted between
//! tickets within a pass, and between passes in [`watch`].
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tua_core::{Attachment, Comment, CommentAuthor, RunSummary, Ticket};
use tua_error::TuaError;
use tua_orchestrator::AgentContext;
use tua_tracker::{Transition, Tracker};

// ---------------------------------------------------------------------------
// Shutdown signal
// ---------------------------------------------------------------------------

/// A process-wide flag set by SIGINT/SIGTERM (or Ctrl-C on non-Unix), and a
/// [`tokio::sync::Notify`] so a sleeping `--watch` loop wakes immediately
/// rather than waiting out the rest of its poll interval.
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<tokio::sync::Notify>,
}

impl ShutdownSignal {
    /// Spawn the background signal listener and return a handle to it.
    pub fn install() -> Self {
        let flag = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(tokio::sync::Notify::new());
        let (flag2, notify2) = (flag.clone(), notify.clone());
        tokio::spawn(async move {
            wait_for_signal().await;
            flag2.store(true, Ordering::SeqCst);
            notify2.notify_waiters();
        });
        ShutdownSignal { flag, notify }
    }

    /// True once a shutdown signal has been received.
    pub fn requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves as soon as a shutdown signal arrives.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

// ---------------------------------------------------------------------------
// Dry-run tracker decorator
// ---------------------------------------------------------------------------

/// Wraps a real [`Tracker`] for `--dry-run`: reads (search/fetch/list
/// transitions/download) pass through untouched, but every tracker-mutating
/// call (comment, transition, attachment upload) is logged and skipped
/// instead of sent, per `SPEC_FULL.md` §4.14.
pub struct DryRunTracker<T: Tracker> {
    inner: T,
    bot_author: CommentAuthor,
}

impl<T: Tracker> DryRunTracker<T> {
    /// Wrap `inner`. Synthetic comments returned from [`Tracker::add_comment`]
    /// are attributed to `bot_author` since no real comment is ever posted.
    pub fn new(inner: T, bot_author: CommentAuthor) -> Self {
        DryRunTracker { inner, bot_author }
    }
}

#[async_trait]
impl<T: Tracker> Tracker for DryRunTracker<T> {
    async fn search(&self, query: &str) -> Result<Vec<String>, TuaError> {
        self.inner.search(query).await
    }

    async fn fetch(&self, key: &str) -> Result<Ticket, TuaError> {
        self.inner.fetch(key).await
    }

    async fn list_transitions(&self, key: &str) -> Result<Vec<Transition>, TuaError> {
        self.inner.list_transitions(key).await
    }

    async fn perform_transition(&self, key: &str, transition: &Transition, comment: Option<&str>) -> Result<(), TuaError> {
        info!(
            ticket_key = key,
            target = %transition.to_status,
            comment = comment.unwrap_or(""),
            "dry-run: suppressing transition"
        );
        Ok(())
    }

    async fn add_comment(&self, key: &str, body: &str) -> Result<Comment, TuaError> {
        info!(ticket_key = key, body, "dry-run: suppressing comment");
        Ok(Comment {
            id: format!("dry-run-{key}"),
            author: self.bot_author.clone(),
            created_at: chrono::Utc::now(),
            body: body.to_string(),
        })
    }

    async fn download_attachment(&self, attachment: &Attachment) -> Result<Vec<u8>, TuaError> {
        self.inner.download_attachment(attachment).await
    }

    async fn upload_attachment(&self, key: &str, filename: &str, mime_type: &str, bytes: Vec<u8>) -> Result<(), TuaError> {
        info!(ticket_key = key, filename, mime_type, size = bytes.len(), "dry-run: suppressing attachment upload");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Run loop
// ---------------------------------------------------------------------------

/// Scope of one pass: every ticket matched by the configured query, or
/// exactly one ticket by key (`--single-ticket --ticket <KEY>`).
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// If set, process only this ticket key instead of running `ctx`'s
    /// configured search query.
    pub single_ticket: Option<String>,
}

/// Run one pass over the tickets in scope, advancing each by at most one
/// step and folding the outcome into a [`RunSummary`].
///
/// Errors from [`tua_orchestrator::run_ticket`] are only ever fatal ones
/// (`TuaError::is_fatal`); those propagate and end the pass immediately,
/// per `spec.md` §4.1's distinction between a vault that is merely missing
/// an entry (ticket-scoped) and one that cannot be reached at all (halts
/// the run). A ticket fetch failure is recorded as `Failed` and the pass
/// continues with the next ticket, since a single bad key should not sink
/// an otherwise-healthy run.
///
/// Every ticket's processing is timed and folded into a
/// [`tua_telemetry::MetricsCollector`]; the aggregated
/// [`tua_telemetry::RunMetricsSummary`] is logged once the pass completes.
pub async fn run_pass(ctx: &AgentContext, options: &RunOptions, shutdown: Option<&ShutdownSignal>) -> Result<RunSummary, TuaError> {
    let keys = match &options.single_ticket {
        Some(key) => vec![key.clone()],
        None => {
            let query = ctx.config.jql.clone().unwrap_or_default();
            ctx.tracker.search(&query).await?
        }
    };

    let mut summary = RunSummary::default();
    let metrics = tua_telemetry::MetricsCollector::new();
    for key in keys {
        if shutdown.map(ShutdownSignal::requested).unwrap_or(false) {
            info!("shutdown requested; stopping between tickets");
            break;
        }

        let ticket = match ctx.tracker.fetch(&key).await {
            Ok(ticket) => ticket,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(ticket_key = key, error = %e.message, "failed to fetch ticket; recording as failed");
                summary.record(&tua_core::ProcessingResult::failed());
                continue;
            }
        };

        let started = std::time::Instant::now();
        let result = tua_orchestrator::run_ticket(ctx, &ticket).await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        tua_telemetry::TicketSpan::new(key.as_str())
            .with_attribute("status", format!("{:?}", result.status))
            .with_attribute("next_state", format!("{:?}", result.next_state))
            .emit("ticket_processed");
        metrics.record(tua_telemetry::TicketMetrics {
            ticket_key: key.clone(),
            duration_ms,
            status: format!("{:?}", result.status),
            users_created: result.created_users.len() as u64,
            teams_created: result.created_teams.len() as u64,
            failures: result.failures.len() as u64,
        });
        summary.record(&result);
    }

    if !metrics.is_empty() {
        let run_metrics = metrics.summary();
        info!(
            count = run_metrics.count,
            mean_duration_ms = run_metrics.mean_duration_ms,
            p50_duration_ms = run_metrics.p50_duration_ms,
            total_users_created = run_metrics.total_users_created,
            total_teams_created = run_metrics.total_teams_created,
            "run_metrics"
        );
    }

    Ok(summary)
}

/// Run [`run_pass`] in a loop, sleeping `poll_interval` between passes,
/// until a shutdown signal arrives. The signal is checked both between
/// tickets (via [`run_pass`]) and immediately after each pass, so the loop
/// never sleeps through a pending shutdown.
pub async fn watch(ctx: &AgentContext, options: RunOptions, poll_interval: Duration) -> Result<(), TuaError> {
    let shutdown = ShutdownSignal::install();
    loop {
        let summary = run_pass(ctx, &options, Some(&shutdown)).await?;
        tua_telemetry::log_run_summary(&summary);

        if shutdown.requested() {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = shutdown.notified() => {}
        }

        if shutdown.requested() {
            break;
        }
    }
    info!("watch loop stopped cleanly");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;
    use tua_ai::{AiAdapter, StubAiAdapter};
    use tua_backend::{Backend, MockBackend};
    use tua_config::AgentConfig;
    use tua_core::TicketStatus;
    use tua_orchestrator::MinValidRows;
    use tua_tenant::{CredentialStore, VaultClient};
    use tua_tracker::MockTracker;

    fn bot_author() -> CommentAuthor {
        CommentAuthor { id: "bot-1".to_string(), display_name: "Upload Bot".to_string() }
    }

    struct StubVault {
        passwords: Map<String, String>,
    }

    #[async_trait]
    impl VaultClient for StubVault {
        async fn fetch_password(&self, lookup_key: &str) -> Result<String, TuaError> {
            self.passwords
                .get(lookup_key)
                .cloned()
                .ok_or_else(|| TuaError::new(tua_error::ErrorCode::CredentialNotFound, "no entry"))
        }
    }

    fn build_context(tracker: Arc<dyn Tracker>, passwords: Map<String, String>) -> AgentContext {
        let backend: Arc<dyn Backend> = Arc::new(MockBackend::new());
        let ai: Arc<dyn AiAdapter> = Arc::new(StubAiAdapter::default());
        let vault: Arc<dyn VaultClient> = Arc::new(StubVault { passwords });
        let credentials = CredentialStore::new(vault);
        let mut config = AgentConfig::with_defaults();
        config.tracker.domain = Some("tickets.example.com".to_string());
        AgentContext::new(config, tracker, backend, ai, credentials, Box::new(MinValidRows::default()))
    }

    fn ticket(key: &str) -> Ticket {
        Ticket {
            key: key.to_string(),
            summary: "Bulk user upload".to_string(),
            description: "tenant: acme".to_string(),
            status: TicketStatus::Open,
            attachments: Vec::new(),
            comments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn run_pass_processes_every_ticket_in_the_search_result() {
        let tracker = Arc::new(MockTracker::new(bot_author()));
        tracker.seed(ticket("UP-1"));
        tracker.seed(ticket("UP-2"));
        let ctx = build_context(tracker, Map::new());

        let summary = run_pass(&ctx, &RunOptions::default(), None).await.unwrap();
        assert_eq!(summary.total, 2);
        // both tickets lack a credential, so they end up `Pending -> Info Required`.
        assert_eq!(summary.pending, 2);
    }

    #[tokio::test]
    async fn run_pass_with_no_matching_tickets_skips_metrics_logging() {
        let tracker = Arc::new(MockTracker::new(bot_author()));
        let ctx = build_context(tracker, Map::new());

        let summary = run_pass(&ctx, &RunOptions::default(), None).await.unwrap();
        assert_eq!(summary.total, 0);
    }

    #[tokio::test]
    async fn run_pass_single_ticket_ignores_the_rest() {
        let tracker = Arc::new(MockTracker::new(bot_author()));
        tracker.seed(ticket("UP-1"));
        tracker.seed(ticket("UP-2"));
        let ctx = build_context(tracker, Map::new());

        let options = RunOptions { single_ticket: Some("UP-1".to_string()) };
        let summary = run_pass(&ctx, &options, None).await.unwrap();
        assert_eq!(summary.total, 1);
    }

    #[tokio::test]
    async fn run_pass_stops_between_tickets_when_shutdown_requested() {
        let tracker = Arc::new(MockTracker::new(bot_author()));
        tracker.seed(ticket("UP-1"));
        tracker.seed(ticket("UP-2"));
        let ctx = build_context(tracker, Map::new());

        let shutdown = ShutdownSignal { flag: Arc::new(AtomicBool::new(true)), notify: Arc::new(tokio::sync::Notify::new()) };
        let summary = run_pass(&ctx, &RunOptions::default(), Some(&shutdown)).await.unwrap();
        assert_eq!(summary.total, 0);
    }

    #[tokio::test]
    async fn dry_run_tracker_suppresses_mutations_but_passes_through_reads() {
        let tracker = MockTracker::new(bot_author());
        tracker.seed(ticket("UP-1"));
        let dry = DryRunTracker::new(tracker, bot_author());

        let keys = dry.search("").await.unwrap();
        assert_eq!(keys, vec!["UP-1".to_string()]);

        let comment = dry.add_comment("UP-1", "approved").await.unwrap();
        assert_eq!(comment.body, "approved");

        // the comment was never actually recorded against the ticket.
        let fetched = dry.fetch("UP-1").await.unwrap();
        assert!(fetched.comments.is_empty());
    }
}
