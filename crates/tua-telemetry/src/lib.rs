// SPDX-License-Identifier: MIT OR Apache-2.0
//! Structured logging setup and per-run metrics collection.
//!
//! Every log record that concerns a specific ticket carries a `ticket_key`
//! field, per `spec.md` §7's logging policy. Error-path logging inlines the
//! field directly at the call site where the surrounding error already
//! needs `warn!`/`error!`; [`TicketSpan`] is used for the per-ticket
//! lifecycle event `tua-daemon` emits once a ticket's processing
//! completes, and [`MetricsCollector`] aggregates the accompanying timing
//! data into a [`RunMetricsSummary`] logged at the end of each pass.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Logging setup
// ---------------------------------------------------------------------------

/// Initialize the global `tracing` subscriber.
///
/// `log_level` is the configured default (`trace`/`debug`/`info`/`warn`/
/// `error`); `verbose` (the CLI's `--verbose` flag) always raises the
/// effective level to `debug` regardless of what `log_level` says, per
/// `SPEC_FULL.md` §4.13. Output is one JSON record per event.
pub fn init_logging(log_level: &str, verbose: bool) {
    let directive = if verbose {
        "tua=debug".to_string()
    } else {
        format!("tua={log_level}")
    };
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("tua=info"));
    tracing_subscriber::fmt().with_env_filter(filter).json().init();
}

// ---------------------------------------------------------------------------
// Per-ticket structured logging
// ---------------------------------------------------------------------------

/// A structured log span scoped to one ticket; every field recorded through
/// it carries `ticket_key` automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketSpan {
    /// The ticket this span concerns.
    pub ticket_key: String,
    /// Arbitrary key-value attributes, deterministically ordered.
    pub attributes: BTreeMap<String, String>,
}

impl TicketSpan {
    /// Start a span for `ticket_key`.
    pub fn new(ticket_key: impl Into<String>) -> Self {
        TicketSpan {
            ticket_key: ticket_key.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Attach an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Emit one structured log record for `event` at `info` level.
    pub fn emit(&self, event: &str) {
        info!(
            ticket_key = %self.ticket_key,
            attributes = ?self.attributes,
            event,
        );
    }
}

// ---------------------------------------------------------------------------
// Run metrics
// ---------------------------------------------------------------------------

/// Metrics captured for a single ticket's processing pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TicketMetrics {
    /// The ticket processed.
    pub ticket_key: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Final status of the pass (`success`/`partial`/`pending`/`skipped`/`failed`).
    pub status: String,
    /// Number of users created this pass.
    pub users_created: u64,
    /// Number of teams created this pass.
    pub teams_created: u64,
    /// Number of per-item failures reported this pass.
    pub failures: u64,
}

/// Aggregated statistics across every ticket processed in one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMetricsSummary {
    /// Number of tickets processed.
    pub count: usize,
    /// Mean per-ticket duration in milliseconds.
    pub mean_duration_ms: f64,
    /// Median (p50) per-ticket duration in milliseconds.
    pub p50_duration_ms: f64,
    /// Per-status run counts (deterministic ordering).
    pub status_counts: BTreeMap<String, usize>,
    /// Total users created across the run.
    pub total_users_created: u64,
    /// Total teams created across the run.
    pub total_teams_created: u64,
}

impl Default for RunMetricsSummary {
    fn default() -> Self {
        RunMetricsSummary {
            count: 0,
            mean_duration_ms: 0.0,
            p50_duration_ms: 0.0,
            status_counts: BTreeMap::new(),
            total_users_created: 0,
            total_teams_created: 0,
        }
    }
}

fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0] as f64;
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] as f64 * (1.0 - frac) + sorted[upper] as f64 * frac
}

/// Thread-safe collector for per-ticket metrics across one run.
///
/// Wrap in an `Arc` (or clone; the inner storage is already `Arc<Mutex<_>>`)
/// to share across tickets processed within concurrent attachment downloads.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    inner: Arc<Mutex<Vec<TicketMetrics>>>,
}

impl MetricsCollector {
    /// Create a new, empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one ticket's metrics.
    pub fn record(&self, metrics: TicketMetrics) {
        self.inner.lock().expect("metrics lock poisoned").push(metrics);
    }

    /// All recorded metrics, in recording order.
    pub fn runs(&self) -> Vec<TicketMetrics> {
        self.inner.lock().expect("metrics lock poisoned").clone()
    }

    /// Number of tickets recorded so far.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("metrics lock poisoned").len()
    }

    /// Whether no tickets have been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregate everything recorded so far into a [`RunMetricsSummary`].
    pub fn summary(&self) -> RunMetricsSummary {
        let data = self.inner.lock().expect("metrics lock poisoned");
        if data.is_empty() {
            return RunMetricsSummary::default();
        }

        let count = data.len();
        let mut durations: Vec<u64> = data.iter().map(|m| m.duration_ms).collect();
        durations.sort_unstable();
        let mean_duration_ms = durations.iter().sum::<u64>() as f64 / count as f64;
        let p50_duration_ms = percentile(&durations, 50.0);

        let mut status_counts: BTreeMap<String, usize> = BTreeMap::new();
        for m in data.iter() {
            *status_counts.entry(m.status.clone()).or_insert(0) += 1;
        }

        RunMetricsSummary {
            count,
            mean_duration_ms,
            p50_duration_ms,
            status_counts,
            total_users_created: data.iter().map(|m| m.users_created).sum(),
            total_teams_created: data.iter().map(|m| m.teams_created).sum(),
        }
    }
}

/// Emit one end-of-run summary log line from a [`tua_core::RunSummary`].
pub fn log_run_summary(summary: &tua_core::RunSummary) {
    info!(
        total = summary.total,
        succeeded = summary.succeeded,
        partial = summary.partial,
        pending = summary.pending,
        skipped = summary.skipped,
        failed = summary.failed,
        exit_code = summary.exit_code(),
        "run_summary"
    );
}
