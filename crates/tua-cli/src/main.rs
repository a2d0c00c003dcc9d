// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! `tua`: the command-line entry point that drives the ticket upload agent
//! core (`tua-orchestrator`) via the run loop in `tua-daemon`.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tua_ai::{AiAdapter, HttpAiAdapter, StubAiAdapter};
use tua_backend::{Backend, HttpBackend, MockBackend};
use tua_config::AgentConfig;
use tua_core::CommentAuthor;
use tua_daemon::{DryRunTracker, RunOptions};
use tua_orchestrator::{AgentContext, MinValidRows};
use tua_tenant::{CredentialStore, ProcessVaultClient, VaultClient};
use tua_tracker::{HttpTracker, Tracker};

/// Exit code for a successful or partial-success run.
const EXIT_OK: i32 = 0;
/// Exit code for missing prerequisites or an uncaught error.
const EXIT_ERROR: i32 = 1;

/// Reconciles bulk user-upload tickets against a downstream identity backend.
#[derive(Parser, Debug)]
#[command(name = "tua", version, about = "Ticket upload agent")]
struct Cli {
    /// Run one pass and exit (the default if `--watch` is not given).
    #[arg(long)]
    once: bool,

    /// Poll continuously, sleeping between passes until SIGINT/SIGTERM.
    #[arg(long)]
    watch: bool,

    /// Poll interval in seconds for `--watch`, overriding the configured
    /// `poll_interval_seconds`.
    #[arg(long)]
    interval: Option<u64>,

    /// Process exactly one ticket by key instead of running the configured
    /// search query. Requires `--ticket`.
    #[arg(long)]
    single_ticket: bool,

    /// The ticket key to process with `--single-ticket`.
    #[arg(long)]
    ticket: Option<String>,

    /// Run the full pipeline (including LLM calls) but never mutate the
    /// tracker or the identity backend: tracker writes are logged instead
    /// of sent, and the identity backend is always the in-memory mock.
    #[arg(long)]
    dry_run: bool,

    /// Raise the effective log level to `debug` regardless of configuration.
    #[arg(long)]
    verbose: bool,

    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let config = match load_effective_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return EXIT_ERROR;
        }
    };

    let log_level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    tua_telemetry::init_logging(&log_level, cli.verbose);

    match tua_config::validate_config(&config) {
        Ok(warnings) => {
            for warning in warnings {
                tracing::warn!(%warning, "configuration warning");
            }
        }
        Err(e) => {
            error!(error = %e, "configuration is invalid");
            return EXIT_ERROR;
        }
    }

    if cli.single_ticket && cli.ticket.is_none() {
        eprintln!("error: --single-ticket requires --ticket <KEY>");
        return EXIT_ERROR;
    }

    let ctx = match build_context(&config, cli.dry_run) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("error: {e:#}");
            return EXIT_ERROR;
        }
    };

    let options = RunOptions { single_ticket: cli.ticket.clone() };

    let outcome = if cli.watch && !cli.single_ticket {
        let interval = Duration::from_secs(cli.interval.unwrap_or(ctx.config.poll_interval_seconds));
        tua_daemon::watch(&ctx, options, interval).await.map(|()| EXIT_OK)
    } else {
        tua_daemon::run_pass(&ctx, &options, None).await.map(|summary| {
            info!(
                total = summary.total,
                succeeded = summary.succeeded,
                partial = summary.partial,
                pending = summary.pending,
                skipped = summary.skipped,
                failed = summary.failed,
                "pass complete"
            );
            summary.exit_code()
        })
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            error!(code = %e.code, error = %e.message, "run halted by a fatal error");
            EXIT_ERROR
        }
    }
}

/// Load the file-backed (or default) configuration, apply environment
/// overrides (inside [`tua_config::load_config`]), then merge a CLI-flag
/// overlay on top so flags always win, per `SPEC_FULL.md` §4.11.
fn load_effective_config(cli: &Cli) -> Result<AgentConfig> {
    let base = tua_config::load_config(cli.config.as_deref())
        .with_context(|| format!("load config {:?}", cli.config))?;

    let mut overlay = AgentConfig::with_defaults();
    if let Some(interval) = cli.interval {
        overlay.poll_interval_seconds = interval;
    }
    if cli.dry_run {
        overlay.backend.mock = true;
    }

    Ok(tua_config::merge_configs(base, overlay))
}

fn build_context(config: &AgentConfig, dry_run: bool) -> Result<AgentContext> {
    let domain = config
        .tracker
        .domain
        .clone()
        .context("tracker.domain is required")?;
    let email = config
        .tracker
        .email
        .clone()
        .context("tracker.email is required")?;
    let api_token = config
        .tracker
        .api_token
        .clone()
        .context("tracker.api_token is required")?;

    let http_tracker =
        HttpTracker::new(format!("https://{domain}"), email, api_token).context("construct tracker client")?;
    let bot_author = CommentAuthor {
        id: config.tracker.bot_account_id.clone().unwrap_or_else(|| "tua-bot".to_string()),
        display_name: config.tracker.bot_account_name.clone().unwrap_or_else(|| "Ticket Upload Agent".to_string()),
    };
    let tracker: Arc<dyn Tracker> = if dry_run {
        Arc::new(DryRunTracker::new(http_tracker, bot_author))
    } else {
        Arc::new(http_tracker)
    };

    let backend: Arc<dyn Backend> = if config.backend.mock || dry_run {
        Arc::new(MockBackend::new())
    } else {
        let base_url = config.backend.base_url.clone().context("backend.base_url is required when backend.mock is false")?;
        Arc::new(HttpBackend::new(base_url).context("construct backend client")?)
    };

    let ai: Arc<dyn AiAdapter> = match &config.ai.api_key {
        Some(api_key) => {
            let base_url = config.ai.base_url.clone().unwrap_or_else(|| "https://api.openai.com/v1".to_string());
            let model = config.ai.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
            Arc::new(HttpAiAdapter::new(base_url, api_key.clone(), model).context("construct AI adapter client")?)
        }
        None => {
            tracing::warn!("ai.api_key not set; falling back to the deterministic stub adapter");
            Arc::new(StubAiAdapter::default())
        }
    };

    let vault_client: Arc<dyn VaultClient> = {
        let binary = config.vault.binary.clone().context("vault.binary is required")?;
        Arc::new(ProcessVaultClient::new(binary, config.vault.vault_name.clone()))
    };
    let credentials = CredentialStore::new(vault_client);

    Ok(AgentContext::new(
        config.clone(),
        tracker,
        backend,
        ai,
        credentials,
        Box::new(MinValidRows::default()),
    ))
}
