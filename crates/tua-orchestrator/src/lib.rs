// SPDX-License-Identifier: MIT OR Apache-2.0
//! The ticket state machine: given one ticket, decide what (if anything)
//! needs doing, do it, and report the outcome.
//!
//! [`process_ticket`] dispatches on [`tua_core::TicketStatus`] and never
//! talks to the tracker/backend/vault/AI directly outside of the trait
//! objects carried on [`AgentContext`], so the whole pipeline is testable
//! against in-memory doubles.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod comments;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use tua_ai::{AiAdapter, BlockingHeaderOracle, BlockingSheetOracle};
use tua_approval::ApprovalVerdict;
use tua_backend::{Backend, Session};
use tua_config::AgentConfig;
use tua_core::report::{Dataset, UserRow};
use tua_core::{
    sort_attachments_by_filename, ApprovalContext, Failure, FailureSubject, ProcessingResult,
    ProcessingStatus, TenantId, Ticket, TicketStatus, UserRole,
};
use tua_dataset::{fingerprint, normalizer, parser, teams, NormalizedRow};
use tua_error::{ErrorCode, TuaError};
use tua_tenant::{CredentialLookup, CredentialStore, VaultClient};
use tua_tracker::{find_transition, Tracker};

/// Default service-account email template, used when
/// [`tua_config::VaultConfig::email_template`] is unset.
const DEFAULT_EMAIL_TEMPLATE: &str = "customersolutions+%s@<domain>";

// ---------------------------------------------------------------------------
// Approval policy
// ---------------------------------------------------------------------------

/// Decides whether a dataset requires a human approval round before
/// user/team creation proceeds.
pub trait ApprovalPolicy: Send + Sync {
    /// Whether `dataset` requires approval before being acted on.
    fn requires_approval(&self, dataset: &Dataset) -> bool;
}

/// Default policy: any dataset with at least `0` threshold valid rows
/// requires approval; constructed with `1` this means any non-empty valid
/// dataset requires approval, matching `spec.md`'s stated default.
pub struct MinValidRows(pub usize);

impl Default for MinValidRows {
    fn default() -> Self {
        MinValidRows(1)
    }
}

impl ApprovalPolicy for MinValidRows {
    fn requires_approval(&self, dataset: &Dataset) -> bool {
        dataset.valid_count() >= self.0
    }
}

// ---------------------------------------------------------------------------
// AgentContext
// ---------------------------------------------------------------------------

/// Everything one ticket's processing pass needs, shared (read-mostly)
/// across every ticket processed within a run.
pub struct AgentContext {
    /// Loaded and validated runtime configuration.
    pub config: AgentConfig,
    /// Issue tracker client.
    pub tracker: Arc<dyn Tracker>,
    /// Identity backend client.
    pub backend: Arc<dyn Backend>,
    /// LLM adapter.
    pub ai: Arc<dyn AiAdapter>,
    /// Vault-backed, process-wide credential cache.
    pub credentials: CredentialStore<Arc<dyn VaultClient>>,
    /// Approval-required policy.
    pub approval_policy: Box<dyn ApprovalPolicy>,
    sessions: RwLock<HashMap<TenantId, Session>>,
}

impl AgentContext {
    /// Construct a context over the given runtime dependencies.
    pub fn new(
        config: AgentConfig,
        tracker: Arc<dyn Tracker>,
        backend: Arc<dyn Backend>,
        ai: Arc<dyn AiAdapter>,
        credentials: CredentialStore<Arc<dyn VaultClient>>,
        approval_policy: Box<dyn ApprovalPolicy>,
    ) -> Self {
        AgentContext {
            config,
            tracker,
            backend,
            ai,
            credentials,
            approval_policy,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Reuse a cached session for `tenant`, logging in only on the first
    /// call this run. Sessions never expire within a run; a backend
    /// rejecting a stale token would surface as a per-ticket failure on the
    /// next call, which is an accepted limitation (see `DESIGN.md`).
    async fn session_for(&self, tenant: &TenantId, email: &str, password: &str) -> Result<Session, TuaError> {
        if let Some(session) = self.sessions.read().await.get(tenant) {
            return Ok(session.clone());
        }
        let session = self.backend.login(email, password).await?;
        self.sessions.write().await.insert(tenant.clone(), session.clone());
        Ok(session)
    }

    fn email_template(&self) -> &str {
        self.config.vault.email_template.as_deref().unwrap_or(DEFAULT_EMAIL_TEMPLATE)
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Process one ticket, converting any non-fatal error into a
/// [`ProcessingResult::failed`] rather than letting it halt the run. Only
/// [`TuaError::is_fatal`] errors (an unreachable vault, invalid config) are
/// propagated, since those mean the run as a whole cannot continue safely.
///
/// This is the entry point [`tua_daemon`]/`tua-cli`'s run loop calls; use
/// [`process_ticket`] directly in tests that want to assert on the raw
/// `Result`.
pub async fn run_ticket(ctx: &AgentContext, ticket: &Ticket) -> Result<ProcessingResult, TuaError> {
    match process_ticket(ctx, ticket).await {
        Ok(result) => Ok(result),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!(ticket_key = %ticket.key, code = %e.code, error = %e.message, "ticket processing failed; marking failed rather than halting the run");
            Ok(ProcessingResult::failed())
        }
    }
}

/// Dispatch on a ticket's current status. See the module docs for the
/// state machine this implements.
pub async fn process_ticket(ctx: &AgentContext, ticket: &Ticket) -> Result<ProcessingResult, TuaError> {
    match &ticket.status {
        TicketStatus::Open => process_open(ctx, ticket).await,
        TicketStatus::Review => process_review(ctx, ticket).await,
        TicketStatus::InfoRequired | TicketStatus::Done | TicketStatus::Other(_) => Ok(ProcessingResult::skipped()),
    }
}

// ---------------------------------------------------------------------------
// Open
// ---------------------------------------------------------------------------

async fn process_open(ctx: &AgentContext, ticket: &Ticket) -> Result<ProcessingResult, TuaError> {
    let ticket_text = format!("{}\n{}", ticket.summary, ticket.description);

    match ctx.ai.classify_intent(&ticket_text).await {
        Ok(intent) if intent.is_user_upload => {}
        Ok(_) => return Ok(ProcessingResult::skipped()),
        Err(e) => {
            warn!(ticket_key = %ticket.key, error = %e.message, "intent classification failed; skipping ticket");
            return Ok(ProcessingResult::skipped());
        }
    }

    let Some(tenant) = tua_tenant::extract_tenant(&ticket_text, ctx.config.tracker.domain.as_deref()) else {
        return match guard_tracker(
            ticket,
            "post missing-tenant comment",
            post_comment_and_transition(ctx, ticket, comments::missing_tenant_notice(), TicketStatus::InfoRequired),
        )
        .await
        {
            Ok(()) => Ok(ProcessingResult::pending(Some(TicketStatus::InfoRequired))),
            Err(result) => Ok(result),
        };
    };

    let credential = match acquire_credential(ctx, ticket, &tenant).await? {
        Ok(credential) => credential,
        Err(result) => return Ok(result),
    };

    let Ok(fetched) = download_all(ctx, ticket).await else {
        return Ok(ProcessingResult::failed());
    };

    continue_from_attachments(ctx, ticket, &tenant, &credential, fetched).await
}

// ---------------------------------------------------------------------------
// Review
// ---------------------------------------------------------------------------

async fn process_review(ctx: &AgentContext, ticket: &Ticket) -> Result<ProcessingResult, TuaError> {
    let ticket_text = format!("{}\n{}", ticket.summary, ticket.description);
    let Some(tenant) = tua_tenant::extract_tenant(&ticket_text, ctx.config.tracker.domain.as_deref()) else {
        warn!(ticket_key = %ticket.key, "ticket in review no longer yields an extractable tenant");
        return Ok(ProcessingResult::failed());
    };

    let Ok(fetched) = download_all(ctx, ticket).await else {
        return Ok(ProcessingResult::failed());
    };

    let fingerprint_pairs: Vec<(&str, &[u8])> = fetched.iter().map(|(f, b)| (f.as_str(), b.as_slice())).collect();
    let current_fingerprints = fingerprint::fingerprint_all(fingerprint_pairs);

    let verdict = tua_approval::determine_verdict(ticket, &current_fingerprints)?;

    match verdict {
        ApprovalVerdict::Pending { .. } => Ok(ProcessingResult::pending(Some(TicketStatus::Review))),

        ApprovalVerdict::NoRequest | ApprovalVerdict::Invalidated { .. } => {
            let credential = match acquire_credential(ctx, ticket, &tenant).await? {
                Ok(credential) => credential,
                Err(result) => return Ok(result),
            };
            continue_from_attachments(ctx, ticket, &tenant, &credential, fetched).await
        }

        ApprovalVerdict::Approved { .. } => {
            let credential = match acquire_credential(ctx, ticket, &tenant).await? {
                Ok(credential) => credential,
                Err(result) => return Ok(result),
            };

            let built = build_dataset(ctx, &fetched).await?;
            if built.dataset.valid_count() == 0 {
                let summary = comments::parse_failure_summary(&built.parse_errors, &built.dataset);
                return match guard_tracker(
                    ticket,
                    "post parse-failure comment",
                    post_comment_and_transition(ctx, ticket, summary, TicketStatus::InfoRequired),
                )
                .await
                {
                    Ok(()) => Ok(ProcessingResult::pending(Some(TicketStatus::InfoRequired))),
                    Err(result) => Ok(result),
                };
            }

            do_create_and_finish(ctx, ticket, &tenant, &credential, built.dataset).await
        }
    }
}

// ---------------------------------------------------------------------------
// Shared attachment pipeline
// ---------------------------------------------------------------------------

async fn download_all(ctx: &AgentContext, ticket: &Ticket) -> Result<Vec<(String, Vec<u8>)>, ()> {
    let mut attachments = ticket.attachments.clone();
    sort_attachments_by_filename(&mut attachments);

    let mut fetched = Vec::with_capacity(attachments.len());
    for attachment in &attachments {
        match ctx.tracker.download_attachment(attachment).await {
            Ok(bytes) => fetched.push((attachment.filename.clone(), bytes)),
            Err(e) => {
                warn!(ticket_key = %ticket.key, file = %attachment.filename, error = %e.message, "attachment download failed");
                return Err(());
            }
        }
    }
    Ok(fetched)
}

struct BuiltDataset {
    dataset: Dataset,
    parse_errors: Vec<String>,
    splitting_notice: Option<String>,
}

async fn build_dataset(ctx: &AgentContext, fetched: &[(String, Vec<u8>)]) -> Result<BuiltDataset, TuaError> {
    let ai = ctx.ai.clone();
    let max_bytes = ctx.config.attachment_max_bytes;
    let attachments = fetched.to_vec();

    let (normalized_rows, parse_errors) = tokio::task::spawn_blocking(move || {
        let handle = tokio::runtime::Handle::current();
        let header_oracle = BlockingHeaderOracle::new(Arc::new(ai.clone()), handle.clone());
        let sheet_oracle = BlockingSheetOracle::new(Arc::new(ai), handle);

        let mut rows = Vec::new();
        let mut errors = Vec::new();
        for (filename, bytes) in &attachments {
            let parsed = match parser::parse_attachment(filename, bytes, max_bytes, &sheet_oracle) {
                Ok(parsed) => parsed,
                Err(e) => {
                    errors.push(format!("{filename}: {}", e.message));
                    continue;
                }
            };
            match normalizer::normalize_headers(&parsed.headers, &header_oracle) {
                Ok(mapping) => rows.extend(parser::apply_mapping(&parsed, &mapping.mapping)),
                Err(e) => errors.push(format!("{filename}: {}", e.message)),
            }
        }
        (rows, errors)
    })
    .await
    .map_err(|e| TuaError::new(ErrorCode::Internal, format!("attachment processing task panicked: {e}")))?;

    let mut dataset = tua_dataset::validator::validate_dataset(&normalized_rows);
    let changed = teams::split_teams(&normalized_rows, &mut dataset);
    let splitting_notice = changed.then(comments::splitting_notice_text);

    Ok(BuiltDataset { dataset, parse_errors, splitting_notice })
}

async fn continue_from_attachments(
    ctx: &AgentContext,
    ticket: &Ticket,
    tenant: &TenantId,
    credential: &CredentialLookup,
    fetched: Vec<(String, Vec<u8>)>,
) -> Result<ProcessingResult, TuaError> {
    if fetched.is_empty() {
        return match guard_tracker(
            ticket,
            "post no-attachments comment",
            post_comment_and_transition(ctx, ticket, comments::no_attachments_notice(), TicketStatus::InfoRequired),
        )
        .await
        {
            Ok(()) => Ok(ProcessingResult::pending(Some(TicketStatus::InfoRequired))),
            Err(result) => Ok(result),
        };
    }

    let built = build_dataset(ctx, &fetched).await?;

    if built.dataset.valid_count() == 0 {
        let summary = comments::parse_failure_summary(&built.parse_errors, &built.dataset);
        return match guard_tracker(
            ticket,
            "post parse-failure comment",
            post_comment_and_transition(ctx, ticket, summary, TicketStatus::InfoRequired),
        )
        .await
        {
            Ok(()) => Ok(ProcessingResult::pending(Some(TicketStatus::InfoRequired))),
            Err(result) => Ok(result),
        };
    }

    if ctx.approval_policy.requires_approval(&built.dataset) {
        let fingerprint_pairs: Vec<(&str, &[u8])> = fetched.iter().map(|(f, b)| (f.as_str(), b.as_slice())).collect();
        let fingerprints = fingerprint::fingerprint_all(fingerprint_pairs);

        let approval_ctx = ApprovalContext {
            ticket_key: ticket.key.clone(),
            tenant: tenant.clone(),
            user_count: built.dataset.valid_count(),
            team_count: built.dataset.distinct_teams().len(),
            attachments: fingerprints,
            generated_at: chrono::Utc::now(),
        };
        let marker_body = tua_approval::render_marker(&approval_ctx, built.splitting_notice.as_deref());
        let csv_bytes = comments::users_for_approval_csv(&built.dataset)?;

        let post = async {
            ctx.tracker
                .upload_attachment(&ticket.key, "users-for-approval.csv", "text/csv", csv_bytes)
                .await?;
            transition_to(ctx, ticket, TicketStatus::Review, Some(&marker_body)).await
        };
        return match guard_tracker(ticket, "post approval marker", post).await {
            Ok(()) => Ok(ProcessingResult::pending(Some(TicketStatus::Review))),
            Err(result) => Ok(result),
        };
    }

    do_create_and_finish(ctx, ticket, tenant, credential, built.dataset).await
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

async fn do_create_and_finish(
    ctx: &AgentContext,
    ticket: &Ticket,
    tenant: &TenantId,
    credential: &CredentialLookup,
    dataset: Dataset,
) -> Result<ProcessingResult, TuaError> {
    let domain = ctx.config.tracker.domain.as_deref().unwrap_or("");
    let service_account_email = tua_tenant::derive_service_account_email(ctx.email_template(), tenant.as_str(), domain);

    let session = match ctx.session_for(tenant, &service_account_email, &credential.password).await {
        Ok(session) => session,
        Err(e) => {
            warn!(ticket_key = %ticket.key, tenant = %tenant, error = %e.message, "backend login failed");
            return Ok(ProcessingResult::failed());
        }
    };

    let roles = match ctx.backend.list_roles(&session).await {
        Ok(roles) => roles,
        Err(e) => {
            warn!(ticket_key = %ticket.key, error = %e.message, "listing backend roles failed");
            return Ok(ProcessingResult::failed());
        }
    };

    let mut role_id_by_role: HashMap<&'static str, String> = HashMap::new();
    for role in [
        UserRole::TeamMember,
        UserRole::Manager,
        UserRole::Monitor,
        UserRole::Administrator,
        UserRole::CompanyAdministrator,
    ] {
        if let Some(id) = tua_backend::resolve_role_id(&roles, role) {
            role_id_by_role.insert(role.as_str(), id);
        }
    }

    let team_names = dataset.distinct_teams();
    let team_results = match tua_backend::ensure_teams(
        ctx.backend.as_ref(),
        &session,
        &team_names,
        ctx.config.team.default_escalation_minutes as u32,
    )
    .await
    {
        Ok(results) => results,
        Err(e) => {
            warn!(ticket_key = %ticket.key, error = %e.message, "team lookup failed");
            return Ok(ProcessingResult::failed());
        }
    };
    let team_ids_by_name: HashMap<String, String> =
        team_results.iter().filter_map(|r| r.team_id.clone().map(|id| (r.name.clone(), id))).collect();

    let valid_rows: Vec<UserRow> = dataset.valid_rows().cloned().collect();
    let user_results =
        match tua_backend::create_users(ctx.backend.as_ref(), &session, &valid_rows, &role_id_by_role, &team_ids_by_name).await {
            Ok(results) => results,
            Err(e) => {
                warn!(ticket_key = %ticket.key, error = %e.message, "user lookup failed");
                return Ok(ProcessingResult::failed());
            }
        };

    let mut created_users = Vec::new();
    let mut existing_users = Vec::new();
    let mut failures = Vec::new();
    for r in &user_results {
        match &r.failure_reason {
            Some(reason) => failures.push(Failure { subject: FailureSubject::Email(r.email.clone()), reason: reason.clone() }),
            None if r.already_existed => existing_users.push(r.email.clone()),
            None => created_users.push(r.email.clone()),
        }
    }

    let mut created_teams = Vec::new();
    for r in &team_results {
        match &r.failure_reason {
            Some(reason) => failures.push(Failure { subject: FailureSubject::Team(r.name.clone()), reason: reason.clone() }),
            None if r.already_existed => {}
            None => created_teams.push(r.name.clone()),
        }
    }

    let (status, next_state) = if failures.is_empty() {
        (ProcessingStatus::Success, TicketStatus::Done)
    } else {
        (ProcessingStatus::Partial, TicketStatus::InfoRequired)
    };

    let summary = comments::completion_summary(&created_users, &existing_users, &created_teams, &failures);
    if let Err(result) = guard_tracker(
        ticket,
        "post completion comment",
        transition_to(ctx, ticket, next_state.clone(), Some(&summary)),
    )
    .await
    {
        return Ok(result);
    }

    Ok(ProcessingResult {
        status,
        created_users,
        existing_users,
        created_teams,
        failures,
        next_state: Some(next_state),
    })
}

// ---------------------------------------------------------------------------
// Tracker plumbing
// ---------------------------------------------------------------------------

async fn acquire_credential(
    ctx: &AgentContext,
    ticket: &Ticket,
    tenant: &TenantId,
) -> Result<Result<CredentialLookup, ProcessingResult>, TuaError> {
    let lookup_key = tenant.as_str().to_string();
    match ctx.credentials.get(tenant, &lookup_key).await {
        Ok(lookup) => Ok(Ok(lookup)),
        Err(e) if e.code == ErrorCode::CredentialNotFound => {
            match guard_tracker(
                ticket,
                "post credential-setup comment",
                post_comment_and_transition(ctx, ticket, comments::credential_setup_instructions(tenant), TicketStatus::InfoRequired),
            )
            .await
            {
                Ok(()) => Ok(Err(ProcessingResult::pending(Some(TicketStatus::InfoRequired)))),
                Err(result) => Ok(Err(result)),
            }
        }
        Err(e) => Err(e),
    }
}

async fn post_comment_and_transition(
    ctx: &AgentContext,
    ticket: &Ticket,
    body: String,
    target: TicketStatus,
) -> Result<(), TuaError> {
    transition_to(ctx, ticket, target, Some(&body)).await
}

async fn transition_to(ctx: &AgentContext, ticket: &Ticket, target: TicketStatus, comment: Option<&str>) -> Result<(), TuaError> {
    let transitions = ctx.tracker.list_transitions(&ticket.key).await?;
    match find_transition(&transitions, &target) {
        Some(transition) => ctx.tracker.perform_transition(&ticket.key, transition, comment).await,
        None => {
            warn!(ticket_key = %ticket.key, target = %target, "no transition to target status available; posting comment without a status change");
            if let Some(body) = comment {
                ctx.tracker.add_comment(&ticket.key, body).await?;
            }
            Ok(())
        }
    }
}

/// Run a tracker-facing future, converting any error into
/// `ProcessingResult::failed()` (tracker calls never raise a fatal code)
/// rather than propagating it past this ticket's processing pass.
async fn guard_tracker<Fut>(ticket: &Ticket, action: &str, fut: Fut) -> Result<(), ProcessingResult>
where
    Fut: std::future::Future<Output = Result<(), TuaError>>,
{
    match fut.await {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(ticket_key = %ticket.key, error = %e.message, action, "tracker call failed");
            Err(ProcessingResult::failed())
        }
    }
}
