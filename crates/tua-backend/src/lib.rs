// SPDX-License-Identifier: MIT OR Apache-2.0
//! Identity backend client: authenticate as a tenant and idempotently
//! create the users/teams a dataset proposes.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tua_core::UserRole;
use tua_error::{ErrorCode, TuaError};

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// An authenticated session, opaque to callers beyond its token string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Bearer token returned by `login`.
    pub token: String,
}

/// A backend role, as returned by `list_roles`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Backend-assigned id.
    pub id: String,
    /// Role name, matched case-insensitively against [`UserRole::as_str`].
    pub name: String,
}

/// A backend team, as returned by `list_teams`/`find_team`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    /// Backend-assigned id.
    pub id: String,
    /// Team name, matched exactly against dataset team names.
    pub name: String,
    /// Backend-assigned ids of the team's current members.
    pub member_ids: Vec<String>,
}

/// A backend user, as returned by `list_users`/`find_user`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Backend-assigned id.
    pub id: String,
    /// Email, matched case-insensitively against dataset rows.
    pub email: String,
}

/// One escalation level on a created team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationLevel {
    /// Minutes before this level escalates.
    pub minutes: u32,
    /// Backend ids of the members notified at this level.
    pub escalation_contacts: Vec<String>,
}

impl EscalationLevel {
    /// The default single escalation level: `minutes` after creation,
    /// notifying every member the team is created with.
    pub fn default_single(minutes: u32, member_ids: &[String]) -> Self {
        EscalationLevel {
            minutes,
            escalation_contacts: member_ids.to_vec(),
        }
    }
}

/// Request to create a team.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTeamRequest {
    /// Team name.
    pub name: String,
    /// Backend ids of initial members.
    pub members: Vec<String>,
    /// Escalation levels; default is one level at 180 minutes.
    pub escalation_levels: Vec<EscalationLevel>,
}

/// One mobile number entry on a created user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MobileNumber {
    /// The number, verbatim from the dataset (or `"0"` if blank).
    pub number: String,
    /// Always `true` for numbers supplied at creation time.
    pub is_active: bool,
}

/// Request to create a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserRequest {
    /// Trimmed, non-blank.
    pub first_name: String,
    /// Trimmed, non-blank.
    pub last_name: String,
    /// Unique within the tenant.
    pub email: String,
    /// Optional job title.
    pub title: Option<String>,
    /// Mobile numbers, conventionally a single entry.
    pub mobile_numbers: Vec<MobileNumber>,
    /// Backend team ids this user should be associated with.
    pub team_ids: Vec<String>,
    /// The first of `team_ids`, used as the default team.
    pub default_team: Option<String>,
    /// Resolved backend role id.
    pub role_id: String,
}

/// Outcome of creating one user: either its backend id, or a failure reason
/// the orchestrator surfaces in a completion comment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CreateUserOutcome {
    /// Created (or found to already exist) with this backend id.
    Created(String),
    /// Creation failed; reason is suitable for a ticket comment.
    Failed(String),
}

/// Outcome of creating one team.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CreateTeamOutcome {
    /// Created (or found to already exist) with this backend id.
    Created(String),
    /// Creation failed; reason is suitable for a ticket comment.
    Failed(String),
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// Identity backend contract. Implementations authenticate as a tenant's
/// service account and expose idempotent-where-feasible creation calls.
///
/// Sessions are process-global and reused across tickets that share a
/// tenant within one run; callers are expected to cache the returned
/// [`Session`] themselves rather than re-`login` per call.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Authenticate as the tenant's service account.
    async fn login(&self, email: &str, password: &str) -> Result<Session, TuaError>;

    /// List every role known to the tenant.
    async fn list_roles(&self, session: &Session) -> Result<Vec<Role>, TuaError>;

    /// List every team known to the tenant.
    async fn list_teams(&self, session: &Session) -> Result<Vec<Team>, TuaError>;

    /// List every user known to the tenant.
    async fn list_users(&self, session: &Session) -> Result<Vec<User>, TuaError>;

    /// Find a user by case-insensitive email match.
    async fn find_user(&self, session: &Session, email: &str) -> Result<Option<User>, TuaError>;

    /// Find a team by exact name match.
    async fn find_team(&self, session: &Session, name: &str) -> Result<Option<Team>, TuaError>;

    /// Create a team. Implementations need not themselves check for an
    /// existing team of the same name; callers call `find_team` first.
    async fn create_team(&self, session: &Session, request: CreateTeamRequest) -> Result<Team, TuaError>;

    /// Create a user. Implementations need not themselves check for an
    /// existing user with the same email; callers call `find_user` first.
    async fn create_user(&self, session: &Session, request: CreateUserRequest) -> Result<User, TuaError>;
}

/// Resolve a role's backend id by case-insensitive name match against
/// [`UserRole::as_str`].
pub fn resolve_role_id(roles: &[Role], role: UserRole) -> Option<String> {
    roles
        .iter()
        .find(|r| r.name.eq_ignore_ascii_case(role.as_str()))
        .map(|r| r.id.clone())
}

// ---------------------------------------------------------------------------
// Mock backend
// ---------------------------------------------------------------------------

/// Deterministic in-memory [`Backend`] for offline tests and `--dry-run`.
///
/// Creation returns synthetic ids derived from a monotonically increasing
/// counter so test assertions can predict them; the five closed roles are
/// seeded with stable ids at construction.
pub struct MockBackend {
    next_id: AtomicU64,
    teams: Mutex<HashMap<String, Team>>,
    users: Mutex<HashMap<String, User>>,
    roles: Vec<Role>,
}

impl MockBackend {
    /// Construct a mock with the five closed roles seeded and no teams or
    /// users.
    pub fn new() -> Self {
        let roles = [
            UserRole::TeamMember,
            UserRole::Manager,
            UserRole::Monitor,
            UserRole::Administrator,
            UserRole::CompanyAdministrator,
        ]
        .iter()
        .enumerate()
        .map(|(i, role)| Role {
            id: format!("role-{i}"),
            name: role.as_str().to_string(),
        })
        .collect();
        MockBackend {
            next_id: AtomicU64::new(1),
            teams: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
            roles,
        }
    }

    fn next_synthetic_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}-{n}")
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn login(&self, email: &str, _password: &str) -> Result<Session, TuaError> {
        Ok(Session {
            token: format!("mock-session-for-{email}"),
        })
    }

    async fn list_roles(&self, _session: &Session) -> Result<Vec<Role>, TuaError> {
        Ok(self.roles.clone())
    }

    async fn list_teams(&self, _session: &Session) -> Result<Vec<Team>, TuaError> {
        Ok(self.teams.lock().expect("mock lock poisoned").values().cloned().collect())
    }

    async fn list_users(&self, _session: &Session) -> Result<Vec<User>, TuaError> {
        Ok(self.users.lock().expect("mock lock poisoned").values().cloned().collect())
    }

    async fn find_user(&self, _session: &Session, email: &str) -> Result<Option<User>, TuaError> {
        let key = email.to_lowercase();
        Ok(self.users.lock().expect("mock lock poisoned").get(&key).cloned())
    }

    async fn find_team(&self, _session: &Session, name: &str) -> Result<Option<Team>, TuaError> {
        Ok(self.teams.lock().expect("mock lock poisoned").get(name).cloned())
    }

    async fn create_team(&self, _session: &Session, request: CreateTeamRequest) -> Result<Team, TuaError> {
        let team = Team {
            id: self.next_synthetic_id("team"),
            name: request.name.clone(),
            member_ids: request.members,
        };
        self.teams
            .lock()
            .expect("mock lock poisoned")
            .insert(team.name.clone(), team.clone());
        Ok(team)
    }

    async fn create_user(&self, _session: &Session, request: CreateUserRequest) -> Result<User, TuaError> {
        let user = User {
            id: self.next_synthetic_id("user"),
            email: request.email.clone(),
        };
        self.users
            .lock()
            .expect("mock lock poisoned")
            .insert(user.email.to_lowercase(), user.clone());
        Ok(user)
    }
}

// ---------------------------------------------------------------------------
// HTTP backend
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct LoginBody<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

/// HTTP-backed [`Backend`] against the identity backend's JSON API.
///
/// Modeled on a plain `reqwest::Client` request/response style: every call
/// builds a request, attaches the bearer token, sends it, and maps a
/// non-2xx status to a [`TuaError`] carrying the response body as context.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    /// Construct a client against `base_url`, with the timeouts named in
    /// `spec.md` §5 (30s connect, 120s read) baked into the underlying
    /// `reqwest::Client`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, TuaError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| TuaError::new(ErrorCode::Internal, format!("failed to build HTTP client: {e}")))?;
        Ok(HttpBackend {
            client,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn request_failure(context: &str, response: reqwest::Response) -> TuaError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        TuaError::new(ErrorCode::BackendFailure, format!("{context} returned HTTP {status}"))
            .with_context("status", status.as_u16())
            .with_context("body", body)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn login(&self, email: &str, password: &str) -> Result<Session, TuaError> {
        let response = self
            .client
            .post(self.url("/api/session"))
            .json(&LoginBody { email, password })
            .send()
            .await
            .map_err(|e| TuaError::new(ErrorCode::BackendFailure, format!("login request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Self::request_failure("login", response).await);
        }
        let parsed: LoginResponse = response
            .json()
            .await
            .map_err(|e| TuaError::new(ErrorCode::BackendFailure, format!("login response not valid JSON: {e}")))?;
        Ok(Session { token: parsed.token })
    }

    async fn list_roles(&self, session: &Session) -> Result<Vec<Role>, TuaError> {
        let response = self
            .client
            .get(self.url("/api/roles"))
            .bearer_auth(&session.token)
            .send()
            .await
            .map_err(|e| TuaError::new(ErrorCode::BackendFailure, format!("list_roles request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Self::request_failure("list_roles", response).await);
        }
        response
            .json()
            .await
            .map_err(|e| TuaError::new(ErrorCode::BackendFailure, format!("list_roles response not valid JSON: {e}")))
    }

    async fn list_teams(&self, session: &Session) -> Result<Vec<Team>, TuaError> {
        let response = self
            .client
            .get(self.url("/api/teams"))
            .bearer_auth(&session.token)
            .send()
            .await
            .map_err(|e| TuaError::new(ErrorCode::BackendFailure, format!("list_teams request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Self::request_failure("list_teams", response).await);
        }
        response
            .json()
            .await
            .map_err(|e| TuaError::new(ErrorCode::BackendFailure, format!("list_teams response not valid JSON: {e}")))
    }

    async fn list_users(&self, session: &Session) -> Result<Vec<User>, TuaError> {
        let response = self
            .client
            .get(self.url("/api/users"))
            .bearer_auth(&session.token)
            .send()
            .await
            .map_err(|e| TuaError::new(ErrorCode::BackendFailure, format!("list_users request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Self::request_failure("list_users", response).await);
        }
        response
            .json()
            .await
            .map_err(|e| TuaError::new(ErrorCode::BackendFailure, format!("list_users response not valid JSON: {e}")))
    }

    async fn find_user(&self, session: &Session, email: &str) -> Result<Option<User>, TuaError> {
        let users = self.list_users(session).await?;
        Ok(users.into_iter().find(|u| u.email.eq_ignore_ascii_case(email)))
    }

    async fn find_team(&self, session: &Session, name: &str) -> Result<Option<Team>, TuaError> {
        let teams = self.list_teams(session).await?;
        Ok(teams.into_iter().find(|t| t.name == name))
    }

    async fn create_team(&self, session: &Session, request: CreateTeamRequest) -> Result<Team, TuaError> {
        let response = self
            .client
            .post(self.url("/api/teams"))
            .bearer_auth(&session.token)
            .json(&request)
            .send()
            .await
            .map_err(|e| TuaError::new(ErrorCode::BackendFailure, format!("create_team request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Self::request_failure("create_team", response).await
                .with_context("team_name", request.name));
        }
        response
            .json()
            .await
            .map_err(|e| TuaError::new(ErrorCode::BackendFailure, format!("create_team response not valid JSON: {e}")))
    }

    async fn create_user(&self, session: &Session, request: CreateUserRequest) -> Result<User, TuaError> {
        let email = request.email.clone();
        let response = self
            .client
            .post(self.url("/api/users"))
            .bearer_auth(&session.token)
            .json(&request)
            .send()
            .await
            .map_err(|e| TuaError::new(ErrorCode::BackendFailure, format!("create_user request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Self::request_failure("create_user", response).await.with_context("email", email));
        }
        response
            .json()
            .await
            .map_err(|e| TuaError::new(ErrorCode::BackendFailure, format!("create_user response not valid JSON: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Creation batch
// ---------------------------------------------------------------------------

/// One user's batch-creation outcome, keyed by email for failure reporting.
#[derive(Debug, Clone)]
pub struct UserCreationResult {
    /// The dataset row's email.
    pub email: String,
    /// `true` if the user already existed (found by email, not created).
    pub already_existed: bool,
    /// Backend id on success; absent on failure.
    pub user_id: Option<String>,
    /// Failure reason, present only when `user_id` is `None`.
    pub failure_reason: Option<String>,
}

/// One team's batch-creation outcome, keyed by name.
#[derive(Debug, Clone)]
pub struct TeamCreationResult {
    /// The team name.
    pub name: String,
    /// `true` if the team already existed.
    pub already_existed: bool,
    /// Backend id on success; absent on failure.
    pub team_id: Option<String>,
    /// Failure reason, present only when `team_id` is `None`.
    pub failure_reason: Option<String>,
}

/// Create every team named in `team_names` (in first-appearance order),
/// idempotently: an existing team by exact name is reused rather than
/// recreated. Per-team failures are collected rather than aborting the
/// batch, per `spec.md` §4.9.
pub async fn ensure_teams(
    backend: &dyn Backend,
    session: &Session,
    team_names: &[String],
    escalation_minutes: u32,
) -> Result<Vec<TeamCreationResult>, TuaError> {
    let mut results = Vec::with_capacity(team_names.len());
    for name in team_names {
        match backend.find_team(session, name).await? {
            Some(existing) => results.push(TeamCreationResult {
                name: name.clone(),
                already_existed: true,
                team_id: Some(existing.id),
                failure_reason: None,
            }),
            None => {
                let request = CreateTeamRequest {
                    name: name.clone(),
                    members: Vec::new(),
                    escalation_levels: vec![EscalationLevel::default_single(escalation_minutes, &[])],
                };
                match backend.create_team(session, request).await {
                    Ok(team) => results.push(TeamCreationResult {
                        name: name.clone(),
                        already_existed: false,
                        team_id: Some(team.id),
                        failure_reason: None,
                    }),
                    Err(e) => results.push(TeamCreationResult {
                        name: name.clone(),
                        already_existed: false,
                        team_id: None,
                        failure_reason: Some(e.message),
                    }),
                }
            }
        }
    }
    Ok(results)
}

/// Create every user in `rows`, idempotently: an existing user by
/// case-insensitive email is reused rather than recreated. Team ids are
/// resolved from `team_ids_by_name`; a row referencing a team that failed
/// creation is itself reported as a failure.
pub async fn create_users(
    backend: &dyn Backend,
    session: &Session,
    rows: &[tua_core::report::UserRow],
    role_id_by_role: &HashMap<&'static str, String>,
    team_ids_by_name: &HashMap<String, String>,
) -> Result<Vec<UserCreationResult>, TuaError> {
    let mut results = Vec::with_capacity(rows.len());
    for row in rows {
        if let Some(existing) = backend.find_user(session, &row.email).await? {
            results.push(UserCreationResult {
                email: row.email.clone(),
                already_existed: true,
                user_id: Some(existing.id),
                failure_reason: None,
            });
            continue;
        }

        let mut team_ids = Vec::with_capacity(row.teams.len());
        let mut missing_team = None;
        for team in &row.teams {
            match team_ids_by_name.get(team) {
                Some(id) => team_ids.push(id.clone()),
                None => {
                    missing_team = Some(team.clone());
                    break;
                }
            }
        }
        if let Some(team) = missing_team {
            results.push(UserCreationResult {
                email: row.email.clone(),
                already_existed: false,
                user_id: None,
                failure_reason: Some(format!("team '{team}' was not created")),
            });
            continue;
        }

        let Some(role_id) = role_id_by_role.get(row.user_role.as_str()) else {
            results.push(UserCreationResult {
                email: row.email.clone(),
                already_existed: false,
                user_id: None,
                failure_reason: Some(format!("role '{}' not found on backend", row.user_role)),
            });
            continue;
        };

        let request = CreateUserRequest {
            first_name: row.first_name.clone(),
            last_name: row.last_name.clone(),
            email: row.email.clone(),
            title: if row.job_title.is_empty() { None } else { Some(row.job_title.clone()) },
            mobile_numbers: vec![MobileNumber {
                number: row.mobile_number.clone(),
                is_active: true,
            }],
            team_ids: team_ids.clone(),
            default_team: team_ids.first().cloned(),
            role_id: role_id.clone(),
        };
        match backend.create_user(session, request).await {
            Ok(user) => results.push(UserCreationResult {
                email: row.email.clone(),
                already_existed: false,
                user_id: Some(user.id),
                failure_reason: None,
            }),
            Err(e) => results.push(UserCreationResult {
                email: row.email.clone(),
                already_existed: false,
                user_id: None,
                failure_reason: Some(e.message),
            }),
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tua_core::report::UserRow;

    fn row(email: &str, teams: &[&str]) -> UserRow {
        UserRow {
            email: email.to_string(),
            first_name: "A".into(),
            last_name: "B".into(),
            job_title: String::new(),
            mobile_number: "0".into(),
            teams: teams.iter().map(|s| s.to_string()).collect(),
            user_role: UserRole::TeamMember,
        }
    }

    #[tokio::test]
    async fn mock_backend_create_user_then_find_is_idempotent() {
        let backend = MockBackend::new();
        let session = backend.login("svc@acme.io", "pw").await.unwrap();
        let request = CreateUserRequest {
            first_name: "John".into(),
            last_name: "Doe".into(),
            email: "john@a.io".into(),
            title: None,
            mobile_numbers: vec![MobileNumber {
                number: "0".into(),
                is_active: true,
            }],
            team_ids: vec![],
            default_team: None,
            role_id: "role-0".into(),
        };
        let created = backend.create_user(&session, request).await.unwrap();
        let found = backend.find_user(&session, "JOHN@A.IO").await.unwrap().unwrap();
        assert_eq!(found.id, created.id);
    }

    #[tokio::test]
    async fn resolve_role_id_matches_case_insensitively() {
        let backend = MockBackend::new();
        let session = backend.login("svc@acme.io", "pw").await.unwrap();
        let roles = backend.list_roles(&session).await.unwrap();
        let id = resolve_role_id(&roles, UserRole::TeamMember).unwrap();
        assert_eq!(roles.iter().find(|r| r.id == id).unwrap().name, "TEAM MEMBER");
    }

    #[tokio::test]
    async fn ensure_teams_reuses_existing_team() {
        let backend = MockBackend::new();
        let session = backend.login("svc@acme.io", "pw").await.unwrap();
        backend
            .create_team(
                &session,
                CreateTeamRequest {
                    name: "Eng".into(),
                    members: vec![],
                    escalation_levels: vec![],
                },
            )
            .await
            .unwrap();

        let results = ensure_teams(&backend, &session, &["Eng".to_string(), "Ops".to_string()], 180)
            .await
            .unwrap();
        assert!(results[0].already_existed);
        assert!(!results[1].already_existed);
        assert_eq!(backend.list_teams(&session).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn create_users_reports_missing_team_as_failure() {
        let backend = MockBackend::new();
        let session = backend.login("svc@acme.io", "pw").await.unwrap();
        let roles = backend.list_roles(&session).await.unwrap();
        let mut role_map = HashMap::new();
        for role in &roles {
            role_map.insert(
                UserRole::parse_upper(&role.name).unwrap().as_str(),
                role.id.clone(),
            );
        }
        let rows = vec![row("john@a.io", &["Missing"])];
        let results = create_users(&backend, &session, &rows, &role_map, &HashMap::new())
            .await
            .unwrap();
        assert!(results[0].user_id.is_none());
        assert!(results[0].failure_reason.as_ref().unwrap().contains("Missing"));
    }

    #[tokio::test]
    async fn create_users_is_idempotent_on_second_run() {
        let backend = MockBackend::new();
        let session = backend.login("svc@acme.io", "pw").await.unwrap();
        let roles = backend.list_roles(&session).await.unwrap();
        let mut role_map = HashMap::new();
        for role in &roles {
            role_map.insert(UserRole::parse_upper(&role.name).unwrap().as_str(), role.id.clone());
        }
        let rows = vec![row("john@a.io", &[])];

        let first = create_users(&backend, &session, &rows, &role_map, &HashMap::new()).await.unwrap();
        assert!(!first[0].already_existed);

        let second = create_users(&backend, &session, &rows, &role_map, &HashMap::new()).await.unwrap();
        assert!(second[0].already_existed);
        assert_eq!(backend.list_users(&session).await.unwrap().len(), 1);
    }
}
