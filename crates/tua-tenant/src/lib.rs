// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tenant identifier extraction and vault-backed credential cache.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use regex::Regex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::process::Command;
use tokio::sync::RwLock;
use tua_core::TenantId;
use tua_error::{ErrorCode, TuaError};

fn customersolutions_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"customersolutions\+([a-z0-9_-]{2,50})@").expect("static pattern is valid"))
}

fn tenant_label_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)tenant:\s*([a-z0-9_-]{2,50})").expect("static pattern is valid"))
}

/// Extract a tenant identifier from ticket text (conventionally
/// `summary + "\n" + description`), trying each precedence tier in order
/// and stopping at the first match.
///
/// Precedence:
/// 1. `customersolutions+<tenant>@` in a service-account-shaped email.
/// 2. `tenant: <tenant>` (case-insensitive label).
/// 3. `<tenant>.<configured_domain>` against the tracker's configured domain.
///
/// Returns `None` if no tier matches, or if a matched capture fails
/// [`TenantId`] validation (which should not happen given the capture
/// groups are already constrained to the valid character set).
pub fn extract_tenant(text: &str, configured_domain: Option<&str>) -> Option<TenantId> {
    if let Some(captures) = customersolutions_pattern().captures(text) {
        if let Some(id) = TenantId::new(&captures[1]).ok() {
            return Some(id);
        }
    }
    if let Some(captures) = tenant_label_pattern().captures(text) {
        if let Some(id) = TenantId::new(captures[1].to_lowercase()).ok() {
            return Some(id);
        }
    }
    if let Some(domain) = configured_domain {
        if let Some(id) = domain_suffix_pattern(domain)
            .captures(text)
            .and_then(|c| TenantId::new(&c[1]).ok())
        {
            return Some(id);
        }
    }
    None
}

fn domain_suffix_pattern(domain: &str) -> Regex {
    let escaped = regex::escape(domain);
    Regex::new(&format!(r"([a-z0-9_-]{{2,50}})\.{escaped}")).expect("escaped domain produces a valid pattern")
}

/// Template used to derive a tenant's service-account email, e.g.
/// `"customersolutions+%s@<domain>"`. Substitutes `%s` with the tenant id
/// and `<domain>` with the tracker's configured domain.
pub fn derive_service_account_email(template: &str, tenant: &str, domain: &str) -> String {
    template.replace("%s", tenant).replace("<domain>", domain)
}

/// A single vault lookup's result, returned only on success; failure to
/// find a credential or to reach the vault at all is reported as a
/// [`TuaError`] instead (see [`CredentialStore::get`]).
#[derive(Debug, Clone)]
pub struct CredentialLookup {
    /// The service-account password.
    pub password: String,
    /// `true` if this result came from the in-process cache rather than an
    /// external vault invocation.
    pub from_cache: bool,
}

/// Abstraction over the external secret vault, so the store can be tested
/// without shelling out to a real binary.
#[async_trait::async_trait]
pub trait VaultClient: Send + Sync {
    /// Fetch the password for the given lookup key. Implementations must
    /// distinguish "no such entry" from "could not reach the vault at all"
    /// by returning the matching [`ErrorCode`].
    async fn fetch_password(&self, lookup_key: &str) -> Result<String, TuaError>;
}

/// Invokes an external vault CLI binary as a subprocess for each lookup.
///
/// Exit code and stderr are classified per the agent's vault contract:
/// a non-zero exit whose stderr mentions "not found" (case-insensitive) is
/// `CredentialNotFound`; any other non-zero exit, or a failure to spawn the
/// process at all, is `VaultUnavailable`.
pub struct ProcessVaultClient {
    binary: String,
    vault_name: Option<String>,
}

impl ProcessVaultClient {
    /// Construct a client that invokes `binary`, optionally scoped to a
    /// named vault/secret-store instance.
    pub fn new(binary: impl Into<String>, vault_name: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            vault_name,
        }
    }
}

#[async_trait::async_trait]
impl VaultClient for ProcessVaultClient {
    async fn fetch_password(&self, lookup_key: &str) -> Result<String, TuaError> {
        let mut cmd = Command::new(&self.binary);
        if let Some(vault_name) = &self.vault_name {
            cmd.arg("--vault").arg(vault_name);
        }
        cmd.arg("get").arg(lookup_key);
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = cmd.output().await.map_err(|e| {
            TuaError::new(ErrorCode::VaultUnavailable, format!("failed to spawn vault binary: {e}"))
                .with_context("binary", self.binary.clone())
        })?;

        if output.status.success() {
            let password = String::from_utf8_lossy(&output.stdout).trim().to_string();
            return Ok(password);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if stderr.to_lowercase().contains("not found") {
            return Err(TuaError::new(ErrorCode::CredentialNotFound, "vault has no entry for this key")
                .with_context("lookup_key", lookup_key.to_string()));
        }
        Err(TuaError::new(ErrorCode::VaultUnavailable, "vault binary exited with an error")
            .with_context("stderr", stderr)
            .with_context("exit_code", output.status.code()))
    }
}

#[async_trait::async_trait]
impl<T: VaultClient + ?Sized> VaultClient for std::sync::Arc<T> {
    async fn fetch_password(&self, lookup_key: &str) -> Result<String, TuaError> {
        (**self).fetch_password(lookup_key).await
    }
}

/// Process-wide cache of tenant service-account passwords, backed by a
/// [`VaultClient`]. The cache is read-mostly: lookups that hit the cache
/// never touch the vault, and only a miss takes the write path.
pub struct CredentialStore<V: VaultClient> {
    client: V,
    cache: RwLock<HashMap<TenantId, String>>,
}

impl<V: VaultClient> CredentialStore<V> {
    /// Construct an empty store over the given vault client.
    pub fn new(client: V) -> Self {
        Self {
            client,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Look up the password for `tenant`, using `lookup_key` as the vault
    /// query key if the cache misses.
    ///
    /// A cache hit never calls the vault. On a miss, the outcome is cached
    /// only if the vault reports `found`; a `not-found` or `vault-unavailable`
    /// result is never cached, so a later retry (e.g. once the vault entry
    /// has been created) can succeed without a process restart.
    pub async fn get(&self, tenant: &TenantId, lookup_key: &str) -> Result<CredentialLookup, TuaError> {
        if let Some(password) = self.cache.read().await.get(tenant) {
            return Ok(CredentialLookup {
                password: password.clone(),
                from_cache: true,
            });
        }

        let password = self.client.fetch_password(lookup_key).await?;
        self.cache.write().await.insert(tenant.clone(), password.clone());
        Ok(CredentialLookup {
            password,
            from_cache: false,
        })
    }

    /// Eagerly populate the cache for every tenant in `entries` (tenant,
    /// lookup key pairs). A `CredentialNotFound` for one tenant does not
    /// stop the preload; a `VaultUnavailable` does, since it is fatal to
    /// the whole run.
    pub async fn preload_all(&self, entries: &[(TenantId, String)]) -> Result<(), TuaError> {
        for (tenant, lookup_key) in entries {
            match self.client.fetch_password(lookup_key).await {
                Ok(password) => {
                    self.cache.write().await.insert(tenant.clone(), password);
                }
                Err(e) if e.code == ErrorCode::CredentialNotFound => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Number of tenants currently cached. Exposed for tests and metrics.
    pub async fn cached_len(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn extracts_tenant_from_customersolutions_email() {
        let text = "Please provision customersolutions+acme@tickets.example.com for us.";
        assert_eq!(extract_tenant(text, None).unwrap().as_str(), "acme");
    }

    #[test]
    fn extracts_tenant_from_label_case_insensitively() {
        let text = "Summary line\nTENANT: Widgets-Co";
        assert_eq!(extract_tenant(text, None).unwrap().as_str(), "widgets-co");
    }

    #[test]
    fn extracts_tenant_from_domain_suffix() {
        let text = "Our portal is acme.example.com, please set us up.";
        assert_eq!(extract_tenant(text, Some("example.com")).unwrap().as_str(), "acme");
    }

    #[test]
    fn customersolutions_email_wins_over_label_and_domain() {
        let text = "tenant: other\ncustomersolutions+acme@x.io\nalso other.example.com";
        assert_eq!(extract_tenant(text, Some("example.com")).unwrap().as_str(), "acme");
    }

    #[test]
    fn no_match_returns_none() {
        assert!(extract_tenant("please upload users", Some("example.com")).is_none());
    }

    #[test]
    fn derives_service_account_email_from_template() {
        let email = derive_service_account_email("customersolutions+%s@<domain>", "acme", "example.com");
        assert_eq!(email, "customersolutions+acme@example.com");
    }

    struct CountingClient {
        calls: AtomicUsize,
        outcome: fn() -> Result<String, TuaError>,
    }

    #[async_trait::async_trait]
    impl VaultClient for CountingClient {
        async fn fetch_password(&self, _lookup_key: &str) -> Result<String, TuaError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.outcome)()
        }
    }

    #[tokio::test]
    async fn cache_hit_never_calls_the_vault() {
        let client = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
            outcome: || Ok("s3cr3t".to_string()),
        });
        let store = CredentialStore::new(client.clone());
        let tenant = TenantId::new("acme").unwrap();

        let first = store.get(&tenant, "acme-key").await.unwrap();
        assert!(!first.from_cache);
        assert_eq!(first.password, "s3cr3t");

        let second = store.get(&tenant, "acme-key").await.unwrap();
        assert!(second.from_cache);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn not_found_is_ticket_scoped_and_not_cached() {
        let client = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
            outcome: || Err(TuaError::new(ErrorCode::CredentialNotFound, "no entry")),
        });
        let store = CredentialStore::new(client.clone());
        let tenant = TenantId::new("acme").unwrap();

        let err = store.get(&tenant, "acme-key").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::CredentialNotFound);
        assert!(!err.is_fatal());
        assert_eq!(store.cached_len().await, 0);
    }

    #[tokio::test]
    async fn vault_unavailable_is_fatal() {
        let client = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
            outcome: || Err(TuaError::new(ErrorCode::VaultUnavailable, "binary missing")),
        });
        let store = CredentialStore::new(client.clone());
        let tenant = TenantId::new("acme").unwrap();

        let err = store.get(&tenant, "acme-key").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::VaultUnavailable);
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn preload_continues_past_not_found_but_stops_on_vault_unavailable() {
        struct SequencedClient {
            calls: AtomicUsize,
        }
        #[async_trait::async_trait]
        impl VaultClient for SequencedClient {
            async fn fetch_password(&self, lookup_key: &str) -> Result<String, TuaError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                match lookup_key {
                    "missing-key" => Err(TuaError::new(ErrorCode::CredentialNotFound, "no entry")),
                    "down-key" => Err(TuaError::new(ErrorCode::VaultUnavailable, "down")),
                    _ => Ok("pw".to_string()),
                }
            }
        }
        let client = Arc::new(SequencedClient { calls: AtomicUsize::new(0) });
        let store = CredentialStore::new(client.clone());

        let entries = vec![
            (TenantId::new("a").unwrap(), "ok-key".to_string()),
            (TenantId::new("b").unwrap(), "missing-key".to_string()),
            (TenantId::new("c").unwrap(), "down-key".to_string()),
            (TenantId::new("d").unwrap(), "ok-key".to_string()),
        ];

        let err = store.preload_all(&entries).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::VaultUnavailable);
        // "d" never attempted since preload stopped at the fatal entry.
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.cached_len().await, 1);
    }
}
