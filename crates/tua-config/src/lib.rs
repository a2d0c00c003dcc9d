// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for the ticket upload agent.
//!
//! This crate provides [`AgentConfig`] — the top-level runtime settings —
//! together with helpers for loading from TOML files, merging CLI overlays
//! over a file, applying environment variable overrides, and producing
//! advisory [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The fixed approval marker prefix. Not configurable — see
/// `spec.md` §6: `approval.marker_prefix` is "Fixed to
/// `[BOT:user-upload:approval-request:v2]`".
pub const APPROVAL_MARKER_PREFIX: &str = "[BOT:user-upload:approval-request:v2]";

/// Default per-attachment byte limit (30 MiB).
pub const DEFAULT_ATTACHMENT_MAX_BYTES: u64 = 31_457_280;

/// Default team escalation window in minutes.
pub const DEFAULT_ESCALATION_MINUTES: u64 = 180;

/// Default poll interval for watch mode, in seconds.
pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 300;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// `ai.api_key` is missing while the backend is not in mock mode.
    MissingApiKey,
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// An HTTP timeout-affecting value is unusually large.
    LargeValue {
        /// Field name.
        field: String,
        /// The value, for display.
        value: u64,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::MissingApiKey => {
                write!(f, "ai.api_key is not set but backend.mock is false")
            }
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            ConfigWarning::LargeValue { field, value } => {
                write!(f, "field '{field}' has an unusually large value ({value})")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level runtime configuration for the ticket upload agent.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Default)]
pub struct AgentConfig {
    /// Issue tracker connection settings.
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// Identity backend connection settings.
    #[serde(default)]
    pub backend: BackendConfig,

    /// LLM adapter settings.
    #[serde(default)]
    pub ai: AiConfig,

    /// Credential vault settings.
    #[serde(default)]
    pub vault: VaultConfig,

    /// Team-creation defaults.
    #[serde(default)]
    pub team: TeamConfig,

    /// Ticket query (JQL or equivalent) used by `search`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jql: Option<String>,

    /// Poll interval in seconds for `--watch` mode.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,

    /// Maximum attachment size in bytes before a `ParseTooLarge` error.
    #[serde(default = "default_attachment_max_bytes")]
    pub attachment_max_bytes: u64,

    /// Log level override (`trace`/`debug`/`info`/`warn`/`error`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECONDS
}

fn default_attachment_max_bytes() -> u64 {
    DEFAULT_ATTACHMENT_MAX_BYTES
}

impl AgentConfig {
    /// Construct a config with every field at its documented default.
    pub fn with_defaults() -> Self {
        Self {
            poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECONDS,
            attachment_max_bytes: DEFAULT_ATTACHMENT_MAX_BYTES,
            ..Default::default()
        }
    }
}

/// Issue tracker connection settings.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Default)]
pub struct TrackerConfig {
    /// Tracker instance domain (e.g. `"example.atlassian.net"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Basic-auth email.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Basic-auth API token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    /// Bot account id, used to recognise the agent's own comments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_account_id: Option<String>,
    /// Bot account display name, used to recognise the agent's own comments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_account_name: Option<String>,
}

/// Identity backend connection settings.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Default)]
pub struct BackendConfig {
    /// Primary backend base URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Alternate backend base URL, tried if the primary is unreachable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_alt_url: Option<String>,
    /// Use the in-memory mock backend instead of a real HTTP backend.
    #[serde(default)]
    pub mock: bool,
}

/// LLM adapter settings.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Default)]
pub struct AiConfig {
    /// Base URL of the chat completion endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// API key for the chat completion endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Model identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Credential vault settings.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Default)]
pub struct VaultConfig {
    /// Path to the vault CLI binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    /// Name of the vault/secret-store instance to query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_name: Option<String>,
    /// Template used to derive the service-account email from a tenant id.
    /// Must contain exactly one `%s` placeholder. Default:
    /// `"customersolutions+%s@<domain>"` with `<domain>` substituted from
    /// `tracker.domain` at lookup time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_template: Option<String>,
}

/// Team-creation defaults.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct TeamConfig {
    /// Minutes before a newly created team's single escalation level fires.
    #[serde(default = "default_escalation_minutes")]
    pub default_escalation_minutes: u64,
}

fn default_escalation_minutes() -> u64 {
    DEFAULT_ESCALATION_MINUTES
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self {
            default_escalation_minutes: DEFAULT_ESCALATION_MINUTES,
        }
    }
}

// ---------------------------------------------------------------------------
// Constants for validation
// ---------------------------------------------------------------------------

const MAX_ESCALATION_MINUTES: u64 = 10_080; // one week
const LARGE_ESCALATION_THRESHOLD: u64 = 1_440; // one day
const MAX_POLL_INTERVAL_SECONDS: u64 = 86_400;
const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load an [`AgentConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, returns [`AgentConfig::with_defaults`].
///
/// Environment variable overrides are applied on top in both cases.
pub fn load_config(path: Option<&Path>) -> Result<AgentConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => AgentConfig::with_defaults(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into an [`AgentConfig`].
pub fn parse_toml(content: &str) -> Result<AgentConfig, ConfigError> {
    toml::from_str::<AgentConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides.
///
/// Recognised variables (mirroring the config table in `spec.md` §6):
/// - `TUA_TRACKER_DOMAIN`, `TUA_TRACKER_EMAIL`, `TUA_TRACKER_API_TOKEN`
/// - `TUA_BACKEND_BASE_URL`, `TUA_BACKEND_MOCK` (`"true"`/`"false"`)
/// - `TUA_AI_BASE_URL`, `TUA_AI_API_KEY`, `TUA_AI_MODEL`
/// - `TUA_VAULT_BINARY`
/// - `TUA_LOG_LEVEL`
/// - `TUA_POLL_INTERVAL_SECONDS`
pub fn apply_env_overrides(config: &mut AgentConfig) {
    if let Ok(v) = std::env::var("TUA_TRACKER_DOMAIN") {
        config.tracker.domain = Some(v);
    }
    if let Ok(v) = std::env::var("TUA_TRACKER_EMAIL") {
        config.tracker.email = Some(v);
    }
    if let Ok(v) = std::env::var("TUA_TRACKER_API_TOKEN") {
        config.tracker.api_token = Some(v);
    }
    if let Ok(v) = std::env::var("TUA_BACKEND_BASE_URL") {
        config.backend.base_url = Some(v);
    }
    if let Ok(v) = std::env::var("TUA_BACKEND_MOCK") {
        config.backend.mock = v.eq_ignore_ascii_case("true") || v == "1";
    }
    if let Ok(v) = std::env::var("TUA_AI_BASE_URL") {
        config.ai.base_url = Some(v);
    }
    if let Ok(v) = std::env::var("TUA_AI_API_KEY") {
        config.ai.api_key = Some(v);
    }
    if let Ok(v) = std::env::var("TUA_AI_MODEL") {
        config.ai.model = Some(v);
    }
    if let Ok(v) = std::env::var("TUA_VAULT_BINARY") {
        config.vault.binary = Some(v);
    }
    if let Ok(v) = std::env::var("TUA_LOG_LEVEL") {
        config.log_level = Some(v);
    }
    if let Ok(v) = std::env::var("TUA_POLL_INTERVAL_SECONDS") {
        if let Ok(secs) = v.parse::<u64>() {
            config.poll_interval_seconds = secs;
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (zero poll interval, out-of-range escalation minutes, an
/// `email_template` without exactly one `%s`) are returned as a
/// [`ConfigError::ValidationError`]; soft issues come back as warnings.
pub fn validate_config(config: &AgentConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if let Some(ref level) = config.log_level {
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            errors.push(format!("invalid log_level '{level}'"));
        }
    }

    if config.poll_interval_seconds == 0 {
        errors.push("poll_interval_seconds must be greater than zero".into());
    } else if config.poll_interval_seconds > MAX_POLL_INTERVAL_SECONDS {
        errors.push(format!(
            "poll_interval_seconds {} exceeds max {}",
            config.poll_interval_seconds, MAX_POLL_INTERVAL_SECONDS
        ));
    }

    if config.attachment_max_bytes == 0 {
        errors.push("attachment_max_bytes must be greater than zero".into());
    }

    let esc = config.team.default_escalation_minutes;
    if esc == 0 || esc > MAX_ESCALATION_MINUTES {
        errors.push(format!(
            "team.default_escalation_minutes {esc} out of range (1..{MAX_ESCALATION_MINUTES})"
        ));
    } else if esc > LARGE_ESCALATION_THRESHOLD {
        warnings.push(ConfigWarning::LargeValue {
            field: "team.default_escalation_minutes".into(),
            value: esc,
        });
    }

    if let Some(ref tmpl) = config.vault.email_template {
        if tmpl.matches("%s").count() != 1 {
            errors.push("vault.email_template must contain exactly one '%s'".into());
        }
    }

    if !config.backend.mock && config.ai.api_key.is_none() {
        warnings.push(ConfigWarning::MissingApiKey);
    }

    if config.tracker.domain.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "tracker.domain".into(),
            hint: "the agent cannot query or update tickets without it".into(),
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// Merge two configurations. Values in `overlay` take precedence over
/// `base`, the way CLI flags take precedence over a loaded config file.
pub fn merge_configs(base: AgentConfig, overlay: AgentConfig) -> AgentConfig {
    AgentConfig {
        tracker: TrackerConfig {
            domain: overlay.tracker.domain.or(base.tracker.domain),
            email: overlay.tracker.email.or(base.tracker.email),
            api_token: overlay.tracker.api_token.or(base.tracker.api_token),
            bot_account_id: overlay.tracker.bot_account_id.or(base.tracker.bot_account_id),
            bot_account_name: overlay
                .tracker
                .bot_account_name
                .or(base.tracker.bot_account_name),
        },
        backend: BackendConfig {
            base_url: overlay.backend.base_url.or(base.backend.base_url),
            base_alt_url: overlay.backend.base_alt_url.or(base.backend.base_alt_url),
            mock: overlay.backend.mock || base.backend.mock,
        },
        ai: AiConfig {
            base_url: overlay.ai.base_url.or(base.ai.base_url),
            api_key: overlay.ai.api_key.or(base.ai.api_key),
            model: overlay.ai.model.or(base.ai.model),
        },
        vault: VaultConfig {
            binary: overlay.vault.binary.or(base.vault.binary),
            vault_name: overlay.vault.vault_name.or(base.vault.vault_name),
            email_template: overlay.vault.email_template.or(base.vault.email_template),
        },
        team: if overlay.team.default_escalation_minutes != DEFAULT_ESCALATION_MINUTES {
            overlay.team
        } else {
            base.team
        },
        jql: overlay.jql.or(base.jql),
        poll_interval_seconds: if overlay.poll_interval_seconds != DEFAULT_POLL_INTERVAL_SECONDS {
            overlay.poll_interval_seconds
        } else {
            base.poll_interval_seconds
        },
        attachment_max_bytes: if overlay.attachment_max_bytes != DEFAULT_ATTACHMENT_MAX_BYTES {
            overlay.attachment_max_bytes
        } else {
            base.attachment_max_bytes
        },
        log_level: overlay.log_level.or(base.log_level),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_has_sensible_defaults() {
        let cfg = AgentConfig::with_defaults();
        assert_eq!(cfg.poll_interval_seconds, DEFAULT_POLL_INTERVAL_SECONDS);
        assert_eq!(cfg.attachment_max_bytes, DEFAULT_ATTACHMENT_MAX_BYTES);
        assert_eq!(
            cfg.team.default_escalation_minutes,
            DEFAULT_ESCALATION_MINUTES
        );
    }

    #[test]
    fn default_config_warns_about_missing_domain_and_key() {
        let cfg = AgentConfig::with_defaults();
        let warnings = validate_config(&cfg).expect("defaults should validate");
        assert!(warnings.contains(&ConfigWarning::MissingApiKey));
        assert!(warnings.iter().any(|w| matches!(
            w,
            ConfigWarning::MissingOptionalField { field, .. } if field == "tracker.domain"
        )));
    }

    #[test]
    fn parse_valid_toml_string() {
        let toml_str = r#"
            jql = "project = UP"
            poll_interval_seconds = 60

            [tracker]
            domain = "example.atlassian.net"
            email = "bot@example.com"
            api_token = "secret"

            [backend]
            mock = true
        "#;
        let cfg = parse_toml(toml_str).unwrap();
        assert_eq!(cfg.jql.as_deref(), Some("project = UP"));
        assert_eq!(cfg.poll_interval_seconds, 60);
        assert_eq!(cfg.tracker.domain.as_deref(), Some("example.atlassian.net"));
        assert!(cfg.backend.mock);
    }

    #[test]
    fn parse_invalid_toml_gives_parse_error() {
        let err = parse_toml("this is [not valid toml =").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn validation_catches_invalid_log_level() {
        let mut cfg = AgentConfig::with_defaults();
        cfg.log_level = Some("verbose".into());
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn validation_catches_zero_poll_interval() {
        let mut cfg = AgentConfig::with_defaults();
        cfg.poll_interval_seconds = 0;
        let err = validate_config(&cfg).unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("poll_interval_seconds")));
            }
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[test]
    fn validation_catches_escalation_out_of_range() {
        let mut cfg = AgentConfig::with_defaults();
        cfg.team.default_escalation_minutes = 0;
        assert!(validate_config(&cfg).is_err());

        let mut cfg = AgentConfig::with_defaults();
        cfg.team.default_escalation_minutes = MAX_ESCALATION_MINUTES + 1;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn large_escalation_produces_warning_not_error() {
        let mut cfg = AgentConfig::with_defaults();
        cfg.tracker.domain = Some("x".into());
        cfg.backend.mock = true;
        cfg.team.default_escalation_minutes = 2000;
        let warnings = validate_config(&cfg).unwrap();
        assert!(
            warnings
                .iter()
                .any(|w| matches!(w, ConfigWarning::LargeValue { field, .. } if field.contains("escalation")))
        );
    }

    #[test]
    fn validation_catches_bad_email_template() {
        let mut cfg = AgentConfig::with_defaults();
        cfg.vault.email_template = Some("customersolutions+@example.com".into());
        let err = validate_config(&cfg).unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("email_template")));
            }
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[test]
    fn mock_backend_silences_missing_api_key_warning() {
        let mut cfg = AgentConfig::with_defaults();
        cfg.tracker.domain = Some("x".into());
        cfg.backend.mock = true;
        let warnings = validate_config(&cfg).unwrap();
        assert!(!warnings.contains(&ConfigWarning::MissingApiKey));
    }

    #[test]
    fn merge_overlay_overrides_base() {
        let mut base = AgentConfig::with_defaults();
        base.tracker.domain = Some("old.example.com".into());
        let mut overlay = AgentConfig::with_defaults();
        overlay.tracker.domain = Some("new.example.com".into());
        let merged = merge_configs(base, overlay);
        assert_eq!(merged.tracker.domain.as_deref(), Some("new.example.com"));
    }

    #[test]
    fn merge_preserves_base_when_overlay_is_default() {
        let mut base = AgentConfig::with_defaults();
        base.tracker.domain = Some("keep.example.com".into());
        base.poll_interval_seconds = 900;
        let overlay = AgentConfig::with_defaults();
        let merged = merge_configs(base, overlay);
        assert_eq!(merged.tracker.domain.as_deref(), Some("keep.example.com"));
        assert_eq!(merged.poll_interval_seconds, 900);
    }

    #[test]
    fn merge_backend_mock_is_sticky_true() {
        let mut base = AgentConfig::with_defaults();
        base.backend.mock = true;
        let overlay = AgentConfig::with_defaults();
        let merged = merge_configs(base, overlay);
        assert!(merged.backend.mock);
    }

    #[test]
    fn toml_roundtrip() {
        let mut cfg = AgentConfig::with_defaults();
        cfg.tracker.domain = Some("example.atlassian.net".into());
        cfg.jql = Some("project = UP".into());
        let serialized = toml::to_string(&cfg).unwrap();
        let deserialized: AgentConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(cfg, deserialized);
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tua.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "log_level = \"warn\"\npoll_interval_seconds = 45").unwrap();
        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.log_level.as_deref(), Some("warn"));
        assert_eq!(cfg.poll_interval_seconds, 45);
    }

    #[test]
    fn load_missing_file_gives_file_not_found() {
        let err = load_config(Some(Path::new("/nonexistent/tua.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn load_none_returns_defaults() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.poll_interval_seconds, DEFAULT_POLL_INTERVAL_SECONDS);
    }

    #[test]
    fn approval_marker_prefix_is_fixed() {
        assert_eq!(
            APPROVAL_MARKER_PREFIX,
            "[BOT:user-upload:approval-request:v2]"
        );
    }

    #[test]
    fn config_warning_display() {
        let w = ConfigWarning::MissingApiKey;
        assert!(w.to_string().contains("ai.api_key"));

        let w = ConfigWarning::MissingOptionalField {
            field: "tracker.domain".into(),
            hint: "needed".into(),
        };
        assert!(w.to_string().contains("tracker.domain"));

        let w = ConfigWarning::LargeValue {
            field: "team.default_escalation_minutes".into(),
            value: 5000,
        };
        assert!(w.to_string().contains("5000"));
    }
}
