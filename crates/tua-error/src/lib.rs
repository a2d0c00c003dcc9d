//! Unified error taxonomy with stable error codes for the ticket upload agent.
//!
//! Every error that crosses a component boundary is a [`TuaError`] carrying
//! a stable [`ErrorCode`] (a machine-readable tag that will not change
//! across patch releases), a human-readable message, an optional cause
//! chain, and arbitrary key-value context. Use [`TuaError::new`] to build
//! one fluently.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Configuration loading/validation errors.
    Config,
    /// Credential vault errors.
    Vault,
    /// Issue tracker HTTP errors.
    Tracker,
    /// Tenant identifier resolution errors.
    Tenant,
    /// Per-tenant credential lookup errors.
    Credential,
    /// Attachment decoding errors.
    Parse,
    /// Canonical schema mapping errors.
    Schema,
    /// Row-level validation errors.
    Validation,
    /// Approval marker/verdict errors.
    Approval,
    /// Identity backend errors.
    Backend,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::Vault => "vault",
            Self::Tracker => "tracker",
            Self::Tenant => "tenant",
            Self::Credential => "credential",
            Self::Parse => "parse",
            Self::Schema => "schema",
            Self::Validation => "validation",
            Self::Approval => "approval",
            Self::Backend => "backend",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant maps 1:1 to one of the error kinds enumerated in the
/// error-handling design: each serialises to a `SCREAMING_SNAKE_CASE`
/// string guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Configuration file or value is invalid. Fatal: halts the run.
    ConfigInvalid,
    /// Credential vault tool is unreachable. Fatal: halts the run.
    VaultUnavailable,
    /// Tracker call failed transiently (5xx, timeout, 429); retried next pass.
    TrackerTransient,
    /// Tracker call failed permanently (4xx other than 429); ticket skipped.
    TrackerPermanent,
    /// No tenant identifier could be extracted from ticket text.
    TenantMissing,
    /// Vault has no entry for the resolved tenant.
    CredentialNotFound,
    /// Attachment exceeds the configured size limit.
    ParseTooLarge,
    /// Attachment has an unrecognised file extension.
    ParseUnknownExtension,
    /// Workbook/sheet contains no data rows.
    ParseEmptySheet,
    /// No header row could be detected.
    ParseNoHeaderRow,
    /// One or more required canonical fields could not be mapped.
    SchemaInvalid,
    /// One or more dataset rows failed validation (non-fatal; valid rows proceed).
    ValidationFailed,
    /// Approval fingerprints no longer match the pinned marker.
    ApprovalInvalidated,
    /// One or more user/team creations failed against the backend.
    BackendFailure,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ConfigInvalid => ErrorCategory::Config,
            Self::VaultUnavailable => ErrorCategory::Vault,
            Self::TrackerTransient | Self::TrackerPermanent => ErrorCategory::Tracker,
            Self::TenantMissing => ErrorCategory::Tenant,
            Self::CredentialNotFound => ErrorCategory::Credential,
            Self::ParseTooLarge
            | Self::ParseUnknownExtension
            | Self::ParseEmptySheet
            | Self::ParseNoHeaderRow => ErrorCategory::Parse,
            Self::SchemaInvalid => ErrorCategory::Schema,
            Self::ValidationFailed => ErrorCategory::Validation,
            Self::ApprovalInvalidated => ErrorCategory::Approval,
            Self::BackendFailure => ErrorCategory::Backend,
            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Whether this error halts the entire run rather than just the ticket
    /// currently being processed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConfigInvalid | Self::VaultUnavailable)
    }

    /// Stable `&'static str` representation (e.g. `"TENANT_MISSING"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::VaultUnavailable => "VAULT_UNAVAILABLE",
            Self::TrackerTransient => "TRACKER_TRANSIENT",
            Self::TrackerPermanent => "TRACKER_PERMANENT",
            Self::TenantMissing => "TENANT_MISSING",
            Self::CredentialNotFound => "CREDENTIAL_NOT_FOUND",
            Self::ParseTooLarge => "PARSE_TOO_LARGE",
            Self::ParseUnknownExtension => "PARSE_UNKNOWN_EXTENSION",
            Self::ParseEmptySheet => "PARSE_EMPTY_SHEET",
            Self::ParseNoHeaderRow => "PARSE_NO_HEADER_ROW",
            Self::SchemaInvalid => "SCHEMA_INVALID",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::ApprovalInvalidated => "APPROVAL_INVALIDATED",
            Self::BackendFailure => "BACKEND_FAILURE",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TuaError
// ---------------------------------------------------------------------------

/// Unified ticket-upload-agent error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// underlying cause, and arbitrary structured context.
///
/// # Examples
///
/// ```
/// use tua_error::{ErrorCode, TuaError};
///
/// let err = TuaError::new(ErrorCode::TrackerTransient, "timed out after 30s")
///     .with_context("ticket_key", "T-1")
///     .with_context("timeout_ms", 30_000);
/// assert!(err.code.category().to_string() == "tracker");
/// ```
pub struct TuaError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics and log records.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl TuaError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Shorthand for `self.code.is_fatal()`.
    pub fn is_fatal(&self) -> bool {
        self.code.is_fatal()
    }

    /// Convenience constructor for the common "ticket_key"-tagged case.
    pub fn for_ticket(code: ErrorCode, ticket_key: &str, message: impl Into<String>) -> Self {
        Self::new(code, message).with_context("ticket_key", ticket_key)
    }
}

impl fmt::Debug for TuaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("TuaError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for TuaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for TuaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a [`TuaError`] (without the opaque source).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TuaErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&TuaError> for TuaErrorDto {
    fn from(err: &TuaError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<TuaErrorDto> for TuaError {
    fn from(dto: TuaErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;

    const ALL_CODES: &[ErrorCode] = &[
        ErrorCode::ConfigInvalid,
        ErrorCode::VaultUnavailable,
        ErrorCode::TrackerTransient,
        ErrorCode::TrackerPermanent,
        ErrorCode::TenantMissing,
        ErrorCode::CredentialNotFound,
        ErrorCode::ParseTooLarge,
        ErrorCode::ParseUnknownExtension,
        ErrorCode::ParseEmptySheet,
        ErrorCode::ParseNoHeaderRow,
        ErrorCode::SchemaInvalid,
        ErrorCode::ValidationFailed,
        ErrorCode::ApprovalInvalidated,
        ErrorCode::BackendFailure,
        ErrorCode::Internal,
    ];

    #[test]
    fn basic_construction() {
        let err = TuaError::new(ErrorCode::Internal, "boom");
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "boom");
        assert!(err.source.is_none());
        assert!(err.context.is_empty());
    }

    #[test]
    fn display_without_context() {
        let err = TuaError::new(ErrorCode::TenantMissing, "no tenant found");
        assert_eq!(err.to_string(), "[TENANT_MISSING] no tenant found");
    }

    #[test]
    fn display_with_context() {
        let err = TuaError::new(ErrorCode::TrackerTransient, "timed out")
            .with_context("timeout_ms", 30_000);
        let s = err.to_string();
        assert!(s.starts_with("[TRACKER_TRANSIENT] timed out"));
        assert!(s.contains("timeout_ms"));
        assert!(s.contains("30000"));
    }

    #[test]
    fn for_ticket_sets_context() {
        let err = TuaError::for_ticket(ErrorCode::SchemaInvalid, "T-42", "missing email column");
        assert_eq!(err.context["ticket_key"], serde_json::json!("T-42"));
    }

    #[test]
    fn debug_with_source() {
        let src = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err = TuaError::new(ErrorCode::ParseTooLarge, "too big").with_source(src);
        let dbg = format!("{err:?}");
        assert!(dbg.contains("source"));
        assert!(dbg.contains("file missing"));
    }

    #[test]
    fn fatal_codes() {
        assert!(ErrorCode::ConfigInvalid.is_fatal());
        assert!(ErrorCode::VaultUnavailable.is_fatal());
        assert!(!ErrorCode::TenantMissing.is_fatal());
        assert!(!ErrorCode::TrackerTransient.is_fatal());
    }

    #[test]
    fn categorisation_spot_check() {
        assert_eq!(ErrorCode::TrackerTransient.category(), ErrorCategory::Tracker);
        assert_eq!(ErrorCode::TrackerPermanent.category(), ErrorCategory::Tracker);
        assert_eq!(ErrorCode::ParseTooLarge.category(), ErrorCategory::Parse);
        assert_eq!(ErrorCode::SchemaInvalid.category(), ErrorCategory::Schema);
        assert_eq!(ErrorCode::BackendFailure.category(), ErrorCategory::Backend);
    }

    #[test]
    fn all_codes_have_unique_as_str() {
        let mut seen = HashSet::new();
        for code in ALL_CODES {
            assert!(seen.insert(code.as_str()), "duplicate as_str: {code:?}");
        }
        assert_eq!(seen.len(), ALL_CODES.len());
    }

    #[test]
    fn all_codes_display_matches_as_str() {
        for code in ALL_CODES {
            assert_eq!(code.to_string(), code.as_str());
        }
    }

    #[test]
    fn error_code_serde_roundtrip() {
        let code = ErrorCode::CredentialNotFound;
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, r#""CREDENTIAL_NOT_FOUND""#);
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, code);
    }

    #[test]
    fn error_category_serde_roundtrip() {
        let cat = ErrorCategory::Tracker;
        let json = serde_json::to_string(&cat).unwrap();
        assert_eq!(json, r#""tracker""#);
        let back: ErrorCategory = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cat);
    }

    #[test]
    fn dto_roundtrip_without_source() {
        let err = TuaError::new(ErrorCode::ApprovalInvalidated, "pinned hash mismatch")
            .with_context("ticket_key", "T-3");
        let dto: TuaErrorDto = (&err).into();
        let json = serde_json::to_string(&dto).unwrap();
        let back: TuaErrorDto = serde_json::from_str(&json).unwrap();
        assert_eq!(dto, back);
        assert!(back.source_message.is_none());
    }

    #[test]
    fn dto_roundtrip_with_source() {
        let src = io::Error::new(io::ErrorKind::BrokenPipe, "pipe broke");
        let err = TuaError::new(ErrorCode::BackendFailure, "create failed").with_source(src);
        let dto: TuaErrorDto = (&err).into();
        assert_eq!(dto.source_message.as_deref(), Some("pipe broke"));
    }

    #[test]
    fn std_error_source_chain() {
        let inner = io::Error::new(io::ErrorKind::NotFound, "not found");
        let err = TuaError::new(ErrorCode::ParseNoHeaderRow, "no header").with_source(inner);
        let src = std::error::Error::source(&err).unwrap();
        assert_eq!(src.to_string(), "not found");
    }

    #[test]
    fn error_code_count() {
        assert_eq!(ALL_CODES.len(), 15);
    }
}
