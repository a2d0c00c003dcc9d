// SPDX-License-Identifier: MIT OR Apache-2.0
//! tua-dataset
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The spreadsheet ingestion pipeline: decode attachment bytes, map raw
//! headers to the canonical schema, validate and cross-validate rows,
//! disambiguate multi-team cells, and fingerprint the source bytes.
//!
//! Laid out as one crate with a handful of focused modules, the way
//! `abp-core` bundles its own contract-adjacent concerns, since every
//! module here operates on the same `Dataset` contract and is only ever
//! useful in combination with the others.

/// CSV/XLSX byte decoding into row maps.
pub mod parser;
/// Raw-header-to-canonical-field mapping.
pub mod normalizer;
/// Per-row and cross-row validation.
pub mod validator;
/// Multi-team cell disambiguation.
pub mod teams;
/// Attachment content fingerprinting.
pub mod fingerprint;

use std::collections::BTreeMap;

/// The closed set of canonical fields a dataset row may carry after
/// normalization.
pub const CANONICAL_FIELDS: &[&str] = &[
    "email",
    "first name",
    "last name",
    "job title",
    "mobile number",
    "teams",
    "user role",
];

/// Canonical fields that MUST be mapped for a dataset to be schema-valid.
pub const REQUIRED_CANONICAL_FIELDS: &[&str] =
    &["email", "first name", "last name", "teams", "user role"];

/// One row after header normalization, before field-level validation.
///
/// `fields` is keyed by canonical field name; values are still raw,
/// untrimmed strings exactly as the cell contained them (the Validator is
/// the only place trimming/case-folding/splitting happens).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRow {
    /// 1-based row number as it appeared in the source attachment.
    pub row_number: usize,
    /// Canonical field name to raw cell value.
    pub fields: BTreeMap<String, String>,
}

/// A suggested header mapping, as returned by an LLM-backed
/// [`normalizer::HeaderMappingOracle`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMappingSuggestion {
    /// Raw header to canonical field.
    pub mapping: BTreeMap<String, String>,
    /// Canonical fields the oracle could not confidently map.
    pub unmapped: Vec<String>,
}

/// A preview of one worksheet, offered to a [`parser::SheetDetectionOracle`]
/// when the workbook's single-sheet heuristic fails to find a header row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetPreview {
    /// Worksheet name.
    pub sheet_name: String,
    /// The first ten rows of raw cell values, in sheet order.
    pub rows: Vec<Vec<String>>,
}

/// Confidence an oracle attaches to a sheet-detection suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Confidence {
    /// Low confidence — callers MUST treat this as a parse failure.
    Low,
    /// Medium confidence.
    Medium,
    /// High confidence.
    High,
}

/// A sheet-detection suggestion, as returned by an LLM-backed
/// [`parser::SheetDetectionOracle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetDetection {
    /// Chosen worksheet name.
    pub sheet_name: String,
    /// 0-based index of the header row within the sheet.
    pub header_row: usize,
    /// 0-based index of the first data row.
    pub data_start_row: usize,
    /// How confident the oracle is in this suggestion.
    pub confidence: Confidence,
    /// Free-text justification, surfaced in logs only.
    pub reasoning: String,
}

/// Error raised by an oracle-backed fallback (LLM unreachable, malformed
/// JSON, etc.). Distinct from [`tua_error::TuaError`] because these are
/// always caught and converted to a deterministic fallback or a
/// `TuaError` by the caller, never propagated raw.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("oracle error: {0}")]
pub struct OracleError(pub String);
