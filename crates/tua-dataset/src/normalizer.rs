// SPDX-License-Identifier: MIT OR Apache-2.0
//! Map heterogeneous raw header strings to the canonical field set.

use crate::{HeaderMappingSuggestion, CANONICAL_FIELDS, REQUIRED_CANONICAL_FIELDS};
use std::collections::BTreeMap;
use tua_error::{ErrorCode, TuaError};

/// An oracle asked to map headers a deterministic pass could not resolve.
pub trait HeaderMappingOracle {
    /// Given the still-unmapped raw headers and the canonical fields still
    /// missing a mapping, suggest a mapping.
    fn map_headers(
        &self,
        unmapped_raw: &[String],
        missing_canonical: &[String],
    ) -> Result<HeaderMappingSuggestion, crate::OracleError>;
}

/// Built-in synonym table. Keys are already normalized (see
/// [`normalize_header`]); values are canonical field names.
fn synonym_table() -> BTreeMap<&'static str, &'static str> {
    BTreeMap::from([
        ("email", "email"),
        ("e-mail", "email"),
        ("e mail", "email"),
        ("mail", "email"),
        ("email address", "email"),
        ("first name", "first name"),
        ("firstname", "first name"),
        ("fname", "first name"),
        ("given name", "first name"),
        ("last name", "last name"),
        ("lastname", "last name"),
        ("lname", "last name"),
        ("surname", "last name"),
        ("family name", "last name"),
        ("job title", "job title"),
        ("title", "job title"),
        ("position", "job title"),
        ("role title", "job title"),
        ("mobile number", "mobile number"),
        ("mobile", "mobile number"),
        ("cell", "mobile number"),
        ("cell phone", "mobile number"),
        ("phone", "mobile number"),
        ("phone number", "mobile number"),
        ("teams", "teams"),
        ("team", "teams"),
        ("group", "teams"),
        ("groups", "teams"),
        ("department", "teams"),
        ("dept", "teams"),
        ("user role", "user role"),
        ("role", "user role"),
        ("user_role", "user role"),
        ("access level", "user role"),
        ("permission level", "user role"),
    ])
}

/// Normalize a raw header: lowercase, collapse internal whitespace to a
/// single space, strip non-alphanumeric characters except `-`/`_`, trim.
pub fn normalize_header(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let stripped: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c.is_whitespace() { c } else { ' ' })
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ").trim().to_string()
}

/// Result of mapping one attachment's raw headers to canonical fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizationResult {
    /// Raw header string to canonical field name.
    pub mapping: BTreeMap<String, String>,
    /// Raw headers that mapped to nothing, even after the oracle.
    pub unmapped_raw: Vec<String>,
}

/// Map `raw_headers` to canonical fields.
///
/// Deterministic synonym matches always take precedence over whatever an
/// oracle might suggest for the same raw header. If any of
/// [`REQUIRED_CANONICAL_FIELDS`] remains unmapped after consulting the
/// oracle, returns [`ErrorCode::SchemaInvalid`].
pub fn normalize_headers(
    raw_headers: &[String],
    oracle: &dyn HeaderMappingOracle,
) -> Result<NormalizationResult, TuaError> {
    let table = synonym_table();
    let mut mapping: BTreeMap<String, String> = BTreeMap::new();
    let mut mapped_canonical: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
    let mut still_unmapped_raw = Vec::new();

    for raw in raw_headers {
        let normalized = normalize_header(raw);
        if let Some(canonical) = table.get(normalized.as_str()) {
            // First raw header that maps to a given canonical field wins.
            if mapped_canonical.insert(canonical.to_string()) {
                mapping.insert(raw.clone(), canonical.to_string());
            } else {
                still_unmapped_raw.push(raw.clone());
            }
        } else {
            still_unmapped_raw.push(raw.clone());
        }
    }

    let missing_canonical: Vec<String> = CANONICAL_FIELDS
        .iter()
        .filter(|f| !mapped_canonical.contains(**f))
        .map(|f| f.to_string())
        .collect();

    if !still_unmapped_raw.is_empty() && !missing_canonical.is_empty() {
        if let Ok(suggestion) = oracle.map_headers(&still_unmapped_raw, &missing_canonical) {
            let mut remaining = Vec::new();
            for raw in &still_unmapped_raw {
                match suggestion.mapping.get(raw) {
                    Some(canonical)
                        if CANONICAL_FIELDS.contains(&canonical.as_str())
                            && mapped_canonical.insert(canonical.clone()) =>
                    {
                        mapping.insert(raw.clone(), canonical.clone());
                    }
                    _ => remaining.push(raw.clone()),
                }
            }
            still_unmapped_raw = remaining;
        }
    }

    let still_missing: Vec<String> = REQUIRED_CANONICAL_FIELDS
        .iter()
        .filter(|f| !mapped_canonical.contains(**f))
        .map(|f| f.to_string())
        .collect();

    if !still_missing.is_empty() {
        return Err(TuaError::new(ErrorCode::SchemaInvalid, "required canonical fields could not be mapped")
            .with_context("missing_fields", still_missing));
    }

    Ok(NormalizationResult {
        mapping,
        unmapped_raw: still_unmapped_raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoOpOracle;
    impl HeaderMappingOracle for NoOpOracle {
        fn map_headers(
            &self,
            _unmapped_raw: &[String],
            _missing_canonical: &[String],
        ) -> Result<HeaderMappingSuggestion, crate::OracleError> {
            Ok(HeaderMappingSuggestion::default())
        }
    }

    struct FixedOracle(HeaderMappingSuggestion);
    impl HeaderMappingOracle for FixedOracle {
        fn map_headers(
            &self,
            _unmapped_raw: &[String],
            _missing_canonical: &[String],
        ) -> Result<HeaderMappingSuggestion, crate::OracleError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn normalize_header_strips_and_collapses() {
        assert_eq!(normalize_header("  E-Mail Address  "), "e-mail address");
        assert_eq!(normalize_header("First_Name"), "first_name");
        assert_eq!(normalize_header("Job/Title!!"), "job title");
    }

    #[test]
    fn deterministic_synonyms_cover_required_fields() {
        let headers = vec![
            "E-Mail".to_string(),
            "Given Name".to_string(),
            "Surname".to_string(),
            "Group".to_string(),
            "Role".to_string(),
        ];
        let result = normalize_headers(&headers, &NoOpOracle).unwrap();
        assert_eq!(result.mapping.get("E-Mail").unwrap(), "email");
        assert_eq!(result.mapping.get("Given Name").unwrap(), "first name");
        assert_eq!(result.mapping.get("Surname").unwrap(), "last name");
        assert_eq!(result.mapping.get("Group").unwrap(), "teams");
        assert_eq!(result.mapping.get("Role").unwrap(), "user role");
        assert!(result.unmapped_raw.is_empty());
    }

    #[test]
    fn missing_required_field_is_schema_invalid() {
        let headers = vec!["E-Mail".to_string(), "Given Name".to_string()];
        let err = normalize_headers(&headers, &NoOpOracle).unwrap_err();
        assert_eq!(err.code, ErrorCode::SchemaInvalid);
    }

    #[test]
    fn oracle_fills_in_gaps_deterministic_matches_still_win() {
        let headers = vec![
            "E-Mail".to_string(),
            "First Name".to_string(),
            "Last Name".to_string(),
            "Squad".to_string(),
            "Clearance".to_string(),
        ];
        let suggestion = HeaderMappingSuggestion {
            mapping: BTreeMap::from([
                ("Squad".to_string(), "teams".to_string()),
                ("Clearance".to_string(), "user role".to_string()),
                // The oracle also (wrongly) tries to override a deterministic match;
                // deterministic mappings must not be touched by this.
                ("E-Mail".to_string(), "job title".to_string()),
            ]),
            unmapped: Vec::new(),
        };
        let result = normalize_headers(&headers, &FixedOracle(suggestion)).unwrap();
        assert_eq!(result.mapping.get("E-Mail").unwrap(), "email");
        assert_eq!(result.mapping.get("Squad").unwrap(), "teams");
        assert_eq!(result.mapping.get("Clearance").unwrap(), "user role");
    }

    #[test]
    fn duplicate_raw_headers_for_same_canonical_keep_first_only() {
        let headers = vec![
            "Email".to_string(),
            "E-Mail".to_string(),
            "First Name".to_string(),
            "Last Name".to_string(),
            "Teams".to_string(),
            "Role".to_string(),
        ];
        let result = normalize_headers(&headers, &NoOpOracle).unwrap();
        assert_eq!(result.mapping.get("Email").unwrap(), "email");
        assert!(!result.mapping.contains_key("E-Mail"));
        assert_eq!(result.unmapped_raw, vec!["E-Mail".to_string()]);
    }
}
