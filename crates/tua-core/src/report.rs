// SPDX-License-Identifier: MIT OR Apache-2.0
//! Validated datasets, rows, and field-level validation reports.

use crate::UserRole;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One canonical, validated user row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UserRow {
    /// Case-folded-for-comparison, stored as provided.
    pub email: String,
    /// Trimmed, non-blank.
    pub first_name: String,
    /// Trimmed, non-blank.
    pub last_name: String,
    /// Trimmed; empty string allowed.
    pub job_title: String,
    /// Trimmed; defaults to `"0"` if the source cell was blank.
    pub mobile_number: String,
    /// Non-empty, deduplicated, order-preserved.
    pub teams: Vec<String>,
    /// One of the closed role set.
    pub user_role: UserRole,
}

impl UserRow {
    /// `email` lowercased, for duplicate detection and case-insensitive
    /// lookups.
    pub fn email_key(&self) -> String {
        self.email.to_lowercase()
    }
}

/// A single field-level validation failure on one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FieldError {
    /// Canonical field name the error applies to.
    pub field: String,
    /// Human-readable description.
    pub error: String,
}

/// The validation outcome of a single source row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RowStatus {
    /// The row normalized and validated cleanly.
    Valid {
        /// The normalized row.
        row: UserRow,
    },
    /// The row failed one or more checks.
    Invalid {
        /// Every field-level error found, in validation order.
        errors: Vec<FieldError>,
    },
}

impl RowStatus {
    /// `true` if this row is [`RowStatus::Valid`].
    pub fn is_valid(&self) -> bool {
        matches!(self, RowStatus::Valid { .. })
    }

    /// The normalized row, if valid.
    pub fn row(&self) -> Option<&UserRow> {
        match self {
            RowStatus::Valid { row } => Some(row),
            RowStatus::Invalid { .. } => None,
        }
    }
}

/// One source row, numbered as in the original file, with its validation
/// outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DatasetRow {
    /// 1-based row number as it appeared in the source attachment.
    pub row_number: usize,
    /// Validation outcome for this row.
    pub status: RowStatus,
}

/// An ordered list of rows parsed from one or more attachments, each
/// validated independently then cross-checked for duplicate emails.
///
/// Invariants: every row has the canonical field set (valid rows only);
/// no two valid rows share a case-folded email; every row has a status of
/// either `Valid` or `Invalid` with at least one error.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Dataset {
    /// Rows in source order.
    pub rows: Vec<DatasetRow>,
}

impl Dataset {
    /// Valid rows only, in source order.
    pub fn valid_rows(&self) -> impl Iterator<Item = &UserRow> {
        self.rows.iter().filter_map(|r| r.status.row())
    }

    /// Count of valid rows.
    pub fn valid_count(&self) -> usize {
        self.valid_rows().count()
    }

    /// Distinct team names across all valid rows, in first-seen order.
    pub fn distinct_teams(&self) -> Vec<String> {
        let mut seen = std::collections::BTreeSet::new();
        let mut ordered = Vec::new();
        for row in self.valid_rows() {
            for team in &row.teams {
                if seen.insert(team.clone()) {
                    ordered.push(team.clone());
                }
            }
        }
        ordered
    }

    /// A summary report: totals plus a histogram of field-error kinds.
    pub fn report(&self) -> ValidationReport {
        let total = self.rows.len();
        let mut valid = 0usize;
        let mut invalid = 0usize;
        let mut error_histogram: BTreeMap<String, usize> = BTreeMap::new();
        for row in &self.rows {
            match &row.status {
                RowStatus::Valid { .. } => valid += 1,
                RowStatus::Invalid { errors } => {
                    invalid += 1;
                    for e in errors {
                        *error_histogram.entry(e.field.clone()).or_insert(0) += 1;
                    }
                }
            }
        }
        ValidationReport {
            total,
            valid,
            invalid,
            error_histogram,
        }
    }
}

/// Aggregate validation statistics for a [`Dataset`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ValidationReport {
    /// Total rows seen.
    pub total: usize,
    /// Rows that validated cleanly.
    pub valid: usize,
    /// Rows with at least one field error.
    pub invalid: usize,
    /// Count of field errors, keyed by canonical field name.
    pub error_histogram: BTreeMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_row(email: &str, teams: &[&str]) -> DatasetRow {
        DatasetRow {
            row_number: 1,
            status: RowStatus::Valid {
                row: UserRow {
                    email: email.to_string(),
                    first_name: "A".into(),
                    last_name: "B".into(),
                    job_title: String::new(),
                    mobile_number: "0".into(),
                    teams: teams.iter().map(|s| s.to_string()).collect(),
                    user_role: UserRole::TeamMember,
                },
            },
        }
    }

    fn invalid_row(field: &str, error: &str) -> DatasetRow {
        DatasetRow {
            row_number: 2,
            status: RowStatus::Invalid {
                errors: vec![FieldError {
                    field: field.to_string(),
                    error: error.to_string(),
                }],
            },
        }
    }

    #[test]
    fn report_counts_and_histogram() {
        let dataset = Dataset {
            rows: vec![
                valid_row("a@x.io", &["Eng"]),
                invalid_row("email", "duplicate email"),
                invalid_row("email", "duplicate email"),
            ],
        };
        let report = dataset.report();
        assert_eq!(report.total, 3);
        assert_eq!(report.valid, 1);
        assert_eq!(report.invalid, 2);
        assert_eq!(report.error_histogram.get("email"), Some(&2));
    }

    #[test]
    fn distinct_teams_preserves_first_seen_order() {
        let dataset = Dataset {
            rows: vec![
                valid_row("a@x.io", &["Eng", "Ops"]),
                valid_row("b@x.io", &["Ops", "Eng", "Sec"]),
            ],
        };
        assert_eq!(dataset.distinct_teams(), vec!["Eng", "Ops", "Sec"]);
    }

    #[test]
    fn email_key_is_lowercased() {
        let row = UserRow {
            email: "John@Example.com".into(),
            first_name: "J".into(),
            last_name: "D".into(),
            job_title: String::new(),
            mobile_number: "0".into(),
            teams: vec!["Eng".into()],
            user_role: UserRole::TeamMember,
        };
        assert_eq!(row.email_key(), "john@example.com");
    }
}
