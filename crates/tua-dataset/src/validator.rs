// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-row and cross-row validation of normalized spreadsheet rows.

use crate::NormalizedRow;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tua_core::report::{Dataset, DatasetRow, FieldError, RowStatus, UserRow};
use tua_core::UserRole;

/// Pipe-like characters recognized as a team separator: `|`, U+04CF, U+01C0.
pub const PIPE_LIKE_CHARS: &[char] = &['\u{007C}', '\u{04CF}', '\u{01C0}'];

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").expect("static pattern is valid")
    })
}

/// Validate a set of [`NormalizedRow`]s into a [`Dataset`].
///
/// Per-row checks run in the fixed order documented on each field (email,
/// first/last name, job title, mobile number, teams, user role) so that
/// error messages are deterministic. A final cross-row pass invalidates
/// every row that shares a case-folded email with another otherwise-valid
/// row.
pub fn validate_dataset(rows: &[NormalizedRow]) -> Dataset {
    let mut provisional: Vec<(usize, Result<UserRow, Vec<FieldError>>)> =
        rows.iter().map(|row| (row.row_number, validate_row(row))).collect();

    let mut by_email_key: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, (_, result)) in provisional.iter().enumerate() {
        if let Ok(user_row) = result {
            by_email_key.entry(user_row.email_key()).or_default().push(idx);
        }
    }

    for indices in by_email_key.values() {
        if indices.len() > 1 {
            for &idx in indices {
                let (_, result) = &mut provisional[idx];
                *result = Err(vec![FieldError {
                    field: "email".to_string(),
                    error: "duplicate email".to_string(),
                }]);
            }
        }
    }

    let dataset_rows = provisional
        .into_iter()
        .map(|(row_number, result)| DatasetRow {
            row_number,
            status: match result {
                Ok(row) => RowStatus::Valid { row },
                Err(errors) => RowStatus::Invalid { errors },
            },
        })
        .collect();

    Dataset { rows: dataset_rows }
}

fn validate_row(row: &NormalizedRow) -> Result<UserRow, Vec<FieldError>> {
    let mut errors = Vec::new();

    let email = validate_email(row.fields.get("email"), &mut errors);
    let first_name = validate_non_blank("first name", row.fields.get("first name"), &mut errors);
    let last_name = validate_non_blank("last name", row.fields.get("last name"), &mut errors);
    let job_title = row.fields.get("job title").map(|s| s.trim().to_string()).unwrap_or_default();
    let mobile_number = validate_mobile_number(row.fields.get("mobile number"));
    let teams = validate_teams(row.fields.get("teams"), &mut errors);
    let user_role = validate_user_role(row.fields.get("user role"), &mut errors);

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(UserRow {
        email: email.expect("validated above"),
        first_name: first_name.expect("validated above"),
        last_name: last_name.expect("validated above"),
        job_title,
        mobile_number,
        teams: teams.expect("validated above"),
        user_role: user_role.expect("validated above"),
    })
}

fn validate_email(raw: Option<&String>, errors: &mut Vec<FieldError>) -> Option<String> {
    let raw = raw.map(|s| s.trim().to_string()).unwrap_or_default();
    if raw.is_empty() {
        errors.push(FieldError {
            field: "email".to_string(),
            error: "must not be blank".to_string(),
        });
        return None;
    }
    if !email_pattern().is_match(&raw) {
        errors.push(FieldError {
            field: "email".to_string(),
            error: "not a valid email address".to_string(),
        });
        return None;
    }
    Some(raw)
}

fn validate_non_blank(field: &str, raw: Option<&String>, errors: &mut Vec<FieldError>) -> Option<String> {
    let trimmed = raw.map(|s| s.trim().to_string()).unwrap_or_default();
    if trimmed.is_empty() {
        errors.push(FieldError {
            field: field.to_string(),
            error: "must not be blank".to_string(),
        });
        return None;
    }
    Some(trimmed)
}

fn validate_mobile_number(raw: Option<&String>) -> String {
    match raw.map(|s| s.trim()) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => "0".to_string(),
    }
}

/// Split a raw `teams` cell on the pipe-like character class, trimming
/// parts and dropping empties, deduplicated preserving first-seen order.
///
/// If the cell contains no pipe-like character, the whole trimmed cell is
/// treated as a single team name (which may itself contain spaces); the
/// [`crate::teams`] module is responsible for later disambiguating that
/// case using whitespace as a separator when the corpus as a whole favors
/// it.
pub fn split_teams_cell(raw: &str) -> Vec<String> {
    let parts: Vec<&str> = raw.split(PIPE_LIKE_CHARS).collect();
    let mut seen = std::collections::BTreeSet::new();
    let mut ordered = Vec::new();
    for part in parts {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            ordered.push(trimmed.to_string());
        }
    }
    ordered
}

fn validate_teams(raw: Option<&String>, errors: &mut Vec<FieldError>) -> Option<Vec<String>> {
    let raw = raw.map(|s| s.as_str()).unwrap_or("");
    let teams = split_teams_cell(raw);
    if teams.is_empty() {
        errors.push(FieldError {
            field: "teams".to_string(),
            error: "must specify at least one team".to_string(),
        });
        return None;
    }
    Some(teams)
}

fn validate_user_role(raw: Option<&String>, errors: &mut Vec<FieldError>) -> Option<UserRole> {
    let normalized = raw.map(|s| s.trim().to_uppercase()).unwrap_or_default();
    match UserRole::parse_upper(&normalized) {
        Some(role) => Some(role),
        None => {
            errors.push(FieldError {
                field: "user role".to_string(),
                error: format!("'{normalized}' is not a recognized role"),
            });
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(row_number: usize, fields: &[(&str, &str)]) -> NormalizedRow {
        NormalizedRow {
            row_number,
            fields: fields.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn valid_row_passes_all_checks() {
        let rows = vec![row(
            1,
            &[
                ("email", "john@a.io"),
                ("first name", "John"),
                ("last name", "Doe"),
                ("teams", "Eng|Ops"),
                ("user role", "team member"),
            ],
        )];
        let dataset = validate_dataset(&rows);
        assert_eq!(dataset.valid_count(), 1);
        let user_row = dataset.valid_rows().next().unwrap();
        assert_eq!(user_row.teams, vec!["Eng", "Ops"]);
        assert_eq!(user_row.user_role, UserRole::TeamMember);
        assert_eq!(user_row.mobile_number, "0");
    }

    #[test]
    fn blank_email_is_invalid() {
        let rows = vec![row(1, &[("first name", "A"), ("last name", "B")])];
        let dataset = validate_dataset(&rows);
        assert_eq!(dataset.valid_count(), 0);
    }

    #[test]
    fn malformed_email_is_invalid() {
        let rows = vec![row(
            1,
            &[
                ("email", "not-an-email"),
                ("first name", "A"),
                ("last name", "B"),
                ("teams", "Eng"),
                ("user role", "MANAGER"),
            ],
        )];
        let dataset = validate_dataset(&rows);
        assert_eq!(dataset.valid_count(), 0);
    }

    #[test]
    fn duplicate_emails_invalidate_both_rows() {
        let rows = vec![
            row(
                1,
                &[
                    ("email", "john@a.io"),
                    ("first name", "John"),
                    ("last name", "Doe"),
                    ("teams", "Eng"),
                    ("user role", "TEAM MEMBER"),
                ],
            ),
            row(
                2,
                &[
                    ("email", "JOHN@a.io"),
                    ("first name", "Johnny"),
                    ("last name", "Doeson"),
                    ("teams", "Ops"),
                    ("user role", "MANAGER"),
                ],
            ),
        ];
        let dataset = validate_dataset(&rows);
        assert_eq!(dataset.valid_count(), 0);
        for r in &dataset.rows {
            match &r.status {
                RowStatus::Invalid { errors } => {
                    assert!(errors.iter().any(|e| e.error == "duplicate email"));
                }
                RowStatus::Valid { .. } => panic!("expected row {} to be invalid", r.row_number),
            }
        }
    }

    #[test]
    fn unrecognized_role_is_invalid() {
        let rows = vec![row(
            1,
            &[
                ("email", "a@x.io"),
                ("first name", "A"),
                ("last name", "B"),
                ("teams", "Eng"),
                ("user role", "SUPERUSER"),
            ],
        )];
        let dataset = validate_dataset(&rows);
        assert_eq!(dataset.valid_count(), 0);
    }

    #[test]
    fn blank_mobile_defaults_to_zero() {
        let rows = vec![row(
            1,
            &[
                ("email", "a@x.io"),
                ("first name", "A"),
                ("last name", "B"),
                ("teams", "Eng"),
                ("user role", "TEAM MEMBER"),
            ],
        )];
        let dataset = validate_dataset(&rows);
        assert_eq!(dataset.valid_rows().next().unwrap().mobile_number, "0");
    }

    #[test]
    fn split_teams_cell_dedupes_preserving_order() {
        assert_eq!(split_teams_cell("Eng|Ops|Eng"), vec!["Eng", "Ops"]);
        assert_eq!(split_teams_cell(" Eng "), vec!["Eng"]);
        assert_eq!(split_teams_cell(""), Vec::<String>::new());
        assert_eq!(split_teams_cell("A\u{04CF}B"), vec!["A", "B"]);
    }
}
