// SPDX-License-Identifier: MIT OR Apache-2.0
//! Disambiguate multi-team cells once the corpus-wide separator is known.
//!
//! The [`validator`](crate::validator) module already produces a usable
//! `teams` array per row by splitting on the pipe-like character class. But
//! source files that never use a pipe instead rely on whitespace as the
//! inter-team separator, in which case every row's `teams` array from the
//! validator holds exactly one entry that is itself several team names
//! glued together by spaces. This module looks at the *raw* cell text
//! across every valid row to decide, once, whether whitespace splitting
//! should have been used instead, and rewrites the dataset if so.

use crate::validator::PIPE_LIKE_CHARS;
use crate::NormalizedRow;
use std::collections::BTreeMap;
use tua_core::report::{Dataset, RowStatus};

/// The separator the splitter decided the corpus uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeamSeparator {
    /// At least one raw cell in the corpus contained a pipe-like character.
    Pipe,
    /// No raw cell in the corpus contained a pipe-like character; cells
    /// containing a space are split on runs of whitespace instead.
    Whitespace,
}

/// Inspect the raw `teams` cell text for every valid row and decide which
/// separator the source file used.
pub fn detect_separator(raw_team_cells: &[&str]) -> TeamSeparator {
    if raw_team_cells.iter().any(|cell| cell.contains(PIPE_LIKE_CHARS)) {
        TeamSeparator::Pipe
    } else {
        TeamSeparator::Whitespace
    }
}

/// Split one raw cell under a resolved [`TeamSeparator`], trimming parts,
/// dropping empties, and deduplicating while preserving first-seen order.
pub fn split_cell(raw: &str, separator: TeamSeparator) -> Vec<String> {
    let parts: Vec<&str> = match separator {
        TeamSeparator::Pipe => raw.split(PIPE_LIKE_CHARS).collect(),
        TeamSeparator::Whitespace => {
            if raw.contains(char::is_whitespace) {
                raw.split_whitespace().collect()
            } else {
                vec![raw]
            }
        }
    };
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

/// Re-derive the `teams` field of every valid row in `dataset` from the
/// original raw cell text in `normalized_rows`, using the corpus-wide
/// separator detected from all valid rows' raw cells.
///
/// Returns `true` if any row's team list actually changed, in which case
/// the Approval Engine appends a human-readable splitting notice to the
/// marker.
pub fn split_teams(normalized_rows: &[NormalizedRow], dataset: &mut Dataset) -> bool {
    let raw_by_row_number: BTreeMap<usize, &str> = normalized_rows
        .iter()
        .map(|r| (r.row_number, r.fields.get("teams").map(|s| s.as_str()).unwrap_or("")))
        .collect();

    let raw_cells: Vec<&str> = dataset
        .rows
        .iter()
        .filter(|r| r.status.is_valid())
        .filter_map(|r| raw_by_row_number.get(&r.row_number).copied())
        .collect();

    if raw_cells.is_empty() {
        return false;
    }

    let separator = detect_separator(&raw_cells);
    let mut changed = false;

    for dataset_row in dataset.rows.iter_mut() {
        if let RowStatus::Valid { row } = &mut dataset_row.status {
            if let Some(raw) = raw_by_row_number.get(&dataset_row.row_number) {
                let resplit = split_cell(raw, separator);
                if resplit != row.teams {
                    changed = true;
                }
                row.teams = resplit;
            }
        }
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tua_core::report::{FieldError, UserRow};
    use tua_core::UserRole;

    fn normalized(row_number: usize, teams_cell: &str) -> NormalizedRow {
        NormalizedRow {
            row_number,
            fields: BTreeMap::from([("teams".to_string(), teams_cell.to_string())]),
        }
    }

    fn valid_dataset_row(row_number: usize, teams: &[&str]) -> tua_core::report::DatasetRow {
        tua_core::report::DatasetRow {
            row_number,
            status: RowStatus::Valid {
                row: UserRow {
                    email: format!("u{row_number}@x.io"),
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

    #[test]
    fn whitespace_mode_splits_space_separated_cells() {
        let normalized_rows = vec![
            normalized(1, "M&E-Surface Non-IronOre"),
            normalized(2, "Admin"),
        ];
        let mut dataset = Dataset {
            rows: vec![
                valid_dataset_row(1, &["M&E-Surface Non-IronOre"]),
                valid_dataset_row(2, &["Admin"]),
            ],
        };
        let changed = split_teams(&normalized_rows, &mut dataset);
        assert!(changed);
        let row1 = dataset.rows[0].status.row().unwrap();
        assert_eq!(row1.teams, vec!["M&E-Surface", "Non-IronOre"]);
        let row2 = dataset.rows[1].status.row().unwrap();
        assert_eq!(row2.teams, vec!["Admin"]);
    }

    #[test]
    fn pipe_mode_is_selected_when_any_cell_has_a_pipe_like_char() {
        let normalized_rows = vec![normalized(1, "Eng|Ops"), normalized(2, "Admin Team")];
        let mut dataset = Dataset {
            rows: vec![valid_dataset_row(1, &["Eng|Ops"]), valid_dataset_row(2, &["Admin Team"])],
        };
        let changed = split_teams(&normalized_rows, &mut dataset);
        assert!(changed);
        let row1 = dataset.rows[0].status.row().unwrap();
        assert_eq!(row1.teams, vec!["Eng", "Ops"]);
        // Whole-cell kept intact with its internal space since pipe mode won.
        let row2 = dataset.rows[1].status.row().unwrap();
        assert_eq!(row2.teams, vec!["Admin Team"]);
    }

    #[test]
    fn no_change_when_cells_are_already_single_words() {
        let normalized_rows = vec![normalized(1, "Eng"), normalized(2, "Ops")];
        let mut dataset = Dataset {
            rows: vec![valid_dataset_row(1, &["Eng"]), valid_dataset_row(2, &["Ops"])],
        };
        let changed = split_teams(&normalized_rows, &mut dataset);
        assert!(!changed);
    }

    #[test]
    fn invalid_rows_are_left_alone() {
        let normalized_rows = vec![normalized(1, "Eng Ops")];
        let mut dataset = Dataset {
            rows: vec![tua_core::report::DatasetRow {
                row_number: 1,
                status: RowStatus::Invalid {
                    errors: vec![FieldError {
                        field: "email".into(),
                        error: "must not be blank".into(),
                    }],
                },
            }],
        };
        let changed = split_teams(&normalized_rows, &mut dataset);
        assert!(!changed);
    }
}
