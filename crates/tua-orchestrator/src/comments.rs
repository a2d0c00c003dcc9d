// SPDX-License-Identifier: MIT OR Apache-2.0
//! Templated ticket comment bodies and the approval-review CSV attachment.

use tua_core::report::Dataset;
use tua_core::{Failure, FailureSubject, TenantId};
use tua_error::{ErrorCode, TuaError};

/// Posted when no tenant identifier could be extracted from the ticket
/// text, per `spec.md` §4.2 step 2.
pub fn missing_tenant_notice() -> String {
    "I could not determine which tenant this upload is for. Please include a \
     \"Tenant: <name>\" line in the ticket description, or reference the \
     service account email (customersolutions+<tenant>@...), and re-open this \
     ticket."
        .to_string()
}

/// Posted when the vault has no credential entry for the resolved tenant,
/// per `spec.md` §4.2 step 3.
pub fn credential_setup_instructions(tenant: &TenantId) -> String {
    format!(
        "I resolved this ticket to tenant \"{tenant}\", but no service-account \
         credential is on file for it yet. Please create one in the vault under \
         the lookup key \"{tenant}\", then re-open this ticket."
    )
}

/// Posted when a ticket reaches the attachment stage with nothing attached.
pub fn no_attachments_notice() -> String {
    "This upload ticket has no attachments to process. Please attach a CSV or \
     XLSX file listing the users to create, then re-open this ticket."
        .to_string()
}

/// Summarize why every attachment on a ticket failed to produce any valid
/// rows, for posting as a comment.
pub fn parse_failure_summary(parse_errors: &[String], dataset: &Dataset) -> String {
    let mut body = String::from("I could not extract any valid user rows from the attached file(s).\n");
    if !parse_errors.is_empty() {
        body.push_str("\nAttachment errors:\n");
        for error in parse_errors {
            body.push_str(&format!("- {error}\n"));
        }
    }
    let report = dataset.report();
    if report.invalid > 0 {
        body.push_str(&format!("\n{} row(s) failed validation:\n", report.invalid));
        for (field, count) in &report.error_histogram {
            body.push_str(&format!("- {field}: {count}\n"));
        }
    }
    body.push_str("\nPlease correct the file and re-open this ticket.");
    body
}

/// The human-readable note appended to an approval marker when the Team
/// Splitter rewrote a dataset's team cells using a whitespace separator.
pub fn splitting_notice_text() -> String {
    "team cells in this upload used whitespace rather than a pipe character to \
     separate multiple teams; they were re-split accordingly."
        .to_string()
}

/// Summarize a completed (or partially completed) creation pass, for
/// posting as the closing comment.
pub fn completion_summary(
    created_users: &[String],
    existing_users: &[String],
    created_teams: &[String],
    failures: &[Failure],
) -> String {
    let mut body = String::new();
    body.push_str(&format!(
        "Processed this upload: {} user(s) created, {} already existed, {} team(s) created.\n",
        created_users.len(),
        existing_users.len(),
        created_teams.len()
    ));
    if failures.is_empty() {
        body.push_str("\nEverything completed successfully.");
    } else {
        body.push_str(&format!("\n{} failure(s):\n", failures.len()));
        for failure in failures {
            let subject = match &failure.subject {
                FailureSubject::Email(email) => format!("user {email}"),
                FailureSubject::Team(name) => format!("team {name}"),
            };
            body.push_str(&format!("- {subject}: {}\n", failure.reason));
        }
        body.push_str("\nPlease address the failure(s) above and re-open this ticket.");
    }
    body
}

/// Render a dataset's valid rows as `users-for-approval.csv`, for upload
/// alongside the approval marker comment.
pub fn users_for_approval_csv(dataset: &Dataset) -> Result<Vec<u8>, TuaError> {
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    writer
        .write_record(["email", "first_name", "last_name", "job_title", "mobile_number", "teams", "user_role"])
        .map_err(csv_error)?;
    for row in dataset.valid_rows() {
        writer
            .write_record([
                row.email.as_str(),
                row.first_name.as_str(),
                row.last_name.as_str(),
                row.job_title.as_str(),
                row.mobile_number.as_str(),
                &row.teams.join("|"),
                row.user_role.as_str(),
            ])
            .map_err(csv_error)?;
    }
    writer.into_inner().map_err(|e| TuaError::new(ErrorCode::Internal, format!("flushing approval CSV: {e}")))
}

fn csv_error(e: csv::Error) -> TuaError {
    TuaError::new(ErrorCode::Internal, format!("writing approval CSV: {e}"))
}
