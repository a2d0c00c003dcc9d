// SPDX-License-Identifier: MIT OR Apache-2.0
//! Decode attachment bytes into row maps, detecting encoding (CSV) or
//! sheet/header (XLSX) along the way.

use crate::{Confidence, NormalizedRow, SheetDetection, SheetPreview};
use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
use std::collections::BTreeMap;
use std::io::Cursor;
use tua_error::{ErrorCode, TuaError};

const CANDIDATE_ENCODINGS: &[&encoding_rs::Encoding] = &[
    encoding_rs::UTF_8,
    encoding_rs::UTF_16BE,
    encoding_rs::UTF_16LE,
];

/// Metadata describing how a sheet was decoded, carried alongside its rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMeta {
    /// Encoding label used to decode the bytes (CSV only; `"utf-8"` for XLSX).
    pub encoding: String,
    /// Worksheet name (`None` for CSV).
    pub sheet_name: Option<String>,
    /// 0-based index of the header row within the sheet/file.
    pub header_row_index: usize,
    /// 0-based index of the first data row.
    pub data_start_row_index: usize,
}

/// The result of parsing one attachment: raw header strings, row maps
/// keyed by those headers, and decode metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSheet {
    /// Raw header strings in source column order.
    pub headers: Vec<String>,
    /// Row maps keyed by raw header string, in source row order. Blank
    /// rows are already dropped.
    pub rows: Vec<BTreeMap<String, String>>,
    /// Decode metadata.
    pub meta: ParseMeta,
}

/// An oracle asked to pick a worksheet and header row when the built-in
/// single-sheet heuristic cannot.
pub trait SheetDetectionOracle {
    /// Given previews of each worksheet's first ten rows, suggest which
    /// sheet, header row, and data start row to use.
    fn detect_sheet(&self, previews: &[SheetPreview]) -> Result<SheetDetection, crate::OracleError>;
}

/// Parse an attachment's bytes based on its filename extension.
///
/// `max_bytes` enforces the configured per-attachment size limit; exceeding
/// it yields [`ErrorCode::ParseTooLarge`] with reason `"too-large"` and never
/// reaches the decode step (so the LLM-backed `oracle` is never invoked for
/// an oversized file, per `spec.md` testable property 10).
pub fn parse_attachment(
    filename: &str,
    bytes: &[u8],
    max_bytes: u64,
    oracle: &dyn SheetDetectionOracle,
) -> Result<ParsedSheet, TuaError> {
    if bytes.len() as u64 > max_bytes {
        return Err(TuaError::new(ErrorCode::ParseTooLarge, "attachment exceeds configured size limit")
            .with_context("file", filename)
            .with_context("reason", "too-large")
            .with_context("size", bytes.len())
            .with_context("max_bytes", max_bytes));
    }

    let lower = filename.to_lowercase();
    if lower.ends_with(".csv") {
        parse_csv(filename, bytes)
    } else if lower.ends_with(".xlsx") {
        parse_xlsx(filename, bytes, oracle)
    } else {
        Err(TuaError::new(ErrorCode::ParseUnknownExtension, "unrecognized attachment extension")
            .with_context("file", filename)
            .with_context("reason", "unknown-extension"))
    }
}

/// Decode CSV bytes, trying each candidate encoding in order and parsing
/// with RFC 4180 semantics. The first encoding whose first three lines
/// decode without replacement characters wins.
pub fn parse_csv(filename: &str, bytes: &[u8]) -> Result<ParsedSheet, TuaError> {
    let (text, encoding_label) = decode_csv_bytes(bytes).ok_or_else(|| {
        TuaError::new(ErrorCode::ParseNoHeaderRow, "could not detect a supported text encoding")
            .with_context("file", filename)
            .with_context("reason", "unknown-encoding")
    })?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| {
            TuaError::new(ErrorCode::ParseNoHeaderRow, "failed to read header row")
                .with_context("file", filename)
                .with_context("reason", e.to_string())
        })?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
        return Err(TuaError::new(ErrorCode::ParseNoHeaderRow, "no detectable header row")
            .with_context("file", filename)
            .with_context("reason", "no-header-row"));
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| {
            TuaError::new(ErrorCode::ParseNoHeaderRow, "failed to read data row")
                .with_context("file", filename)
                .with_context("reason", e.to_string())
        })?;
        if record.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        let mut row = BTreeMap::new();
        for (header, cell) in headers.iter().zip(record.iter()) {
            row.insert(header.clone(), cell.trim().to_string());
        }
        rows.push(row);
    }

    if rows.is_empty() {
        return Err(TuaError::new(ErrorCode::ParseEmptySheet, "sheet has no data rows")
            .with_context("file", filename)
            .with_context("reason", "empty-sheet"));
    }

    Ok(ParsedSheet {
        headers,
        rows,
        meta: ParseMeta {
            encoding: encoding_label.to_string(),
            sheet_name: None,
            header_row_index: 0,
            data_start_row_index: 1,
        },
    })
}

/// Decode `bytes` as ISO-8859-1 (Latin-1): every byte maps directly to the
/// identically-numbered Unicode code point (U+0000-U+00FF), unlike
/// Windows-1252's reassignment of 0x80-0x9F to printable characters.
fn decode_iso_8859_1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Try each candidate encoding in `CANDIDATE_ENCODINGS`, then ISO-8859-1,
/// then Windows-1252, per `spec.md`'s stated try-order, returning the
/// decoded text and a label for the first one that decodes the first three
/// lines without a replacement character.
fn decode_csv_bytes(bytes: &[u8]) -> Option<(String, &'static str)> {
    for encoding in CANDIDATE_ENCODINGS {
        let (decoded, _, had_errors) = encoding.decode(bytes);
        if had_errors {
            continue;
        }
        let first_three_ok = decoded.lines().take(3).all(|line| !line.contains('\u{FFFD}'));
        if first_three_ok {
            return Some((decoded.into_owned(), encoding.name()));
        }
    }

    // ISO-8859-1 never reports decode errors (every byte maps to a code
    // point), so it is tried here, ahead of the Windows-1252 fallback,
    // exactly as spec.md orders the two.
    let iso_8859_1 = decode_iso_8859_1(bytes);
    if iso_8859_1.lines().take(3).all(|line| !line.contains('\u{FFFD}')) {
        return Some((iso_8859_1, "iso-8859-1"));
    }

    // Windows-1252 also never reports decode errors, so it is the
    // unconditional final fallback.
    let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
    Some((decoded.into_owned(), "windows-1252"))
}

/// Decode an XLSX workbook. If exactly one sheet exists and its first row
/// contains a recognizable canonical synonym, that sheet and header row are
/// used directly; otherwise the `oracle` is consulted with a preview of
/// each sheet's first ten rows.
pub fn parse_xlsx(
    filename: &str,
    bytes: &[u8],
    oracle: &dyn SheetDetectionOracle,
) -> Result<ParsedSheet, TuaError> {
    let cursor = Cursor::new(bytes);
    let mut workbook: Xlsx<_> = open_workbook_from_rs(cursor).map_err(|e| {
        TuaError::new(ErrorCode::ParseNoHeaderRow, "failed to open workbook")
            .with_context("file", filename)
            .with_context("reason", e.to_string())
    })?;

    let sheet_names = workbook.sheet_names().to_vec();
    if sheet_names.is_empty() {
        return Err(TuaError::new(ErrorCode::ParseEmptySheet, "workbook has no sheets")
            .with_context("file", filename)
            .with_context("reason", "empty-sheet"));
    }

    let (sheet_name, header_row_index, data_start_row_index) = if sheet_names.len() == 1 {
        let name = &sheet_names[0];
        let range = workbook.worksheet_range(name).map_err(|e| {
            TuaError::new(ErrorCode::ParseNoHeaderRow, "failed to read worksheet")
                .with_context("file", filename)
                .with_context("reason", e.to_string())
        })?;
        let first_row: Vec<String> = range
            .rows()
            .next()
            .map(|row| row.iter().map(cell_to_string).collect())
            .unwrap_or_default();
        if row_has_canonical_synonym(&first_row) {
            (name.clone(), 0, 1)
        } else {
            let detection = consult_sheet_oracle(&mut workbook, &sheet_names, filename, oracle)?;
            (detection.sheet_name, detection.header_row, detection.data_start_row)
        }
    } else {
        let detection = consult_sheet_oracle(&mut workbook, &sheet_names, filename, oracle)?;
        (detection.sheet_name, detection.header_row, detection.data_start_row)
    };

    let range = workbook.worksheet_range(&sheet_name).map_err(|e| {
        TuaError::new(ErrorCode::ParseNoHeaderRow, "failed to read worksheet")
            .with_context("file", filename)
            .with_context("reason", e.to_string())
    })?;

    let all_rows: Vec<Vec<String>> = range.rows().map(|r| r.iter().map(cell_to_string).collect()).collect();

    let headers: Vec<String> = all_rows
        .get(header_row_index)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|h| h.trim().to_string())
        .collect();

    if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
        return Err(TuaError::new(ErrorCode::ParseNoHeaderRow, "no detectable header row")
            .with_context("file", filename)
            .with_context("reason", "no-header-row"));
    }

    let mut rows = Vec::new();
    for raw_row in all_rows.iter().skip(data_start_row_index) {
        if raw_row.iter().all(|c| c.trim().is_empty()) {
            continue;
        }
        let mut row = BTreeMap::new();
        for (header, cell) in headers.iter().zip(raw_row.iter()) {
            row.insert(header.clone(), cell.trim().to_string());
        }
        rows.push(row);
    }

    if rows.is_empty() {
        return Err(TuaError::new(ErrorCode::ParseEmptySheet, "sheet has no data rows")
            .with_context("file", filename)
            .with_context("reason", "empty-sheet"));
    }

    Ok(ParsedSheet {
        headers,
        rows,
        meta: ParseMeta {
            encoding: "utf-8".to_string(),
            sheet_name: Some(sheet_name),
            header_row_index,
            data_start_row_index,
        },
    })
}

fn consult_sheet_oracle<R: std::io::Read + std::io::Seek>(
    workbook: &mut Xlsx<R>,
    sheet_names: &[String],
    filename: &str,
    oracle: &dyn SheetDetectionOracle,
) -> Result<SheetDetection, TuaError> {
    let mut previews = Vec::new();
    for name in sheet_names {
        if let Ok(range) = workbook.worksheet_range(name) {
            let rows: Vec<Vec<String>> =
                range.rows().take(10).map(|r| r.iter().map(cell_to_string).collect()).collect();
            previews.push(SheetPreview {
                sheet_name: name.clone(),
                rows,
            });
        }
    }

    let detection = oracle.detect_sheet(&previews).map_err(|e| {
        TuaError::new(ErrorCode::ParseNoHeaderRow, "sheet detection failed")
            .with_context("file", filename)
            .with_context("reason", e.0)
    })?;

    if detection.confidence == Confidence::Low {
        return Err(TuaError::new(ErrorCode::ParseNoHeaderRow, "sheet detection confidence too low")
            .with_context("file", filename)
            .with_context("reason", "low-confidence-sheet-detection"));
    }

    Ok(detection)
}

fn cell_to_string(data: &Data) -> String {
    match data {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(d) => d.to_string(),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Error(e) => format!("{e:?}"),
    }
}

/// Synonyms recognized as a canonical-field-bearing header row, used only
/// for the single-sheet fast path.
const SYNONYM_HINTS: &[&str] = &[
    "email", "e-mail", "mail", "first name", "fname", "given name", "last name", "lname",
    "surname", "teams", "team", "group", "user role", "role", "position",
];

fn row_has_canonical_synonym(row: &[String]) -> bool {
    row.iter().any(|cell| {
        let normalized = crate::normalizer::normalize_header(cell);
        SYNONYM_HINTS.contains(&normalized.as_str())
    })
}

/// Convert a [`ParsedSheet`] plus a resolved header mapping into
/// [`NormalizedRow`]s. Kept here (rather than in `normalizer`) since it is
/// purely mechanical once the mapping is known.
pub fn apply_mapping(parsed: &ParsedSheet, mapping: &BTreeMap<String, String>) -> Vec<NormalizedRow> {
    parsed
        .rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut fields = BTreeMap::new();
            for (raw_header, canonical) in mapping {
                if let Some(value) = row.get(raw_header) {
                    fields.insert(canonical.clone(), value.clone());
                }
            }
            NormalizedRow {
                row_number: parsed.meta.data_start_row_index + i + 1,
                fields,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoCallOracle;
    impl SheetDetectionOracle for NoCallOracle {
        fn detect_sheet(&self, _previews: &[SheetPreview]) -> Result<SheetDetection, crate::OracleError> {
            panic!("oracle must not be consulted for a single unambiguous sheet or an oversized file")
        }
    }

    #[test]
    fn parses_simple_utf8_csv() {
        let bytes = b"email,first name,last name,teams,user role\njohn@a.io,John,Doe,Eng,TEAM MEMBER\n";
        let parsed = parse_csv("u.csv", bytes).unwrap();
        assert_eq!(parsed.headers, vec!["email", "first name", "last name", "teams", "user role"]);
        assert_eq!(parsed.rows.len(), 1);
        assert_eq!(parsed.rows[0].get("email").unwrap(), "john@a.io");
        assert_eq!(parsed.meta.encoding, "UTF-8");
    }

    #[test]
    fn blank_rows_are_dropped() {
        let bytes = b"email,first name\njohn@a.io,John\n,\n";
        let parsed = parse_csv("u.csv", bytes).unwrap();
        assert_eq!(parsed.rows.len(), 1);
    }

    #[test]
    fn empty_sheet_is_a_parse_error() {
        let bytes = b"email,first name\n";
        let err = parse_csv("u.csv", bytes).unwrap_err();
        assert_eq!(err.code, ErrorCode::ParseEmptySheet);
    }

    #[test]
    fn oversized_attachment_never_touches_the_oracle() {
        let bytes = vec![0u8; 100];
        let err = parse_attachment("u.csv", &bytes, 10, &NoCallOracle).unwrap_err();
        assert_eq!(err.code, ErrorCode::ParseTooLarge);
        assert_eq!(err.context.get("reason").and_then(|v| v.as_str()), Some("too-large"));
    }

    #[test]
    fn unknown_extension_is_a_parse_error() {
        let err = parse_attachment("u.txt", b"irrelevant", 1000, &NoCallOracle).unwrap_err();
        assert_eq!(err.context.get("reason").and_then(|v| v.as_str()), Some("unknown-extension"));
    }

    #[test]
    fn apply_mapping_assigns_row_numbers_from_data_start() {
        let parsed = ParsedSheet {
            headers: vec!["E-Mail".into()],
            rows: vec![
                BTreeMap::from([("E-Mail".to_string(), "a@x.io".to_string())]),
                BTreeMap::from([("E-Mail".to_string(), "b@x.io".to_string())]),
            ],
            meta: ParseMeta {
                encoding: "UTF-8".into(),
                sheet_name: None,
                header_row_index: 0,
                data_start_row_index: 1,
            },
        };
        let mapping = BTreeMap::from([("E-Mail".to_string(), "email".to_string())]);
        let normalized = apply_mapping(&parsed, &mapping);
        assert_eq!(normalized[0].row_number, 2);
        assert_eq!(normalized[1].row_number, 3);
        assert_eq!(normalized[0].fields.get("email").unwrap(), "a@x.io");
    }
}
