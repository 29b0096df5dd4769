//! Compliance sheets exported as CSV.
//!
//! The requirement lives in the `Feature / Capability` column. Rows that
//! look like group headers are not emitted; their text prefixes the
//! requirements that follow. A row is a group header when its text ends
//! with `:`, or when its compliance and remarks cells are empty and the
//! text is shorter than [`HEADER_MAX_CHARS`].

use std::io::Read;

use tracing::debug;

use crate::core::{SectionDef, SectionKind};
use crate::error::InputError;

/// Requirement column header (matched case-insensitively).
pub const REQUIREMENT_COLUMN: &str = "feature / capability";

/// Short rows without answers are treated as group headers.
pub const HEADER_MAX_CHARS: usize = 60;

fn find_column(headers: &csv::StringRecord, pred: impl Fn(&str) -> bool) -> Option<usize> {
    headers
        .iter()
        .position(|h| pred(&h.trim().to_ascii_lowercase()))
}

fn cell<'a>(record: &'a csv::StringRecord, column: Option<usize>) -> &'a str {
    column
        .and_then(|c| record.get(c))
        .map(str::trim)
        .filter(|v| !v.eq_ignore_ascii_case("nan"))
        .unwrap_or_default()
}

/// Parses a compliance sheet into compliance sections.
///
/// Section ids are `r<row>` with the spreadsheet row number (header = row 1).
///
/// # Errors
///
/// Returns [`InputError::Malformed`] if the CSV is invalid or has no
/// requirement column.
pub fn parse(reader: impl Read) -> Result<Vec<SectionDef>, InputError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(reader);

    let headers = reader.headers()?.clone();
    let requirement = find_column(&headers, |h| h == REQUIREMENT_COLUMN).ok_or_else(|| {
        InputError::Malformed("no 'Feature / Capability' column found".to_string())
    })?;
    let compliance = find_column(&headers, |h| h.starts_with("compliance"));
    let remarks = find_column(&headers, |h| h.starts_with("remarks"));

    let mut sections = Vec::new();
    let mut group = String::new();

    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let row = index + 2;
        let text = cell(&record, Some(requirement));
        if text.is_empty() {
            continue;
        }

        let unanswered = cell(&record, compliance).is_empty() && cell(&record, remarks).is_empty();
        if text.ends_with(':') || (unanswered && text.chars().count() < HEADER_MAX_CHARS) {
            group = text.trim_end_matches(':').trim().to_string();
            debug!(row, group = %group, "group header");
            continue;
        }

        let requirement_text = if group.is_empty() {
            text.to_string()
        } else {
            format!("{group} {text}")
        };
        let position = sections.len();
        sections.push(SectionDef::new(
            format!("r{row}"),
            position,
            SectionKind::Compliance,
            requirement_text,
        ));
    }

    Ok(sections)
}
