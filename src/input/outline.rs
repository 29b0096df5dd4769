//! Plain-text proposal outlines.
//!
//! A heading is a numbered line (`4.2 Security`), a lettered line
//! (`B. Overview`) or an ALL-CAPS line of more than one word. Non-heading
//! lines under a heading are its bullets. Headings without bullets are
//! dropped.

use std::sync::LazyLock;

use regex::Regex;

use super::positional_id;
use crate::core::{SectionDef, SectionKind};

static NUMBERED: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\d+(\.\d+)*\.?\s+\S+").ok());
static LETTERED: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Z]\.\s+\S+").ok());
static ALL_CAPS: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Z][A-Z\s]{3,}$").ok());

fn matches(re: &LazyLock<Option<Regex>>, line: &str) -> bool {
    re.as_ref().is_some_and(|re| re.is_match(line))
}

/// Whether `line` (already trimmed) is a heading.
#[must_use]
pub fn is_heading(line: &str) -> bool {
    matches(&NUMBERED, line)
        || matches(&LETTERED, line)
        || (matches(&ALL_CAPS, line) && line.split_whitespace().count() > 1)
}

/// Parses an outline into narrative sections.
///
/// `line_range` is a 1-based inclusive range of lines to read; the end is
/// clamped to the document length.
#[must_use]
pub fn parse(text: &str, line_range: Option<(usize, usize)>) -> Vec<SectionDef> {
    let (first, last) = line_range.unwrap_or((1, usize::MAX));
    let mut outline: Vec<(String, Vec<String>)> = Vec::new();

    for line in text
        .lines()
        .enumerate()
        .filter(|(i, _)| (first..=last).contains(&(i + 1)))
        .map(|(_, l)| l.trim())
        .filter(|l| !l.is_empty())
    {
        if is_heading(line) {
            outline.push((line.to_string(), Vec::new()));
        } else if let Some((_, bullets)) = outline.last_mut() {
            bullets.push(line.trim_start_matches(['-', '*', '•']).trim().to_string());
        }
    }

    outline
        .into_iter()
        .filter(|(_, bullets)| bullets.iter().any(|b| !b.is_empty()))
        .enumerate()
        .map(|(position, (heading, bullets))| {
            let list: Vec<String> = bullets
                .iter()
                .filter(|b| !b.is_empty())
                .map(|b| format!("- {b}"))
                .collect();
            SectionDef::new(
                positional_id(position),
                position,
                SectionKind::Narrative,
                format!("{heading}\n{}", list.join("\n")),
            )
        })
        .collect()
}
