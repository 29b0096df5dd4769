//! Input adapters: turn an RFP document into ordered section definitions.
//!
//! Three formats are understood:
//!
//! - JSON section lists (`.json`)
//! - compliance sheets exported as CSV (`.csv`)
//! - plain-text outlines extracted from a proposal document (`.txt`, `.md`)

pub mod csv;
pub mod json;
pub mod outline;

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::SectionDef;
use crate::error::InputError;

/// Supported input formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    /// Array of section objects.
    Json,
    /// Compliance sheet with a `Feature / Capability` column.
    Csv,
    /// Heading-and-bullet text outline.
    Outline,
}

impl InputFormat {
    /// Parses a format name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "csv" => Some(Self::Csv),
            "outline" | "text" | "txt" => Some(Self::Outline),
            _ => None,
        }
    }

    /// Infers the format from a file extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "csv" => Some(Self::Csv),
            "txt" | "text" | "md" | "markdown" => Some(Self::Outline),
            _ => None,
        }
    }
}

/// How to read an input document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Overrides extension-based detection.
    pub format: Option<InputFormat>,
    /// 1-based inclusive line range (outlines only).
    pub line_range: Option<(usize, usize)>,
}

/// Reads `path` into section definitions in document order.
///
/// # Errors
///
/// - [`InputError::UnsupportedFormat`] if the format cannot be determined
/// - [`InputError::Malformed`] if the file cannot be read or parsed
/// - [`InputError::Empty`] if no sections were found
/// - [`InputError::DuplicateId`] if two sections share an id
pub fn load_sections(path: &Path, options: &LoadOptions) -> Result<Vec<SectionDef>, InputError> {
    let format = options
        .format
        .or_else(|| InputFormat::from_path(path))
        .ok_or_else(|| InputError::UnsupportedFormat(path.display().to_string()))?;
    let text = std::fs::read_to_string(path)
        .map_err(|e| InputError::Malformed(format!("{}: {e}", path.display())))?;

    let sections = match format {
        InputFormat::Json => json::parse(&text)?,
        InputFormat::Csv => csv::parse(text.as_bytes())?,
        InputFormat::Outline => outline::parse(&text, options.line_range),
    };

    if sections.is_empty() {
        return Err(InputError::Empty(path.display().to_string()));
    }
    ensure_unique(&sections)?;
    Ok(sections)
}

/// Rejects duplicate section ids.
///
/// # Errors
///
/// Returns [`InputError::DuplicateId`] naming the first repeated id.
pub fn ensure_unique(sections: &[SectionDef]) -> Result<(), InputError> {
    let mut seen = HashSet::new();
    for section in sections {
        if !seen.insert(section.id.as_str()) {
            return Err(InputError::DuplicateId(section.id.clone()));
        }
    }
    Ok(())
}

/// Default id for the section at `position`.
#[must_use]
pub fn positional_id(position: usize) -> String {
    format!("s{position:04}")
}
