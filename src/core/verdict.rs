//! Compliance verdict labels.

use serde::{Deserialize, Serialize};

/// Compliance classification of a requirement.
///
/// Serialized upper-case (`"YES"`, `"NO"`, `"PARTIAL"`) to match the
/// column values of a compliance sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    /// Fully met.
    Yes,
    /// Not met.
    No,
    /// Met with conditions, or not determinable with confidence.
    Partial,
}

impl Verdict {
    /// Parses a label exactly (case-insensitive, surrounding whitespace ignored).
    ///
    /// Returns `None` for anything that is not one of the three labels.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "YES" => Some(Self::Yes),
            "NO" => Some(Self::No),
            "PARTIAL" => Some(Self::Partial),
            _ => None,
        }
    }

    /// Returns the canonical label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Yes => "YES",
            Self::No => "NO",
            Self::Partial => "PARTIAL",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
