//! JSON section lists.
//!
//! ```json
//! [
//!   { "id": "q1", "kind": "compliance", "requirement_text": "Supports SSO" },
//!   { "kind": "narrative", "requirement_text": "Describe onboarding" }
//! ]
//! ```
//!
//! `id` is optional and defaults to the positional id (`s0001` above).

use serde::Deserialize;

use super::positional_id;
use crate::core::{SectionDef, SectionKind};
use crate::error::InputError;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSection {
    #[serde(default)]
    id: Option<String>,
    kind: SectionKind,
    requirement_text: String,
}

/// Parses a JSON section list.
///
/// # Errors
///
/// Returns [`InputError::Malformed`] for invalid JSON, unknown fields or an
/// empty requirement.
pub fn parse(text: &str) -> Result<Vec<SectionDef>, InputError> {
    let raw: Vec<RawSection> = serde_json::from_str(text)?;
    raw.into_iter()
        .enumerate()
        .map(|(position, r)| {
            let requirement = r.requirement_text.trim();
            if requirement.is_empty() {
                return Err(InputError::Malformed(format!(
                    "section {position} has an empty requirement_text"
                )));
            }
            let id = r
                .id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| positional_id(position));
            Ok(SectionDef::new(id, position, r.kind, requirement))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults_ids() {
        let sections = parse(
            r#"[
                {"id": "q1", "kind": "compliance", "requirement_text": " Supports SSO "},
                {"kind": "narrative", "requirement_text": "Describe onboarding"}
            ]"#,
        )
        .unwrap_or_default();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].id, "q1");
        assert_eq!(sections[0].requirement_text, "Supports SSO");
        assert_eq!(sections[1].id, "s0001");
        assert_eq!(sections[1].kind, SectionKind::Narrative);
        assert_eq!(sections[1].position, 1);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse(r#"[{"kind": "essay", "requirement_text": "x"}]"#).is_err());
        assert!(parse(r#"[{"kind": "narrative", "requirement_text": "  "}]"#).is_err());
        assert!(parse(r#"[{"kind": "narrative", "requirement_text": "x", "extra": 1}]"#).is_err());
        assert!(parse("{}").is_err());
    }
}
