//! Deterministic compliance verdict extraction.
//!
//! The first non-empty line of a generated answer carries the label. Markdown
//! emphasis, heading markers and a leading `Compliance:` / `Verdict:` prefix
//! are stripped before matching. Anything unrecognized becomes a
//! low-confidence `PARTIAL`; classification never fails a section.

use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::core::{Classification, RetrievalResult, Verdict};
use crate::error::ClassificationAmbiguous;

static LABEL_PREFIX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)^(compliance|verdict|answer|status)\s*[:\-]\s*").ok());

/// Maps a label to a verdict.
fn label_verdict(label: &str) -> Option<Verdict> {
    let normalized = label
        .trim_end_matches(['.', '!', ',', ';'])
        .replace(['_', '-'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase();
    match normalized.as_str() {
        "YES" | "COMPLIANT" | "FULLY COMPLIANT" => Some(Verdict::Yes),
        "NO" | "NON COMPLIANT" | "NOT COMPLIANT" => Some(Verdict::No),
        "PARTIAL" | "PARTIALLY" | "PARTIALLY COMPLIANT" => Some(Verdict::Partial),
        _ => None,
    }
}

fn strip_markup(line: &str) -> String {
    let line = line
        .trim()
        .trim_start_matches('#')
        .trim()
        .trim_matches(|c| c == '*' || c == '_' || c == '`')
        .trim();
    let line = LABEL_PREFIX
        .as_ref()
        .map_or_else(|| line.to_string(), |re| re.replace(line, "").into_owned());
    line.trim_matches(|c| c == '*' || c == '_' || c == '`' || c == ' ')
        .to_string()
}

/// Resolves the verdict label of a generated answer.
///
/// The label may be the whole line or its leading word group followed by a
/// separator (`YES - SAML is supported`).
///
/// # Errors
///
/// Returns [`ClassificationAmbiguous`] when the first non-empty line does not
/// resolve to exactly one verdict.
pub fn extract_verdict(generated_text: &str) -> Result<Verdict, ClassificationAmbiguous> {
    let line = generated_text
        .lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or_default();
    let cleaned = strip_markup(line);

    if let Some(verdict) = label_verdict(&cleaned) {
        return Ok(verdict);
    }
    let head = cleaned
        .split([':', '-', '—', '(', ','])
        .next()
        .unwrap_or_default()
        .trim();
    if head.len() < cleaned.len()
        && let Some(verdict) = label_verdict(head)
    {
        return Ok(verdict);
    }
    Err(ClassificationAmbiguous {
        line: line.trim().to_string(),
    })
}

/// Classifies a compliance answer.
///
/// The justification is the generated text after the label line, followed
/// by an evidence line naming every passage used.
#[must_use]
pub fn classify(requirement_text: &str, passages: &[RetrievalResult], generated_text: &str) -> Classification {
    let (verdict, low_confidence) = match extract_verdict(generated_text) {
        Ok(verdict) => (verdict, false),
        Err(err) => {
            warn!(requirement = %requirement_text, error = %err, "defaulting verdict to PARTIAL");
            (Verdict::Partial, true)
        }
    };

    let body: String = if low_confidence {
        generated_text.trim().to_string()
    } else {
        generated_text
            .trim()
            .lines()
            .skip_while(|l| l.trim().is_empty())
            .skip(1)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    };

    let mut justification = String::new();
    if low_confidence {
        justification.push_str("Low confidence: no explicit YES/NO/PARTIAL label was given.\n");
    }
    if !body.is_empty() {
        justification.push_str(&body);
        justification.push('\n');
    }
    justification.push_str(&evidence_line(passages));

    Classification {
        verdict,
        justification,
        low_confidence,
    }
}

fn evidence_line(passages: &[RetrievalResult]) -> String {
    if passages.is_empty() {
        "Evidence: no knowledge-base passages were retrieved.".to_string()
    } else {
        let cited: Vec<String> = passages.iter().map(RetrievalResult::citation).collect();
        format!("Evidence: {}", cited.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("YES\nSAML 2.0 is supported.", Verdict::Yes ; "bare yes")]
    #[test_case("**NO**\nNot offered.", Verdict::No ; "bold no")]
    #[test_case("## Partial\nOnly in EU region.", Verdict::Partial ; "heading partial")]
    #[test_case("Compliance: Fully Compliant\n", Verdict::Yes ; "prefixed synonym")]
    #[test_case("Verdict: NON-COMPLIANT", Verdict::No ; "hyphenated synonym")]
    #[test_case("\n\n  Partially compliant.\nDetails", Verdict::Partial ; "leading blank lines")]
    #[test_case("YES - SSO via SAML and OIDC", Verdict::Yes ; "label then dash")]
    #[test_case("Not compliant: roadmap item", Verdict::No ; "label then colon")]
    fn test_extract_verdict(text: &str, expected: Verdict) {
        assert_eq!(extract_verdict(text).ok(), Some(expected));
    }

    #[test_case("" ; "empty")]
    #[test_case("Our platform supports SSO." ; "prose")]
    #[test_case("Yes and no, depending on tier" ; "mixed")]
    #[test_case("Maybe" ; "unknown word")]
    fn test_ambiguous(text: &str) {
        assert!(extract_verdict(text).is_err());
    }

    #[test]
    fn test_classify_cites_passages() {
        let passages = vec![
            RetrievalResult::new("SAML", "sso.md", "sso.md#0", 0.9, 2),
            RetrievalResult::new("OIDC", "sso.md", "1", 0.8, 2),
        ];
        let c = classify("Supports SSO", &passages, "YES\nSAML and OIDC are supported.");
        assert_eq!(c.verdict, Verdict::Yes);
        assert!(!c.low_confidence);
        assert!(c.justification.starts_with("SAML and OIDC are supported."));
        assert!(c.justification.ends_with("Evidence: sso.md#0, sso.md#1"));
    }

    #[test]
    fn test_classify_defaults_to_low_confidence_partial() {
        let c = classify("Supports SSO", &[], "We think so.");
        assert_eq!(c.verdict, Verdict::Partial);
        assert!(c.low_confidence);
        assert!(c.justification.starts_with("Low confidence"));
        assert!(c.justification.contains("We think so."));
        assert!(c.justification.ends_with("no knowledge-base passages were retrieved."));
    }
}
