//! Section model and its status state machine.
//!
//! A [`Section`] pairs an immutable [`SectionDef`] (what the input document
//! asked) with a [`SectionState`] (how far processing got). State only moves
//! through the methods on [`Section`], which enforce the transition rules:
//!
//! ```text
//! pending → retrieving → generating ─┬─(narrative)──→ done
//!                                    └─(compliance)─→ classifying → done
//! any non-terminal state → failed
//! failed → pending   (explicit retry reset only)
//! ```

use serde::{Deserialize, Serialize};

use super::passage::RetrievalResult;
use super::verdict::Verdict;
use crate::error::TransitionError;

/// What kind of answer a section needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionKind {
    /// A discrete requirement needing a YES/NO/PARTIAL verdict.
    Compliance,
    /// A free-form proposal section.
    Narrative,
}

impl SectionKind {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Compliance => "compliance",
            Self::Narrative => "narrative",
        }
    }

    /// Parses a kind name (case-insensitive).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compliance" => Some(Self::Compliance),
            "narrative" => Some(Self::Narrative),
            _ => None,
        }
    }
}

impl std::fmt::Display for SectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing status of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionStatus {
    /// Not started, or reset for retry.
    Pending,
    /// Retrieval call issued.
    Retrieving,
    /// Passages attached, generation call issued.
    Generating,
    /// Text generated, verdict not yet extracted.
    Classifying,
    /// Finished successfully.
    Done,
    /// Finished unsuccessfully.
    Failed,
}

impl SectionStatus {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrieving => "retrieving",
            Self::Generating => "generating",
            Self::Classifying => "classifying",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Parses a status name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "retrieving" => Some(Self::Retrieving),
            "generating" => Some(Self::Generating),
            "classifying" => Some(Self::Classifying),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// `done` or `failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether `self → to` is legal for a section of `kind`.
    #[must_use]
    pub const fn can_transition(self, to: Self, kind: SectionKind) -> bool {
        match (self, to) {
            (Self::Pending, Self::Retrieving)
            | (Self::Retrieving, Self::Generating)
            | (Self::Failed, Self::Pending) => true,
            (Self::Generating, Self::Done) => matches!(kind, SectionKind::Narrative),
            (Self::Generating, Self::Classifying) | (Self::Classifying, Self::Done) => {
                matches!(kind, SectionKind::Compliance)
            }
            (from, Self::Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for SectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of a section as parsed from the input document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionDef {
    /// Stable identifier derived from the source position.
    pub id: String,
    /// Zero-based position in the input document.
    pub position: usize,
    /// Answer kind.
    pub kind: SectionKind,
    /// The requirement or question text.
    pub requirement_text: String,
}

impl SectionDef {
    /// Creates a section definition.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        position: usize,
        kind: SectionKind,
        requirement_text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            position,
            kind,
            requirement_text: requirement_text.into(),
        }
    }
}

/// Mutable processing state of a section.
///
/// This is exactly what a checkpoint record persists, so replaying the
/// latest record restores it verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionState {
    /// Current status.
    pub status: SectionStatus,
    /// Passages attached for generation.
    pub retrieved_passages: Vec<RetrievalResult>,
    /// Generated answer.
    pub generated_text: Option<String>,
    /// Compliance verdict (compliance sections in `done` only).
    pub verdict: Option<Verdict>,
    /// Evidence-backed justification for the verdict.
    pub justification: Option<String>,
    /// The verdict was defaulted from an ambiguous answer.
    pub low_confidence: bool,
    /// Attempts started so far.
    pub attempt_count: u32,
    /// Most recent failure.
    pub last_error: Option<String>,
}

impl Default for SectionState {
    fn default() -> Self {
        Self {
            status: SectionStatus::Pending,
            retrieved_passages: Vec::new(),
            generated_text: None,
            verdict: None,
            justification: None,
            low_confidence: false,
            attempt_count: 0,
            last_error: None,
        }
    }
}

/// A verdict with its supporting justification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Resolved verdict.
    pub verdict: Verdict,
    /// Justification citing the retrieved evidence.
    pub justification: String,
    /// Set when the verdict was defaulted.
    pub low_confidence: bool,
}

/// One unit of work: a definition plus its processing state.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    def: SectionDef,
    state: SectionState,
}

impl Section {
    /// Creates a pending section.
    #[must_use]
    pub fn new(def: SectionDef) -> Self {
        Self {
            def,
            state: SectionState::default(),
        }
    }

    /// Rebuilds a section from a committed state.
    #[must_use]
    pub const fn restore(def: SectionDef, state: SectionState) -> Self {
        Self { def, state }
    }

    /// Section definition.
    #[must_use]
    pub const fn def(&self) -> &SectionDef {
        &self.def
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> &SectionState {
        &self.state
    }

    /// Section id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.def.id
    }

    /// Section kind.
    #[must_use]
    pub const fn kind(&self) -> SectionKind {
        self.def.kind
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> SectionStatus {
        self.state.status
    }

    fn advance(&mut self, to: SectionStatus) -> Result<(), TransitionError> {
        if !self.state.status.can_transition(to, self.def.kind) {
            return Err(TransitionError {
                section_id: self.def.id.clone(),
                from: self.state.status,
                to,
            });
        }
        self.state.status = to;
        Ok(())
    }

    /// `pending → retrieving`, starting a new attempt.
    pub fn begin_attempt(&mut self) -> Result<(), TransitionError> {
        self.advance(SectionStatus::Retrieving)?;
        self.state.attempt_count = self.state.attempt_count.saturating_add(1);
        self.state.retrieved_passages.clear();
        self.state.generated_text = None;
        Ok(())
    }

    /// `retrieving → generating`, attaching the retrieved passages.
    pub fn attach_passages(&mut self, passages: Vec<RetrievalResult>) -> Result<(), TransitionError> {
        self.advance(SectionStatus::Generating)?;
        self.state.retrieved_passages = passages;
        Ok(())
    }

    /// Records generated text. Narrative sections finish here; compliance
    /// sections move on to `classifying`.
    pub fn record_generation(&mut self, text: String) -> Result<(), TransitionError> {
        let next = match self.def.kind {
            SectionKind::Narrative => SectionStatus::Done,
            SectionKind::Compliance => SectionStatus::Classifying,
        };
        self.advance(next)?;
        self.state.generated_text = Some(text);
        self.state.last_error = None;
        Ok(())
    }

    /// `classifying → done` with a verdict.
    pub fn record_classification(
        &mut self,
        classification: Classification,
    ) -> Result<(), TransitionError> {
        self.advance(SectionStatus::Done)?;
        self.state.verdict = Some(classification.verdict);
        self.state.justification = Some(classification.justification);
        self.state.low_confidence = classification.low_confidence;
        Ok(())
    }

    /// Diverts a non-terminal section to `failed`.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.advance(SectionStatus::Failed)?;
        self.state.last_error = Some(error.into());
        Ok(())
    }

    /// `failed → pending` for an explicit retry. Keeps `attempt_count` and
    /// `last_error`.
    pub fn reset_for_retry(&mut self) -> Result<(), TransitionError> {
        self.advance(SectionStatus::Pending)?;
        self.state.retrieved_passages.clear();
        self.state.generated_text = None;
        self.state.verdict = None;
        self.state.justification = None;
        self.state.low_confidence = false;
        Ok(())
    }

    /// Checks that `verdict` is set iff the section is a finished compliance
    /// section.
    #[must_use]
    pub const fn verdict_consistent(&self) -> bool {
        let expects = matches!(self.def.kind, SectionKind::Compliance)
            && matches!(self.state.status, SectionStatus::Done);
        expects == self.state.verdict.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn compliance() -> Section {
        Section::new(SectionDef::new(
            "r2",
            0,
            SectionKind::Compliance,
            "Supports SSO",
        ))
    }

    fn narrative() -> Section {
        Section::new(SectionDef::new("s0000", 0, SectionKind::Narrative, "Overview"))
    }

    fn classification(verdict: Verdict) -> Classification {
        Classification {
            verdict,
            justification: "evidence".to_string(),
            low_confidence: false,
        }
    }

    #[test]
    fn test_compliance_happy_path() {
        let mut s = compliance();
        assert!(s.begin_attempt().is_ok());
        assert_eq!(s.state().attempt_count, 1);
        assert!(s.attach_passages(Vec::new()).is_ok());
        assert!(s.record_generation("YES\nok".to_string()).is_ok());
        assert_eq!(s.status(), SectionStatus::Classifying);
        assert!(s.verdict_consistent());
        assert!(s.record_classification(classification(Verdict::Yes)).is_ok());
        assert_eq!(s.status(), SectionStatus::Done);
        assert_eq!(s.state().verdict, Some(Verdict::Yes));
        assert!(s.verdict_consistent());
    }

    #[test]
    fn test_narrative_skips_classification() {
        let mut s = narrative();
        assert!(s.begin_attempt().is_ok());
        assert!(s.attach_passages(Vec::new()).is_ok());
        assert!(s.record_generation("text".to_string()).is_ok());
        assert_eq!(s.status(), SectionStatus::Done);
        assert!(s.state().verdict.is_none());
        assert!(s.record_classification(classification(Verdict::No)).is_err());
    }

    #[test]
    fn test_no_backward_transitions() {
        let mut s = narrative();
        assert!(s.begin_attempt().is_ok());
        assert!(s.begin_attempt().is_err());
        assert!(s.reset_for_retry().is_err());
        assert_eq!(s.status(), SectionStatus::Retrieving);
    }

    #[test]
    fn test_fail_and_retry_reset() {
        let mut s = compliance();
        assert!(s.begin_attempt().is_ok());
        assert!(s.attach_passages(Vec::new()).is_ok());
        assert!(s.fail("backend rejected prompt").is_ok());
        assert_eq!(s.status(), SectionStatus::Failed);
        assert_eq!(s.state().attempt_count, 1);
        assert!(s.fail("again").is_err());

        assert!(s.reset_for_retry().is_ok());
        assert_eq!(s.status(), SectionStatus::Pending);
        assert_eq!(s.state().last_error.as_deref(), Some("backend rejected prompt"));
        assert!(s.begin_attempt().is_ok());
        assert_eq!(s.state().attempt_count, 2);
    }

    #[test]
    fn test_done_is_final() {
        let mut s = narrative();
        assert!(s.begin_attempt().is_ok());
        assert!(s.attach_passages(Vec::new()).is_ok());
        assert!(s.record_generation("text".to_string()).is_ok());
        assert!(s.fail("late").is_err());
        assert!(s.reset_for_retry().is_err());
    }

    #[test_case(SectionStatus::Pending, SectionStatus::Retrieving, true)]
    #[test_case(SectionStatus::Retrieving, SectionStatus::Generating, true)]
    #[test_case(SectionStatus::Generating, SectionStatus::Classifying, true)]
    #[test_case(SectionStatus::Generating, SectionStatus::Done, false)]
    #[test_case(SectionStatus::Classifying, SectionStatus::Done, true)]
    #[test_case(SectionStatus::Pending, SectionStatus::Failed, true)]
    #[test_case(SectionStatus::Done, SectionStatus::Failed, false)]
    #[test_case(SectionStatus::Failed, SectionStatus::Pending, true)]
    #[test_case(SectionStatus::Generating, SectionStatus::Retrieving, false)]
    #[test_case(SectionStatus::Pending, SectionStatus::Done, false)]
    fn test_compliance_transitions(from: SectionStatus, to: SectionStatus, legal: bool) {
        assert_eq!(from.can_transition(to, SectionKind::Compliance), legal);
    }

    #[test]
    fn test_status_round_trip_names() {
        for status in [
            SectionStatus::Pending,
            SectionStatus::Retrieving,
            SectionStatus::Generating,
            SectionStatus::Classifying,
            SectionStatus::Done,
            SectionStatus::Failed,
        ] {
            assert_eq!(SectionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SectionKind::parse("Compliance"), Some(SectionKind::Compliance));
        assert_eq!(SectionKind::parse("essay"), None);
    }
}
