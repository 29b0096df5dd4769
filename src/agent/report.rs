//! Run reports: per-section outcome after an orchestrator pass.

use serde::Serialize;

use super::message::TokenUsage;
use crate::checkpoint::CheckpointStore;
use crate::core::{RunHeader, Section, SectionKind, SectionStatus, Verdict};
use crate::error::CheckpointError;

/// Outcome of one section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionReport {
    /// Section id.
    pub id: String,
    /// Input position.
    pub position: usize,
    /// Section kind.
    pub kind: SectionKind,
    /// Status at the end of the pass.
    pub status: SectionStatus,
    /// Verdict for finished compliance sections.
    pub verdict: Option<Verdict>,
    /// Verdict was defaulted from an ambiguous answer.
    pub low_confidence: bool,
    /// Attempts started.
    pub attempt_count: u32,
    /// Most recent failure.
    pub last_error: Option<String>,
    /// Failed with no attempts left.
    pub permanently_failed: bool,
}

/// Summary of a run after an orchestrator pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Run id.
    pub run_id: String,
    /// Where the sections came from.
    pub input_document_ref: String,
    /// `in-progress`, `completed` or `abandoned`.
    pub lifecycle: String,
    /// The pass stopped on cancellation before every section finished.
    pub cancelled: bool,
    /// Sections in input order.
    pub sections: Vec<SectionReport>,
    /// Tokens spent by this pass.
    pub usage: TokenUsage,
}

impl RunReport {
    /// Builds a report from a header and its sections.
    #[must_use]
    pub fn new(header: &RunHeader, sections: &[Section], max_attempts: u32) -> Self {
        let mut sections: Vec<SectionReport> = sections
            .iter()
            .map(|s| {
                let state = s.state();
                SectionReport {
                    id: s.id().to_string(),
                    position: s.def().position,
                    kind: s.kind(),
                    status: state.status,
                    verdict: state.verdict,
                    low_confidence: state.low_confidence,
                    attempt_count: state.attempt_count,
                    last_error: state.last_error.clone(),
                    permanently_failed: state.status == SectionStatus::Failed
                        && state.attempt_count >= max_attempts,
                }
            })
            .collect();
        sections.sort_by_key(|s| s.position);

        Self {
            run_id: header.run_id.clone(),
            input_document_ref: header.input_document_ref.clone(),
            lifecycle: header.lifecycle().to_string(),
            cancelled: false,
            sections,
            usage: TokenUsage::default(),
        }
    }

    /// Report of a stored run as last committed.
    ///
    /// # Errors
    ///
    /// Propagates replay failures.
    pub fn load(store: &dyn CheckpointStore, run_id: &str, max_attempts: u32) -> Result<Self, CheckpointError> {
        let run = store.replay(run_id)?;
        Ok(Self::new(&run.header, &run.sections, max_attempts))
    }

    /// Sections with `status`.
    #[must_use]
    pub fn count(&self, status: SectionStatus) -> usize {
        self.sections.iter().filter(|s| s.status == status).count()
    }

    /// Failed sections with no attempts left.
    pub fn permanently_failed(&self) -> impl Iterator<Item = &SectionReport> {
        self.sections.iter().filter(|s| s.permanently_failed)
    }

    /// Failed sections a `retry_failed` resume would pick up.
    pub fn retryable(&self) -> impl Iterator<Item = &SectionReport> {
        self.sections
            .iter()
            .filter(|s| s.status == SectionStatus::Failed && !s.permanently_failed)
    }

    /// Every section is `done` or `failed`.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.sections.iter().all(|s| s.status.is_terminal())
    }

    /// Finished compliance sections whose verdict was defaulted.
    #[must_use]
    pub fn low_confidence(&self) -> usize {
        self.sections.iter().filter(|s| s.low_confidence).count()
    }
}
