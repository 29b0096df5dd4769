//! Core data model: sections, passages, verdicts and the run ledger.

pub mod passage;
pub mod run;
pub mod section;
pub mod verdict;

pub use passage::RetrievalResult;
pub use run::{ProviderConfig, ProviderKind, RetrievalProfile, Run, RunHeader, SectionOutput};
pub use section::{Classification, Section, SectionDef, SectionKind, SectionState, SectionStatus};
pub use verdict::Verdict;
