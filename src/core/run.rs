//! Run ledger: the header persisted per run and the assembled output view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::passage::RetrievalResult;
use super::section::{Section, SectionDef, SectionKind, SectionStatus};
use super::verdict::Verdict;

/// Which generation backend family to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Hosted OpenAI-compatible chat completions API.
    Cloud,
    /// Locally hosted Ollama server.
    Local,
}

impl ProviderKind {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cloud => "cloud",
            Self::Local => "local",
        }
    }

    /// Parses a provider name. `openai` and `ollama` are accepted as aliases.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cloud" | "openai" => Some(Self::Cloud),
            "local" | "ollama" => Some(Self::Local),
            _ => None,
        }
    }

    /// Model used when none is configured.
    #[must_use]
    pub const fn default_model(&self) -> &'static str {
        match self {
            Self::Cloud => "gpt-4o-mini",
            Self::Local => "llama3:8b-instruct-q4_K_M",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend selection plus sampling parameters for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Backend family.
    pub kind: ProviderKind,
    /// Model identifier.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion length cap.
    pub max_output_tokens: u32,
    /// API base URL override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Model for compliance sections, when it differs from `model`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliance_model: Option<String>,
}

impl ProviderConfig {
    /// Config for `kind` with its default model.
    #[must_use]
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            model: kind.default_model().to_string(),
            temperature: 0.3,
            max_output_tokens: 900,
            base_url: None,
            compliance_model: None,
        }
    }

    /// Overrides the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sets the model used for compliance sections.
    #[must_use]
    pub fn with_compliance_model(mut self, model: impl Into<String>) -> Self {
        self.compliance_model = Some(model.into());
        self
    }

    /// Model to call for a section of `kind`.
    #[must_use]
    pub fn model_for(&self, kind: SectionKind) -> &str {
        match (kind, self.compliance_model.as_deref()) {
            (SectionKind::Compliance, Some(model)) => model,
            _ => self.model.as_str(),
        }
    }
}

/// Retrieval budget and document scope fixed at run creation.
///
/// Stored on the run header so a resumed run retrieves exactly as the
/// original pass did, whatever the current configuration says.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalProfile {
    /// Passages per narrative section.
    pub top_k: usize,
    /// Token budget per narrative section.
    pub max_context_tokens: usize,
    /// Passages per compliance section.
    pub compliance_top_k: usize,
    /// Token budget per compliance section.
    pub compliance_max_context_tokens: usize,
    /// Restrict retrieval to these source documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_filter: Option<Vec<String>>,
}

impl Default for RetrievalProfile {
    fn default() -> Self {
        Self {
            top_k: 3,
            max_context_tokens: 2000,
            compliance_top_k: 1,
            compliance_max_context_tokens: 800,
            doc_filter: None,
        }
    }
}

impl RetrievalProfile {
    /// `(max_passages, max_tokens)` for a section of `kind`.
    #[must_use]
    pub const fn budget(&self, kind: SectionKind) -> (usize, usize) {
        match kind {
            SectionKind::Compliance => (self.compliance_top_k, self.compliance_max_context_tokens),
            SectionKind::Narrative => (self.top_k, self.max_context_tokens),
        }
    }
}

/// Persisted run header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHeader {
    /// Run identifier (UUID v4).
    pub run_id: String,
    /// Where the sections came from.
    pub input_document_ref: String,
    /// Section definitions in input order.
    pub sections: Vec<SectionDef>,
    /// Active provider configuration.
    pub provider_config: ProviderConfig,
    /// Retrieval budget and scope for every pass over this run.
    #[serde(default)]
    pub retrieval: RetrievalProfile,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Set once every section is done or permanently failed.
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when an operator abandons the run.
    pub abandoned_at: Option<DateTime<Utc>>,
}

impl RunHeader {
    /// Creates a header with a fresh run id.
    #[must_use]
    pub fn new(
        input_document_ref: impl Into<String>,
        sections: Vec<SectionDef>,
        provider_config: ProviderConfig,
    ) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            input_document_ref: input_document_ref.into(),
            sections,
            provider_config,
            retrieval: RetrievalProfile::default(),
            created_at: Utc::now(),
            completed_at: None,
            abandoned_at: None,
        }
    }

    /// Replaces the retrieval profile.
    #[must_use]
    pub fn with_retrieval(mut self, retrieval: RetrievalProfile) -> Self {
        self.retrieval = retrieval;
        self
    }

    /// Lifecycle label for display.
    #[must_use]
    pub const fn lifecycle(&self) -> &'static str {
        if self.abandoned_at.is_some() {
            "abandoned"
        } else if self.completed_at.is_some() {
            "completed"
        } else {
            "in-progress"
        }
    }
}

/// An in-memory run: header plus the replayed section states.
#[derive(Debug, Clone)]
pub struct Run {
    /// Persisted header.
    pub header: RunHeader,
    /// Sections in input order.
    pub sections: Vec<Section>,
    /// Highest committed checkpoint sequence.
    pub checkpoint_cursor: i64,
}

/// One section of the assembled response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionOutput {
    /// Section id.
    pub id: String,
    /// Input position.
    pub position: usize,
    /// Section kind.
    pub kind: SectionKind,
    /// Requirement text.
    pub requirement_text: String,
    /// Final status.
    pub status: SectionStatus,
    /// Generated answer.
    pub generated_text: Option<String>,
    /// Compliance verdict.
    pub verdict: Option<Verdict>,
    /// Verdict justification.
    pub justification: Option<String>,
    /// Verdict was defaulted.
    pub low_confidence: bool,
    /// Attempts made.
    pub attempt_count: u32,
    /// Last failure, if any.
    pub last_error: Option<String>,
    /// `doc#chunk` citations of the passages used.
    pub sources: Vec<String>,
}

impl From<&Section> for SectionOutput {
    fn from(section: &Section) -> Self {
        let def = section.def();
        let state = section.state();
        Self {
            id: def.id.clone(),
            position: def.position,
            kind: def.kind,
            requirement_text: def.requirement_text.clone(),
            status: state.status,
            generated_text: state.generated_text.clone(),
            verdict: state.verdict,
            justification: state.justification.clone(),
            low_confidence: state.low_confidence,
            attempt_count: state.attempt_count,
            last_error: state.last_error.clone(),
            sources: state
                .retrieved_passages
                .iter()
                .map(RetrievalResult::citation)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_aliases() {
        assert_eq!(ProviderKind::parse("openai"), Some(ProviderKind::Cloud));
        assert_eq!(ProviderKind::parse("Ollama"), Some(ProviderKind::Local));
        assert_eq!(ProviderKind::parse("anthropic"), None);
    }

    #[test]
    fn test_provider_config_defaults() {
        let cfg = ProviderConfig::new(ProviderKind::Local);
        assert_eq!(cfg.model, "llama3:8b-instruct-q4_K_M");
        assert_eq!(cfg.max_output_tokens, 900);
        let cfg = ProviderConfig::new(ProviderKind::Cloud).with_model("gpt-4o");
        assert_eq!(cfg.model, "gpt-4o");
    }

    #[test]
    fn test_compliance_model_only_for_compliance() {
        let cfg = ProviderConfig::new(ProviderKind::Local);
        assert_eq!(cfg.model_for(SectionKind::Compliance), "llama3:8b-instruct-q4_K_M");
        let cfg = cfg.with_compliance_model("phi3:mini");
        assert_eq!(cfg.model_for(SectionKind::Compliance), "phi3:mini");
        assert_eq!(cfg.model_for(SectionKind::Narrative), "llama3:8b-instruct-q4_K_M");
    }

    #[test]
    fn test_retrieval_budget_by_kind() {
        let profile = RetrievalProfile::default();
        assert_eq!(profile.budget(SectionKind::Narrative), (3, 2000));
        assert_eq!(profile.budget(SectionKind::Compliance), (1, 800));
    }

    #[test]
    fn test_header_without_retrieval_profile_decodes() {
        let header = RunHeader::new("rfp.csv", Vec::new(), ProviderConfig::new(ProviderKind::Local));
        let mut json = serde_json::to_value(&header).unwrap_or_default();
        if let Some(map) = json.as_object_mut() {
            map.remove("retrieval");
        }
        let decoded: RunHeader = serde_json::from_value(json).unwrap_or_else(|_| unreachable!());
        assert_eq!(decoded.retrieval, RetrievalProfile::default());
    }

    #[test]
    fn test_header_lifecycle() {
        let mut header = RunHeader::new("rfp.csv", Vec::new(), ProviderConfig::new(ProviderKind::Cloud));
        assert_eq!(header.lifecycle(), "in-progress");
        assert!(uuid::Uuid::parse_str(&header.run_id).is_ok());
        header.completed_at = Some(Utc::now());
        assert_eq!(header.lifecycle(), "completed");
        header.abandoned_at = Some(Utc::now());
        assert_eq!(header.lifecycle(), "abandoned");
    }

    #[test]
    fn test_section_output_sources() {
        let mut section = Section::new(SectionDef::new("s0000", 0, SectionKind::Narrative, "Intro"));
        assert!(section.begin_attempt().is_ok());
        assert!(
            section
                .attach_passages(vec![RetrievalResult::new("p", "handbook.md", "handbook.md#2", 0.8, 10)])
                .is_ok()
        );
        let out = SectionOutput::from(&section);
        assert_eq!(out.sources, vec!["handbook.md#2".to_string()]);
        assert_eq!(out.status, SectionStatus::Generating);
    }
}
