//! Retrieved knowledge-base passages.

use serde::{Deserialize, Serialize};

/// A passage returned by the retrieval client.
///
/// Fields are private so a result cannot be altered once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    passage_text: String,
    source_document_id: String,
    chunk_id: String,
    similarity_score: f32,
    token_count: usize,
}

impl RetrievalResult {
    /// Creates a result. The similarity score is clamped into `[0, 1]`.
    #[must_use]
    pub fn new(
        passage_text: impl Into<String>,
        source_document_id: impl Into<String>,
        chunk_id: impl Into<String>,
        similarity_score: f32,
        token_count: usize,
    ) -> Self {
        Self {
            passage_text: passage_text.into(),
            source_document_id: source_document_id.into(),
            chunk_id: chunk_id.into(),
            similarity_score: if similarity_score.is_nan() {
                0.0
            } else {
                similarity_score.clamp(0.0, 1.0)
            },
            token_count,
        }
    }

    /// Passage content.
    #[must_use]
    pub fn passage_text(&self) -> &str {
        &self.passage_text
    }

    /// Document the passage came from.
    #[must_use]
    pub fn source_document_id(&self) -> &str {
        &self.source_document_id
    }

    /// Store-unique chunk identifier.
    #[must_use]
    pub fn chunk_id(&self) -> &str {
        &self.chunk_id
    }

    /// Similarity to the query, higher is better.
    #[must_use]
    pub const fn similarity_score(&self) -> f32 {
        self.similarity_score
    }

    /// Token cost of attaching this passage to a prompt.
    #[must_use]
    pub const fn token_count(&self) -> usize {
        self.token_count
    }

    /// `doc#chunk` reference. Chunk ids already qualified by their
    /// document are returned as-is.
    #[must_use]
    pub fn citation(&self) -> String {
        let qualified = self
            .chunk_id
            .strip_prefix(self.source_document_id.as_str())
            .is_some_and(|rest| rest.starts_with('#'));
        if qualified {
            self.chunk_id.clone()
        } else {
            format!("{}#{}", self.source_document_id, self.chunk_id)
        }
    }
}
