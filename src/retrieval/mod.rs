//! Budget-limited passage retrieval over a vector store.
//!
//! [`RetrievalClient::retrieve`] embeds the query, asks the store for a
//! candidate pool and then applies [`select_passages`]: threshold, rank,
//! dedupe by `chunk_id`, and greedy accumulation under the passage and
//! token budgets. A passage that does not fit the remaining token budget is
//! skipped, never truncated, and the scan continues with the next one.

pub mod embedding;
pub mod ingest;
pub mod store;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::agent::retry::{RetryOutcome, RetryPolicy};
use crate::core::RetrievalResult;
use crate::error::RetrievalError;

pub use embedding::{Embedder, HashEmbedder, create_embedder};
pub use store::{Candidate, ChunkRecord, SqliteVectorStore, StoreStats, VectorStore};

/// Ordering among candidates with equal similarity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Ascending `chunk_id`.
    #[default]
    ChunkId,
    /// The order the store returned them in.
    StoreOrder,
}

impl TieBreak {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ChunkId => "chunk_id",
            Self::StoreOrder => "store_order",
        }
    }

    /// Parses a rule name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "chunk_id" => Some(Self::ChunkId),
            "store_order" => Some(Self::StoreOrder),
            _ => None,
        }
    }
}

/// Knobs applied to every retrieval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalSettings {
    /// Candidates below this similarity are dropped.
    pub min_similarity: f32,
    /// Candidates requested from the store (raised to `max_passages` if lower).
    pub candidate_pool: usize,
    /// Equal-score ordering.
    pub tie_break: TieBreak,
    /// Bound on each store call.
    pub timeout: Duration,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            min_similarity: 0.3,
            candidate_pool: 20,
            tie_break: TieBreak::ChunkId,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Ranks, dedupes and budgets raw candidates.
///
/// `candidates` must be in store order; that order is the final tie-break
/// under [`TieBreak::StoreOrder`].
#[must_use]
pub fn select_passages(
    candidates: Vec<Candidate>,
    max_passages: usize,
    max_tokens: usize,
    min_similarity: f32,
    tie_break: TieBreak,
    doc_filter: Option<&[String]>,
) -> Vec<RetrievalResult> {
    let mut ranked: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| c.score >= min_similarity)
        .filter(|c| doc_filter.is_none_or(|docs| docs.iter().any(|d| d == &c.source_document_id)))
        .collect();

    // sort_by is stable, so StoreOrder falls out of leaving ties alone.
    ranked.sort_by(|a, b| {
        let by_score = b.score.total_cmp(&a.score);
        match tie_break {
            TieBreak::ChunkId => by_score.then_with(|| a.chunk_id.cmp(&b.chunk_id)),
            TieBreak::StoreOrder => by_score,
        }
    });

    let mut seen = HashSet::new();
    let mut remaining = max_tokens;
    let mut selected = Vec::new();

    for candidate in ranked {
        if selected.len() >= max_passages {
            break;
        }
        if !seen.insert(candidate.chunk_id.clone()) {
            continue;
        }
        if candidate.token_count > remaining {
            debug!(
                chunk_id = %candidate.chunk_id,
                tokens = candidate.token_count,
                remaining,
                "passage exceeds remaining budget, skipped"
            );
            continue;
        }
        remaining -= candidate.token_count;
        selected.push(RetrievalResult::new(
            candidate.passage_text,
            candidate.source_document_id,
            candidate.chunk_id,
            candidate.score,
            candidate.token_count,
        ));
    }

    selected
}

/// Retrieval over an [`Embedder`] and a [`VectorStore`].
#[derive(Clone)]
pub struct RetrievalClient {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    policy: RetryPolicy,
    settings: RetrievalSettings,
}

impl std::fmt::Debug for RetrievalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalClient")
            .field("embedder", &self.embedder.model_name())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RetrievalClient {
    /// Creates a client.
    #[must_use]
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        policy: RetryPolicy,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            policy,
            settings,
        }
    }

    /// Returns at most `max_passages` passages whose token counts sum to at
    /// most `max_tokens`, best first. An empty result is a normal outcome.
    ///
    /// # Errors
    ///
    /// - [`RetrievalError::InvalidRequest`] if `max_passages` is zero
    /// - [`RetrievalError::Embedding`] if the query cannot be embedded
    /// - [`RetrievalError::Unavailable`] once store failures exhaust the retry policy
    /// - [`RetrievalError::Cancelled`] if `cancel` fires between store attempts
    pub async fn retrieve(
        &self,
        query: &str,
        max_passages: usize,
        max_tokens: usize,
        doc_filter: Option<&[String]>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        if max_passages == 0 {
            return Err(RetrievalError::InvalidRequest {
                message: "max_passages must be at least 1".to_string(),
            });
        }

        let embedding = self.embedder.embed(query)?;
        let pool = self.settings.candidate_pool.max(max_passages);
        let timeout = self.settings.timeout;

        let candidates = self
            .policy
            .execute("retrieve", cancel, |_| {
                let embedding = &embedding;
                async move {
                    tokio::time::timeout(timeout, self.store.query(embedding, pool, doc_filter))
                        .await
                        .unwrap_or_else(|_| {
                            Err(RetrievalError::Transient {
                                message: format!("store query timed out after {timeout:?}"),
                            })
                        })
                }
            })
            .await
            .map_err(|outcome| match outcome {
                RetryOutcome::Permanent(err) => err,
                RetryOutcome::Exhausted { attempts, last } => RetrievalError::Unavailable {
                    attempts,
                    message: last.to_string(),
                },
                RetryOutcome::Cancelled { .. } => RetrievalError::Cancelled,
            })?;

        let selected = select_passages(
            candidates,
            max_passages,
            max_tokens,
            self.settings.min_similarity,
            self.settings.tie_break,
            doc_filter,
        );
        debug!(
            query_len = query.len(),
            passages = selected.len(),
            tokens = selected.iter().map(RetrievalResult::token_count).sum::<usize>(),
            "retrieval complete"
        );
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn candidate(id: &str, score: f32, tokens: usize) -> Candidate {
        Candidate {
            chunk_id: id.to_string(),
            source_document_id: "kb.md".to_string(),
            passage_text: format!("passage {id}"),
            token_count: tokens,
            score,
        }
    }

    fn ids(results: &[RetrievalResult]) -> Vec<&str> {
        results.iter().map(RetrievalResult::chunk_id).collect()
    }

    #[test]
    fn test_oversized_passage_skipped_not_truncated() {
        let token_counts = [200, 900, 300, 150, 400, 100, 250, 50, 80, 60];
        let candidates: Vec<_> = token_counts
            .iter()
            .enumerate()
            .map(|(i, &t)| {
                #[allow(clippy::cast_precision_loss)]
                let score = 0.95 - (i as f32) * 0.05;
                candidate(&format!("c{i}"), score, t)
            })
            .collect();
        let selected = select_passages(candidates, 3, 500, 0.3, TieBreak::ChunkId, None);
        assert_eq!(ids(&selected), vec!["c0", "c2"]);
        assert_eq!(selected.iter().map(RetrievalResult::token_count).sum::<usize>(), 500);
    }

    #[test]
    fn test_uniform_candidates_stop_at_budget() {
        let candidates: Vec<_> = (0..10)
            .map(|i| {
                #[allow(clippy::cast_precision_loss)]
                let score = 0.9 - (i as f32) * 0.01;
                candidate(&format!("c{i}"), score, 200)
            })
            .collect();
        let selected = select_passages(candidates, 3, 500, 0.3, TieBreak::ChunkId, None);
        assert_eq!(selected.len(), 2);
        assert_eq!(ids(&selected), vec!["c0", "c1"]);
    }

    #[test]
    fn test_skip_continues_scan() {
        let candidates = vec![
            candidate("a", 0.9, 100),
            candidate("b", 0.8, 450),
            candidate("c", 0.7, 50),
        ];
        let selected = select_passages(candidates, 5, 200, 0.0, TieBreak::ChunkId, None);
        assert_eq!(ids(&selected), vec!["a", "c"]);
    }

    #[test]
    fn test_threshold_yields_empty() {
        let candidates = vec![candidate("a", 0.2, 10), candidate("b", 0.1, 10)];
        assert!(select_passages(candidates, 3, 2000, 0.3, TieBreak::ChunkId, None).is_empty());
    }

    #[test]
    fn test_dedupe_keeps_first() {
        let mut dup = candidate("a", 0.5, 10);
        dup.passage_text = "second copy".to_string();
        let candidates = vec![candidate("a", 0.9, 10), dup, candidate("b", 0.6, 10)];
        let selected = select_passages(candidates, 3, 2000, 0.0, TieBreak::ChunkId, None);
        assert_eq!(ids(&selected), vec!["a", "b"]);
        assert_eq!(selected[0].passage_text(), "passage a");
    }

    #[test]
    fn test_tie_break_rules() {
        let candidates = vec![candidate("z", 0.8, 10), candidate("m", 0.8, 10), candidate("a", 0.8, 10)];
        let by_id = select_passages(candidates.clone(), 3, 2000, 0.0, TieBreak::ChunkId, None);
        assert_eq!(ids(&by_id), vec!["a", "m", "z"]);
        let by_store = select_passages(candidates, 3, 2000, 0.0, TieBreak::StoreOrder, None);
        assert_eq!(ids(&by_store), vec!["z", "m", "a"]);
    }

    #[test]
    fn test_doc_filter() {
        let mut other = candidate("x", 0.99, 10);
        other.source_document_id = "other.md".to_string();
        let candidates = vec![other, candidate("a", 0.5, 10)];
        let only = vec!["kb.md".to_string()];
        let selected = select_passages(candidates, 3, 2000, 0.0, TieBreak::ChunkId, Some(&only));
        assert_eq!(ids(&selected), vec!["a"]);
    }

    #[test]
    fn test_tie_break_parse() {
        assert_eq!(TieBreak::parse("store-order"), Some(TieBreak::StoreOrder));
        assert_eq!(TieBreak::parse("CHUNK_ID"), Some(TieBreak::ChunkId));
        assert_eq!(TieBreak::parse("score"), None);
    }

    proptest! {
        #[test]
        fn prop_budget_respected(
            entries in prop::collection::vec((0_u8..40, 0.0_f32..1.0, 0_usize..800), 0..40),
            max_passages in 1_usize..8,
            max_tokens in 0_usize..3000,
        ) {
            let candidates: Vec<_> = entries
                .iter()
                .map(|(id, score, tokens)| candidate(&format!("c{id}"), *score, *tokens))
                .collect();
            let selected = select_passages(candidates, max_passages, max_tokens, 0.3, TieBreak::ChunkId, None);

            prop_assert!(selected.len() <= max_passages);
            prop_assert!(selected.iter().map(RetrievalResult::token_count).sum::<usize>() <= max_tokens);
            let unique: HashSet<_> = selected.iter().map(RetrievalResult::chunk_id).collect();
            prop_assert_eq!(unique.len(), selected.len());
            prop_assert!(selected.iter().all(|r| r.similarity_score() >= 0.3));
            prop_assert!(selected.windows(2).all(|w| w[0].similarity_score() >= w[1].similarity_score()));
        }
    }
}
