//! Query and passage embedding.
//!
//! The default [`HashEmbedder`] is a deterministic feature-hashing model with
//! no external assets. With the `fastembed-embeddings` feature,
//! [`create_embedder`] returns an ONNX sentence-embedding model instead.

use unicode_segmentation::UnicodeSegmentation;

use crate::error::RetrievalError;

/// Dimensions of the hash embedder.
pub const HASH_DIMENSIONS: usize = 384;

/// Turns text into a fixed-size vector.
pub trait Embedder: Send + Sync {
    /// Identifier persisted with stored vectors.
    fn model_name(&self) -> &str;

    /// Output dimensionality.
    fn dimensions(&self) -> usize;

    /// Embeds one text.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Embedding`] if the model fails.
    fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError>;
}

/// Creates the configured embedder.
///
/// # Errors
///
/// Returns [`RetrievalError::Embedding`] if the model cannot be initialized.
pub fn create_embedder() -> Result<Box<dyn Embedder>, RetrievalError> {
    #[cfg(feature = "fastembed-embeddings")]
    {
        Ok(Box::new(FastEmbedder::new()?))
    }
    #[cfg(not(feature = "fastembed-embeddings"))]
    {
        Ok(Box::new(HashEmbedder::new(HASH_DIMENSIONS)))
    }
}

/// Feature-hashing embedder over lowercased word unigrams and bigrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    /// Creates an embedder producing `dimensions`-sized vectors.
    #[must_use]
    pub const fn new(dimensions: usize) -> Self {
        Self {
            dimensions: if dimensions == 0 { 1 } else { dimensions },
        }
    }

    // FNV-1a: stable across builds, so stored vectors stay comparable.
    fn hash(feature: &str) -> u64 {
        feature.bytes().fold(0xcbf2_9ce4_8422_2325, |h, b| {
            (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
        })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let h = Self::hash(feature);
        let index = (h % self.dimensions as u64) as usize;
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign * weight;
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(HASH_DIMENSIONS)
    }
}

impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-fnv1a"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let words: Vec<String> = text.unicode_words().map(str::to_lowercase).collect();
        let mut vector = vec![0.0_f32; self.dimensions];

        for word in &words {
            self.add(&mut vector, word, 1.0);
        }
        for pair in words.windows(2) {
            self.add(&mut vector, &format!("{} {}", pair[0], pair[1]), 0.5);
        }

        normalize(&mut vector);
        Ok(vector)
    }
}

/// Scales `vector` to unit length (zero vectors are left as-is).
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Cosine similarity; `0.0` when either vector is zero or lengths differ.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// ONNX sentence embeddings via `fastembed` (all-MiniLM-L6-v2).
#[cfg(feature = "fastembed-embeddings")]
pub struct FastEmbedder {
    model: std::sync::Mutex<fastembed::TextEmbedding>,
}

#[cfg(feature = "fastembed-embeddings")]
impl FastEmbedder {
    /// Loads the model, downloading it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Embedding`] if the model cannot be loaded.
    pub fn new() -> Result<Self, RetrievalError> {
        let model = fastembed::TextEmbedding::try_new(fastembed::InitOptions::new(
            fastembed::EmbeddingModel::AllMiniLML6V2,
        ))
        .map_err(|e| RetrievalError::Embedding {
            message: e.to_string(),
        })?;
        Ok(Self {
            model: std::sync::Mutex::new(model),
        })
    }
}

#[cfg(feature = "fastembed-embeddings")]
impl Embedder for FastEmbedder {
    fn model_name(&self) -> &str {
        "all-MiniLM-L6-v2"
    }

    fn dimensions(&self) -> usize {
        384
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let mut model = self.model.lock().map_err(|_| RetrievalError::Embedding {
            message: "embedding model lock poisoned".to_string(),
        })?;
        model
            .embed(vec![text], None)
            .map_err(|e| RetrievalError::Embedding {
                message: e.to_string(),
            })?
            .into_iter()
            .next()
            .ok_or_else(|| RetrievalError::Embedding {
                message: "model returned no vector".to_string(),
            })
    }
}
