//! Knowledge-base ingestion: split documents into word windows, embed, store.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};
use unicode_segmentation::UnicodeSegmentation;

use super::embedding::Embedder;
use super::store::{ChunkRecord, SqliteVectorStore};
use crate::error::RetrievalError;

/// Words per chunk.
pub const CHUNK_WORDS: usize = 300;

/// File extensions read as plain text.
const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "text"];

/// Estimates the token cost of `text` (about four tokens per three words).
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    (text.unicode_words().count() * 4).div_ceil(3)
}

/// Splits `text` into windows of `words_per_chunk` whitespace-separated words.
#[must_use]
pub fn chunk_words(text: &str, words_per_chunk: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    words
        .chunks(words_per_chunk.max(1))
        .map(|window| window.join(" "))
        .collect()
}

/// Outcome of ingesting one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestedDocument {
    /// Document id (file name).
    pub document_id: String,
    /// Chunks stored.
    pub chunks: usize,
}

/// Outcome of an ingest command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Documents stored.
    pub documents: Vec<IngestedDocument>,
    /// Paths skipped (unsupported or empty).
    pub skipped: Vec<PathBuf>,
}

/// Ingests `text` as `document_id`, replacing any chunks it had before.
///
/// # Errors
///
/// Returns [`RetrievalError`] if embedding or the store write fails.
pub fn ingest_text(
    store: &SqliteVectorStore,
    embedder: &dyn Embedder,
    document_id: &str,
    text: &str,
) -> Result<usize, RetrievalError> {
    let records = chunk_words(text, CHUNK_WORDS)
        .into_iter()
        .enumerate()
        .map(|(n, passage_text)| -> Result<ChunkRecord, RetrievalError> {
            Ok(ChunkRecord {
                chunk_id: format!("{document_id}#{n}"),
                source_document_id: document_id.to_string(),
                token_count: estimate_tokens(&passage_text),
                model: embedder.model_name().to_string(),
                embedding: embedder.embed(&passage_text)?,
                passage_text,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    store.replace_document(document_id, &records)
}

/// Ingests files, descending one level into directories.
///
/// # Errors
///
/// Returns [`RetrievalError`] on store or embedding failure. Unreadable or
/// unsupported files are skipped and reported.
pub fn ingest_paths(
    store: &SqliteVectorStore,
    embedder: &dyn Embedder,
    paths: &[PathBuf],
) -> Result<IngestReport, RetrievalError> {
    let mut report = IngestReport::default();

    for path in expand(paths) {
        let supported = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| TEXT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if !supported {
            warn!(path = %path.display(), "unsupported format skipped");
            report.skipped.push(path);
            continue;
        }

        let text = match std::fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                warn!(path = %path.display(), "empty file skipped");
                report.skipped.push(path);
                continue;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable file skipped");
                report.skipped.push(path);
                continue;
            }
        };

        let document_id = document_id(&path);
        let chunks = ingest_text(store, embedder, &document_id, &text)?;
        info!(document = %document_id, chunks, "ingested");
        report.documents.push(IngestedDocument {
            document_id,
            chunks,
        });
    }

    Ok(report)
}

fn document_id(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

fn expand(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(path)
                .map(|rd| rd.filter_map(Result::ok).map(|e| e.path()).filter(|p| p.is_file()).collect())
                .unwrap_or_default();
            entries.sort();
            files.extend(entries);
        } else {
            files.push(path.clone());
        }
    }
    files
}
