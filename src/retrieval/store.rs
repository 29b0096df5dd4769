//! Vector similarity store interface and its SQLite implementation.
//!
//! [`SqliteVectorStore`] keeps one row per chunk with its embedding as a
//! little-endian `f32` blob and answers queries by brute-force cosine
//! similarity. Candidates come back in descending score order; equal scores
//! keep insertion order.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use super::embedding::cosine_similarity;
use crate::error::RetrievalError;

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS chunks (
    ordinal INTEGER PRIMARY KEY AUTOINCREMENT,
    chunk_id TEXT NOT NULL UNIQUE,
    source_document_id TEXT NOT NULL,
    passage_text TEXT NOT NULL,
    token_count INTEGER NOT NULL,
    model TEXT NOT NULL,
    dimension INTEGER NOT NULL,
    embedding BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(source_document_id);
";

/// A chunk to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    /// Store-unique identifier.
    pub chunk_id: String,
    /// Document the chunk came from.
    pub source_document_id: String,
    /// Chunk text.
    pub passage_text: String,
    /// Estimated token cost.
    pub token_count: usize,
    /// Embedding model name.
    pub model: String,
    /// Embedding vector.
    pub embedding: Vec<f32>,
}

/// A ranked query hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Store-unique identifier.
    pub chunk_id: String,
    /// Document the chunk came from.
    pub source_document_id: String,
    /// Chunk text.
    pub passage_text: String,
    /// Estimated token cost.
    pub token_count: usize,
    /// Similarity to the query.
    pub score: f32,
}

/// Chunk and document counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Stored chunks.
    pub chunks: usize,
    /// Distinct source documents.
    pub documents: usize,
}

/// A vector similarity store.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Inserts or replaces a chunk by `chunk_id`.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError`] if the write fails.
    async fn upsert(&self, chunk: ChunkRecord) -> Result<(), RetrievalError>;

    /// Returns up to `k` candidates ranked by descending similarity,
    /// restricted to `filter` documents when given.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Transient`] if the store cannot be read.
    async fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: Option<&[String]>,
    ) -> Result<Vec<Candidate>, RetrievalError>;
}

/// SQLite-backed [`VectorStore`].
#[derive(Clone)]
pub struct SqliteVectorStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteVectorStore").finish_non_exhaustive()
    }
}

impl SqliteVectorStore {
    /// Opens (creating if needed) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Transient`] if the database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RetrievalError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| RetrievalError::Transient {
                message: format!("cannot create {}: {e}", parent.display()),
            })?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens an in-memory store.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Transient`] if `SQLite` fails to initialize.
    pub fn in_memory() -> Result<Self, RetrievalError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, RetrievalError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(conn: &Mutex<Connection>) -> Result<std::sync::MutexGuard<'_, Connection>, RetrievalError> {
        conn.lock().map_err(|_| RetrievalError::Transient {
            message: "vector store lock poisoned".to_string(),
        })
    }

    /// Replaces every chunk of `document_id` with `chunks` in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError`] if the transaction fails.
    pub fn replace_document(
        &self,
        document_id: &str,
        chunks: &[ChunkRecord],
    ) -> Result<usize, RetrievalError> {
        let mut conn = Self::lock(&self.conn)?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM chunks WHERE source_document_id = ?1",
            params![document_id],
        )?;
        for chunk in chunks {
            insert_chunk(&tx, chunk)?;
        }
        tx.commit()?;
        Ok(chunks.len())
    }

    /// Counts stored chunks and documents.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError`] if the query fails.
    pub fn stats(&self) -> Result<StoreStats, RetrievalError> {
        let conn = Self::lock(&self.conn)?;
        let (chunks, documents): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT source_document_id) FROM chunks",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(StoreStats {
            chunks: usize::try_from(chunks).unwrap_or(0),
            documents: usize::try_from(documents).unwrap_or(0),
        })
    }

    fn query_blocking(
        conn: &Mutex<Connection>,
        embedding: &[f32],
        k: usize,
        filter: Option<&[String]>,
    ) -> Result<Vec<Candidate>, RetrievalError> {
        let conn = Self::lock(conn)?;
        let mut stmt = conn.prepare(
            "SELECT chunk_id, source_document_id, passage_text, token_count, embedding
             FROM chunks ORDER BY ordinal",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Vec<u8>>(4)?,
            ))
        })?;

        let mut candidates = Vec::new();
        for row in rows {
            let (chunk_id, source_document_id, passage_text, token_count, blob) = row?;
            if let Some(docs) = filter
                && !docs.iter().any(|d| d == &source_document_id)
            {
                continue;
            }
            let stored = decode_embedding(&blob);
            candidates.push(Candidate {
                chunk_id,
                source_document_id,
                passage_text,
                token_count: usize::try_from(token_count).unwrap_or(usize::MAX),
                score: cosine_similarity(embedding, &stored),
            });
        }

        // Stable: equal scores keep insertion order.
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates.truncate(k);
        Ok(candidates)
    }
}

fn insert_chunk(conn: &Connection, chunk: &ChunkRecord) -> Result<(), RetrievalError> {
    conn.execute(
        "INSERT INTO chunks (chunk_id, source_document_id, passage_text, token_count, model, dimension, embedding)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(chunk_id) DO UPDATE SET
             source_document_id = excluded.source_document_id,
             passage_text = excluded.passage_text,
             token_count = excluded.token_count,
             model = excluded.model,
             dimension = excluded.dimension,
             embedding = excluded.embedding",
        params![
            chunk.chunk_id,
            chunk.source_document_id,
            chunk.passage_text,
            i64::try_from(chunk.token_count).unwrap_or(i64::MAX),
            chunk.model,
            i64::try_from(chunk.embedding.len()).unwrap_or(i64::MAX),
            encode_embedding(&chunk.embedding),
        ],
    )?;
    Ok(())
}

fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(vector));
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .map(|v| if v.is_finite() { v } else { 0.0 })
        .collect()
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert(&self, chunk: ChunkRecord) -> Result<(), RetrievalError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || insert_chunk(&*Self::lock(&conn)?, &chunk))
            .await
            .map_err(|e| RetrievalError::Transient {
                message: format!("store task failed: {e}"),
            })?
    }

    async fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: Option<&[String]>,
    ) -> Result<Vec<Candidate>, RetrievalError> {
        let conn = Arc::clone(&self.conn);
        let embedding = embedding.to_vec();
        let filter = filter.map(<[String]>::to_vec);
        tokio::task::spawn_blocking(move || {
            Self::query_blocking(&conn, &embedding, k, filter.as_deref())
        })
        .await
        .map_err(|e| RetrievalError::Transient {
            message: format!("store task failed: {e}"),
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, doc: &str, embedding: Vec<f32>) -> ChunkRecord {
        ChunkRecord {
            chunk_id: id.to_string(),
            source_document_id: doc.to_string(),
            passage_text: format!("text of {id}"),
            token_count: 10,
            model: "test".to_string(),
            embedding,
        }
    }

    #[tokio::test]
    async fn test_query_ranks_by_similarity() {
        let store = SqliteVectorStore::in_memory().unwrap_or_else(|_| unreachable!());
        assert!(store.upsert(chunk("a", "d1", vec![1.0, 0.0])).await.is_ok());
        assert!(store.upsert(chunk("b", "d1", vec![0.6, 0.8])).await.is_ok());
        assert!(store.upsert(chunk("c", "d2", vec![0.0, 1.0])).await.is_ok());

        let hits = store.query(&[1.0, 0.0], 2, None).await.unwrap_or_default();
        let ids: Vec<_> = hits.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!((hits[0].score - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_query_filter_and_store_order_ties() {
        let store = SqliteVectorStore::in_memory().unwrap_or_else(|_| unreachable!());
        assert!(store.upsert(chunk("z", "d1", vec![1.0, 0.0])).await.is_ok());
        assert!(store.upsert(chunk("y", "d2", vec![1.0, 0.0])).await.is_ok());
        assert!(store.upsert(chunk("x", "d2", vec![1.0, 0.0])).await.is_ok());

        let hits = store.query(&[1.0, 0.0], 10, None).await.unwrap_or_default();
        let ids: Vec<_> = hits.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["z", "y", "x"]);

        let only = vec!["d2".to_string()];
        let hits = store.query(&[1.0, 0.0], 10, Some(&only)).await.unwrap_or_default();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|c| c.source_document_id == "d2"));
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_stats() {
        let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
        let store = SqliteVectorStore::open(dir.path().join("kb/knowledge.db"))
            .unwrap_or_else(|_| unreachable!());
        assert!(store.upsert(chunk("a", "d1", vec![1.0])).await.is_ok());
        assert!(store.upsert(chunk("a", "d1", vec![1.0])).await.is_ok());
        assert!(store.upsert(chunk("b", "d2", vec![1.0])).await.is_ok());
        let stats = store.stats().unwrap_or_default();
        assert_eq!(stats, StoreStats { chunks: 2, documents: 2 });

        let replaced = store
            .replace_document("d1", &[chunk("d1#0", "d1", vec![1.0]), chunk("d1#1", "d1", vec![1.0])])
            .unwrap_or_default();
        assert_eq!(replaced, 2);
        assert_eq!(store.stats().unwrap_or_default().chunks, 3);
    }

    #[test]
    fn test_embedding_blob_round_trip() {
        let v = vec![0.25, -1.5, 3.0];
        assert_eq!(decode_embedding(&encode_embedding(&v)), v);
    }
}
