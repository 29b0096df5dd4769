//! SQLite-backed checkpoint log.
//!
//! Headers live in `runs`; section states are appended to
//! `checkpoint_records`, whose `AUTOINCREMENT` key is the write sequence.
//! The database runs in WAL mode with `synchronous = FULL`, so a record is
//! on disk before [`CheckpointStore::append`] returns.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::{CheckpointRecord, CheckpointStore};
use crate::core::{ProviderConfig, RetrievalProfile, RunHeader, SectionState, SectionStatus, Verdict};
use crate::error::CheckpointError;

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    input_document_ref TEXT NOT NULL,
    sections TEXT NOT NULL,
    provider_config TEXT NOT NULL,
    created_at TEXT NOT NULL,
    completed_at TEXT,
    abandoned_at TEXT,
    retrieval TEXT
);
CREATE TABLE IF NOT EXISTS checkpoint_records (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    section_id TEXT NOT NULL,
    status TEXT NOT NULL,
    generated_text TEXT,
    verdict TEXT,
    justification TEXT,
    low_confidence INTEGER NOT NULL DEFAULT 0,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    retrieved_passages TEXT NOT NULL,
    written_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_records_run_section ON checkpoint_records(run_id, section_id);
";

/// Durable [`CheckpointStore`] on a single `SQLite` file.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCheckpointStore").finish_non_exhaustive()
    }
}

fn write_err(err: impl std::fmt::Display) -> CheckpointError {
    CheckpointError::WriteFailure {
        message: err.to_string(),
    }
}

fn read_err(err: impl std::fmt::Display) -> CheckpointError {
    CheckpointError::Read {
        message: err.to_string(),
    }
}

impl SqliteCheckpointStore {
    /// Opens (creating if needed) the log at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::WriteFailure`] if the file or schema
    /// cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let conn = Connection::open(path).map_err(write_err)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")
            .map_err(write_err)?;
        Self::from_connection(conn)
    }

    /// Opens a log that lives only as long as the store.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::WriteFailure`] if `SQLite` fails to initialize.
    pub fn in_memory() -> Result<Self, CheckpointError> {
        Self::from_connection(Connection::open_in_memory().map_err(write_err)?)
    }

    fn from_connection(conn: Connection) -> Result<Self, CheckpointError> {
        conn.execute_batch(SCHEMA_SQL).map_err(write_err)?;
        Self::add_retrieval_column(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Databases written before the retrieval profile was stored lack the
    /// column; their runs decode with the default profile.
    fn add_retrieval_column(conn: &Connection) -> Result<(), CheckpointError> {
        let mut stmt = conn.prepare("PRAGMA table_info(runs)").map_err(write_err)?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(write_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(write_err)?;
        if !columns.iter().any(|c| c == "retrieval") {
            conn.execute("ALTER TABLE runs ADD COLUMN retrieval TEXT", [])
                .map_err(write_err)?;
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, CheckpointError> {
        self.conn.lock().map_err(|_| CheckpointError::Read {
            message: "checkpoint connection lock poisoned".to_string(),
        })
    }

    fn set_marker(&self, run_id: &str, column: &str, at: Option<DateTime<Utc>>) -> Result<(), CheckpointError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                &format!("UPDATE runs SET {column} = ?1 WHERE run_id = ?2"),
                params![at.map(|t| t.to_rfc3339()), run_id],
            )
            .map_err(write_err)?;
        if changed == 0 {
            return Err(CheckpointError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }
        Ok(())
    }
}

struct RawHeader {
    run_id: String,
    input_document_ref: String,
    sections: String,
    provider_config: String,
    created_at: String,
    completed_at: Option<String>,
    abandoned_at: Option<String>,
    retrieval: Option<String>,
}

impl RawHeader {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            input_document_ref: row.get(1)?,
            sections: row.get(2)?,
            provider_config: row.get(3)?,
            created_at: row.get(4)?,
            completed_at: row.get(5)?,
            abandoned_at: row.get(6)?,
            retrieval: row.get(7)?,
        })
    }

    fn decode(self) -> Result<RunHeader, CheckpointError> {
        let corrupt = |message: String| CheckpointError::Read {
            message: format!("run {}: {message}", self.run_id),
        };
        Ok(RunHeader {
            sections: serde_json::from_str(&self.sections).map_err(|e| corrupt(e.to_string()))?,
            provider_config: serde_json::from_str(&self.provider_config)
                .map_err(|e| corrupt(e.to_string()))?,
            retrieval: match self.retrieval.as_deref() {
                Some(json) => serde_json::from_str(json).map_err(|e| corrupt(e.to_string()))?,
                None => RetrievalProfile::default(),
            },
            created_at: parse_time(&self.created_at).map_err(&corrupt)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_time)
                .transpose()
                .map_err(&corrupt)?,
            abandoned_at: self
                .abandoned_at
                .as_deref()
                .map(parse_time)
                .transpose()
                .map_err(&corrupt)?,
            input_document_ref: self.input_document_ref.clone(),
            run_id: self.run_id.clone(),
        })
    }
}

struct RawRecord {
    seq: i64,
    run_id: String,
    section_id: String,
    status: String,
    generated_text: Option<String>,
    verdict: Option<String>,
    justification: Option<String>,
    low_confidence: bool,
    attempt_count: u32,
    last_error: Option<String>,
    retrieved_passages: String,
    written_at: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            run_id: row.get(1)?,
            section_id: row.get(2)?,
            status: row.get(3)?,
            generated_text: row.get(4)?,
            verdict: row.get(5)?,
            justification: row.get(6)?,
            low_confidence: row.get(7)?,
            attempt_count: row.get(8)?,
            last_error: row.get(9)?,
            retrieved_passages: row.get(10)?,
            written_at: row.get(11)?,
        })
    }

    fn decode(self) -> Result<CheckpointRecord, CheckpointError> {
        let seq = self.seq;
        let corrupt = |message: String| CheckpointError::Corrupt { seq, message };

        let status = SectionStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("unknown status '{}'", self.status)))?;
        let verdict = match self.verdict.as_deref() {
            Some(v) => Some(Verdict::parse(v).ok_or_else(|| corrupt(format!("unknown verdict '{v}'")))?),
            None => None,
        };
        let retrieved_passages =
            serde_json::from_str(&self.retrieved_passages).map_err(|e| corrupt(e.to_string()))?;
        let written_at = parse_time(&self.written_at).map_err(corrupt)?;

        Ok(CheckpointRecord {
            run_id: self.run_id,
            section_id: self.section_id,
            seq,
            state: SectionState {
                status,
                retrieved_passages,
                generated_text: self.generated_text,
                verdict,
                justification: self.justification,
                low_confidence: self.low_confidence,
                attempt_count: self.attempt_count,
                last_error: self.last_error,
            },
            written_at,
        })
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{s}': {e}"))
}

const HEADER_COLUMNS: &str =
    "run_id, input_document_ref, sections, provider_config, created_at, completed_at, abandoned_at, retrieval";

impl CheckpointStore for SqliteCheckpointStore {
    fn create_run(&self, header: &RunHeader) -> Result<(), CheckpointError> {
        let sections = serde_json::to_string(&header.sections).map_err(write_err)?;
        let provider = serde_json::to_string(&header.provider_config).map_err(write_err)?;
        let retrieval = serde_json::to_string(&header.retrieval).map_err(write_err)?;
        let conn = self.lock()?;
        conn.execute(
            &format!("INSERT INTO runs ({HEADER_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                header.run_id,
                header.input_document_ref,
                sections,
                provider,
                header.created_at.to_rfc3339(),
                header.completed_at.map(|t| t.to_rfc3339()),
                header.abandoned_at.map(|t| t.to_rfc3339()),
                retrieval,
            ],
        )
        .map_err(write_err)?;
        Ok(())
    }

    fn append(&self, run_id: &str, section_id: &str, state: &SectionState) -> Result<i64, CheckpointError> {
        let passages = serde_json::to_string(&state.retrieved_passages).map_err(write_err)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(write_err)?;
        tx.execute(
            "INSERT INTO checkpoint_records (
                run_id, section_id, status, generated_text, verdict, justification,
                low_confidence, attempt_count, last_error, retrieved_passages, written_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run_id,
                section_id,
                state.status.as_str(),
                state.generated_text,
                state.verdict.map(|v| v.as_str()),
                state.justification,
                state.low_confidence,
                state.attempt_count,
                state.last_error,
                passages,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(write_err)?;
        let seq = tx.last_insert_rowid();
        tx.commit().map_err(write_err)?;
        Ok(seq)
    }

    fn load_header(&self, run_id: &str) -> Result<RunHeader, CheckpointError> {
        let raw = {
            let conn = self.lock()?;
            conn.query_row(
                &format!("SELECT {HEADER_COLUMNS} FROM runs WHERE run_id = ?1"),
                params![run_id],
                RawHeader::from_row,
            )
            .optional()
            .map_err(read_err)?
        };
        raw.ok_or_else(|| CheckpointError::RunNotFound {
            run_id: run_id.to_string(),
        })?
        .decode()
    }

    fn list_runs(&self) -> Result<Vec<RunHeader>, CheckpointError> {
        let raws = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {HEADER_COLUMNS} FROM runs ORDER BY created_at DESC, run_id ASC"
                ))
                .map_err(read_err)?;
            stmt.query_map([], RawHeader::from_row)
                .map_err(read_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(read_err)?
        };
        raws.into_iter().map(RawHeader::decode).collect()
    }

    fn records(&self, run_id: &str) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        let raws = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT seq, run_id, section_id, status, generated_text, verdict, justification,
                            low_confidence, attempt_count, last_error, retrieved_passages, written_at
                     FROM checkpoint_records WHERE run_id = ?1 ORDER BY seq ASC",
                )
                .map_err(read_err)?;
            stmt.query_map(params![run_id], RawRecord::from_row)
                .map_err(read_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(read_err)?
        };
        raws.into_iter().map(RawRecord::decode).collect()
    }

    fn update_provider(&self, run_id: &str, provider: &ProviderConfig) -> Result<(), CheckpointError> {
        let json = serde_json::to_string(provider).map_err(write_err)?;
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE runs SET provider_config = ?1 WHERE run_id = ?2",
                params![json, run_id],
            )
            .map_err(write_err)?;
        if changed == 0 {
            return Err(CheckpointError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }
        Ok(())
    }

    fn mark_completed(&self, run_id: &str, at: DateTime<Utc>) -> Result<(), CheckpointError> {
        self.set_marker(run_id, "completed_at", Some(at))
    }

    fn mark_reopened(&self, run_id: &str) -> Result<(), CheckpointError> {
        self.set_marker(run_id, "completed_at", None)
    }

    fn mark_abandoned(&self, run_id: &str, at: DateTime<Utc>) -> Result<(), CheckpointError> {
        self.set_marker(run_id, "abandoned_at", Some(at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ProviderKind, RetrievalResult, SectionDef, SectionKind};

    fn header() -> RunHeader {
        RunHeader::new(
            "questions.json",
            vec![
                SectionDef::new("q1", 0, SectionKind::Compliance, "Supports SSO"),
                SectionDef::new("q2", 1, SectionKind::Narrative, "Describe onboarding"),
            ],
            ProviderConfig::new(ProviderKind::Local).with_compliance_model("phi3:mini"),
        )
        .with_retrieval(RetrievalProfile {
            compliance_top_k: 2,
            doc_filter: Some(vec!["sso.md".to_string()]),
            ..RetrievalProfile::default()
        })
    }

    fn done_state() -> SectionState {
        SectionState {
            status: SectionStatus::Done,
            retrieved_passages: vec![RetrievalResult::new("SAML 2.0 supported", "sso.md", "sso.md#0", 0.91, 4)],
            generated_text: Some("YES\nSAML 2.0 is supported.".to_string()),
            verdict: Some(Verdict::Yes),
            justification: Some("SAML 2.0 is supported.".to_string()),
            low_confidence: false,
            attempt_count: 1,
            last_error: None,
        }
    }

    #[test]
    fn test_append_and_replay_round_trip() {
        let store = SqliteCheckpointStore::in_memory().unwrap_or_else(|_| unreachable!());
        let header = header();
        store.create_run(&header).unwrap_or_else(|_| unreachable!());

        let first = store
            .append(&header.run_id, "q1", &SectionState::default())
            .unwrap_or_else(|_| unreachable!());
        let second = store
            .append(&header.run_id, "q1", &done_state())
            .unwrap_or_else(|_| unreachable!());
        assert!(second > first);

        let run = store.replay(&header.run_id).unwrap_or_else(|_| unreachable!());
        assert_eq!(run.header, header);
        assert_eq!(run.checkpoint_cursor, second);
        assert_eq!(run.sections[0].state(), &done_state());
        assert_eq!(run.sections[1].status(), SectionStatus::Pending);
    }

    #[test]
    fn test_unknown_run() {
        let store = SqliteCheckpointStore::in_memory().unwrap_or_else(|_| unreachable!());
        assert!(matches!(
            store.load_header("nope"),
            Err(CheckpointError::RunNotFound { .. })
        ));
        assert!(matches!(
            store.mark_completed("nope", Utc::now()),
            Err(CheckpointError::RunNotFound { .. })
        ));
    }

    #[test]
    fn test_markers_and_provider_update() {
        let store = SqliteCheckpointStore::in_memory().unwrap_or_else(|_| unreachable!());
        let header = header();
        store.create_run(&header).unwrap_or_else(|_| unreachable!());

        let cloud = ProviderConfig::new(ProviderKind::Cloud);
        store
            .update_provider(&header.run_id, &cloud)
            .unwrap_or_else(|_| unreachable!());
        store
            .mark_completed(&header.run_id, Utc::now())
            .unwrap_or_else(|_| unreachable!());

        let loaded = store.load_header(&header.run_id).unwrap_or_else(|_| unreachable!());
        assert_eq!(loaded.provider_config, cloud);
        assert_eq!(loaded.lifecycle(), "completed");
        assert_eq!(store.list_runs().unwrap_or_default().len(), 1);

        store.mark_reopened(&header.run_id).unwrap_or_else(|_| unreachable!());
        let loaded = store.load_header(&header.run_id).unwrap_or_else(|_| unreachable!());
        assert_eq!(loaded.completed_at, None);
        assert_eq!(loaded.lifecycle(), "in-progress");
    }

    #[test]
    fn test_legacy_database_gains_retrieval_column() {
        let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
        let path = dir.path().join("old.db");
        {
            let conn = Connection::open(&path).unwrap_or_else(|_| unreachable!());
            conn.execute_batch(
                "CREATE TABLE runs (
                    run_id TEXT PRIMARY KEY,
                    input_document_ref TEXT NOT NULL,
                    sections TEXT NOT NULL,
                    provider_config TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    completed_at TEXT,
                    abandoned_at TEXT
                );
                INSERT INTO runs VALUES (
                    'r1', 'rfp.csv', '[]', '{\"kind\":\"local\",\"model\":\"llama3\",\"temperature\":0.3,\"max_output_tokens\":900}',
                    '2026-01-05T10:00:00+00:00', NULL, NULL
                );",
            )
            .unwrap_or_else(|_| unreachable!());
        }

        let store = SqliteCheckpointStore::open(&path).unwrap_or_else(|_| unreachable!());
        let loaded = store.load_header("r1").unwrap_or_else(|_| unreachable!());
        assert_eq!(loaded.retrieval, RetrievalProfile::default());
        assert_eq!(loaded.provider_config.compliance_model, None);
    }

    #[test]
    fn test_corrupt_record_reports_seq() {
        let store = SqliteCheckpointStore::in_memory().unwrap_or_else(|_| unreachable!());
        let header = header();
        store.create_run(&header).unwrap_or_else(|_| unreachable!());
        let seq = store
            .append(&header.run_id, "q1", &SectionState::default())
            .unwrap_or_else(|_| unreachable!());
        {
            let conn = store.lock().unwrap_or_else(|_| unreachable!());
            conn.execute("UPDATE checkpoint_records SET status = 'exploded'", [])
                .unwrap_or_else(|_| unreachable!());
        }
        match store.replay(&header.run_id) {
            Err(CheckpointError::Corrupt { seq: bad, .. }) => assert_eq!(bad, seq),
            other => unreachable!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
        let path = dir.path().join("state").join("checkpoints.db");
        let header = header();
        {
            let store = SqliteCheckpointStore::open(&path).unwrap_or_else(|_| unreachable!());
            store.create_run(&header).unwrap_or_else(|_| unreachable!());
            store
                .append(&header.run_id, "q2", &SectionState::default())
                .unwrap_or_else(|_| unreachable!());
        }
        let store = SqliteCheckpointStore::open(&path).unwrap_or_else(|_| unreachable!());
        assert_eq!(store.records(&header.run_id).unwrap_or_default().len(), 1);
    }
}
