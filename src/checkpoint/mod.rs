//! Durable progress log for runs.
//!
//! A run is a header plus an append-only sequence of [`CheckpointRecord`]s,
//! one per section state change. Replaying a run's records in `seq` order
//! and keeping the last one per section reproduces every section exactly
//! as it was committed.

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::core::{ProviderConfig, Run, RunHeader, Section, SectionOutput, SectionState};
use crate::error::CheckpointError;

pub use memory::MemoryCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

/// One committed section state.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    /// Owning run.
    pub run_id: String,
    /// Section the state belongs to.
    pub section_id: String,
    /// Global write order assigned by the store.
    pub seq: i64,
    /// Committed state.
    pub state: SectionState,
    /// Commit time.
    pub written_at: DateTime<Utc>,
}

/// Storage for run headers and checkpoint records.
///
/// Implementations serialize writers internally; every method may be
/// called concurrently.
pub trait CheckpointStore: Send + Sync {
    /// Persists a new run header.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::WriteFailure`] if the header cannot be stored.
    fn create_run(&self, header: &RunHeader) -> Result<(), CheckpointError>;

    /// Appends a section state; returns its assigned `seq`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::WriteFailure`] if the record is not durable.
    fn append(&self, run_id: &str, section_id: &str, state: &SectionState) -> Result<i64, CheckpointError>;

    /// Loads a run header.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::RunNotFound`] for unknown runs.
    fn load_header(&self, run_id: &str) -> Result<RunHeader, CheckpointError>;

    /// All headers, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Read`] on storage failure.
    fn list_runs(&self) -> Result<Vec<RunHeader>, CheckpointError>;

    /// A run's records in ascending `seq` order.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Read`] or [`CheckpointError::Corrupt`].
    fn records(&self, run_id: &str) -> Result<Vec<CheckpointRecord>, CheckpointError>;

    /// Replaces the run's provider configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::WriteFailure`] or [`CheckpointError::RunNotFound`].
    fn update_provider(&self, run_id: &str, provider: &ProviderConfig) -> Result<(), CheckpointError>;

    /// Writes the terminal marker.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::WriteFailure`] or [`CheckpointError::RunNotFound`].
    fn mark_completed(&self, run_id: &str, at: DateTime<Utc>) -> Result<(), CheckpointError>;

    /// Clears the terminal marker after sections were reset for another attempt.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::WriteFailure`] or [`CheckpointError::RunNotFound`].
    fn mark_reopened(&self, run_id: &str) -> Result<(), CheckpointError>;

    /// Records an operator abandonment.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::WriteFailure`] or [`CheckpointError::RunNotFound`].
    fn mark_abandoned(&self, run_id: &str, at: DateTime<Utc>) -> Result<(), CheckpointError>;

    /// Rebuilds a run from its header and records.
    ///
    /// # Errors
    ///
    /// Propagates read failures.
    fn replay(&self, run_id: &str) -> Result<Run, CheckpointError> {
        let header = self.load_header(run_id)?;
        let records = self.records(run_id)?;
        Ok(rebuild(header, records))
    }
}

/// Replays `run_id` and returns its sections in input order.
///
/// # Errors
///
/// Propagates replay failures.
pub fn assemble(store: &dyn CheckpointStore, run_id: &str) -> Result<Vec<SectionOutput>, CheckpointError> {
    let run = store.replay(run_id)?;
    let mut outputs: Vec<SectionOutput> = run.sections.iter().map(SectionOutput::from).collect();
    outputs.sort_by_key(|o| o.position);
    Ok(outputs)
}

/// Marks `run_id` abandoned so it can no longer be resumed.
///
/// # Errors
///
/// Returns [`CheckpointError::RunNotFound`] for unknown runs or a write failure.
pub fn abandon(store: &dyn CheckpointStore, run_id: &str) -> Result<(), CheckpointError> {
    store.mark_abandoned(run_id, Utc::now())?;
    info!(run_id, "run abandoned");
    Ok(())
}

/// Folds records onto a header with last-write-wins per section.
#[must_use]
pub fn rebuild(header: RunHeader, records: Vec<CheckpointRecord>) -> Run {
    let mut cursor = 0;
    let mut latest: HashMap<String, SectionState> = HashMap::new();

    for record in records {
        cursor = cursor.max(record.seq);
        if header.sections.iter().all(|d| d.id != record.section_id) {
            warn!(
                run_id = %header.run_id,
                section_id = %record.section_id,
                seq = record.seq,
                "record for unknown section ignored"
            );
            continue;
        }
        latest.insert(record.section_id, record.state);
    }

    let sections = header
        .sections
        .iter()
        .map(|def| match latest.remove(&def.id) {
            Some(state) => Section::restore(def.clone(), state),
            None => Section::new(def.clone()),
        })
        .collect();

    Run {
        header,
        sections,
        checkpoint_cursor: cursor,
    }
}
