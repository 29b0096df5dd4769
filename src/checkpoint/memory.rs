//! In-process checkpoint store.
//!
//! Holds everything in a mutex-guarded map. Used by tests and dry runs; it
//! can be told to start failing writes to exercise crash-and-resume paths.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::{CheckpointRecord, CheckpointStore};
use crate::core::{ProviderConfig, RunHeader, SectionState};
use crate::error::CheckpointError;

#[derive(Debug, Default)]
struct Inner {
    headers: HashMap<String, RunHeader>,
    records: Vec<CheckpointRecord>,
    next_seq: i64,
    appends_left: Option<usize>,
}

/// Non-durable [`CheckpointStore`].
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<Inner>,
}

impl MemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lets `n` more appends succeed, then fails every later one.
    pub fn fail_after(&self, n: usize) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.appends_left = Some(n);
        }
    }

    /// Clears any injected failure.
    pub fn heal(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.appends_left = None;
        }
    }

    /// Records appended so far, across all runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.records.len()).unwrap_or_default()
    }

    /// Whether nothing has been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, CheckpointError> {
        self.inner.lock().map_err(|_| CheckpointError::Read {
            message: "checkpoint store lock poisoned".to_string(),
        })
    }

    fn header_mut<'a>(inner: &'a mut Inner, run_id: &str) -> Result<&'a mut RunHeader, CheckpointError> {
        inner
            .headers
            .get_mut(run_id)
            .ok_or_else(|| CheckpointError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn create_run(&self, header: &RunHeader) -> Result<(), CheckpointError> {
        let mut inner = self.lock()?;
        if inner.headers.contains_key(&header.run_id) {
            return Err(CheckpointError::WriteFailure {
                message: format!("run {} already exists", header.run_id),
            });
        }
        inner.headers.insert(header.run_id.clone(), header.clone());
        Ok(())
    }

    fn append(&self, run_id: &str, section_id: &str, state: &SectionState) -> Result<i64, CheckpointError> {
        let mut inner = self.lock()?;
        match inner.appends_left {
            Some(0) => {
                return Err(CheckpointError::WriteFailure {
                    message: "injected write failure".to_string(),
                });
            }
            Some(n) => inner.appends_left = Some(n - 1),
            None => {}
        }
        Self::header_mut(&mut inner, run_id)?;
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.records.push(CheckpointRecord {
            run_id: run_id.to_string(),
            section_id: section_id.to_string(),
            seq,
            state: state.clone(),
            written_at: Utc::now(),
        });
        Ok(seq)
    }

    fn load_header(&self, run_id: &str) -> Result<RunHeader, CheckpointError> {
        let mut inner = self.lock()?;
        Self::header_mut(&mut inner, run_id).map(|h| h.clone())
    }

    fn list_runs(&self) -> Result<Vec<RunHeader>, CheckpointError> {
        let inner = self.lock()?;
        let mut headers: Vec<RunHeader> = inner.headers.values().cloned().collect();
        headers.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.run_id.cmp(&b.run_id)));
        Ok(headers)
    }

    fn records(&self, run_id: &str) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        let inner = self.lock()?;
        Ok(inner
            .records
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect())
    }

    fn update_provider(&self, run_id: &str, provider: &ProviderConfig) -> Result<(), CheckpointError> {
        let mut inner = self.lock()?;
        Self::header_mut(&mut inner, run_id)?.provider_config = provider.clone();
        Ok(())
    }

    fn mark_completed(&self, run_id: &str, at: DateTime<Utc>) -> Result<(), CheckpointError> {
        let mut inner = self.lock()?;
        Self::header_mut(&mut inner, run_id)?.completed_at = Some(at);
        Ok(())
    }

    fn mark_reopened(&self, run_id: &str) -> Result<(), CheckpointError> {
        let mut inner = self.lock()?;
        Self::header_mut(&mut inner, run_id)?.completed_at = None;
        Ok(())
    }

    fn mark_abandoned(&self, run_id: &str, at: DateTime<Utc>) -> Result<(), CheckpointError> {
        let mut inner = self.lock()?;
        Self::header_mut(&mut inner, run_id)?.abandoned_at = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ProviderKind, SectionDef, SectionKind};

    #[test]
    fn test_injected_failure_and_heal() {
        let store = MemoryCheckpointStore::new();
        let header = RunHeader::new(
            "outline.md",
            vec![SectionDef::new("s0000", 0, SectionKind::Narrative, "Overview")],
            ProviderConfig::new(ProviderKind::Local),
        );
        assert!(store.create_run(&header).is_ok());
        assert!(store.create_run(&header).is_err());

        store.fail_after(1);
        assert_eq!(store.append(&header.run_id, "s0000", &SectionState::default()).ok(), Some(1));
        assert!(matches!(
            store.append(&header.run_id, "s0000", &SectionState::default()),
            Err(CheckpointError::WriteFailure { .. })
        ));
        store.heal();
        assert_eq!(store.append(&header.run_id, "s0000", &SectionState::default()).ok(), Some(2));
        assert_eq!(store.len(), 2);
        assert!(store.append("other", "s0000", &SectionState::default()).is_err());
    }

    #[test]
    fn test_reopen_clears_completion() {
        let store = MemoryCheckpointStore::new();
        let header = RunHeader::new("outline.md", Vec::new(), ProviderConfig::new(ProviderKind::Local));
        assert!(store.create_run(&header).is_ok());
        assert!(store.mark_completed(&header.run_id, Utc::now()).is_ok());
        assert!(store.mark_reopened(&header.run_id).is_ok());
        assert_eq!(store.load_header(&header.run_id).map(|h| h.lifecycle()).ok(), Some("in-progress"));
        assert!(matches!(store.mark_reopened("ghost"), Err(CheckpointError::RunNotFound { .. })));
    }
}
