//! Orchestrator for resumable section-by-section response runs.
//!
//! Drives every section of a run through retrieval, generation and (for
//! compliance sections) classification. Each state change is applied to the
//! in-memory section and then appended to the checkpoint store before the
//! worker moves on, so replaying the store always yields a state the run
//! actually passed through. Store writes run on the blocking pool, never
//! while a section lock is held.

use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::classifier::classify;
use super::generation::{GenerationClient, PromptContext};
use super::message::TokenUsage;
use super::report::RunReport;
use crate::checkpoint::CheckpointStore;
use crate::config::AppConfig;
use crate::checkpoint;
use crate::core::{
    ProviderConfig, RetrievalProfile, RunHeader, Section, SectionDef, SectionOutput, SectionState,
    SectionStatus,
};
use crate::error::{CheckpointError, OrchestratorError, ProviderError, RetrievalError, TransitionError};
use crate::retrieval::RetrievalClient;

/// Per-run processing limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Worker pool size.
    pub concurrency: usize,
    /// Attempt ceiling for retry resets.
    pub max_attempts: u32,
    /// Retrieval profile stamped on runs created by this orchestrator.
    /// Existing runs keep the profile they were created with.
    pub retrieval: RetrievalProfile,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 3,
            retrieval: RetrievalProfile::default(),
        }
    }
}

impl From<&AppConfig> for OrchestratorSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            max_attempts: config.max_attempts,
            retrieval: config.retrieval_profile(),
        }
    }
}

/// Options for [`Orchestrator::resume`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeOptions {
    /// Reset failed sections with attempts left back to `pending`.
    pub retry_failed: bool,
}

/// A live run.
///
/// The provider configuration is read on every generation call, so a switch
/// takes effect for the next section that reaches generation.
#[derive(Clone)]
pub struct RunHandle {
    run_id: String,
    provider: Arc<RwLock<ProviderConfig>>,
    store: Arc<dyn CheckpointStore>,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .field("provider", &self.provider())
            .finish_non_exhaustive()
    }
}

impl RunHandle {
    /// Run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Provider configuration currently in effect.
    #[must_use]
    pub fn provider(&self) -> ProviderConfig {
        match self.provider.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Switches the backend for subsequent generation calls and persists the
    /// change to the run header.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if the header cannot be updated; the
    /// active provider is left unchanged.
    pub fn switch_provider(&self, provider: ProviderConfig) -> Result<(), CheckpointError> {
        self.store.update_provider(&self.run_id, &provider)?;
        info!(run_id = %self.run_id, provider = %provider.kind, model = %provider.model, "provider switched");
        match self.provider.write() {
            Ok(mut guard) => *guard = provider,
            Err(poisoned) => *poisoned.into_inner() = provider,
        }
        Ok(())
    }
}

/// Orchestrates runs over shared retrieval and generation clients.
#[derive(Clone)]
pub struct Orchestrator {
    retrieval: RetrievalClient,
    generation: GenerationClient,
    store: Arc<dyn CheckpointStore>,
    settings: OrchestratorSettings,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("retrieval", &self.retrieval)
            .field("generation", &self.generation)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Shared state of one orchestrator pass.
struct Pass {
    run_id: String,
    provider: Arc<RwLock<ProviderConfig>>,
    retrieval: RetrievalProfile,
    cancel: CancellationToken,
    usage: Mutex<TokenUsage>,
}

type Ledger = Vec<Arc<Mutex<Section>>>;

fn lock_section(section: &Mutex<Section>) -> Result<std::sync::MutexGuard<'_, Section>, OrchestratorError> {
    section.lock().map_err(|_| OrchestratorError::Worker {
        message: "section lock poisoned".to_string(),
    })
}

/// Done, or failed with no attempts left.
fn settled(section: &Section, max_attempts: u32) -> bool {
    match section.status() {
        SectionStatus::Done => true,
        SectionStatus::Failed => section.state().attempt_count >= max_attempts,
        _ => false,
    }
}

impl Orchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(
        retrieval: RetrievalClient,
        generation: GenerationClient,
        store: Arc<dyn CheckpointStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            retrieval,
            generation,
            store,
            settings,
        }
    }

    /// Processing limits.
    #[must_use]
    pub const fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Persists a new run header and returns its handle. No section is
    /// processed yet.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::InvalidRun`] for an empty list or duplicate ids
    /// - [`OrchestratorError::Checkpoint`] if the header cannot be written
    pub fn create_run(
        &self,
        input_document_ref: &str,
        sections: Vec<SectionDef>,
        provider: ProviderConfig,
    ) -> Result<RunHandle, OrchestratorError> {
        if sections.is_empty() {
            return Err(OrchestratorError::InvalidRun {
                message: format!("{input_document_ref} has no sections"),
            });
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = sections.iter().find(|s| !seen.insert(s.id.as_str())) {
            return Err(OrchestratorError::InvalidRun {
                message: format!("duplicate section id '{}'", dup.id),
            });
        }

        let header =
            RunHeader::new(input_document_ref, sections, provider).with_retrieval(self.settings.retrieval.clone());
        self.store
            .create_run(&header)
            .map_err(|source| OrchestratorError::Checkpoint {
                run_id: header.run_id.clone(),
                source,
            })?;
        info!(
            run_id = %header.run_id,
            input = %header.input_document_ref,
            sections = header.sections.len(),
            provider = %header.provider_config.kind,
            doc_filter = ?header.retrieval.doc_filter,
            "run created"
        );
        Ok(RunHandle {
            run_id: header.run_id,
            provider: Arc::new(RwLock::new(header.provider_config)),
            store: Arc::clone(&self.store),
        })
    }

    /// Opens an existing run for further processing.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Checkpoint`] for unknown or abandoned runs.
    pub fn attach(&self, run_id: &str) -> Result<RunHandle, OrchestratorError> {
        let header = self.store.load_header(run_id).map_err(|source| checkpoint_err(run_id, source))?;
        if header.abandoned_at.is_some() {
            return Err(checkpoint_err(
                run_id,
                CheckpointError::RunAbandoned {
                    run_id: run_id.to_string(),
                },
            ));
        }
        Ok(RunHandle {
            run_id: header.run_id,
            provider: Arc::new(RwLock::new(header.provider_config)),
            store: Arc::clone(&self.store),
        })
    }

    /// Creates a run and processes every section.
    ///
    /// # Errors
    ///
    /// See [`create_run`](Self::create_run) and [`drive`](Self::drive).
    pub async fn start(
        &self,
        input_document_ref: &str,
        sections: Vec<SectionDef>,
        provider: ProviderConfig,
        cancel: CancellationToken,
    ) -> Result<RunReport, OrchestratorError> {
        let handle = self.create_run(input_document_ref, sections, provider)?;
        self.drive(&handle, ResumeOptions::default(), cancel).await
    }

    /// Continues a run from its last committed checkpoint.
    ///
    /// # Errors
    ///
    /// See [`attach`](Self::attach) and [`drive`](Self::drive).
    pub async fn resume(
        &self,
        run_id: &str,
        options: ResumeOptions,
        cancel: CancellationToken,
    ) -> Result<RunReport, OrchestratorError> {
        let handle = self.attach(run_id)?;
        self.drive(&handle, options, cancel).await
    }

    /// Replays the run and processes every unfinished section.
    ///
    /// `done` sections are never touched. Sections committed mid-attempt
    /// continue from their committed state. With
    /// [`ResumeOptions::retry_failed`], failed sections under the attempt
    /// ceiling are reset to `pending` first and a completed run is reopened.
    /// Retrieval uses the profile stored on the run header.
    ///
    /// The run is marked completed once every section is `done` or failed
    /// with no attempts left.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Checkpoint`] if the log cannot be read or
    /// a write fails; the run stops issuing calls and stays resumable.
    pub async fn drive(
        &self,
        handle: &RunHandle,
        options: ResumeOptions,
        cancel: CancellationToken,
    ) -> Result<RunReport, OrchestratorError> {
        let run_id = handle.run_id().to_string();
        let run = self.store.replay(&run_id).map_err(|source| checkpoint_err(&run_id, source))?;
        if run.header.abandoned_at.is_some() {
            return Err(checkpoint_err(
                &run_id,
                CheckpointError::RunAbandoned { run_id: run_id.clone() },
            ));
        }

        let mut header = run.header;
        let pass = Arc::new(Pass {
            run_id: run_id.clone(),
            provider: Arc::clone(&handle.provider),
            retrieval: header.retrieval.clone(),
            cancel: cancel.child_token(),
            usage: Mutex::new(TokenUsage::default()),
        });

        let mut sections = run.sections;
        sections.sort_by_key(|s| s.def().position);
        let ledger: Ledger = sections.into_iter().map(|s| Arc::new(Mutex::new(s))).collect();

        if options.retry_failed && self.reset_failed(&pass, &ledger).await? > 0 && header.completed_at.is_some() {
            self.store
                .mark_reopened(&run_id)
                .map_err(|source| checkpoint_err(&run_id, source))?;
            header.completed_at = None;
            info!(run_id = %run_id, "run reopened for retry");
        }

        info!(run_id = %run_id, cursor = run.checkpoint_cursor, "processing run");
        let result = self.process_all(&pass, &ledger).await;

        let sections = ledger
            .iter()
            .map(|s| lock_section(s).map(|g| Section::clone(&g)))
            .collect::<Result<Vec<_>, _>>()?;
        result?;

        let finished = sections.iter().all(|s| settled(s, self.settings.max_attempts));
        if finished && header.completed_at.is_none() {
            let now = Utc::now();
            self.store
                .mark_completed(&run_id, now)
                .map_err(|source| checkpoint_err(&run_id, source))?;
            header.completed_at = Some(now);
        }
        header.provider_config = handle.provider();

        let mut report = RunReport::new(&header, &sections, self.settings.max_attempts);
        report.cancelled = !report.is_finished() && pass.cancel.is_cancelled();
        report.usage = pass.usage.lock().map(|u| *u).unwrap_or_default();
        info!(
            run_id = %run_id,
            done = report.count(SectionStatus::Done),
            failed = report.count(SectionStatus::Failed),
            cancelled = report.cancelled,
            "run pass finished"
        );
        Ok(report)
    }

    /// Resets failed sections under the attempt ceiling; returns how many.
    async fn reset_failed(&self, pass: &Pass, ledger: &Ledger) -> Result<usize, OrchestratorError> {
        let mut reset = 0;
        for section in ledger {
            {
                let guard = lock_section(section)?;
                if guard.status() != SectionStatus::Failed {
                    continue;
                }
                if settled(&guard, self.settings.max_attempts) {
                    warn!(
                        run_id = %pass.run_id,
                        section_id = guard.id(),
                        attempts = guard.state().attempt_count,
                        "attempt ceiling reached, section stays failed"
                    );
                    continue;
                }
            }
            self.transition(pass, section, Section::reset_for_retry).await?;
            reset += 1;
        }
        Ok(reset)
    }

    async fn process_all(&self, pass: &Arc<Pass>, ledger: &Ledger) -> Result<(), OrchestratorError> {
        let pool = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut handles = Vec::new();

        for section in ledger {
            if lock_section(section)?.status().is_terminal() {
                continue;
            }
            let this = self.clone();
            let pass = Arc::clone(pass);
            let section = Arc::clone(section);
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                let _permit = pool.acquire_owned().await.map_err(|e| OrchestratorError::Worker {
                    message: format!("worker pool closed: {e}"),
                })?;
                this.process_section(&pass, &section).await
            }));
        }

        let mut first_error = None;
        for handle in handles {
            let outcome = handle.await.unwrap_or_else(|e| {
                Err(OrchestratorError::Worker {
                    message: format!("task join failed: {e}"),
                })
            });
            if let Err(err) = outcome {
                pass.cancel.cancel();
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Runs one section until it is terminal or the pass is cancelled.
    async fn process_section(&self, pass: &Pass, section: &Mutex<Section>) -> Result<(), OrchestratorError> {
        loop {
            let status = lock_section(section)?.status();
            match status {
                SectionStatus::Done | SectionStatus::Failed => return Ok(()),
                SectionStatus::Pending => {
                    if pass.cancel.is_cancelled() {
                        return Ok(());
                    }
                    self.transition(pass, section, Section::begin_attempt).await?;
                }
                SectionStatus::Retrieving => {
                    if pass.cancel.is_cancelled() {
                        return Ok(());
                    }
                    let (kind, query) = {
                        let guard = lock_section(section)?;
                        (guard.kind(), guard.def().requirement_text.clone())
                    };
                    let (max_passages, max_tokens) = pass.retrieval.budget(kind);
                    let outcome = self
                        .retrieval
                        .retrieve(
                            &query,
                            max_passages,
                            max_tokens,
                            pass.retrieval.doc_filter.as_deref(),
                            Some(&pass.cancel),
                        )
                        .await;
                    match outcome {
                        Ok(passages) => {
                            self.transition(pass, section, |s| s.attach_passages(passages)).await?;
                        }
                        Err(RetrievalError::Cancelled) => return Ok(()),
                        Err(err) => self.fail(pass, section, &err.to_string()).await?,
                    }
                }
                SectionStatus::Generating => {
                    if pass.cancel.is_cancelled() {
                        return Ok(());
                    }
                    let (kind, requirement, passages) = {
                        let guard = lock_section(section)?;
                        (
                            guard.kind(),
                            guard.def().requirement_text.clone(),
                            guard.state().retrieved_passages.clone(),
                        )
                    };
                    let provider = match pass.provider.read() {
                        Ok(guard) => guard.clone(),
                        Err(poisoned) => poisoned.into_inner().clone(),
                    };
                    let context = PromptContext {
                        kind,
                        requirement_text: &requirement,
                        passages: &passages,
                    };
                    match self.generation.generate(&context, &provider, Some(&pass.cancel)).await {
                        Ok(generated) => {
                            if let Ok(mut usage) = pass.usage.lock() {
                                usage.accumulate(generated.usage);
                            }
                            self.transition(pass, section, |s| s.record_generation(generated.text))
                                .await?;
                        }
                        Err(ProviderError::Cancelled) => return Ok(()),
                        Err(err) => self.fail(pass, section, &err.to_string()).await?,
                    }
                }
                SectionStatus::Classifying => {
                    self.transition(pass, section, |s| {
                        let text = s.state().generated_text.clone().unwrap_or_default();
                        let classification =
                            classify(&s.def().requirement_text, &s.state().retrieved_passages, &text);
                        s.record_classification(classification)
                    })
                    .await?;
                }
            }
        }
    }

    /// Applies `change` under the section lock, then checkpoints a snapshot
    /// of the result after the lock is released.
    async fn transition<F>(&self, pass: &Pass, section: &Mutex<Section>, change: F) -> Result<(), OrchestratorError>
    where
        F: FnOnce(&mut Section) -> Result<(), TransitionError>,
    {
        let (section_id, state) = {
            let mut guard = lock_section(section)?;
            change(&mut guard)?;
            (guard.id().to_string(), guard.state().clone())
        };
        self.commit(pass, section_id, state).await
    }

    async fn fail(&self, pass: &Pass, section: &Mutex<Section>, error: &str) -> Result<(), OrchestratorError> {
        {
            let guard = lock_section(section)?;
            warn!(
                run_id = %pass.run_id,
                section_id = guard.id(),
                from = %guard.status(),
                attempt = guard.state().attempt_count,
                error,
                "section failed"
            );
        }
        self.transition(pass, section, |s| s.fail(error)).await
    }

    async fn commit(&self, pass: &Pass, section_id: String, state: SectionState) -> Result<(), OrchestratorError> {
        let store = Arc::clone(&self.store);
        let run_id = pass.run_id.clone();
        let status = state.status;
        let written = tokio::task::spawn_blocking(move || {
            store.append(&run_id, &section_id, &state).map(|seq| (section_id, seq))
        })
        .await
        .map_err(|e| {
            pass.cancel.cancel();
            OrchestratorError::Worker {
                message: format!("checkpoint write task failed: {e}"),
            }
        })?;
        let (section_id, seq) = written.map_err(|source| {
            pass.cancel.cancel();
            checkpoint_err(&pass.run_id, source)
        })?;
        info!(
            run_id = %pass.run_id,
            section_id = %section_id,
            status = %status,
            seq,
            "checkpoint"
        );
        Ok(())
    }

    /// Assembled output of a run, in input order.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Checkpoint`] if the run cannot be replayed.
    pub fn assemble(&self, run_id: &str) -> Result<Vec<SectionOutput>, OrchestratorError> {
        checkpoint::assemble(self.store.as_ref(), run_id).map_err(|source| checkpoint_err(run_id, source))
    }

    /// Current report of a stored run, without processing anything.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Checkpoint`] if the run cannot be replayed.
    pub fn status(&self, run_id: &str) -> Result<RunReport, OrchestratorError> {
        RunReport::load(self.store.as_ref(), run_id, self.settings.max_attempts)
            .map_err(|source| checkpoint_err(run_id, source))
    }

    /// Marks a run abandoned. It can no longer be resumed.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Checkpoint`] for unknown runs or write failures.
    pub fn abandon(&self, run_id: &str) -> Result<(), OrchestratorError> {
        checkpoint::abandon(self.store.as_ref(), run_id).map_err(|source| checkpoint_err(run_id, source))
    }
}

fn checkpoint_err(run_id: &str, source: CheckpointError) -> OrchestratorError {
    OrchestratorError::Checkpoint {
        run_id: run_id.to_string(),
        source,
    }
}

