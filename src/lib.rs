//! # rfp-agent
//!
//! Resumable pipeline that drafts RFP responses section by section.
//!
//! Each section of an input document is driven through retrieval against a
//! local knowledge base, generation by a pluggable LLM backend and, for
//! compliance requirements, a deterministic YES/NO/PARTIAL verdict. Every
//! state change is committed to an append-only checkpoint log so an
//! interrupted run can be resumed without repeating finished work.
//!
//! ## Modules
//!
//! - [`input`]: JSON, CSV and outline adapters producing section definitions
//! - [`retrieval`]: vector store, embedder, ingestion and budgeted retrieval
//! - [`agent`]: generation backends, classifier and the orchestrator
//! - [`checkpoint`]: durable run log and replay
//! - [`core`]: sections, verdicts and the run ledger
//! - [`config`]: layered configuration
//! - [`cli`]: command-line interface

pub mod agent;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod input;
pub mod retrieval;

pub use agent::{Orchestrator, OrchestratorSettings, ResumeOptions, RunReport};
pub use checkpoint::{CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
pub use config::AppConfig;
pub use core::{ProviderConfig, ProviderKind, Section, SectionDef, SectionKind, SectionOutput, SectionStatus, Verdict};
pub use error::{Error, Result};
