//! Response drafting: generation backends, verdict classification and the
//! run orchestrator.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator (worker pool, one task per section)
//!   ├── RetrievalClient   → knowledge-base passages
//!   ├── GenerationClient  → BackendRegistry → OpenAI / Ollama backend
//!   ├── classifier        → verdict + justification (compliance only)
//!   └── CheckpointStore   → one record per state change
//! ```

pub mod classifier;
pub mod client;
pub mod generation;
pub mod message;
pub mod orchestrator;
pub mod prompt;
pub mod provider;
pub mod providers;
pub mod report;
pub mod retry;

pub use classifier::{classify, extract_verdict};
pub use client::{BackendRegistry, create_backend};
pub use generation::{Generated, GenerationClient, PromptContext};
pub use message::{ChatMessage, ChatRequest, ChatResponse, Role, TokenUsage};
pub use orchestrator::{Orchestrator, OrchestratorSettings, ResumeOptions, RunHandle};
pub use prompt::PromptSet;
pub use provider::CompletionBackend;
pub use report::{RunReport, SectionReport};
pub use retry::RetryPolicy;
