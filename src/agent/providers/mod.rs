//! Concrete completion backends.

pub mod ollama;
pub mod openai;

pub use ollama::OllamaBackend;
pub use openai::OpenAiBackend;
