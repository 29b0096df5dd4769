//! CLI layer for rfp-agent.
//!
//! Provides the command-line interface using clap, with commands for
//! starting, resuming and inspecting runs and for managing the knowledge
//! base.

pub mod commands;
pub mod output;
pub mod parser;

pub use commands::execute;
pub use output::OutputFormat;
pub use parser::{Cli, Commands, ConfigCommands, KbCommands, ProviderArgs};
