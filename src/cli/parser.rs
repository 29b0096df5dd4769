//! Command-line argument parsing.
//!
//! Defines the CLI structure using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// rfp-agent: draft RFP responses from a knowledge base.
///
/// Splits an RFP into sections, retrieves supporting passages for each,
/// generates an answer with a local or cloud model and classifies
/// compliance requirements. Runs are checkpointed and resumable.
#[derive(Parser, Debug)]
#[command(name = "rfp-agent")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file (defaults to `rfp-agent.toml` in the working directory).
    #[arg(short, long, env = "RFP_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format (text, json, csv).
    #[arg(long, default_value = "text", global = true)]
    pub format: String,

    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Provider overrides shared by `run` and `resume`.
#[derive(Args, Debug, Clone, Default)]
pub struct ProviderArgs {
    /// Generation backend (cloud, local).
    #[arg(long)]
    pub provider: Option<String>,

    /// Model identifier.
    #[arg(long)]
    pub model: Option<String>,

    /// API base URL override.
    #[arg(long)]
    pub base_url: Option<String>,
}

impl ProviderArgs {
    /// Whether any override was given.
    #[must_use]
    pub const fn is_set(&self) -> bool {
        self.provider.is_some() || self.model.is_some() || self.base_url.is_some()
    }
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a new run over an input document.
    #[command(after_help = r#"Examples:
  rfp-agent run sheet.csv                       # Compliance sheet
  rfp-agent run outline.txt --lines 40-220      # Part of an extracted outline
  rfp-agent run sections.json --provider cloud  # Use the OpenAI-compatible backend
  rfp-agent --format json run sheet.csv | jq '.run_id'
"#)]
    Run {
        /// Input document (.json, .csv, .txt, .md).
        input: PathBuf,

        /// Input format, overriding the file extension (json, csv, outline).
        #[arg(long)]
        input_format: Option<String>,

        /// Line range to read from an outline, e.g. `40-220` (1-based, inclusive).
        #[arg(long)]
        lines: Option<String>,

        /// Worker pool size.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Restrict retrieval to these knowledge-base documents.
        #[arg(long = "doc", value_name = "DOCUMENT_ID")]
        docs: Vec<String>,

        #[command(flatten)]
        provider: ProviderArgs,
    },

    /// Continue an interrupted or partially failed run.
    #[command(after_help = r#"Examples:
  rfp-agent resume 3f2c...                       # Continue where it stopped
  rfp-agent resume 3f2c... --retry-failed        # Also retry failed sections
  rfp-agent resume 3f2c... --provider cloud      # Switch backend for the rest
"#)]
    Resume {
        /// Run id.
        run_id: String,

        /// Reset failed sections under the attempt ceiling and retry them.
        #[arg(long)]
        retry_failed: bool,

        /// Worker pool size.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Switch the run's generation backend before continuing.
        #[command(flatten)]
        provider: ProviderArgs,
    },

    /// Show per-section status of a run.
    Status {
        /// Run id.
        run_id: String,
    },

    /// Print the assembled response of a run in document order.
    Output {
        /// Run id.
        run_id: String,

        /// Write to a file instead of stdout.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Mark a run abandoned so it can no longer be resumed.
    Abandon {
        /// Run id.
        run_id: String,
    },

    /// List stored runs, newest first.
    Runs,

    /// Knowledge-base commands.
    #[command(subcommand)]
    Kb(KbCommands),

    /// Write default prompt templates to disk for customization.
    ///
    /// Existing files are left untouched.
    InitPrompts {
        /// Target directory. Defaults to `~/.config/rfp-agent/prompts/`.
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Configuration commands.
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Knowledge-base subcommands.
#[derive(Subcommand, Debug)]
pub enum KbCommands {
    /// Chunk, embed and store text or markdown files.
    ///
    /// Directories are scanned one level deep. Re-ingesting a file replaces
    /// its chunks.
    Ingest {
        /// Files or directories.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Show chunk and document counts.
    Stats,
}

/// Configuration subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the resolved configuration (API key omitted).
    Show,
}

/// Parses a `start-end` line range.
///
/// # Errors
///
/// Returns a message if the range is malformed, zero-based or reversed.
pub fn parse_line_range(s: &str) -> Result<(usize, usize), String> {
    let (start, end) = s
        .split_once('-')
        .ok_or_else(|| format!("invalid line range '{s}' (expected START-END)"))?;
    let start: usize = start
        .trim()
        .parse()
        .map_err(|_| format!("invalid range start '{start}'"))?;
    let end: usize = end
        .trim()
        .parse()
        .map_err(|_| format!("invalid range end '{end}'"))?;
    if start == 0 || end < start {
        return Err(format!("invalid line range '{s}'"));
    }
    Ok((start, end))
}
