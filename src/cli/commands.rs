//! CLI command implementations.
//!
//! Contains the business logic for each CLI command. Async work runs on a
//! tokio runtime created per command.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::orchestrator::RunHandle;
use crate::agent::{
    BackendRegistry, GenerationClient, Orchestrator, OrchestratorSettings, PromptSet, ResumeOptions,
    RunReport,
};
use crate::checkpoint::{self, CheckpointStore, SqliteCheckpointStore};
use crate::cli::output::{
    OutputFormat, format_ingest, format_outputs, format_report, format_runs, format_stats,
};
use crate::cli::parser::{Cli, Commands, ConfigCommands, KbCommands, ProviderArgs, parse_line_range};
use crate::config::AppConfig;
use crate::core::{ProviderConfig, ProviderKind};
use crate::error::{CommandError, ConfigError, OrchestratorError, Result};
use crate::input::{InputFormat, LoadOptions, load_sections};
use crate::retrieval::embedding::{Embedder, create_embedder};
use crate::retrieval::ingest::ingest_paths;
use crate::retrieval::store::SqliteVectorStore;
use crate::retrieval::{RetrievalClient, RetrievalSettings};

/// Executes the CLI command.
///
/// # Errors
///
/// Returns an error if configuration, input, storage or the run itself fails.
pub fn execute(cli: &Cli) -> Result<String> {
    let format = OutputFormat::parse(&cli.format);

    match &cli.command {
        Commands::Run {
            input,
            input_format,
            lines,
            concurrency,
            docs,
            provider,
        } => {
            let mut overrides = provider_overrides(provider);
            if let Some(n) = concurrency {
                overrides = overrides.concurrency(*n);
            }
            let config = AppConfig::load(overrides, cli.config.as_deref())?;
            let options = load_options(input_format.as_deref(), lines.as_deref())?;
            cmd_run(&config, input, &options, docs, format)
        }
        Commands::Resume {
            run_id,
            retry_failed,
            concurrency,
            provider,
        } => {
            let mut overrides = AppConfig::builder();
            if let Some(n) = concurrency {
                overrides = overrides.concurrency(*n);
            }
            let config = AppConfig::load(overrides, cli.config.as_deref())?;
            cmd_resume(&config, run_id, *retry_failed, provider, format)
        }
        Commands::Status { run_id } => cmd_status(&load_config(cli)?, run_id, format),
        Commands::Output { run_id, out } => {
            cmd_output(&load_config(cli)?, run_id, out.as_deref(), format)
        }
        Commands::Abandon { run_id } => cmd_abandon(&load_config(cli)?, run_id, format),
        Commands::Runs => cmd_runs(&load_config(cli)?, format),
        Commands::Kb(KbCommands::Ingest { paths }) => {
            cmd_kb_ingest(&load_config(cli)?, paths, format)
        }
        Commands::Kb(KbCommands::Stats) => cmd_kb_stats(&load_config(cli)?, format),
        Commands::InitPrompts { dir } => cmd_init_prompts(dir.as_deref(), format),
        Commands::Config(ConfigCommands::Show) => cmd_config_show(&load_config(cli)?, format),
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    Ok(AppConfig::load(AppConfig::builder(), cli.config.as_deref())?)
}

fn provider_overrides(args: &ProviderArgs) -> crate::config::AppConfigBuilder {
    let mut builder = AppConfig::builder();
    if let Some(provider) = &args.provider {
        builder = builder.provider(provider);
    }
    if let Some(model) = &args.model {
        builder = builder.model_name(model);
    }
    if let Some(url) = &args.base_url {
        builder = builder.base_url(url);
    }
    builder
}

fn load_options(input_format: Option<&str>, lines: Option<&str>) -> Result<LoadOptions> {
    let format = input_format
        .map(|name| {
            InputFormat::parse(name).ok_or_else(|| {
                CommandError::ExecutionFailed(format!(
                    "unknown input format '{name}' (expected json, csv or outline)"
                ))
            })
        })
        .transpose()?;
    let line_range = lines
        .map(parse_line_range)
        .transpose()
        .map_err(CommandError::ExecutionFailed)?;
    Ok(LoadOptions { format, line_range })
}

/// Builds the orchestrator and everything behind it from configuration.
fn build_orchestrator(config: &AppConfig, settings: OrchestratorSettings) -> Result<Orchestrator> {
    let knowledge_base = SqliteVectorStore::open(&config.knowledge_base_path)?;
    let embedder: Arc<dyn Embedder> = Arc::from(create_embedder()?);
    let retrieval = RetrievalClient::new(
        Arc::new(knowledge_base),
        embedder,
        config.retry_policy(),
        RetrievalSettings {
            min_similarity: config.min_similarity,
            candidate_pool: config.candidate_pool,
            tie_break: config.tie_break,
            timeout: config.retrieval_timeout,
        },
    );

    let generation = GenerationClient::new(
        Arc::new(BackendRegistry::new(config.api_key.clone())),
        Arc::new(PromptSet::load(config.prompt_dir.as_deref())),
        config.retry_policy(),
        config.max_inflight_generations,
        config.request_timeout,
    );

    let store = SqliteCheckpointStore::open(&config.checkpoint_path)?;
    Ok(Orchestrator::new(retrieval, generation, Arc::new(store), settings))
}

fn open_checkpoints(config: &AppConfig) -> Result<SqliteCheckpointStore> {
    if !config.checkpoint_path.exists() {
        return Err(CommandError::ExecutionFailed(format!(
            "no checkpoint database at {}; start a run first",
            config.checkpoint_path.display()
        ))
        .into());
    }
    Ok(SqliteCheckpointStore::open(&config.checkpoint_path)?)
}

/// Runs `work` on a fresh runtime with Ctrl-C wired to a cancellation token.
fn block_on_cancellable<F, Fut, T>(work: F) -> Result<T>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = std::result::Result<T, OrchestratorError>>,
{
    let rt = tokio::runtime::Runtime::new().map_err(|e| {
        CommandError::ExecutionFailed(format!("Failed to create async runtime: {e}"))
    })?;

    let cancel = CancellationToken::new();
    let result = rt.block_on(async {
        let token = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; finishing in-flight calls");
                token.cancel();
            }
        });
        work(cancel.clone()).await
    });
    Ok(result?)
}

// ==================== Command Implementations ====================

fn cmd_run(
    config: &AppConfig,
    input: &Path,
    options: &LoadOptions,
    docs: &[String],
    format: OutputFormat,
) -> Result<String> {
    let sections = load_sections(input, options)?;
    info!(input = %input.display(), sections = sections.len(), "input loaded");

    let mut settings = OrchestratorSettings::from(config);
    if !docs.is_empty() {
        settings.retrieval.doc_filter = Some(docs.to_vec());
    }
    let orchestrator = build_orchestrator(config, settings)?;
    let input_ref = input.display().to_string();
    let provider = config.provider_config();

    let report = block_on_cancellable(|cancel| async move {
        orchestrator.start(&input_ref, sections, provider, cancel).await
    })?;
    Ok(format_report(&report, format))
}

fn cmd_resume(
    config: &AppConfig,
    run_id: &str,
    retry_failed: bool,
    provider: &ProviderArgs,
    format: OutputFormat,
) -> Result<String> {
    let orchestrator = build_orchestrator(config, OrchestratorSettings::from(config))?;
    let handle = orchestrator.attach(run_id)?;

    if provider.is_set() {
        let switched = switched_provider(handle.provider(), provider)?;
        info!(run_id, provider = %switched.kind, model = %switched.model, "switching provider");
        handle
            .switch_provider(switched)
            .map_err(|source| OrchestratorError::Checkpoint {
                run_id: run_id.to_string(),
                source,
            })?;
    }

    let report = drive(&orchestrator, &handle, ResumeOptions { retry_failed })?;
    Ok(format_report(&report, format))
}

fn drive(orchestrator: &Orchestrator, handle: &RunHandle, options: ResumeOptions) -> Result<RunReport> {
    block_on_cancellable(|cancel| async move { orchestrator.drive(handle, options, cancel).await })
}

/// Applies CLI overrides to a run's provider configuration. Changing the
/// backend family resets the models and base URL unless they are given too.
fn switched_provider(mut current: ProviderConfig, args: &ProviderArgs) -> Result<ProviderConfig> {
    if let Some(name) = &args.provider {
        let kind = ProviderKind::parse(name).ok_or_else(|| ConfigError::Invalid {
            key: "provider",
            message: format!("unknown provider '{name}' (expected 'cloud' or 'local')"),
        })?;
        if kind != current.kind {
            current.kind = kind;
            current.model = kind.default_model().to_string();
            current.compliance_model = None;
            current.base_url = None;
        }
    }
    if let Some(model) = &args.model {
        current.model.clone_from(model);
    }
    if let Some(url) = &args.base_url {
        current.base_url = Some(url.clone());
    }
    Ok(current)
}

fn cmd_status(config: &AppConfig, run_id: &str, format: OutputFormat) -> Result<String> {
    let store = open_checkpoints(config)?;
    let report = RunReport::load(&store, run_id, config.max_attempts)?;
    Ok(format_report(&report, format))
}

fn cmd_output(
    config: &AppConfig,
    run_id: &str,
    out: Option<&Path>,
    format: OutputFormat,
) -> Result<String> {
    let store = open_checkpoints(config)?;
    let outputs = checkpoint::assemble(&store, run_id)?;
    let rendered = format_outputs(&outputs, format)?;

    match out {
        None => Ok(rendered),
        Some(path) => {
            std::fs::write(path, rendered)?;
            match format {
                OutputFormat::Json => Ok(format.to_json(&serde_json::json!({
                    "run_id": run_id,
                    "path": path.to_string_lossy(),
                    "sections": outputs.len(),
                }))),
                OutputFormat::Text | OutputFormat::Csv => Ok(format!(
                    "Wrote {} section(s) to: {}\n",
                    outputs.len(),
                    path.display()
                )),
            }
        }
    }
}

fn cmd_abandon(config: &AppConfig, run_id: &str, format: OutputFormat) -> Result<String> {
    let store = open_checkpoints(config)?;
    checkpoint::abandon(&store, run_id)?;
    match format {
        OutputFormat::Json => Ok(format.to_json(&serde_json::json!({
            "run_id": run_id,
            "abandoned": true,
        }))),
        OutputFormat::Text | OutputFormat::Csv => Ok(format!("Abandoned run: {run_id}\n")),
    }
}

fn cmd_runs(config: &AppConfig, format: OutputFormat) -> Result<String> {
    if !config.checkpoint_path.exists() {
        return Ok(format_runs(&[], format)?);
    }
    let store = SqliteCheckpointStore::open(&config.checkpoint_path)?;
    Ok(format_runs(&store.list_runs()?, format)?)
}

fn cmd_kb_ingest(config: &AppConfig, paths: &[PathBuf], format: OutputFormat) -> Result<String> {
    let store = SqliteVectorStore::open(&config.knowledge_base_path)?;
    let embedder = create_embedder()?;
    let report = ingest_paths(&store, embedder.as_ref(), paths)?;
    info!(
        documents = report.documents.len(),
        skipped = report.skipped.len(),
        "ingest complete"
    );
    Ok(format_ingest(&report, format))
}

fn cmd_kb_stats(config: &AppConfig, format: OutputFormat) -> Result<String> {
    let store = SqliteVectorStore::open(&config.knowledge_base_path)?;
    Ok(format_stats(&store.stats()?, &config.knowledge_base_path, format))
}

fn cmd_init_prompts(dir: Option<&Path>, format: OutputFormat) -> Result<String> {
    let target_dir = dir
        .map(PathBuf::from)
        .or_else(PromptSet::default_dir)
        .ok_or_else(|| {
            CommandError::ExecutionFailed(
                "Could not determine home directory for default prompt path".to_string(),
            )
        })?;

    let written = PromptSet::write_defaults(&target_dir).map_err(|e| {
        CommandError::ExecutionFailed(format!("Failed to write prompt templates: {e}"))
    })?;

    match format {
        OutputFormat::Json => Ok(format.to_json(&serde_json::json!({
            "directory": target_dir.to_string_lossy(),
            "written": written.iter().map(|p| p.to_string_lossy().into_owned()).collect::<Vec<_>>(),
            "count": written.len(),
        }))),
        OutputFormat::Text | OutputFormat::Csv => {
            if written.is_empty() {
                return Ok(format!(
                    "All prompt templates already exist in: {}\n",
                    target_dir.display()
                ));
            }
            let mut output = format!(
                "Wrote {} prompt template(s) to: {}\n",
                written.len(),
                target_dir.display()
            );
            for path in &written {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("unknown");
                output.push_str("  ");
                output.push_str(name);
                output.push('\n');
            }
            output.push_str("\nEdit these files to customize the system prompts.\n");
            Ok(output)
        }
    }
}

fn cmd_config_show(config: &AppConfig, format: OutputFormat) -> Result<String> {
    let text = config.to_toml()?;
    match format {
        OutputFormat::Json => {
            let value: toml::Value = toml::from_str(&text).map_err(|e| {
                CommandError::OutputFormat(format!("TOML re-parse failed: {e}"))
            })?;
            Ok(format.to_json(&value))
        }
        OutputFormat::Text | OutputFormat::Csv => Ok(text),
    }
}
