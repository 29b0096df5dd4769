//! Output rendering for CLI commands.

#![allow(clippy::format_push_string)]

use std::fmt::Write as _;
use std::path::Path;

use serde::Serialize;

use crate::agent::RunReport;
use crate::core::{RunHeader, SectionOutput, SectionStatus};
use crate::error::CommandError;
use crate::retrieval::ingest::IngestReport;
use crate::retrieval::store::StoreStats;

/// How command results are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text.
    #[default]
    Text,
    /// Pretty-printed JSON.
    Json,
    /// CSV (tabular commands only; others fall back to text).
    Csv,
}

impl OutputFormat {
    /// Parses a format name, defaulting to text.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            "csv" => Self::Csv,
            _ => Self::Text,
        }
    }

    /// Serializes `value` as pretty JSON with a trailing newline.
    #[must_use]
    pub fn to_json<T: Serialize + ?Sized>(&self, value: &T) -> String {
        serde_json::to_string_pretty(value).map_or_else(
            |e| format!("{{\"error\": \"JSON serialization failed: {e}\"}}\n"),
            |json| json + "\n",
        )
    }
}

fn csv_err(e: impl std::fmt::Display) -> CommandError {
    CommandError::OutputFormat(format!("CSV serialization failed: {e}"))
}

fn finish_csv(writer: csv::Writer<Vec<u8>>) -> Result<String, CommandError> {
    let bytes = writer.into_inner().map_err(csv_err)?;
    String::from_utf8(bytes).map_err(csv_err)
}

/// Renders a run report.
#[must_use]
pub fn format_report(report: &RunReport, format: OutputFormat) -> String {
    if format == OutputFormat::Json {
        return format.to_json(report);
    }

    let mut out = format!(
        "Run {} ({})\nInput: {}\n",
        report.run_id, report.lifecycle, report.input_document_ref
    );
    let _ = writeln!(
        out,
        "Sections: {} total, {} done, {} failed, {} pending",
        report.sections.len(),
        report.count(SectionStatus::Done),
        report.count(SectionStatus::Failed),
        report.sections.len()
            - report.count(SectionStatus::Done)
            - report.count(SectionStatus::Failed),
    );
    let low = report.low_confidence();
    if low > 0 {
        let _ = writeln!(out, "Low-confidence verdicts: {low}");
    }
    if report.usage.total_tokens > 0 {
        let _ = writeln!(out, "Tokens: {}", report.usage.total_tokens);
    }
    if report.cancelled {
        out.push_str("Cancelled: resume with `rfp-agent resume <run-id>`\n");
    }

    let failed: Vec<_> = report
        .sections
        .iter()
        .filter(|s| s.status == SectionStatus::Failed)
        .collect();
    if !failed.is_empty() {
        out.push_str("\nFailed sections:\n");
        for s in failed {
            let marker = if s.permanently_failed { " (permanent)" } else { "" };
            let _ = writeln!(
                out,
                "  {} [attempts {}]{marker}: {}",
                s.id,
                s.attempt_count,
                s.last_error.as_deref().unwrap_or("unknown error")
            );
        }
        if report.retryable().next().is_some() {
            out.push_str("Retry with `rfp-agent resume <run-id> --retry-failed`\n");
        }
    }
    out
}

/// Renders assembled section outputs.
///
/// # Errors
///
/// Returns [`CommandError::OutputFormat`] if CSV encoding fails.
pub fn format_outputs(outputs: &[SectionOutput], format: OutputFormat) -> Result<String, CommandError> {
    match format {
        OutputFormat::Json => Ok(format.to_json(outputs)),
        OutputFormat::Csv => {
            let mut writer = csv::Writer::from_writer(Vec::new());
            writer
                .write_record([
                    "id",
                    "requirement",
                    "status",
                    "verdict",
                    "low_confidence",
                    "response",
                    "justification",
                    "sources",
                ])
                .map_err(csv_err)?;
            for o in outputs {
                writer
                    .write_record([
                        o.id.as_str(),
                        o.requirement_text.as_str(),
                        o.status.as_str(),
                        o.verdict.map(|v| v.as_str()).unwrap_or_default(),
                        if o.low_confidence { "true" } else { "false" },
                        o.generated_text.as_deref().unwrap_or_default(),
                        o.justification.as_deref().unwrap_or_default(),
                        o.sources.join(" ").as_str(),
                    ])
                    .map_err(csv_err)?;
            }
            finish_csv(writer)
        }
        OutputFormat::Text => {
            let mut out = String::new();
            for o in outputs {
                let heading = o.requirement_text.lines().next().unwrap_or_default();
                out.push_str(&format!("## {} {heading}\n\n", o.id));
                match (o.status, o.generated_text.as_deref()) {
                    (SectionStatus::Done, Some(text)) => {
                        if let Some(verdict) = o.verdict {
                            let low = if o.low_confidence { " (low confidence)" } else { "" };
                            out.push_str(&format!("Compliance: {verdict}{low}\n\n"));
                        }
                        out.push_str(text.trim());
                        out.push_str("\n\n");
                        if !o.sources.is_empty() {
                            out.push_str(&format!("Sources: {}\n\n", o.sources.join(", ")));
                        }
                    }
                    (status, _) => {
                        out.push_str(&format!("[{status}]"));
                        if let Some(err) = &o.last_error {
                            out.push_str(&format!(" {err}"));
                        }
                        out.push_str("\n\n");
                    }
                }
            }
            Ok(out)
        }
    }
}

/// Renders stored runs, newest first.
///
/// # Errors
///
/// Returns [`CommandError::OutputFormat`] if CSV encoding fails.
pub fn format_runs(runs: &[RunHeader], format: OutputFormat) -> Result<String, CommandError> {
    match format {
        OutputFormat::Json => {
            let rows: Vec<_> = runs
                .iter()
                .map(|h| {
                    serde_json::json!({
                        "run_id": h.run_id,
                        "input_document_ref": h.input_document_ref,
                        "sections": h.sections.len(),
                        "provider": h.provider_config.kind,
                        "model": h.provider_config.model,
                        "created_at": h.created_at,
                        "lifecycle": h.lifecycle(),
                    })
                })
                .collect();
            Ok(format.to_json(&rows))
        }
        OutputFormat::Csv => {
            let mut writer = csv::Writer::from_writer(Vec::new());
            writer
                .write_record(["run_id", "input", "sections", "created_at", "lifecycle"])
                .map_err(csv_err)?;
            for h in runs {
                writer
                    .write_record([
                        h.run_id.clone(),
                        h.input_document_ref.clone(),
                        h.sections.len().to_string(),
                        h.created_at.to_rfc3339(),
                        h.lifecycle().to_string(),
                    ])
                    .map_err(csv_err)?;
            }
            finish_csv(writer)
        }
        OutputFormat::Text => {
            if runs.is_empty() {
                return Ok("No runs found.\n".to_string());
            }
            let mut out = String::new();
            for h in runs {
                let _ = writeln!(
                    out,
                    "{}  {:<11}  {:>4} sections  {}  {}",
                    h.run_id,
                    h.lifecycle(),
                    h.sections.len(),
                    h.created_at.format("%Y-%m-%d %H:%M"),
                    h.input_document_ref
                );
            }
            Ok(out)
        }
    }
}

/// Renders an ingestion summary.
#[must_use]
pub fn format_ingest(report: &IngestReport, format: OutputFormat) -> String {
    if format == OutputFormat::Json {
        return format.to_json(report);
    }
    let chunks: usize = report.documents.iter().map(|d| d.chunks).sum();
    let mut out = format!(
        "Ingested {} document(s), {chunks} chunk(s)\n",
        report.documents.len()
    );
    for d in &report.documents {
        let _ = writeln!(out, "  {} ({} chunks)", d.document_id, d.chunks);
    }
    for path in &report.skipped {
        let _ = writeln!(out, "  skipped: {}", path.display());
    }
    out
}

/// Renders knowledge-base statistics.
#[must_use]
pub fn format_stats(stats: &StoreStats, path: &Path, format: OutputFormat) -> String {
    if format == OutputFormat::Json {
        return format.to_json(&serde_json::json!({
            "path": path.to_string_lossy(),
            "chunks": stats.chunks,
            "documents": stats.documents,
        }));
    }
    format!(
        "Knowledge base: {}\nDocuments: {}\nChunks: {}\n",
        path.display(),
        stats.documents,
        stats.chunks
    )
}
