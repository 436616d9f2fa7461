//! Rendering of command results as text or JSON on stdout.

use std::io::{self, Write};

use clap::ValueEnum;
use dispatch::{BuildOutcome, BuildResult, DispatchError, ImageReference, RunReport};
use serde::Serialize;
use serde_json::json;

/// `--output` format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

fn write_json(out: &mut dyn Write, value: &impl Serialize) -> io::Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)
}

/// Renders the result of `submit`.
pub fn build_result(out: &mut dyn Write, format: OutputFormat, result: &BuildResult) -> io::Result<()> {
    if format == OutputFormat::Json {
        return write_json(out, result);
    }

    match &result.outcome {
        BuildOutcome::Published => {
            for image in &result.published {
                writeln!(out, "{image}")?;
            }
        }
        BuildOutcome::Dispatched => match &result.run {
            Some(run) => writeln!(out, "dispatched run {}: {}", run.id, run.html_url)?,
            None => writeln!(out, "dispatched {}", result.dispatch_id)?,
        },
        BuildOutcome::Failed { error } => {
            write_error_text(out, error)?;
            if let Some(run) = &result.run {
                writeln!(out, "  run: {}", run.html_url)?;
            }
            for line in &result.logs {
                writeln!(out, "  | {line}")?;
            }
        }
    }
    Ok(())
}

/// Renders the result of `status`.
pub fn run_report(out: &mut dyn Write, format: OutputFormat, report: &RunReport) -> io::Result<()> {
    if format == OutputFormat::Json {
        return write_json(out, report);
    }

    let run = &report.run;
    let conclusion = run
        .conclusion
        .map(|c| c.to_string())
        .unwrap_or_else(|| "-".to_string());
    writeln!(out, "run {} {} {}", run.id, run.status, conclusion)?;
    writeln!(out, "  {}", run.html_url)?;
    for job in &report.jobs {
        let conclusion = job.conclusion.map(|c| c.to_string()).unwrap_or_default();
        writeln!(out, "  job {} {} {}", job.name, job.status, conclusion)?;
        for step in &job.steps {
            let conclusion = step.conclusion.map(|c| c.to_string()).unwrap_or_default();
            writeln!(out, "    {:>2}. {} {}", step.number, step.name, conclusion)?;
        }
    }
    Ok(())
}

/// Renders the result of `verify`.
pub fn verification(
    out: &mut dyn Write,
    format: OutputFormat,
    image: &ImageReference,
    exists: bool,
) -> io::Result<()> {
    match format {
        OutputFormat::Json => write_json(out, &json!({ "image": image.to_string(), "exists": exists })),
        OutputFormat::Text if exists => writeln!(out, "{image} exists"),
        OutputFormat::Text => writeln!(out, "{image} not found"),
    }
}

/// Renders the success of `make-public`.
pub fn made_public(out: &mut dyn Write, format: OutputFormat, image: &ImageReference) -> io::Result<()> {
    match format {
        OutputFormat::Json => write_json(out, &json!({ "image": image.to_string(), "visibility": "public" })),
        OutputFormat::Text => writeln!(out, "{}/{} is public", image.namespace(), image.image()),
    }
}

/// Renders a failure of any command.
pub fn error(out: &mut dyn Write, format: OutputFormat, error: &DispatchError) -> io::Result<()> {
    match format {
        OutputFormat::Json => write_json(
            out,
            &json!({ "status": "failed", "error": { "kind": error.kind(), "message": error.to_string(), "detail": error } }),
        ),
        OutputFormat::Text => write_error_text(out, error),
    }
}

fn write_error_text(out: &mut dyn Write, error: &DispatchError) -> io::Result<()> {
    writeln!(out, "error[{}]: {error}", error.kind())
}
