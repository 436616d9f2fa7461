//! Slipway CLI entry point.
//!
//! This binary is the composition root for the entire system. Responsibilities:
//!
//! 1. **Parse configuration**: load `slipway.toml` (or `--config`) and
//!    validate it.
//! 2. **Wire observability**: configure `tracing-subscriber` with an
//!    `EnvFilter`, text or JSON formatting, and an optional OpenTelemetry OTLP
//!    exporter. All spans and events emitted by every crate in the workspace
//!    flow through this subscriber.
//! 3. **Construct infrastructure**: create the `GithubClient` and
//!    `RegistryClient` and inject them into a `dispatch::Dispatcher`.
//! 4. **Run one command** and map its outcome to an exit code: `0` success,
//!    `1` failure, `2` invalid input.
//!
//! Results go to stdout; logs go to stderr.

mod commands;
mod config;
mod output;
mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;

use crate::commands::SubmitArgs;
use crate::config::SlipwayConfig;
use crate::output::OutputFormat;

#[derive(Parser)]
#[command(name = "slipway")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build container images on GitHub Actions and publish them to GHCR", long_about = None)]
struct Cli {
    /// Config file [default: ./slipway.toml when present]
    #[arg(long, global = true, env = "SLIPWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Result format on stdout
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch a build and wait for the image to be published
    Submit(SubmitArgs),

    /// Show the state of a workflow run and its jobs
    Status {
        /// Source repository as owner/name
        #[arg(long)]
        repo: String,

        /// Workflow run id
        #[arg(long)]
        run: u64,
    },

    /// Check that an image reference exists in its registry
    Verify {
        /// <registry>/<owner>/<image>:<tag>
        image: String,
    },

    /// Ensure a published package is publicly pullable
    MakePublic {
        /// <registry>/<owner>/<image>:<tag>
        image: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = match SlipwayConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err:#}");
            return Ok(ExitCode::from(2));
        }
    };

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let _telemetry = telemetry::init_tracing(cli.json, level, config.otlp_endpoint().as_deref())?;

    let mut stdout = std::io::stdout();
    let out = &mut stdout;
    let format = cli.output;
    match &cli.command {
        Commands::Submit(args) => commands::submit(out, format, &config, args).await,
        Commands::Status { repo, run } => commands::status(out, format, &config, repo, *run).await,
        Commands::Verify { image } => commands::verify(out, format, &config, image).await,
        Commands::MakePublic { image } => commands::make_public(out, format, &config, image).await,
    }
}
