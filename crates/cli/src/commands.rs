//! Command handlers and the composition root.
//!
//! [`build_dispatcher`] constructs the concrete GitHub and registry clients
//! and injects them into a [`Dispatcher`]. Handlers turn CLI arguments into
//! domain values, run one dispatcher operation, and render the outcome.

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use dispatch::{
    BuildRequest, DispatchError, Dispatcher, GitRef, ImageName, ImageReference, ImageTag,
    Namespace, Platform, RegistryHost, RepositoryId, RunId, SourcePath, WaitMode, WorkflowFile,
};
use github::{GithubClient, GithubConfig, RegistryClient, RegistryCredentials, Secret};
use tracing::debug;

use crate::config::SlipwayConfig;
use crate::output::{self, OutputFormat};

/// Exit code for invalid input (bad arguments, request, or configuration).
const EXIT_INVALID_INPUT: u8 = 2;

/// Arguments of `slipway submit`.
#[derive(Debug, Clone, Args)]
pub struct SubmitArgs {
    /// Source repository as owner/name
    #[arg(long)]
    pub repo: String,

    /// Branch (or ref) to build
    #[arg(long = "ref", value_name = "REF")]
    pub git_ref: String,

    /// Image name, without registry or owner
    #[arg(long)]
    pub image: String,

    /// Image tag; repeat for several
    #[arg(long = "tag", value_name = "TAG", required = true)]
    pub tags: Vec<String>,

    /// Target platform (os/arch); repeat for several [default: from config]
    #[arg(long = "platform", value_name = "PLATFORM")]
    pub platforms: Vec<String>,

    /// Dockerfile path relative to the repository root
    #[arg(long)]
    pub dockerfile: Option<String>,

    /// Build context relative to the repository root
    #[arg(long)]
    pub context: Option<String>,

    /// Workflow file to dispatch
    #[arg(long)]
    pub workflow: Option<String>,

    /// Image owner (defaults to the repository owner)
    #[arg(long)]
    pub owner: Option<String>,

    /// Registry host
    #[arg(long)]
    pub registry: Option<String>,

    /// Return once the run has started instead of waiting for it
    #[arg(long)]
    pub no_wait: bool,
}

/// Maps a failure to the process exit code.
pub fn exit_code(error: &DispatchError) -> ExitCode {
    match error {
        DispatchError::InvalidRequest { .. } | DispatchError::Configuration { .. } => {
            ExitCode::from(EXIT_INVALID_INPUT)
        }
        _ => ExitCode::FAILURE,
    }
}

/// Builds the dispatcher over the live GitHub and registry clients.
///
/// `registry_owner` is the login used for registry basic auth when
/// `registry.username` is not configured. Registry credentials are bound to
/// `registry.host`; images on any other host are accessed anonymously.
pub fn build_dispatcher(
    config: &SlipwayConfig,
    token: Option<Secret>,
    registry_owner: &str,
) -> Result<Dispatcher> {
    let timeout = config.request_timeout();
    let github = Arc::new(
        GithubClient::new(GithubConfig {
            api_url: config.github.api_url.clone(),
            token: token.clone(),
            timeout,
        })
        .context("Failed to create GitHub client")?,
    );

    // The token only ever goes to the configured registry host.
    let credentials = token
        .zip(RegistryHost::new(config.registry.host.as_str()))
        .map(|(token, registry)| RegistryCredentials {
            registry,
            username: config
                .registry
                .username
                .clone()
                .unwrap_or_else(|| registry_owner.to_string()),
            token,
        });
    let registry = Arc::new(
        RegistryClient::new(credentials, timeout).context("Failed to create registry client")?,
    );
    debug!(
        api_url = %config.github.api_url,
        registry_auth = registry.has_credentials(),
        "constructed infrastructure clients"
    );

    Ok(
        Dispatcher::new(github.clone(), github.clone(), registry, github)
            .with_settings(config.poll_settings()),
    )
}

fn require_token(config: &SlipwayConfig) -> Result<Secret, DispatchError> {
    config.token().ok_or_else(|| DispatchError::Configuration {
        message: format!(
            "no GitHub token found; set {} (or GITHUB_TOKEN / GH_TOKEN)",
            config.github.token_env
        ),
    })
}

/// Merges flags over config defaults into a [`BuildRequest`].
///
/// Every empty value is reported at once; format rules are left to
/// [`BuildRequest::validate`], which the dispatcher runs before contacting
/// anything.
pub fn build_request(args: &SubmitArgs, config: &SlipwayConfig) -> Result<BuildRequest, DispatchError> {
    let mut problems = Vec::new();
    let p = &mut problems;

    let repository = present(RepositoryId::new(args.repo.as_str()), "--repo", p);
    let git_ref = present(GitRef::new(args.git_ref.as_str()), "--ref", p);
    let image = present(ImageName::new(args.image.as_str()), "--image", p);
    let workflow = present(
        WorkflowFile::new(args.workflow.as_deref().unwrap_or(&config.defaults.workflow)),
        "--workflow",
        p,
    );
    let dockerfile = present(
        SourcePath::new(args.dockerfile.as_deref().unwrap_or(&config.defaults.dockerfile)),
        "--dockerfile",
        p,
    );
    let context = present(
        SourcePath::new(args.context.as_deref().unwrap_or(&config.defaults.context)),
        "--context",
        p,
    );
    let registry = present(
        RegistryHost::new(args.registry.as_deref().unwrap_or(&config.registry.host)),
        "--registry",
        p,
    );

    let platform_values = if args.platforms.is_empty() {
        &config.defaults.platforms
    } else {
        &args.platforms
    };
    let mut platforms = Vec::new();
    for value in platform_values {
        platforms.extend(present(Platform::new(value.as_str()), "--platform", p));
    }
    let mut tags = Vec::new();
    for value in &args.tags {
        tags.extend(present(ImageTag::new(value.as_str()), "--tag", p));
    }
    let namespace = match args.owner.as_deref() {
        Some(owner) => present(Namespace::new(owner), "--owner", p),
        None => None,
    };

    match (repository, git_ref, image, workflow, dockerfile, context, registry) {
        (
            Some(repository),
            Some(git_ref),
            Some(image),
            Some(workflow),
            Some(dockerfile),
            Some(context),
            Some(registry),
        ) if problems.is_empty() => Ok(BuildRequest {
            repository,
            git_ref,
            workflow,
            image,
            tags,
            platforms,
            dockerfile,
            context,
            registry,
            namespace,
        }),
        _ => Err(DispatchError::InvalidRequest { problems }),
    }
}

fn present<T>(value: Option<T>, flag: &str, problems: &mut Vec<String>) -> Option<T> {
    if value.is_none() {
        problems.push(format!("{flag} must not be empty"));
    }
    value
}

fn parse_image(input: &str) -> Result<ImageReference, DispatchError> {
    ImageReference::parse(input).map_err(|err| DispatchError::InvalidRequest {
        problems: vec![err.to_string()],
    })
}

fn fail(out: &mut dyn Write, format: OutputFormat, error: &DispatchError) -> Result<ExitCode> {
    output::error(out, format, error)?;
    Ok(exit_code(error))
}

/// `slipway submit`.
pub async fn submit(
    out: &mut dyn Write,
    format: OutputFormat,
    config: &SlipwayConfig,
    args: &SubmitArgs,
) -> Result<ExitCode> {
    let request = match build_request(args, config) {
        Ok(request) => request,
        Err(err) => return fail(out, format, &err),
    };
    let token = match require_token(config) {
        Ok(token) => token,
        Err(err) => return fail(out, format, &err),
    };

    let owner = request.effective_namespace();
    let dispatcher = build_dispatcher(config, Some(token), owner.as_str())?;
    let mode = if args.no_wait {
        WaitMode::UntilDispatched
    } else {
        WaitMode::UntilComplete
    };

    let result = dispatcher.submit_with(&request, mode).await;
    output::build_result(out, format, &result)?;
    Ok(match result.error() {
        Some(err) => exit_code(err),
        None => ExitCode::SUCCESS,
    })
}

/// `slipway status`.
pub async fn status(
    out: &mut dyn Write,
    format: OutputFormat,
    config: &SlipwayConfig,
    repo: &str,
    run: u64,
) -> Result<ExitCode> {
    let repository = match RepositoryId::new(repo).filter(RepositoryId::is_well_formed) {
        Some(repository) => repository,
        None => {
            let err = DispatchError::InvalidRequest {
                problems: vec![format!("repository '{repo}' is not in owner/name form")],
            };
            return fail(out, format, &err);
        }
    };
    let token = match require_token(config) {
        Ok(token) => token,
        Err(err) => return fail(out, format, &err),
    };

    let dispatcher = build_dispatcher(config, Some(token), repository.owner())?;
    match dispatcher.status(&repository, RunId::new(run)).await {
        Ok(report) => {
            output::run_report(out, format, &report)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => fail(out, format, &err),
    }
}

/// `slipway verify`; runs anonymously when no token is available.
pub async fn verify(
    out: &mut dyn Write,
    format: OutputFormat,
    config: &SlipwayConfig,
    image: &str,
) -> Result<ExitCode> {
    let image = match parse_image(image) {
        Ok(image) => image,
        Err(err) => return fail(out, format, &err),
    };

    let dispatcher = build_dispatcher(config, config.token(), image.namespace().as_str())?;
    match dispatcher.verify(&image).await {
        Ok(exists) => {
            output::verification(out, format, &image, exists)?;
            Ok(if exists {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Err(err) => fail(out, format, &err),
    }
}

/// `slipway make-public`.
pub async fn make_public(
    out: &mut dyn Write,
    format: OutputFormat,
    config: &SlipwayConfig,
    image: &str,
) -> Result<ExitCode> {
    let image = match parse_image(image) {
        Ok(image) => image,
        Err(err) => return fail(out, format, &err),
    };
    let token = match require_token(config) {
        Ok(token) => token,
        Err(err) => return fail(out, format, &err),
    };

    let dispatcher = build_dispatcher(config, Some(token), image.namespace().as_str())?;
    match dispatcher.make_public(&image).await {
        Ok(()) => {
            output::made_public(out, format, &image)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => fail(out, format, &err),
    }
}
