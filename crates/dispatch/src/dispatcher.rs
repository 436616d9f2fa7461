//! The dispatcher: checkout, build, push, sequenced over the port traits.
//!
//! One [`Dispatcher::submit`] call performs one fresh remote build and yields
//! exactly one [`BuildResult`]. The sequence is:
//!
//! 1. validate the request (nothing is contacted when it is invalid),
//! 2. resolve the source ref (checkout reachability),
//! 3. authenticate to the registry with push scope,
//! 4. dispatch the workflow,
//! 5. discover the run the dispatch created,
//! 6. poll it to completion,
//! 7. confirm every tag reached the registry, or classify the failure.
//!
//! The dispatch call itself is never retried. Read-only polling calls are
//! re-attempted when the adapter reports a retryable error, up to
//! [`PollSettings::max_poll_errors`] consecutive times.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tokio::time::{sleep, Instant};
use tracing::{info, info_span, warn, Instrument};

use crate::classify::{classify, first_failed_step, log_tail, FailureKind};
use crate::ports::{ContainerRegistry, PackageVisibility, SourceHost, WorkflowRunner};
use crate::{
    BuildOutcome, BuildRequest, BuildResult, DispatchError, DispatchId, ImageReference,
    PollSettings, PortError, PortResult, RegistryAccess, RegistryHost, RepositoryId, RetryPolicy,
    RunConclusion, RunHandle, RunId, RunReport, RunStatus, Timestamp, Visibility, WaitPhase,
    WorkflowRun,
};

/// How far a submission proceeds before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Wait for the run to complete and verify the published image.
    UntilComplete,
    /// Return as soon as the dispatched run has been found.
    UntilDispatched,
}

/// Where a successful submission stopped.
enum Completion {
    Published(Vec<ImageReference>),
    Dispatched,
}

/// Progress accumulated during one submission; becomes part of the result
/// whatever the outcome.
#[derive(Default)]
struct Progress {
    logs: Vec<String>,
    run: Option<RunHandle>,
}

impl Progress {
    fn log(&mut self, line: impl Into<String>) {
        self.logs.push(line.into());
    }
}

/// Triggers remote builds and reports their published image references.
#[derive(Clone)]
pub struct Dispatcher {
    source: Arc<dyn SourceHost>,
    runner: Arc<dyn WorkflowRunner>,
    registry: Arc<dyn ContainerRegistry>,
    packages: Arc<dyn PackageVisibility>,
    settings: PollSettings,
}

impl Dispatcher {
    /// Creates a dispatcher over the given ports with default poll settings.
    pub fn new(
        source: Arc<dyn SourceHost>,
        runner: Arc<dyn WorkflowRunner>,
        registry: Arc<dyn ContainerRegistry>,
        packages: Arc<dyn PackageVisibility>,
    ) -> Self {
        Self {
            source,
            runner,
            registry,
            packages,
            settings: PollSettings::default(),
        }
    }

    /// Replaces the poll settings.
    pub fn with_settings(mut self, settings: PollSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Returns the active poll settings.
    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    /// Submits `request`, waits for the build, and reports the result.
    pub async fn submit(&self, request: &BuildRequest) -> BuildResult {
        self.submit_with(request, WaitMode::UntilComplete).await
    }

    /// Submits `request`, proceeding as far as `mode` says.
    pub async fn submit_with(&self, request: &BuildRequest, mode: WaitMode) -> BuildResult {
        let dispatch_id = DispatchId::new_random();
        let started_at = Timestamp::now();
        let mut progress = Progress::default();

        let span = info_span!(
            "dispatch.submit",
            dispatch_id = %dispatch_id,
            repository = %request.repository,
            git_ref = %request.git_ref,
        );
        let completion = self
            .execute(request, mode, dispatch_id, &mut progress)
            .instrument(span.clone())
            .await;

        let (outcome, published) = match completion {
            Ok(Completion::Published(references)) => {
                span.in_scope(|| {
                    info!(
                        event = "dispatch.completed",
                        published = references.len(),
                    )
                });
                (BuildOutcome::Published, references)
            }
            Ok(Completion::Dispatched) => (BuildOutcome::Dispatched, Vec::new()),
            Err(error) => {
                span.in_scope(|| {
                    warn!(event = "dispatch.failed", kind = error.kind(), error = %error)
                });
                progress.log(format!("failed: {error}"));
                (BuildOutcome::Failed { error }, Vec::new())
            }
        };

        BuildResult {
            dispatch_id,
            outcome,
            published,
            run: progress.run,
            logs: progress.logs,
            started_at,
            finished_at: Timestamp::now(),
        }
    }

    async fn execute(
        &self,
        request: &BuildRequest,
        mode: WaitMode,
        dispatch_id: DispatchId,
        progress: &mut Progress,
    ) -> Result<Completion, DispatchError> {
        request.validate()?;
        info!(event = "dispatch.validated");
        let references = request.image_references();

        let commit = self
            .source
            .resolve_ref(&request.repository, &request.git_ref)
            .await
            .map_err(|err| match err {
                PortError::NotFound { .. } => DispatchError::CheckoutFailed {
                    reference: request.source_label(),
                    reason: "repository or ref not found".to_string(),
                },
                PortError::Unauthorized { message } => DispatchError::CheckoutFailed {
                    reference: request.source_label(),
                    reason: format!("access denied: {message}"),
                },
                other => DispatchError::infrastructure(other),
            })?;
        progress.log(format!("resolved {} to {commit}", request.source_label()));

        // Every reference shares one repository path, so one token check covers all tags.
        if let Some(first) = references.first() {
            self.registry
                .authenticate(first, RegistryAccess::Push)
                .await
                .map_err(|err| registry_error(&request.registry, err))?;
            progress.log(format!(
                "registry {} accepted push credentials for {}",
                request.registry,
                first.repository_path()
            ));
        }

        let branch = request.git_ref.branch_name();
        let runner = self.runner.as_ref();
        let (repository, workflow) = (&request.repository, &request.workflow);
        let known: HashSet<RunId> = self
            .poll_read(move || runner.list_dispatched_runs(repository, workflow, branch))
            .await
            .map_err(|err| match err {
                PortError::NotFound { what } => DispatchError::CheckoutFailed {
                    reference: format!("{} ({})", request.source_label(), request.workflow),
                    reason: format!("workflow not found: {what}"),
                },
                other => DispatchError::infrastructure(other),
            })?
            .into_iter()
            .map(|run| run.id)
            .collect();

        let dispatched_at = Timestamp::now();
        self.runner
            .dispatch(
                &request.repository,
                &request.workflow,
                &request.git_ref,
                &request.workflow_inputs(dispatch_id),
            )
            .await
            .map_err(|err| match err {
                PortError::NotFound { what } => DispatchError::CheckoutFailed {
                    reference: format!("{} ({})", request.source_label(), request.workflow),
                    reason: format!("workflow or ref not found: {what}"),
                },
                other => DispatchError::infrastructure(other),
            })?;
        info!(event = "dispatch.triggered", workflow = %request.workflow);
        progress.log(format!(
            "dispatched {} on {}",
            request.workflow,
            request.source_label()
        ));

        let run = self
            .discover_run(request, branch, &known, dispatched_at)
            .await?;
        info!(event = "dispatch.run_found", run_id = %run.id, url = %run.html_url);
        progress.log(format!("run {} created: {}", run.id, run.html_url));
        progress.run = Some(RunHandle {
            id: run.id,
            html_url: run.html_url.clone(),
        });

        if mode == WaitMode::UntilDispatched {
            return Ok(Completion::Dispatched);
        }

        let run = self
            .wait_for_completion(&request.repository, run, progress)
            .await?;
        let conclusion = run.conclusion.unwrap_or(RunConclusion::Unknown);

        if conclusion == RunConclusion::Success {
            self.verify_published(&request.registry, &references)
                .await?;
            for reference in &references {
                progress.log(format!("published {reference}"));
            }
            Ok(Completion::Published(references))
        } else {
            Err(self
                .explain_failure(request, &references, &run, conclusion, progress)
                .await)
        }
    }

    /// Finds the run created by a dispatch issued at `dispatched_at`.
    ///
    /// A candidate must not have been listed before the dispatch and must have
    /// been created no earlier than `dispatched_at - clock_skew`. Of several
    /// candidates the oldest wins.
    async fn discover_run(
        &self,
        request: &BuildRequest,
        branch: &str,
        known: &HashSet<RunId>,
        dispatched_at: Timestamp,
    ) -> Result<WorkflowRun, DispatchError> {
        let runner = self.runner.as_ref();
        let repository = &request.repository;
        let workflow = &request.workflow;
        let not_before = dispatched_at.earlier_by(self.settings.clock_skew);
        let start = Instant::now();

        loop {
            let runs = self
                .poll_read(move || runner.list_dispatched_runs(repository, workflow, branch))
                .await
                .map_err(DispatchError::infrastructure)?;

            let found = runs
                .into_iter()
                .filter(|run| !known.contains(&run.id) && run.created_at >= not_before)
                .min_by_key(|run| (run.created_at, run.id));
            if let Some(run) = found {
                return Ok(run);
            }

            let waited = start.elapsed();
            if waited >= self.settings.run_discovery_timeout {
                return Err(DispatchError::Timeout {
                    phase: WaitPhase::RunDiscovery,
                    waited,
                });
            }
            sleep(self.settings.interval).await;
        }
    }

    async fn wait_for_completion(
        &self,
        repository: &RepositoryId,
        mut run: WorkflowRun,
        progress: &mut Progress,
    ) -> Result<WorkflowRun, DispatchError> {
        let runner = self.runner.as_ref();
        let run_id = run.id;
        let start = Instant::now();
        let mut last_status = run.status;
        progress.log(format!("run {run_id} {last_status}"));

        while !run.status.is_terminal() {
            let waited = start.elapsed();
            if waited >= self.settings.build_timeout {
                return Err(DispatchError::Timeout {
                    phase: WaitPhase::Build,
                    waited,
                });
            }
            sleep(self.settings.interval).await;

            run = self
                .poll_read(move || runner.get_run(repository, run_id))
                .await
                .map_err(DispatchError::infrastructure)?;
            if run.status != last_status {
                info!(event = "dispatch.run_status", run_id = %run_id, status = %run.status);
                progress.log(format!("run {run_id} {}", run.status));
                last_status = run.status;
            }
        }

        if let Some(conclusion) = run.conclusion {
            progress.log(format!("run {run_id} concluded {conclusion}"));
        }
        Ok(run)
    }

    async fn verify_published(
        &self,
        registry_host: &RegistryHost,
        references: &[ImageReference],
    ) -> Result<(), DispatchError> {
        let registry = self.registry.as_ref();
        for reference in references {
            let exists = self
                .poll_read(move || registry.manifest_exists(reference))
                .await
                .map_err(|err| registry_error(registry_host, err))?;
            if !exists {
                return Err(DispatchError::PushFailed {
                    image: reference.to_string(),
                    reason: "run succeeded but the tag is not in the registry".to_string(),
                });
            }
        }
        Ok(())
    }

    async fn explain_failure(
        &self,
        request: &BuildRequest,
        references: &[ImageReference],
        run: &WorkflowRun,
        conclusion: RunConclusion,
        progress: &mut Progress,
    ) -> DispatchError {
        let runner = self.runner.as_ref();
        let repository = &request.repository;
        let run_id = run.id;

        let jobs = match self
            .poll_read(move || runner.list_jobs(repository, run_id))
            .await
        {
            Ok(jobs) => jobs,
            Err(err) => {
                warn!(event = "dispatch.jobs_unavailable", run_id = %run_id, error = %err);
                progress.log(format!("could not list jobs of run {run_id}: {err}"));
                Vec::new()
            }
        };

        for job in &jobs {
            if let Some(step) = job.first_failed_step() {
                progress.log(format!(
                    "job '{}' failed at step {} '{}'",
                    job.name, step.number, step.name
                ));
            }
        }

        let mut tail = Vec::new();
        if let Some((job, _)) = first_failed_step(&jobs) {
            match runner.job_log(repository, job.id).await {
                Ok(log) => tail = log_tail(&log, self.settings.log_tail_lines),
                Err(err) => {
                    warn!(event = "dispatch.log_unavailable", job_id = %job.id, error = %err);
                }
            }
        }
        let tail_text = tail.join("\n");
        progress.logs.extend(tail);

        let (kind, step) = classify(conclusion, &jobs, &tail_text);
        let reason = match step {
            Some(step) => format!("{step} failed (run {run_id} concluded {conclusion})"),
            None => format!("run {run_id} concluded {conclusion}"),
        };

        match kind {
            FailureKind::Cancelled => DispatchError::Cancelled,
            FailureKind::Checkout => DispatchError::CheckoutFailed {
                reference: request.source_label(),
                reason,
            },
            FailureKind::Build => DispatchError::BuildFailed { reason },
            FailureKind::RegistryAuth => DispatchError::RegistryAuthFailed {
                registry: request.registry.to_string(),
                reason,
            },
            FailureKind::Push => DispatchError::PushFailed {
                image: references
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
                reason,
            },
        }
    }

    /// Runs a read-only port call, re-attempting retryable failures.
    async fn poll_read<T, F, Fut>(&self, mut op: F) -> PortResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PortResult<T>>,
    {
        let mut failures = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => match err.retry_policy() {
                    RetryPolicy::Retryable { after } if failures < self.settings.max_poll_errors => {
                        failures += 1;
                        let delay = after.unwrap_or(self.settings.interval);
                        warn!(
                            event = "dispatch.poll_retry",
                            attempt = failures,
                            delay = ?delay,
                            error = %err,
                        );
                        sleep(delay).await;
                    }
                    _ => return Err(err),
                },
            }
        }
    }

    // -----------------------------------------------------------------------
    // Supporting operations
    // -----------------------------------------------------------------------

    /// Ensures the package behind `image` is publicly pullable.
    ///
    /// Succeeds when it already is. Otherwise reports
    /// [`DispatchError::VisibilityChangeRequired`] with the settings page,
    /// since the change itself is a manual permission edit.
    pub async fn make_public(&self, image: &ImageReference) -> Result<(), DispatchError> {
        let package = image.repository_path();
        let visibility = self
            .packages
            .visibility(image.namespace(), image.image())
            .await
            .map_err(|err| match err {
                PortError::NotFound { .. } => DispatchError::PackageNotFound {
                    package: package.clone(),
                },
                other => DispatchError::infrastructure(other),
            })?;

        info!(event = "package.visibility", package = %package, visibility = %visibility);
        match visibility {
            Visibility::Public => Ok(()),
            other => Err(DispatchError::VisibilityChangeRequired {
                settings_url: self.packages.settings_url(image.namespace(), image.image()),
                package,
                visibility: other.to_string(),
            }),
        }
    }

    /// Reports the state of a run and its jobs.
    pub async fn status(
        &self,
        repository: &RepositoryId,
        run_id: RunId,
    ) -> Result<RunReport, DispatchError> {
        let runner = self.runner.as_ref();
        let run = self
            .poll_read(move || runner.get_run(repository, run_id))
            .await
            .map_err(DispatchError::infrastructure)?;
        let jobs = if run.status == RunStatus::Queued {
            Vec::new()
        } else {
            self.poll_read(move || runner.list_jobs(repository, run_id))
                .await
                .map_err(DispatchError::infrastructure)?
        };
        Ok(RunReport { run, jobs })
    }

    /// Returns `true` if `image` exists in its registry.
    pub async fn verify(&self, image: &ImageReference) -> Result<bool, DispatchError> {
        let registry = self.registry.as_ref();
        let exists = self
            .poll_read(move || registry.manifest_exists(image))
            .await
            .map_err(|err| registry_error(image.registry(), err))?;
        info!(event = "image.verified", image = %image, exists);
        Ok(exists)
    }
}

fn registry_error(registry: &RegistryHost, err: PortError) -> DispatchError {
    match err {
        PortError::Unauthorized { message } => DispatchError::RegistryAuthFailed {
            registry: registry.to_string(),
            reason: message,
        },
        other => DispatchError::infrastructure(other),
    }
}
