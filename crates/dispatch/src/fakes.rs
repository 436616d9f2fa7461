//! In-memory fakes for the port traits (testing only).
//!
//! Provides [`FakeSourceHost`], [`FakeWorkflowRunner`], [`FakeRegistry`], and
//! [`FakePackages`], which satisfy the trait contracts without any network.
//! The runner plays back a [`RunScript`] for every dispatch it receives.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::ports::{ContainerRegistry, PackageVisibility, SourceHost, WorkflowRunner};
use crate::{
    CommitSha, GitRef, ImageName, ImageReference, JobId, JobSummary, Namespace, PortError,
    PortResult, RegistryAccess, RepositoryId, RunConclusion, RunId, RunStatus, StepSummary,
    Timestamp, Visibility, WorkflowFile, WorkflowInputs, WorkflowRun,
};

// ---------------------------------------------------------------------------
// FakeSourceHost
// ---------------------------------------------------------------------------

/// Source host that knows a fixed set of `owner/repo@ref` pairs.
#[derive(Debug, Default)]
pub struct FakeSourceHost {
    refs: Mutex<HashSet<(String, String)>>,
}

impl FakeSourceHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `git_ref` resolvable in `repository`.
    pub fn with_ref(self, repository: &str, git_ref: &str) -> Self {
        self.refs
            .lock()
            .unwrap()
            .insert((repository.to_string(), git_ref.to_string()));
        self
    }
}

#[async_trait]
impl SourceHost for FakeSourceHost {
    async fn resolve_ref(
        &self,
        repository: &RepositoryId,
        git_ref: &GitRef,
    ) -> PortResult<CommitSha> {
        let refs = self.refs.lock().unwrap();
        if refs.contains(&(repository.to_string(), git_ref.to_string())) {
            Ok(CommitSha::new("0123456789abcdef0123456789abcdef01234567").unwrap())
        } else {
            Err(PortError::NotFound {
                what: format!("{repository}@{git_ref}"),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// FakeWorkflowRunner
// ---------------------------------------------------------------------------

/// How a dispatched run behaves.
#[derive(Debug, Clone)]
pub struct RunScript {
    /// Number of listings after the dispatch before the run shows up.
    /// `None` means it never does.
    pub appears_after_listings: Option<u32>,
    /// Number of `get_run` calls that report `in_progress` before the run
    /// completes. `None` means it never completes.
    pub polls_until_complete: Option<u32>,
    /// Conclusion once completed.
    pub conclusion: RunConclusion,
    /// Jobs reported for the run.
    pub jobs: Vec<JobSummary>,
    /// Log returned for every job.
    pub log: String,
}

impl RunScript {
    /// A run that appears immediately and succeeds after two polls.
    pub fn succeeding() -> Self {
        Self {
            appears_after_listings: Some(0),
            polls_until_complete: Some(2),
            conclusion: RunConclusion::Success,
            jobs: vec![job("build", &[("Set up job", RunConclusion::Success)])],
            log: String::new(),
        }
    }

    /// A run that fails at `step` in job `build`, with `log` as its job log.
    pub fn failing_at(step: &str, log: &str) -> Self {
        Self {
            conclusion: RunConclusion::Failure,
            jobs: vec![job(
                "build",
                &[
                    ("Set up job", RunConclusion::Success),
                    (step, RunConclusion::Failure),
                ],
            )],
            log: log.to_string(),
            ..Self::succeeding()
        }
    }
}

/// Builds a completed job from `(step name, conclusion)` pairs.
pub fn job(name: &str, steps: &[(&str, RunConclusion)]) -> JobSummary {
    let failed = steps.iter().any(|(_, c)| c.is_failure());
    JobSummary {
        id: JobId::new(1),
        name: name.to_string(),
        status: RunStatus::Completed,
        conclusion: Some(if failed {
            RunConclusion::Failure
        } else {
            RunConclusion::Success
        }),
        steps: steps
            .iter()
            .enumerate()
            .map(|(i, (step, conclusion))| StepSummary {
                number: i as u32 + 1,
                name: step.to_string(),
                status: RunStatus::Completed,
                conclusion: Some(*conclusion),
            })
            .collect(),
    }
}

/// The `head_branch` GitHub records for a run dispatched on `git_ref`.
fn recorded_head_branch(git_ref: &str) -> &str {
    ["refs/heads/", "refs/tags/"]
        .iter()
        .find_map(|prefix| git_ref.strip_prefix(prefix))
        .unwrap_or(git_ref)
}

/// A recorded `dispatch` call.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchCall {
    pub repository: String,
    pub workflow: String,
    pub git_ref: String,
    pub inputs: WorkflowInputs,
}

#[derive(Debug)]
struct ScriptedRun {
    run: WorkflowRun,
    listings: u32,
    polls: u32,
}

#[derive(Debug)]
struct RunnerState {
    script: RunScript,
    workflows: HashSet<String>,
    preexisting: Vec<WorkflowRun>,
    dispatches: Vec<DispatchCall>,
    runs: HashMap<RunId, ScriptedRun>,
    next_id: u64,
    read_failures: VecDeque<PortError>,
    dispatch_failure: Option<PortError>,
}

/// Actions runner fake that plays back one [`RunScript`] per dispatch.
#[derive(Debug)]
pub struct FakeWorkflowRunner {
    state: Mutex<RunnerState>,
}

impl FakeWorkflowRunner {
    /// Creates a runner that accepts dispatches of `workflow`.
    pub fn new(workflow: &str, script: RunScript) -> Self {
        Self {
            state: Mutex::new(RunnerState {
                script,
                workflows: HashSet::from([workflow.to_string()]),
                preexisting: Vec::new(),
                dispatches: Vec::new(),
                runs: HashMap::new(),
                next_id: 1000,
                read_failures: VecDeque::new(),
                dispatch_failure: None,
            }),
        }
    }

    /// Adds an older, already-completed run to every listing.
    pub fn with_preexisting_run(self, id: u64) -> Self {
        self.state.lock().unwrap().preexisting.push(WorkflowRun {
            id: RunId::new(id),
            status: RunStatus::Completed,
            conclusion: Some(RunConclusion::Success),
            head_branch: Some("main".to_string()),
            head_sha: None,
            html_url: format!("https://github.com/fake/runs/{id}"),
            created_at: Timestamp::now(),
        });
        self
    }

    /// Makes the next read calls fail with `errors`, in order.
    pub fn with_read_failures(self, errors: Vec<PortError>) -> Self {
        self.state.lock().unwrap().read_failures = errors.into();
        self
    }

    /// Makes the next `dispatch` call fail with `error`.
    pub fn with_dispatch_failure(self, error: PortError) -> Self {
        self.state.lock().unwrap().dispatch_failure = Some(error);
        self
    }

    /// Returns every `dispatch` call received so far.
    pub fn dispatches(&self) -> Vec<DispatchCall> {
        self.state.lock().unwrap().dispatches.clone()
    }

    fn take_read_failure(state: &mut RunnerState) -> PortResult<()> {
        match state.read_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl WorkflowRunner for FakeWorkflowRunner {
    async fn dispatch(
        &self,
        repository: &RepositoryId,
        workflow: &WorkflowFile,
        git_ref: &GitRef,
        inputs: &WorkflowInputs,
    ) -> PortResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.dispatch_failure.take() {
            return Err(err);
        }
        if !state.workflows.contains(workflow.as_str()) {
            return Err(PortError::NotFound {
                what: format!("workflow {workflow}"),
            });
        }

        state.dispatches.push(DispatchCall {
            repository: repository.to_string(),
            workflow: workflow.to_string(),
            git_ref: git_ref.to_string(),
            inputs: inputs.clone(),
        });

        let id = RunId::new(state.next_id);
        state.next_id += 1;
        let run = WorkflowRun {
            id,
            status: RunStatus::Queued,
            conclusion: None,
            head_branch: Some(recorded_head_branch(git_ref.as_str()).to_string()),
            head_sha: None,
            html_url: format!("https://github.com/{repository}/actions/runs/{id}"),
            created_at: Timestamp::now(),
        };
        state.runs.insert(
            id,
            ScriptedRun {
                run,
                listings: 0,
                polls: 0,
            },
        );
        Ok(())
    }

    async fn list_dispatched_runs(
        &self,
        _repository: &RepositoryId,
        workflow: &WorkflowFile,
        branch: &str,
    ) -> PortResult<Vec<WorkflowRun>> {
        let mut state = self.state.lock().unwrap();
        Self::take_read_failure(&mut state)?;
        if !state.workflows.contains(workflow.as_str()) {
            return Err(PortError::NotFound {
                what: format!("workflow {workflow}"),
            });
        }

        let appears_after = state.script.appears_after_listings;
        let mut runs: Vec<WorkflowRun> = Vec::new();
        for scripted in state.runs.values_mut() {
            let visible = appears_after.is_some_and(|n| scripted.listings >= n);
            scripted.listings += 1;
            if visible {
                runs.push(scripted.run.clone());
            }
        }
        runs.extend(state.preexisting.iter().cloned());
        runs.retain(|run| run.head_branch.as_deref() == Some(branch));
        runs.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(runs)
    }

    async fn get_run(&self, _repository: &RepositoryId, run: RunId) -> PortResult<WorkflowRun> {
        let mut state = self.state.lock().unwrap();
        Self::take_read_failure(&mut state)?;

        let script = state.script.clone();
        let scripted = state.runs.get_mut(&run).ok_or_else(|| PortError::NotFound {
            what: format!("run {run}"),
        })?;
        scripted.polls += 1;
        match script.polls_until_complete {
            Some(n) if scripted.polls > n => {
                scripted.run.status = RunStatus::Completed;
                scripted.run.conclusion = Some(script.conclusion);
            }
            _ => scripted.run.status = RunStatus::InProgress,
        }
        Ok(scripted.run.clone())
    }

    async fn list_jobs(
        &self,
        _repository: &RepositoryId,
        run: RunId,
    ) -> PortResult<Vec<JobSummary>> {
        let mut state = self.state.lock().unwrap();
        Self::take_read_failure(&mut state)?;
        if !state.runs.contains_key(&run) {
            return Err(PortError::NotFound {
                what: format!("run {run}"),
            });
        }
        Ok(state.script.jobs.clone())
    }

    async fn job_log(&self, _repository: &RepositoryId, _job: JobId) -> PortResult<String> {
        Ok(self.state.lock().unwrap().script.log.clone())
    }
}

// ---------------------------------------------------------------------------
// FakeRegistry
// ---------------------------------------------------------------------------

/// Registry fake with a credential switch and a set of present manifests.
#[derive(Debug)]
pub struct FakeRegistry {
    credentials_valid: bool,
    manifests: Mutex<HashSet<String>>,
    auth_calls: Mutex<Vec<(String, RegistryAccess)>>,
}

impl FakeRegistry {
    /// A registry that accepts the configured credentials.
    pub fn new() -> Self {
        Self {
            credentials_valid: true,
            manifests: Mutex::new(HashSet::new()),
            auth_calls: Mutex::new(Vec::new()),
        }
    }

    /// A registry that rejects the configured credentials.
    pub fn rejecting() -> Self {
        Self {
            credentials_valid: false,
            ..Self::new()
        }
    }

    /// Marks `reference` (e.g. `ghcr.io/o/app:latest`) as present.
    pub fn with_manifest(self, reference: &str) -> Self {
        self.manifests.lock().unwrap().insert(reference.to_string());
        self
    }

    /// Returns the `(repository path, access)` of every authenticate call.
    pub fn auth_calls(&self) -> Vec<(String, RegistryAccess)> {
        self.auth_calls.lock().unwrap().clone()
    }
}

impl Default for FakeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRegistry for FakeRegistry {
    async fn authenticate(
        &self,
        image: &ImageReference,
        access: RegistryAccess,
    ) -> PortResult<()> {
        self.auth_calls
            .lock()
            .unwrap()
            .push((image.repository_path(), access));
        if self.credentials_valid {
            Ok(())
        } else {
            Err(PortError::Unauthorized {
                message: "bad credentials".to_string(),
            })
        }
    }

    async fn manifest_exists(&self, image: &ImageReference) -> PortResult<bool> {
        if !self.credentials_valid {
            return Err(PortError::Unauthorized {
                message: "bad credentials".to_string(),
            });
        }
        Ok(self.manifests.lock().unwrap().contains(&image.to_string()))
    }
}

// ---------------------------------------------------------------------------
// FakePackages
// ---------------------------------------------------------------------------

/// Package metadata fake keyed by `owner/image`.
#[derive(Debug, Default)]
pub struct FakePackages {
    packages: Mutex<HashMap<String, Visibility>>,
}

impl FakePackages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `owner/image` with `visibility`.
    pub fn with_package(self, path: &str, visibility: Visibility) -> Self {
        self.packages
            .lock()
            .unwrap()
            .insert(path.to_string(), visibility);
        self
    }
}

#[async_trait]
impl PackageVisibility for FakePackages {
    async fn visibility(
        &self,
        namespace: &Namespace,
        image: &ImageName,
    ) -> PortResult<Visibility> {
        let path = format!("{namespace}/{image}");
        self.packages
            .lock()
            .unwrap()
            .get(&path)
            .copied()
            .ok_or(PortError::NotFound { what: path })
    }

    fn settings_url(&self, namespace: &Namespace, image: &ImageName) -> String {
        format!("https://github.com/users/{namespace}/packages/container/{image}/settings")
    }
}
