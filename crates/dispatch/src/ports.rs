//! Port traits implemented by infrastructure crates.
//!
//! The [`crate::Dispatcher`] depends only on these traits. The `github` crate
//! supplies the production implementations; [`crate::fakes`] supplies
//! in-memory ones for tests.
//!
//! All methods are async and object-safe (via `async_trait`) so the
//! dispatcher can hold them as `Arc<dyn Trait>`.

use async_trait::async_trait;

use crate::{
    CommitSha, GitRef, ImageName, ImageReference, JobId, JobSummary, Namespace, PortResult,
    RegistryAccess, RepositoryId, RunId, Visibility, WorkflowFile, WorkflowInputs, WorkflowRun,
};

/// Source control host: answers whether a repository and ref can be checked out.
#[async_trait]
pub trait SourceHost: Send + Sync {
    /// Resolves `git_ref` in `repository` to a commit.
    ///
    /// Returns [`crate::PortError::NotFound`] when either the repository or the
    /// ref does not exist (or is not visible to the configured credentials).
    async fn resolve_ref(&self, repository: &RepositoryId, git_ref: &GitRef)
        -> PortResult<CommitSha>;
}

/// Remote build agent scheduler (GitHub Actions).
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    /// Triggers `workflow` on `git_ref` with `inputs`.
    ///
    /// The remote API does not return the created run; callers discover it
    /// with [`WorkflowRunner::list_dispatched_runs`].
    async fn dispatch(
        &self,
        repository: &RepositoryId,
        workflow: &WorkflowFile,
        git_ref: &GitRef,
        inputs: &WorkflowInputs,
    ) -> PortResult<()>;

    /// Lists the most recent `workflow_dispatch` runs of `workflow` on
    /// `branch`, newest first.
    async fn list_dispatched_runs(
        &self,
        repository: &RepositoryId,
        workflow: &WorkflowFile,
        branch: &str,
    ) -> PortResult<Vec<WorkflowRun>>;

    /// Fetches the current state of one run.
    async fn get_run(&self, repository: &RepositoryId, run: RunId) -> PortResult<WorkflowRun>;

    /// Lists the jobs (and their steps) of one run.
    async fn list_jobs(&self, repository: &RepositoryId, run: RunId)
        -> PortResult<Vec<JobSummary>>;

    /// Downloads the plain-text log of one job.
    async fn job_log(&self, repository: &RepositoryId, job: JobId) -> PortResult<String>;
}

/// Container registry speaking the distribution API.
#[async_trait]
pub trait ContainerRegistry: Send + Sync {
    /// Obtains a token for `image`'s repository with the requested access.
    ///
    /// Returns [`crate::PortError::Unauthorized`] when the credentials are
    /// rejected.
    async fn authenticate(&self, image: &ImageReference, access: RegistryAccess)
        -> PortResult<()>;

    /// Returns `true` if a manifest exists for `image`'s tag.
    async fn manifest_exists(&self, image: &ImageReference) -> PortResult<bool>;
}

/// Package metadata on the hosting platform.
#[async_trait]
pub trait PackageVisibility: Send + Sync {
    /// Reads the visibility of the container package `namespace/image`.
    async fn visibility(&self, namespace: &Namespace, image: &ImageName)
        -> PortResult<Visibility>;

    /// Returns the web page where a human can change the package's visibility.
    fn settings_url(&self, namespace: &Namespace, image: &ImageName) -> String;
}
