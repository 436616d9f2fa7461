//! GitHub Actions and commits endpoints: [`SourceHost`] and [`WorkflowRunner`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch::{
    CommitSha, GitRef, JobId, JobSummary, PortError, PortResult, RepositoryId, RunConclusion,
    RunId, RunStatus, SourceHost, StepSummary, Timestamp, WorkflowFile, WorkflowInputs,
    WorkflowRun, WorkflowRunner,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use urlencoding::encode;

use crate::client::GithubClient;
use crate::response::transport_error;

/// Runs fetched per listing; only runs created after the dispatch matter.
const RUNS_PER_PAGE: &str = "20";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CommitDto {
    sha: String,
}

#[derive(Debug, Serialize)]
struct DispatchBody<'a> {
    #[serde(rename = "ref")]
    git_ref: &'a str,
    inputs: &'a WorkflowInputs,
}

#[derive(Debug, Deserialize)]
struct RunsPage {
    workflow_runs: Vec<RunDto>,
}

#[derive(Debug, Deserialize)]
struct RunDto {
    id: u64,
    status: RunStatus,
    conclusion: Option<RunConclusion>,
    head_branch: Option<String>,
    head_sha: Option<String>,
    html_url: String,
    created_at: DateTime<Utc>,
}

impl From<RunDto> for WorkflowRun {
    fn from(dto: RunDto) -> Self {
        WorkflowRun {
            id: RunId::new(dto.id),
            status: dto.status,
            conclusion: dto.conclusion,
            head_branch: dto.head_branch,
            head_sha: dto.head_sha.and_then(CommitSha::new),
            html_url: dto.html_url,
            created_at: Timestamp::from_utc(dto.created_at),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JobsPage {
    jobs: Vec<JobDto>,
}

#[derive(Debug, Deserialize)]
struct JobDto {
    id: u64,
    name: String,
    status: RunStatus,
    conclusion: Option<RunConclusion>,
    #[serde(default)]
    steps: Vec<StepDto>,
}

#[derive(Debug, Deserialize)]
struct StepDto {
    number: u32,
    name: String,
    status: RunStatus,
    conclusion: Option<RunConclusion>,
}

impl From<JobDto> for JobSummary {
    fn from(dto: JobDto) -> Self {
        JobSummary {
            id: JobId::new(dto.id),
            name: dto.name,
            status: dto.status,
            conclusion: dto.conclusion,
            steps: dto
                .steps
                .into_iter()
                .map(|step| StepSummary {
                    number: step.number,
                    name: step.name,
                    status: step.status,
                    conclusion: step.conclusion,
                })
                .collect(),
        }
    }
}

fn repo_path(repository: &RepositoryId) -> String {
    format!(
        "/repos/{}/{}",
        encode(repository.owner()),
        encode(repository.name())
    )
}

/// Encodes each `/`-separated component of a ref; `#`, `%` and `?` are legal
/// in ref names but not in a URL path.
fn ref_path(git_ref: &GitRef) -> String {
    git_ref
        .as_str()
        .split('/')
        .map(encode)
        .collect::<Vec<_>>()
        .join("/")
}

// ---------------------------------------------------------------------------
// Port implementations
// ---------------------------------------------------------------------------

#[async_trait]
impl SourceHost for GithubClient {
    #[instrument(skip_all, fields(repository = %repository, git_ref = %git_ref))]
    async fn resolve_ref(
        &self,
        repository: &RepositoryId,
        git_ref: &GitRef,
    ) -> PortResult<CommitSha> {
        let path = format!("{}/commits/{}", repo_path(repository), ref_path(git_ref));
        let what = format!("{repository}@{git_ref}");
        let commit: CommitDto = match self.get_json(&path, &[], &what).await {
            // 422 is GitHub's answer for a ref that names no commit.
            Err(PortError::UnexpectedResponse { status: 422, .. }) => {
                return Err(PortError::NotFound { what })
            }
            other => other?,
        };
        CommitSha::new(commit.sha).ok_or_else(|| PortError::Decode {
            message: "commit response has an empty sha".to_string(),
        })
    }
}

#[async_trait]
impl WorkflowRunner for GithubClient {
    #[instrument(skip_all, fields(repository = %repository, workflow = %workflow, git_ref = %git_ref))]
    async fn dispatch(
        &self,
        repository: &RepositoryId,
        workflow: &WorkflowFile,
        git_ref: &GitRef,
        inputs: &WorkflowInputs,
    ) -> PortResult<()> {
        let path = format!(
            "{}/actions/workflows/{}/dispatches",
            repo_path(repository),
            encode(workflow.as_str())
        );
        let body = DispatchBody {
            git_ref: git_ref.as_str(),
            inputs,
        };
        let what = format!("workflow {workflow} in {repository}");
        match self.send(self.post(&path).json(&body), &what).await {
            Ok(_) => Ok(()),
            Err(PortError::UnexpectedResponse { status: 422, body }) if body.contains("ref") => {
                Err(PortError::NotFound { what: body })
            }
            Err(err) => Err(err),
        }
    }

    async fn list_dispatched_runs(
        &self,
        repository: &RepositoryId,
        workflow: &WorkflowFile,
        branch: &str,
    ) -> PortResult<Vec<WorkflowRun>> {
        let path = format!(
            "{}/actions/workflows/{}/runs",
            repo_path(repository),
            encode(workflow.as_str())
        );
        let query = [
            ("event", "workflow_dispatch"),
            ("branch", branch),
            ("per_page", RUNS_PER_PAGE),
        ];
        let page: RunsPage = self
            .get_json(&path, &query, &format!("runs of {workflow}"))
            .await?;
        debug!(count = page.workflow_runs.len(), "listed workflow runs");
        Ok(page.workflow_runs.into_iter().map(WorkflowRun::from).collect())
    }

    async fn get_run(&self, repository: &RepositoryId, run: RunId) -> PortResult<WorkflowRun> {
        let path = format!("{}/actions/runs/{run}", repo_path(repository));
        let dto: RunDto = self.get_json(&path, &[], &format!("run {run}")).await?;
        Ok(dto.into())
    }

    async fn list_jobs(
        &self,
        repository: &RepositoryId,
        run: RunId,
    ) -> PortResult<Vec<JobSummary>> {
        let path = format!("{}/actions/runs/{run}/jobs", repo_path(repository));
        let page: JobsPage = self
            .get_json(&path, &[("per_page", "100")], &format!("jobs of run {run}"))
            .await?;
        Ok(page.jobs.into_iter().map(JobSummary::from).collect())
    }

    async fn job_log(&self, repository: &RepositoryId, job: JobId) -> PortResult<String> {
        // Answers with a redirect to short-lived blob storage; reqwest follows
        // it and drops the Authorization header on the cross-origin hop.
        let path = format!("{}/actions/jobs/{job}/logs", repo_path(repository));
        let response = self.send(self.get(&path), &format!("log of job {job}")).await?;
        response.text().await.map_err(transport_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUNS_FIXTURE: &str = r#"{
        "total_count": 2,
        "workflow_runs": [
            {
                "id": 30433642,
                "name": "Publish image",
                "head_branch": "main",
                "head_sha": "acb5820ced9479c074f688cc328bf03f341a511d",
                "event": "workflow_dispatch",
                "status": "in_progress",
                "conclusion": null,
                "html_url": "https://github.com/octo-org/widget/actions/runs/30433642",
                "created_at": "2026-10-19T12:00:05Z"
            },
            {
                "id": 30433600,
                "head_branch": "main",
                "head_sha": "acb5820ced9479c074f688cc328bf03f341a511d",
                "status": "completed",
                "conclusion": "startup_failure",
                "html_url": "https://github.com/octo-org/widget/actions/runs/30433600",
                "created_at": "2026-10-19T11:58:00Z"
            }
        ]
    }"#;

    const JOBS_FIXTURE: &str = r#"{
        "total_count": 1,
        "jobs": [
            {
                "id": 399444496,
                "run_id": 30433642,
                "name": "build-and-push-image",
                "status": "completed",
                "conclusion": "failure",
                "steps": [
                    {"name": "Set up job", "status": "completed", "conclusion": "success", "number": 1},
                    {"name": "Checkout repository", "status": "completed", "conclusion": "success", "number": 2},
                    {"name": "Log in to the Container registry", "status": "completed", "conclusion": "failure", "number": 3},
                    {"name": "Build and push Docker image", "status": "completed", "conclusion": "skipped", "number": 4}
                ]
            }
        ]
    }"#;

    #[test]
    fn test_runs_page_decodes_into_domain_runs() {
        let page: RunsPage = crate::client::decode(RUNS_FIXTURE).unwrap();
        let runs: Vec<WorkflowRun> = page.workflow_runs.into_iter().map(Into::into).collect();

        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, RunId::new(30433642));
        assert_eq!(runs[0].status, RunStatus::InProgress);
        assert_eq!(runs[0].conclusion, None);
        assert_eq!(runs[0].head_branch.as_deref(), Some("main"));
        assert_eq!(runs[1].conclusion, Some(RunConclusion::StartupFailure));
        assert!(runs[0].created_at > runs[1].created_at);
    }

    #[test]
    fn test_jobs_page_decodes_steps() {
        let page: JobsPage = crate::client::decode(JOBS_FIXTURE).unwrap();
        let jobs: Vec<JobSummary> = page.jobs.into_iter().map(Into::into).collect();

        assert_eq!(jobs[0].id, JobId::new(399444496));
        assert_eq!(jobs[0].steps.len(), 4);
        assert_eq!(
            jobs[0].first_failed_step().unwrap().name,
            "Log in to the Container registry"
        );
    }

    #[test]
    fn test_job_without_steps_decodes() {
        let job: JobDto = crate::client::decode(
            r#"{"id": 1, "name": "queued", "status": "queued", "conclusion": null}"#,
        )
        .unwrap();
        assert!(job.steps.is_empty());
    }

    #[test]
    fn test_dispatch_body_shape() {
        let mut inputs = WorkflowInputs::new();
        inputs.insert("tags".into(), "latest,v1".into());
        let body = DispatchBody {
            git_ref: "main",
            inputs: &inputs,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"ref": "main", "inputs": {"tags": "latest,v1"}})
        );
    }

    #[test]
    fn test_repo_path() {
        let repo = RepositoryId::new("octo-org/widget").unwrap();
        assert_eq!(repo_path(&repo), "/repos/octo-org/widget");
    }

    #[test]
    fn test_ref_path_keeps_slashes_and_encodes_reserved_characters() {
        let encoded = |r: &str| ref_path(&GitRef::new(r).unwrap());
        assert_eq!(encoded("release/1.x"), "release/1.x");
        assert_eq!(encoded("feature#42"), "feature%2342");
        assert_eq!(encoded("fix/100%?"), "fix/100%25%3F");
    }
}
