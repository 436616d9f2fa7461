//! Mapping a failed workflow run onto a distinct failure class.
//!
//! The run itself only reports `failure`; the class comes from the first
//! failed step's name, refined by the job log when the step both builds and
//! pushes (as `docker/build-push-action` does).

use serde::{Deserialize, Serialize};

use crate::{JobSummary, RunConclusion, StepSummary};

/// Failure class of a completed, unsuccessful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Checkout,
    Build,
    RegistryAuth,
    Push,
    Cancelled,
}

/// The failed step a classification was based on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedStep {
    pub job: String,
    pub step: String,
}

impl std::fmt::Display for FailedStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "step '{}' in job '{}'", self.step, self.job)
    }
}

/// Finds the first failed step across `jobs`, in job order.
pub fn first_failed_step(jobs: &[JobSummary]) -> Option<(&JobSummary, &StepSummary)> {
    jobs.iter()
        .find_map(|job| job.first_failed_step().map(|step| (job, step)))
}

/// Classifies a run that completed with `conclusion`.
///
/// `log_tail` is the end of the failed job's log, or `""` when unavailable.
pub fn classify(
    conclusion: RunConclusion,
    jobs: &[JobSummary],
    log_tail: &str,
) -> (FailureKind, Option<FailedStep>) {
    if conclusion == RunConclusion::Cancelled {
        return (FailureKind::Cancelled, None);
    }

    let Some((job, step)) = first_failed_step(jobs) else {
        return (FailureKind::Build, None);
    };
    let failed = FailedStep {
        job: job.name.clone(),
        step: step.name.clone(),
    };

    (classify_step(&step.name, log_tail), Some(failed))
}

fn classify_step(step_name: &str, log_tail: &str) -> FailureKind {
    let name = step_name.to_lowercase();

    if name.contains("checkout") {
        return FailureKind::Checkout;
    }
    if name.contains("login") || name.contains("log in") || name.contains("log into") {
        return FailureKind::RegistryAuth;
    }
    if name.contains("push") && !name.contains("build") {
        return FailureKind::Push;
    }
    if name.contains("push") {
        return classify_log(log_tail);
    }
    FailureKind::Build
}

fn classify_log(log_tail: &str) -> FailureKind {
    let log = log_tail.to_lowercase();
    if log.contains("unauthorized") || log.contains("denied") {
        FailureKind::RegistryAuth
    } else if log.contains("failed to push") {
        FailureKind::Push
    } else {
        FailureKind::Build
    }
}

/// Returns the last `lines` lines of `log`.
pub fn log_tail(log: &str, lines: usize) -> Vec<String> {
    let all: Vec<&str> = log.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].iter().map(|line| line.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobId, RunStatus};

    fn job(steps: &[(&str, RunConclusion)]) -> JobSummary {
        JobSummary {
            id: JobId::new(1),
            name: "build".into(),
            status: RunStatus::Completed,
            conclusion: Some(RunConclusion::Failure),
            steps: steps
                .iter()
                .enumerate()
                .map(|(i, (name, conclusion))| StepSummary {
                    number: i as u32 + 1,
                    name: name.to_string(),
                    status: RunStatus::Completed,
                    conclusion: Some(*conclusion),
                })
                .collect(),
        }
    }

    #[test]
    fn test_cancelled_run() {
        let (kind, step) = classify(RunConclusion::Cancelled, &[], "");
        assert_eq!(kind, FailureKind::Cancelled);
        assert!(step.is_none());
    }

    #[test]
    fn test_checkout_step_failure() {
        let jobs = [job(&[("Checkout repository", RunConclusion::Failure)])];
        let (kind, step) = classify(RunConclusion::Failure, &jobs, "");
        assert_eq!(kind, FailureKind::Checkout);
        assert_eq!(
            step.unwrap().to_string(),
            "step 'Checkout repository' in job 'build'"
        );
    }

    #[test]
    fn test_login_step_failure() {
        let jobs = [job(&[
            ("Checkout repository", RunConclusion::Success),
            ("Log in to the Container registry", RunConclusion::Failure),
        ])];
        assert_eq!(
            classify(RunConclusion::Failure, &jobs, "").0,
            FailureKind::RegistryAuth
        );
    }

    #[test]
    fn test_build_and_push_step_uses_log() {
        let jobs = [job(&[("Build and push Docker image", RunConclusion::Failure)])];

        let auth = "ERROR: failed to solve: unexpected status: 401 Unauthorized";
        assert_eq!(
            classify(RunConclusion::Failure, &jobs, auth).0,
            FailureKind::RegistryAuth
        );

        let push = "error: failed to push ghcr.io/o/app:latest: broken pipe";
        assert_eq!(
            classify(RunConclusion::Failure, &jobs, push).0,
            FailureKind::Push
        );

        let build = "RUN cargo build --release\nerror[E0425]: cannot find value";
        assert_eq!(
            classify(RunConclusion::Failure, &jobs, build).0,
            FailureKind::Build
        );
    }

    #[test]
    fn test_unlabelled_failures_are_build_failures() {
        let jobs = [job(&[("Run tests", RunConclusion::Failure)])];
        assert_eq!(classify(RunConclusion::Failure, &jobs, "").0, FailureKind::Build);
        assert_eq!(
            classify(RunConclusion::StartupFailure, &[], "").0,
            FailureKind::Build
        );
    }

    #[test]
    fn test_log_tail() {
        let log = "a\nb\nc\nd";
        assert_eq!(log_tail(log, 2), vec!["c", "d"]);
        assert_eq!(log_tail(log, 10).len(), 4);
        assert!(log_tail("", 5).is_empty());
    }
}
