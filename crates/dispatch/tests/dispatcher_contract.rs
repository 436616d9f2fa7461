//! Behavioural contract of the `Dispatcher`, driven through the in-memory
//! port fakes on a paused tokio clock.

use std::sync::Arc;
use std::time::Duration;

use dispatch::fakes::{job, FakePackages, FakeRegistry, FakeSourceHost, FakeWorkflowRunner, RunScript};
use dispatch::*;

const REPO: &str = "octo-org/widget";
const WORKFLOW: &str = "docker-publish.yml";

struct Harness {
    dispatcher: Dispatcher,
    runner: Arc<FakeWorkflowRunner>,
    registry: Arc<FakeRegistry>,
}

fn harness_with(runner: FakeWorkflowRunner, registry: FakeRegistry, packages: FakePackages) -> Harness {
    let runner = Arc::new(runner);
    let registry = Arc::new(registry);
    let source = Arc::new(FakeSourceHost::new().with_ref(REPO, "main"));
    let dispatcher = Dispatcher::new(
        source,
        runner.clone(),
        registry.clone(),
        Arc::new(packages),
    );
    Harness {
        dispatcher,
        runner,
        registry,
    }
}

fn harness(script: RunScript) -> Harness {
    harness_with(
        FakeWorkflowRunner::new(WORKFLOW, script),
        FakeRegistry::new().with_manifest("ghcr.io/octo-org/widget:latest"),
        FakePackages::new(),
    )
}

fn request() -> BuildRequest {
    BuildRequest {
        repository: RepositoryId::new(REPO).unwrap(),
        git_ref: GitRef::new("main").unwrap(),
        workflow: WorkflowFile::new(WORKFLOW).unwrap(),
        image: ImageName::new("widget").unwrap(),
        tags: vec![ImageTag::new("latest").unwrap()],
        platforms: vec![Platform::new("linux/amd64").unwrap()],
        dockerfile: SourcePath::new("Dockerfile").unwrap(),
        context: SourcePath::new(".").unwrap(),
        registry: RegistryHost::new(DEFAULT_REGISTRY).unwrap(),
        namespace: None,
    }
}

fn expect_error(result: &BuildResult) -> &DispatchError {
    match &result.outcome {
        BuildOutcome::Failed { error } => error,
        other => panic!("expected failure, got {other:?}"),
    }
}

// ===========================================================================
// submit: success path
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn submit_publishes_reference_matching_configured_name_and_tag() {
    let h = harness(RunScript::succeeding());

    let result = h.dispatcher.submit(&request()).await;

    assert!(result.is_success(), "{:?}", result.outcome);
    let published: Vec<String> = result.published.iter().map(ToString::to_string).collect();
    assert_eq!(published, vec!["ghcr.io/octo-org/widget:latest"]);

    let run = result.run.expect("run handle");
    assert_eq!(run.id, RunId::new(1000));
    assert!(run.html_url.ends_with("/actions/runs/1000"));
    assert!(result.logs.iter().any(|l| l.contains("concluded success")));
    assert!(result.finished_at >= result.started_at);
}

#[tokio::test(start_paused = true)]
async fn submit_dispatches_once_with_request_inputs() {
    let h = harness(RunScript::succeeding());

    let result = h.dispatcher.submit(&request()).await;

    let calls = h.runner.dispatches();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].repository, REPO);
    assert_eq!(calls[0].workflow, WORKFLOW);
    assert_eq!(calls[0].git_ref, "main");
    assert_eq!(calls[0].inputs["image"], "ghcr.io/octo-org/widget");
    assert_eq!(calls[0].inputs["tags"], "latest");
    assert_eq!(calls[0].inputs["platforms"], "linux/amd64");
    assert_eq!(calls[0].inputs["dispatch_id"], result.dispatch_id.to_string());

    assert_eq!(
        h.registry.auth_calls(),
        vec![("octo-org/widget".to_string(), RegistryAccess::Push)]
    );
}

#[tokio::test(start_paused = true)]
async fn submit_ignores_runs_that_existed_before_dispatch() {
    let h = harness_with(
        FakeWorkflowRunner::new(WORKFLOW, RunScript::succeeding()).with_preexisting_run(5000),
        FakeRegistry::new().with_manifest("ghcr.io/octo-org/widget:latest"),
        FakePackages::new(),
    );

    let result = h.dispatcher.submit(&request()).await;

    assert!(result.is_success());
    assert_eq!(result.run.unwrap().id, RunId::new(1000));
}

#[tokio::test(start_paused = true)]
async fn submit_on_tag_ref_discovers_run_by_short_name() {
    let runner = Arc::new(FakeWorkflowRunner::new(WORKFLOW, RunScript::succeeding()));
    let dispatcher = Dispatcher::new(
        Arc::new(FakeSourceHost::new().with_ref(REPO, "refs/tags/v1.0.0")),
        runner.clone(),
        Arc::new(FakeRegistry::new().with_manifest("ghcr.io/octo-org/widget:latest")),
        Arc::new(FakePackages::new()),
    );
    let mut req = request();
    req.git_ref = GitRef::new("refs/tags/v1.0.0").unwrap();

    let result = dispatcher.submit(&req).await;

    assert!(result.is_success(), "{:?}", result.outcome);
    assert_eq!(result.run.unwrap().id, RunId::new(1000));
    assert_eq!(runner.dispatches()[0].git_ref, "refs/tags/v1.0.0");
}

#[tokio::test(start_paused = true)]
async fn submit_waits_for_a_slow_run_to_appear() {
    let script = RunScript {
        appears_after_listings: Some(3),
        ..RunScript::succeeding()
    };
    let h = harness(script);

    let result = h.dispatcher.submit(&request()).await;

    assert!(result.is_success(), "{:?}", result.outcome);
}

#[tokio::test(start_paused = true)]
async fn submit_each_submission_performs_a_fresh_build() {
    let h = harness(RunScript::succeeding());

    let first = h.dispatcher.submit(&request()).await;
    let second = h.dispatcher.submit(&request()).await;

    assert!(first.is_success() && second.is_success());
    assert_ne!(first.dispatch_id, second.dispatch_id);
    assert_ne!(first.run.unwrap().id, second.run.unwrap().id);
    assert_eq!(h.runner.dispatches().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn submit_without_waiting_returns_after_run_discovery() {
    let h = harness(RunScript {
        polls_until_complete: None,
        ..RunScript::succeeding()
    });

    let result = h
        .dispatcher
        .submit_with(&request(), WaitMode::UntilDispatched)
        .await;

    assert_eq!(result.outcome, BuildOutcome::Dispatched);
    assert!(result.published.is_empty());
    assert!(result.run.is_some());
}

// ===========================================================================
// submit: failures before anything is dispatched
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn submit_invalid_request_contacts_nothing() {
    let h = harness(RunScript::succeeding());
    let mut req = request();
    req.tags.clear();

    let result = h.dispatcher.submit(&req).await;

    assert!(matches!(
        expect_error(&result),
        DispatchError::InvalidRequest { .. }
    ));
    assert!(h.runner.dispatches().is_empty());
    assert!(h.registry.auth_calls().is_empty());
    assert!(result.run.is_none());
}

#[tokio::test(start_paused = true)]
async fn submit_unknown_branch_reports_checkout_failure_and_publishes_nothing() {
    let h = harness(RunScript::succeeding());
    let mut req = request();
    req.git_ref = GitRef::new("does-not-exist").unwrap();

    let result = h.dispatcher.submit(&req).await;

    match expect_error(&result) {
        DispatchError::CheckoutFailed { reference, .. } => {
            assert_eq!(reference, "octo-org/widget@does-not-exist")
        }
        other => panic!("expected CheckoutFailed, got {other:?}"),
    }
    assert!(result.published.is_empty());
    assert!(h.runner.dispatches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn submit_rejected_registry_credentials_dispatch_nothing() {
    let h = harness_with(
        FakeWorkflowRunner::new(WORKFLOW, RunScript::succeeding()),
        FakeRegistry::rejecting(),
        FakePackages::new(),
    );

    let result = h.dispatcher.submit(&request()).await;

    assert!(matches!(
        expect_error(&result),
        DispatchError::RegistryAuthFailed { registry, .. } if registry == "ghcr.io"
    ));
    assert!(h.runner.dispatches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn submit_unknown_workflow_reports_checkout_failure() {
    let h = harness(RunScript::succeeding());
    let mut req = request();
    req.workflow = WorkflowFile::new("missing.yml").unwrap();

    let result = h.dispatcher.submit(&req).await;

    assert_eq!(expect_error(&result).kind(), "checkout_failed");
}

#[tokio::test(start_paused = true)]
async fn submit_dispatch_is_not_retried_on_transient_error() {
    let h = harness_with(
        FakeWorkflowRunner::new(WORKFLOW, RunScript::succeeding()).with_dispatch_failure(
            PortError::UnexpectedResponse {
                status: 503,
                body: "unavailable".into(),
            },
        ),
        FakeRegistry::new(),
        FakePackages::new(),
    );

    let result = h.dispatcher.submit(&request()).await;

    let error = expect_error(&result);
    assert_eq!(error.kind(), "infrastructure");
    assert!(error.retry_policy().is_retryable());
    assert!(h.runner.dispatches().is_empty());
}

// ===========================================================================
// submit: failures reported by the run
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn submit_failed_build_step_reports_build_failure_with_log_tail() {
    let log = "#8 [build 3/4] RUN cargo build --release\nerror[E0425]: cannot find value `x`";
    let h = harness(RunScript::failing_at("Build and push Docker image", log));

    let result = h.dispatcher.submit(&request()).await;

    match expect_error(&result) {
        DispatchError::BuildFailed { reason } => {
            assert!(reason.contains("Build and push Docker image"), "{reason}")
        }
        other => panic!("expected BuildFailed, got {other:?}"),
    }
    assert!(result.published.is_empty());
    assert!(result.logs.iter().any(|l| l.contains("E0425")));
    assert!(result
        .logs
        .iter()
        .any(|l| l.contains("failed at step 2 'Build and push Docker image'")));
}

#[tokio::test(start_paused = true)]
async fn submit_failed_login_step_reports_registry_auth_failure() {
    let h = harness(RunScript::failing_at(
        "Log in to the Container registry",
        "Error: denied: denied",
    ));

    let result = h.dispatcher.submit(&request()).await;

    assert_eq!(expect_error(&result).kind(), "registry_auth_failed");
}

#[tokio::test(start_paused = true)]
async fn submit_failed_checkout_step_reports_checkout_failure() {
    let h = harness(RunScript::failing_at(
        "Checkout repository",
        "fatal: couldn't find remote ref",
    ));

    let result = h.dispatcher.submit(&request()).await;

    assert_eq!(expect_error(&result).kind(), "checkout_failed");
}

#[tokio::test(start_paused = true)]
async fn submit_push_error_in_log_reports_push_failure() {
    let h = harness(RunScript::failing_at(
        "Build and push Docker image",
        "ERROR: failed to push ghcr.io/octo-org/widget:latest: unexpected EOF",
    ));

    let result = h.dispatcher.submit(&request()).await;

    match expect_error(&result) {
        DispatchError::PushFailed { image, .. } => {
            assert_eq!(image, "ghcr.io/octo-org/widget:latest")
        }
        other => panic!("expected PushFailed, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn submit_successful_run_without_manifest_reports_push_failure() {
    let h = harness_with(
        FakeWorkflowRunner::new(WORKFLOW, RunScript::succeeding()),
        FakeRegistry::new(),
        FakePackages::new(),
    );

    let result = h.dispatcher.submit(&request()).await;

    assert_eq!(expect_error(&result).kind(), "push_failed");
    assert!(result.published.is_empty());
}

#[tokio::test(start_paused = true)]
async fn submit_second_tag_missing_reports_push_failure() {
    let h = harness(RunScript::succeeding());
    let mut req = request();
    req.tags.push(ImageTag::new("v1").unwrap());

    let result = h.dispatcher.submit(&req).await;

    match expect_error(&result) {
        DispatchError::PushFailed { image, .. } => assert_eq!(image, "ghcr.io/octo-org/widget:v1"),
        other => panic!("expected PushFailed, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn submit_cancelled_run_reports_cancelled() {
    let h = harness(RunScript {
        conclusion: RunConclusion::Cancelled,
        jobs: vec![job("build", &[("Set up job", RunConclusion::Success)])],
        ..RunScript::succeeding()
    });

    let result = h.dispatcher.submit(&request()).await;

    assert_eq!(expect_error(&result), &DispatchError::Cancelled);
}

// ===========================================================================
// submit: waiting limits
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn submit_times_out_when_run_never_completes() {
    let h = harness(RunScript {
        polls_until_complete: None,
        ..RunScript::succeeding()
    });
    let dispatcher = h.dispatcher.clone().with_settings(PollSettings {
        build_timeout: Duration::from_secs(60),
        ..PollSettings::default()
    });

    let result = dispatcher.submit(&request()).await;

    match expect_error(&result) {
        DispatchError::Timeout { phase, waited } => {
            assert_eq!(*phase, WaitPhase::Build);
            assert!(*waited >= Duration::from_secs(60));
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
    // The run was found before the wait started.
    assert!(result.run.is_some());
}

#[tokio::test(start_paused = true)]
async fn submit_times_out_when_run_never_appears() {
    let h = harness(RunScript {
        appears_after_listings: None,
        ..RunScript::succeeding()
    });

    let result = h.dispatcher.submit(&request()).await;

    assert!(matches!(
        expect_error(&result),
        DispatchError::Timeout {
            phase: WaitPhase::RunDiscovery,
            ..
        }
    ));
    assert!(result.run.is_none());
    assert_eq!(h.runner.dispatches().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn submit_tolerates_transient_read_failures() {
    let h = harness_with(
        FakeWorkflowRunner::new(WORKFLOW, RunScript::succeeding()).with_read_failures(vec![
            PortError::Transport {
                message: "connection reset".into(),
            },
            PortError::RateLimited {
                retry_after: Some(Duration::from_secs(30)),
            },
        ]),
        FakeRegistry::new().with_manifest("ghcr.io/octo-org/widget:latest"),
        FakePackages::new(),
    );

    let result = h.dispatcher.submit(&request()).await;

    assert!(result.is_success(), "{:?}", result.outcome);
}

#[tokio::test(start_paused = true)]
async fn submit_waits_out_a_long_rate_limit_before_retrying() {
    let h = harness_with(
        FakeWorkflowRunner::new(WORKFLOW, RunScript::succeeding()).with_read_failures(vec![
            PortError::RateLimited {
                retry_after: Some(Duration::from_secs(3600)),
            },
        ]),
        FakeRegistry::new().with_manifest("ghcr.io/octo-org/widget:latest"),
        FakePackages::new(),
    );
    let start = tokio::time::Instant::now();

    let result = h.dispatcher.submit(&request()).await;

    assert!(result.is_success(), "{:?}", result.outcome);
    assert!(start.elapsed() >= Duration::from_secs(3600));
    assert_eq!(h.runner.dispatches().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn submit_gives_up_after_too_many_read_failures() {
    let transient = || PortError::Transport {
        message: "connection reset".into(),
    };
    let h = harness_with(
        FakeWorkflowRunner::new(WORKFLOW, RunScript::succeeding())
            .with_read_failures(vec![transient(), transient(), transient(), transient()]),
        FakeRegistry::new(),
        FakePackages::new(),
    );

    let result = h.dispatcher.submit(&request()).await;

    assert_eq!(expect_error(&result).kind(), "infrastructure");
    assert!(h.runner.dispatches().is_empty());
}

// ===========================================================================
// make_public / status / verify
// ===========================================================================

fn image(reference: &str) -> ImageReference {
    ImageReference::parse(reference).unwrap()
}

#[tokio::test]
async fn make_public_succeeds_for_public_package() {
    let h = harness_with(
        FakeWorkflowRunner::new(WORKFLOW, RunScript::succeeding()),
        FakeRegistry::new(),
        FakePackages::new().with_package("octo-org/widget", Visibility::Public),
    );

    let result = h
        .dispatcher
        .make_public(&image("ghcr.io/octo-org/widget:latest"))
        .await;

    assert_eq!(result, Ok(()));
}

#[tokio::test]
async fn make_public_on_private_package_points_at_settings_page() {
    let h = harness_with(
        FakeWorkflowRunner::new(WORKFLOW, RunScript::succeeding()),
        FakeRegistry::new(),
        FakePackages::new().with_package("octo-org/widget", Visibility::Private),
    );

    let err = h
        .dispatcher
        .make_public(&image("ghcr.io/Octo-Org/widget:latest"))
        .await
        .unwrap_err();

    match err {
        DispatchError::VisibilityChangeRequired {
            package,
            visibility,
            settings_url,
        } => {
            assert_eq!(package, "octo-org/widget");
            assert_eq!(visibility, "private");
            assert_eq!(
                settings_url,
                "https://github.com/users/octo-org/packages/container/widget/settings"
            );
        }
        other => panic!("expected VisibilityChangeRequired, got {other:?}"),
    }
}

#[tokio::test]
async fn make_public_on_missing_package_reports_not_found() {
    let h = harness(RunScript::succeeding());

    let err = h
        .dispatcher
        .make_public(&image("ghcr.io/octo-org/nothing:latest"))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        DispatchError::PackageNotFound {
            package: "octo-org/nothing".into()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn status_reports_run_and_failed_steps() {
    let h = harness(RunScript::failing_at("Build and push Docker image", ""));
    let repo = RepositoryId::new(REPO).unwrap();
    let submitted = h.dispatcher.submit(&request()).await;
    let run_id = submitted.run.unwrap().id;

    let report = h.dispatcher.status(&repo, run_id).await.unwrap();

    assert_eq!(report.run.id, run_id);
    assert_eq!(report.run.status, RunStatus::Completed);
    assert_eq!(report.run.conclusion, Some(RunConclusion::Failure));
    assert_eq!(
        report.jobs[0].first_failed_step().unwrap().name,
        "Build and push Docker image"
    );
}

#[tokio::test]
async fn status_of_unknown_run_is_an_error() {
    let h = harness(RunScript::succeeding());
    let repo = RepositoryId::new(REPO).unwrap();

    let err = h.dispatcher.status(&repo, RunId::new(1)).await.unwrap_err();

    assert_eq!(err.kind(), "infrastructure");
}

#[tokio::test]
async fn verify_reports_presence_of_tag() {
    let h = harness(RunScript::succeeding());

    assert!(h
        .dispatcher
        .verify(&image("ghcr.io/octo-org/widget:latest"))
        .await
        .unwrap());
    assert!(!h
        .dispatcher
        .verify(&image("ghcr.io/octo-org/widget:nope"))
        .await
        .unwrap());
}
