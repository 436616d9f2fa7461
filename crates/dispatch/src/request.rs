//! Build requests and build results.
//!
//! A [`BuildRequest`] is pure configuration: which repository and ref to
//! build, which workflow to dispatch, and what to publish. A [`BuildResult`]
//! is the single outcome of submitting one.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{is_valid_image_name, is_valid_namespace, is_valid_platform, is_valid_tag};
use crate::{
    DispatchError, DispatchId, GitRef, ImageName, ImageReference, ImageTag, Namespace, Platform,
    RegistryHost, RepositoryId, RunId, SourcePath, Timestamp, WorkflowFile,
};

/// Default registry host when a request does not name one.
pub const DEFAULT_REGISTRY: &str = "ghcr.io";

/// Inputs passed to the dispatched workflow, keyed by input name.
pub type WorkflowInputs = BTreeMap<String, String>;

/// Everything needed to trigger one remote build-and-publish run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Source repository (`owner/repo`).
    pub repository: RepositoryId,
    /// Branch or ref to build.
    pub git_ref: GitRef,
    /// Workflow file to dispatch; it must declare a `workflow_dispatch` trigger.
    pub workflow: WorkflowFile,
    /// Target image name.
    pub image: ImageName,
    /// Target tags; at least one.
    pub tags: Vec<ImageTag>,
    /// Target platforms; at least one.
    pub platforms: Vec<Platform>,
    /// Dockerfile path, relative to the repository root.
    pub dockerfile: SourcePath,
    /// Build context, relative to the repository root.
    pub context: SourcePath,
    /// Registry host the workflow pushes to.
    pub registry: RegistryHost,
    /// Image namespace; `None` means the repository owner.
    pub namespace: Option<Namespace>,
}

impl BuildRequest {
    /// Checks every invariant and reports all violations together.
    pub fn validate(&self) -> Result<(), DispatchError> {
        let mut problems = Vec::new();

        if !self.repository.is_well_formed() {
            problems.push(format!(
                "repository '{}' is not in owner/name form",
                self.repository
            ));
        }
        if !is_valid_image_name(self.image.as_str()) {
            problems.push(format!("image name '{}' is invalid", self.image));
        }
        if let Some(namespace) = self.namespace.as_ref() {
            if !is_valid_namespace(namespace.as_str()) {
                problems.push(format!("image owner '{namespace}' is invalid"));
            }
        }
        if self.tags.is_empty() {
            problems.push("at least one tag is required".to_string());
        }
        for tag in self.tags.iter().filter(|t| !is_valid_tag(t.as_str())) {
            problems.push(format!("tag '{tag}' is invalid"));
        }
        if self.platforms.is_empty() {
            problems.push("at least one platform is required".to_string());
        }
        for platform in self
            .platforms
            .iter()
            .filter(|p| !is_valid_platform(p.as_str()))
        {
            problems.push(format!(
                "platform '{platform}' is not in os/arch[/variant] form"
            ));
        }
        if !self.dockerfile.is_confined() {
            problems.push(format!(
                "dockerfile path '{}' must be relative to the repository root",
                self.dockerfile
            ));
        }
        if !self.context.is_confined() {
            problems.push(format!(
                "context path '{}' must be relative to the repository root",
                self.context
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::InvalidRequest { problems })
        }
    }

    /// Returns the image namespace: the explicit one, or the repository owner.
    pub fn effective_namespace(&self) -> Namespace {
        self.namespace
            .clone()
            .unwrap_or_else(|| Namespace::from_repository(&self.repository))
    }

    /// Returns one image reference per requested tag, in request order.
    pub fn image_references(&self) -> Vec<ImageReference> {
        let namespace = self.effective_namespace();
        self.tags
            .iter()
            .map(|tag| {
                ImageReference::new(self.registry.clone(), &namespace, &self.image, tag.clone())
            })
            .collect()
    }

    /// Returns the workflow inputs for this request.
    ///
    /// The dispatched workflow is expected to declare `image`, `tags`,
    /// `platforms`, `dockerfile`, `context`, and `dispatch_id` inputs.
    pub fn workflow_inputs(&self, dispatch_id: DispatchId) -> WorkflowInputs {
        let mut inputs = WorkflowInputs::new();
        inputs.insert(
            "image".to_string(),
            format!(
                "{}/{}/{}",
                self.registry,
                self.effective_namespace().as_str().to_lowercase(),
                self.image.as_str().to_lowercase()
            ),
        );
        inputs.insert(
            "tags".to_string(),
            self.tags
                .iter()
                .map(ImageTag::as_str)
                .collect::<Vec<_>>()
                .join(","),
        );
        inputs.insert(
            "platforms".to_string(),
            self.platforms
                .iter()
                .map(Platform::as_str)
                .collect::<Vec<_>>()
                .join(","),
        );
        inputs.insert("dockerfile".to_string(), self.dockerfile.to_string());
        inputs.insert("context".to_string(), self.context.to_string());
        inputs.insert("dispatch_id".to_string(), dispatch_id.to_string());
        inputs
    }

    /// Returns `owner/repo@ref`, used in logs and checkout errors.
    pub fn source_label(&self) -> String {
        format!("{}@{}", self.repository, self.git_ref)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// How a submission ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BuildOutcome {
    /// The run succeeded and every tag is present in the registry.
    Published,
    /// The run was dispatched and found, but not waited on.
    Dispatched,
    /// The submission failed; nothing is guaranteed to have been published.
    Failed {
        /// The distinct failure.
        error: DispatchError,
    },
}

/// Handle on the remote run a submission triggered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHandle {
    pub id: RunId,
    pub html_url: String,
}

/// The single result produced by one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildResult {
    pub dispatch_id: DispatchId,
    pub outcome: BuildOutcome,
    /// Published references; empty unless the outcome is
    /// [`BuildOutcome::Published`].
    pub published: Vec<ImageReference>,
    pub run: Option<RunHandle>,
    /// Progress lines plus, on failure, the failed steps and a log tail.
    pub logs: Vec<String>,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
}

impl BuildResult {
    /// Returns `true` when the image was published.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, BuildOutcome::Published)
    }

    /// Returns the error when the submission failed.
    pub fn error(&self) -> Option<&DispatchError> {
        match &self.outcome {
            BuildOutcome::Failed { error } => Some(error),
            _ => None,
        }
    }

    /// Converts into the published references or the failure.
    pub fn into_result(self) -> Result<Vec<ImageReference>, DispatchError> {
        match self.outcome {
            BuildOutcome::Failed { error } => Err(error),
            _ => Ok(self.published),
        }
    }
}
