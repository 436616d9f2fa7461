//! Shared value types for the Slipway dispatch domain.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types carry
//! structure: a parsed image reference, the state of a remote workflow run,
//! polling limits.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CommitSha, ImageName, ImageTag, JobId, Namespace, RegistryHost, RunId};

// ---------------------------------------------------------------------------
// Image references
// ---------------------------------------------------------------------------

/// A published artefact reference: `<registry-host>/<owner>/<image-name>:<tag>`.
///
/// The owner and image name are stored lowercase; registries such as GHCR
/// reject mixed-case repository paths. Serialises as its string form and
/// deserialises through [`ImageReference::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ImageReference {
    registry: RegistryHost,
    namespace: Namespace,
    image: ImageName,
    tag: ImageTag,
}

/// Why a string could not be parsed as an [`ImageReference`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{input}' is not a <registry>/<owner>/<image>:<tag> reference: {reason}")]
pub struct ImageReferenceParseError {
    /// The rejected input.
    pub input: String,
    /// What was wrong with it.
    pub reason: &'static str,
}

impl ImageReference {
    /// Builds a reference from its parts, lowercasing the namespace and image.
    pub fn new(
        registry: RegistryHost,
        namespace: &Namespace,
        image: &ImageName,
        tag: ImageTag,
    ) -> Self {
        // Lowercasing a non-empty string never yields an empty one.
        let namespace = Namespace::new(namespace.as_str().to_lowercase())
            .unwrap_or_else(|| namespace.clone());
        let image = ImageName::new(image.as_str().to_lowercase()).unwrap_or_else(|| image.clone());
        Self {
            registry,
            namespace,
            image,
            tag,
        }
    }

    /// Parses `<registry-host>/<owner>/<image-name>:<tag>`.
    ///
    /// The registry host may carry a port (`localhost:5000`) and the image name
    /// may contain further `/` separators. Digest references (`@sha256:...`)
    /// are not accepted.
    pub fn parse(input: &str) -> Result<Self, ImageReferenceParseError> {
        let fail = |reason| ImageReferenceParseError {
            input: input.to_string(),
            reason,
        };

        if input.contains('@') {
            return Err(fail("digest references are not supported"));
        }

        let last_slash = input.rfind('/').ok_or_else(|| fail("missing '/'"))?;
        let (path, tag) = match input[last_slash..].rfind(':') {
            Some(offset) => {
                let colon = last_slash + offset;
                (&input[..colon], &input[colon + 1..])
            }
            None => return Err(fail("missing ':<tag>'")),
        };

        let (registry, rest) = path
            .split_once('/')
            .ok_or_else(|| fail("missing registry host"))?;
        let (namespace, image) = rest
            .split_once('/')
            .ok_or_else(|| fail("missing owner or image name"))?;

        let registry = RegistryHost::new(registry).ok_or_else(|| fail("empty registry host"))?;
        let namespace = Namespace::new(namespace).ok_or_else(|| fail("empty owner"))?;
        let image = ImageName::new(image).ok_or_else(|| fail("empty image name"))?;
        let tag = ImageTag::new(tag).ok_or_else(|| fail("empty tag"))?;

        if !is_valid_namespace(namespace.as_str()) {
            return Err(fail("invalid owner"));
        }
        if !is_valid_image_name(image.as_str()) {
            return Err(fail("invalid image name"));
        }
        if !is_valid_tag(tag.as_str()) {
            return Err(fail("invalid tag"));
        }

        Ok(Self::new(registry, &namespace, &image, tag))
    }

    /// Returns the registry host.
    pub fn registry(&self) -> &RegistryHost {
        &self.registry
    }

    /// Returns the (lowercased) owner.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Returns the (lowercased) image name.
    pub fn image(&self) -> &ImageName {
        &self.image
    }

    /// Returns the tag.
    pub fn tag(&self) -> &ImageTag {
        &self.tag
    }

    /// Returns `<owner>/<image-name>`, the repository path used by the
    /// distribution API.
    pub fn repository_path(&self) -> String {
        format!("{}/{}", self.namespace, self.image)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}:{}",
            self.registry, self.namespace, self.image, self.tag
        )
    }
}

impl From<ImageReference> for String {
    fn from(reference: ImageReference) -> Self {
        reference.to_string()
    }
}

impl TryFrom<String> for ImageReference {
    type Error = ImageReferenceParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl std::str::FromStr for ImageReference {
    type Err = ImageReferenceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Returns `true` if `tag` matches the OCI tag grammar
/// `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`.
pub fn is_valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    tag.len() <= 128
        && (first.is_ascii_alphanumeric() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Returns `true` if `name` (after lowercasing) is a valid repository path:
/// `/`-separated components of `[a-z0-9._-]`, each starting and ending with an
/// alphanumeric character.
pub fn is_valid_image_name(name: &str) -> bool {
    name.to_lowercase().split('/').all(|component| {
        let bytes = component.as_bytes();
        match (bytes.first(), bytes.last()) {
            (Some(first), Some(last)) => {
                first.is_ascii_alphanumeric()
                    && last.is_ascii_alphanumeric()
                    && bytes
                        .iter()
                        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
            }
            _ => false,
        }
    })
}

/// Returns `true` if `owner` is a single repository path component.
pub fn is_valid_namespace(owner: &str) -> bool {
    !owner.contains('/') && is_valid_image_name(owner)
}

/// Returns `true` if `platform` has the shape `os/arch` or `os/arch/variant`
/// with lowercase alphanumeric (or `_`) segments.
pub fn is_valid_platform(platform: &str) -> bool {
    let segments: Vec<&str> = platform.split('/').collect();
    (2..=3).contains(&segments.len())
        && segments.iter().all(|s| {
            !s.is_empty()
                && s.chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        })
}

// ---------------------------------------------------------------------------
// Registry access
// ---------------------------------------------------------------------------

/// The scope requested when authenticating to a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryAccess {
    /// Read-only access (`pull`).
    Pull,
    /// Read-write access (`push,pull`).
    Push,
}

impl RegistryAccess {
    /// Returns the action list used in a distribution-API token scope.
    pub fn scope_actions(self) -> &'static str {
        match self {
            RegistryAccess::Pull => "pull",
            RegistryAccess::Push => "push,pull",
        }
    }
}

/// Visibility of a package in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Anyone can pull.
    Public,
    /// Only users with explicit access can pull.
    Private,
    /// Members of the owning enterprise can pull.
    Internal,
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Visibility::Public => write!(f, "public"),
            Visibility::Private => write!(f, "private"),
            Visibility::Internal => write!(f, "internal"),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow runs
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow run or job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Requested,
    Queued,
    Pending,
    Waiting,
    InProgress,
    Completed,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    /// Returns `true` once the run can no longer change.
    pub fn is_terminal(self) -> bool {
        self == RunStatus::Completed
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Requested => "requested",
            RunStatus::Queued => "queued",
            RunStatus::Pending => "pending",
            RunStatus::Waiting => "waiting",
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Final outcome of a completed run, job, or step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunConclusion {
    Success,
    Failure,
    Cancelled,
    TimedOut,
    Skipped,
    Neutral,
    ActionRequired,
    Stale,
    StartupFailure,
    #[serde(other)]
    Unknown,
}

impl RunConclusion {
    /// Returns `true` for conclusions that count as a failed step or job.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            RunConclusion::Failure | RunConclusion::TimedOut | RunConclusion::StartupFailure
        )
    }
}

impl std::fmt::Display for RunConclusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunConclusion::Success => "success",
            RunConclusion::Failure => "failure",
            RunConclusion::Cancelled => "cancelled",
            RunConclusion::TimedOut => "timed_out",
            RunConclusion::Skipped => "skipped",
            RunConclusion::Neutral => "neutral",
            RunConclusion::ActionRequired => "action_required",
            RunConclusion::Stale => "stale",
            RunConclusion::StartupFailure => "startup_failure",
            RunConclusion::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Snapshot of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub status: RunStatus,
    /// `None` until the run completes.
    pub conclusion: Option<RunConclusion>,
    pub head_branch: Option<String>,
    pub head_sha: Option<CommitSha>,
    pub html_url: String,
    pub created_at: Timestamp,
}

/// One step of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub number: u32,
    pub name: String,
    pub status: RunStatus,
    pub conclusion: Option<RunConclusion>,
}

/// One job of a workflow run, with its steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub name: String,
    pub status: RunStatus,
    pub conclusion: Option<RunConclusion>,
    pub steps: Vec<StepSummary>,
}

impl JobSummary {
    /// Returns the first step whose conclusion counts as a failure.
    pub fn first_failed_step(&self) -> Option<&StepSummary> {
        self.steps
            .iter()
            .find(|step| step.conclusion.is_some_and(RunConclusion::is_failure))
    }
}

/// A run together with its jobs, as reported by `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run: WorkflowRun,
    pub jobs: Vec<JobSummary>,
}

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

/// Limits applied while waiting on a remote run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollSettings {
    /// Delay between two status reads.
    pub interval: Duration,
    /// Maximum wait for the dispatched run to appear.
    pub run_discovery_timeout: Duration,
    /// Maximum wait for the run to complete once found.
    pub build_timeout: Duration,
    /// Consecutive retryable read failures tolerated before giving up.
    pub max_poll_errors: u32,
    /// Allowance for the local clock running ahead of GitHub's when matching
    /// a run's `created_at` against the dispatch instant.
    pub clock_skew: Duration,
    /// Number of trailing log lines kept from a failed job.
    pub log_tail_lines: usize,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            run_discovery_timeout: Duration::from_secs(120),
            build_timeout: Duration::from_secs(3600),
            max_poll_errors: 3,
            clock_skew: Duration::from_secs(60),
            log_tail_lines: 40,
        }
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from a [`DateTime<Utc>`].
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }

    /// Returns this timestamp moved `by` into the past, saturating at the
    /// earliest representable instant.
    pub fn earlier_by(self, by: Duration) -> Self {
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        Self(self.0.checked_sub_signed(delta).unwrap_or(DateTime::<Utc>::MIN_UTC))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}
