//! Error and retry-policy types for the Slipway dispatch domain.
//!
//! [`DispatchError`] is what a caller of the [`crate::Dispatcher`] sees: one
//! distinct, user-visible variant per failure class. [`PortError`] is what an
//! infrastructure adapter reports back through a port trait; the dispatcher
//! translates it into a [`DispatchError`] according to the phase in which it
//! occurred (a `NotFound` while resolving the ref is a checkout failure, the
//! same `NotFound` while reading package visibility is a missing package).
//!
//! [`RetryPolicy`] is a cross-cutting concern: any error type that participates
//! in retry decisions must be able to produce a [`RetryPolicy`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// Returned by infrastructure error types to let the dispatcher decide
/// whether to re-invoke a read-only operation while polling.
///
/// ## Rules
///
/// - `Retryable` errors: transport failures, 5xx responses, rate limiting.
/// - `NonRetryable` errors: authentication failures, missing resources,
///   malformed responses, invalid requests.
///
/// Mutating calls (the workflow dispatch itself) are never retried,
/// whatever the policy says.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    ///
    /// `after` optionally specifies the minimum delay before retrying (e.g.
    /// derived from `Retry-After` or `x-ratelimit-reset` response headers).
    Retryable {
        /// Minimum back-off before the next attempt. `None` means apply the
        /// caller's own poll interval.
        after: Option<Duration>,
    },
    /// The operation must not be retried.
    NonRetryable,
}

impl RetryPolicy {
    /// Returns `true` for [`RetryPolicy::Retryable`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, RetryPolicy::Retryable { .. })
    }
}

// ---------------------------------------------------------------------------
// Port-level errors
// ---------------------------------------------------------------------------

/// Errors reported by infrastructure adapters through the port traits in
/// [`crate::ports`].
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum PortError {
    /// The addressed resource (repository, ref, workflow, run, package,
    /// manifest) does not exist or is not visible with the current credentials.
    #[error("Not found: {what}")]
    NotFound {
        /// Description of what was looked up.
        what: String,
    },

    /// The remote rejected the credentials.
    #[error("Unauthorized: {message}")]
    Unauthorized {
        /// Message returned by the remote, if any.
        message: String,
    },

    /// The remote is throttling requests.
    #[error("Rate limited")]
    RateLimited {
        /// Advised delay before the next attempt.
        retry_after: Option<Duration>,
    },

    /// The request never produced a response (DNS, TLS, connection reset, timeout).
    #[error("Transport error: {message}")]
    Transport {
        /// Underlying transport error message.
        message: String,
    },

    /// The remote answered with a status the adapter does not map to any of
    /// the variants above.
    #[error("Unexpected response {status}: {body}")]
    UnexpectedResponse {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated by the adapter.
        body: String,
    },

    /// The response body could not be decoded.
    #[error("Could not decode response: {message}")]
    Decode {
        /// Decoder error message.
        message: String,
    },
}

impl PortError {
    /// Classifies this error for polling retries.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            PortError::RateLimited { retry_after } => RetryPolicy::Retryable {
                after: *retry_after,
            },
            PortError::Transport { .. } => RetryPolicy::Retryable { after: None },
            PortError::UnexpectedResponse { status, .. } if *status >= 500 => {
                RetryPolicy::Retryable { after: None }
            }
            _ => RetryPolicy::NonRetryable,
        }
    }
}

/// Result type returned by every port trait method.
pub type PortResult<T> = Result<T, PortError>;

// ---------------------------------------------------------------------------
// Dispatch-level errors
// ---------------------------------------------------------------------------

/// The phase of a dispatch that ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitPhase {
    /// Waiting for the dispatched run to appear in the runs list.
    RunDiscovery,
    /// Waiting for the discovered run to complete.
    Build,
}

impl std::fmt::Display for WaitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitPhase::RunDiscovery => write!(f, "run discovery"),
            WaitPhase::Build => write!(f, "build"),
        }
    }
}

/// Distinct, user-visible failures of a dispatch or of one of the
/// supporting operations.
///
/// Every variant maps to a stable [`DispatchError::kind`] string used in JSON
/// output and exit-code selection.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum DispatchError {
    /// The build request violates one or more invariants. Nothing was contacted.
    #[error("Invalid build request: {}", problems.join("; "))]
    InvalidRequest {
        /// Every problem found, in field order.
        problems: Vec<String>,
    },

    /// The source repository, branch, or workflow could not be checked out.
    #[error("Checkout failed for {reference}: {reason}")]
    CheckoutFailed {
        /// `owner/repo@ref` (or the workflow path) that could not be resolved.
        reference: String,
        /// Human-readable cause.
        reason: String,
    },

    /// A build step (compilation, packaging, Dockerfile instruction) failed.
    #[error("Build failed: {reason}")]
    BuildFailed {
        /// Human-readable cause, usually naming the failed job and step.
        reason: String,
    },

    /// The registry rejected the credentials.
    #[error("Registry authentication failed for {registry}: {reason}")]
    RegistryAuthFailed {
        /// Registry host.
        registry: String,
        /// Human-readable cause.
        reason: String,
    },

    /// The image was built but did not arrive in the registry.
    #[error("Push failed for {image}: {reason}")]
    PushFailed {
        /// The image reference that is missing.
        image: String,
        /// Human-readable cause.
        reason: String,
    },

    /// The run was cancelled before it completed.
    #[error("Run was cancelled")]
    Cancelled,

    /// A wait phase exceeded its configured limit. The remote run, if any, is
    /// left running.
    #[error("Timed out during {phase} after {}s", waited.as_secs())]
    Timeout {
        /// The phase that timed out.
        phase: WaitPhase,
        /// How long the dispatcher waited.
        waited: Duration,
    },

    /// The package backing an image does not exist.
    #[error("Package not found: {package}")]
    PackageNotFound {
        /// `owner/image`.
        package: String,
    },

    /// The package is not public and GitHub offers no API to change that;
    /// a human must flip the setting.
    #[error("Package {package} is {visibility}; change it to public at {settings_url}")]
    VisibilityChangeRequired {
        /// `owner/image`.
        package: String,
        /// Current visibility.
        visibility: String,
        /// Page where the visibility can be changed.
        settings_url: String,
    },

    /// An infrastructure failure that does not fit any class above.
    #[error("Infrastructure error: {message}")]
    Infrastructure {
        /// Description of the failure.
        message: String,
        /// Whether the failed operation could be retried.
        retry: RetryPolicy,
    },

    /// The runtime configuration is invalid (e.g. no token).
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },
}

impl DispatchError {
    /// Stable snake_case identifier for this error class.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::InvalidRequest { .. } => "invalid_request",
            DispatchError::CheckoutFailed { .. } => "checkout_failed",
            DispatchError::BuildFailed { .. } => "build_failed",
            DispatchError::RegistryAuthFailed { .. } => "registry_auth_failed",
            DispatchError::PushFailed { .. } => "push_failed",
            DispatchError::Cancelled => "cancelled",
            DispatchError::Timeout { .. } => "timeout",
            DispatchError::PackageNotFound { .. } => "package_not_found",
            DispatchError::VisibilityChangeRequired { .. } => "visibility_change_required",
            DispatchError::Infrastructure { .. } => "infrastructure",
            DispatchError::Configuration { .. } => "configuration",
        }
    }

    /// Whether resubmitting the same request could plausibly succeed without
    /// changing anything.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            DispatchError::Infrastructure { retry, .. } => retry.clone(),
            DispatchError::Timeout { .. } => RetryPolicy::Retryable { after: None },
            _ => RetryPolicy::NonRetryable,
        }
    }

    /// Wraps a [`PortError`] that has no phase-specific meaning.
    pub fn infrastructure(err: PortError) -> Self {
        DispatchError::Infrastructure {
            retry: err.retry_policy(),
            message: err.to_string(),
        }
    }
}
