//! Core dispatch domain for Slipway.
//!
//! This crate contains every domain concept, newtype identifier, shared value
//! type, and error type used to turn a build request into a published
//! container image. Infrastructure crates implement the port traits defined
//! here; they never add domain rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate performs no I/O of its
//! own. It defines *what* is needed; infrastructure crates define *how* to
//! supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`RepositoryId`, `ImageTag`, `RunId`, etc.) |
//! | [`types`] | Value types (`ImageReference`, `WorkflowRun`, `PollSettings`, etc.) |
//! | [`request`] | `BuildRequest`, `BuildResult` |
//! | [`errors`] | `DispatchError`, `PortError`, `RetryPolicy` |
//! | [`ports`] | Traits implemented by infrastructure adapters |
//! | [`classify`] | Failure classification of completed runs |
//! | [`dispatcher`] | The `Dispatcher` |
//! | `fakes` | In-memory port implementations (tests and the `fakes` feature) |

pub mod classify;
pub mod dispatcher;
pub mod errors;
pub mod identifiers;
pub mod ports;
pub mod request;
pub mod types;

#[cfg(any(test, feature = "fakes"))]
pub mod fakes;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use classify::FailureKind;
pub use dispatcher::{Dispatcher, WaitMode};
pub use errors::{DispatchError, PortError, PortResult, RetryPolicy, WaitPhase};
pub use identifiers::{
    CommitSha, DispatchId, GitRef, ImageName, ImageTag, JobId, Namespace, Platform, RegistryHost,
    RepositoryId, RunId, SourcePath, WorkflowFile,
};
pub use ports::{ContainerRegistry, PackageVisibility, SourceHost, WorkflowRunner};
pub use request::{
    BuildOutcome, BuildRequest, BuildResult, RunHandle, WorkflowInputs, DEFAULT_REGISTRY,
};
pub use types::{
    ImageReference, ImageReferenceParseError, JobSummary, PollSettings, RegistryAccess,
    RunConclusion, RunReport, RunStatus, StepSummary, Timestamp, Visibility, WorkflowRun,
};
