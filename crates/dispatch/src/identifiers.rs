//! Newtype domain identifiers.
//!
//! Every value that names something in a build request is represented as a
//! distinct newtype wrapping a primitive. This prevents accidentally
//! interchanging, for example, an [`ImageTag`] with a [`GitRef`] even though
//! both are plain strings under the hood.
//!
//! Constructors reject empty values only. Format rules (tag grammar, platform
//! shape, relative paths) are checked by [`crate::BuildRequest::validate`] so
//! that every problem in a request can be reported at once.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty
            /// or whitespace only.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                let trimmed = v.trim();
                if trimmed.is_empty() {
                    None
                } else if trimmed.len() == v.len() {
                    Some(Self(v))
                } else {
                    Some(Self(trimmed.to_string()))
                }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Macro for u64-wrapped newtypes (GitHub-assigned integers).
// Generates: struct (Copy), new(), as_u64(), Display.
// ---------------------------------------------------------------------------
macro_rules! u64_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new identifier from a raw integer.
            pub fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the underlying integer value.
            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identifiers: GitHub-integer-backed
// ---------------------------------------------------------------------------

u64_id! {
    /// Identifies one GitHub Actions workflow run.
    RunId
}

u64_id! {
    /// Identifies one job within a workflow run.
    JobId
}

// ---------------------------------------------------------------------------
// Identifiers: UUID-backed (internally generated)
// ---------------------------------------------------------------------------

/// Identifies a single dispatch (one invocation of `submit`).
///
/// Generated fresh for every submission; passed to the workflow as the
/// `dispatch_id` input and recorded on every span so that a remote run can be
/// correlated with the local invocation that triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchId(Uuid);

impl DispatchId {
    /// Generates a new random dispatch identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a [`DispatchId`] from an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying [`Uuid`].
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for DispatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Identifiers: String-backed (configuration / Git / registry names)
// ---------------------------------------------------------------------------

string_id! {
    /// Identifies a GitHub repository in `"owner/repo"` format.
    RepositoryId
}

impl RepositoryId {
    /// Returns the owner half of `owner/repo`, or the whole value when no `/`
    /// is present.
    pub fn owner(&self) -> &str {
        self.0.split_once('/').map_or(self.0.as_str(), |(o, _)| o)
    }

    /// Returns the repository-name half of `owner/repo`, or `""` when no `/`
    /// is present.
    pub fn name(&self) -> &str {
        self.0.split_once('/').map_or("", |(_, n)| n)
    }

    /// Returns `true` when the value has exactly one `/` with non-empty halves.
    pub fn is_well_formed(&self) -> bool {
        match self.0.split_once('/') {
            Some((owner, name)) => !owner.is_empty() && !name.is_empty() && !name.contains('/'),
            None => false,
        }
    }
}

string_id! {
    /// A Git branch name or other ref (e.g. `"main"`, `"refs/tags/v1.0.0"`).
    GitRef
}

impl GitRef {
    /// Returns the short branch or tag name, stripping a leading
    /// `refs/heads/` or `refs/tags/`.
    ///
    /// The Actions runs API filters on the short name and records it as the
    /// run's `head_branch`.
    pub fn branch_name(&self) -> &str {
        self.0
            .strip_prefix("refs/heads/")
            .or_else(|| self.0.strip_prefix("refs/tags/"))
            .unwrap_or(&self.0)
    }
}

string_id! {
    /// A Git commit SHA (40-character lowercase hex string).
    CommitSha
}

string_id! {
    /// A container image name within a registry namespace (e.g. `"my-app"`,
    /// `"tools/builder"`).
    ImageName
}

string_id! {
    /// A container image tag (e.g. `"latest"`, `"v1.2.3"`).
    ImageTag
}

string_id! {
    /// A build platform in `os/arch[/variant]` form (e.g. `"linux/amd64"`).
    Platform
}

string_id! {
    /// The file name (or numeric id) of the workflow to dispatch, as accepted by
    /// the Actions API (e.g. `"docker-publish.yml"`).
    WorkflowFile
}

string_id! {
    /// A container registry host name (e.g. `"ghcr.io"`).
    RegistryHost
}

string_id! {
    /// The user or organisation that owns an image in the registry.
    Namespace
}

impl Namespace {
    /// Returns the owner of `repository` as an image namespace.
    pub fn from_repository(repository: &RepositoryId) -> Self {
        match repository.owner() {
            "" => Self(repository.as_str().to_string()),
            owner => Self(owner.to_string()),
        }
    }
}

string_id! {
    /// A file-system path relative to the repository root (Dockerfile or
    /// build context).
    SourcePath
}

impl SourcePath {
    /// Returns `true` when the path is relative and never escapes the
    /// repository root through a `..` component.
    pub fn is_confined(&self) -> bool {
        !self.0.starts_with('/')
            && !self.0.starts_with('\\')
            && !self.0.split(['/', '\\']).any(|component| component == "..")
    }
}
