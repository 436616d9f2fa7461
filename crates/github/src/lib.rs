//! Slipway GitHub infrastructure adapter.
//!
//! Implements the port traits defined in the [`dispatch`] crate:
//!
//! | Trait                          | Implementor        | Backing API                    |
//! |--------------------------------|--------------------|--------------------------------|
//! | [`dispatch::SourceHost`]       | [`GithubClient`]   | `GET /repos/{o}/{r}/commits`   |
//! | [`dispatch::WorkflowRunner`]   | [`GithubClient`]   | GitHub Actions REST endpoints  |
//! | [`dispatch::PackageVisibility`]| [`GithubClient`]   | GitHub Packages REST endpoints |
//! | [`dispatch::ContainerRegistry`]| [`RegistryClient`] | OCI distribution API (`/v2/`)  |
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** This crate must not contain domain rules.
//! HTTP status codes, rate-limit headers, and registry challenges are
//! translated into [`dispatch::PortError`] here; the [`dispatch`] crate never
//! sees them. Retrying is the dispatcher's decision, not this crate's.

mod actions;
mod client;
mod packages;
mod registry;
mod response;

pub use client::{GithubClient, GithubConfig, GithubError, Secret, DEFAULT_API_URL};
pub use registry::{RegistryClient, RegistryCredentials};

/// `User-Agent` sent on every request.
pub const USER_AGENT: &str = concat!("slipway/", env!("CARGO_PKG_VERSION"));
