//! Authenticated GitHub REST client.
//!
//! [`GithubClient`] owns the `reqwest::Client`, the API base URL, and the
//! token. Every request carries the versioned media type and API version
//! headers; every non-success response is mapped through
//! [`crate::response::error_for_status`].

use std::collections::HashMap;
use std::sync::Mutex;

use dispatch::{PortError, PortResult};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::response::{error_for_status, transport_error};

/// Public GitHub API endpoint.
pub const DEFAULT_API_URL: &str = "https://api.github.com";

const API_VERSION: &str = "2022-11-28";
const MEDIA_TYPE: &str = "application/vnd.github+json";

/// A credential that never appears in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wraps a credential, returning `None` if it is empty.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let v = value.into();
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    /// Returns the credential for use in a request header.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret(***)")
    }
}

/// Errors constructing a client.
#[derive(Debug, Error)]
pub enum GithubError {
    /// The underlying HTTP client could not be built (TLS backend, proxy settings).
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Connection settings for [`GithubClient`].
#[derive(Debug, Clone)]
pub struct GithubConfig {
    /// API base URL without trailing slash (GitHub Enterprise uses `https://host/api/v3`).
    pub api_url: String,
    /// Token with `repo`, `workflow`, and `read:packages` scopes (or the
    /// fine-grained equivalents).
    pub token: Option<Secret>,
    /// Request timeout.
    pub timeout: std::time::Duration,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            token: None,
            timeout: std::time::Duration::from_secs(30),
        }
    }
}

/// Whether a package owner is a user or an organisation; GitHub serves their
/// packages under different paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OwnerKind {
    User,
    Organization,
}

impl OwnerKind {
    pub(crate) fn path_segment(self) -> &'static str {
        match self {
            OwnerKind::User => "users",
            OwnerKind::Organization => "orgs",
        }
    }
}

/// GitHub REST client implementing the source, workflow, and package ports.
#[derive(Debug)]
pub struct GithubClient {
    http: reqwest::Client,
    api_url: String,
    token: Option<Secret>,
    pub(crate) owner_kinds: Mutex<HashMap<String, OwnerKind>>,
}

impl GithubClient {
    /// Builds a client from `config`.
    pub fn new(config: GithubConfig) -> Result<Self, GithubError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(MEDIA_TYPE));
        headers.insert("x-github-api-version", HeaderValue::from_static(API_VERSION));
        headers.insert(USER_AGENT, HeaderValue::from_static(crate::USER_AGENT));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token,
            owner_kinds: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the absolute URL for an API path starting with `/`.
    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token.expose()),
            None => builder,
        }
    }

    pub(crate) fn get(&self, path: &str) -> RequestBuilder {
        self.authorize(self.http.get(self.url(path)))
    }

    pub(crate) fn post(&self, path: &str) -> RequestBuilder {
        self.authorize(self.http.post(self.url(path)))
    }

    /// Sends `builder` and returns the response if its status is a success.
    pub(crate) async fn send(&self, builder: RequestBuilder, what: &str) -> PortResult<Response> {
        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        debug!(status = status.as_u16(), url = %response.url(), "github response");
        if status.is_success() {
            return Ok(response);
        }

        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        Err(error_for_status(
            status,
            &headers,
            &body,
            what,
            chrono::Utc::now().timestamp(),
        ))
    }

    /// GETs `path` and decodes the JSON body.
    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        what: &str,
    ) -> PortResult<T> {
        let response = self.send(self.get(path).query(query), what).await?;
        let body = response.text().await.map_err(transport_error)?;
        decode(&body)
    }
}

/// Decodes a JSON body, reporting failures as [`PortError::Decode`].
pub(crate) fn decode<T: DeserializeOwned>(body: &str) -> PortResult<T> {
    serde_json::from_str(body).map_err(|err| PortError::Decode {
        message: err.to_string(),
    })
}
