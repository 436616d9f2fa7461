//! OCI distribution API client: [`ContainerRegistry`].
//!
//! Authentication follows the registry token flow:
//!
//! 1. `GET /v2/` answers `401` with a `WWW-Authenticate: Bearer realm=..,service=..`
//!    challenge (or `200` when the registry is open).
//! 2. The realm issues a token for `repository:<owner>/<image>:<actions>`,
//!    using HTTP basic credentials when configured and anonymously otherwise.
//! 3. Manifest requests carry the token as a bearer credential.
//!
//! Credentials are bound to one registry host. They are sent only to that
//! host, and to a token realm only when the realm is served by that same
//! host; every other registry is treated anonymously.
//!
//! Tokens are cached per repository path and access level for the life of
//! the client.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use dispatch::{
    ContainerRegistry, ImageReference, PortError, PortResult, RegistryAccess, RegistryHost,
};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT, WWW_AUTHENTICATE};
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::client::{GithubError, Secret};
use crate::response::{error_for_status, transport_error};

/// Manifest media types accepted when checking for a tag.
const MANIFEST_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.docker.distribution.manifest.v2+json";

/// Username and token used for the registry's basic-auth token exchange.
#[derive(Debug, Clone)]
pub struct RegistryCredentials {
    /// The only registry host (`name[:port]`) these credentials are sent to.
    pub registry: RegistryHost,
    pub username: String,
    pub token: Secret,
}

/// How requests to one repository are authorised.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Authorization {
    /// The registry answered `/v2/` without a challenge.
    Open,
    /// The registry asked for basic credentials directly.
    Basic,
    /// A token issued by the challenge realm.
    Bearer(String),
}

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Challenge {
    Bearer {
        realm: String,
        service: Option<String>,
    },
    Basic,
}

#[derive(Debug, Deserialize)]
struct TokenDto {
    token: Option<String>,
    access_token: Option<String>,
}

/// Registry client for GHCR or any distribution-API registry.
#[derive(Debug)]
pub struct RegistryClient {
    http: reqwest::Client,
    credentials: Option<RegistryCredentials>,
    tokens: Mutex<HashMap<String, Authorization>>,
}

impl RegistryClient {
    /// Builds a client; `credentials` of `None` means anonymous pulls only.
    pub fn new(
        credentials: Option<RegistryCredentials>,
        timeout: std::time::Duration,
    ) -> Result<Self, GithubError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(crate::USER_AGENT));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            credentials,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Returns `true` if credentials are configured.
    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Returns the credentials if they belong to `host`.
    fn credentials_for(&self, host: &str) -> Option<&RegistryCredentials> {
        self.credentials
            .as_ref()
            .filter(|creds| creds.registry.as_str().eq_ignore_ascii_case(host))
    }

    fn with_basic(&self, builder: RequestBuilder, host: &str) -> RequestBuilder {
        match self.credentials_for(host) {
            Some(creds) => builder.basic_auth(&creds.username, Some(creds.token.expose())),
            None => builder,
        }
    }

    fn apply(&self, builder: RequestBuilder, auth: &Authorization, host: &str) -> RequestBuilder {
        match auth {
            Authorization::Open => builder,
            Authorization::Basic => self.with_basic(builder, host),
            Authorization::Bearer(token) => builder.bearer_auth(token),
        }
    }

    /// Builds the token request; basic credentials go along only when the
    /// realm is served by `registry` itself.
    fn token_request(&self, registry: &str, realm: &str, query: &[(&str, &str)]) -> RequestBuilder {
        let request = self.http.get(realm).query(query);
        let same_host =
            url_authority(realm).is_some_and(|host| host.eq_ignore_ascii_case(registry));
        if same_host {
            self.with_basic(request, registry)
        } else {
            if self.credentials_for(registry).is_some() {
                debug!(
                    realm = %realm,
                    registry = %registry,
                    "token realm is on another host; requesting anonymously"
                );
            }
            request
        }
    }

    async fn authorization(
        &self,
        image: &ImageReference,
        access: RegistryAccess,
    ) -> PortResult<Authorization> {
        let key = format!(
            "{}/{}#{}",
            image.registry(),
            image.repository_path(),
            access.scope_actions()
        );
        if let Some(auth) = self.tokens.lock().ok().and_then(|t| t.get(&key).cloned()) {
            return Ok(auth);
        }

        let auth = self.negotiate(image, access).await?;
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(key, auth.clone());
        }
        Ok(auth)
    }

    async fn negotiate(
        &self,
        image: &ImageReference,
        access: RegistryAccess,
    ) -> PortResult<Authorization> {
        let registry = image.registry().as_str();
        let base = base_url(registry);
        let response = self
            .http
            .get(format!("{base}/v2/"))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(Authorization::Open);
        }
        if status != StatusCode::UNAUTHORIZED {
            return Err(read_error(response, "registry").await);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_challenge)
            .ok_or_else(|| PortError::UnexpectedResponse {
                status: 401,
                body: "registry sent no usable WWW-Authenticate challenge".to_string(),
            })?;

        match challenge {
            Challenge::Basic if self.credentials_for(registry).is_some() => Ok(Authorization::Basic),
            Challenge::Basic => Err(PortError::Unauthorized {
                message: format!("registry {registry} requires credentials"),
            }),
            Challenge::Bearer { realm, service } => {
                let scope = format!(
                    "repository:{}:{}",
                    image.repository_path(),
                    access.scope_actions()
                );
                let mut query = vec![("scope", scope.as_str())];
                if let Some(service) = service.as_deref() {
                    query.push(("service", service));
                }
                let response = self
                    .token_request(registry, &realm, &query)
                    .send()
                    .await
                    .map_err(transport_error)?;
                if !response.status().is_success() {
                    return Err(read_error(response, "registry token").await);
                }
                let body = response.text().await.map_err(transport_error)?;
                let dto: TokenDto = crate::client::decode(&body)?;
                let token = dto.token.or(dto.access_token).ok_or_else(|| PortError::Decode {
                    message: "token response carries no token".to_string(),
                })?;
                debug!(scope = %scope, "obtained registry token");
                Ok(Authorization::Bearer(token))
            }
        }
    }
}

async fn read_error(response: reqwest::Response, what: &str) -> PortError {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();
    error_for_status(status, &headers, &body, what, chrono::Utc::now().timestamp())
}

/// Returns `host[:port]` of `url`, or `None` if it does not parse.
fn url_authority(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Returns the base URL for a registry host; local registries speak plain HTTP.
pub(crate) fn base_url(host: &str) -> String {
    let hostname = host.split(':').next().unwrap_or(host);
    if hostname == "localhost" || hostname == "127.0.0.1" {
        format!("http://{host}")
    } else {
        format!("https://{host}")
    }
}

/// Parses a `WWW-Authenticate` header value.
pub(crate) fn parse_challenge(header: &str) -> Option<Challenge> {
    let (scheme, params) = header
        .trim()
        .split_once(' ')
        .unwrap_or((header.trim(), ""));
    if scheme.eq_ignore_ascii_case("basic") {
        return Some(Challenge::Basic);
    }
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let params = parse_params(params);
    let realm = params.get("realm")?.clone();
    Some(Challenge::Bearer {
        realm,
        service: params.get("service").cloned(),
    })
}

/// Splits `key="value",key2="v,2"` pairs; commas inside quotes are kept.
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();
        let after = after.trim_start();
        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };
        params.insert(key, value.to_string());
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }
    params
}

#[async_trait]
impl ContainerRegistry for RegistryClient {
    #[instrument(skip_all, fields(image = %image, access = ?access))]
    async fn authenticate(&self, image: &ImageReference, access: RegistryAccess) -> PortResult<()> {
        if access == RegistryAccess::Push
            && self.credentials_for(image.registry().as_str()).is_none()
        {
            return Err(PortError::Unauthorized {
                message: format!("no registry credentials configured for {}", image.registry()),
            });
        }
        self.authorization(image, access).await.map(|_| ())
    }

    #[instrument(skip_all, fields(image = %image))]
    async fn manifest_exists(&self, image: &ImageReference) -> PortResult<bool> {
        let auth = self.authorization(image, RegistryAccess::Pull).await?;
        let url = format!(
            "{}/v2/{}/manifests/{}",
            base_url(image.registry().as_str()),
            image.repository_path(),
            image.tag()
        );
        let request = self.apply(
            self.http.head(url).header(ACCEPT, MANIFEST_TYPES),
            &auth,
            image.registry().as_str(),
        );
        let response = request.send().await.map_err(transport_error)?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(read_error(response, &image.to_string()).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::AUTHORIZATION;
    use std::time::Duration;

    fn ghcr_client() -> RegistryClient {
        RegistryClient::new(
            Some(RegistryCredentials {
                registry: RegistryHost::new("ghcr.io").unwrap(),
                username: "octo".into(),
                token: Secret::new("ghp_secret").unwrap(),
            }),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn has_authorization(builder: RequestBuilder) -> bool {
        builder.build().unwrap().headers().contains_key(AUTHORIZATION)
    }

    #[test]
    fn test_parse_ghcr_challenge() {
        let challenge = parse_challenge(
            r#"Bearer realm="https://ghcr.io/token",service="ghcr.io",scope="repository:octo-org/widget:pull""#,
        );
        assert_eq!(
            challenge,
            Some(Challenge::Bearer {
                realm: "https://ghcr.io/token".into(),
                service: Some("ghcr.io".into()),
            })
        );
    }

    #[test]
    fn test_quoted_commas_do_not_split_params() {
        let params = parse_params(
            r#"realm="https://auth.example.com/token", scope="repository:a/b:push,pull",service=registry"#,
        );
        assert_eq!(params["scope"], "repository:a/b:push,pull");
        assert_eq!(params["service"], "registry");
        assert_eq!(params["realm"], "https://auth.example.com/token");
    }

    #[test]
    fn test_parse_basic_and_unknown_challenges() {
        assert_eq!(parse_challenge(r#"Basic realm="Registry""#), Some(Challenge::Basic));
        assert_eq!(parse_challenge("Negotiate abc"), None);
        assert_eq!(parse_challenge(r#"Bearer service="x""#), None);
    }

    #[test]
    fn test_local_registries_use_plain_http() {
        assert_eq!(base_url("localhost:5000"), "http://localhost:5000");
        assert_eq!(base_url("127.0.0.1"), "http://127.0.0.1");
        assert_eq!(base_url("ghcr.io"), "https://ghcr.io");
    }

    #[test]
    fn test_basic_credentials_only_reach_their_registry() {
        let client = ghcr_client();
        let basic = |url: &str, host: &str| {
            has_authorization(client.apply(client.http.head(url), &Authorization::Basic, host))
        };
        assert!(basic("https://ghcr.io/v2/octo/app/manifests/v1", "ghcr.io"));
        assert!(basic("https://ghcr.io/v2/octo/app/manifests/v1", "GHCR.io"));
        assert!(!basic("https://quay.io/v2/x/y/manifests/t", "quay.io"));
        assert!(!basic("http://127.0.0.1:5000/v2/other/app/manifests/latest", "127.0.0.1:5000"));
    }

    #[test]
    fn test_token_realm_on_foreign_host_gets_no_credentials() {
        let client = ghcr_client();
        let query = [("scope", "repository:octo/app:pull")];

        assert!(has_authorization(client.token_request("ghcr.io", "https://ghcr.io/token", &query)));
        assert!(!has_authorization(client.token_request(
            "ghcr.io",
            "https://auth.example.com/token",
            &query
        )));
        assert!(!has_authorization(client.token_request(
            "127.0.0.1:5000",
            "http://127.0.0.1:5000/token",
            &query
        )));
    }

    #[test]
    fn test_url_authority_keeps_explicit_port() {
        assert_eq!(url_authority("https://ghcr.io/token").as_deref(), Some("ghcr.io"));
        assert_eq!(
            url_authority("http://localhost:5000/token").as_deref(),
            Some("localhost:5000")
        );
        assert_eq!(url_authority("not a url"), None);
    }

    #[tokio::test]
    async fn test_push_to_other_registry_is_unauthorized() {
        let client = ghcr_client();
        let image = ImageReference::parse("quay.io/octo/app:latest").unwrap();

        let err = client
            .authenticate(&image, RegistryAccess::Push)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            PortError::Unauthorized {
                message: "no registry credentials configured for quay.io".into()
            }
        );
    }

    #[tokio::test]
    async fn test_push_without_credentials_is_unauthorized() {
        let client = RegistryClient::new(None, Duration::from_secs(5)).unwrap();
        let image = ImageReference::parse("ghcr.io/octo-org/widget:latest").unwrap();

        let err = client
            .authenticate(&image, RegistryAccess::Push)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            PortError::Unauthorized {
                message: "no registry credentials configured for ghcr.io".into()
            }
        );
        assert!(!client.has_credentials());
    }
}
