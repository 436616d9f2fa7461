//! GitHub Packages metadata: [`PackageVisibility`].
//!
//! Container packages live under `/users/{owner}` or `/orgs/{owner}`
//! depending on the owner's account type. The type is looked up once per
//! owner and cached on the client, so the synchronous
//! [`PackageVisibility::settings_url`] can build the right web link after
//! [`PackageVisibility::visibility`] has run.

use async_trait::async_trait;
use dispatch::{ImageName, Namespace, PackageVisibility, PortError, PortResult, Visibility};
use serde::Deserialize;
use tracing::{debug, instrument};

use urlencoding::encode;

use crate::client::{GithubClient, OwnerKind};

/// Web host for settings links.
const WEB_URL: &str = "https://github.com";

#[derive(Debug, Deserialize)]
struct AccountDto {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct PackageDto {
    visibility: Visibility,
}

impl GithubClient {
    fn cached_owner_kind(&self, owner: &str) -> Option<OwnerKind> {
        self.owner_kinds
            .lock()
            .ok()
            .and_then(|kinds| kinds.get(owner).copied())
    }

    async fn owner_kind(&self, owner: &Namespace) -> PortResult<OwnerKind> {
        let key = owner.as_str().to_lowercase();
        if let Some(kind) = self.cached_owner_kind(&key) {
            return Ok(kind);
        }

        let path = format!("/users/{}", encode(owner.as_str()));
        let account: AccountDto = self
            .get_json(&path, &[], &format!("account {owner}"))
            .await?;
        let kind = owner_kind_from(&account.kind);
        debug!(owner = %owner, kind = ?kind, "resolved package owner kind");

        if let Ok(mut kinds) = self.owner_kinds.lock() {
            kinds.insert(key, kind);
        }
        Ok(kind)
    }
}

fn owner_kind_from(account_type: &str) -> OwnerKind {
    if account_type.eq_ignore_ascii_case("organization") {
        OwnerKind::Organization
    } else {
        OwnerKind::User
    }
}

fn package_path(kind: OwnerKind, namespace: &Namespace, image: &ImageName) -> String {
    format!(
        "/{}/{}/packages/container/{}",
        kind.path_segment(),
        encode(namespace.as_str()),
        encode(image.as_str())
    )
}

#[async_trait]
impl PackageVisibility for GithubClient {
    #[instrument(skip_all, fields(namespace = %namespace, image = %image))]
    async fn visibility(
        &self,
        namespace: &Namespace,
        image: &ImageName,
    ) -> PortResult<Visibility> {
        let kind = match self.owner_kind(namespace).await {
            Err(PortError::NotFound { .. }) => {
                return Err(PortError::NotFound {
                    what: format!("package {namespace}/{image}"),
                })
            }
            other => other?,
        };
        let path = package_path(kind, namespace, image);
        let package: PackageDto = self
            .get_json(&path, &[], &format!("package {namespace}/{image}"))
            .await?;
        Ok(package.visibility)
    }

    fn settings_url(&self, namespace: &Namespace, image: &ImageName) -> String {
        let kind = self
            .cached_owner_kind(&namespace.as_str().to_lowercase())
            .unwrap_or(OwnerKind::User);
        format!("{WEB_URL}{}/settings", package_path(kind, namespace, image))
    }
}
