//! `slipway.toml` loading.
//!
//! Every key is optional. Precedence is CLI flag, then file value, then the
//! built-in default; flags are applied by the command handlers.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dispatch::{PollSettings, DEFAULT_REGISTRY};
use github::{Secret, DEFAULT_API_URL};
use serde::Deserialize;

/// File looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "slipway.toml";

/// Environment variables consulted for the GitHub token after the configured one.
const FALLBACK_TOKEN_VARS: [&str; 2] = ["GITHUB_TOKEN", "GH_TOKEN"];

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SlipwayConfig {
    pub github: GithubSection,
    pub registry: RegistrySection,
    pub defaults: DefaultsSection,
    pub polling: PollingSection,
    pub telemetry: TelemetrySection,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GithubSection {
    pub api_url: String,
    /// Name of the environment variable holding the token.
    pub token_env: String,
    pub request_timeout_secs: u64,
}

impl Default for GithubSection {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistrySection {
    pub host: String,
    /// Registry login; the image owner when unset.
    pub username: Option<String>,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            host: DEFAULT_REGISTRY.to_string(),
            username: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DefaultsSection {
    pub workflow: String,
    pub dockerfile: String,
    pub context: String,
    pub platforms: Vec<String>,
}

impl Default for DefaultsSection {
    fn default() -> Self {
        Self {
            workflow: "docker-publish.yml".to_string(),
            dockerfile: "Dockerfile".to_string(),
            context: ".".to_string(),
            platforms: vec!["linux/amd64".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollingSection {
    pub interval_secs: u64,
    pub build_timeout_secs: u64,
    pub run_discovery_timeout_secs: u64,
    pub max_poll_errors: u32,
}

impl Default for PollingSection {
    fn default() -> Self {
        let defaults = PollSettings::default();
        Self {
            interval_secs: defaults.interval.as_secs(),
            build_timeout_secs: defaults.build_timeout.as_secs(),
            run_discovery_timeout_secs: defaults.run_discovery_timeout.as_secs(),
            max_poll_errors: defaults.max_poll_errors,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetrySection {
    /// OTLP gRPC endpoint; spans are exported only when set.
    pub otlp_endpoint: Option<String>,
}

impl SlipwayConfig {
    /// Loads `explicit` if given (it must exist), otherwise `slipway.toml` in
    /// the working directory if present, otherwise the defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        Self::load_or_default(explicit, Path::new(DEFAULT_CONFIG_FILE))
    }

    fn load_or_default(explicit: Option<&Path>, fallback: &Path) -> Result<Self> {
        match explicit {
            Some(path) => Self::load_from(path),
            None if fallback.is_file() => Self::load_from(fallback),
            None => Ok(Self::default()),
        }
    }

    /// Reads and validates one file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.polling.interval_secs == 0 {
            bail!("polling.interval_secs must be at least 1");
        }
        if self.polling.build_timeout_secs == 0 || self.polling.run_discovery_timeout_secs == 0 {
            bail!("polling timeouts must be at least 1 second");
        }
        if self.github.token_env.trim().is_empty() {
            bail!("github.token_env must name an environment variable");
        }
        Ok(())
    }

    /// Poll settings for the dispatcher.
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_secs(self.polling.interval_secs),
            build_timeout: Duration::from_secs(self.polling.build_timeout_secs),
            run_discovery_timeout: Duration::from_secs(self.polling.run_discovery_timeout_secs),
            max_poll_errors: self.polling.max_poll_errors,
            ..PollSettings::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.github.request_timeout_secs.max(1))
    }

    /// Reads the GitHub token from the process environment.
    pub fn token(&self) -> Option<Secret> {
        self.token_from(|name| std::env::var(name).ok())
    }

    /// Resolves the token through `lookup`: the configured variable first,
    /// then `GITHUB_TOKEN`, then `GH_TOKEN`.
    pub fn token_from(&self, lookup: impl Fn(&str) -> Option<String>) -> Option<Secret> {
        std::iter::once(self.github.token_env.as_str())
            .chain(FALLBACK_TOKEN_VARS)
            .find_map(|name| lookup(name).and_then(Secret::new))
    }

    /// OTLP endpoint from the file, else `OTEL_EXPORTER_OTLP_ENDPOINT`.
    pub fn otlp_endpoint(&self) -> Option<String> {
        self.telemetry
            .otlp_endpoint
            .clone()
            .or_else(|| std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok())
            .filter(|endpoint| !endpoint.trim().is_empty())
    }
}
