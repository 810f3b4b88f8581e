//! Harness configuration loading.
//!
//! Loads from `./laforge.toml` (or `$LAFORGE_CONFIG_PATH`). Environment
//! variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level harness configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Root directory holding `projects/<id>/` state trees.
    pub state_root: PathBuf,
    /// HTTP API settings.
    pub api: ApiConfig,
    /// Operation timeouts.
    pub timeouts: TimeoutConfig,
    /// Captured-output limits.
    pub capture: CaptureConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            state_root: PathBuf::from("./laforge-state"),
            api: ApiConfig::default(),
            timeouts: TimeoutConfig::default(),
            capture: CaptureConfig::default(),
        }
    }
}

/// HTTP API settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    /// Socket address the projection service binds to.
    pub bind_addr: String,
    /// Bearer token required on every request. `None` rejects all requests.
    pub auth_token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8600".to_owned(),
            auth_token: None,
        }
    }
}

/// Operation timeouts in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Image pull budget before a step aborts.
    pub container_pull_secs: u64,
    /// Merge budget for integrating a step branch.
    pub merge_secs: u64,
    /// Per-request budget for API handlers.
    pub api_request_secs: u64,
    /// Idle budget before a live-update subscriber is disconnected.
    pub subscriber_idle_secs: u64,
    /// Host-side budget added on top of the profile deadline.
    pub orchestration_budget_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            container_pull_secs: 120,
            merge_secs: 60,
            api_request_secs: 30,
            subscriber_idle_secs: 300,
            orchestration_budget_secs: 60,
        }
    }
}

impl TimeoutConfig {
    /// Merge budget as a [`Duration`].
    pub fn merge(&self) -> Duration {
        Duration::from_secs(self.merge_secs)
    }

    /// Image pull budget as a [`Duration`].
    pub fn container_pull(&self) -> Duration {
        Duration::from_secs(self.container_pull_secs)
    }

    /// Orchestration budget as a [`Duration`].
    pub fn orchestration_budget(&self) -> Duration {
        Duration::from_secs(self.orchestration_budget_secs)
    }
}

/// Captured-output limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    /// Cap on captured container output, in bytes.
    pub max_output_bytes: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: 4_194_304,
        }
    }
}

impl HarnessConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$LAFORGE_CONFIG_PATH` or `./laforge.toml`. A
    /// missing file is not an error; defaults apply.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = std::env::var("LAFORGE_CONFIG_PATH")
            .map_or_else(|_| PathBuf::from("laforge.toml"), PathBuf::from);
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                toml::from_str(&contents).context("failed to parse config TOML")
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver function so tests can inject values without
    /// mutating the process environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("LAFORGE_STATE_ROOT") {
            self.state_root = PathBuf::from(v);
        }
        if let Some(v) = env("LAFORGE_API_ADDR") {
            self.api.bind_addr = v;
        }
        if let Some(v) = env("LAFORGE_API_TOKEN") {
            self.api.auth_token = Some(v);
        }
        if let Some(v) = env("LAFORGE_ORCHESTRATION_BUDGET_SECS") {
            match v.parse() {
                Ok(n) => self.timeouts.orchestration_budget_secs = n,
                Err(_) => tracing::warn!(
                    var = "LAFORGE_ORCHESTRATION_BUDGET_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }
}
