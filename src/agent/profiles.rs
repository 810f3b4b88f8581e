//! Per-project agent profile registry.
//!
//! `agents.toml` maps a profile name to the full invocation bundle: image,
//! mount targets, environment, resource limits, and deadline. Values may
//! reference the host process environment as `${NAME}`; references are
//! resolved at step start and an unsatisfiable one fails the step before
//! any side effect.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Profile name created automatically at project init.
pub const DEFAULT_PROFILE: &str = "default";

/// A named bundle of agent-invocation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentProfile {
    /// Container image reference; may contain `${NAME}` references.
    pub image: String,
    /// Container path the step worktree is mounted at.
    #[serde(default = "default_source_mount")]
    pub source_mount: String,
    /// Container path the tasks-store snapshot is mounted at.
    #[serde(default = "default_state_mount")]
    pub state_mount: String,
    /// Environment passed to the agent; values may contain `${NAME}`.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Memory limit in MiB.
    #[serde(default)]
    pub memory_mb: Option<u32>,
    /// CPU limit in cores.
    #[serde(default)]
    pub cpu_cores: Option<f64>,
    /// Wall-clock budget for the container run, in seconds.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    /// Command override for the image.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// Agent family for token-usage extraction.
    #[serde(default)]
    pub usage_family: Option<String>,
}

fn default_source_mount() -> String {
    "/workspace".to_owned()
}

fn default_state_mount() -> String {
    "/state/tasks.db".to_owned()
}

fn default_deadline_secs() -> u64 {
    1800
}

impl AgentProfile {
    /// Container deadline as a [`Duration`].
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    /// Resolve every `${NAME}` reference in the image and environment.
    ///
    /// # Errors
    ///
    /// Returns `Validation` naming the first unsatisfiable reference.
    pub fn resolve(&self, env: impl Fn(&str) -> Option<String>) -> CoreResult<Self> {
        let mut resolved = self.clone();
        resolved.image = substitute(&self.image, &env)?;
        for (key, value) in &self.env {
            resolved
                .env
                .insert(key.clone(), substitute(value, &env)?);
        }
        Ok(resolved)
    }
}

/// Substitute `${NAME}` references in `input` using `env`.
fn substitute(input: &str, env: &impl Fn(&str) -> Option<String>) -> CoreResult<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        let (head, tail) = rest.split_at(start);
        out.push_str(head);
        let after = &tail[2..];
        let Some(end) = after.find('}') else {
            return Err(CoreError::Validation(format!(
                "unterminated ${{...}} reference in {input:?}"
            )));
        };
        let name = &after[..end];
        if name.is_empty() {
            return Err(CoreError::Validation(format!(
                "empty ${{}} reference in {input:?}"
            )));
        }
        let value = env(name).ok_or_else(|| {
            CoreError::Validation(format!(
                "profile references environment variable {name} which is not set"
            ))
        })?;
        out.push_str(&value);
        rest = &after[end.saturating_add(1)..];
    }
    out.push_str(rest);
    Ok(out)
}

/// On-disk shape of `agents.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentRegistry {
    /// Profiles by name.
    #[serde(default)]
    pub profiles: BTreeMap<String, AgentProfile>,
}

impl AgentRegistry {
    /// Registry containing only the built-in `default` profile.
    pub fn with_default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            DEFAULT_PROFILE.to_owned(),
            AgentProfile {
                image: "laforge/agent:latest".to_owned(),
                source_mount: default_source_mount(),
                state_mount: default_state_mount(),
                env: BTreeMap::new(),
                memory_mb: Some(2048),
                cpu_cores: Some(2.0),
                deadline_secs: default_deadline_secs(),
                command: None,
                usage_family: None,
            },
        );
        Self { profiles }
    }

    /// Load the registry from `path`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the file is missing, `Validation` when it
    /// does not parse.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoreError::not_found("agent registry", path.display())
            } else {
                CoreError::Host(format!("failed to read {}: {e}", path.display()))
            }
        })?;
        toml::from_str(&contents)
            .map_err(|e| CoreError::Validation(format!("invalid agent registry: {e}")))
    }

    /// Write the registry to `path`.
    ///
    /// # Errors
    ///
    /// Returns `Host` on serialization or write failure.
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        let rendered = toml::to_string_pretty(self)
            .map_err(|e| CoreError::Host(format!("failed to render agent registry: {e}")))?;
        std::fs::write(path, rendered)
            .map_err(|e| CoreError::Host(format!("failed to write {}: {e}", path.display())))?;
        Ok(())
    }

    /// Look up a profile by name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown profile.
    pub fn get(&self, name: &str) -> CoreResult<&AgentProfile> {
        self.profiles
            .get(name)
            .ok_or_else(|| CoreError::not_found("agent profile", name))
    }
}
