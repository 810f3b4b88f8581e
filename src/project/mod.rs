//! Per-project on-disk layout and lifecycle.
//!
//! A project lives under `<state_root>/projects/<id>/` and owns two SQLite
//! stores, an agent profile registry, a source git repository, and a log
//! tree. The set of known projects is derived by enumerating that
//! directory; there is no central index to drift out of sync.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::agent::AgentRegistry;
use crate::error::{CoreError, CoreResult};
use crate::repo::Repository;

pub mod registry;

pub use registry::{ProjectHandle, ProjectRegistry};

/// Project identity and metadata, as stored in `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Project {
    /// Opaque identifier; also the directory name.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
}

/// Filesystem layout of one project.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    /// `<state_root>/projects/<id>/`.
    pub root: PathBuf,
    /// Project metadata file.
    pub config_file: PathBuf,
    /// Tasks database.
    pub tasks_db: PathBuf,
    /// Steps database.
    pub steps_db: PathBuf,
    /// Agent profile registry.
    pub agents_file: PathBuf,
    /// Source git repository.
    pub source_root: PathBuf,
    /// Captured output, `logs/step-<id>/`.
    pub logs_dir: PathBuf,
    /// Step worktrees parent directory.
    pub worktrees_dir: PathBuf,
    /// Advisory lock guarding against a second process.
    pub lock_file: PathBuf,
}

impl ProjectPaths {
    /// Compute the layout for `project_id` under `state_root`.
    pub fn new(state_root: &Path, project_id: &str) -> Self {
        let root = state_root.join("projects").join(project_id);
        Self {
            config_file: root.join("config.toml"),
            tasks_db: root.join("tasks.db"),
            steps_db: root.join("steps.db"),
            agents_file: root.join("agents.toml"),
            source_root: root.join("source"),
            logs_dir: root.join("logs"),
            worktrees_dir: root.join("worktrees"),
            lock_file: root.join(".laforge.lock"),
            root,
        }
    }

    /// Log directory for one step.
    pub fn step_log_dir(&self, step_id: i64) -> PathBuf {
        self.logs_dir.join(format!("step-{step_id}"))
    }
}

/// Validate a project id for filesystem safety.
fn validate_project_id(id: &str) -> CoreResult<()> {
    let ok = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "project id {id:?} must be 1-64 characters of [a-zA-Z0-9_-]"
        )))
    }
}

/// Opens and creates per-project state directories.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    state_root: PathBuf,
}

impl ProjectStore {
    /// A store rooted at `state_root`.
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
        }
    }

    /// Layout for `project_id`.
    pub fn paths(&self, project_id: &str) -> ProjectPaths {
        ProjectPaths::new(&self.state_root, project_id)
    }

    /// Materialise a fresh project: state directory, empty stores, default
    /// agent profile, and a source repository with one root commit.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` when the project already exists, `Validation`
    /// for a malformed id.
    pub async fn create(
        &self,
        id: &str,
        name: &str,
        description: &str,
        repo: &dyn Repository,
    ) -> CoreResult<Project> {
        validate_project_id(id)?;
        let paths = self.paths(id);
        if paths.root.exists() {
            return Err(CoreError::Conflict(format!("project {id} already exists")));
        }

        std::fs::create_dir_all(&paths.root)?;
        std::fs::create_dir_all(&paths.logs_dir)?;
        std::fs::create_dir_all(&paths.worktrees_dir)?;

        let project = Project {
            id: id.to_owned(),
            name: if name.is_empty() { id.to_owned() } else { name.to_owned() },
            description: description.to_owned(),
        };
        write_config(&paths.config_file, &project)?;

        // Opening the stores creates their schema.
        crate::store::TaskStore::open(&paths.tasks_db).await?;
        crate::store::StepStore::open(&paths.steps_db).await?;

        AgentRegistry::with_default().save(&paths.agents_file)?;
        repo.init_repository(&paths.source_root).await?;

        tracing::info!(project = id, "project created");
        Ok(project)
    }

    /// Read a project's metadata.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the project directory or config is missing.
    pub fn load(&self, id: &str) -> CoreResult<Project> {
        validate_project_id(id)?;
        let paths = self.paths(id);
        let contents = std::fs::read_to_string(&paths.config_file)
            .map_err(|_| CoreError::not_found("project", id))?;
        toml::from_str(&contents)
            .map_err(|e| CoreError::Host(format!("corrupt project config for {id}: {e}")))
    }

    /// Every project under the state root, sorted by id.
    ///
    /// # Errors
    ///
    /// Returns `Host` on unreadable directories; an absent state root is
    /// an empty list.
    pub fn list(&self) -> CoreResult<Vec<Project>> {
        let projects_dir = self.state_root.join("projects");
        let entries = match std::fs::read_dir(&projects_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut projects = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Some(id) = entry.file_name().to_str().map(ToOwned::to_owned) else {
                continue;
            };
            match self.load(&id) {
                Ok(project) => projects.push(project),
                Err(e) => {
                    tracing::warn!(project = %id, error = %e, "skipping unreadable project")
                }
            }
        }
        projects.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(projects)
    }
}

fn write_config(path: &Path, project: &Project) -> CoreResult<()> {
    let rendered = toml::to_string_pretty(project)
        .map_err(|e| CoreError::Host(format!("failed to render project config: {e}")))?;
    std::fs::write(path, rendered)?;
    Ok(())
}
