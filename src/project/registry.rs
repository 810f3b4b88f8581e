//! Open-project registry and the per-project coordinator.
//!
//! All mutations to a project's stores, repository, and subscriber hub are
//! serialized through its coordinator: an async reader-writer lock whose
//! exclusive lease brackets every write *and* the event publication that
//! follows it. Readers take the shared lease. Cross-project operations
//! hold at most one coordinator at a time.

use std::collections::HashMap;
use std::sync::Arc;

use fs2::FileExt;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{Project, ProjectPaths, ProjectStore};
use crate::error::{CoreError, CoreResult};
use crate::events::SubscriberHub;
use crate::store::{StepStore, TaskStore};

/// An open project: stores, hub, coordinator, and the process-level lock.
pub struct ProjectHandle {
    /// Project metadata.
    pub project: Project,
    /// Filesystem layout.
    pub paths: ProjectPaths,
    /// Task store.
    pub tasks: TaskStore,
    /// Step store.
    pub steps: StepStore,
    /// Live-update fan-out.
    pub hub: SubscriberHub,
    coordinator: RwLock<()>,
    // Held for the lifetime of the handle; releases the fs2 lock on drop.
    _lock_file: std::fs::File,
}

impl ProjectHandle {
    /// Shared lease for read-only operations.
    pub async fn read_lease(&self) -> RwLockReadGuard<'_, ()> {
        self.coordinator.read().await
    }

    /// Exclusive lease for mutations and the events they publish.
    pub async fn write_lease(&self) -> RwLockWriteGuard<'_, ()> {
        self.coordinator.write().await
    }
}

impl ProjectHandle {
    /// Construct a handle over explicit stores, bypassing the registry.
    ///
    /// The paths' root directory must exist. Intended for tests that wire
    /// fake adapters around real stores.
    #[doc(hidden)]
    pub fn new_for_test(
        project: Project,
        paths: ProjectPaths,
        tasks: TaskStore,
        steps: StepStore,
    ) -> CoreResult<Self> {
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&paths.lock_file)?;
        Ok(Self {
            project,
            paths,
            tasks,
            steps,
            hub: SubscriberHub::new(),
            coordinator: RwLock::new(()),
            _lock_file: lock_file,
        })
    }
}

impl std::fmt::Debug for ProjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectHandle")
            .field("project", &self.project.id)
            .finish()
    }
}

/// Process-wide map of open projects.
pub struct ProjectRegistry {
    store: ProjectStore,
    handles: RwLock<HashMap<String, Arc<ProjectHandle>>>,
}

impl ProjectRegistry {
    /// A registry over `store`.
    pub fn new(store: ProjectStore) -> Self {
        Self {
            store,
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// The underlying project store.
    pub fn store(&self) -> &ProjectStore {
        &self.store
    }

    /// Open a project, reusing the existing handle when already open.
    ///
    /// The first open acquires the project's advisory file lock, so two
    /// processes can never service the same project.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown project and `Conflict` when
    /// another process holds the lock.
    pub async fn open(&self, project_id: &str) -> CoreResult<Arc<ProjectHandle>> {
        if let Some(handle) = self.handles.read().await.get(project_id) {
            return Ok(Arc::clone(handle));
        }

        let mut handles = self.handles.write().await;
        // Raced another opener; theirs wins.
        if let Some(handle) = handles.get(project_id) {
            return Ok(Arc::clone(handle));
        }

        let project = self.store.load(project_id)?;
        let paths = self.store.paths(project_id);

        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&paths.lock_file)?;
        lock_file.try_lock_exclusive().map_err(|_| {
            CoreError::Conflict(format!(
                "project {project_id} is locked by another process"
            ))
        })?;

        let tasks = TaskStore::open(&paths.tasks_db).await?;
        let steps = StepStore::open(&paths.steps_db).await?;

        let handle = Arc::new(ProjectHandle {
            project,
            paths,
            tasks,
            steps,
            hub: SubscriberHub::new(),
            coordinator: RwLock::new(()),
            _lock_file: lock_file,
        });
        handles.insert(project_id.to_owned(), Arc::clone(&handle));
        Ok(handle)
    }

    /// List every known project (open or not).
    ///
    /// # Errors
    ///
    /// Returns `Host` on unreadable state directories.
    pub fn list(&self) -> CoreResult<Vec<Project>> {
        self.store.list()
    }
}

impl std::fmt::Debug for ProjectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectRegistry").finish_non_exhaustive()
    }
}
