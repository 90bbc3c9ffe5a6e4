//! Thread groups and the group manager.
//!
//! A thread group is a named set of worker threads started together, plus a
//! detached monitor thread that joins every worker, runs the group's cleanup
//! function, and reports completion to the [`GroupManager`]. The manager's
//! [`wait_for_all`](GroupManager::wait_for_all) blocks the supervising
//! thread until every group has completed or the shutdown flag is raised;
//! workers are never cancelled forcibly, they are expected to observe the
//! flag and exit on their own.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{error, info, warn};

use crate::sync::ShutdownFlag;

type WorkerFn = Box<dyn FnOnce() + Send + 'static>;

struct Worker {
    name: String,
    run: WorkerFn,
}

/// A named set of worker threads managed as a unit.
pub struct ThreadGroup {
    id: u64,
    name: String,
    workers: Vec<Worker>,
    cleanup: Option<WorkerFn>,
}

impl std::fmt::Debug for ThreadGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadGroup")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl ThreadGroup {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            workers: Vec::new(),
            cleanup: None,
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of worker threads this group will spawn.
    #[inline]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Adds a worker. `name` becomes the OS thread name.
    pub fn add_worker(&mut self, name: impl Into<String>, run: impl FnOnce() + Send + 'static) {
        self.workers.push(Worker {
            name: name.into(),
            run: Box::new(run),
        });
    }

    /// Registers a cleanup function the monitor runs after all workers have
    /// been joined.
    pub fn set_cleanup(&mut self, cleanup: impl FnOnce() + Send + 'static) {
        self.cleanup = Some(Box::new(cleanup));
    }

    fn start(self, manager: Arc<GroupManager>) -> io::Result<()> {
        let Self {
            id,
            name,
            workers,
            cleanup,
        } = self;

        let mut handles = Vec::with_capacity(workers.len());
        for worker in workers {
            let handle = thread::Builder::new()
                .name(worker.name.clone())
                .spawn(worker.run)?;
            handles.push((worker.name, handle));
        }

        let monitor_name = format!("{name}-monitor");
        let group_name = name.clone();
        thread::Builder::new().name(monitor_name).spawn(move || {
            for (worker_name, handle) in handles {
                if handle.join().is_err() {
                    error!(group = %group_name, worker = %worker_name, "worker panicked");
                }
            }
            info!(group = %group_name, id, "all workers joined, running cleanup");
            if let Some(cleanup) = cleanup {
                cleanup();
            }
            manager.group_completed(id, &group_name);
        })?;
        // Monitor runs detached; completion is reported through the manager.
        Ok(())
    }
}

struct ManagerState {
    group_count: usize,
    completed: usize,
}

/// Coordinates startup and completion across thread groups.
pub struct GroupManager {
    state: Mutex<ManagerState>,
    cond: Condvar,
}

impl GroupManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ManagerState {
                group_count: 0,
                completed: 0,
            }),
            cond: Condvar::new(),
        })
    }

    /// Starts every group. On a spawn failure the already-started groups
    /// keep running (their workers watch the shutdown flag); the error is
    /// returned to the caller, which is expected to request shutdown.
    pub fn start_all(self: &Arc<Self>, groups: Vec<ThreadGroup>) -> io::Result<()> {
        {
            let mut state = self.state.lock();
            state.group_count += groups.len();
        }
        for group in groups {
            let id = group.id();
            let name = group.name().to_owned();
            group.start(self.clone()).inspect_err(|e| {
                error!(group = %name, id, error = %e, "failed to start thread group");
            })?;
            info!(group = %name, id, "thread group started");
        }
        Ok(())
    }

    fn group_completed(&self, id: u64, name: &str) {
        let mut state = self.state.lock();
        // A shutdown may already have marked stragglers as completed.
        state.completed = (state.completed + 1).min(state.group_count);
        info!(group = %name, id, "thread group completed");
        self.cond.notify_all();
    }

    /// Completed vs. total group counts.
    pub fn progress(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.completed, state.group_count)
    }

    /// Blocks until all groups have completed or `shutdown` is raised,
    /// checking the flag once per second.
    pub fn wait_for_all(&self, shutdown: &ShutdownFlag) {
        let mut state = self.state.lock();
        while state.completed < state.group_count && !shutdown.requested() {
            self.cond
                .wait_for(&mut state, Duration::from_secs(1));
        }
        if shutdown.requested() && state.completed < state.group_count {
            warn!(
                remaining = state.group_count - state.completed,
                "shutdown requested, marking remaining groups as completed"
            );
            state.completed = state.group_count;
        }
        info!("all thread groups completed or shutdown requested");
    }
}
