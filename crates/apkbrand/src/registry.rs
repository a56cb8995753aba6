//! In-flight build bookkeeping.
//!
//! An id present in the [`BuildRegistry`] is a build that is still running.
//! Removing the entry is the single point where a build ends: whichever of
//! [`BuildRegistry::cancel`] and [`BuildRegistry::complete`] removes it first
//! owns the teardown, the other one sees `false`.

use crate::error::BuildError;
use crate::process::{ProcessHandle, ProcessTracker};
use crate::workspace::BuildWorkspace;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

#[derive(Debug)]
struct RegistryEntry {
    workspace: Arc<BuildWorkspace>,
    processes: HashMap<u64, ProcessHandle>,
}

#[derive(Debug, Default)]
pub struct BuildRegistry {
    entries: Mutex<HashMap<String, RegistryEntry>>,
}

impl BuildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, RegistryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, build_id: &str, workspace: Arc<BuildWorkspace>) -> Result<(), BuildError> {
        let mut entries = self.entries();
        if entries.contains_key(build_id) {
            return Err(BuildError::Conflict(format!(
                "build {build_id} is already in flight"
            )));
        }

        entries.insert(
            build_id.to_string(),
            RegistryEntry {
                workspace,
                processes: HashMap::new(),
            },
        );
        debug!(build_id, "registered");

        Ok(())
    }

    /// Fails with `Cancelled` when the build is no longer registered.
    pub fn track_process(&self, build_id: &str, handle: ProcessHandle) -> Result<(), BuildError> {
        let mut entries = self.entries();
        let entry = entries
            .get_mut(build_id)
            .ok_or_else(|| BuildError::Cancelled(build_id.to_string()))?;

        entry.processes.insert(handle.id(), handle);
        Ok(())
    }

    pub fn untrack(&self, build_id: &str, process_id: u64) {
        if let Some(entry) = self.entries().get_mut(build_id) {
            entry.processes.remove(&process_id);
        }
    }

    /// Kills every live process of `build_id` and deletes its workspace and any
    /// published artifact. Returns `false` for unknown or finished builds.
    pub fn cancel(&self, build_id: &str) -> bool {
        let Some(entry) = self.entries().remove(build_id) else {
            debug!(build_id, "cancel for unknown build ignored");
            return false;
        };

        for handle in entry.processes.values() {
            handle.kill();
        }
        entry.workspace.teardown(true);

        info!(build_id, killed = entry.processes.len(), "build cancelled");
        true
    }

    /// Ends a build that ran to a terminal state. A successful build keeps its
    /// published artifact. Returns `false` when a cancel got there first.
    pub fn complete(&self, build_id: &str, success: bool) -> bool {
        let Some(entry) = self.entries().remove(build_id) else {
            return false;
        };

        entry.workspace.teardown(!success);
        true
    }

    pub fn contains(&self, build_id: &str) -> bool {
        self.entries().contains_key(build_id)
    }

    pub fn live_processes(&self, build_id: &str) -> usize {
        self.entries()
            .get(build_id)
            .map(|entry| entry.processes.len())
            .unwrap_or_default()
    }

    pub fn in_flight(&self) -> usize {
        self.entries().len()
    }
}

/// Binds process tracking to one build id.
#[derive(Debug, Clone)]
pub struct BuildScope {
    registry: Arc<BuildRegistry>,
    build_id: String,
}

impl BuildScope {
    pub fn new(registry: Arc<BuildRegistry>, build_id: impl Into<String>) -> Self {
        Self {
            registry,
            build_id: build_id.into(),
        }
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn is_active(&self) -> bool {
        self.registry.contains(&self.build_id)
    }

    /// Stops a build between stages once it has been cancelled.
    pub fn ensure_active(&self) -> Result<(), BuildError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(BuildError::Cancelled(self.build_id.clone()))
        }
    }
}

impl ProcessTracker for BuildScope {
    fn track(&self, handle: ProcessHandle) -> Result<(), BuildError> {
        self.registry.track_process(&self.build_id, handle)
    }

    fn untrack(&self, process_id: u64) {
        self.registry.untrack(&self.build_id, process_id);
    }
}
