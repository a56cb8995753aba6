use crate::error::{BuildError, IoContext};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};
use uuid::Uuid;

/// The private scratch tree of one build.
///
/// Everything except the published artifact lives under `temp_dir`, so a
/// single recursive delete tears the build down. The published artifact is
/// recorded separately because it lives in the public directory.
#[derive(Debug)]
pub struct BuildWorkspace {
    build_id: String,
    temp_dir: PathBuf,
    decompiled_dir: PathBuf,
    unsigned_apk: PathBuf,
    aligned_apk: PathBuf,
    signed_apk: PathBuf,
    final_artifact: Mutex<Option<PathBuf>>,
}

impl BuildWorkspace {
    /// Lays out the workspace paths without touching the filesystem.
    pub fn new(work_root: &Path, build_id: &str) -> Self {
        let temp_dir = work_root.join(format!("apk_{build_id}_{}", Uuid::new_v4().simple()));

        Self {
            build_id: build_id.to_string(),
            decompiled_dir: temp_dir.join("decompiled"),
            unsigned_apk: temp_dir.join("unsigned.apk"),
            aligned_apk: temp_dir.join("aligned.apk"),
            signed_apk: temp_dir.join("signed.apk"),
            temp_dir,
            final_artifact: Mutex::new(None),
        }
    }

    pub async fn create(work_root: &Path, build_id: &str) -> Result<Self, BuildError> {
        let workspace = Self::new(work_root, build_id);

        tokio::fs::create_dir_all(work_root)
            .await
            .io_context(|| format!("creating work root {}", work_root.display()))?;
        tokio::fs::create_dir(&workspace.temp_dir)
            .await
            .io_context(|| format!("creating workspace {}", workspace.temp_dir.display()))?;

        debug!(dir = %workspace.temp_dir.display(), "workspace created");
        Ok(workspace)
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn decompiled_dir(&self) -> &Path {
        &self.decompiled_dir
    }

    pub fn unsigned_apk(&self) -> &Path {
        &self.unsigned_apk
    }

    pub fn aligned_apk(&self) -> &Path {
        &self.aligned_apk
    }

    pub fn signed_apk(&self) -> &Path {
        &self.signed_apk
    }

    pub fn set_final_artifact(&self, path: PathBuf) {
        *self
            .final_artifact
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(path);
    }

    pub fn final_artifact(&self) -> Option<PathBuf> {
        self.final_artifact
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Deletes the scratch tree and, when `remove_artifact` is set, the
    /// published artifact. Safe to call any number of times.
    ///
    /// The artifact path stays recorded, so a later teardown also removes a
    /// copy that finished after an earlier one.
    pub fn teardown(&self, remove_artifact: bool) {
        match std::fs::remove_dir_all(&self.temp_dir) {
            Ok(()) => debug!(dir = %self.temp_dir.display(), "workspace removed"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(dir = %self.temp_dir.display(), %err, "failed to remove workspace"),
        }

        if !remove_artifact {
            return;
        }

        if let Some(path) = self.final_artifact() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "artifact removed"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), %err, "failed to remove artifact"),
            }
        }
    }
}
