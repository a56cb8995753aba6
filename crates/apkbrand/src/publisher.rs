use crate::config::Config;
use crate::error::{BuildError, IoContext};
use crate::utils::slug::slugify;
use crate::workspace::BuildWorkspace;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Highest numeric suffix tried before giving up on a base name.
pub const MAX_NAME_ATTEMPTS: u32 = 9999;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalArtifact {
    pub filename: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// A filename claimed in the public directory by creating it empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub filename: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Publisher {
    public_dir: PathBuf,
    url_prefix: String,
    retention: Duration,
    max_attempts: u32,
}

impl Publisher {
    pub fn new(config: &Config) -> Self {
        Self {
            public_dir: config.public_dir.clone(),
            url_prefix: config.public_url_prefix.trim_end_matches('/').to_string(),
            retention: config.retention(),
            max_attempts: MAX_NAME_ATTEMPTS,
        }
    }

    /// Caps how many suffixes `allocate_name` tries.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn public_dir(&self) -> &Path {
        &self.public_dir
    }

    /// Claims `<slug>.apk`, or `<slug>-2.apk`, `<slug>-3.apk`, ... for the
    /// first name nobody holds. The claim is an exclusive create, so two
    /// concurrent builds can never receive the same name.
    pub async fn allocate_name(&self, display_name: &str) -> Result<Reservation, BuildError> {
        tokio::fs::create_dir_all(&self.public_dir)
            .await
            .io_context(|| format!("creating {}", self.public_dir.display()))?;

        let stem = slugify(display_name);
        for attempt in 1..=self.max_attempts {
            let filename = if attempt == 1 {
                format!("{stem}.apk")
            } else {
                format!("{stem}-{attempt}.apk")
            };
            let path = self.public_dir.join(&filename);

            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(Reservation { filename, path }),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(BuildError::io(format!("reserving {}", path.display()), err));
                }
            }
        }

        Err(BuildError::Conflict(format!(
            "no free filename for {stem:?} after {} attempts",
            self.max_attempts
        )))
    }

    /// Copies the verified artifact into a freshly reserved public name. The
    /// name is recorded on `workspace` before any byte is written so a later
    /// teardown also removes a partial copy.
    pub async fn publish(
        &self,
        display_name: &str,
        signed: &Path,
        workspace: &BuildWorkspace,
    ) -> Result<FinalArtifact, BuildError> {
        let Reservation { filename, path } = self.allocate_name(display_name).await?;
        workspace.set_final_artifact(path.clone());

        tokio::fs::copy(signed, &path)
            .await
            .io_context(|| format!("publishing {}", path.display()))?;

        info!(artifact = %filename, "artifact published");
        Ok(FinalArtifact {
            filename,
            path,
            created_at: Utc::now(),
        })
    }

    /// What a client downloads, e.g. `/downloads/Acme.apk`.
    pub fn relative_path(&self, filename: &str) -> String {
        format!("{}/{filename}", self.url_prefix)
    }

    /// Deletes the artifact once the retention window has passed, whether or
    /// not it was downloaded.
    pub fn schedule_expiry(&self, artifact: &FinalArtifact) -> JoinHandle<()> {
        let path = artifact.path.clone();
        let retention = self.retention;

        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "expired artifact removed"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), %err, "failed to remove expired artifact"),
            }
        })
    }

    /// Removes `.apk` files older than the retention window. Returns how many
    /// were deleted.
    pub async fn sweep_expired(&self) -> Result<usize, BuildError> {
        let mut entries = match tokio::fs::read_dir(&self.public_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(BuildError::io(
                    format!("listing {}", self.public_dir.display()),
                    err,
                ));
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;

        while let Some(entry) = entries
            .next_entry()
            .await
            .io_context(|| format!("listing {}", self.public_dir.display()))?
        {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "apk") {
                continue;
            }

            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let age = meta
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();

            if meta.is_file() && age >= self.retention {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(err) => warn!(path = %path.display(), %err, "sweep could not remove artifact"),
                }
            }
        }

        if removed > 0 {
            info!(removed, "expired artifacts swept");
        }
        Ok(removed)
    }
}
