use crate::config::Config;
use crate::error::{BuildError, IoContext, ToolExit, ToolFailure};
use crate::process::{self, ProcessTracker, ToolCommand};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::{CompressionMethod, ZipArchive};

/// Byte-aligns `input` into `output` with `zipalign -f`.
pub async fn align(
    config: &Config,
    input: &Path,
    output: &Path,
    tracker: &dyn ProcessTracker,
) -> Result<(), BuildError> {
    info!("→ aligning {}", input.display());
    let cmd = ToolCommand::new("zipalign", &config.tools.zipalign)
        .arg("-f")
        .arg(config.alignment.to_string())
        .arg(input)
        .arg(output)
        .timeout(config.timeouts.align());

    process::run(&cmd, tracker).await?;
    Ok(())
}

/// A stored entry whose data does not start on an alignment boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Misaligned {
    pub name: String,
    pub data_start: u64,
}

/// Checks the data offsets of an archive's stored entries.
#[derive(Debug, Clone)]
pub struct AlignmentCheck {
    apk_path: PathBuf,
    alignment: u64,
}

impl AlignmentCheck {
    pub fn new(apk_path: impl Into<PathBuf>, alignment: u64) -> Self {
        Self {
            apk_path: apk_path.into(),
            alignment: alignment.max(1),
        }
    }

    /// Compressed entries are never mmapped, so only stored ones count.
    pub fn misaligned_entries(&self) -> Result<Vec<Misaligned>, BuildError> {
        let file = File::open(&self.apk_path)
            .io_context(|| format!("opening {}", self.apk_path.display()))?;
        let mut zip = ZipArchive::new(file).map_err(|err| self.rejected(err.to_string()))?;
        let mut bad = Vec::new();

        for i in 0..zip.len() {
            let entry = zip.by_index(i).map_err(|err| self.rejected(err.to_string()))?;
            if entry.compression() != CompressionMethod::Stored {
                continue;
            }

            let data_start = entry.data_start();
            if data_start % self.alignment != 0 {
                debug!(
                    "{:8} {} (BAD - mod {} = {})",
                    data_start,
                    entry.name(),
                    self.alignment,
                    data_start % self.alignment
                );
                bad.push(Misaligned {
                    name: entry.name().to_string(),
                    data_start,
                });
            }
        }

        Ok(bad)
    }

    /// Fails as a `zipalign` tool error when any stored entry is misaligned.
    pub fn verify(&self) -> Result<(), BuildError> {
        let bad = self.misaligned_entries()?;
        if bad.is_empty() {
            return Ok(());
        }

        let listing = bad
            .iter()
            .map(|m| format!("{:8} {}", m.data_start, m.name))
            .collect::<Vec<_>>()
            .join("\n");

        Err(BuildError::tool(ToolFailure {
            tool: "zipalign".to_string(),
            command: format!("verify {} ({}-byte)", self.apk_path.display(), self.alignment),
            exit: ToolExit::Rejected(format!("{} misaligned stored entries", bad.len())),
            stdout_tail: listing,
            stderr_tail: String::new(),
        }))
    }

    fn rejected(&self, reason: String) -> BuildError {
        BuildError::tool(ToolFailure {
            tool: "zipalign".to_string(),
            command: format!("verify {}", self.apk_path.display()),
            exit: ToolExit::Rejected(reason),
            stdout_tail: String::new(),
            stderr_tail: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    fn stored_archive(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("stored.apk");
        let mut writer = ZipWriter::new(File::create(&path).unwrap());
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

        writer.start_file("resources.arsc", options).unwrap();
        writer.write_all(b"table").unwrap();
        writer.finish().unwrap();

        path
    }

    fn data_start(path: &Path) -> u64 {
        let mut zip = ZipArchive::new(File::open(path).unwrap()).unwrap();
        zip.by_index(0).unwrap().data_start()
    }

    #[test]
    fn accepts_entries_on_the_boundary() {
        let dir = TempDir::new().unwrap();
        let path = stored_archive(&dir);
        let offset = data_start(&path);

        assert!(AlignmentCheck::new(&path, offset).verify().is_ok());
        assert!(AlignmentCheck::new(&path, 1).verify().is_ok());
    }

    #[test]
    fn rejects_misaligned_stored_entries() {
        let dir = TempDir::new().unwrap();
        let path = stored_archive(&dir);
        let offset = data_start(&path);

        let err = AlignmentCheck::new(&path, offset + 1).verify().unwrap_err();
        let BuildError::ExternalTool(failure) = err else {
            panic!("expected a zipalign failure");
        };
        assert_eq!(failure.tool, "zipalign");
        assert!(failure.stdout_tail.contains("resources.arsc"));
    }

    #[test]
    fn garbage_is_not_an_archive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.apk");
        std::fs::write(&path, b"not a zip").unwrap();

        assert!(matches!(
            AlignmentCheck::new(&path, 4).verify(),
            Err(BuildError::ExternalTool(_))
        ));
    }
}
