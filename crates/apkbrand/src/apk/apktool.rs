use crate::config::Config;
use crate::error::{BuildError, ToolExit, ToolFailure};
use crate::process::{self, ProcessTracker, ToolCommand};
use std::path::Path;
use tracing::info;

/// Unpacks `base_apk` into `out_dir` with `apktool d`.
pub async fn decompile(
    config: &Config,
    base_apk: &Path,
    out_dir: &Path,
    tracker: &dyn ProcessTracker,
) -> Result<(), BuildError> {
    if !tokio::fs::try_exists(base_apk).await.unwrap_or(false) {
        return Err(BuildError::NotFound(format!(
            "base package {} does not exist",
            base_apk.display()
        )));
    }

    info!("→ decompiling {}", base_apk.display());
    let cmd = ToolCommand::new("apktool", &config.tools.apktool)
        .args(["d", "-f"])
        .arg(base_apk)
        .arg("-o")
        .arg(out_dir)
        .timeout(config.timeouts.decompile());

    process::run(&cmd, tracker).await?;
    Ok(())
}

/// Rebuilds `src_dir` into an unsigned package with `apktool b`.
pub async fn recompile(
    config: &Config,
    src_dir: &Path,
    out_apk: &Path,
    tracker: &dyn ProcessTracker,
) -> Result<(), BuildError> {
    info!("→ recompiling {}", src_dir.display());
    let cmd = ToolCommand::new("apktool", &config.tools.apktool)
        .arg("b")
        .arg(src_dir)
        .arg("-o")
        .arg(out_apk)
        .timeout(config.timeouts.build());

    let output = process::run(&cmd, tracker).await?;

    if !tokio::fs::try_exists(out_apk).await.unwrap_or(false) {
        return Err(BuildError::tool(ToolFailure {
            tool: "apktool".to_string(),
            command: cmd.display(),
            exit: ToolExit::Rejected(format!("{} was not written", out_apk.display())),
            stdout_tail: output.stdout_tail,
            stderr_tail: output.stderr_tail,
        }));
    }

    Ok(())
}
