use crate::config::Config;
use crate::error::BuildError;
use crate::process::{self, ProcessTracker, ToolCommand, ToolOutput};
use std::path::Path;
use tracing::{debug, info};

/// Signs `input` into `output` with the shared release key, enabling the v1,
/// v2 and v3 schemes together.
pub async fn sign(
    config: &Config,
    keystore: &Path,
    input: &Path,
    output: &Path,
    tracker: &dyn ProcessTracker,
) -> Result<(), BuildError> {
    let ks = &config.keystore;

    info!("→ signing {}", input.display());
    let cmd = ToolCommand::new("apksigner", &config.tools.apksigner)
        .arg("sign")
        .arg("--ks")
        .arg(keystore)
        .arg("--ks-pass")
        .arg(format!("pass:{}", ks.store_pass))
        .arg("--key-pass")
        .arg(format!("pass:{}", ks.key_pass()))
        .arg("--ks-key-alias")
        .arg(&ks.alias)
        .args([
            "--v1-signing-enabled",
            "true",
            "--v2-signing-enabled",
            "true",
            "--v3-signing-enabled",
            "true",
        ])
        .arg("--out")
        .arg(output)
        .arg(input)
        .redact(&ks.store_pass)
        .redact(ks.key_pass())
        .timeout(config.timeouts.sign());

    process::run(&cmd, tracker).await?;
    Ok(())
}

/// Runs `apksigner verify`; any non-zero exit fails the build.
pub async fn verify(
    config: &Config,
    apk: &Path,
    tracker: &dyn ProcessTracker,
) -> Result<ToolOutput, BuildError> {
    info!("→ verifying {}", apk.display());
    let cmd = ToolCommand::new("apksigner", &config.tools.apksigner)
        .args(["verify", "--verbose", "--print-certs"])
        .arg(apk)
        .timeout(config.timeouts.verify());

    let output = process::run(&cmd, tracker).await?;
    debug!("apksigner verify:\n{}", output.stdout_tail);

    Ok(output)
}
