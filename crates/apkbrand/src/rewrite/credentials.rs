use crate::error::{BuildError, IoContext};
use apkbrand_request::CredentialPayload;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where the running application looks for its per-build credentials.
pub const CREDENTIALS_ASSET: &str = "assets/credentials.json";

/// Writes `payload` as pretty JSON into the asset tree, replacing any previous
/// file.
pub fn embed(decompiled: &Path, payload: &CredentialPayload) -> Result<PathBuf, BuildError> {
    let path = decompiled.join(CREDENTIALS_ASSET);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(payload)
        .map_err(|err| BuildError::io("encoding credentials", std::io::Error::other(err)))?;
    std::fs::write(&path, json).io_context(|| format!("writing {}", path.display()))?;

    debug!(path = %path.display(), "credentials embedded");
    Ok(path)
}
