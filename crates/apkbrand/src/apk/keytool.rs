use crate::config::Config;
use crate::error::{BuildError, IoContext};
use crate::process::{self, ProcessTracker, ToolCommand};
use once_cell::sync::Lazy;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{info, warn};

static KEYSTORE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Returns the path of the release keystore, generating it on first use when
/// allowed. An existing keystore is never replaced.
pub async fn ensure_keystore(
    config: &Config,
    tracker: &dyn ProcessTracker,
) -> Result<PathBuf, BuildError> {
    let ks = &config.keystore;
    let path = ks.path();

    tokio::fs::create_dir_all(&ks.dir)
        .await
        .io_context(|| format!("creating keystore dir {}", ks.dir.display()))?;

    let _guard = KEYSTORE_LOCK.lock().await;

    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Ok(path);
    }

    if !ks.generate_if_missing {
        return Err(BuildError::NotFound(format!(
            "keystore {} does not exist and generation is disabled",
            path.display()
        )));
    }

    warn!(
        keystore = %path.display(),
        "generating a new release keystore; artifacts signed with any other key can no longer be updated in place"
    );

    info!("→ generating keystore {}", path.display());
    let cmd = ToolCommand::new("keytool", &config.tools.keytool)
        .arg("-genkeypair")
        .arg("-alias")
        .arg(&ks.alias)
        .args(["-keyalg", "RSA", "-keysize", "2048", "-validity", "36500"])
        .arg("-keystore")
        .arg(&path)
        .arg("-storepass")
        .arg(&ks.store_pass)
        .arg("-keypass")
        .arg(ks.key_pass())
        .arg("-dname")
        .arg(&ks.dname)
        .redact(&ks.store_pass)
        .redact(ks.key_pass())
        .timeout(config.timeouts.keytool());

    if let Err(err) = process::run(&cmd, tracker).await {
        // keytool can leave a truncated store behind
        let _ = tokio::fs::remove_file(&path).await;
        return Err(err);
    }

    Ok(path)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::Untracked;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn fake_keytool(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("keytool");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config(dir: &TempDir, keytool: PathBuf) -> Config {
        let mut config = Config::default();
        config.keystore.dir = dir.path().join("keystore");
        config.tools.keytool = keytool;
        config
    }

    #[tokio::test]
    async fn existing_keystore_is_reused_as_is() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, fake_keytool(&dir, "exit 1"));
        std::fs::create_dir_all(&config.keystore.dir).unwrap();
        std::fs::write(config.keystore.path(), b"original").unwrap();

        let path = ensure_keystore(&config, &Untracked).await.unwrap();

        assert_eq!(std::fs::read(path).unwrap(), b"original");
    }

    #[tokio::test]
    async fn missing_keystore_is_generated_once() {
        let dir = TempDir::new().unwrap();
        let counter = dir.path().join("calls");
        let script = format!(
            r#"echo x >> "{}"
while [ "$1" != "-keystore" ]; do shift; done
echo key > "$2""#,
            counter.display()
        );
        let config = config(&dir, fake_keytool(&dir, &script));

        let (a, b) = tokio::join!(
            ensure_keystore(&config, &Untracked),
            ensure_keystore(&config, &Untracked)
        );

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(std::fs::read_to_string(counter).unwrap().lines().count(), 1);
    }

    #[tokio::test]
    async fn generation_can_be_disabled() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, fake_keytool(&dir, "exit 0"));
        config.keystore.generate_if_missing = false;

        let err = ensure_keystore(&config, &Untracked).await.unwrap_err();
        assert!(matches!(err, BuildError::NotFound(_)));
    }
}
