//! The build pipeline: validate, decompile, rebrand, recompile, align, sign,
//! verify, publish.
//!
//! Stages run strictly in order and the first failure ends the build. Every
//! terminal path (success, failure, cancellation) ends by removing the
//! registry entry and tearing the workspace down.

use crate::apk::{apksigner, apktool, keytool, zipalign};
use crate::config::Config;
use crate::error::BuildError;
use crate::logo::LogoNormalizer;
use crate::publisher::{FinalArtifact, Publisher};
use crate::registry::{BuildRegistry, BuildScope};
use crate::rewrite::Rebrand;
use crate::workspace::BuildWorkspace;
use apkbrand_derive::EnumCode;
use apkbrand_request::{BuildRequest, RequestKind, ValidatedBuild};
use serde::Serialize;
use std::sync::Arc;
use tracing::{Instrument, error, info, info_span, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumCode)]
pub enum BuildStage {
    Decompiled,
    Rebranded,
    Recompiled,
    Aligned,
    Signed,
    Verified,
    Published,
    Failed,
}

/// What the caller gets back for a request that did not fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Published {
        build_id: String,
        /// Download path under the public prefix.
        path: String,
        artifact: FinalArtifact,
    },
    /// Answered for every cancel request; `found` is informational only.
    Cancelled { build_id: String, found: bool },
}

#[derive(Debug)]
pub struct Pipeline {
    config: Arc<Config>,
    registry: Arc<BuildRegistry>,
    publisher: Publisher,
    logos: LogoNormalizer,
}

impl Pipeline {
    pub fn new(config: Config) -> Result<Self, BuildError> {
        Self::with_registry(config, Arc::new(BuildRegistry::new()))
    }

    pub fn with_registry(config: Config, registry: Arc<BuildRegistry>) -> Result<Self, BuildError> {
        Ok(Self {
            publisher: Publisher::new(&config),
            logos: LogoNormalizer::new(&config.logo)?,
            config: Arc::new(config),
            registry,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BuildRegistry> {
        &self.registry
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Validates `request` and either cancels or builds.
    pub async fn handle(&self, request: BuildRequest) -> Result<Outcome, BuildError> {
        match request.validate()? {
            RequestKind::Cancel { build_id } => {
                let found = self.cancel(&build_id);
                Ok(Outcome::Cancelled { build_id, found })
            }
            RequestKind::Build(build) => self.build(build).await,
        }
    }

    /// Kills and tears down an in-flight build. `false` when there was none.
    pub fn cancel(&self, build_id: &str) -> bool {
        self.registry.cancel(build_id)
    }

    pub async fn build(&self, request: ValidatedBuild) -> Result<Outcome, BuildError> {
        let span = info_span!("build", build_id = %request.build_id);
        self.run_build(request).instrument(span).await
    }

    async fn run_build(&self, request: ValidatedBuild) -> Result<Outcome, BuildError> {
        info!(app_name = %request.app_name, package = ?request.package_name, "build requested");

        // a bad logo must fail before any workspace exists
        let icon_png = match &request.logo {
            Some(source) => Some(self.logos.load(source).await?),
            None => None,
        };

        let build_id = request.build_id.clone();
        let workspace = Arc::new(BuildWorkspace::create(&self.config.work_root, &build_id).await?);
        if let Err(err) = self.registry.register(&build_id, workspace.clone()) {
            workspace.teardown(true);
            return Err(err);
        }
        let scope = BuildScope::new(self.registry.clone(), build_id.clone());

        match self.run_stages(&request, &workspace, &scope, icon_png).await {
            Ok(artifact) => {
                if !self.registry.complete(&build_id, true) {
                    workspace.teardown(true);
                    warn!("cancelled while publishing, artifact withdrawn");
                    return Err(BuildError::Cancelled(build_id));
                }

                self.publisher.schedule_expiry(&artifact);
                let path = self.publisher.relative_path(&artifact.filename);
                info!(stage = %BuildStage::Published, %path, "build finished");

                Ok(Outcome::Published {
                    build_id,
                    path,
                    artifact,
                })
            }
            Err(err) => {
                let err = if scope.is_active() {
                    err
                } else {
                    BuildError::Cancelled(build_id.clone())
                };

                self.registry.complete(&build_id, false);
                // a killed tool may still have been writing when cancel removed the tree
                workspace.teardown(true);

                match &err {
                    BuildError::Cancelled(_) => info!("build stopped by cancel"),
                    other => error!(
                        stage = %BuildStage::Failed,
                        code = %other.code(),
                        "build failed: {}",
                        other.diagnostic()
                    ),
                }
                Err(err)
            }
        }
    }

    async fn run_stages(
        &self,
        request: &ValidatedBuild,
        workspace: &BuildWorkspace,
        scope: &BuildScope,
        icon_png: Option<Vec<u8>>,
    ) -> Result<FinalArtifact, BuildError> {
        let config = self.config.as_ref();

        let keystore = keytool::ensure_keystore(config, scope).await?;
        scope.ensure_active()?;

        apktool::decompile(config, &config.base_apk, workspace.decompiled_dir(), scope).await?;
        stage_done(BuildStage::Decompiled);
        scope.ensure_active()?;

        let rebrand = Rebrand {
            app_name: request.app_name.clone(),
            package_name: request.package_name.clone(),
            credentials: request.credentials.clone(),
            icon_png,
        };
        let decompiled = workspace.decompiled_dir().to_path_buf();
        tokio::task::spawn_blocking(move || rebrand.apply(&decompiled))
            .await
            .map_err(|err| BuildError::io("rebranding", std::io::Error::other(err)))??;
        stage_done(BuildStage::Rebranded);
        scope.ensure_active()?;

        apktool::recompile(config, workspace.decompiled_dir(), workspace.unsigned_apk(), scope)
            .await?;
        stage_done(BuildStage::Recompiled);
        scope.ensure_active()?;

        zipalign::align(config, workspace.unsigned_apk(), workspace.aligned_apk(), scope).await?;
        if config.verify_alignment {
            let check = zipalign::AlignmentCheck::new(workspace.aligned_apk(), config.alignment);
            tokio::task::spawn_blocking(move || check.verify())
                .await
                .map_err(|err| BuildError::io("verifying alignment", std::io::Error::other(err)))??;
        }
        stage_done(BuildStage::Aligned);
        scope.ensure_active()?;

        apksigner::sign(
            config,
            &keystore,
            workspace.aligned_apk(),
            workspace.signed_apk(),
            scope,
        )
        .await?;
        stage_done(BuildStage::Signed);
        scope.ensure_active()?;

        apksigner::verify(config, workspace.signed_apk(), scope).await?;
        stage_done(BuildStage::Verified);
        scope.ensure_active()?;

        self.publisher
            .publish(&request.app_name, workspace.signed_apk(), workspace)
            .await
    }
}

fn stage_done(stage: BuildStage) {
    info!(%stage, "stage complete");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use apkbrand_request::{CredentialPayload, LogoSource};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8" standalone="no"?><manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.example.base">
    <application android:icon="@mipmap/ic_launcher" android:label="Base">
        <activity android:name="com.example.base.MainActivity"/>
    </application>
</manifest>"#;

    #[derive(Default)]
    struct Hooks<'a> {
        build: &'a str,
        sign: &'a str,
        verify: &'a str,
    }

    struct Harness {
        _dir: TempDir,
        config: Config,
    }

    impl Harness {
        fn new(hooks: Hooks<'_>) -> Self {
            let dir = TempDir::new().unwrap();
            let root = dir.path();

            let fixture = root.join("fixture");
            write(&fixture, "AndroidManifest.xml", MANIFEST.as_bytes());
            write(&fixture, "apktool.yml", b"packageInfo:\n  renameManifestPackage: null\n");
            write(
                &fixture,
                "res/values/strings.xml",
                b"<resources>\n    <string name=\"app_name\">Base</string>\n</resources>\n",
            );
            write(&fixture, "res/mipmap-hdpi/ic_launcher.png", b"old-icon");
            write(
                &fixture,
                "smali/com/example/base/MainActivity.smali",
                b".class public Lcom/example/base/MainActivity;\n",
            );
            write(root, "base.apk", b"base");

            let bin = root.join("bin");
            let apktool = tool(
                &bin,
                "apktool",
                &format!(
                    r#"case "$1" in
  d)
    rm -rf "$5"
    cp -R "{fixture}" "$5"
    ;;
  b)
    {build}
    find "$2" -type f | sort | while read -r f; do cat "$f"; echo; done > "$4"
    ;;
esac"#,
                    fixture = fixture.display(),
                    build = hooks.build,
                ),
            );
            let zipalign = tool(&bin, "zipalign", r#"cp "$3" "$4""#);
            let apksigner = tool(
                &bin,
                "apksigner",
                &format!(
                    r#"if [ "$1" = sign ]; then
  {sign}
  while [ $# -gt 2 ]; do shift; done
  cp "$2" "$1"
else
  {verify}
  echo "Verifies"
fi"#,
                    sign = hooks.sign,
                    verify = hooks.verify,
                ),
            );
            let keytool = tool(
                &bin,
                "keytool",
                r#"while [ "$1" != "-keystore" ]; do shift; done
echo key > "$2""#,
            );

            let mut config = Config::default();
            config.base_apk = root.join("base.apk");
            config.work_root = root.join("work");
            config.public_dir = root.join("public");
            config.keystore.dir = root.join("keystore");
            config.tools.apktool = apktool;
            config.tools.zipalign = zipalign;
            config.tools.apksigner = apksigner;
            config.tools.keytool = keytool;
            config.verify_alignment = false;
            config.logo.size = 16;

            Self { _dir: dir, config }
        }

        fn pipeline(&self) -> Arc<Pipeline> {
            Arc::new(Pipeline::new(self.config.clone()).unwrap())
        }

        fn leftover_workspaces(&self) -> usize {
            std::fs::read_dir(&self.config.work_root)
                .map(|entries| entries.count())
                .unwrap_or_default()
        }

        fn published(&self) -> Vec<PathBuf> {
            std::fs::read_dir(&self.config.public_dir)
                .map(|entries| entries.map(|e| e.unwrap().path()).collect())
                .unwrap_or_default()
        }
    }

    fn write(dir: &Path, rel: &str, body: &[u8]) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    fn tool(bin: &Path, name: &str, body: &str) -> PathBuf {
        let path = bin.join(name);
        write(bin, name, format!("#!/bin/sh\n{body}\n").as_bytes());
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn request(build_id: &str, package: Option<&str>) -> BuildRequest {
        BuildRequest {
            build_id: Some(build_id.to_string()),
            app_name: "Acme".to_string(),
            package_name: package.map(str::to_string),
            logo: None,
            credentials: CredentialPayload {
                user_id: "user-7".to_string(),
                token: "tok-7".to_string(),
            },
            cancel: false,
        }
    }

    fn png_data_url() -> String {
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([1, 2, 3]));
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut out, image::ImageOutputFormat::Png)
            .unwrap();
        format!("data:image/png;base64,{}", STANDARD.encode(out.into_inner()))
    }

    #[tokio::test]
    async fn publishes_a_rebranded_build() {
        let harness = Harness::new(Hooks::default());
        let pipeline = harness.pipeline();
        let mut req = request("b-ok", Some("com.acme.app"));
        req.logo = Some(LogoSource::DataUrl(png_data_url()));

        let outcome = pipeline.handle(req).await.unwrap();

        let Outcome::Published { build_id, path, artifact } = outcome else {
            panic!("expected a published build");
        };
        assert_eq!(build_id, "b-ok");
        assert_eq!(path, "/downloads/Acme.apk");
        assert_eq!(artifact.filename, "Acme.apk");

        let contents = String::from_utf8_lossy(&std::fs::read(&artifact.path).unwrap()).into_owned();
        assert!(contents.contains(r#"package="com.acme.app""#));
        assert!(contents.contains(r#"<string name="app_name">Acme</string>"#));
        assert!(contents.contains(r#"android:label="@string/app_name""#));
        assert!(contents.contains("Lcom/acme/app/MainActivity;"));
        assert!(contents.contains("\"token\": \"tok-7\""));
        assert!(!contents.contains("com.example.base"));
        assert!(!contents.contains("old-icon"));

        assert!(!pipeline.registry().contains("b-ok"));
        assert_eq!(harness.leftover_workspaces(), 0);
        assert!(harness.config.keystore.path().is_file());
    }

    #[tokio::test]
    async fn without_a_package_the_identity_is_kept() {
        let harness = Harness::new(Hooks::default());
        let pipeline = harness.pipeline();

        let outcome = pipeline.handle(request("b-keep", None)).await.unwrap();

        let Outcome::Published { artifact, .. } = outcome else {
            panic!("expected a published build");
        };
        let contents = String::from_utf8_lossy(&std::fs::read(&artifact.path).unwrap()).into_owned();
        assert!(contents.contains(r#"package="com.example.base""#));
        assert!(contents.contains("Lcom/example/base/MainActivity;"));
    }

    #[tokio::test]
    async fn signing_failure_publishes_nothing() {
        let harness = Harness::new(Hooks {
            sign: r#"echo "Failed to load signer: keystore password was incorrect" >&2; exit 1"#,
            ..Hooks::default()
        });
        let pipeline = harness.pipeline();

        let err = pipeline.handle(request("b-sign", None)).await.unwrap_err();

        assert_eq!(err.code(), ErrorCode::ExternalTool);
        let BuildError::ExternalTool(failure) = &err else {
            unreachable!();
        };
        assert_eq!(failure.tool, "apksigner");
        assert_eq!(failure.exit_code(), Some(1));
        assert!(failure.stderr_tail.contains("keystore password was incorrect"));
        assert!(!failure.command.contains("keystorepass"));

        assert!(harness.published().is_empty());
        assert_eq!(harness.leftover_workspaces(), 0);
        assert!(!pipeline.registry().contains("b-sign"));
    }

    #[tokio::test]
    async fn verification_failure_publishes_nothing() {
        let harness = Harness::new(Hooks {
            verify: r#"echo "DOES NOT VERIFY" >&2; exit 1"#,
            ..Hooks::default()
        });
        let pipeline = harness.pipeline();

        let err = pipeline.handle(request("b-verify", None)).await.unwrap_err();

        assert!(err.diagnostic().contains("DOES NOT VERIFY"));
        assert!(harness.published().is_empty());
        assert_eq!(harness.leftover_workspaces(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_during_recompile_kills_and_cleans_up() {
        let scratch = TempDir::new().unwrap();
        let marker = scratch.path().join("building");
        let hook = format!(r#"touch "{}"; sleep 30"#, marker.display());
        let harness = Harness::new(Hooks {
            build: &hook,
            ..Hooks::default()
        });
        let pipeline = harness.pipeline();

        let build = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.handle(request("b-cancel", None)).await })
        };

        let deadline = std::time::Instant::now() + Duration::from_secs(20);
        while !(marker.exists() && pipeline.registry().live_processes("b-cancel") == 1) {
            assert!(std::time::Instant::now() < deadline, "recompile never started");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let outcome = pipeline
            .handle(BuildRequest {
                build_id: Some("b-cancel".to_string()),
                cancel: true,
                ..BuildRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Cancelled {
                build_id: "b-cancel".to_string(),
                found: true
            }
        );

        let started = std::time::Instant::now();
        let err = build.await.unwrap().unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(err, BuildError::Cancelled(_)));

        assert!(!pipeline.registry().contains("b-cancel"));
        assert_eq!(harness.leftover_workspaces(), 0);
        assert!(harness.published().is_empty());
    }

    #[tokio::test]
    async fn cancelling_an_unknown_build_succeeds() {
        let harness = Harness::new(Hooks::default());
        let pipeline = harness.pipeline();

        let outcome = pipeline
            .handle(BuildRequest {
                build_id: Some("ghost".to_string()),
                cancel: true,
                ..BuildRequest::default()
            })
            .await
            .unwrap();

        assert_eq!(
            outcome,
            Outcome::Cancelled {
                build_id: "ghost".to_string(),
                found: false
            }
        );
    }

    #[tokio::test]
    async fn invalid_requests_never_create_a_workspace() {
        let harness = Harness::new(Hooks::default());
        let pipeline = harness.pipeline();

        let err = pipeline
            .handle(request("b-bad", Some("not a package")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);

        let mut req = request("b-logo", None);
        req.logo = Some(LogoSource::DataUrl("data:image/png;base64,AAAA".to_string()));
        let err = pipeline.handle(req).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);

        assert!(!harness.config.work_root.exists());
    }

    #[tokio::test]
    async fn missing_base_package_is_not_found() {
        let harness = Harness::new(Hooks::default());
        std::fs::remove_file(&harness.config.base_apk).unwrap();
        let pipeline = harness.pipeline();

        let err = pipeline.handle(request("b-base", None)).await.unwrap_err();

        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(harness.leftover_workspaces(), 0);
    }

    #[tokio::test]
    async fn in_flight_ids_conflict() {
        let harness = Harness::new(Hooks::default());
        let pipeline = harness.pipeline();
        let other = Arc::new(
            BuildWorkspace::create(&harness.config.work_root, "b-dup")
                .await
                .unwrap(),
        );
        pipeline.registry().register("b-dup", other.clone()).unwrap();

        let err = pipeline.handle(request("b-dup", None)).await.unwrap_err();

        assert_eq!(err.code(), ErrorCode::Conflict);
        assert!(pipeline.registry().contains("b-dup"));
        assert!(other.temp_dir().exists());
        assert_eq!(harness.leftover_workspaces(), 1);
    }

    #[tokio::test]
    async fn repeated_names_get_distinct_artifacts() {
        let harness = Harness::new(Hooks::default());
        let pipeline = harness.pipeline();

        let (a, b) = tokio::join!(
            pipeline.handle(request("b-1", None)),
            pipeline.handle(request("b-2", None))
        );

        let mut names: Vec<String> = [a.unwrap(), b.unwrap()]
            .into_iter()
            .map(|outcome| match outcome {
                Outcome::Published { artifact, .. } => artifact.filename,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        names.sort();
        assert_eq!(names, ["Acme-2.apk", "Acme.apk"]);
    }
}
