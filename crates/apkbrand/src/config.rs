use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_KEYSTORE_PASS: &str = "APK_KEYSTORE_PASS";
pub const ENV_KEY_ALIAS: &str = "APK_KEY_ALIAS";
pub const ENV_KEY_PASS: &str = "APK_KEY_PASS";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The shared template package. Never modified.
    pub base_apk: PathBuf,
    /// Parent directory of the per-build workspaces.
    pub work_root: PathBuf,
    pub public_dir: PathBuf,
    pub public_url_prefix: String,
    pub retention_secs: u64,
    pub verify_alignment: bool,
    pub alignment: u64,
    pub keystore: KeystoreConfig,
    pub tools: ToolPaths,
    pub timeouts: Timeouts,
    pub logo: LogoConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_apk: PathBuf::from("static/apk/base.apk"),
            work_root: std::env::temp_dir().join("apkbrand"),
            public_dir: PathBuf::from("public/downloads"),
            public_url_prefix: "/downloads".to_string(),
            retention_secs: 300,
            verify_alignment: true,
            alignment: 4,
            keystore: KeystoreConfig::default(),
            tools: ToolPaths::default(),
            timeouts: Timeouts::default(),
            logo: LogoConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KeystoreConfig {
    pub dir: PathBuf,
    pub file: String,
    pub alias: String,
    pub store_pass: String,
    /// Falls back to `store_pass` when unset.
    pub key_pass: Option<String>,
    pub generate_if_missing: bool,
    pub dname: String,
}

impl KeystoreConfig {
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file)
    }

    pub fn key_pass(&self) -> &str {
        self.key_pass.as_deref().unwrap_or(&self.store_pass)
    }
}

impl Default for KeystoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("keystore"),
            file: "my-release-key.jks".to_string(),
            alias: "mykey".to_string(),
            store_pass: "keystorepass".to_string(),
            key_pass: None,
            generate_if_missing: true,
            dname: "CN=apkbrand, OU=Dev, O=MyCompany, L=City, ST=State, C=AR".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub apktool: PathBuf,
    pub zipalign: PathBuf,
    pub apksigner: PathBuf,
    pub keytool: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            apktool: PathBuf::from("apktool"),
            zipalign: PathBuf::from("zipalign"),
            apksigner: PathBuf::from("apksigner"),
            keytool: PathBuf::from("keytool"),
        }
    }
}

impl ToolPaths {
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Path)> {
        [
            ("apktool", self.apktool.as_path()),
            ("zipalign", self.zipalign.as_path()),
            ("apksigner", self.apksigner.as_path()),
            ("keytool", self.keytool.as_path()),
        ]
        .into_iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub keytool_secs: u64,
    pub decompile_secs: u64,
    pub build_secs: u64,
    pub align_secs: u64,
    pub sign_secs: u64,
    pub verify_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            keytool_secs: 120,
            decompile_secs: 300,
            build_secs: 600,
            align_secs: 60,
            sign_secs: 120,
            verify_secs: 60,
        }
    }
}

impl Timeouts {
    pub fn keytool(&self) -> Duration {
        Duration::from_secs(self.keytool_secs)
    }

    pub fn decompile(&self) -> Duration {
        Duration::from_secs(self.decompile_secs)
    }

    pub fn build(&self) -> Duration {
        Duration::from_secs(self.build_secs)
    }

    pub fn align(&self) -> Duration {
        Duration::from_secs(self.align_secs)
    }

    pub fn sign(&self) -> Duration {
        Duration::from_secs(self.sign_secs)
    }

    pub fn verify(&self) -> Duration {
        Duration::from_secs(self.verify_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogoConfig {
    pub max_bytes: usize,
    /// Edge length of the square launcher icon.
    pub size: u32,
    pub fetch_timeout_secs: u64,
}

impl Default for LogoConfig {
    fn default() -> Self {
        Self {
            max_bytes: 6 * 1024 * 1024,
            size: 512,
            fetch_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Reads `path` when given, otherwise starts from the defaults, then
    /// applies the keystore environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                Self::from_toml(&raw)
                    .with_context(|| format!("Failed to parse config {}", path.display()))?
            }
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Empty values are treated as unset.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.is_empty());

        if let Some(pass) = var(ENV_KEYSTORE_PASS) {
            self.keystore.store_pass = pass;
        }
        if let Some(alias) = var(ENV_KEY_ALIAS) {
            self.keystore.alias = alias;
        }
        if let Some(pass) = var(ENV_KEY_PASS) {
            self.keystore.key_pass = Some(pass);
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}
