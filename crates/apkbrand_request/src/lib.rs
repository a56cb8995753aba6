//! Request model for the branding pipeline.
//!
//! A [`BuildRequest`] is what an outer transport hands over: either a build
//! (display name, optional package identifier, optional logo, credential
//! payload) or a cancellation of an in-flight build. [`BuildRequest::validate`]
//! turns it into exactly one [`RequestKind`], rejecting malformed input before
//! any workspace exists.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use typed_builder::TypedBuilder;

static PACKAGE_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_]*(\.[A-Za-z][A-Za-z0-9_]*)+$").expect("static regex")
});

static BUILD_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]{1,64}$").expect("static regex"));

static DATA_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^data:(image/[a-z0-9.+-]+);base64,(.+)$").expect("static regex")
});

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("app name is required")]
    MissingAppName,

    #[error("invalid package name: {0:?}")]
    InvalidPackageName(String),

    #[error("invalid build id: {0:?}")]
    InvalidBuildId(String),

    #[error("a cancel request needs a build id")]
    MissingBuildId,

    #[error("missing credential field `{0}`")]
    MissingCredentials(&'static str),

    #[error("invalid logo: {0}")]
    InvalidLogo(String),
}

/// Where the launcher icon comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogoSource {
    /// Fetched over HTTP(S) at build time.
    Url(String),
    /// Inline `data:image/*;base64,...` payload.
    DataUrl(String),
}

impl LogoSource {
    fn check(&self) -> Result<(), RequestError> {
        match self {
            LogoSource::Url(url) => {
                let lower = url.trim().to_ascii_lowercase();
                if lower.starts_with("http://") || lower.starts_with("https://") {
                    Ok(())
                } else {
                    Err(RequestError::InvalidLogo(
                        "logo url must be http(s)".to_string(),
                    ))
                }
            }
            LogoSource::DataUrl(data) => DataUrl::parse(data).map(|_| ()),
        }
    }
}

/// A borrowed view over a `data:image/*;base64,...` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataUrl<'a> {
    pub mime: &'a str,
    pub payload: &'a str,
}

impl<'a> DataUrl<'a> {
    pub fn parse(input: &'a str) -> Result<Self, RequestError> {
        let caps = DATA_URL_RE.captures(input.trim()).ok_or_else(|| {
            RequestError::InvalidLogo("logo must be data:image/*;base64,...".to_string())
        })?;

        let mime = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let payload = caps.get(2).map(|m| m.as_str()).unwrap_or_default();

        Ok(Self { mime, payload })
    }
}

/// The opaque per-build credential blob embedded into the package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPayload {
    pub user_id: String,
    pub token: String,
}

/// A dotted application identifier such as `com.acme.app`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PackageName(String);

impl PackageName {
    pub fn new(value: impl Into<String>) -> Result<Self, RequestError> {
        let value = value.into();
        if PACKAGE_NAME_RE.is_match(&value) {
            Ok(Self(value))
        } else {
            Err(RequestError::InvalidPackageName(value))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PackageName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, TypedBuilder, Deserialize)]
#[serde(default)]
pub struct BuildRequest {
    #[builder(default, setter(strip_option, into))]
    pub build_id: Option<String>,
    #[builder(default, setter(into))]
    pub app_name: String,
    #[builder(default, setter(strip_option, into))]
    pub package_name: Option<String>,
    #[builder(default, setter(strip_option))]
    pub logo: Option<LogoSource>,
    #[builder(default)]
    pub credentials: CredentialPayload,
    #[builder(default)]
    pub cancel: bool,
}

/// A build request that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedBuild {
    pub build_id: String,
    pub app_name: String,
    pub package_name: Option<PackageName>,
    pub logo: Option<LogoSource>,
    pub credentials: CredentialPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Build(ValidatedBuild),
    Cancel { build_id: String },
}

impl BuildRequest {
    pub fn validate(self) -> Result<RequestKind, RequestError> {
        let build_id = self
            .build_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        if self.cancel {
            let build_id = build_id.ok_or(RequestError::MissingBuildId)?;
            return Ok(RequestKind::Cancel { build_id });
        }

        let build_id = match build_id {
            Some(id) => check_build_id(id)?,
            None => generate_build_id(),
        };

        let app_name = self.app_name.trim().to_string();
        if app_name.is_empty() {
            return Err(RequestError::MissingAppName);
        }

        let package_name = self
            .package_name
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(PackageName::new)
            .transpose()?;

        let credentials = CredentialPayload {
            user_id: self.credentials.user_id.trim().to_string(),
            token: self.credentials.token.trim().to_string(),
        };
        if credentials.user_id.is_empty() {
            return Err(RequestError::MissingCredentials("user_id"));
        }
        if credentials.token.is_empty() {
            return Err(RequestError::MissingCredentials("token"));
        }

        if let Some(logo) = &self.logo {
            logo.check()?;
        }

        Ok(RequestKind::Build(ValidatedBuild {
            build_id,
            app_name,
            package_name,
            logo: self.logo,
            credentials,
        }))
    }
}

fn check_build_id(id: String) -> Result<String, RequestError> {
    if BUILD_ID_RE.is_match(&id) && id != "." && id != ".." {
        Ok(id)
    } else {
        Err(RequestError::InvalidBuildId(id))
    }
}

/// `<unix millis>_<random hex>`, unique enough to key in-flight builds.
pub fn generate_build_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();

    format!("{millis}_{:012x}", rand::random::<u64>() & 0xffff_ffff_ffff)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> CredentialPayload {
        CredentialPayload {
            user_id: "u-1".to_string(),
            token: "t-1".to_string(),
        }
    }

    fn build(req: BuildRequest) -> ValidatedBuild {
        match req.validate().unwrap() {
            RequestKind::Build(b) => b,
            other => panic!("expected a build, got {other:?}"),
        }
    }

    #[test]
    fn accepts_dotted_package_names() {
        for ok in ["com.acme.app", "a.b", "Com.Acme_2.App9"] {
            assert!(PackageName::new(ok).is_ok(), "{ok}");
        }
    }

    #[test]
    fn rejects_malformed_package_names() {
        for bad in ["acme", "com..acme", "1com.acme", "com.acme.", "com.ac-me", "com._acme"] {
            assert_eq!(
                PackageName::new(bad),
                Err(RequestError::InvalidPackageName(bad.to_string())),
                "{bad}"
            );
        }
    }

    #[test]
    fn cancel_takes_precedence_and_needs_an_id() {
        let req = BuildRequest::builder().build_id(" b-1 ").cancel(true).build();
        assert_eq!(
            req.validate(),
            Ok(RequestKind::Cancel {
                build_id: "b-1".to_string()
            })
        );

        let req = BuildRequest::builder().cancel(true).build();
        assert_eq!(req.validate(), Err(RequestError::MissingBuildId));
    }

    #[test]
    fn generates_a_build_id_when_absent() {
        let b = build(
            BuildRequest::builder()
                .app_name("Acme")
                .credentials(creds())
                .build(),
        );
        assert!(BUILD_ID_RE.is_match(&b.build_id));
        assert!(b.package_name.is_none());
    }

    #[test]
    fn rejects_path_like_build_ids() {
        for bad in ["..", "a/b", "a b"] {
            let req = BuildRequest::builder()
                .build_id(bad)
                .app_name("Acme")
                .credentials(creds())
                .build();
            assert_eq!(
                req.validate(),
                Err(RequestError::InvalidBuildId(bad.to_string()))
            );
        }
    }

    #[test]
    fn requires_both_credential_fields() {
        let req = BuildRequest::builder()
            .app_name("Acme")
            .credentials(CredentialPayload {
                user_id: "u".to_string(),
                token: "   ".to_string(),
            })
            .build();
        assert_eq!(req.validate(), Err(RequestError::MissingCredentials("token")));

        let req = BuildRequest::builder().app_name("Acme").build();
        assert_eq!(
            req.validate(),
            Err(RequestError::MissingCredentials("user_id"))
        );
    }

    #[test]
    fn blank_package_name_means_no_rename() {
        let b = build(
            BuildRequest::builder()
                .app_name("Acme")
                .package_name("  ")
                .credentials(creds())
                .build(),
        );
        assert!(b.package_name.is_none());
    }

    #[test]
    fn checks_logo_shape() {
        let req = BuildRequest::builder()
            .app_name("Acme")
            .credentials(creds())
            .logo(LogoSource::DataUrl("data:text/plain;base64,AAAA".to_string()))
            .build();
        assert!(matches!(req.validate(), Err(RequestError::InvalidLogo(_))));

        let req = BuildRequest::builder()
            .app_name("Acme")
            .credentials(creds())
            .logo(LogoSource::Url("file:///etc/passwd".to_string()))
            .build();
        assert!(matches!(req.validate(), Err(RequestError::InvalidLogo(_))));
    }

    #[test]
    fn parses_data_urls() {
        let url = DataUrl::parse("data:image/svg+xml;base64,PHN2Zz4=").unwrap();
        assert_eq!(url.mime, "image/svg+xml");
        assert_eq!(url.payload, "PHN2Zz4=");
    }

    #[test]
    fn deserializes_from_json() {
        let req: BuildRequest = serde_json::from_str(
            r#"{
                "app_name": "Acme",
                "package_name": "com.acme.app",
                "logo": { "url": "https://cdn.example.com/logo.png" },
                "credentials": { "user_id": "u-1", "token": "t-1" }
            }"#,
        )
        .unwrap();

        let b = build(req);
        assert_eq!(b.package_name.unwrap().as_str(), "com.acme.app");
        assert_eq!(
            b.logo,
            Some(LogoSource::Url("https://cdn.example.com/logo.png".to_string()))
        );
    }
}
