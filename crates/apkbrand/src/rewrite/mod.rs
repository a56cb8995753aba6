//! Edits applied to the decompiled tree between decompile and recompile.

pub mod credentials;
pub mod icon;
pub mod identity;
pub mod label;
pub mod resources;

use crate::error::BuildError;
use apkbrand_request::{CredentialPayload, PackageName};
use std::path::Path;
use tracing::info;

/// Everything one build changes in the decompiled tree.
#[derive(Debug, Clone)]
pub struct Rebrand {
    pub app_name: String,
    pub package_name: Option<PackageName>,
    pub credentials: CredentialPayload,
    /// Normalized square PNG.
    pub icon_png: Option<Vec<u8>>,
}

#[derive(Debug, Default, Clone)]
pub struct RebrandReport {
    pub package: Option<identity::PackageIdentity>,
    pub icon: Option<icon::IconReport>,
}

impl Rebrand {
    /// Credentials, label, package, icon, in that order.
    pub fn apply(&self, decompiled: &Path) -> Result<RebrandReport, BuildError> {
        let mut report = RebrandReport::default();

        credentials::embed(decompiled, &self.credentials)?;
        label::set_label(decompiled, &self.app_name)?;

        if let Some(package) = &self.package_name {
            let (identity, _) = identity::rename_package(decompiled, package)?;
            report.package = Some(identity);
        }

        if let Some(png) = &self.icon_png {
            report.icon = Some(icon::apply_icon(decompiled, png)?);
        }

        info!(
            renamed = report.package.is_some(),
            icon = report.icon.is_some(),
            "decompiled tree rebranded"
        );
        Ok(report)
    }
}
