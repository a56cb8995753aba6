//! Launcher icon replacement.
//!
//! Icons are replaced by resource name: every raster file in any resource
//! bucket that carries a launcher icon's name is overwritten in place, so no
//! reference to it needs to change. Adaptive-icon descriptors are followed to the layers they point
//! at.

use super::resources::{
    ANDROID_NS, ResourceRef, bucket_has_qualifier, read_manifest, refs_in_xml, resource_buckets,
};
use crate::error::{BuildError, IoContext};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const RASTER_EXTENSIONS: [&str; 2] = ["png", "webp"];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IconReport {
    /// Every resource visited, in traversal order.
    pub resources: Vec<ResourceRef>,
    pub replaced: Vec<PathBuf>,
}

/// The `android:icon` and `android:roundIcon` references of `<application>`,
/// or `@mipmap/ic_launcher` when there are none.
pub fn launcher_refs(manifest: &str) -> Result<Vec<ResourceRef>, BuildError> {
    let doc = roxmltree::Document::parse(manifest)
        .map_err(|err| BuildError::NotFound(format!("manifest could not be parsed: {err}")))?;

    let mut refs = Vec::new();
    if let Some(app) = doc.descendants().find(|n| n.has_tag_name("application")) {
        for attr in ["icon", "roundIcon"] {
            if let Some(r) = app.attribute((ANDROID_NS, attr)).and_then(ResourceRef::parse) {
                if !refs.contains(&r) {
                    refs.push(r);
                }
            }
        }
    }

    if refs.is_empty() {
        refs.push(ResourceRef::launcher_default());
    }

    Ok(refs)
}

/// Overwrites every launcher icon raster with `png`.
pub fn apply_icon(decompiled: &Path, png: &[u8]) -> Result<IconReport, BuildError> {
    let manifest = read_manifest(decompiled)?;
    let buckets = resource_buckets(decompiled)?;

    let mut report = IconReport::default();
    let mut visited = HashSet::new();
    let mut queue: VecDeque<ResourceRef> = launcher_refs(&manifest)?.into();

    while let Some(resource) = queue.pop_front() {
        if !visited.insert(resource.clone()) {
            continue;
        }

        // apps ship density variants under mipmap and drawable alike
        for bucket in &buckets {
            for ext in RASTER_EXTENSIONS {
                let candidate = bucket.join(format!("{}.{ext}", resource.name));
                if candidate.is_file() {
                    std::fs::write(&candidate, png)
                        .io_context(|| format!("writing {}", candidate.display()))?;
                    report.replaced.push(candidate);
                }
            }

            if bucket_has_qualifier(bucket, "anydpi") {
                queue.extend(
                    descriptor_refs(&bucket.join(format!("{}.xml", resource.name)))?
                        .into_iter()
                        .filter(|r| !visited.contains(r)),
                );
            }
        }

        report.resources.push(resource);
    }

    if report.replaced.is_empty() {
        warn!("no launcher icon rasters found to replace");
    }
    debug!(
        resources = report.resources.len(),
        files = report.replaced.len(),
        "launcher icon replaced"
    );

    Ok(report)
}

/// References inside an adaptive-icon descriptor; empty when there is none.
fn descriptor_refs(path: &Path) -> Result<Vec<ResourceRef>, BuildError> {
    if !path.is_file() {
        return Ok(Vec::new());
    }

    let xml = std::fs::read_to_string(path).io_context(|| format!("reading {}", path.display()))?;
    match refs_in_xml(&xml) {
        Ok(refs) => Ok(refs),
        Err(err) => {
            warn!(path = %path.display(), %err, "skipping unparsable icon descriptor");
            Ok(Vec::new())
        }
    }
}
