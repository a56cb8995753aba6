//! Helpers shared by the rewriters: the decompiled layout, manifest access and
//! symbolic resource references.

use crate::error::{BuildError, IoContext};
use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

pub const MANIFEST: &str = "AndroidManifest.xml";
pub const ANDROID_NS: &str = "http://schemas.android.com/apk/res/android";

/// A `{type, name}` pair such as `mipmap/ic_launcher`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub kind: String,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Parses an app-local `@type/name` reference. Framework references
    /// (`@android:...`), theme attributes (`?attr/...`) and plain values
    /// yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix('@')?;
        let rest = rest.strip_prefix('+').unwrap_or(rest);
        let (kind, name) = rest.split_once('/')?;

        let valid = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid(kind) || !valid(name) {
            return None;
        }

        Some(Self::new(kind, name))
    }

    pub fn launcher_default() -> Self {
        Self::new("mipmap", "ic_launcher")
    }
}

impl Display for ResourceRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}/{}", self.kind, self.name)
    }
}

/// Every app-local reference found in attribute values and text of an XML
/// document, deduplicated in document order.
pub fn refs_in_xml(xml: &str) -> Result<Vec<ResourceRef>, roxmltree::Error> {
    let doc = roxmltree::Document::parse(xml)?;
    let mut seen = HashSet::new();
    let mut refs = Vec::new();

    for node in doc.descendants() {
        let values = node
            .attributes()
            .map(|attr| attr.value())
            .chain(node.is_text().then(|| node.text()).flatten());

        for value in values {
            if let Some(r) = ResourceRef::parse(value) {
                if seen.insert(r.clone()) {
                    refs.push(r);
                }
            }
        }
    }

    Ok(refs)
}

pub fn manifest_path(decompiled: &Path) -> PathBuf {
    decompiled.join(MANIFEST)
}

pub fn read_manifest(decompiled: &Path) -> Result<String, BuildError> {
    let path = manifest_path(decompiled);
    match std::fs::read_to_string(&path) {
        Ok(text) => Ok(text),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(BuildError::NotFound(
            format!("{} is missing from the decompiled tree", MANIFEST),
        )),
        Err(err) => Err(BuildError::io(format!("reading {}", path.display()), err)),
    }
}

pub fn write_if_changed(path: &Path, original: &str, updated: &str) -> Result<bool, BuildError> {
    if original == updated {
        return Ok(false);
    }

    std::fs::write(path, updated).io_context(|| format!("writing {}", path.display()))?;
    Ok(true)
}

/// Subdirectories of `res/`, sorted for deterministic processing.
pub fn resource_buckets(decompiled: &Path) -> Result<Vec<PathBuf>, BuildError> {
    let res = decompiled.join("res");
    let entries = match std::fs::read_dir(&res) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(BuildError::io(format!("listing {}", res.display()), err)),
    };

    let mut buckets = Vec::new();
    for entry in entries {
        let entry = entry.io_context(|| format!("listing {}", res.display()))?;
        if entry.path().is_dir() {
            buckets.push(entry.path());
        }
    }
    buckets.sort();

    Ok(buckets)
}

pub fn bucket_has_qualifier(bucket: &Path, qualifier: &str) -> bool {
    bucket
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| name.split('-').skip(1).any(|q| q == qualifier))
}
