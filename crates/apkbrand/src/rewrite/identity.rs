//! Package identifier rewriting.
//!
//! The rename is textual: every literal occurrence of the old identifier is
//! replaced in the manifest, the resource XML and the smali trees, and the
//! smali namespace directories are moved to match. A package that merely
//! starts with the old identifier (`com.example.basement` for
//! `com.example.base`) is rewritten as well.

use super::resources::{manifest_path, read_manifest, write_if_changed};
use crate::error::{BuildError, IoContext};
use apkbrand_request::PackageName;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;
use walkdir::WalkDir;

static MANIFEST_PACKAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<manifest\b[^>]*?\spackage="([^"]+)""#).expect("static regex")
});

static RENAME_MANIFEST_PACKAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^([ \t]*)renameManifestPackage:.*$").expect("static regex")
});

static RENAME_INSTRUMENTATION_TARGET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^([ \t]*)renameInstrumentationTargetPackage:.*$").expect("static regex")
});

static PACKAGE_INFO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^packageInfo:[ \t]*$").expect("static regex"));

/// The identifier before and after a rename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageIdentity {
    pub old_package: String,
    pub new_package: String,
}

impl PackageIdentity {
    pub fn is_noop(&self) -> bool {
        self.old_package == self.new_package
    }

    /// `com.acme.app` as smali sees it: `com/acme/app`.
    fn old_internal(&self) -> String {
        self.old_package.replace('.', "/")
    }

    fn new_internal(&self) -> String {
        self.new_package.replace('.', "/")
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RenameReport {
    pub resource_files: usize,
    pub smali_files: usize,
    pub moved_dirs: usize,
}

/// Reads the package attribute of the decompiled manifest.
pub fn read_package(decompiled: &Path) -> Result<String, BuildError> {
    let manifest = read_manifest(decompiled)?;

    MANIFEST_PACKAGE
        .captures(&manifest)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| BuildError::NotFound("manifest has no package attribute".to_string()))
}

/// Renames the application package across the whole decompiled tree.
///
/// Nothing is touched when the current package cannot be read. Renaming to
/// the current package is a no-op.
pub fn rename_package(
    decompiled: &Path,
    new_package: &PackageName,
) -> Result<(PackageIdentity, RenameReport), BuildError> {
    let identity = PackageIdentity {
        old_package: read_package(decompiled)?,
        new_package: new_package.as_str().to_string(),
    };

    let mut report = RenameReport::default();
    if identity.is_noop() {
        debug!(package = %identity.new_package, "package unchanged, skipping rename");
        return Ok((identity, report));
    }

    info!(
        from = %identity.old_package,
        to = %identity.new_package,
        "renaming package"
    );

    rewrite_manifest(decompiled, &identity)?;
    report.resource_files = rewrite_resources(decompiled, &identity)?;

    for root in smali_roots(decompiled)? {
        report.smali_files += rewrite_smali(&root, &identity)?;
        if move_namespace_dir(&root, &identity)? {
            report.moved_dirs += 1;
        }
    }

    update_apktool_yml(decompiled, &identity)?;

    debug!(?report, "package rename finished");
    Ok((identity, report))
}

fn rewrite_manifest(decompiled: &Path, identity: &PackageIdentity) -> Result<(), BuildError> {
    let original = read_manifest(decompiled)?;
    let updated = original.replace(&identity.old_package, &identity.new_package);
    write_if_changed(&manifest_path(decompiled), &original, &updated)?;

    Ok(())
}

fn rewrite_resources(decompiled: &Path, identity: &PackageIdentity) -> Result<usize, BuildError> {
    let res = decompiled.join("res");
    if !res.is_dir() {
        return Ok(0);
    }

    let mut changed = 0;
    for path in files_under(&res, |p| p.extension().is_some_and(|ext| ext == "xml"))? {
        if replace_in_file(
            &path,
            &[(identity.old_package.as_str(), identity.new_package.as_str())],
        )? {
            changed += 1;
        }
    }

    Ok(changed)
}

fn rewrite_smali(root: &Path, identity: &PackageIdentity) -> Result<usize, BuildError> {
    let old_marker = format!("L{}/", identity.old_internal());
    let new_marker = format!("L{}/", identity.new_internal());
    let replacements = [
        (old_marker.as_str(), new_marker.as_str()),
        (identity.old_package.as_str(), identity.new_package.as_str()),
    ];

    let mut changed = 0;
    for path in files_under(root, |_| true)? {
        if replace_in_file(&path, &replacements)? {
            changed += 1;
        }
    }

    Ok(changed)
}

/// Moves `<root>/com/example/base` to the new namespace path when the old one
/// exists and the new one does not.
fn move_namespace_dir(root: &Path, identity: &PackageIdentity) -> Result<bool, BuildError> {
    let old_dir = root.join(identity.old_internal());
    let new_dir = root.join(identity.new_internal());

    if !old_dir.is_dir() || new_dir.exists() {
        return Ok(false);
    }

    let source = if new_dir.starts_with(&old_dir) {
        let staging = root.join(format!(".rename-{}", Uuid::new_v4().simple()));
        std::fs::rename(&old_dir, &staging)
            .io_context(|| format!("staging {}", old_dir.display()))?;
        staging
    } else {
        old_dir.clone()
    };

    if let Some(parent) = new_dir.parent() {
        std::fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::rename(&source, &new_dir)
        .io_context(|| format!("moving {} to {}", source.display(), new_dir.display()))?;

    prune_empty_ancestors(root, &old_dir);
    debug!(from = %old_dir.display(), to = %new_dir.display(), "namespace moved");

    Ok(true)
}

fn prune_empty_ancestors(root: &Path, start: &Path) {
    let mut current = Some(start);
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        // fails on non-empty directories, which ends the walk
        if std::fs::remove_dir(dir).is_err() && dir.exists() {
            break;
        }
        current = dir.parent();
    }
}

fn update_apktool_yml(decompiled: &Path, identity: &PackageIdentity) -> Result<(), BuildError> {
    let path = decompiled.join("apktool.yml");
    if !path.is_file() {
        return Ok(());
    }

    let original =
        std::fs::read_to_string(&path).io_context(|| format!("reading {}", path.display()))?;
    let new_package = &identity.new_package;

    let mut updated = if RENAME_MANIFEST_PACKAGE.is_match(&original) {
        RENAME_MANIFEST_PACKAGE
            .replace(&original, format!("${{1}}renameManifestPackage: {new_package}").as_str())
            .into_owned()
    } else if let Some(m) = PACKAGE_INFO.find(&original) {
        format!(
            "{}\n  renameManifestPackage: {new_package}{}",
            &original[..m.end()],
            &original[m.end()..]
        )
    } else {
        let sep = if original.ends_with('\n') || original.is_empty() { "" } else { "\n" };
        format!("{original}{sep}packageInfo:\n  renameManifestPackage: {new_package}\n")
    };

    if RENAME_INSTRUMENTATION_TARGET.is_match(&updated) {
        updated = RENAME_INSTRUMENTATION_TARGET
            .replace(
                &updated,
                format!("${{1}}renameInstrumentationTargetPackage: {new_package}").as_str(),
            )
            .into_owned();
    }

    write_if_changed(&path, &original, &updated)?;
    Ok(())
}

/// Top-level `smali`, `smali_classes2`, ... directories.
pub fn smali_roots(decompiled: &Path) -> Result<Vec<PathBuf>, BuildError> {
    let mut roots = Vec::new();
    for entry in std::fs::read_dir(decompiled)
        .io_context(|| format!("listing {}", decompiled.display()))?
    {
        let entry = entry.io_context(|| format!("listing {}", decompiled.display()))?;
        let is_smali = entry.file_name().to_string_lossy().starts_with("smali");
        if is_smali && entry.path().is_dir() {
            roots.push(entry.path());
        }
    }
    roots.sort();

    Ok(roots)
}

fn files_under<F>(root: &Path, keep: F) -> Result<Vec<PathBuf>, BuildError>
where
    F: Fn(&Path) -> bool,
{
    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|err| {
            let context = format!("walking {}", root.display());
            match err.into_io_error() {
                Some(io) => BuildError::io(context, io),
                None => BuildError::io(context, std::io::Error::other("filesystem loop")),
            }
        })?;
        if entry.file_type().is_file() && keep(entry.path()) {
            files.push(entry.into_path());
        }
    }

    Ok(files)
}

/// Applies `replacements` in order. Files that are not UTF-8 are skipped.
fn replace_in_file(path: &Path, replacements: &[(&str, &str)]) -> Result<bool, BuildError> {
    let bytes = std::fs::read(path).io_context(|| format!("reading {}", path.display()))?;
    let Ok(original) = String::from_utf8(bytes) else {
        return Ok(false);
    };

    let updated = replacements
        .iter()
        .fold(original.clone(), |text, &(from, to)| {
            if text.contains(from) {
                text.replace(from, to)
            } else {
                text
            }
        });

    write_if_changed(path, &original, &updated)
}
