use super::resources::{manifest_path, read_manifest, write_if_changed};
use crate::error::{BuildError, IoContext};
use once_cell::sync::Lazy;
use regex::{NoExpand, Regex};
use std::path::Path;
use tracing::debug;

pub const APP_NAME_KEY: &str = "app_name";
const LABEL_REF: &str = "@string/app_name";

static APP_NAME_ENTRY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<string\s+name="app_name"[^>]*?(?:/>|>.*?</string>)"#).expect("static regex")
});

static APPLICATION_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<application\b[^>]*>").expect("static regex"));

static LABEL_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"android:label="[^"]*""#).expect("static regex"));

/// Sets the launcher-visible application name.
///
/// The name goes into the `app_name` string entry (created when missing) and
/// the manifest's `<application>` label is pointed at it.
pub fn set_label(decompiled: &Path, display_name: &str) -> Result<(), BuildError> {
    let entry = format!(
        r#"<string name="{APP_NAME_KEY}">{}</string>"#,
        escape_string_resource(display_name)
    );

    let strings = decompiled.join("res").join("values").join("strings.xml");
    let changed = if strings.exists() {
        let original = std::fs::read_to_string(&strings)
            .io_context(|| format!("reading {}", strings.display()))?;
        let updated = upsert_entry(&original, &entry).ok_or_else(|| {
            BuildError::NotFound(format!("{} has no </resources> close tag", strings.display()))
        })?;
        write_if_changed(&strings, &original, &updated)?
    } else {
        let parent = strings.parent().unwrap_or(decompiled);
        std::fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
        let created = format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<resources>\n    {entry}\n</resources>\n"
        );
        std::fs::write(&strings, created).io_context(|| format!("writing {}", strings.display()))?;
        true
    };
    debug!(changed, "string table updated");

    let manifest = read_manifest(decompiled)?;
    let updated = point_label_at_string(&manifest).ok_or_else(|| {
        BuildError::NotFound("manifest has no <application> element".to_string())
    })?;
    let changed = write_if_changed(&manifest_path(decompiled), &manifest, &updated)?;
    debug!(changed, "manifest label updated");

    Ok(())
}

fn upsert_entry(strings_xml: &str, entry: &str) -> Option<String> {
    if APP_NAME_ENTRY.is_match(strings_xml) {
        return Some(APP_NAME_ENTRY.replace(strings_xml, NoExpand(entry)).into_owned());
    }

    let close = strings_xml.rfind("</resources>")?;
    let mut out = String::with_capacity(strings_xml.len() + entry.len() + 8);
    out.push_str(&strings_xml[..close]);
    out.push_str("    ");
    out.push_str(entry);
    out.push('\n');
    out.push_str(&strings_xml[close..]);

    Some(out)
}

fn point_label_at_string(manifest: &str) -> Option<String> {
    let tag = APPLICATION_TAG.find(manifest)?;
    let open = tag.as_str();

    let rewritten = if LABEL_ATTR.is_match(open) {
        LABEL_ATTR
            .replace(open, NoExpand(&format!(r#"android:label="{LABEL_REF}""#)))
            .into_owned()
    } else {
        open.replacen(
            "<application",
            &format!(r#"<application android:label="{LABEL_REF}""#),
            1,
        )
    };

    Some(format!(
        "{}{}{}",
        &manifest[..tag.start()],
        rewritten,
        &manifest[tag.end()..]
    ))
}

/// Escapes a display name so the resource compiler renders it literally.
pub fn escape_string_resource(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 8);

    for (i, c) in value.chars().enumerate() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '@' | '?' if i == 0 => {
                out.push('\\');
                out.push(c);
            }
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8" standalone="no"?><manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.example.base">
    <application android:icon="@mipmap/ic_launcher" android:label="Base App" android:theme="@style/AppTheme">
        <activity android:label="@string/app_name" android:name="com.example.base.MainActivity"/>
    </application>
</manifest>"#;

    fn tree(strings: Option<&str>) -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("AndroidManifest.xml"), MANIFEST).unwrap();
        if let Some(strings) = strings {
            let values = dir.path().join("res/values");
            std::fs::create_dir_all(&values).unwrap();
            std::fs::write(values.join("strings.xml"), strings).unwrap();
        }
        dir
    }

    fn read(dir: &TempDir, rel: &str) -> String {
        std::fs::read_to_string(dir.path().join(rel)).unwrap()
    }

    #[test]
    fn replaces_existing_entry_and_literal_label() {
        let dir = tree(Some(
            "<resources>\n    <string name=\"app_name\">Base</string>\n    <string name=\"other\">x</string>\n</resources>\n",
        ));

        set_label(dir.path(), "Acme $1 & Co").unwrap();

        let strings = read(&dir, "res/values/strings.xml");
        assert!(strings.contains(r#"<string name="app_name">Acme $1 &amp; Co</string>"#));
        assert!(strings.contains(r#"<string name="other">x</string>"#));

        let manifest = read(&dir, "AndroidManifest.xml");
        assert!(manifest.contains(r#"<application android:icon="@mipmap/ic_launcher" android:label="@string/app_name" android:theme"#));
        assert!(!manifest.contains("Base App"));
    }

    #[test]
    fn inserts_missing_entry_before_close_tag() {
        let dir = tree(Some("<resources>\n    <string name=\"other\">x</string>\n</resources>\n"));

        set_label(dir.path(), "Acme").unwrap();

        let strings = read(&dir, "res/values/strings.xml");
        assert!(strings.ends_with("    <string name=\"app_name\">Acme</string>\n</resources>\n"));
    }

    #[test]
    fn creates_the_string_table_when_absent() {
        let dir = tree(None);

        set_label(dir.path(), "Acme").unwrap();

        let strings = read(&dir, "res/values/strings.xml");
        assert!(strings.contains(r#"<string name="app_name">Acme</string>"#));
    }

    #[test]
    fn inserts_label_attribute_when_absent() {
        let rewritten =
            point_label_at_string(r#"<manifest><application android:icon="@mipmap/a"></application></manifest>"#)
                .unwrap();
        assert_eq!(
            rewritten,
            r#"<manifest><application android:label="@string/app_name" android:icon="@mipmap/a"></application></manifest>"#
        );
    }

    #[test]
    fn is_idempotent() {
        let dir = tree(Some("<resources>\n</resources>\n"));

        set_label(dir.path(), "O'Brien \"Pro\"").unwrap();
        let first = (read(&dir, "res/values/strings.xml"), read(&dir, "AndroidManifest.xml"));
        set_label(dir.path(), "O'Brien \"Pro\"").unwrap();
        let second = (read(&dir, "res/values/strings.xml"), read(&dir, "AndroidManifest.xml"));

        assert_eq!(first, second);
        assert!(first.0.contains(r#"O\'Brien \"Pro\""#));
    }

    #[test]
    fn escapes_resource_metacharacters() {
        assert_eq!(escape_string_resource("@home"), "\\@home");
        assert_eq!(escape_string_resource("why?"), "why?");
        assert_eq!(escape_string_resource("a\\b <c>"), "a\\\\b &lt;c&gt;");
    }
}
