use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

pub const MAX_SLUG_LEN: usize = 60;
pub const FALLBACK_SLUG: &str = "App";

static SEPARATOR_RUNS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9]+").expect("static regex"));

/// Chainable normalizer that turns a display name into a filesystem-safe stem.
#[derive(Debug)]
pub struct FileSlug {
    text: String,
}

impl FileSlug {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
        }
    }

    pub fn into_inner(self) -> String {
        self.text
    }

    /// Decomposes accented characters and drops the combining marks.
    pub fn strip_diacritics(&mut self) -> &mut Self {
        self.text = self.text.nfd().filter(|c| !is_combining_mark(*c)).collect();

        self
    }

    /// Collapses every run of non-alphanumeric characters into one `_`.
    pub fn collapse_separators(&mut self) -> &mut Self {
        self.text = SEPARATOR_RUNS.replace_all(&self.text, "_").into_owned();

        self
    }

    pub fn trim_separators(&mut self) -> &mut Self {
        self.text = self.text.trim_matches('_').to_string();

        self
    }

    pub fn truncate(&mut self, max_chars: usize) -> &mut Self {
        if let Some((cut, _)) = self.text.char_indices().nth(max_chars) {
            self.text.truncate(cut);
        }

        self
    }

    pub fn or_fallback(&mut self, fallback: &str) -> &mut Self {
        if self.text.is_empty() {
            self.text = fallback.to_string();
        }

        self
    }
}

/// `"Café Móvil!"` becomes `"Cafe_Movil"`.
pub fn slugify(display_name: &str) -> String {
    let mut slug = FileSlug::new(display_name);
    slug.strip_diacritics()
        .collapse_separators()
        .trim_separators()
        .truncate(MAX_SLUG_LEN)
        .trim_separators()
        .or_fallback(FALLBACK_SLUG);

    slug.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_accents_and_collapses_punctuation() {
        assert_eq!(slugify("Café Móvil!"), "Cafe_Movil");
        assert_eq!(slugify("  --Ñandú   VPN--  "), "Nandu_VPN");
        assert_eq!(slugify("a/../b"), "a_b");
    }

    #[test]
    fn falls_back_when_nothing_survives() {
        assert_eq!(slugify(""), FALLBACK_SLUG);
        assert_eq!(slugify("!!! ???"), FALLBACK_SLUG);
        assert_eq!(slugify("日本語"), FALLBACK_SLUG);
    }

    #[test]
    fn bounds_the_length() {
        let slug = slugify(&"x".repeat(200));
        assert_eq!(slug.len(), MAX_SLUG_LEN);

        let edge = format!("{}!tail", "y".repeat(MAX_SLUG_LEN - 1));
        assert_eq!(slugify(&edge), "y".repeat(MAX_SLUG_LEN - 1));
    }
}
