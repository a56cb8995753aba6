/// Splits a `CamelCase` identifier on its word boundaries and joins the
/// words with underscores, upper-cased.
///
/// An uppercase letter starts a new word when it follows a lowercase letter
/// or digit, or when it is followed by a lowercase letter inside a run of
/// capitals (`IOError` -> `IO_ERROR`).
pub(crate) fn screaming_snake(ident: &str) -> String {
    let chars: Vec<char> = ident.chars().collect();
    let mut result = String::with_capacity(ident.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if i > 0 && c.is_uppercase() {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());

            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_is_lower)
            {
                result.push('_');
            }
        }

        result.extend(c.to_uppercase());
    }

    result
}

#[cfg(test)]
mod tests {
    use super::screaming_snake;

    #[test]
    fn splits_camel_case_words() {
        assert_eq!(screaming_snake("ExternalTool"), "EXTERNAL_TOOL");
        assert_eq!(screaming_snake("NotFound"), "NOT_FOUND");
        assert_eq!(screaming_snake("Verified"), "VERIFIED");
    }

    #[test]
    fn keeps_acronyms_together() {
        assert_eq!(screaming_snake("IO"), "IO");
        assert_eq!(screaming_snake("IOError"), "IO_ERROR");
        assert_eq!(screaming_snake("Sha256Digest"), "SHA256_DIGEST");
    }
}
