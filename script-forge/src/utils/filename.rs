//! Filename helpers for persisted results.

use regex::Regex;
use std::sync::OnceLock;

/// Maximum slug length in characters.
const MAX_SLUG_CHARS: usize = 60;

fn separator_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\W_]+").expect("static regex"))
}

/// Turn a free-form topic into a lowercase, dash-separated slug.
///
/// Letters and digits of any script are kept; every other run of characters
/// becomes a single dash. Returns "untitled" if nothing survives.
///
/// ```
/// use script_forge::utils::filename::slugify;
///
/// assert_eq!(slugify("Hello, World!"), "hello-world");
/// assert_eq!(slugify("  ...  "), "untitled");
/// ```
pub fn slugify(input: &str) -> String {
    let lowered = input.to_lowercase();
    let replaced = separator_regex().replace_all(&lowered, "-");
    let slug: String = replaced
        .trim_matches('-')
        .chars()
        .take(MAX_SLUG_CHARS)
        .collect();
    let slug = slug.trim_end_matches('-');

    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug.to_string()
    }
}

/// Sequence-numbered result filename, e.g. `0007_midnight-drive.json`.
pub fn numbered_filename(number: u64, slug: &str) -> String {
    format!("{:04}_{}.json", number, slug)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_basic() {
        assert_eq!(slugify("Midnight Drive (Remix)"), "midnight-drive-remix");
        assert_eq!(slugify("a--b__c"), "a-b-c");
    }

    #[test]
    fn test_slugify_keeps_unicode_letters() {
        assert_eq!(slugify("夜に駆ける"), "夜に駆ける");
        assert_eq!(slugify("Café Noir"), "café-noir");
    }

    #[test]
    fn test_slugify_truncates() {
        let long = "word ".repeat(40);
        let slug = slugify(&long);
        assert!(slug.chars().count() <= MAX_SLUG_CHARS);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn test_numbered_filename() {
        assert_eq!(numbered_filename(7, "midnight-drive"), "0007_midnight-drive.json");
        assert_eq!(numbered_filename(12345, "x"), "12345_x.json");
    }
}
