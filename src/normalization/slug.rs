use regex::Regex;
use std::sync::OnceLock;

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

fn disallowed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Word characters (ASCII), the Hebrew block and the hyphen survive.
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_\x{0590}-\x{05FF}-]").expect("static regex"))
}

/// Build the URL slug for a book name.
///
/// Trim, collapse whitespace runs into a single hyphen, then strip anything
/// that is not an ASCII word character, a Hebrew letter/mark, or a hyphen.
pub fn slugify(name: &str) -> String {
    let hyphenated = whitespace_re().replace_all(name.trim(), "-");
    disallowed_re().replace_all(&hyphenated, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_whitespace_and_strips_punctuation() {
        assert_eq!(slugify("  The   Book: Vol. 2 "), "The-Book-Vol-2");
    }

    #[test]
    fn keeps_hebrew_letters() {
        assert_eq!(slugify("ספר  הזוהר"), "ספר-הזוהר");
        assert_eq!(slugify("מסכת ברכות (דפוס וילנא)"), "מסכת-ברכות-דפוס-וילנא");
    }

    #[test]
    fn drops_other_scripts() {
        assert_eq!(slugify("Книга 1"), "-1");
    }
}
