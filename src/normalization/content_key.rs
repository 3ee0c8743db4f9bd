//! Key forms used to index and probe legacy content blobs.
//!
//! Legacy stores named the same page inconsistently: percent-encoded vs raw
//! Unicode, with or without a file extension, sometimes with a trailing
//! upload timestamp. Every helper here is pure so the index and the lookup
//! path derive exactly the same forms.

use regex::Regex;
use std::borrow::Cow;
use std::sync::OnceLock;

fn trailing_timestamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[_\-\s]\d{8,14}$").expect("static regex"))
}

/// Percent-decode; returns the input untouched when it is not valid UTF-8 after decoding.
pub fn percent_decode(raw: &str) -> Cow<'_, str> {
    if !raw.contains('%') {
        return Cow::Borrowed(raw);
    }
    match urlencoding::decode(raw) {
        Ok(decoded) => decoded,
        Err(_) => Cow::Borrowed(raw),
    }
}

/// Strip a short alphanumeric file extension from the last path segment.
pub fn strip_extension(raw: &str) -> &str {
    let seg_start = raw.rfind('/').map(|i| i + 1).unwrap_or(0);
    let Some(dot) = raw[seg_start..].rfind('.') else {
        return raw;
    };
    let dot = seg_start + dot;
    let ext = &raw[dot + 1..];
    if dot > seg_start && (1..=5).contains(&ext.len()) && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        &raw[..dot]
    } else {
        raw
    }
}

/// Strip a trailing `_1699999999999` / `-20231105` style upload stamp.
pub fn strip_trailing_timestamp(raw: &str) -> &str {
    match trailing_timestamp_re().find(raw) {
        Some(m) if m.start() > 0 => &raw[..m.start()],
        _ => raw,
    }
}

/// Every key form a blob named `name` is indexed under, most specific first.
///
/// The position in the returned vector is the variant's rank; lower ranks win
/// collisions in the content index.
pub fn index_variants(name: &str) -> Vec<String> {
    let raw = name.trim();
    let decoded = percent_decode(raw);
    let raw_no_ext = strip_extension(raw);
    let decoded_no_ext = strip_extension(&decoded);
    let bare = strip_trailing_timestamp(decoded_no_ext);
    let lowered = bare.to_lowercase();

    let mut out: Vec<String> = Vec::with_capacity(6);
    for candidate in [raw, decoded.as_ref(), raw_no_ext, decoded_no_ext, bare, lowered.as_str()] {
        if !candidate.is_empty() && !out.iter().any(|k| k == candidate) {
            out.push(candidate.to_string());
        }
    }
    out
}

/// Forms a lookup key is probed under: raw, percent-decoded, lowercase.
pub fn probe_forms(key: &str) -> Vec<String> {
    let raw = key.trim();
    let decoded = percent_decode(raw);
    let lowered = decoded.to_lowercase();
    let mut out: Vec<String> = Vec::with_capacity(3);
    for candidate in [raw, decoded.as_ref(), lowered.as_str()] {
        if !candidate.is_empty() && !out.iter().any(|k| k == candidate) {
            out.push(candidate.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_percent_encoded_hebrew() {
        let encoded = urlencoding::encode("ספר_1").into_owned();
        assert_eq!(percent_decode(&encoded), "ספר_1");
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(percent_decode("%FF%FE"), "%FF%FE");
    }

    #[test]
    fn strips_only_short_extensions() {
        assert_eq!(strip_extension("book_1.txt"), "book_1");
        assert_eq!(strip_extension("dir.v2/book_1"), "dir.v2/book_1");
        assert_eq!(strip_extension(".hidden"), ".hidden");
        assert_eq!(strip_extension("a.b.toolongext"), "a.b.toolongext");
    }

    #[test]
    fn strips_trailing_upload_stamp() {
        assert_eq!(strip_trailing_timestamp("book_3_1699999999999"), "book_3");
        assert_eq!(strip_trailing_timestamp("book-3-20231105"), "book-3");
        assert_eq!(strip_trailing_timestamp("book_3"), "book_3");
    }

    #[test]
    fn index_variants_are_ordered_and_unique() {
        let encoded = format!("{}.txt", urlencoding::encode("ספר_2"));
        let variants = index_variants(&encoded);
        assert_eq!(variants[0], encoded);
        assert_eq!(variants[1], "ספר_2.txt");
        assert_eq!(variants[2], urlencoding::encode("ספר_2").into_owned());
        assert_eq!(variants[3], "ספר_2");
        assert_eq!(variants.len(), 4);
    }

    #[test]
    fn probe_forms_dedupe() {
        assert_eq!(probe_forms("abc"), vec!["abc".to_string()]);
        assert_eq!(probe_forms("Abc"), vec!["Abc".to_string(), "abc".to_string()]);
    }
}
