//! Classification of recovered documents into legacy records.

use serde_json::{Map, Value};

use crate::normalization::content_key::percent_decode;

/// One `{ path, data }` document from a legacy export.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyRecord {
    /// Index of the export this record came from, in input order.
    pub source: usize,
    pub path: String,
    pub data: Value,
}

/// Semantic kind of a record, decided by the first path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKind {
    Users,
    Books,
    /// Page list scoped to one book (book name percent-decoded). A bare
    /// page list carries the book on each item instead.
    Pages { book: Option<String> },
    /// Raw content blob stored under `key` (as written in the path).
    Content { key: String },
    Uploads,
    Messages,
    Unknown,
}

impl RecordKind {
    pub fn label(&self) -> &'static str {
        match self {
            RecordKind::Users => "users",
            RecordKind::Books => "books",
            RecordKind::Pages { .. } => "pages",
            RecordKind::Content { .. } => "content",
            RecordKind::Uploads => "uploads",
            RecordKind::Messages => "messages",
            RecordKind::Unknown => "unknown",
        }
    }
}

/// Path prefixes per kind. First segments are compared case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPrefixes {
    pub users: Vec<String>,
    pub books: Vec<String>,
    pub pages: Vec<String>,
    pub content: Vec<String>,
    pub uploads: Vec<String>,
    pub messages: Vec<String>,
}

impl Default for PathPrefixes {
    fn default() -> Self {
        let v = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            users: v(&["users", "user_list"]),
            books: v(&["books", "book_list"]),
            pages: v(&["pages", "page_list"]),
            content: v(&["content", "texts", "page_texts"]),
            uploads: v(&["uploads"]),
            messages: v(&["messages"]),
        }
    }
}

fn has_prefix(list: &[String], seg: &str) -> bool {
    list.iter().any(|p| p.eq_ignore_ascii_case(seg))
}

/// An element of a record's `data`, with the map key it was stored under (if any).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LegacyItem<'a> {
    pub key: Option<&'a str>,
    pub value: &'a Value,
}

impl LegacyRecord {
    /// Accept a document shaped `{ "path": "...", "data": ... }`; hand it back otherwise.
    pub fn from_document(source: usize, doc: Value) -> Result<Self, Value> {
        let Value::Object(mut map) = doc else {
            return Err(doc);
        };
        let path = match map.get("path").and_then(Value::as_str) {
            Some(p) if !p.trim().is_empty() && map.contains_key("data") => p.trim().to_string(),
            _ => return Err(Value::Object(map)),
        };
        let data = map.remove("data").unwrap_or(Value::Null);
        Ok(Self { source, path, data })
    }

    fn segments(&self) -> Vec<&str> {
        self.path
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn kind(&self, prefixes: &PathPrefixes) -> RecordKind {
        let segs = self.segments();
        let Some(first) = segs.first().copied() else {
            return RecordKind::Unknown;
        };
        if has_prefix(&prefixes.users, first) {
            RecordKind::Users
        } else if has_prefix(&prefixes.books, first) {
            RecordKind::Books
        } else if has_prefix(&prefixes.pages, first) {
            RecordKind::Pages {
                book: segs
                    .get(1)
                    .map(|b| percent_decode(b).trim().to_string())
                    .filter(|b| !b.is_empty()),
            }
        } else if has_prefix(&prefixes.content, first) {
            if segs.len() < 2 {
                return RecordKind::Unknown;
            }
            RecordKind::Content {
                key: segs[1..].join("/"),
            }
        } else if has_prefix(&prefixes.uploads, first) {
            RecordKind::Uploads
        } else if has_prefix(&prefixes.messages, first) {
            RecordKind::Messages
        } else {
            RecordKind::Unknown
        }
    }

    /// The id segment following the kind segment(s), e.g. `u1` in `users/u1`
    /// or `7` in `pages/Book/7`.
    fn id_segment(&self, kind: &RecordKind) -> Option<&str> {
        let segs = self.segments();
        let idx = match kind {
            RecordKind::Pages { .. } => 2,
            _ => 1,
        };
        segs.get(idx).copied()
    }

    /// Expand `data` into entity items.
    ///
    /// Arrays yield each element; an object whose values are all objects is a
    /// map keyed by legacy id; anything else is a single item, keyed by the
    /// path's id segment when there is one.
    pub fn items(&self, kind: &RecordKind) -> Vec<LegacyItem<'_>> {
        match &self.data {
            Value::Array(xs) => xs
                .iter()
                .map(|value| LegacyItem { key: None, value })
                .collect(),
            Value::Object(map) if self.id_segment(kind).is_none() && is_keyed_map(map) => map
                .iter()
                .map(|(k, value)| LegacyItem {
                    key: Some(k.as_str()),
                    value,
                })
                .collect(),
            Value::Null => Vec::new(),
            value => vec![LegacyItem {
                key: self.id_segment(kind),
                value,
            }],
        }
    }
}

fn is_keyed_map(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.values().all(Value::is_object)
}

// ---------- Field access ----------

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => {
            let t = s.trim();
            (!t.is_empty()).then(|| t.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map.get("$oid").and_then(scalar_string),
        _ => None,
    }
}

/// First non-empty string (or number, or `{"$oid"}`) among `names`.
pub fn str_field(obj: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|n| obj.get(*n))
        .find_map(scalar_string)
}

/// First integer among `names`, accepting numeric strings.
pub fn i64_field(obj: &Value, names: &[&str]) -> Option<i64> {
    names.iter().filter_map(|n| obj.get(*n)).find_map(|v| match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    })
}

/// First non-null value among `names`.
pub fn value_field<'a>(obj: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|n| obj.get(*n))
        .find(|v| !v.is_null())
}

pub const LEGACY_ID_FIELDS: &[&str] = &["id", "_id", "legacyId", "uid"];

/// Legacy id of an item: explicit id field first, then the key it was stored under.
pub fn legacy_id(item: &LegacyItem<'_>) -> Option<String> {
    str_field(item.value, LEGACY_ID_FIELDS).or_else(|| {
        item.key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(path: &str, data: Value) -> LegacyRecord {
        LegacyRecord {
            source: 0,
            path: path.into(),
            data,
        }
    }

    #[test]
    fn classifies_by_first_segment() {
        let p = PathPrefixes::default();
        assert_eq!(record("users", json!([])).kind(&p), RecordKind::Users);
        assert_eq!(record("/Books/", json!([])).kind(&p), RecordKind::Books);
        let encoded = format!("pages/{}", urlencoding::encode("ספר א"));
        assert_eq!(
            record(&encoded, json!([])).kind(&p),
            RecordKind::Pages { book: Some("ספר א".into()) }
        );
        assert_eq!(record("pages", json!([])).kind(&p), RecordKind::Pages { book: None });
        assert_eq!(
            record("content/a/b.txt", json!("x")).kind(&p),
            RecordKind::Content { key: "a/b.txt".into() }
        );
        assert_eq!(record("settings", json!({})).kind(&p), RecordKind::Unknown);
    }

    #[test]
    fn from_document_requires_path_and_data() {
        assert!(LegacyRecord::from_document(0, json!({"path": "users", "data": []})).is_ok());
        assert!(LegacyRecord::from_document(0, json!({"path": "users"})).is_err());
        assert!(LegacyRecord::from_document(0, json!({"data": []})).is_err());
        assert!(LegacyRecord::from_document(0, json!([1, 2])).is_err());
    }

    #[test]
    fn expands_arrays_maps_and_single_items() {
        let p = PathPrefixes::default();
        let arr = record("users", json!([{"email": "a@b.com"}, {"email": "c@d.com"}]));
        assert_eq!(arr.items(&arr.kind(&p)).len(), 2);

        let map = record("users", json!({"u1": {"email": "a@b.com"}, "u2": {"email": "c@d.com"}}));
        let items = map.items(&map.kind(&p));
        assert_eq!(items.len(), 2);
        assert_eq!(legacy_id(&items[0]).as_deref(), Some("u1"));

        let single = record("users/u9", json!({"email": "a@b.com", "prefs": {}}));
        let items = single.items(&single.kind(&p));
        assert_eq!(items.len(), 1);
        assert_eq!(legacy_id(&items[0]).as_deref(), Some("u9"));

        let page = record("pages/X/3", json!({"number": 3}));
        let items = page.items(&page.kind(&p));
        assert_eq!(items[0].key, Some("3"));
    }

    #[test]
    fn field_helpers_are_lenient() {
        let v = json!({"id": {"$oid": "abc"}, "n": "12", "m": 4.0, "blank": "  ", "email": "x@y"});
        assert_eq!(str_field(&v, &["blank", "email"]).as_deref(), Some("x@y"));
        assert_eq!(str_field(&v, &["id"]).as_deref(), Some("abc"));
        assert_eq!(i64_field(&v, &["n"]), Some(12));
        assert_eq!(i64_field(&v, &["m"]), Some(4));
        assert_eq!(i64_field(&v, &["missing"]), None);
    }
}
