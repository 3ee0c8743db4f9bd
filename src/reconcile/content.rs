//! Recovery of page text scattered across independently keyed legacy stores.
//!
//! Every blob is indexed once under all of its derivable key forms; a
//! (book, page) is then resolved by walking a fixed, ordered list of
//! candidate keys and taking the first hit.

use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use super::config::CandidateForm;
use crate::legacy::record::str_field;
use crate::normalization::content_key::{index_variants, probe_forms};

pub const TEXT_FIELDS: &[&str] = &["content", "text", "body", "pageText"];
const NAME_FIELDS: &[&str] = &["fileName", "name", "originalFileName", "key"];

/// First non-blank text member, returned untrimmed (page text keeps its layout).
pub fn text_field(obj: &Value) -> Option<String> {
    TEXT_FIELDS
        .iter()
        .filter_map(|n| obj.get(*n).and_then(Value::as_str))
        .find(|s| !s.trim().is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    rank: usize,
    blob: usize,
}

#[derive(Debug)]
pub struct ContentAssociator {
    blobs: Vec<String>,
    index: HashMap<String, Slot>,
    candidates: Vec<CandidateForm>,
    not_recovered: u64,
}

impl Default for ContentAssociator {
    fn default() -> Self {
        Self::new(CandidateForm::DEFAULT_ORDER.to_vec())
    }
}

impl ContentAssociator {
    pub fn new(candidates: Vec<CandidateForm>) -> Self {
        Self {
            blobs: Vec::new(),
            index: HashMap::new(),
            candidates,
            not_recovered: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn not_recovered(&self) -> u64 {
        self.not_recovered
    }

    /// Index `text` under every key form of `name`. Empty text is ignored so
    /// it can never shadow a real blob. Returns false when nothing was indexed.
    pub fn insert(&mut self, name: &str, text: &str) -> bool {
        if text.trim().is_empty() {
            return false;
        }
        let variants = index_variants(name);
        if variants.is_empty() {
            return false;
        }
        let blob = self.blobs.len();
        self.blobs.push(text.to_string());
        for (rank, key) in variants.into_iter().enumerate() {
            match self.index.get(&key) {
                // Equal or more specific entry already there: first one stays.
                Some(existing) if existing.rank <= rank => {}
                _ => {
                    self.index.insert(key, Slot { rank, blob });
                }
            }
        }
        true
    }

    /// Index a raw content record stored under `path_key`.
    ///
    /// `data` is either the text itself or an object carrying the text plus,
    /// optionally, its own file name (indexed as well).
    pub fn insert_record(&mut self, path_key: &str, data: &Value) -> bool {
        match data {
            Value::String(text) => self.insert(path_key, text),
            Value::Object(_) => {
                let Some(text) = text_field(data) else {
                    return false;
                };
                let mut indexed = self.insert(path_key, &text);
                if let Some(name) = str_field(data, NAME_FIELDS) {
                    if name != path_key {
                        indexed |= self.insert(&name, &text);
                    }
                }
                indexed
            }
            _ => false,
        }
    }

    /// Probe a single key (raw, percent-decoded, lowercase).
    pub fn lookup(&self, key: &str) -> Option<&str> {
        probe_forms(key)
            .iter()
            .find_map(|k| self.index.get(k))
            .map(|slot| self.blobs[slot.blob].as_str())
    }

    /// Candidate keys for a page, most specific first. An explicit key from
    /// the page record always leads.
    pub fn candidate_keys(&self, book: &str, slug: &str, page: i64, explicit: Option<&str>) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.candidates.len() + 1);
        if let Some(k) = explicit.map(str::trim).filter(|k| !k.is_empty()) {
            out.push(k.to_string());
        }
        for form in &self.candidates {
            let key = form.render(book, slug, page);
            if !out.contains(&key) {
                out.push(key);
            }
        }
        out
    }

    /// First hit along the candidate chain, with the key that matched.
    pub fn find(&self, book: &str, slug: &str, page: i64, explicit: Option<&str>) -> Option<(String, &str)> {
        self.candidate_keys(book, slug, page, explicit)
            .into_iter()
            .find_map(|key| self.lookup(&key).map(|text| (key, text)))
    }

    /// Recovered text for a page, or an empty string (counted as not recovered).
    pub fn recover(&mut self, book: &str, slug: &str, page: i64, explicit: Option<&str>) -> String {
        match self.find(book, slug, page, explicit) {
            Some((key, text)) => {
                debug!(book, page, key = %key, "page content recovered");
                text.to_string()
            }
            None => {
                self.not_recovered += 1;
                debug!(book, page, "page content not recovered");
                String::new()
            }
        }
    }

    /// Text for an upload whose own content is empty, looked up by file name.
    pub fn recover_upload(&self, book: &str, file_name: &str) -> Option<String> {
        self.lookup(&format!("{book}/{file_name}"))
            .or_else(|| self.lookup(file_name))
            .map(str::to_string)
    }
}
