//! Legacy id → target id maps for users and books.

use std::collections::HashMap;
use tracing::debug;

use crate::model::{BookId, UserId};
use crate::normalization::slug::slugify;

/// How an owner reference was mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Direct(UserId),
    ViaEmail(UserId),
    Unresolved,
}

impl Resolution {
    pub fn user_id(self) -> Option<UserId> {
        match self {
            Resolution::Direct(id) | Resolution::ViaEmail(id) => Some(id),
            Resolution::Unresolved => None,
        }
    }
}

/// Lowercased, trimmed email; `None` when it cannot be an address.
pub fn normalize_email(raw: &str) -> Option<String> {
    let e = raw.trim().to_lowercase();
    let (local, domain) = e.split_once('@')?;
    if local.is_empty() || domain.is_empty() || e.chars().any(char::is_whitespace) {
        return None;
    }
    Some(e)
}

#[derive(Debug, Default)]
pub struct IdentifierResolver {
    user_ids: HashMap<String, UserId>,
    legacy_emails: HashMap<String, String>,
    email_ids: HashMap<String, UserId>,
    book_ids: HashMap<String, BookId>,
    slugs: HashMap<String, String>,
    unresolved: u64,
}

impl IdentifierResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember that `legacy_id` belongs to `email`. The first association wins.
    pub fn learn_email(&mut self, legacy_id: &str, email: &str) {
        let Some(email) = normalize_email(email) else {
            return;
        };
        let legacy_id = legacy_id.trim();
        if legacy_id.is_empty() {
            return;
        }
        match self.legacy_emails.get(legacy_id) {
            Some(existing) if existing != &email => {
                debug!(legacy_id, kept = %existing, ignored = %email, "conflicting email for legacy id");
            }
            Some(_) => {}
            None => {
                self.legacy_emails.insert(legacy_id.to_string(), email);
            }
        }
    }

    /// Record a materialized user under its legacy id and email.
    pub fn register_user(&mut self, legacy_id: Option<&str>, email: &str, target: UserId) {
        if let Some(email) = normalize_email(email) {
            if let Some(id) = legacy_id {
                self.learn_email(id, &email);
            }
            self.email_ids.insert(email, target);
        }
        if let Some(id) = legacy_id.map(str::trim).filter(|id| !id.is_empty()) {
            self.user_ids.insert(id.to_string(), target);
        }
    }

    /// Map an owner reference without touching the unresolved counter.
    pub fn lookup_user(&self, reference: &str) -> Resolution {
        let reference = reference.trim();
        if reference.is_empty() {
            return Resolution::Unresolved;
        }
        if let Some(&id) = self.user_ids.get(reference) {
            return Resolution::Direct(id);
        }
        if let Some(id) = self
            .legacy_emails
            .get(reference)
            .and_then(|email| self.email_ids.get(email))
        {
            return Resolution::ViaEmail(*id);
        }
        if let Some(id) = normalize_email(reference).and_then(|e| self.email_ids.get(&e)) {
            return Resolution::ViaEmail(*id);
        }
        Resolution::Unresolved
    }

    /// Resolve an optional owner reference: direct map, then id → email → id,
    /// else unresolved (counted). An absent reference is not counted.
    pub fn resolve_owner(&mut self, reference: Option<&str>) -> Option<UserId> {
        let reference = reference?.trim();
        if reference.is_empty() {
            return None;
        }
        match self.lookup_user(reference) {
            Resolution::Unresolved => {
                self.unresolved += 1;
                debug!(reference, "owner reference unresolved; nulling");
                None
            }
            r => r.user_id(),
        }
    }

    pub fn unresolved(&self) -> u64 {
        self.unresolved
    }

    pub fn register_book(&mut self, name: &str, id: BookId) {
        self.book_ids.insert(name.to_string(), id);
    }

    pub fn book_id(&self, name: &str) -> Option<BookId> {
        self.book_ids.get(name).copied()
    }

    /// Cached slug for a book name.
    pub fn slug(&mut self, name: &str) -> String {
        if let Some(s) = self.slugs.get(name) {
            return s.clone();
        }
        let s = slugify(name);
        self.slugs.insert(name.to_string(), s.clone());
        s
    }

    pub fn user_count(&self) -> usize {
        self.email_ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_emails() {
        assert_eq!(normalize_email("  A@B.Com "), Some("a@b.com".into()));
        assert_eq!(normalize_email("no-at-sign"), None);
        assert_eq!(normalize_email("@b.com"), None);
        assert_eq!(normalize_email("a b@c.com"), None);
    }

    #[test]
    fn direct_map_wins_over_email_chain() {
        let mut r = IdentifierResolver::new();
        r.register_user(Some("u1"), "a@b.com", 10);
        assert_eq!(r.lookup_user("u1"), Resolution::Direct(10));
    }

    #[test]
    fn email_chain_resolves_ids_only_seen_alongside_an_email() {
        let mut r = IdentifierResolver::new();
        r.register_user(Some("u1"), "a@b.com", 10);
        // A second legacy id for the same person, known only from an upload record.
        r.learn_email("legacy-42", "A@B.com");
        assert_eq!(r.lookup_user("legacy-42"), Resolution::ViaEmail(10));
        assert_eq!(r.resolve_owner(Some("legacy-42")), Some(10));
        assert_eq!(r.unresolved(), 0);
    }

    #[test]
    fn email_reference_resolves_directly() {
        let mut r = IdentifierResolver::new();
        r.register_user(None, "a@b.com", 10);
        assert_eq!(r.resolve_owner(Some("A@b.com")), Some(10));
    }

    #[test]
    fn unresolved_is_counted_absent_is_not() {
        let mut r = IdentifierResolver::new();
        assert_eq!(r.resolve_owner(Some("ghost")), None);
        assert_eq!(r.resolve_owner(None), None);
        assert_eq!(r.resolve_owner(Some("  ")), None);
        assert_eq!(r.unresolved(), 1);
    }

    #[test]
    fn first_email_association_is_kept() {
        let mut r = IdentifierResolver::new();
        r.learn_email("u1", "first@x.com");
        r.learn_email("u1", "second@x.com");
        r.register_user(None, "second@x.com", 2);
        r.register_user(None, "first@x.com", 1);
        assert_eq!(r.lookup_user("u1"), Resolution::ViaEmail(1));
    }

    #[test]
    fn books_and_slugs() {
        let mut r = IdentifierResolver::new();
        assert_eq!(r.book_id("X"), None);
        r.register_book("X", 5);
        assert_eq!(r.book_id("X"), Some(5));
        assert_eq!(r.slug(" ספר  א "), "ספר-א");
        assert_eq!(r.slug(" ספר  א "), "ספר-א");
    }
}
