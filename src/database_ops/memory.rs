//! In-process [`TargetStore`] used for dry runs and tests.

use anyhow::{anyhow, bail, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::store::{BookAggregate, TargetStore, RESET_REQUIRED_HASH};
use crate::model::{
    Book, BookId, Message, NewBook, NewMessage, NewPage, NewUpload, NewUser, Page, PageStatus,
    Upload, User, UserId,
};

#[derive(Debug, Default)]
struct MemoryState {
    users: Vec<User>,
    users_by_email: HashMap<String, usize>,
    books: Vec<Book>,
    books_by_name: HashMap<String, usize>,
    pages: BTreeMap<(BookId, i64), Page>,
    uploads: BTreeMap<(String, String), Upload>,
    messages: BTreeMap<String, Message>,
    locked: bool,
    unavailable: bool,
}

/// Full, ordered copy of the store content. Two snapshots compare equal iff
/// the stores hold the same data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemorySnapshot {
    pub users: Vec<User>,
    pub books: Vec<Book>,
    pub pages: Vec<Page>,
    pub uploads: Vec<Upload>,
    pub messages: Vec<Message>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        let guard = self
            .state
            .lock()
            .map_err(|_| anyhow!("memory store poisoned"))?;
        if guard.unavailable {
            bail!("memory store unavailable");
        }
        Ok(guard)
    }

    /// Simulate the store going away (every call fails until re-enabled).
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut guard) = self.state.lock() {
            guard.unavailable = unavailable;
        }
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        MemorySnapshot {
            users: guard.users.clone(),
            books: guard.books.clone(),
            pages: guard.pages.values().cloned().collect(),
            uploads: guard.uploads.values().cloned().collect(),
            messages: guard.messages.values().cloned().collect(),
        }
    }

    /// Test hook: overwrite stored aggregates to simulate upstream drift.
    pub fn force_book_aggregates(&self, book_id: BookId, total: i64, completed: i64) {
        if let Ok(mut guard) = self.state.lock() {
            if let Some(book) = guard.books.iter_mut().find(|b| b.id == book_id) {
                book.total_pages = total;
                book.completed_pages = completed;
            }
        }
    }
}

#[async_trait::async_trait]
impl TargetStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn acquire_run_lock(&self) -> Result<()> {
        let mut st = self.state()?;
        if st.locked {
            bail!("another migration run holds the lock");
        }
        st.locked = true;
        Ok(())
    }

    async fn release_run_lock(&self) -> Result<()> {
        let mut st = self
            .state
            .lock()
            .map_err(|_| anyhow!("memory store poisoned"))?;
        st.locked = false;
        Ok(())
    }

    async fn upsert_user(&self, user: &NewUser) -> Result<UserId> {
        let mut st = self.state()?;
        let existing_idx = st.users_by_email.get(&user.email).copied();
        if let Some(idx) = existing_idx {
            let existing = &mut st.users[idx];
            if user.legacy_id.is_some() {
                existing.legacy_id = user.legacy_id.clone();
            }
            existing.name = user.name.clone();
            if user.password_hash != RESET_REQUIRED_HASH {
                existing.password_hash = user.password_hash.clone();
            }
            existing.role = user.role;
            existing.points = user.points;
            return Ok(existing.id);
        }
        let id = st.users.len() as UserId + 1;
        st.users.push(User {
            id,
            legacy_id: user.legacy_id.clone(),
            name: user.name.clone(),
            email: user.email.clone(),
            password_hash: user.password_hash.clone(),
            role: user.role,
            points: user.points,
        });
        let idx = st.users.len() - 1;
        st.users_by_email.insert(user.email.clone(), idx);
        Ok(id)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserId>> {
        let st = self.state()?;
        Ok(st.users_by_email.get(email).map(|&idx| st.users[idx].id))
    }

    async fn ensure_book(&self, book: &NewBook) -> Result<BookId> {
        let mut st = self.state()?;
        if let Some(&idx) = st.books_by_name.get(&book.name) {
            return Ok(st.books[idx].id);
        }
        let id = st.books.len() as BookId + 1;
        st.books.push(Book {
            id,
            name: book.name.clone(),
            slug: book.slug.clone(),
            total_pages: book.total_pages,
            completed_pages: book.completed_pages,
            category: book.category.clone(),
        });
        let idx = st.books.len() - 1;
        st.books_by_name.insert(book.name.clone(), idx);
        Ok(id)
    }

    async fn find_book_by_name(&self, name: &str) -> Result<Option<BookId>> {
        let st = self.state()?;
        Ok(st.books_by_name.get(name).map(|&idx| st.books[idx].id))
    }

    async fn insert_pages(&self, pages: &[NewPage]) -> Result<u64> {
        let mut st = self.state()?;
        let mut inserted = 0u64;
        for page in pages {
            let key = (page.book_id, page.page_number);
            if !st.pages.contains_key(&key) {
                st.pages.insert(key, page.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn insert_uploads(&self, uploads: &[NewUpload]) -> Result<u64> {
        let mut st = self.state()?;
        let mut inserted = 0u64;
        for upload in uploads {
            let key = (upload.book_name.clone(), upload.original_file_name.clone());
            if !st.uploads.contains_key(&key) {
                st.uploads.insert(key, upload.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn insert_messages(&self, messages: &[NewMessage]) -> Result<u64> {
        let mut st = self.state()?;
        let mut inserted = 0u64;
        for message in messages {
            if !st.messages.contains_key(&message.identity) {
                st.messages.insert(message.identity.clone(), message.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn book_aggregates(&self) -> Result<Vec<BookAggregate>> {
        let st = self.state()?;
        let mut counts: HashMap<BookId, (i64, i64)> = HashMap::new();
        for page in st.pages.values() {
            let entry = counts.entry(page.book_id).or_default();
            entry.0 += 1;
            if page.status == PageStatus::Completed {
                entry.1 += 1;
            }
        }
        Ok(st
            .books
            .iter()
            .map(|b| {
                let (actual_total, actual_completed) =
                    counts.get(&b.id).copied().unwrap_or_default();
                BookAggregate {
                    book_id: b.id,
                    name: b.name.clone(),
                    stored_total: b.total_pages,
                    stored_completed: b.completed_pages,
                    actual_total,
                    actual_completed,
                }
            })
            .collect())
    }

    async fn set_book_aggregates(&self, book_id: BookId, total: i64, completed: i64) -> Result<()> {
        let mut st = self.state()?;
        let book = st
            .books
            .iter_mut()
            .find(|b| b.id == book_id)
            .ok_or_else(|| anyhow!("book {book_id} not found"))?;
        book.total_pages = total;
        book.completed_pages = completed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    fn user(email: &str, hash: &str) -> NewUser {
        NewUser {
            legacy_id: None,
            name: "n".into(),
            email: email.into(),
            password_hash: hash.into(),
            role: Role::User,
            points: 0,
        }
    }

    #[tokio::test]
    async fn upsert_user_is_keyed_by_email_and_keeps_real_hash() {
        let store = MemoryStore::new();
        let a = store.upsert_user(&user("a@b.com", "$2b$real")).await.unwrap();
        let b = store
            .upsert_user(&user("a@b.com", RESET_REQUIRED_HASH))
            .await
            .unwrap();
        assert_eq!(a, b);
        let snap = store.snapshot();
        assert_eq!(snap.users.len(), 1);
        assert_eq!(snap.users[0].password_hash, "$2b$real");
    }

    #[tokio::test]
    async fn ensure_book_never_overwrites() {
        let store = MemoryStore::new();
        let first = NewBook {
            name: "X".into(),
            slug: "X".into(),
            total_pages: 3,
            completed_pages: 1,
            category: "a".into(),
        };
        let id = store.ensure_book(&first).await.unwrap();
        let second = NewBook {
            category: "b".into(),
            total_pages: 99,
            ..first.clone()
        };
        assert_eq!(store.ensure_book(&second).await.unwrap(), id);
        assert_eq!(store.snapshot().books[0].category, "a");
        assert_eq!(store.snapshot().books[0].total_pages, 3);
    }

    #[tokio::test]
    async fn run_lock_is_exclusive() {
        let store = MemoryStore::new();
        store.acquire_run_lock().await.unwrap();
        assert!(store.acquire_run_lock().await.is_err());
        store.release_run_lock().await.unwrap();
        store.acquire_run_lock().await.unwrap();
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(store.find_book_by_name("X").await.is_err());
        store.set_unavailable(false);
        assert_eq!(store.find_book_by_name("X").await.unwrap(), None);
    }
}
