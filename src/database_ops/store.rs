use anyhow::Result;
use serde::Serialize;

use crate::model::{BookId, NewBook, NewMessage, NewPage, NewUpload, NewUser, UserId};

/// Marker the materializer writes when a legacy user has no password.
/// Never a valid hash, so login fails and the reset flow takes over.
pub const RESET_REQUIRED_HASH: &str = "!legacy-reset-required";

/// Stored vs. counted aggregates for one book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookAggregate {
    pub book_id: BookId,
    pub name: String,
    pub stored_total: i64,
    pub stored_completed: i64,
    pub actual_total: i64,
    pub actual_completed: i64,
}

impl BookAggregate {
    pub fn drifted(&self) -> bool {
        self.stored_total != self.actual_total || self.stored_completed != self.actual_completed
    }
}

/// Contract of the normalized target store.
///
/// Every write is keyed by an identity key so a rerun over the same legacy
/// data converges on the same content:
/// users upsert by email; books, pages, uploads and messages are created
/// once and never overwritten (only book aggregates change afterwards).
#[async_trait::async_trait]
pub trait TargetStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Take the run-level exclusive lock. Fails if another run holds it.
    async fn acquire_run_lock(&self) -> Result<()>;
    async fn release_run_lock(&self) -> Result<()>;

    /// Insert or update by email; returns the target id. A placeholder
    /// password never replaces a stored real hash.
    async fn upsert_user(&self, user: &NewUser) -> Result<UserId>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserId>>;

    /// Find-or-create by name; an existing book is returned untouched.
    async fn ensure_book(&self, book: &NewBook) -> Result<BookId>;
    async fn find_book_by_name(&self, name: &str) -> Result<Option<BookId>>;

    /// Bulk insert; rows whose (book, page number) already exist are skipped.
    /// Returns the number of rows actually inserted.
    async fn insert_pages(&self, pages: &[NewPage]) -> Result<u64>;
    /// Bulk insert keyed by (book name, original file name).
    async fn insert_uploads(&self, uploads: &[NewUpload]) -> Result<u64>;
    /// Bulk insert keyed by message identity.
    async fn insert_messages(&self, messages: &[NewMessage]) -> Result<u64>;

    /// Stored and counted page aggregates for every book, ordered by book id.
    async fn book_aggregates(&self) -> Result<Vec<BookAggregate>>;
    async fn set_book_aggregates(&self, book_id: BookId, total: i64, completed: i64) -> Result<()>;
}
