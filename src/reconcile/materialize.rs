//! Writing reconciled entities into the target store.
//!
//! Every entity goes through its identity key: users by email, books by
//! name, pages by (book, number), uploads by (book name, file name) and
//! messages by legacy id or content fingerprint. A record is dropped only
//! when that key cannot be determined; every other gap gets a logged,
//! deterministic default.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::config::MigrationConfig;
use super::content::{text_field, ContentAssociator};
use super::pipeline::CancelFlag;
use super::resolver::{normalize_email, IdentifierResolver};
use super::selector::{collapse_pages, select_best, BookSnapshot, PageSnapshot, STATUS_FIELDS};
use super::summary::RunSummary;
use crate::database_ops::store::{TargetStore, RESET_REQUIRED_HASH};
use crate::legacy::reader::snippet;
use crate::legacy::record::{i64_field, str_field, value_field};
use crate::model::{
    BookId, NewBook, NewMessage, NewPage, NewUpload, NewUser, PageStatus, Recipient, Reply, Role,
    UploadStatus,
};
use crate::normalization::timestamp::parse_timestamp;

pub const DEFAULT_CATEGORY: &str = "uncategorized";

pub const EMAIL_FIELDS: &[&str] = &["email", "mail", "userEmail"];
const NAME_FIELDS: &[&str] = &["name", "displayName", "fullName", "username"];
const PASSWORD_FIELDS: &[&str] = &["password", "passwordHash", "password_hash", "hash"];
const ROLE_FIELDS: &[&str] = &["role", "type"];
const POINTS_FIELDS: &[&str] = &["points", "score"];

pub const BOOK_NAME_FIELDS: &[&str] = &["name", "title", "bookName"];
const CATEGORY_FIELDS: &[&str] = &["category", "genre"];

pub const PAGE_BOOK_FIELDS: &[&str] = &["book", "bookName"];
pub const CLAIMED_BY_FIELDS: &[&str] = &["claimedById", "claimedBy", "claimed_by", "ownerId"];
pub const CLAIMED_BY_EMAIL_FIELDS: &[&str] = &["claimedByEmail", "claimed_by_email"];
const CLAIMED_AT_FIELDS: &[&str] = &["claimedAt", "claimed_at"];
const COMPLETED_AT_FIELDS: &[&str] = &["completedAt", "completed_at"];
const IMAGE_FIELDS: &[&str] = &["imagePath", "image", "imageUrl", "img"];
const CONTENT_KEY_FIELDS: &[&str] = &["contentKey", "contentFile", "fileName"];

pub const UPLOAD_FILE_FIELDS: &[&str] = &["originalFileName", "fileName", "filename", "name"];
pub const UPLOAD_BOOK_FIELDS: &[&str] = &["bookName", "book"];
pub const UPLOADER_FIELDS: &[&str] = &["uploaderId", "uploadedBy", "userId", "uploader"];
pub const UPLOADER_EMAIL_FIELDS: &[&str] = &["uploaderEmail"];
const UPLOADED_AT_FIELDS: &[&str] = &["uploadedAt", "createdAt", "timestamp"];

pub const SENDER_FIELDS: &[&str] = &["senderId", "sender", "from", "userId"];
pub const SENDER_EMAIL_FIELDS: &[&str] = &["senderEmail"];
const RECIPIENT_FIELDS: &[&str] = &["recipientId", "recipient", "to"];
const SUBJECT_FIELDS: &[&str] = &["subject", "title"];
const CREATED_AT_FIELDS: &[&str] = &["createdAt", "sentAt", "timestamp", "date"];
const BROADCAST_MARKERS: &[&str] = &["all", "broadcast", "everyone", "*"];

/// A legacy item held between the read pass and materialization.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedItem {
    pub source: usize,
    pub path: String,
    pub legacy_id: Option<String>,
    pub value: Value,
}

impl StagedItem {
    fn log_dropped(&self, reason: &str) {
        let raw = serde_json::to_vec(&self.value).unwrap_or_default();
        warn!(
            source = self.source,
            path = %self.path,
            reason,
            snippet = %snippet(&raw),
            "legacy record dropped"
        );
    }
}

fn timestamp_field(obj: &Value, names: &[&str]) -> Option<DateTime<Utc>> {
    names
        .iter()
        .filter_map(|n| obj.get(*n))
        .find_map(parse_timestamp)
}

/// Stable identity for a message the export gave no id.
pub fn message_fingerprint(
    sender: Option<&str>,
    recipient: Option<&str>,
    subject: &str,
    content: &str,
    created_at: Option<&Value>,
) -> String {
    let mut hasher = Sha256::new();
    for part in [
        sender.unwrap_or(""),
        recipient.unwrap_or(""),
        subject,
        content,
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    if let Some(ts) = created_at {
        hasher.update(ts.to_string().as_bytes());
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("sha256:{hex}")
}

pub struct Materializer<'a> {
    store: &'a dyn TargetStore,
    cfg: &'a MigrationConfig,
    cancel: &'a CancelFlag,
    pub resolver: IdentifierResolver,
    pub content: ContentAssociator,
    pub summary: RunSummary,
}

impl<'a> Materializer<'a> {
    pub fn new(
        store: &'a dyn TargetStore,
        cfg: &'a MigrationConfig,
        cancel: &'a CancelFlag,
        resolver: IdentifierResolver,
        content: ContentAssociator,
        summary: RunSummary,
    ) -> Self {
        Self {
            store,
            cfg,
            cancel,
            resolver,
            content,
            summary,
        }
    }

    fn correct(&mut self, what: &str, path: &str) {
        self.summary.field_corrections += 1;
        debug!(field = what, path, "default applied to legacy field");
    }

    // ---------- Users ----------

    pub fn user_row(&mut self, item: &StagedItem) -> Option<NewUser> {
        let Some(email) = str_field(&item.value, EMAIL_FIELDS).and_then(|e| normalize_email(&e))
        else {
            self.summary.records_dropped += 1;
            item.log_dropped("user has no usable email");
            return None;
        };
        let name = match str_field(&item.value, NAME_FIELDS) {
            Some(n) => n,
            None => {
                self.correct("user.name", &item.path);
                email.split('@').next().unwrap_or_default().to_string()
            }
        };
        let role = match str_field(&item.value, ROLE_FIELDS).and_then(|r| Role::parse(&r)) {
            Some(r) => r,
            None => {
                self.correct("user.role", &item.path);
                Role::User
            }
        };
        let password_hash = match str_field(&item.value, PASSWORD_FIELDS) {
            Some(h) => h,
            None => {
                self.correct("user.password", &item.path);
                RESET_REQUIRED_HASH.to_string()
            }
        };
        let points = match value_field(&item.value, POINTS_FIELDS) {
            None => 0,
            Some(_) => match i64_field(&item.value, POINTS_FIELDS) {
                Some(p) => p,
                None => {
                    self.correct("user.points", &item.path);
                    0
                }
            },
        };
        Some(NewUser {
            legacy_id: item.legacy_id.clone(),
            name,
            email,
            password_hash,
            role,
            points,
        })
    }

    pub async fn users(&mut self, items: &[StagedItem]) -> Result<()> {
        for chunk in items.chunks(self.cfg.batch_size) {
            self.cancel.check()?;
            for item in chunk {
                let Some(user) = self.user_row(item) else {
                    continue;
                };
                let id = self
                    .store
                    .upsert_user(&user)
                    .await
                    .with_context(|| format!("upsert user {}", user.email))?;
                self.resolver
                    .register_user(user.legacy_id.as_deref(), &user.email, id);
            }
        }
        self.summary.users_materialized = self.resolver.user_count() as u64;
        info!(users = self.summary.users_materialized, "users materialized");
        Ok(())
    }

    // ---------- Books and pages ----------

    /// Collapse repeated page numbers inside one snapshot, ordered by number.
    fn dedupe_pages<'p>(&mut self, book: &str, pages: &'p [PageSnapshot]) -> Vec<(i64, &'p PageSnapshot)> {
        let collapsed = collapse_pages(pages);
        for _ in 0..collapsed.unnumbered {
            self.correct("page.number", book);
        }
        self.summary.duplicate_pages_collapsed += collapsed.collapsed;
        collapsed.pages
    }

    fn page_row(
        &mut self,
        book_id: BookId,
        book: &str,
        slug: &str,
        number: i64,
        page: &PageSnapshot,
    ) -> NewPage {
        let raw = &page.raw;
        let status = match page.status() {
            Some(s) => s,
            None => {
                self.correct("page.status", book);
                PageStatus::Available
            }
        };

        let owner_ref = str_field(raw, CLAIMED_BY_FIELDS)
            .or_else(|| str_field(raw, CLAIMED_BY_EMAIL_FIELDS));
        let claimed_by = self.resolver.resolve_owner(owner_ref.as_deref());

        let claimed_at = timestamp_field(raw, CLAIMED_AT_FIELDS);
        let mut completed_at = timestamp_field(raw, COMPLETED_AT_FIELDS);
        if status == PageStatus::Completed && completed_at.is_none() {
            self.correct("page.completed_at", book);
            completed_at = Some(page.latest_activity().unwrap_or(DateTime::<Utc>::UNIX_EPOCH));
        }

        let content = match text_field(raw) {
            Some(text) => text,
            None => {
                let explicit = str_field(raw, CONTENT_KEY_FIELDS);
                self.content.recover(book, slug, number, explicit.as_deref())
            }
        };

        NewPage {
            book_id,
            page_number: number,
            content,
            status,
            claimed_by,
            claimed_at,
            completed_at,
            image_path: str_field(raw, IMAGE_FIELDS),
        }
    }

    /// Select the best snapshot of one logical book, create the book if it
    /// does not exist yet, register it, then write its pages.
    pub async fn book(&mut self, name: &str, snapshots: Vec<BookSnapshot>) -> Result<()> {
        let Some(best) = select_best(&snapshots) else {
            return Ok(());
        };
        let discarded = snapshots.len() as u64 - 1;
        self.summary.snapshots_discarded += discarded;
        if discarded > 0 {
            debug!(book = name, source = snapshots[best].source, discarded, "snapshot selected");
        }

        // Book-level fields come from the winner, else the first snapshot that listed the book.
        let book_item = snapshots[best]
            .book
            .clone()
            .or_else(|| snapshots.iter().find_map(|s| s.book.clone()));
        let category = match book_item.as_ref().and_then(|b| str_field(b, CATEGORY_FIELDS)) {
            Some(c) => c,
            None => {
                self.correct("book.category", name);
                DEFAULT_CATEGORY.to_string()
            }
        };

        let pages = self.dedupe_pages(name, &snapshots[best].pages);
        let completed = pages
            .iter()
            .filter(|(_, p)| p.status() == Some(PageStatus::Completed))
            .count() as i64;

        let slug = self.resolver.slug(name);
        let ensured = self
            .store
            .ensure_book(&NewBook {
                name: name.to_string(),
                slug: slug.clone(),
                total_pages: pages.len() as i64,
                completed_pages: completed,
                category,
            })
            .await
            .with_context(|| format!("ensure book {name}"))?;
        self.resolver.register_book(name, ensured);
        self.summary.books_materialized += 1;

        // Pages attach through the book map, never to a book that was not registered.
        let book_id = self
            .resolver
            .book_id(name)
            .with_context(|| format!("book {name} not registered before its pages"))?;

        for chunk in pages.chunks(self.cfg.batch_size) {
            self.cancel.check()?;
            let rows: Vec<NewPage> = chunk
                .iter()
                .map(|(n, p)| self.page_row(book_id, name, &slug, *n, p))
                .collect();
            let inserted = self
                .store
                .insert_pages(&rows)
                .await
                .with_context(|| format!("insert pages for book {name}"))?;
            self.summary.pages_materialized += rows.len() as u64;
            debug!(book = name, batch = rows.len(), inserted, "page batch written");
        }
        Ok(())
    }

    // ---------- Uploads ----------

    pub fn upload_row(&mut self, item: &StagedItem) -> Option<NewUpload> {
        let Some(original_file_name) = str_field(&item.value, UPLOAD_FILE_FIELDS) else {
            self.summary.records_dropped += 1;
            item.log_dropped("upload has no file name");
            return None;
        };
        let book_name = match str_field(&item.value, UPLOAD_BOOK_FIELDS) {
            Some(b) => b,
            None => {
                self.correct("upload.book_name", &item.path);
                String::new()
            }
        };
        let owner_ref = str_field(&item.value, UPLOADER_FIELDS)
            .or_else(|| str_field(&item.value, UPLOADER_EMAIL_FIELDS));
        let uploader = self.resolver.resolve_owner(owner_ref.as_deref());
        let status = match str_field(&item.value, STATUS_FIELDS) {
            None => UploadStatus::Pending,
            Some(raw) => UploadStatus::parse(&raw).unwrap_or_else(|| {
                self.correct("upload.status", &item.path);
                UploadStatus::Pending
            }),
        };
        let content = text_field(&item.value)
            .or_else(|| self.content.recover_upload(&book_name, &original_file_name))
            .unwrap_or_default();
        Some(NewUpload {
            uploader,
            book_name,
            original_file_name,
            content,
            status,
            uploaded_at: timestamp_field(&item.value, UPLOADED_AT_FIELDS),
        })
    }

    pub async fn uploads(&mut self, items: &[StagedItem]) -> Result<()> {
        let mut seen: HashSet<(String, String)> = HashSet::new();
        for chunk in items.chunks(self.cfg.batch_size) {
            self.cancel.check()?;
            let mut rows = Vec::with_capacity(chunk.len());
            for item in chunk {
                if let Some(row) = self.upload_row(item) {
                    if seen.insert((row.book_name.clone(), row.original_file_name.clone())) {
                        rows.push(row);
                    }
                }
            }
            if rows.is_empty() {
                continue;
            }
            self.store
                .insert_uploads(&rows)
                .await
                .context("insert uploads")?;
            self.summary.uploads_materialized += rows.len() as u64;
        }
        info!(uploads = self.summary.uploads_materialized, "uploads materialized");
        Ok(())
    }

    // ---------- Messages ----------

    fn recipient(&mut self, raw: Option<String>) -> Recipient {
        let Some(r) = raw else {
            return Recipient::Broadcast;
        };
        if BROADCAST_MARKERS.iter().any(|m| m.eq_ignore_ascii_case(&r)) {
            return Recipient::Broadcast;
        }
        match self.resolver.resolve_owner(Some(&r)) {
            Some(id) => Recipient::User(id),
            None => Recipient::Unresolved(r),
        }
    }

    fn reply(&mut self, raw: &Value, path: &str) -> Option<Reply> {
        let Some(content) = text_field(raw) else {
            self.correct("message.reply", path);
            return None;
        };
        let sender_ref = str_field(raw, SENDER_FIELDS).or_else(|| str_field(raw, SENDER_EMAIL_FIELDS));
        Some(Reply {
            sender: self.resolver.resolve_owner(sender_ref.as_deref()),
            content,
            created_at: timestamp_field(raw, CREATED_AT_FIELDS),
        })
    }

    pub fn message_row(&mut self, item: &StagedItem) -> Option<NewMessage> {
        let v = &item.value;
        let sender_ref = str_field(v, SENDER_FIELDS).or_else(|| str_field(v, SENDER_EMAIL_FIELDS));
        let recipient_ref = str_field(v, RECIPIENT_FIELDS);
        let subject = str_field(v, SUBJECT_FIELDS).unwrap_or_default();
        let content = text_field(v).unwrap_or_default();

        let identity = match &item.legacy_id {
            Some(id) => id.clone(),
            None if subject.is_empty() && content.is_empty() => {
                self.summary.records_dropped += 1;
                item.log_dropped("message has no id and no content");
                return None;
            }
            None => message_fingerprint(
                sender_ref.as_deref(),
                recipient_ref.as_deref(),
                &subject,
                &content,
                value_field(v, CREATED_AT_FIELDS),
            ),
        };

        let sender = self.resolver.resolve_owner(sender_ref.as_deref());
        let recipient = self.recipient(recipient_ref);
        let replies: Vec<Reply> = v
            .get("replies")
            .and_then(Value::as_array)
            .map(|xs| xs.iter().filter_map(|r| self.reply(r, &item.path)).collect())
            .unwrap_or_default();

        Some(NewMessage {
            identity,
            sender,
            recipient,
            subject,
            content,
            created_at: timestamp_field(v, CREATED_AT_FIELDS),
            replies,
        })
    }

    pub async fn messages(&mut self, items: &[StagedItem]) -> Result<()> {
        let mut seen: HashSet<String> = HashSet::new();
        for chunk in items.chunks(self.cfg.batch_size) {
            self.cancel.check()?;
            let mut rows = Vec::with_capacity(chunk.len());
            for item in chunk {
                if let Some(row) = self.message_row(item) {
                    if seen.insert(row.identity.clone()) {
                        rows.push(row);
                    }
                }
            }
            if rows.is_empty() {
                continue;
            }
            self.store
                .insert_messages(&rows)
                .await
                .context("insert messages")?;
            self.summary.messages_materialized += rows.len() as u64;
        }
        info!(messages = self.summary.messages_materialized, "messages materialized");
        Ok(())
    }

    /// Move resolver and associator counters onto the summary.
    pub fn finish(mut self) -> RunSummary {
        self.summary.unresolved_owners = self.resolver.unresolved();
        self.summary.content_not_recovered = self.content.not_recovered();
        self.summary
    }
}
