//! Postgres-backed [`TargetStore`].

use anyhow::{bail, Context, Result};
use sqlx::pool::PoolConnection;
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::store::{BookAggregate, TargetStore, RESET_REQUIRED_HASH};
use crate::model::{BookId, NewBook, NewMessage, NewPage, NewUpload, NewUser, Recipient, UserId};
use crate::util::db::Db;

/// Advisory lock key shared by every migration run against the same database.
const RUN_LOCK_KEY: i64 = 0x426f_6f6b_5265_636e;

/// Postgres caps a single statement at this many bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;
const PAGE_BINDS: usize = 8;
const UPLOAD_BINDS: usize = 6;
const MESSAGE_BINDS: usize = 9;

/// Rows one multi-row `INSERT` may carry when each row binds `binds_per_row` values.
fn rows_per_statement(binds_per_row: usize) -> usize {
    (MAX_BIND_PARAMS / binds_per_row.max(1)).max(1)
}

pub struct PgStore {
    db: Db,
    // Session advisory locks belong to one connection; keep it checked out while held.
    lock_conn: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            lock_conn: Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl TargetStore for PgStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn acquire_run_lock(&self) -> Result<()> {
        let mut slot = self.lock_conn.lock().await;
        if slot.is_some() {
            bail!("run lock already held by this process");
        }
        let mut conn = self
            .db
            .pool
            .acquire()
            .await
            .context("acquire connection for run lock")?;
        let got: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .persistent(false)
            .bind(RUN_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await?;
        if !got {
            bail!("another migration run holds the advisory lock");
        }
        info!(lock_key = RUN_LOCK_KEY, "run lock acquired");
        *slot = Some(conn);
        Ok(())
    }

    async fn release_run_lock(&self) -> Result<()> {
        if let Some(mut conn) = self.lock_conn.lock().await.take() {
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .persistent(false)
                .bind(RUN_LOCK_KEY)
                .execute(&mut *conn)
                .await?;
            info!(lock_key = RUN_LOCK_KEY, "run lock released");
        }
        Ok(())
    }

    async fn upsert_user(&self, user: &NewUser) -> Result<UserId> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO users (legacy_id, name, email, password_hash, role, points) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (email) DO UPDATE SET \
               legacy_id = COALESCE(EXCLUDED.legacy_id, users.legacy_id), \
               name = EXCLUDED.name, \
               password_hash = CASE WHEN EXCLUDED.password_hash = $7 \
                                    THEN users.password_hash ELSE EXCLUDED.password_hash END, \
               role = EXCLUDED.role, \
               points = EXCLUDED.points, \
               updated_at = now() \
             RETURNING id",
        )
        .persistent(false)
        .bind(user.legacy_id.as_deref())
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .bind(user.points)
        .bind(RESET_REQUIRED_HASH)
        .fetch_one(&self.db.pool)
        .await
        .with_context(|| format!("upsert user {}", user.email))?;
        Ok(id)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserId>> {
        let id: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE email = $1")
            .persistent(false)
            .bind(email)
            .fetch_optional(&self.db.pool)
            .await?;
        Ok(id)
    }

    async fn ensure_book(&self, book: &NewBook) -> Result<BookId> {
        let inserted: Option<i64> = sqlx::query_scalar(
            "INSERT INTO books (name, slug, total_pages, completed_pages, category) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (name) DO NOTHING \
             RETURNING id",
        )
        .persistent(false)
        .bind(&book.name)
        .bind(&book.slug)
        .bind(book.total_pages)
        .bind(book.completed_pages)
        .bind(&book.category)
        .fetch_optional(&self.db.pool)
        .await
        .with_context(|| format!("insert book {}", book.name))?;
        if let Some(id) = inserted {
            debug!(book_id = id, name = %book.name, "book created");
            return Ok(id);
        }
        self.find_book_by_name(&book.name)
            .await?
            .with_context(|| format!("book {} vanished after conflict", book.name))
    }

    async fn find_book_by_name(&self, name: &str) -> Result<Option<BookId>> {
        let id: Option<i64> = sqlx::query_scalar("SELECT id FROM books WHERE name = $1")
            .persistent(false)
            .bind(name)
            .fetch_optional(&self.db.pool)
            .await?;
        Ok(id)
    }

    async fn insert_pages(&self, pages: &[NewPage]) -> Result<u64> {
        let mut inserted = 0u64;
        for chunk in pages.chunks(rows_per_statement(PAGE_BINDS)) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO pages (book_id, page_number, content, status, claimed_by, claimed_at, completed_at, image_path) ",
            );
            qb.push_values(chunk, |mut b, p| {
                b.push_bind(p.book_id)
                    .push_bind(p.page_number)
                    .push_bind(p.content.clone())
                    .push_bind(p.status.as_str())
                    .push_bind(p.claimed_by)
                    .push_bind(p.claimed_at)
                    .push_bind(p.completed_at)
                    .push_bind(p.image_path.clone());
            });
            qb.push(" ON CONFLICT (book_id, page_number) DO NOTHING");
            let res = qb
                .build()
                .persistent(false)
                .execute(&self.db.pool)
                .await
                .context("bulk insert pages")?;
            inserted += res.rows_affected();
        }
        Ok(inserted)
    }

    async fn insert_uploads(&self, uploads: &[NewUpload]) -> Result<u64> {
        let mut inserted = 0u64;
        for chunk in uploads.chunks(rows_per_statement(UPLOAD_BINDS)) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO uploads (uploader, book_name, original_file_name, content, status, uploaded_at) ",
            );
            qb.push_values(chunk, |mut b, u| {
                b.push_bind(u.uploader)
                    .push_bind(u.book_name.clone())
                    .push_bind(u.original_file_name.clone())
                    .push_bind(u.content.clone())
                    .push_bind(u.status.as_str())
                    .push_bind(u.uploaded_at);
            });
            qb.push(" ON CONFLICT (book_name, original_file_name) DO NOTHING");
            let res = qb
                .build()
                .persistent(false)
                .execute(&self.db.pool)
                .await
                .context("bulk insert uploads")?;
            inserted += res.rows_affected();
        }
        Ok(inserted)
    }

    async fn insert_messages(&self, messages: &[NewMessage]) -> Result<u64> {
        let mut inserted = 0u64;
        for chunk in messages.chunks(rows_per_statement(MESSAGE_BINDS)) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO messages (identity, sender, recipient_kind, recipient_id, recipient_legacy, subject, content, created_at, replies) ",
            );
            qb.push_values(chunk, |mut b, m| {
                let (kind, recipient_id, recipient_legacy) = match &m.recipient {
                    Recipient::Broadcast => ("broadcast", None, None),
                    Recipient::User(id) => ("user", Some(*id), None),
                    Recipient::Unresolved(legacy) => ("unresolved", None, Some(legacy.clone())),
                };
                b.push_bind(m.identity.clone())
                    .push_bind(m.sender)
                    .push_bind(kind)
                    .push_bind(recipient_id)
                    .push_bind(recipient_legacy)
                    .push_bind(m.subject.clone())
                    .push_bind(m.content.clone())
                    .push_bind(m.created_at)
                    .push_bind(Json(m.replies.clone()));
            });
            qb.push(" ON CONFLICT (identity) DO NOTHING");
            let res = qb
                .build()
                .persistent(false)
                .execute(&self.db.pool)
                .await
                .context("bulk insert messages")?;
            inserted += res.rows_affected();
        }
        Ok(inserted)
    }

    async fn book_aggregates(&self) -> Result<Vec<BookAggregate>> {
        let rows = sqlx::query(
            "SELECT b.id, b.name, b.total_pages, b.completed_pages, \
                    COUNT(p.book_id) AS actual_total, \
                    COUNT(p.book_id) FILTER (WHERE p.status = 'completed') AS actual_completed \
             FROM books b LEFT JOIN pages p ON p.book_id = b.id \
             GROUP BY b.id, b.name, b.total_pages, b.completed_pages \
             ORDER BY b.id",
        )
        .persistent(false)
        .fetch_all(&self.db.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            out.push(BookAggregate {
                book_id: r.try_get("id")?,
                name: r.try_get("name")?,
                stored_total: r.try_get("total_pages")?,
                stored_completed: r.try_get("completed_pages")?,
                actual_total: r.try_get("actual_total")?,
                actual_completed: r.try_get("actual_completed")?,
            });
        }
        Ok(out)
    }

    async fn set_book_aggregates(&self, book_id: BookId, total: i64, completed: i64) -> Result<()> {
        sqlx::query("UPDATE books SET total_pages = $2, completed_pages = $3 WHERE id = $1")
            .persistent(false)
            .bind(book_id)
            .bind(total)
            .bind(completed)
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }
}
