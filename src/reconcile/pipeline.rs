//! One migration run, phase by phase.
//!
//! Read pass (every export, in input order) → users → books and their
//! pages → uploads → messages → aggregate repair. A phase only starts
//! after the phase feeding its maps has consumed all of its input.

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::config::MigrationConfig;
use super::content::{text_field, ContentAssociator};
use super::materialize::{
    Materializer, StagedItem, BOOK_NAME_FIELDS, CLAIMED_BY_EMAIL_FIELDS, CLAIMED_BY_FIELDS,
    EMAIL_FIELDS, PAGE_BOOK_FIELDS, SENDER_EMAIL_FIELDS, SENDER_FIELDS, UPLOADER_EMAIL_FIELDS, UPLOADER_FIELDS,
    UPLOAD_BOOK_FIELDS, UPLOAD_FILE_FIELDS,
};
use super::repair::repair_aggregates;
use super::resolver::IdentifierResolver;
use super::selector::{BookSnapshot, PageSnapshot};
use super::summary::RunSummary;
use crate::database_ops::store::TargetStore;
use crate::legacy::reader::snippet;
use crate::legacy::record::{legacy_id, str_field};
use crate::legacy::{open_export, verify_sources, ExportItem, ExportReader, LegacyRecord, PathPrefixes, RecordKind};

/// Cooperative cancellation, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            bail!("migration run cancelled");
        }
        Ok(())
    }
}

/// Everything the read pass collects before anything is written.
#[derive(Debug)]
struct ReadPass {
    users: Vec<StagedItem>,
    /// book name → export index → snapshot, in first-encountered order.
    books: IndexMap<String, IndexMap<usize, BookSnapshot>>,
    snapshots_seen: usize,
    uploads: Vec<StagedItem>,
    messages: Vec<StagedItem>,
    resolver: IdentifierResolver,
    content: ContentAssociator,
    summary: RunSummary,
}

fn stage(record: &LegacyRecord, legacy_id: Option<String>, value: &Value) -> StagedItem {
    StagedItem {
        source: record.source,
        path: record.path.clone(),
        legacy_id,
        value: value.clone(),
    }
}

impl ReadPass {
    fn new(cfg: &MigrationConfig) -> Self {
        Self {
            users: Vec::new(),
            books: IndexMap::new(),
            snapshots_seen: 0,
            uploads: Vec::new(),
            messages: Vec::new(),
            resolver: IdentifierResolver::new(),
            content: ContentAssociator::new(cfg.content_candidates.clone()),
            summary: RunSummary::default(),
        }
    }

    fn snapshot(&mut self, name: &str, source: usize) -> &mut BookSnapshot {
        let seen = &mut self.snapshots_seen;
        self.books
            .entry(name.to_string())
            .or_default()
            .entry(source)
            .or_insert_with(|| {
                let snap = BookSnapshot {
                    source,
                    seen: *seen,
                    book: None,
                    pages: Vec::new(),
                };
                *seen += 1;
                snap
            })
    }

    fn drop_item(&mut self, record: &LegacyRecord, value: &Value, reason: &str) {
        self.summary.records_dropped += 1;
        let raw = serde_json::to_vec(value).unwrap_or_default();
        warn!(
            source = record.source,
            path = %record.path,
            reason,
            snippet = %snippet(&raw),
            "legacy record dropped"
        );
    }

    fn learn_pair(&mut self, value: &Value, id_fields: &[&str], email_fields: &[&str]) {
        if let (Some(id), Some(email)) = (str_field(value, id_fields), str_field(value, email_fields)) {
            self.resolver.learn_email(&id, &email);
        }
    }

    fn ingest(&mut self, source: usize, doc: Value, prefixes: &PathPrefixes) {
        let record = match LegacyRecord::from_document(source, doc) {
            Ok(r) => r,
            Err(raw) => {
                self.summary.records_unclassified += 1;
                let bytes = serde_json::to_vec(&raw).unwrap_or_default();
                warn!(source, snippet = %snippet(&bytes), "document is not a path/data record");
                return;
            }
        };
        let kind = record.kind(prefixes);
        match &kind {
            RecordKind::Unknown => {
                self.summary.records_unclassified += 1;
                warn!(source, path = %record.path, "unrecognized record path");
            }
            RecordKind::Users => {
                for item in record.items(&kind) {
                    let id = legacy_id(&item);
                    if let (Some(id), Some(email)) = (&id, str_field(item.value, EMAIL_FIELDS)) {
                        self.resolver.learn_email(id, &email);
                    }
                    self.users.push(stage(&record, id, item.value));
                }
            }
            RecordKind::Books => {
                for item in record.items(&kind) {
                    let Some(name) = str_field(item.value, BOOK_NAME_FIELDS) else {
                        self.drop_item(&record, item.value, "book has no name");
                        continue;
                    };
                    let embedded: Vec<PageSnapshot> = item
                        .value
                        .get("pages")
                        .and_then(Value::as_array)
                        .map(|ps| {
                            ps.iter()
                                .filter(|p| p.is_object())
                                .map(|p| PageSnapshot { key: None, raw: p.clone() })
                                .collect()
                        })
                        .unwrap_or_default();
                    for p in &embedded {
                        self.learn_pair(&p.raw, CLAIMED_BY_FIELDS, CLAIMED_BY_EMAIL_FIELDS);
                    }
                    let mut book = item.value.clone();
                    if let Some(obj) = book.as_object_mut() {
                        obj.remove("pages");
                    }
                    let snap = self.snapshot(&name, source);
                    if snap.book.is_none() {
                        snap.book = Some(book);
                    }
                    snap.pages.extend(embedded);
                }
            }
            RecordKind::Pages { book } => {
                for item in record.items(&kind) {
                    if !item.value.is_object() {
                        self.drop_item(&record, item.value, "page item is not an object");
                        continue;
                    }
                    let name = book
                        .clone()
                        .or_else(|| str_field(item.value, PAGE_BOOK_FIELDS));
                    let Some(name) = name else {
                        self.drop_item(&record, item.value, "page has no book");
                        continue;
                    };
                    self.learn_pair(item.value, CLAIMED_BY_FIELDS, CLAIMED_BY_EMAIL_FIELDS);
                    let page = PageSnapshot {
                        key: item.key.map(str::to_string),
                        raw: item.value.clone(),
                    };
                    self.snapshot(&name, source).pages.push(page);
                }
            }
            RecordKind::Content { key } => {
                if !self.content.insert_record(key, &record.data) {
                    debug!(source, path = %record.path, "content record carried no text");
                }
            }
            RecordKind::Uploads => {
                for item in record.items(&kind) {
                    self.learn_pair(item.value, UPLOADER_FIELDS, UPLOADER_EMAIL_FIELDS);
                    if let (Some(file), Some(text)) =
                        (str_field(item.value, UPLOAD_FILE_FIELDS), text_field(item.value))
                    {
                        if let Some(book) = str_field(item.value, UPLOAD_BOOK_FIELDS) {
                            self.content.insert(&format!("{book}/{file}"), &text);
                        }
                        self.content.insert(&file, &text);
                    }
                    self.uploads.push(stage(&record, legacy_id(&item), item.value));
                }
            }
            RecordKind::Messages => {
                for item in record.items(&kind) {
                    self.learn_pair(item.value, SENDER_FIELDS, SENDER_EMAIL_FIELDS);
                    self.messages.push(stage(&record, legacy_id(&item), item.value));
                }
            }
        }
    }

    fn read_source<R: BufRead>(
        &mut self,
        source: usize,
        label: &str,
        mut reader: ExportReader<R>,
        cfg: &MigrationConfig,
        cancel: &CancelFlag,
    ) -> Result<()> {
        let mut documents = 0usize;
        for item in reader.by_ref() {
            match item.with_context(|| format!("read legacy export {label}"))? {
                ExportItem::Document(doc) => {
                    documents += 1;
                    self.summary.records_read += 1;
                    self.ingest(source, doc, &cfg.prefixes);
                    if documents % cfg.batch_size == 0 {
                        cancel.check()?;
                    }
                }
                ExportItem::Rejected(chunk) => {
                    self.summary.records_rejected += 1;
                    warn!(
                        source = label,
                        offset = chunk.offset,
                        error = %chunk.error,
                        snippet = %chunk.snippet,
                        "unparseable chunk skipped"
                    );
                }
            }
        }
        let stats = reader.stats();
        info!(
            source = label,
            documents = stats.documents,
            rejected = stats.rejected,
            bytes = stats.bytes,
            "legacy export read"
        );
        Ok(())
    }
}

async fn execute<R: BufRead>(
    store: &dyn TargetStore,
    exports: Vec<(String, ExportReader<R>)>,
    cfg: &MigrationConfig,
    cancel: &CancelFlag,
) -> Result<RunSummary> {
    let started = Instant::now();
    let mut pass = ReadPass::new(cfg);
    pass.summary.sources = exports.len() as u64;
    for (source, (label, reader)) in exports.into_iter().enumerate() {
        cancel.check()?;
        pass.read_source(source, &label, reader, cfg, cancel)?;
    }
    info!(
        users = pass.users.len(),
        books = pass.books.len(),
        uploads = pass.uploads.len(),
        messages = pass.messages.len(),
        content_blobs = pass.content.len(),
        "read pass complete"
    );

    let ReadPass {
        users,
        books,
        uploads,
        messages,
        resolver,
        content,
        summary,
        ..
    } = pass;
    let mut m = Materializer::new(store, cfg, cancel, resolver, content, summary);
    m.users(&users).await?;
    for (name, snapshots) in books {
        cancel.check()?;
        m.book(&name, snapshots.into_values().collect()).await?;
    }
    info!(
        books = m.summary.books_materialized,
        pages = m.summary.pages_materialized,
        snapshots_discarded = m.summary.snapshots_discarded,
        "books and pages materialized"
    );
    m.uploads(&uploads).await?;
    m.messages(&messages).await?;
    let mut summary = m.finish();

    cancel.check()?;
    summary.books_corrected = repair_aggregates(store).await?;
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "migration run complete");
    Ok(summary)
}

/// Run the whole engine over already-opened exports, in input order.
///
/// The run lock is held for the duration and released on every exit path.
pub async fn run_exports<R: BufRead>(
    store: &dyn TargetStore,
    exports: Vec<(String, ExportReader<R>)>,
    cfg: &MigrationConfig,
    cancel: &CancelFlag,
) -> Result<RunSummary> {
    cfg.validate()?;
    let run_id = Uuid::new_v4();
    let span = info_span!("migration_run", %run_id, store = store.name(), dry_run = cfg.dry_run);
    async move {
        store
            .acquire_run_lock()
            .await
            .context("acquire migration run lock")?;
        let result = execute(store, exports, cfg, cancel).await;
        if let Err(e) = store.release_run_lock().await {
            warn!(error = %e, "failed to release migration run lock");
        }
        let summary = result?;
        summary.log();
        Ok::<_, anyhow::Error>(summary)
    }
    .instrument(span)
    .await
}

/// Run the engine over export files. Every file must exist before anything is written.
pub async fn run_migration(
    store: &dyn TargetStore,
    sources: &[PathBuf],
    cfg: &MigrationConfig,
    cancel: &CancelFlag,
) -> Result<RunSummary> {
    verify_sources(sources)?;
    let mut exports = Vec::with_capacity(sources.len());
    for path in sources {
        exports.push((path.display().to_string(), open_export(path, cfg.probe_bytes)?));
    }
    run_exports(store, exports, cfg, cancel).await
}

/// Per-export counts from the reader and classifier alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub documents: u64,
    pub rejected: u64,
    pub bytes: u64,
    pub kinds: IndexMap<&'static str, u64>,
}

pub fn scan_export<R: BufRead>(mut reader: ExportReader<R>, prefixes: &PathPrefixes) -> Result<ScanReport> {
    let mut report = ScanReport::default();
    for item in reader.by_ref() {
        match item.context("read legacy export")? {
            ExportItem::Document(doc) => {
                let label = match LegacyRecord::from_document(0, doc) {
                    Ok(record) => record.kind(prefixes).label(),
                    Err(_) => RecordKind::Unknown.label(),
                };
                *report.kinds.entry(label).or_insert(0) += 1;
            }
            ExportItem::Rejected(_) => {}
        }
    }
    let stats = reader.stats();
    report.documents = stats.documents;
    report.rejected = stats.rejected;
    report.bytes = stats.bytes;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory::MemoryStore;
    use crate::model::{NewBook, PageStatus, Recipient};
    use std::io::{Cursor, Write};

    const FIXTURE: &str = r#"{"path":"users","data":[{"id":"u1","email":"a@b.com","name":"A"},{"id":"u2","name":"no email"}]}
{"path":"books","data":[{"name":"X","category":"torah"}]}
{"path":"pages/X","data":[{"number":1,"status":"completed","claimedById":"u1","completedAt":"2023-01-02T00:00:00Z"},{"number":2,"status":"in-progress","claimedById":"legacy-9","claimedByEmail":"A@B.com"},{"number":3,"status":"available"}]}
{"path":"content/X_page_3.txt","data":"third page {with braces}"}
{"path":"content/X/1","data":{"text":"first page"}}
{"path":"uploads","data":[{"bookName":"X","originalFileName":"scan.png","uploaderId":"u1","content":"ocr"}]}
{"path":"messages","data":[{"id":"m1","senderId":"u1","to":"all","subject":"hi","content":"hello"}]}
{"path":"settings","data":{}}
{not json
"#;

    type Export = (String, ExportReader<Cursor<Vec<u8>>>);

    fn export(label: &str, body: &str) -> Export {
        (
            label.to_string(),
            ExportReader::new(Cursor::new(body.as_bytes().to_vec())),
        )
    }

    async fn run(store: &MemoryStore, exports: Vec<Export>) -> Result<RunSummary> {
        run_exports(store, exports, &MigrationConfig::default(), &CancelFlag::new()).await
    }

    fn assert_aggregates_hold(store: &MemoryStore) {
        let snap = store.snapshot();
        for book in &snap.books {
            let pages: Vec<_> = snap.pages.iter().filter(|p| p.book_id == book.id).collect();
            let completed = pages.iter().filter(|p| p.status == PageStatus::Completed).count();
            assert_eq!(book.total_pages, pages.len() as i64, "book {}", book.name);
            assert_eq!(book.completed_pages, completed as i64, "book {}", book.name);
        }
    }

    #[tokio::test]
    async fn full_run_counts_every_outcome() {
        let store = MemoryStore::new();
        let s = run(&store, vec![export("a.json", FIXTURE)]).await.unwrap();
        assert_eq!(s.sources, 1);
        assert_eq!(s.records_read, 8);
        assert_eq!(s.records_rejected, 1);
        assert_eq!(s.records_unclassified, 1);
        assert_eq!(s.records_dropped, 1);
        assert_eq!(s.users_materialized, 1);
        assert_eq!(s.books_materialized, 1);
        assert_eq!(s.pages_materialized, 3);
        assert_eq!(s.uploads_materialized, 1);
        assert_eq!(s.messages_materialized, 1);
        assert_eq!(s.unresolved_owners, 0);
        assert_eq!(s.content_not_recovered, 1);
        assert_eq!(s.field_corrections, 2);
        assert_eq!(s.books_corrected, 0);

        let snap = store.snapshot();
        let uid = snap.users[0].id;
        assert_eq!(snap.pages[0].content, "first page");
        assert_eq!(snap.pages[0].claimed_by, Some(uid));
        assert_eq!(snap.pages[1].claimed_by, Some(uid));
        assert_eq!(snap.pages[1].content, "");
        assert_eq!(snap.pages[2].content, "third page {with braces}");
        assert_eq!(snap.uploads[0].uploader, Some(uid));
        assert_eq!(snap.messages[0].recipient, Recipient::Broadcast);
        assert_aggregates_hold(&store);
    }

    #[tokio::test]
    async fn page_owner_resolves_against_existing_book() {
        let store = MemoryStore::new();
        let book_id = store
            .ensure_book(&NewBook {
                name: "X".into(),
                slug: "X".into(),
                total_pages: 0,
                completed_pages: 0,
                category: "torah".into(),
            })
            .await
            .unwrap();
        let input = r#"{"path":"users","data":[{"id":"u1","email":"a@b.com"}]}
{"path":"pages","data":[{"book":"X","number":1,"claimedById":"u1","status":"in-progress"}]}
"#;
        let s = run(&store, vec![export("a", input)]).await.unwrap();
        let uid = store.find_user_by_email("a@b.com").await.unwrap().unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.books.len(), 1);
        assert_eq!(snap.pages[0].book_id, book_id);
        assert_eq!(snap.pages[0].claimed_by, Some(uid));
        // The pre-existing book had stale aggregates.
        assert_eq!(s.books_corrected, 1);
        assert_aggregates_hold(&store);
    }

    #[tokio::test]
    async fn rerun_converges_on_same_content() {
        let store = MemoryStore::new();
        run(&store, vec![export("a", FIXTURE)]).await.unwrap();
        let first = store.snapshot();
        let s = run(&store, vec![export("a", FIXTURE)]).await.unwrap();
        assert_eq!(store.snapshot(), first);
        assert_eq!(s.books_corrected, 0);
    }

    #[tokio::test]
    async fn identical_input_gives_identical_results() {
        let a = MemoryStore::new();
        let b = MemoryStore::new();
        let sa = run(&a, vec![export("1", FIXTURE), export("2", FIXTURE)]).await.unwrap();
        let sb = run(&b, vec![export("1", FIXTURE), export("2", FIXTURE)]).await.unwrap();
        assert_eq!(sa, sb);
        assert_eq!(a.snapshot(), b.snapshot());
        assert_eq!(sa.snapshots_discarded, 1);
    }

    #[tokio::test]
    async fn best_snapshot_wins_across_exports_in_any_order() {
        let weak = r#"{"path":"pages/X","data":[{"number":1,"status":"completed","text":"weak"},{"number":2,"status":"available","text":"weak"}]}"#;
        let strong = r#"{"path":"pages/X","data":[{"number":1,"status":"completed","text":"strong"},{"number":2,"status":"completed","text":"strong"}]}"#;
        for order in [[weak, strong], [strong, weak]] {
            let store = MemoryStore::new();
            let s = run(&store, vec![export("1", order[0]), export("2", order[1])]).await.unwrap();
            let snap = store.snapshot();
            assert!(snap.pages.iter().all(|p| p.content == "strong"));
            assert_eq!(snap.books[0].completed_pages, 2);
            assert_eq!(s.snapshots_discarded, 1);
        }
    }

    #[tokio::test]
    async fn pages_listed_in_book_and_page_path_count_once() {
        let doubled = r#"{"path":"books","data":[{"name":"X","pages":[{"number":1,"status":"completed","text":"A"},{"number":2,"status":"available","text":"A"}]}]}
{"path":"pages/X","data":[{"number":1,"status":"completed","text":"A"},{"number":2,"status":"available","text":"A"}]}
"#;
        let finished = r#"{"path":"pages/X","data":[{"number":1,"status":"completed","text":"B"},{"number":2,"status":"completed","text":"B"}]}"#;
        for order in [[doubled, finished], [finished, doubled]] {
            let store = MemoryStore::new();
            let s = run(&store, vec![export("1", order[0]), export("2", order[1])]).await.unwrap();
            let snap = store.snapshot();
            assert_eq!(snap.books[0].completed_pages, 2);
            assert_eq!(snap.books[0].total_pages, 2);
            assert!(snap.pages.iter().all(|p| p.content == "B"));
            assert_eq!(s.snapshots_discarded, 1);
            assert_aggregates_hold(&store);
        }
    }

    #[tokio::test]
    async fn concatenated_export_is_recovered() {
        let input = concat!(
            r#"{"path":"books","data":[{"name":"Y"}]}"#,
            r#"{"path":"pages/Y","data":[{"number":1,"text":"a } b { c","status":"done"}]}"#,
            r#"{"path":"users","data":[{"email":"q@r.s"}]}"#,
        );
        let store = MemoryStore::new();
        let s = run(&store, vec![export("c", input)]).await.unwrap();
        assert_eq!(s.records_read, 3);
        assert_eq!(s.records_rejected, 0);
        assert_eq!(store.snapshot().pages[0].content, "a } b { c");
    }

    #[tokio::test]
    async fn unavailable_store_is_fatal_and_rerun_succeeds() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(run(&store, vec![export("a", FIXTURE)]).await.is_err());
        store.set_unavailable(false);
        run(&store, vec![export("a", FIXTURE)]).await.unwrap();
        assert_aggregates_hold(&store);
    }

    #[tokio::test]
    async fn cancelled_run_releases_lock() {
        let store = MemoryStore::new();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = run_exports(&store, vec![export("a", FIXTURE)], &MigrationConfig::default(), &cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        run(&store, vec![export("a", FIXTURE)]).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_run_is_refused() {
        let store = MemoryStore::new();
        store.acquire_run_lock().await.unwrap();
        assert!(run(&store, vec![export("a", FIXTURE)]).await.is_err());
        assert!(store.snapshot().users.is_empty());
        store.release_run_lock().await.unwrap();
    }

    #[tokio::test]
    async fn missing_file_is_fatal_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("a.json");
        let mut f = std::fs::File::create(&present).unwrap();
        f.write_all(FIXTURE.as_bytes()).unwrap();
        drop(f);

        let store = MemoryStore::new();
        let cfg = MigrationConfig::default();
        let cancel = CancelFlag::new();
        let missing = dir.path().join("b.json");
        assert!(run_migration(&store, &[present.clone(), missing], &cfg, &cancel).await.is_err());
        assert!(store.snapshot().users.is_empty());

        let s = run_migration(&store, &[present], &cfg, &cancel).await.unwrap();
        assert_eq!(s.users_materialized, 1);
    }

    #[test]
    fn scan_counts_kinds() {
        let report = scan_export(
            ExportReader::new(Cursor::new(FIXTURE.as_bytes().to_vec())),
            &PathPrefixes::default(),
        )
        .unwrap();
        assert_eq!(report.documents, 8);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.kinds.get("content"), Some(&2));
        assert_eq!(report.kinds.get("unknown"), Some(&1));
    }
}
