use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::database_ops::store::TargetStore;

/// Recount every book's pages and overwrite drifted aggregates.
/// Returns the number of books corrected.
pub async fn repair_aggregates(store: &dyn TargetStore) -> Result<u64> {
    let aggregates = store
        .book_aggregates()
        .await
        .context("load book aggregates")?;
    let mut corrected = 0u64;
    for agg in aggregates.iter().filter(|a| a.drifted()) {
        store
            .set_book_aggregates(agg.book_id, agg.actual_total, agg.actual_completed)
            .await
            .with_context(|| format!("correct aggregates for book {}", agg.name))?;
        warn!(
            book_id = agg.book_id,
            book = %agg.name,
            stored_total = agg.stored_total,
            actual_total = agg.actual_total,
            stored_completed = agg.stored_completed,
            actual_completed = agg.actual_completed,
            "book aggregates corrected"
        );
        corrected += 1;
    }
    info!(books = aggregates.len(), corrected, "aggregate repair complete");
    Ok(corrected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory::MemoryStore;
    use crate::model::{NewBook, NewPage, PageStatus};

    fn page(book_id: i64, n: i64, status: PageStatus) -> NewPage {
        NewPage {
            book_id,
            page_number: n,
            content: String::new(),
            status,
            claimed_by: None,
            claimed_at: None,
            completed_at: None,
            image_path: None,
        }
    }

    async fn seeded() -> (MemoryStore, i64) {
        let store = MemoryStore::new();
        let id = store
            .ensure_book(&NewBook {
                name: "X".into(),
                slug: "X".into(),
                total_pages: 2,
                completed_pages: 1,
                category: "c".into(),
            })
            .await
            .unwrap();
        store
            .insert_pages(&[
                page(id, 1, PageStatus::Completed),
                page(id, 2, PageStatus::Available),
            ])
            .await
            .unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn consistent_books_are_left_alone() {
        let (store, _) = seeded().await;
        assert_eq!(repair_aggregates(&store).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn drifted_book_is_recounted() {
        let (store, id) = seeded().await;
        store.force_book_aggregates(id, 40, 0);
        assert_eq!(repair_aggregates(&store).await.unwrap(), 1);
        let book = &store.snapshot().books[0];
        assert_eq!((book.total_pages, book.completed_pages), (2, 1));
        assert_eq!(repair_aggregates(&store).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unavailable_store_is_fatal() {
        let (store, _) = seeded().await;
        store.set_unavailable(true);
        assert!(repair_aggregates(&store).await.is_err());
    }
}
