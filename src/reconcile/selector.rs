//! Choosing one snapshot per logical book.
//!
//! The same book can show up in several exports. Snapshots are ranked by a
//! strict chain of criteria; the first encountered snapshot wins any
//! remaining tie, so the choice never depends on hash or iteration order.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::btree_map::{BTreeMap, Entry};

use crate::legacy::record::{i64_field, value_field};
use crate::model::PageStatus;
use crate::normalization::timestamp::parse_timestamp;

pub const STATUS_FIELDS: &[&str] = &["status", "state"];
pub const ACTIVITY_FIELDS: &[&str] = &[
    "updatedAt",
    "updated_at",
    "completedAt",
    "completed_at",
    "claimedAt",
    "claimed_at",
];
const PAGE_NUMBER_FIELDS: &[&str] = &["number", "pageNumber", "page_number", "page"];

/// One legacy page item as captured in one export.
#[derive(Debug, Clone, PartialEq)]
pub struct PageSnapshot {
    /// Key the item was stored under inside its page list, if any.
    pub key: Option<String>,
    pub raw: Value,
}

impl PageSnapshot {
    pub fn status(&self) -> Option<PageStatus> {
        value_field(&self.raw, STATUS_FIELDS)
            .and_then(Value::as_str)
            .and_then(PageStatus::parse)
    }

    /// Latest of the page's update/complete/claim timestamps.
    pub fn latest_activity(&self) -> Option<DateTime<Utc>> {
        ACTIVITY_FIELDS
            .iter()
            .filter_map(|f| self.raw.get(*f))
            .filter_map(parse_timestamp)
            .max()
    }
}

/// Page number from the item, falling back to the key it was stored under.
pub fn page_number(page: &PageSnapshot) -> Option<i64> {
    i64_field(&page.raw, PAGE_NUMBER_FIELDS)
        .or_else(|| page.key.as_deref().and_then(|k| k.trim().parse().ok()))
}

/// A snapshot's pages with each number kept once, in number order.
#[derive(Debug)]
pub struct CollapsedPages<'a> {
    pub pages: Vec<(i64, &'a PageSnapshot)>,
    /// Pages that carried no number and were filed as page 1.
    pub unnumbered: u64,
    /// Copies dropped because another copy of the same number ranked higher.
    pub collapsed: u64,
}

/// Keep the best copy of every page number (see [`compare_pages`]); on a
/// tie the copy listed first stays.
pub fn collapse_pages(pages: &[PageSnapshot]) -> CollapsedPages<'_> {
    let mut by_number: BTreeMap<i64, &PageSnapshot> = BTreeMap::new();
    let mut unnumbered = 0u64;
    let mut collapsed = 0u64;
    for page in pages {
        let number = match page_number(page) {
            Some(n) => n,
            None => {
                unnumbered += 1;
                1
            }
        };
        match by_number.entry(number) {
            Entry::Occupied(mut kept) => {
                collapsed += 1;
                if compare_pages(page, kept.get()).is_gt() {
                    kept.insert(page);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(page);
            }
        }
    }
    CollapsedPages {
        pages: by_number.into_iter().collect(),
        unnumbered,
        collapsed,
    }
}

/// One book as captured in one export: its book-list item (if the export had
/// one) and every page listed for it in that export.
#[derive(Debug, Clone, PartialEq)]
pub struct BookSnapshot {
    /// Input order of the export; also the final tie-break.
    pub source: usize,
    /// Order in which this snapshot was first seen across the whole run.
    pub seen: usize,
    pub book: Option<Value>,
    pub pages: Vec<PageSnapshot>,
}

/// The figures the comparator ranks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotScore {
    pub completed: usize,
    pub in_progress: usize,
    pub total: usize,
    pub latest_activity: Option<DateTime<Utc>>,
}

impl BookSnapshot {
    /// Figures over distinct page numbers: a page listed twice in one export
    /// (embedded in the book and under its page path) counts once.
    pub fn score(&self) -> SnapshotScore {
        let distinct = collapse_pages(&self.pages).pages;
        let mut completed = 0;
        let mut in_progress = 0;
        let mut latest: Option<DateTime<Utc>> = None;
        for (_, p) in &distinct {
            match p.status() {
                Some(PageStatus::Completed) => completed += 1,
                Some(PageStatus::InProgress) => in_progress += 1,
                _ => {}
            }
            latest = latest.max(p.latest_activity());
        }
        SnapshotScore {
            completed,
            in_progress,
            total: distinct.len(),
            latest_activity: latest,
        }
    }
}

/// Rank two snapshots; `Greater` means `a` is the better one.
///
/// Completed pages, then in-progress pages, then total pages, then the most
/// recent activity; a snapshot with no timestamps ranks below one with any.
pub fn compare_scores(a: &SnapshotScore, b: &SnapshotScore) -> Ordering {
    a.completed
        .cmp(&b.completed)
        .then(a.in_progress.cmp(&b.in_progress))
        .then(a.total.cmp(&b.total))
        .then(a.latest_activity.cmp(&b.latest_activity))
}

/// Index of the winning snapshot. Ties keep the earliest `seen` snapshot.
pub fn select_best(snapshots: &[BookSnapshot]) -> Option<usize> {
    let mut best: Option<(usize, SnapshotScore)> = None;
    for (idx, snap) in snapshots.iter().enumerate() {
        let score = snap.score();
        best = match best {
            None => Some((idx, score)),
            Some((best_idx, best_score)) => match compare_scores(&score, &best_score) {
                Ordering::Greater => Some((idx, score)),
                Ordering::Less => Some((best_idx, best_score)),
                Ordering::Equal if snap.seen < snapshots[best_idx].seen => Some((idx, score)),
                Ordering::Equal => Some((best_idx, best_score)),
            },
        };
    }
    best.map(|(idx, _)| idx)
}

/// Rank two copies of the same page number inside one snapshot:
/// completed > in-progress > available, then later activity.
pub fn compare_pages(a: &PageSnapshot, b: &PageSnapshot) -> Ordering {
    let status = |p: &PageSnapshot| p.status().unwrap_or(PageStatus::Available);
    status(a)
        .cmp(&status(b))
        .then(a.latest_activity().cmp(&b.latest_activity()))
}
