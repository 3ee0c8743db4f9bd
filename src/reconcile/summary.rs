use serde::Serialize;
use tracing::{info, warn};

/// End-of-run report. Every soft failure in the run lands in one of these counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub sources: u64,
    pub records_read: u64,
    /// Chunks that failed to parse as JSON.
    pub records_rejected: u64,
    /// Parsed documents that are not `{path, data}` or carry an unknown prefix.
    pub records_unclassified: u64,
    pub users_materialized: u64,
    pub books_materialized: u64,
    pub pages_materialized: u64,
    pub uploads_materialized: u64,
    pub messages_materialized: u64,
    /// Records with no usable identity key.
    pub records_dropped: u64,
    pub unresolved_owners: u64,
    pub content_not_recovered: u64,
    /// Deterministic defaults applied to missing or invalid fields.
    pub field_corrections: u64,
    /// Book snapshots that lost version selection.
    pub snapshots_discarded: u64,
    /// Duplicate page numbers collapsed inside a selected snapshot.
    pub duplicate_pages_collapsed: u64,
    pub books_corrected: u64,
}

impl RunSummary {
    pub fn soft_error_total(&self) -> u64 {
        self.records_rejected
            + self.records_unclassified
            + self.records_dropped
            + self.unresolved_owners
            + self.content_not_recovered
    }

    /// True when an operator threshold is set and the soft errors exceed it.
    pub fn exceeds(&self, max_soft_errors: Option<u64>) -> bool {
        max_soft_errors.is_some_and(|max| self.soft_error_total() > max)
    }

    pub fn log(&self) {
        info!(
            sources = self.sources,
            records_read = self.records_read,
            users = self.users_materialized,
            books = self.books_materialized,
            pages = self.pages_materialized,
            uploads = self.uploads_materialized,
            messages = self.messages_materialized,
            field_corrections = self.field_corrections,
            snapshots_discarded = self.snapshots_discarded,
            duplicate_pages_collapsed = self.duplicate_pages_collapsed,
            books_corrected = self.books_corrected,
            "migration run summary"
        );
        if self.soft_error_total() > 0 {
            warn!(
                rejected = self.records_rejected,
                unclassified = self.records_unclassified,
                dropped = self.records_dropped,
                unresolved_owners = self.unresolved_owners,
                content_not_recovered = self.content_not_recovered,
                total = self.soft_error_total(),
                "migration run finished with soft errors"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_only_applies_when_set() {
        let s = RunSummary {
            records_rejected: 2,
            unresolved_owners: 3,
            field_corrections: 50,
            ..Default::default()
        };
        assert_eq!(s.soft_error_total(), 5);
        assert!(!s.exceeds(None));
        assert!(!s.exceeds(Some(5)));
        assert!(s.exceeds(Some(4)));
    }

    #[test]
    fn serializes_every_counter() {
        let v = serde_json::to_value(RunSummary::default()).unwrap();
        let obj = v.as_object().unwrap();
        for key in ["records_read", "records_rejected", "unresolved_owners", "content_not_recovered", "books_corrected"] {
            assert!(obj.contains_key(key), "missing {key}");
        }
    }
}
