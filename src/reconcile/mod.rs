//! The reconciliation engine: resolution, content association, version
//! selection, materialization and aggregate repair.

pub mod config;
pub mod content;
pub mod materialize;
pub mod pipeline;
pub mod repair;
pub mod resolver;
pub mod selector;
pub mod summary;

pub use config::{CandidateForm, MigrationConfig};
pub use pipeline::{run_exports, run_migration, scan_export, CancelFlag, ScanReport};
pub use repair::repair_aggregates;
pub use summary::RunSummary;
