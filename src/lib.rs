pub mod database_ops;
pub mod legacy;
pub mod model;
pub mod normalization;
pub mod reconcile;
pub mod tracing;

pub mod util {
    pub mod db;
    pub mod env;
}

pub use reconcile::{run_migration, CancelFlag, MigrationConfig, RunSummary};
