//! Target-store contract and its implementations.

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::{MemorySnapshot, MemoryStore};
pub use postgres::PgStore;
pub use store::{BookAggregate, TargetStore, RESET_REQUIRED_HASH};
