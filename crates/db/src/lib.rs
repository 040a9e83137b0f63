//! `db` crate — pure persistence layer.
//!
//! Provides typed records, the [`RunStore`] contract the run engine is
//! written against, and two implementations of it: [`MemoryStore`] for
//! tests and single-process deployments, and [`PgStore`] over a Postgres
//! connection pool. No run-lifecycle rules live here beyond the atomic
//! compare-and-swap primitives the engine builds them from.

pub mod error;
pub mod memory;
pub mod models;
pub mod pg;
pub mod pool;
pub mod repository;
pub mod store;

pub use error::DbError;
pub use memory::MemoryStore;
pub use pg::PgStore;
pub use pool::DbPool;
pub use store::{
    ClaimOutcome, FinishOutcome, RunStore, RunTransition, StepCompletion, TransitionOutcome,
};
