//! # Dagrun Storage
//!
//! Persistence for run history. The [`RunStore`] trait defines the
//! interface; [`FileRunStore`] is the production implementation (a
//! directory per run holding a JSON status snapshot and per-step log
//! files), and [`InMemoryRunStore`] provides the same semantics for tests.
//!
//! Status is single-writer: the agent owning a run writes whole-object
//! snapshots; any number of readers (controller, UI) see consistent
//! snapshots. History is append-only per run.

pub mod fs;
pub mod memory;
pub mod store;

pub use fs::FileRunStore;
pub use memory::InMemoryRunStore;
pub use store::{RunStore, StoreError};
