//! # Dagrun Core
//!
//! Shared data model for the dagrun workflow orchestrator.
//!
//! This crate defines the immutable workflow definition ([`Dag`], [`Step`]
//! and their policies), the runtime statuses ([`NodeStatus`], [`RunStatus`]),
//! the persisted run snapshot types, the OS signal table, positional/named
//! parameter resolution, and global configuration. It deliberately contains
//! no execution logic: the engine, storage, and dispatch crates all consume
//! these types.

pub mod config;
pub mod dag;
pub mod params;
pub mod run;
pub mod signal;
pub mod status;

pub use config::{Config, ConfigError, QueueOverride};
pub use dag::{
    ContinueOn, Dag, DagError, ExecutorSpec, Handlers, Precondition, RepeatPolicy, RetryPolicy,
    Step,
};
pub use params::ParamSet;
pub use run::{NodeSnapshot, RunSnapshot};
pub use signal::{signal_num, signal_num_or, SIGINT, SIGKILL, SIGTERM};
pub use status::{NodeStatus, RunStatus};
