//! # Dagrun Dispatch
//!
//! The task-dispatch fabric between agents and worker processes.
//!
//! The [`Coordinator`] is a stateless in-memory matchmaker: `Dispatch`
//! hands it a serialized run, `Poll` is a long-poll from a worker, and the
//! coordinator routes each task to at most one eligible poller by label
//! matching. There is no acknowledgement phase and no durable broker; a
//! task handed to a poller is considered dispatched.
//!
//! The [`Poller`] is the worker-side client: it long-polls an ordered list
//! of coordinator endpoints, retries indefinitely with exponential backoff
//! and jitter, and rotates endpoints on sustained failure.

pub mod coordinator;
pub mod poller;
pub mod task;

pub use coordinator::{Coordinator, CoordinatorConfig};
pub use poller::{ConnectionState, DispatchClient, Poller, PollerConfig};
pub use task::{labels_match, DispatchError, PollRequest, PollResponse, Task, TASK_VERSION};
