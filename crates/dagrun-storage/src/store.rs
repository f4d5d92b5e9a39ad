//! RunStore trait definition

use async_trait::async_trait;
use dagrun_core::RunSnapshot;
use uuid::Uuid;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No run with this id exists
    #[error("no such run: {0}")]
    RunNotFound(Uuid),

    /// Underlying I/O failure; treated as fatal by the owning agent
    #[error("storage i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Store for run snapshots and step logs
///
/// Implementations must be thread-safe. Writers publish whole-object
/// snapshots; a read never observes a partially applied update.
#[async_trait]
pub trait RunStore: Send + Sync + 'static {
    /// Persist a snapshot, creating the run record on first write.
    async fn save(&self, snapshot: &RunSnapshot) -> Result<(), StoreError>;

    /// Latest run of a DAG by creation order, terminal or not.
    async fn latest(&self, dag_name: &str) -> Result<Option<RunSnapshot>, StoreError>;

    /// Most recent run that reached a terminal status.
    async fn last_terminal(&self, dag_name: &str) -> Result<Option<RunSnapshot>, StoreError>;

    /// The `n` most recent terminal runs, newest first.
    async fn recent(&self, dag_name: &str, n: usize) -> Result<Vec<RunSnapshot>, StoreError>;

    /// Look up one run by id.
    async fn find(&self, dag_name: &str, workflow_id: Uuid) -> Result<RunSnapshot, StoreError>;

    /// Append a line to a step's log file.
    async fn append_step_log(
        &self,
        dag_name: &str,
        workflow_id: Uuid,
        step: &str,
        line: &str,
    ) -> Result<(), StoreError>;

    /// Drop run records older than the retention window.
    ///
    /// Returns the number of runs removed. Runs that have not finished are
    /// never pruned.
    async fn prune(&self, dag_name: &str, retention_days: u32) -> Result<usize, StoreError>;
}
