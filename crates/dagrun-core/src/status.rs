//! Node and run statuses

use serde::{Deserialize, Serialize};

/// Status of a single node (one step of one run)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Step has not been dispatched yet
    NotStarted,

    /// Step is sleeping between a failed attempt and its retry
    Waiting,

    /// Step is executing
    Running,

    /// Step finished successfully
    Succeeded,

    /// Step failed with no retries remaining
    Failed,

    /// Step was cancelled before completion
    Cancelled,

    /// Step was skipped (precondition unmet)
    Skipped,

    /// Step failed but its continue-on policy lets the run proceed
    PartialSuccess,
}

impl NodeStatus {
    /// Whether this status is terminal for the node.
    ///
    /// Terminal statuses are sticky: only an explicit retry command resets
    /// a node back to [`NodeStatus::NotStarted`].
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::Skipped | Self::PartialSuccess
        )
    }

    /// Whether a dependency in this status lets its successors run.
    ///
    /// `PartialSuccess` counts: the continue-on policy already decided the
    /// failure does not gate downstream steps. A plain `Failed` never
    /// satisfies a dependency.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped | Self::PartialSuccess)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Waiting => write!(f, "waiting"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Skipped => write!(f, "skipped"),
            Self::PartialSuccess => write!(f, "partial_success"),
        }
    }
}

/// Status of one workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run was created but never executed
    NotStarted,

    /// Run is waiting in a queue for admission
    Queued,

    /// Run is owned by an agent and executing
    Running,

    /// Every node succeeded or was skipped
    Succeeded,

    /// At least one node failed
    Failed,

    /// The run was cancelled
    Cancelled,

    /// All nodes are dependency-satisfying but at least one ended partial
    PartialSuccess,
}

impl RunStatus {
    /// Whether this status is terminal for the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::PartialSuccess
        )
    }

    /// Whether the run is still queued or executing.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::PartialSuccess => write!(f, "partial_success"),
        }
    }
}
