//! Persisted run state
//!
//! A [`RunSnapshot`] is the whole-object snapshot the owning agent writes on
//! every transition; readers always see a consistent snapshot. History is
//! append-only per run: new runs never modify previous runs' records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dag::Dag;
use crate::status::{NodeStatus, RunStatus};

/// Per-step runtime state as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NodeSnapshot {
    pub name: String,

    pub status: NodeStatus,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub exit_code: Option<i32>,

    #[serde(default)]
    pub error: Option<String>,

    /// Attempts beyond the first
    #[serde(default)]
    pub retry_count: u32,

    /// Successful completions (can exceed 1 for repeating steps)
    #[serde(default)]
    pub done_count: u32,

    /// Captured stdout, present iff the step declares an output variable
    #[serde(default)]
    pub output: Option<String>,
}

impl NodeSnapshot {
    /// Fresh state for a step that has not been dispatched.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: NodeStatus::NotStarted,
            started_at: None,
            finished_at: None,
            exit_code: None,
            error: None,
            retry_count: 0,
            done_count: 0,
            output: None,
        }
    }
}

/// Whole-run state as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RunSnapshot {
    /// Unique per run; uuid v7, time-ordered
    pub workflow_id: Uuid,

    pub dag_name: String,

    /// Back reference for sub-DAG calls; lookup only, never ownership
    #[serde(default)]
    pub parent_workflow_id: Option<Uuid>,

    pub root_workflow_id: Uuid,

    pub status: RunStatus,

    /// Raw parameter string the run was started with
    pub params: String,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    /// Primary nodes, in declaration order
    pub nodes: Vec<NodeSnapshot>,

    /// Event handler nodes that ran, in execution order
    #[serde(default)]
    pub handler_nodes: Vec<NodeSnapshot>,
}

impl RunSnapshot {
    /// Seed a snapshot for a new run of the given definition.
    pub fn new(dag: &Dag, params: impl Into<String>) -> Self {
        let workflow_id = Uuid::now_v7();
        Self {
            workflow_id,
            dag_name: dag.name.clone(),
            parent_workflow_id: None,
            root_workflow_id: workflow_id,
            status: RunStatus::NotStarted,
            params: params.into(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            nodes: dag.steps.iter().map(|s| NodeSnapshot::new(&s.name)).collect(),
            handler_nodes: Vec::new(),
        }
    }

    /// Attach parent/root ids for a sub-DAG run.
    pub fn with_parent(mut self, parent: Uuid, root: Uuid) -> Self {
        self.parent_workflow_id = Some(parent);
        self.root_workflow_id = root;
        self
    }

    /// Node state by step name.
    pub fn node(&self, name: &str) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|n| n.name == name)
    }
}
