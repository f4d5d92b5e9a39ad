//! Task wire model
//!
//! A task is a run (or sub-run) serialized for remote execution. It is
//! ephemeral: it exists only while awaiting a worker. Payloads carry a
//! version tag so both sides can reject frames they do not understand.

use std::collections::BTreeMap;

use dagrun_core::Dag;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire version of dispatch payloads
pub const TASK_VERSION: u32 = 1;

/// Errors raised by the dispatch fabric
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// HTTP transport failure; pollers retry these indefinitely
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The peer answered with something other than the protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Payload carried an unknown version tag
    #[error("unsupported payload version: {0}")]
    Version(u32),

    /// Poller configured without any coordinator endpoint
    #[error("no coordinator endpoints configured")]
    NoEndpoints,
}

/// A run serialized for dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Task {
    /// Wire version; see [`TASK_VERSION`]
    pub version: u32,

    pub root_workflow_name: String,
    pub root_workflow_id: Uuid,

    #[serde(default)]
    pub parent_workflow_name: Option<String>,
    #[serde(default)]
    pub parent_workflow_id: Option<Uuid>,

    /// Id the worker must run under, so observers can find the record
    pub workflow_id: Uuid,

    /// Inline definition; workers never read definition files
    pub definition: Dag,

    /// Raw parameter string
    pub params: String,

    /// Label requirements a poller must satisfy
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Task {
    /// Serialize a root run of a definition.
    pub fn from_run(definition: Dag, workflow_id: Uuid, params: impl Into<String>) -> Self {
        let labels = definition.worker_selector.clone();
        Self {
            version: TASK_VERSION,
            root_workflow_name: definition.name.clone(),
            root_workflow_id: workflow_id,
            parent_workflow_name: None,
            parent_workflow_id: None,
            workflow_id,
            definition,
            params: params.into(),
            labels,
        }
    }

    /// Serialize a sub-run with a back reference to its parent.
    pub fn from_sub_run(
        definition: Dag,
        workflow_id: Uuid,
        params: impl Into<String>,
        parent_name: &str,
        parent_id: Uuid,
        root_name: &str,
        root_id: Uuid,
    ) -> Self {
        let labels = definition.worker_selector.clone();
        Self {
            version: TASK_VERSION,
            root_workflow_name: root_name.to_string(),
            root_workflow_id: root_id,
            parent_workflow_name: Some(parent_name.to_string()),
            parent_workflow_id: Some(parent_id),
            workflow_id,
            definition,
            params: params.into(),
            labels,
        }
    }
}

/// Whether a poller offering `offered` labels can take a task requiring
/// `required` labels: equal keys must have equal values, and a task with no
/// requirements matches any poller.
pub fn labels_match(
    required: &BTreeMap<String, String>,
    offered: &BTreeMap<String, String>,
) -> bool {
    required
        .iter()
        .all(|(k, v)| offered.get(k).is_some_and(|o| o == v))
}

/// Long-poll request body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PollRequest {
    pub version: u32,

    pub worker_id: String,

    /// Fresh per call; identifies one long-poll
    pub poller_id: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Long-poll response body; `task` is absent on idle timeout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PollResponse {
    #[serde(default)]
    pub task: Option<Task>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagrun_core::Step;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_labels_match_subset() {
        let required = labels(&[("gpu", "yes")]);
        let offered = labels(&[("gpu", "yes"), ("region", "us")]);
        assert!(labels_match(&required, &offered));
    }

    #[test]
    fn test_labels_mismatch_on_value() {
        let required = labels(&[("gpu", "yes")]);
        let offered = labels(&[("gpu", "no")]);
        assert!(!labels_match(&required, &offered));
    }

    #[test]
    fn test_empty_requirements_match_anything() {
        assert!(labels_match(&BTreeMap::new(), &BTreeMap::new()));
        assert!(labels_match(&BTreeMap::new(), &labels(&[("a", "b")])));
    }

    #[test]
    fn test_task_inherits_worker_selector() {
        let mut dag = dagrun_core::Dag::new("demo", vec![Step::command("a", "true")]);
        dag.worker_selector = labels(&[("gpu", "yes")]);

        let task = Task::from_run(dag, Uuid::now_v7(), "p");
        assert_eq!(task.version, TASK_VERSION);
        assert_eq!(task.labels, labels(&[("gpu", "yes")]));
        assert_eq!(task.root_workflow_id, task.workflow_id);
    }

    #[test]
    fn test_task_round_trip() {
        let dag = dagrun_core::Dag::new("demo", vec![Step::command("a", "true")]);
        let task = Task::from_run(dag, Uuid::now_v7(), "");
        let json = serde_json::to_string(&task).unwrap();
        let parsed: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(task, parsed);
    }
}
