//! In-memory implementation of RunStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use dagrun_core::RunSnapshot;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::store::{RunStore, StoreError};

/// In-memory run store
///
/// Primarily for tests; provides the same semantics as [`crate::FileRunStore`].
#[derive(Default)]
pub struct InMemoryRunStore {
    /// Snapshots per DAG, in creation order
    runs: RwLock<HashMap<String, Vec<RunSnapshot>>>,

    /// Step logs keyed by (workflow id, step name)
    logs: RwLock<HashMap<(Uuid, String), Vec<String>>>,
}

impl InMemoryRunStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines logged for a step of a run.
    pub fn step_log(&self, workflow_id: Uuid, step: &str) -> Vec<String> {
        self.logs
            .read()
            .get(&(workflow_id, step.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of stored runs across all DAGs.
    pub fn run_count(&self) -> usize {
        self.runs.read().values().map(Vec::len).sum()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save(&self, snapshot: &RunSnapshot) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let entries = runs.entry(snapshot.dag_name.clone()).or_default();
        match entries
            .iter_mut()
            .find(|r| r.workflow_id == snapshot.workflow_id)
        {
            Some(existing) => *existing = snapshot.clone(),
            None => entries.push(snapshot.clone()),
        }
        Ok(())
    }

    async fn latest(&self, dag_name: &str) -> Result<Option<RunSnapshot>, StoreError> {
        Ok(self
            .runs
            .read()
            .get(dag_name)
            .and_then(|entries| entries.last().cloned()))
    }

    async fn last_terminal(&self, dag_name: &str) -> Result<Option<RunSnapshot>, StoreError> {
        Ok(self.recent(dag_name, 1).await?.into_iter().next())
    }

    async fn recent(&self, dag_name: &str, n: usize) -> Result<Vec<RunSnapshot>, StoreError> {
        Ok(self
            .runs
            .read()
            .get(dag_name)
            .map(|entries| {
                entries
                    .iter()
                    .rev()
                    .filter(|r| r.status.is_terminal())
                    .take(n)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find(&self, dag_name: &str, workflow_id: Uuid) -> Result<RunSnapshot, StoreError> {
        self.runs
            .read()
            .get(dag_name)
            .and_then(|entries| entries.iter().find(|r| r.workflow_id == workflow_id))
            .cloned()
            .ok_or(StoreError::RunNotFound(workflow_id))
    }

    async fn append_step_log(
        &self,
        _dag_name: &str,
        workflow_id: Uuid,
        step: &str,
        line: &str,
    ) -> Result<(), StoreError> {
        self.logs
            .write()
            .entry((workflow_id, step.to_string()))
            .or_default()
            .push(line.trim_end_matches('\n').to_string());
        Ok(())
    }

    async fn prune(&self, dag_name: &str, retention_days: u32) -> Result<usize, StoreError> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let mut runs = self.runs.write();
        let Some(entries) = runs.get_mut(dag_name) else {
            return Ok(0);
        };
        let before = entries.len();
        entries.retain(|r| !matches!(r.finished_at, Some(t) if t < cutoff));
        Ok(before - entries.len())
    }
}
