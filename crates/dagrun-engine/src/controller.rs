//! Per-DAG lifecycle operations
//!
//! The controller is the entry point for status, start, stop, restart,
//! and retry. Starts go through queue admission; the spawned task owns
//! the agent for the run's lifetime and releases its queue slot on
//! completion. Operations error only when the request cannot be accepted;
//! stopping an already-stopped run is silent success.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dagrun_core::{Dag, ParamSet, RunSnapshot, RunStatus};
use dagrun_dispatch::{DispatchError, Task};
use dagrun_storage::StoreError;
use dashmap::DashMap;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::agent::{Agent, AgentHandle};
use crate::context::EngineContext;
use crate::queue::{Admission, QueueManager, RunRef};

/// How often restart polls for the run to stop
const RESTART_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Controller errors
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// No definition with this name is known to the server
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// Persistence failure, or an unknown run id on retry
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Remote dispatch could not be accepted
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
}

struct ActiveRun {
    handle: AgentHandle,
}

/// Per-DAG operations over the store, queues, and live agents
pub struct Controller {
    engine: EngineContext,
    queues: Arc<QueueManager>,
    active: Arc<DashMap<String, ActiveRun>>,
}

impl Controller {
    pub fn new(engine: EngineContext, queues: Arc<QueueManager>) -> Self {
        Self {
            engine,
            queues,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn queues(&self) -> &Arc<QueueManager> {
        &self.queues
    }

    /// Latest known status; `NotStarted` when the DAG never ran.
    pub async fn get_status(&self, dag_name: &str) -> Result<RunStatus, ControllerError> {
        Ok(self
            .engine
            .store
            .latest(dag_name)
            .await?
            .map(|s| s.status)
            .unwrap_or(RunStatus::NotStarted))
    }

    /// Most recently terminal run, if any.
    pub async fn get_last_status(
        &self,
        dag_name: &str,
    ) -> Result<Option<RunSnapshot>, ControllerError> {
        Ok(self.engine.store.last_terminal(dag_name).await?)
    }

    /// The `n` most recent terminal runs, newest first.
    pub async fn get_recent_statuses(
        &self,
        dag_name: &str,
        n: usize,
    ) -> Result<Vec<RunSnapshot>, ControllerError> {
        Ok(self.engine.store.recent(dag_name, n).await?)
    }

    /// Instantiate a run and admit it through the queue manager.
    ///
    /// Returns the workflow id as soon as the request is accepted; the run
    /// itself proceeds in the background. A DAG with a worker selector is
    /// dispatched through the coordinator instead of running locally.
    pub async fn start(
        &self,
        dag: &Arc<Dag>,
        params_override: Option<&str>,
    ) -> Result<Uuid, ControllerError> {
        let params = ParamSet::resolve(&dag.params, params_override);

        if !dag.worker_selector.is_empty() {
            if let Some(client) = &self.engine.dispatch_client {
                let workflow_id = Uuid::now_v7();
                let task = Task::from_run((**dag).clone(), workflow_id, params.raw());
                client.dispatch(&task).await?;
                info!(
                    workflow = %dag.name,
                    %workflow_id,
                    "run dispatched to coordinator"
                );
                return Ok(workflow_id);
            }
        }

        let agent = Agent::new(Arc::clone(dag), params, self.engine.clone());
        let workflow_id = agent.workflow_id();
        let handle = agent.handle();

        let queue_name = dag.queue.clone().unwrap_or_else(|| dag.name.clone());
        let admission = self.queues.admit(
            &queue_name,
            dag.max_active_runs,
            RunRef {
                workflow_id,
                dag_name: dag.name.clone(),
            },
        );

        self.active
            .insert(dag.name.clone(), ActiveRun { handle: handle.clone() });

        let store = Arc::clone(&self.engine.store);
        let queues = Arc::clone(&self.queues);
        let active = Arc::clone(&self.active);
        let dag = Arc::clone(dag);
        tokio::spawn(async move {
            let dag_name = dag.name.clone();
            let permit = match admission {
                Admission::Admitted(permit) => permit,
                Admission::Queued(pending) => {
                    if let Err(e) = store.save(&agent.seed_snapshot(RunStatus::Queued)).await {
                        error!(workflow = %dag_name, "cannot persist queued run: {e}");
                        active.remove(&dag_name);
                        return;
                    }
                    tokio::select! {
                        promoted = pending.wait() => match promoted {
                            Ok(permit) => permit,
                            Err(_) => {
                                // Cleared out of the queue
                                let mut snapshot =
                                    agent.seed_snapshot(RunStatus::Cancelled);
                                snapshot.finished_at = Some(Utc::now());
                                let _ = store.save(&snapshot).await;
                                active.remove(&dag_name);
                                return;
                            }
                        },
                        _ = handle.cancelled() => {
                            queues.remove_queued(&queue_name, workflow_id);
                            let mut snapshot = agent.seed_snapshot(RunStatus::Cancelled);
                            snapshot.finished_at = Some(Utc::now());
                            let _ = store.save(&snapshot).await;
                            active.remove(&dag_name);
                            return;
                        }
                    }
                }
            };

            let result = agent.run().await;
            drop(permit);
            active.remove(&dag_name);

            match result {
                Ok(status) => debug!(workflow = %dag_name, %status, "run task finished"),
                Err(e) => error!(workflow = %dag_name, "agent failed: {e}"),
            }

            if let Err(e) = store.prune(&dag_name, dag.hist_retention_days).await {
                debug!(workflow = %dag_name, "history pruning failed: {e}");
            }
        });

        Ok(workflow_id)
    }

    /// Request cooperative cancellation of the active run. Idempotent;
    /// returns once the request is accepted, not when the run has stopped.
    pub async fn stop(&self, dag_name: &str) -> Result<(), ControllerError> {
        match self.active.get(dag_name) {
            Some(active) => {
                info!(workflow = dag_name, "stop requested");
                active.handle.stop();
            }
            None => debug!(workflow = dag_name, "stop on inactive workflow ignored"),
        }
        Ok(())
    }

    /// Stop the active run, wait for it to settle, wait `restartWait`,
    /// then start again with the previous run's parameters.
    pub async fn restart(&self, dag: &Arc<Dag>) -> Result<Uuid, ControllerError> {
        self.stop(&dag.name).await?;
        while self.get_status(&dag.name).await?.is_active() {
            tokio::time::sleep(RESTART_POLL_INTERVAL).await;
        }

        if !dag.restart_wait().is_zero() {
            debug!(workflow = %dag.name, "waiting restart interval");
            tokio::time::sleep(dag.restart_wait()).await;
        }

        let params = self
            .get_last_status(&dag.name)
            .await?
            .map(|snapshot| snapshot.params);
        self.start(dag, params.as_deref()).await
    }

    /// Re-run a past run with its original parameters against the
    /// definition as it currently is. Unknown run ids are an error.
    pub async fn retry(
        &self,
        dag: &Arc<Dag>,
        workflow_id: Uuid,
    ) -> Result<Uuid, ControllerError> {
        let snapshot = self.engine.store.find(&dag.name, workflow_id).await?;
        info!(
            workflow = %dag.name,
            original = %workflow_id,
            "retrying past run"
        );
        self.start(dag, Some(&snapshot.params)).await
    }
}
