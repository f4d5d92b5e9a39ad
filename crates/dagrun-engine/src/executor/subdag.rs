//! Sub-DAG executor
//!
//! Runs another definition as a child run. When the child definition
//! carries a worker selector and a dispatch client is configured, the
//! child run is serialized as a task and handed to the coordinator; the
//! parent then observes the child's persisted status until it turns
//! terminal or the dispatch timeout elapses. Otherwise the child runs
//! in-process under its own agent.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dagrun_core::{Dag, ParamSet, RunStatus, Step};
use dagrun_dispatch::Task;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::agent::{Agent, AgentError, AgentHandle};
use crate::context::EngineContext;

use super::{ExecContext, ExecError, Executor, Outcome, RunIds};

/// Default wait for a remotely dispatched child run
const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(3600);

/// How often the parent re-reads a dispatched child's status
const REMOTE_POLL_INTERVAL: Duration = Duration::from_millis(500);

enum Execution {
    Local {
        handle: AgentHandle,
        join: JoinHandle<Result<RunStatus, AgentError>>,
    },
    Remote {
        cancel: CancellationToken,
    },
}

/// Runs a step as a child DAG run
pub struct SubdagExecutor {
    step: Step,
    path: PathBuf,
    dispatch_timeout: Option<Duration>,
    engine: EngineContext,

    child: Option<Dag>,
    child_id: Uuid,
    parent: Option<RunIds>,
    capture_stdout: bool,
    execution: Option<Execution>,
    started_at: Option<Instant>,
}

impl SubdagExecutor {
    pub fn new(
        step: Step,
        path: PathBuf,
        dispatch_timeout: Option<Duration>,
        engine: EngineContext,
    ) -> Self {
        Self {
            step,
            path,
            dispatch_timeout,
            engine,
            child: None,
            child_id: Uuid::now_v7(),
            parent: None,
            capture_stdout: false,
            execution: None,
            started_at: None,
        }
    }

    fn child_path(&self) -> PathBuf {
        if self.path.is_absolute() {
            self.path.clone()
        } else {
            self.engine.dag_dir.join(&self.path)
        }
    }

    /// Watch the store until the dispatched child turns terminal.
    async fn wait_remote(&mut self, cancel: CancellationToken, started_at: Instant) -> Outcome {
        let child_name = self
            .child
            .as_ref()
            .map(|d| d.name.clone())
            .unwrap_or_default();
        let deadline = started_at + self.dispatch_timeout.unwrap_or(DEFAULT_DISPATCH_TIMEOUT);

        loop {
            if Instant::now() >= deadline {
                self.execution = None;
                return Outcome::from_error(
                    "timed out waiting for dispatched run",
                    started_at.elapsed(),
                );
            }

            // Not found yet means no worker has picked the task up
            if let Ok(snapshot) = self.engine.store.find(&child_name, self.child_id).await {
                if snapshot.status.is_terminal() {
                    self.execution = None;
                    return self.outcome_for(snapshot.status, started_at.elapsed());
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(REMOTE_POLL_INTERVAL) => {}
                _ = cancel.cancelled() => {
                    self.execution = None;
                    return Outcome::from_error(
                        "wait for dispatched run cancelled",
                        started_at.elapsed(),
                    );
                }
            }
        }
    }

    fn outcome_for(&self, status: RunStatus, duration: Duration) -> Outcome {
        let stdout = self.capture_stdout.then(|| {
            serde_json::json!({
                "workflow_id": self.child_id,
                "status": status,
            })
            .to_string()
        });
        match status {
            RunStatus::Succeeded | RunStatus::PartialSuccess => Outcome {
                exit_code: Some(0),
                stdout,
                stderr: String::new(),
                duration,
                error: None,
            },
            RunStatus::Failed => Outcome {
                exit_code: Some(1),
                stdout,
                stderr: String::new(),
                duration,
                error: Some("sub-dag run failed".to_string()),
            },
            other => Outcome {
                exit_code: None,
                stdout,
                stderr: String::new(),
                duration,
                error: Some(format!("sub-dag run ended {other}")),
            },
        }
    }
}

#[async_trait]
impl Executor for SubdagExecutor {
    async fn prepare(&mut self, ctx: &ExecContext) -> Result<(), ExecError> {
        let path = self.child_path();
        let child = Dag::load(&path).map_err(|e| {
            ExecError::Subdag(format!("{}: {e}", path.display()))
        })?;
        debug!(step = %self.step.name, child = %child.name, "sub-dag resolved");

        self.child = Some(child);
        self.parent = Some(ctx.run.clone());
        self.capture_stdout = ctx.capture_stdout;
        Ok(())
    }

    async fn start(&mut self) -> Result<(), ExecError> {
        let child = self.child.clone().ok_or(ExecError::NotPrepared)?;
        let parent = self.parent.clone().ok_or(ExecError::NotPrepared)?;
        let params = ParamSet::resolve(&child.params, None);
        self.started_at = Some(Instant::now());

        if !child.worker_selector.is_empty() {
            if let Some(client) = self.engine.dispatch_client.clone() {
                let task = Task::from_sub_run(
                    child,
                    self.child_id,
                    params.raw(),
                    &parent.dag_name,
                    parent.workflow_id,
                    &parent.dag_name,
                    parent.root_workflow_id,
                );
                client
                    .dispatch(&task)
                    .await
                    .map_err(|e| ExecError::Subdag(format!("dispatch failed: {e}")))?;

                self.execution = Some(Execution::Remote {
                    cancel: CancellationToken::new(),
                });
                return Ok(());
            }
        }

        let child_dir = self
            .child_path()
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.engine.dag_dir.clone());
        let agent = Agent::new(
            std::sync::Arc::new(child),
            params,
            self.engine.clone().with_dag_dir(child_dir),
        )
        .with_ids(
            self.child_id,
            Some(parent.workflow_id),
            parent.root_workflow_id,
        );
        let handle = agent.handle();
        let join = tokio::spawn(agent.run());

        self.execution = Some(Execution::Local { handle, join });
        Ok(())
    }

    async fn signal(&mut self, signal: i32) -> Result<(), ExecError> {
        match &self.execution {
            Some(Execution::Local { handle, .. }) => {
                debug!(step = %self.step.name, signal, "stopping sub-dag run");
                handle.stop();
            }
            Some(Execution::Remote { cancel }) => {
                // The worker owns the remote run; we only stop waiting.
                warn!(step = %self.step.name, "remote sub-dag cannot be signalled, abandoning wait");
                cancel.cancel();
            }
            None => {}
        }
        Ok(())
    }

    // Re-entrant: a dropped in-flight wait leaves the execution in place.
    async fn wait(&mut self) -> Result<Outcome, ExecError> {
        let started_at = self.started_at.unwrap_or_else(Instant::now);

        let remote_cancel = match &self.execution {
            Some(Execution::Remote { cancel }) => Some(cancel.clone()),
            Some(Execution::Local { .. }) => None,
            None => return Err(ExecError::NotPrepared),
        };
        if let Some(cancel) = remote_cancel {
            return Ok(self.wait_remote(cancel, started_at).await);
        }

        let status = {
            let Some(Execution::Local { join, .. }) = self.execution.as_mut() else {
                return Err(ExecError::NotPrepared);
            };
            match join.await {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    self.execution = None;
                    return Ok(Outcome::from_error(
                        format!("sub-dag agent failed: {e}"),
                        started_at.elapsed(),
                    ));
                }
                Err(e) => {
                    self.execution = None;
                    return Ok(Outcome::from_error(
                        format!("sub-dag task panicked: {e}"),
                        started_at.elapsed(),
                    ));
                }
            }
        };
        self.execution = None;
        Ok(self.outcome_for(status, started_at.elapsed()))
    }
}
