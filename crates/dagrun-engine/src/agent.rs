//! Agent: owns exactly one run
//!
//! The agent resolves parameters, constructs the walker, translates OS
//! signals into cooperative cancellation, persists node snapshots on every
//! transition and on a heartbeat, and publishes status for observers. It
//! terminates with the walker's outcome; a persistence failure is fatal
//! and stops the run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dagrun_core::{Dag, NodeStatus, ParamSet, RunSnapshot, RunStatus};
use dagrun_storage::StoreError;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::EngineContext;
use crate::executor::RunIds;
use crate::node::{unmet_precondition, RunContext};
use crate::walker::Walker;

/// Default heartbeat between persisted snapshots
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(1);

/// Agent errors
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Persistence is broken; the agent terminates non-zero
    #[error("failed to persist run status: {0}")]
    Store(#[from] StoreError),
}

/// Handle for observing and stopping a running agent
///
/// The first `stop` cancels the primary graph; a second one cancels event
/// handlers too. Stopping an already-stopped run is a silent no-op.
#[derive(Clone)]
pub struct AgentHandle {
    pub workflow_id: Uuid,
    primary: CancellationToken,
    handlers: CancellationToken,
    status_rx: watch::Receiver<RunStatus>,
}

impl AgentHandle {
    /// Request cooperative cancellation. Idempotent.
    pub fn stop(&self) {
        if !self.primary.is_cancelled() {
            self.primary.cancel();
        } else {
            self.handlers.cancel();
        }
    }

    /// Latest published status.
    pub fn status(&self) -> RunStatus {
        *self.status_rx.borrow()
    }

    /// Completes once a stop has been requested.
    pub async fn cancelled(&self) {
        self.primary.cancelled().await;
    }

    /// Watch for status changes.
    pub fn status_rx(&self) -> watch::Receiver<RunStatus> {
        self.status_rx.clone()
    }
}

/// Runs one workflow run end to end
pub struct Agent {
    dag: Arc<Dag>,
    params: ParamSet,
    engine: EngineContext,

    workflow_id: Uuid,
    parent_workflow_id: Option<Uuid>,
    root_workflow_id: Uuid,
    created_at: DateTime<Utc>,

    primary_cancel: CancellationToken,
    handler_cancel: CancellationToken,
    status_tx: watch::Sender<RunStatus>,
    status_rx: watch::Receiver<RunStatus>,
    heartbeat: Duration,
}

impl Agent {
    pub fn new(dag: Arc<Dag>, params: ParamSet, engine: EngineContext) -> Self {
        let workflow_id = Uuid::now_v7();
        let (status_tx, status_rx) = watch::channel(RunStatus::NotStarted);
        Self {
            dag,
            params,
            engine,
            workflow_id,
            parent_workflow_id: None,
            root_workflow_id: workflow_id,
            created_at: Utc::now(),
            primary_cancel: CancellationToken::new(),
            handler_cancel: CancellationToken::new(),
            status_tx,
            status_rx,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }

    /// Reuse explicit ids (sub-DAG calls, dispatched tasks).
    pub fn with_ids(mut self, workflow_id: Uuid, parent: Option<Uuid>, root: Uuid) -> Self {
        self.workflow_id = workflow_id;
        self.parent_workflow_id = parent;
        self.root_workflow_id = root;
        self
    }

    /// Override the persistence heartbeat.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            workflow_id: self.workflow_id,
            primary: self.primary_cancel.clone(),
            handlers: self.handler_cancel.clone(),
            status_rx: self.status_rx.clone(),
        }
    }

    /// A snapshot of this run before execution, for queued persistence.
    pub fn seed_snapshot(&self, status: RunStatus) -> RunSnapshot {
        let mut snapshot = RunSnapshot::new(&self.dag, self.params.raw());
        snapshot.workflow_id = self.workflow_id;
        snapshot.parent_workflow_id = self.parent_workflow_id;
        snapshot.root_workflow_id = self.root_workflow_id;
        snapshot.created_at = self.created_at;
        snapshot.status = status;
        snapshot
    }

    /// Execute the run to completion.
    pub async fn run(self) -> Result<RunStatus, AgentError> {
        info!(
            workflow = %self.dag.name,
            workflow_id = %self.workflow_id,
            params = self.params.raw(),
            "run starting"
        );

        // Run-level preconditions gate the whole graph
        if let Some(reason) =
            unmet_precondition(&self.dag.preconditions, &self.params, &BTreeMap::new())
        {
            info!(workflow = %self.dag.name, %reason, "run precondition unmet, skipping");
            let now = Utc::now();
            let mut snapshot = self.seed_snapshot(RunStatus::Succeeded);
            snapshot.started_at = Some(now);
            snapshot.finished_at = Some(now);
            for node in &mut snapshot.nodes {
                node.status = NodeStatus::Skipped;
                node.error = Some(reason.clone());
            }
            self.engine.store.save(&snapshot).await?;
            let _ = self.status_tx.send(RunStatus::Succeeded);
            return Ok(RunStatus::Succeeded);
        }

        let walker = Arc::new(Walker::new(Arc::clone(&self.dag)));
        let (transitions_tx, mut transitions_rx) = mpsc::unbounded_channel();
        let started_at = Utc::now();

        let writer = SnapshotWriter {
            engine: self.engine.clone(),
            walker: Arc::clone(&walker),
            base: self.seed_snapshot(RunStatus::Running),
            started_at,
        };

        writer.write(RunStatus::Running, None).await?;
        let _ = self.status_tx.send(RunStatus::Running);

        let ctx = RunContext {
            engine: self.engine.clone(),
            dag: Arc::clone(&self.dag),
            ids: RunIds {
                dag_name: self.dag.name.clone(),
                workflow_id: self.workflow_id,
                root_workflow_id: self.root_workflow_id,
            },
            params: self.params.clone(),
            outputs: Arc::new(parking_lot::RwLock::new(BTreeMap::new())),
            cancel: self.primary_cancel.clone(),
            transitions: transitions_tx,
        };

        // Persist on every transition and on the heartbeat. A write
        // failure is fatal: it cancels the run and surfaces after the
        // walker unwinds.
        let fatal: Arc<Mutex<Option<StoreError>>> = Arc::new(Mutex::new(None));
        let persist_done = CancellationToken::new();
        let persist_task = {
            let writer = writer.clone();
            let fatal = Arc::clone(&fatal);
            let done = persist_done.clone();
            let primary = self.primary_cancel.clone();
            let handlers = self.handler_cancel.clone();
            let heartbeat = self.heartbeat;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(heartbeat);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = done.cancelled() => break,
                        ping = transitions_rx.recv() => {
                            if ping.is_none() {
                                // Walker finished; the final snapshot is
                                // written by the agent itself.
                                done.cancelled().await;
                                break;
                            }
                        }
                        _ = ticker.tick() => {}
                    }
                    if let Err(e) = writer.write(RunStatus::Running, None).await {
                        error!("snapshot persistence failed, stopping run: {e}");
                        *fatal.lock() = Some(e);
                        primary.cancel();
                        handlers.cancel();
                        break;
                    }
                }
            })
        };

        let status = walker.run(ctx, self.handler_cancel.clone()).await;

        persist_done.cancel();
        let _ = persist_task.await;

        if let Some(e) = fatal.lock().take() {
            return Err(AgentError::Store(e));
        }

        writer.write(status, Some(Utc::now())).await?;
        let _ = self.status_tx.send(status);

        info!(
            workflow = %self.dag.name,
            workflow_id = %self.workflow_id,
            %status,
            "run finished"
        );
        Ok(status)
    }
}

/// Publishes whole-object snapshots; the agent is the single writer.
#[derive(Clone)]
struct SnapshotWriter {
    engine: EngineContext,
    walker: Arc<Walker>,
    base: RunSnapshot,
    started_at: DateTime<Utc>,
}

impl SnapshotWriter {
    async fn write(
        &self,
        status: RunStatus,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut snapshot = self.base.clone();
        snapshot.status = status;
        snapshot.started_at = Some(self.started_at);
        snapshot.finished_at = finished_at;
        snapshot.nodes = self.walker.node_snapshots();
        snapshot.handler_nodes = self.walker.handler_snapshots();
        self.engine.store.save(&snapshot).await
    }
}

/// Translate OS termination signals into cooperative cancellation.
///
/// The first signal stops the primary graph; a second stops handlers.
pub fn install_signal_handler(handle: AgentHandle) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("cannot install SIGTERM handler: {e}");
                    return;
                }
            };
            let mut int = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("cannot install SIGINT handler: {e}");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = int.recv() => {}
                }
                info!("termination signal received, stopping run");
                handle.stop();
            }
        }

        #[cfg(not(unix))]
        {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                info!("termination signal received, stopping run");
                handle.stop();
            }
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use dagrun_core::{Config, Precondition, Step};
    use dagrun_storage::{InMemoryRunStore, RunStore};

    fn engine() -> (Arc<InMemoryRunStore>, EngineContext) {
        let store = Arc::new(InMemoryRunStore::new());
        let engine = EngineContext::new(
            Arc::clone(&store) as Arc<dyn RunStore>,
            Arc::new(Config::default()),
        );
        (store, engine)
    }

    #[tokio::test]
    async fn test_run_persists_terminal_snapshot() {
        let (store, engine) = engine();
        let dag = Arc::new(Dag::new(
            "agent-ok",
            vec![
                Step::command("a", "echo A"),
                Step::command("b", "echo B").with_depends("a"),
            ],
        ));

        let agent = Agent::new(Arc::clone(&dag), ParamSet::parse("foo"), engine);
        let workflow_id = agent.workflow_id();
        let status = agent.run().await.unwrap();

        assert_eq!(status, RunStatus::Succeeded);
        let snapshot = store.find("agent-ok", workflow_id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Succeeded);
        assert_eq!(snapshot.params, "foo");
        assert!(snapshot.finished_at.is_some());
        assert!(snapshot
            .nodes
            .iter()
            .all(|n| n.status == NodeStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_stop_cancels_run() {
        let (store, engine) = engine();
        let dag = Arc::new(Dag::new(
            "agent-stop",
            vec![Step::command("slow", "sleep 30")],
        ));

        let agent = Agent::new(Arc::clone(&dag), ParamSet::default(), engine);
        let workflow_id = agent.workflow_id();
        let handle = agent.handle();

        let task = tokio::spawn(agent.run());
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.stop();
        // Stop is idempotent
        handle.stop();

        let status = task.await.unwrap().unwrap();
        assert_eq!(status, RunStatus::Cancelled);
        let snapshot = store.find("agent-stop", workflow_id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_run_precondition_skips_everything() {
        let (store, engine) = engine();
        let mut dag = Dag::new("agent-gated", vec![Step::command("a", "echo never")]);
        dag.preconditions = vec![Precondition {
            condition: "$1".to_string(),
            expected: "go".to_string(),
        }];

        let agent = Agent::new(Arc::new(dag), ParamSet::parse("halt"), engine);
        let workflow_id = agent.workflow_id();
        let status = agent.run().await.unwrap();

        assert_eq!(status, RunStatus::Succeeded);
        let snapshot = store.find("agent-gated", workflow_id).await.unwrap();
        assert!(snapshot
            .nodes
            .iter()
            .all(|n| n.status == NodeStatus::Skipped));
    }

    #[tokio::test]
    async fn test_status_watch_publishes_progress() {
        let (_store, engine) = engine();
        let dag = Arc::new(Dag::new(
            "agent-watch",
            vec![Step::command("a", "sleep 1")],
        ));

        let agent = Agent::new(Arc::clone(&dag), ParamSet::default(), engine);
        let handle = agent.handle();
        assert_eq!(handle.status(), RunStatus::NotStarted);

        let task = tokio::spawn(agent.run());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(handle.status(), RunStatus::Running);

        let status = task.await.unwrap().unwrap();
        assert_eq!(status, RunStatus::Succeeded);
        assert_eq!(handle.status(), RunStatus::Succeeded);
    }
}
