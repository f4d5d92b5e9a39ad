//! Worker process
//!
//! Long-polls the configured coordinator endpoints and executes each
//! received task by running its inline definition under a local agent,
//! persisting status under the worker's data directory with the task's
//! workflow id so observers can find the record.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use dagrun_core::{Config, ParamSet};
use dagrun_dispatch::{Poller, PollerConfig, Task, TASK_VERSION};
use dagrun_engine::{Agent, EngineContext};
use dagrun_storage::FileRunStore;

/// Run a worker until a termination signal arrives.
pub async fn run(config: Arc<Config>) -> anyhow::Result<()> {
    let store = Arc::new(FileRunStore::new(&config.data_dir));
    let engine = EngineContext::new(store, Arc::clone(&config));

    let worker_id = config
        .worker_id
        .clone()
        .unwrap_or_else(|| format!("worker-{}", Uuid::now_v7()));
    let poller_config = PollerConfig::new(config.coordinator_endpoints.clone())
        .with_worker_id(&worker_id)
        .with_labels(config.worker_labels.clone());
    let mut poller = Poller::new(poller_config)?;

    info!(
        %worker_id,
        endpoints = ?config.coordinator_endpoints,
        labels = ?config.worker_labels,
        "worker starting"
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("termination signal received, draining worker");
                cancel.cancel();
            }
        });
    }

    poller
        .run(cancel, |task| {
            let engine = engine.clone();
            async move { execute_task(engine, task).await }
        })
        .await;

    info!("worker stopped");
    Ok(())
}

/// Execute one dispatched task. Worker-side failures never propagate to
/// the coordinator; they surface only as the run's persisted status.
async fn execute_task(engine: EngineContext, task: Task) {
    if task.version != TASK_VERSION {
        warn!(version = task.version, "dropping task with unknown version");
        return;
    }

    let workflow_id = task.workflow_id;
    let dag = Arc::new(task.definition);
    if let Err(e) = dag.validate() {
        error!(%workflow_id, "dropping invalid task definition: {e}");
        return;
    }

    let params = ParamSet::parse(&task.params);
    let agent = Agent::new(Arc::clone(&dag), params, engine).with_ids(
        workflow_id,
        task.parent_workflow_id,
        task.root_workflow_id,
    );

    match agent.run().await {
        Ok(status) => info!(workflow = %dag.name, %workflow_id, %status, "task finished"),
        Err(e) => error!(workflow = %dag.name, %workflow_id, "task failed fatally: {e}"),
    }
}
