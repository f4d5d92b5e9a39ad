//! Coordinator: matchmaker between dispatched tasks and polling workers
//!
//! State is two collections under one lock: `pending` (FIFO of tasks whose
//! labels matched no live waiter at dispatch time) and `waiters`
//! (registration-ordered pollers, each with a one-shot delivery channel).
//! The wait itself happens outside the lock. Removal from either
//! collection is atomic per delivery, which gives the at-most-once
//! guarantee.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::task::{labels_match, PollRequest, PollResponse, Task, TASK_VERSION};

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Server-side idle timeout for a `Poll`; the poller gets an empty
    /// response and polls again
    pub poll_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(30),
        }
    }
}

struct Waiter {
    id: u64,
    worker_id: String,
    labels: BTreeMap<String, String>,
    tx: oneshot::Sender<Task>,
}

#[derive(Default)]
struct CoordinatorState {
    pending: VecDeque<Task>,
    waiters: Vec<Waiter>,
    next_waiter_id: u64,
}

/// In-memory matchmaker between tasks and pollers
pub struct Coordinator {
    state: Mutex<CoordinatorState>,
    config: CoordinatorConfig,
}

impl Coordinator {
    /// Create a coordinator.
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            state: Mutex::new(CoordinatorState::default()),
            config,
        }
    }

    /// Dispatch a task.
    ///
    /// Scans waiters in registration order for the first whose labels are a
    /// superset of the task's requirements and delivers through its
    /// channel. A delivery that fails because the poller just cancelled
    /// hands the task to the next eligible waiter, or parks it in
    /// `pending`. Never blocks beyond matching.
    pub fn dispatch(&self, task: Task) {
        let mut task = task;
        let mut state = self.state.lock();

        let mut i = 0;
        while i < state.waiters.len() {
            if labels_match(&task.labels, &state.waiters[i].labels) {
                let waiter = state.waiters.remove(i);
                match waiter.tx.send(task) {
                    Ok(()) => {
                        debug!(
                            worker_id = %waiter.worker_id,
                            waiter = waiter.id,
                            "delivered task to waiting poller"
                        );
                        return;
                    }
                    // Receiver dropped between registration and delivery;
                    // the task is unaffected, keep scanning.
                    Err(returned) => task = returned,
                }
            } else {
                i += 1;
            }
        }

        debug!(workflow_id = %task.workflow_id, "no eligible poller, task parked");
        state.pending.push_back(task);
    }

    /// Long-poll for a task matching the poller's labels.
    ///
    /// Returns `None` on idle timeout. Dropping the returned future (the
    /// transport's cancellation signal) deregisters the waiter; a dispatch
    /// that already removed the waiter and sent counts as delivered.
    pub async fn poll(
        &self,
        worker_id: &str,
        poller_id: &str,
        labels: &BTreeMap<String, String>,
    ) -> Option<Task> {
        let (id, mut rx) = {
            let mut state = self.state.lock();

            // First eligible pending task wins, FIFO
            if let Some(pos) = state
                .pending
                .iter()
                .position(|t| labels_match(&t.labels, labels))
            {
                let task = state.pending.remove(pos);
                debug!(worker_id, poller_id, "delivered pending task");
                return task;
            }

            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push(Waiter {
                id,
                worker_id: worker_id.to_string(),
                labels: labels.clone(),
                tx,
            });
            (id, rx)
        };

        let guard = WaiterGuard {
            coordinator: self,
            id,
            armed: true,
        };

        let task = tokio::select! {
            res = &mut rx => res.ok(),
            _ = tokio::time::sleep(self.config.poll_timeout) => {
                if self.deregister(id) {
                    None
                } else {
                    // A dispatcher removed this waiter concurrently; the
                    // delivery is already in the channel (or imminent).
                    rx.await.ok()
                }
            }
        };

        guard.disarm();
        task
    }

    /// Number of parked tasks.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Number of currently blocked pollers.
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    fn deregister(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        let before = state.waiters.len();
        state.waiters.retain(|w| w.id != id);
        state.waiters.len() < before
    }

    /// Routes served on the internal listener.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/api/v1/coordinator/poll", post(handle_poll))
            .route("/api/v1/coordinator/dispatch", post(handle_dispatch))
            .with_state(self)
    }
}

/// Deregisters the waiter when a poll future is dropped mid-wait.
struct WaiterGuard<'a> {
    coordinator: &'a Coordinator,
    id: u64,
    armed: bool,
}

impl WaiterGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.coordinator.deregister(self.id);
        }
    }
}

async fn handle_poll(
    State(coordinator): State<Arc<Coordinator>>,
    Json(req): Json<PollRequest>,
) -> Result<Json<PollResponse>, (StatusCode, String)> {
    if req.version != TASK_VERSION {
        warn!(version = req.version, "rejecting poll with unknown version");
        return Err((
            StatusCode::BAD_REQUEST,
            format!("unsupported payload version: {}", req.version),
        ));
    }

    let task = coordinator
        .poll(&req.worker_id, &req.poller_id, &req.labels)
        .await;
    Ok(Json(PollResponse { task }))
}

async fn handle_dispatch(
    State(coordinator): State<Arc<Coordinator>>,
    Json(task): Json<Task>,
) -> Result<StatusCode, (StatusCode, String)> {
    if task.version != TASK_VERSION {
        warn!(version = task.version, "rejecting dispatch with unknown version");
        return Err((
            StatusCode::BAD_REQUEST,
            format!("unsupported payload version: {}", task.version),
        ));
    }

    info!(
        workflow = %task.root_workflow_name,
        workflow_id = %task.workflow_id,
        "task dispatched"
    );
    coordinator.dispatch(task);
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagrun_core::{Dag, Step};
    use uuid::Uuid;

    fn task_with_labels(pairs: &[(&str, &str)]) -> Task {
        let mut dag = Dag::new("demo", vec![Step::command("a", "true")]);
        dag.worker_selector = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Task::from_run(dag, Uuid::now_v7(), "")
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn coordinator() -> Arc<Coordinator> {
        Arc::new(Coordinator::new(CoordinatorConfig {
            poll_timeout: Duration::from_millis(200),
        }))
    }

    #[tokio::test]
    async fn test_dispatch_then_poll() {
        let c = coordinator();
        let task = task_with_labels(&[]);
        let id = task.workflow_id;
        c.dispatch(task);
        assert_eq!(c.pending_count(), 1);

        let got = c.poll("w1", "p1", &labels(&[])).await.unwrap();
        assert_eq!(got.workflow_id, id);
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_poll_then_dispatch() {
        let c = coordinator();
        let poll = {
            let c = Arc::clone(&c);
            tokio::spawn(async move { c.poll("w1", "p1", &labels(&[])).await })
        };
        // Let the poller register
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(c.waiter_count(), 1);

        let task = task_with_labels(&[]);
        let id = task.workflow_id;
        c.dispatch(task);

        let got = poll.await.unwrap().unwrap();
        assert_eq!(got.workflow_id, id);
        assert_eq!(c.pending_count(), 0);
        assert_eq!(c.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_at_most_once_first_poller_wins() {
        let c = coordinator();
        let p1 = {
            let c = Arc::clone(&c);
            tokio::spawn(async move { c.poll("w1", "p1", &labels(&[])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let p2 = {
            let c = Arc::clone(&c);
            tokio::spawn(async move { c.poll("w2", "p2", &labels(&[])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(c.waiter_count(), 2);

        c.dispatch(task_with_labels(&[]));

        // P1 registered first and gets the task; P2 times out empty
        assert!(p1.await.unwrap().is_some());
        assert!(p2.await.unwrap().is_none());
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_label_mismatch_parks_then_match_delivers() {
        let c = coordinator();
        let wrong = {
            let c = Arc::clone(&c);
            tokio::spawn(async move { c.poll("w1", "p1", &labels(&[("gpu", "no")])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        c.dispatch(task_with_labels(&[("gpu", "yes")]));
        assert_eq!(c.pending_count(), 1);

        let got = c.poll("w2", "p2", &labels(&[("gpu", "yes")])).await;
        assert!(got.is_some());
        assert_eq!(c.pending_count(), 0);

        assert!(wrong.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_poller_leaves_task_available() {
        let c = coordinator();
        let poll = {
            let c = Arc::clone(&c);
            tokio::spawn(async move { c.poll("w1", "p1", &labels(&[])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(c.waiter_count(), 1);

        // Client cancels before any dispatch
        poll.abort();
        let _ = poll.await;
        assert_eq!(c.waiter_count(), 0);

        c.dispatch(task_with_labels(&[]));
        assert_eq!(c.pending_count(), 1);

        // The next matching poller receives it
        let got = c.poll("w2", "p2", &labels(&[])).await;
        assert!(got.is_some());
    }

    #[tokio::test]
    async fn test_dispatch_races_cancelling_poller() {
        // A waiter whose receiver is already gone must not swallow the task.
        let c = coordinator();
        let poll = {
            let c = Arc::clone(&c);
            tokio::spawn(async move { c.poll("w1", "p1", &labels(&[])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        poll.abort();
        let _ = poll.await;

        c.dispatch(task_with_labels(&[]));
        let got = c.poll("w2", "p2", &labels(&[])).await;
        assert!(got.is_some(), "task must survive the cancelled poller");
    }

    #[tokio::test]
    async fn test_pending_fifo_order() {
        let c = coordinator();
        let first = task_with_labels(&[]);
        let first_id = first.workflow_id;
        c.dispatch(first);
        c.dispatch(task_with_labels(&[]));

        let got = c.poll("w1", "p1", &labels(&[])).await.unwrap();
        assert_eq!(got.workflow_id, first_id);
        assert_eq!(c.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_idle_poll_times_out_empty() {
        let c = coordinator();
        let got = c.poll("w1", "p1", &labels(&[])).await;
        assert!(got.is_none());
        assert_eq!(c.waiter_count(), 0);
    }
}
