//! Queue admission control
//!
//! Each queue gates concurrent runs against an effective concurrency cap:
//! a global configuration override for the queue name wins, else the DAG's
//! `maxActiveRuns`, else 1 (never below 1). Admission is immediate while
//! capacity remains; otherwise the run waits FIFO for promotion. All
//! per-queue state is serialized behind one lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use dagrun_core::Config;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

/// Queue errors
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queued run was dropped by a clear before promotion
    #[error("queued run was cleared")]
    Cleared,
}

/// Identity of a run inside a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRef {
    pub workflow_id: Uuid,
    pub dag_name: String,
}

/// Observable state of one queue
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub name: String,
    pub max_concurrency: usize,
    pub running: Vec<RunRef>,
    pub queued: Vec<RunRef>,
}

struct QueuedEntry {
    run: RunRef,
    promote_tx: oneshot::Sender<QueuePermit>,
}

#[derive(Default)]
struct QueueState {
    max_concurrency: usize,
    running: Vec<RunRef>,
    queued: VecDeque<QueuedEntry>,
}

/// Result of an admission request
pub enum Admission {
    /// Capacity was available; the permit releases on drop
    Admitted(QueuePermit),

    /// The queue is saturated; wait for promotion
    Queued(PendingAdmission),
}

/// A pending admission, promoted FIFO as capacity frees up
pub struct PendingAdmission {
    rx: oneshot::Receiver<QueuePermit>,
}

impl PendingAdmission {
    /// Wait until promoted. Errors if the entry was cleared.
    pub async fn wait(self) -> Result<QueuePermit, QueueError> {
        self.rx.await.map_err(|_| QueueError::Cleared)
    }
}

/// Occupancy of one running slot; released on drop
pub struct QueuePermit {
    manager: Arc<QueueManager>,
    queue: String,
    workflow_id: Uuid,
    armed: bool,
}

impl QueuePermit {
    fn new(manager: Arc<QueueManager>, queue: String, workflow_id: Uuid) -> Self {
        Self {
            manager,
            queue,
            workflow_id,
            armed: true,
        }
    }

    fn defuse(&mut self) {
        self.armed = false;
    }
}

impl Drop for QueuePermit {
    fn drop(&mut self) {
        if self.armed {
            self.manager.release(&self.queue, self.workflow_id);
        }
    }
}

/// Admission control across all queues
pub struct QueueManager {
    queues: Mutex<HashMap<String, QueueState>>,
    overrides: HashMap<String, u32>,
}

impl QueueManager {
    /// Build from global configuration (queue overrides).
    pub fn new(config: &Config) -> Arc<Self> {
        let overrides = config
            .queues
            .iter()
            .map(|q| (q.name.clone(), q.max_concurrency))
            .collect();
        Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
            overrides,
        })
    }

    /// Effective concurrency cap for a queue.
    ///
    /// `max(1, global override if present else dag maxActiveRuns else 1)`.
    pub fn effective_max(&self, queue: &str, dag_max_active_runs: Option<u32>) -> usize {
        let resolved = self
            .overrides
            .get(queue)
            .copied()
            .or(dag_max_active_runs)
            .unwrap_or(1);
        resolved.max(1) as usize
    }

    /// Request admission for a run.
    pub fn admit(
        self: &Arc<Self>,
        queue: &str,
        dag_max_active_runs: Option<u32>,
        run: RunRef,
    ) -> Admission {
        let max = self.effective_max(queue, dag_max_active_runs);
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        state.max_concurrency = max;

        if state.running.len() < max {
            debug!(queue, workflow_id = %run.workflow_id, "run admitted");
            let permit = QueuePermit::new(Arc::clone(self), queue.to_string(), run.workflow_id);
            state.running.push(run);
            Admission::Admitted(permit)
        } else {
            info!(
                queue,
                workflow_id = %run.workflow_id,
                running = state.running.len(),
                "queue saturated, run queued"
            );
            let (promote_tx, rx) = oneshot::channel();
            state.queued.push_back(QueuedEntry { run, promote_tx });
            Admission::Queued(PendingAdmission { rx })
        }
    }

    /// Release a running slot and promote queued heads while capacity
    /// allows.
    fn release(self: &Arc<Self>, queue: &str, workflow_id: Uuid) {
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return;
        };
        state.running.retain(|r| r.workflow_id != workflow_id);
        debug!(queue, %workflow_id, "run released");

        while state.running.len() < state.max_concurrency {
            let Some(entry) = state.queued.pop_front() else {
                break;
            };
            let permit = QueuePermit::new(
                Arc::clone(self),
                queue.to_string(),
                entry.run.workflow_id,
            );
            match entry.promote_tx.send(permit) {
                Ok(()) => {
                    debug!(queue, workflow_id = %entry.run.workflow_id, "run promoted");
                    state.running.push(entry.run);
                }
                // Abandoned while queued (run cancelled); skip it. The
                // permit must not release under the held lock.
                Err(mut permit) => permit.defuse(),
            }
        }
    }

    /// Remove a queued (not running) entry, e.g. when a queued run is
    /// stopped. Running entries are untouched.
    pub fn remove_queued(&self, queue: &str, workflow_id: Uuid) -> bool {
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return false;
        };
        let before = state.queued.len();
        state.queued.retain(|e| e.run.workflow_id != workflow_id);
        state.queued.len() < before
    }

    /// Drop all queued entries of a queue; their pending admissions
    /// resolve as cleared. Running entries are not affected.
    pub fn clear(&self, queue: &str) -> Vec<RunRef> {
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Vec::new();
        };
        let cleared: Vec<RunRef> = state.queued.drain(..).map(|e| e.run).collect();
        if !cleared.is_empty() {
            info!(queue, count = cleared.len(), "queued runs cleared");
        }
        cleared
    }

    /// Snapshot of all queues.
    pub fn list(&self) -> Vec<QueueSnapshot> {
        let queues = self.queues.lock();
        let mut snapshots: Vec<QueueSnapshot> = queues
            .iter()
            .map(|(name, state)| QueueSnapshot {
                name: name.clone(),
                max_concurrency: state.max_concurrency,
                running: state.running.clone(),
                queued: state.queued.iter().map(|e| e.run.clone()).collect(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagrun_core::QueueOverride;

    fn manager(overrides: Vec<QueueOverride>) -> Arc<QueueManager> {
        let mut config = Config::default();
        config.queues = overrides;
        QueueManager::new(&config)
    }

    fn run_ref(dag: &str) -> RunRef {
        RunRef {
            workflow_id: Uuid::now_v7(),
            dag_name: dag.to_string(),
        }
    }

    #[test]
    fn test_effective_max_resolution() {
        let manager = manager(vec![QueueOverride {
            name: "highPriority".to_string(),
            max_concurrency: 2,
        }]);

        // Global override wins over the DAG value
        assert_eq!(manager.effective_max("highPriority", Some(5)), 2);
        // No override: DAG maxActiveRuns
        assert_eq!(manager.effective_max("other", Some(5)), 5);
        // Neither: floor of 1
        assert_eq!(manager.effective_max("other", None), 1);
        // Values below 1 are raised to 1
        assert_eq!(manager.effective_max("other", Some(0)), 1);
    }

    #[tokio::test]
    async fn test_saturation_and_fifo_promotion() {
        let manager = manager(vec![QueueOverride {
            name: "highPriority".to_string(),
            max_concurrency: 2,
        }]);

        let (r1, r2, r3) = (run_ref("d"), run_ref("d"), run_ref("d"));

        let a1 = manager.admit("highPriority", None, r1.clone());
        let a2 = manager.admit("highPriority", None, r2.clone());
        let a3 = manager.admit("highPriority", None, r3.clone());

        let p1 = match a1 {
            Admission::Admitted(p) => p,
            _ => panic!("r1 should be admitted"),
        };
        let _p2 = match a2 {
            Admission::Admitted(p) => p,
            _ => panic!("r2 should be admitted"),
        };
        let pending = match a3 {
            Admission::Queued(p) => p,
            _ => panic!("r3 should be queued"),
        };

        let snapshot = &manager.list()[0];
        assert_eq!(snapshot.running, vec![r1.clone(), r2.clone()]);
        assert_eq!(snapshot.queued, vec![r3.clone()]);

        // Releasing r1 promotes r3
        drop(p1);
        let _p3 = pending.wait().await.unwrap();

        let snapshot = &manager.list()[0];
        assert_eq!(snapshot.running, vec![r2, r3]);
        assert!(snapshot.queued.is_empty());
    }

    #[tokio::test]
    async fn test_running_never_exceeds_cap() {
        let manager = manager(vec![]);
        let mut permits = Vec::new();
        let mut pendings = Vec::new();

        for _ in 0..5 {
            match manager.admit("q", Some(2), run_ref("d")) {
                Admission::Admitted(p) => permits.push(p),
                Admission::Queued(p) => pendings.push(p),
            }
        }

        let snapshot = &manager.list()[0];
        assert_eq!(snapshot.running.len(), 2);
        assert_eq!(snapshot.queued.len(), 3);
        assert!(snapshot.running.len() <= snapshot.max_concurrency);
    }

    #[tokio::test]
    async fn test_clear_drops_queued_only() {
        let manager = manager(vec![]);
        let admitted = manager.admit("q", Some(1), run_ref("d"));
        let queued = manager.admit("q", Some(1), run_ref("d"));

        let _permit = match admitted {
            Admission::Admitted(p) => p,
            _ => panic!(),
        };
        let pending = match queued {
            Admission::Queued(p) => p,
            _ => panic!(),
        };

        let cleared = manager.clear("q");
        assert_eq!(cleared.len(), 1);
        assert!(matches!(pending.wait().await, Err(QueueError::Cleared)));

        let snapshot = &manager.list()[0];
        assert_eq!(snapshot.running.len(), 1);
        assert!(snapshot.queued.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_pending_is_skipped_on_promotion() {
        let manager = manager(vec![]);
        let a1 = manager.admit("q", Some(1), run_ref("d"));
        let a2 = manager.admit("q", Some(1), run_ref("d"));
        let a3 = manager.admit("q", Some(1), run_ref("d"));

        let p1 = match a1 {
            Admission::Admitted(p) => p,
            _ => panic!(),
        };
        // The first queued run abandons its admission (cancelled)
        match a2 {
            Admission::Queued(pending) => drop(pending),
            _ => panic!(),
        }
        let pending3 = match a3 {
            Admission::Queued(p) => p,
            _ => panic!(),
        };

        drop(p1);
        // Promotion skips the abandoned entry and reaches the third run
        let _p3 = pending3.wait().await.unwrap();
        assert_eq!(manager.list()[0].running.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_queued_entry() {
        let manager = manager(vec![]);
        let _p = match manager.admit("q", Some(1), run_ref("d")) {
            Admission::Admitted(p) => p,
            _ => panic!(),
        };
        let target = run_ref("d");
        let _pending = match manager.admit("q", Some(1), target.clone()) {
            Admission::Queued(p) => p,
            _ => panic!(),
        };

        assert!(manager.remove_queued("q", target.workflow_id));
        assert!(!manager.remove_queued("q", target.workflow_id));
        assert!(manager.list()[0].queued.is_empty());
    }
}
