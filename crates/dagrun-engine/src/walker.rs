//! Topological DAG execution
//!
//! The walker owns the primary graph of one run: it dispatches every ready
//! step concurrently (declaration order breaks ties), reclassifies
//! successors as nodes finish, and marks steps whose dependencies can
//! never be satisfied as cancelled. After the primary graph is terminal it
//! runs the matching event handlers sequentially.

use std::collections::HashMap;
use std::sync::Arc;

use dagrun_core::{Dag, NodeSnapshot, NodeStatus, RunStatus, Step};
use parking_lot::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::node::{self, Node, RunContext};

/// Executes the step graph of one run
pub struct Walker {
    dag: Arc<Dag>,

    /// Primary nodes, declaration order
    nodes: Vec<Arc<Node>>,

    /// Handler nodes, appended as handlers run
    handler_nodes: RwLock<Vec<Arc<Node>>>,
}

impl Walker {
    pub fn new(dag: Arc<Dag>) -> Self {
        let nodes = dag
            .steps
            .iter()
            .map(|step| Arc::new(Node::new(step.clone())))
            .collect();
        Self {
            dag,
            nodes,
            handler_nodes: RwLock::new(Vec::new()),
        }
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Snapshots of the primary nodes, declaration order.
    pub fn node_snapshots(&self) -> Vec<NodeSnapshot> {
        self.nodes.iter().map(|n| n.snapshot()).collect()
    }

    /// Snapshots of handler nodes that have started, execution order.
    pub fn handler_snapshots(&self) -> Vec<NodeSnapshot> {
        self.handler_nodes.read().iter().map(|n| n.snapshot()).collect()
    }

    /// Run the primary graph, then the matching event handlers.
    ///
    /// `ctx.cancel` stops the primary graph; `handler_cancel` stops
    /// handlers, which are cancellable the same way primary steps are.
    pub async fn run(&self, ctx: RunContext, handler_cancel: CancellationToken) -> RunStatus {
        let status = self.run_primary(&ctx).await;
        self.run_handlers(status, &ctx, handler_cancel).await;
        status
    }

    async fn run_primary(&self, ctx: &RunContext) -> RunStatus {
        let indices: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.step().name.as_str(), i))
            .collect();

        let mut join: JoinSet<(usize, NodeStatus)> = JoinSet::new();
        let mut dispatched = vec![false; self.nodes.len()];
        let mut walker_error: Option<String> = None;

        loop {
            self.cancel_unreachable(&indices, &dispatched, ctx);

            if !ctx.cancel.is_cancelled() {
                for (idx, node) in self.nodes.iter().enumerate() {
                    if dispatched[idx] || node.status().is_terminal() {
                        continue;
                    }
                    if !self.deps_satisfied(idx, &indices) {
                        continue;
                    }
                    dispatched[idx] = true;
                    debug!(step = %node.step().name, "step ready, dispatching");
                    let node = Arc::clone(node);
                    let node_ctx = ctx.clone();
                    join.spawn(async move {
                        let status = node::run(Arc::clone(&node), node_ctx).await;
                        (idx, status)
                    });
                }
            }

            if self.all_terminal() {
                break;
            }

            match join.join_next().await {
                Some(Ok((idx, status))) => {
                    debug!(
                        step = %self.nodes[idx].step().name,
                        %status,
                        "step finished"
                    );
                }
                Some(Err(e)) => {
                    // A panicked step task is a walker-level failure
                    error!("step task failed: {e}");
                    walker_error = Some(e.to_string());
                }
                None => {
                    if ctx.cancel.is_cancelled() {
                        self.cancel_remaining(ctx);
                        break;
                    }
                    if !self.cancel_unreachable(&indices, &dispatched, ctx) {
                        error!("walker stalled with non-terminal steps");
                        walker_error = Some("walker stalled".to_string());
                        self.cancel_remaining(ctx);
                        break;
                    }
                }
            }
        }

        self.primary_status(ctx.cancel.is_cancelled(), walker_error)
    }

    fn all_terminal(&self) -> bool {
        self.nodes.iter().all(|n| n.status().is_terminal())
    }

    fn deps_satisfied(&self, idx: usize, indices: &HashMap<&str, usize>) -> bool {
        self.nodes[idx].step().depends.iter().all(|dep| {
            indices
                .get(dep.as_str())
                .map(|i| self.nodes[*i].status())
                .is_some_and(|status| status.is_terminal() && status.satisfies_dependency())
        })
    }

    /// Mark steps whose dependencies can never be satisfied as cancelled,
    /// to a fixpoint. Returns whether anything changed.
    fn cancel_unreachable(
        &self,
        indices: &HashMap<&str, usize>,
        dispatched: &[bool],
        ctx: &RunContext,
    ) -> bool {
        let mut changed_any = false;
        loop {
            let mut changed = false;
            for (idx, node) in self.nodes.iter().enumerate() {
                if dispatched[idx] || node.status() != NodeStatus::NotStarted {
                    continue;
                }
                let blocked = node.step().depends.iter().any(|dep| {
                    indices
                        .get(dep.as_str())
                        .map(|i| self.nodes[*i].status())
                        .is_some_and(|status| {
                            status.is_terminal() && !status.satisfies_dependency()
                        })
                });
                if blocked {
                    info!(step = %node.step().name, "upstream failed, step will not run");
                    node.mark_cancelled();
                    changed = true;
                    changed_any = true;
                }
            }
            if !changed {
                break;
            }
        }
        if changed_any {
            ctx.ping();
        }
        changed_any
    }

    /// Cancel everything that never got dispatched.
    fn cancel_remaining(&self, ctx: &RunContext) {
        for node in &self.nodes {
            if !node.status().is_terminal() {
                node.mark_cancelled();
            }
        }
        ctx.ping();
    }

    fn primary_status(&self, cancelled: bool, walker_error: Option<String>) -> RunStatus {
        if walker_error.is_some() {
            return RunStatus::Failed;
        }

        let statuses: Vec<NodeStatus> = self.nodes.iter().map(|n| n.status()).collect();
        if statuses.iter().any(|s| *s == NodeStatus::Failed) {
            RunStatus::Failed
        } else if cancelled || statuses.iter().any(|s| *s == NodeStatus::Cancelled) {
            RunStatus::Cancelled
        } else if statuses.iter().any(|s| *s == NodeStatus::PartialSuccess) {
            RunStatus::PartialSuccess
        } else {
            RunStatus::Succeeded
        }
    }

    /// Run matching handlers sequentially: success/failure/cancel first,
    /// exit always last. Handler failures are logged and never change the
    /// primary status.
    async fn run_handlers(
        &self,
        status: RunStatus,
        ctx: &RunContext,
        handler_cancel: CancellationToken,
    ) {
        let handlers = &self.dag.handlers;
        let all_ok = self
            .nodes
            .iter()
            .all(|n| matches!(n.status(), NodeStatus::Succeeded | NodeStatus::Skipped));
        let any_failed = self
            .nodes
            .iter()
            .any(|n| n.status() == NodeStatus::Failed);

        let mut selected: Vec<&Step> = Vec::new();
        if all_ok && status != RunStatus::Cancelled {
            if let Some(step) = &handlers.on_success {
                selected.push(step);
            }
        }
        if any_failed {
            if let Some(step) = &handlers.on_failure {
                selected.push(step);
            }
        }
        if status == RunStatus::Cancelled {
            if let Some(step) = &handlers.on_cancel {
                selected.push(step);
            }
        }
        if let Some(step) = &handlers.on_exit {
            selected.push(step);
        }

        for step in selected {
            info!(handler = %step.name, "running event handler");
            let node = Arc::new(Node::new(step.clone()));
            self.handler_nodes.write().push(Arc::clone(&node));

            let mut handler_ctx = ctx.clone();
            handler_ctx.cancel = handler_cancel.clone();

            let handler_status = node::run(node, handler_ctx).await;
            if !handler_status.satisfies_dependency() {
                warn!(
                    handler = %step.name,
                    status = %handler_status,
                    "event handler did not succeed"
                );
            }
        }
    }
}
