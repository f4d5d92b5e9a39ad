//! Per-step state machine
//!
//! A [`Node`] is the runtime counterpart of a step for one run. [`run`]
//! drives a node to a terminal status: preconditions first, then attempts
//! through the step's executor, honoring the retry, repeat, and
//! continue-on policies. Cancellation is cooperative and delivered at
//! every blocking boundary; a running executor receives `signalOnStop`
//! and, after the cleanup grace, SIGKILL.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dagrun_core::{
    signal_num, Dag, NodeSnapshot, NodeStatus, ParamSet, Precondition, Step, SIGKILL,
};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::EngineContext;
use crate::executor::{build_executor, ExecContext, Executor, Outcome, RunIds};

/// Shared context for all nodes of one run
#[derive(Clone)]
pub struct RunContext {
    pub engine: EngineContext,
    pub dag: Arc<Dag>,
    pub ids: RunIds,
    pub params: ParamSet,

    /// Outputs captured by completed steps, visible to successors
    pub outputs: Arc<RwLock<BTreeMap<String, String>>>,

    /// Cooperative cancellation for this run (or this handler phase)
    pub cancel: CancellationToken,

    /// Pinged on every node transition so the agent persists promptly
    pub transitions: mpsc::UnboundedSender<()>,
}

impl RunContext {
    pub(crate) fn ping(&self) {
        let _ = self.transitions.send(());
    }

    fn exec_context(&self, step: &Step) -> ExecContext {
        ExecContext {
            run: self.ids.clone(),
            params: self.params.clone(),
            outputs: self.outputs.read().clone(),
            capture_limit: self.engine.config.output_capture_limit,
            capture_stdout: step.output.is_some(),
            stdout_path: step.stdout.clone(),
            stderr_path: step.stderr.clone(),
        }
    }
}

#[derive(Debug)]
struct NodeState {
    status: NodeStatus,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    error: Option<String>,
    retry_count: u32,
    done_count: u32,
    output: Option<String>,
}

/// Runtime state of one step for one run
pub struct Node {
    step: Step,
    state: RwLock<NodeState>,
}

impl Node {
    pub fn new(step: Step) -> Self {
        Self {
            step,
            state: RwLock::new(NodeState {
                status: NodeStatus::NotStarted,
                started_at: None,
                finished_at: None,
                exit_code: None,
                error: None,
                retry_count: 0,
                done_count: 0,
                output: None,
            }),
        }
    }

    pub fn step(&self) -> &Step {
        &self.step
    }

    pub fn status(&self) -> NodeStatus {
        self.state.read().status
    }

    pub fn retry_count(&self) -> u32 {
        self.state.read().retry_count
    }

    pub fn done_count(&self) -> u32 {
        self.state.read().done_count
    }

    /// Consistent snapshot for persistence.
    pub fn snapshot(&self) -> NodeSnapshot {
        let state = self.state.read();
        NodeSnapshot {
            name: self.step.name.clone(),
            status: state.status,
            started_at: state.started_at,
            finished_at: state.finished_at,
            exit_code: state.exit_code,
            error: state.error.clone(),
            retry_count: state.retry_count,
            done_count: state.done_count,
            output: state.output.clone(),
        }
    }

    fn set_running(&self) {
        let mut state = self.state.write();
        state.status = NodeStatus::Running;
        if state.started_at.is_none() {
            state.started_at = Some(Utc::now());
        }
    }

    fn mark_skipped(&self, reason: String) {
        let mut state = self.state.write();
        state.status = NodeStatus::Skipped;
        state.error = Some(reason);
        state.finished_at = Some(Utc::now());
    }

    /// Mark a node that never ran as cancelled (unreachable successors,
    /// cancellation before dispatch).
    pub(crate) fn mark_cancelled(&self) {
        let mut state = self.state.write();
        state.status = NodeStatus::Cancelled;
        state.finished_at = Some(Utc::now());
    }

    fn record_success(&self, outcome: &Outcome) {
        let mut state = self.state.write();
        state.status = NodeStatus::Succeeded;
        state.exit_code = outcome.exit_code;
        state.error = None;
        state.done_count += 1;
        state.finished_at = Some(Utc::now());
        if let Some(stdout) = &outcome.stdout {
            state.output = Some(stdout.clone());
        }
    }

    fn set_waiting_for_retry(&self, outcome: &Outcome) {
        let mut state = self.state.write();
        state.status = NodeStatus::Waiting;
        state.exit_code = outcome.exit_code;
        state.error = outcome.error.clone();
        state.retry_count += 1;
    }

    fn finish(&self, status: NodeStatus, outcome: Option<&Outcome>) {
        let mut state = self.state.write();
        state.status = status;
        state.finished_at = Some(Utc::now());
        if let Some(outcome) = outcome {
            state.exit_code = outcome.exit_code;
            state.error = outcome
                .error
                .clone()
                .or_else(|| outcome.exit_code.map(|c| format!("exit code {c}")));
        }
    }
}

/// First unmet precondition, if any, with its reason.
///
/// Conditions evaluate in declaration order against the run's parameters
/// and captured outputs; the reason names the unexpanded expression.
pub(crate) fn unmet_precondition(
    conditions: &[Precondition],
    params: &ParamSet,
    outputs: &BTreeMap<String, String>,
) -> Option<String> {
    for condition in conditions {
        let actual = params.expand_with(&condition.condition, outputs);
        let expected = params.expand_with(&condition.expected, outputs);
        if actual != expected {
            return Some(format!("{} != {}", condition.condition, condition.expected));
        }
    }
    None
}

enum Attempt {
    Finished(Outcome),
    Cancelled,
}

/// Drive one node to a terminal status.
pub async fn run(node: Arc<Node>, ctx: RunContext) -> NodeStatus {
    let step = node.step().clone();

    {
        let outputs = ctx.outputs.read().clone();
        if let Some(reason) = unmet_precondition(&step.preconditions, &ctx.params, &outputs) {
            debug!(step = %step.name, %reason, "precondition unmet, skipping");
            node.mark_skipped(reason);
            ctx.ping();
            return NodeStatus::Skipped;
        }
    }

    loop {
        if ctx.cancel.is_cancelled() {
            node.finish(NodeStatus::Cancelled, None);
            ctx.ping();
            return NodeStatus::Cancelled;
        }

        node.set_running();
        ctx.ping();

        let outcome = match run_attempt(&ctx, &step).await {
            Attempt::Finished(outcome) => outcome,
            Attempt::Cancelled => {
                node.finish(NodeStatus::Cancelled, None);
                ctx.ping();
                return NodeStatus::Cancelled;
            }
        };

        append_outcome_log(&ctx, &step.name, &outcome).await;

        if outcome.ok() {
            node.record_success(&outcome);
            if let (Some(var), Some(stdout)) = (&step.output, &outcome.stdout) {
                ctx.outputs.write().insert(var.clone(), stdout.clone());
            }
            ctx.ping();

            if step.repeat_policy.repeat {
                let interval = Duration::from_secs(step.repeat_policy.interval_sec);
                tokio::select! {
                    _ = tokio::time::sleep(interval) => continue,
                    _ = ctx.cancel.cancelled() => {
                        // The completed iteration stands; stop only ends
                        // the repetition.
                        return NodeStatus::Succeeded;
                    }
                }
            }
            return NodeStatus::Succeeded;
        }

        let retry = &step.retry_policy;
        if node.retry_count() < retry.limit && retry.retries(outcome.exit_code) {
            node.set_waiting_for_retry(&outcome);
            ctx.ping();
            debug!(
                step = %step.name,
                retry = node.retry_count(),
                limit = retry.limit,
                "attempt failed, retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(retry.interval_sec)) => continue,
                _ = ctx.cancel.cancelled() => {
                    node.finish(NodeStatus::Cancelled, Some(&outcome));
                    ctx.ping();
                    return NodeStatus::Cancelled;
                }
            }
        }

        let status = if step.continue_on.absorbs(outcome.exit_code) {
            NodeStatus::PartialSuccess
        } else {
            NodeStatus::Failed
        };
        node.finish(status, Some(&outcome));
        ctx.ping();
        return status;
    }
}

/// One attempt through the executor, cancel-aware.
async fn run_attempt(ctx: &RunContext, step: &Step) -> Attempt {
    let started = Instant::now();

    let mut executor = match build_executor(step, &ctx.engine) {
        Ok(executor) => executor,
        Err(e) => return Attempt::Finished(Outcome::from_error(e, started.elapsed())),
    };

    let exec_ctx = ctx.exec_context(step);
    if let Err(e) = executor.prepare(&exec_ctx).await {
        return Attempt::Finished(Outcome::from_error(e, started.elapsed()));
    }
    if let Err(e) = executor.start().await {
        return Attempt::Finished(Outcome::from_error(e, started.elapsed()));
    }

    let waited = {
        let wait = executor.wait();
        tokio::pin!(wait);
        tokio::select! {
            res = &mut wait => Some(res),
            _ = ctx.cancel.cancelled() => None,
        }
    };

    match waited {
        Some(result) => Attempt::Finished(
            result.unwrap_or_else(|e| Outcome::from_error(e, started.elapsed())),
        ),
        None => {
            stop_executor(ctx, step, executor.as_mut()).await;
            Attempt::Cancelled
        }
    }
}

/// Deliver `signalOnStop`, wait out the cleanup grace, then escalate.
async fn stop_executor(ctx: &RunContext, step: &Step, executor: &mut dyn Executor) {
    let signal_name = step.signal_on_stop.as_deref().unwrap_or("SIGTERM");
    let signal = signal_num(signal_name);
    info!(step = %step.name, signal = signal_name, "stopping running step");

    if let Err(e) = executor.signal(signal).await {
        warn!(step = %step.name, "signal delivery failed: {e}");
    }

    match tokio::time::timeout(ctx.dag.max_cleanup_time(), executor.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!(step = %step.name, "cleanup grace elapsed, escalating to SIGKILL");
            let _ = executor.signal(SIGKILL).await;
            let _ = executor.wait().await;
        }
    }
}

/// Append an attempt's result to the step log.
async fn append_outcome_log(ctx: &RunContext, step: &str, outcome: &Outcome) {
    let mut entry = String::new();
    if let Some(stdout) = &outcome.stdout {
        if !stdout.is_empty() {
            entry.push_str(stdout);
            entry.push('\n');
        }
    }
    if !outcome.stderr.is_empty() {
        entry.push_str(&outcome.stderr);
        entry.push('\n');
    }
    entry.push_str(&match (outcome.exit_code, &outcome.error) {
        (_, Some(error)) => format!("error: {error}"),
        (Some(code), None) => format!("exit: {code}"),
        (None, None) => "exit: unknown".to_string(),
    });

    if let Err(e) = ctx
        .engine
        .store
        .append_step_log(&ctx.ids.dag_name, ctx.ids.workflow_id, step, &entry)
        .await
    {
        // Degraded but not fatal; snapshot persistence is what matters
        warn!(step, "step log write failed: {e}");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use dagrun_core::{Config, ContinueOn, RepeatPolicy, RetryPolicy};
    use dagrun_storage::InMemoryRunStore;
    use uuid::Uuid;

    fn run_context(dag: Dag, params: &str) -> RunContext {
        let (tx, _rx) = mpsc::unbounded_channel();
        let workflow_id = Uuid::now_v7();
        RunContext {
            engine: EngineContext::new(
                Arc::new(InMemoryRunStore::new()),
                Arc::new(Config::default()),
            ),
            dag: Arc::new(dag.clone()),
            ids: RunIds {
                dag_name: dag.name.clone(),
                workflow_id,
                root_workflow_id: workflow_id,
            },
            params: ParamSet::parse(params),
            outputs: Arc::new(RwLock::new(BTreeMap::new())),
            cancel: CancellationToken::new(),
            transitions: tx,
        }
    }

    fn dag_with(step: Step) -> Dag {
        Dag::new("node-test", vec![step])
    }

    #[tokio::test]
    async fn test_success_path() {
        let step = Step::command("a", "echo ok").with_output("OUT");
        let ctx = run_context(dag_with(step.clone()), "");
        let node = Arc::new(Node::new(step));

        let status = run(Arc::clone(&node), ctx.clone()).await;
        assert_eq!(status, NodeStatus::Succeeded);
        assert_eq!(node.done_count(), 1);
        assert_eq!(ctx.outputs.read().get("OUT").map(String::as_str), Some("ok"));

        let snapshot = node.snapshot();
        assert!(snapshot.started_at.unwrap() <= snapshot.finished_at.unwrap());
    }

    #[tokio::test]
    async fn test_precondition_skip_reason() {
        let mut step = Step::command("a", "echo never");
        step.preconditions = vec![Precondition {
            condition: "$1".to_string(),
            expected: "foo".to_string(),
        }];
        let ctx = run_context(dag_with(step.clone()), "bar");
        let node = Arc::new(Node::new(step));

        let status = run(Arc::clone(&node), ctx).await;
        assert_eq!(status, NodeStatus::Skipped);
        assert_eq!(node.snapshot().error.as_deref(), Some("$1 != foo"));
    }

    #[tokio::test]
    async fn test_no_retries_fails() {
        let mut step = Step::command("a", "false");
        step.retry_policy = RetryPolicy {
            limit: 0,
            interval_sec: 0,
            exit_codes: None,
        };
        let ctx = run_context(dag_with(step.clone()), "");
        let node = Arc::new(Node::new(step));

        let status = run(Arc::clone(&node), ctx).await;
        assert_eq!(status, NodeStatus::Failed);
        assert_eq!(node.retry_count(), 0);
        assert_eq!(node.snapshot().exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_retries_then_fails() {
        let mut step = Step::command("a", "false");
        step.retry_policy = RetryPolicy {
            limit: 2,
            interval_sec: 0,
            exit_codes: None,
        };
        let ctx = run_context(dag_with(step.clone()), "");
        let node = Arc::new(Node::new(step));

        let status = run(Arc::clone(&node), ctx).await;
        assert_eq!(status, NodeStatus::Failed);
        // Two retries beyond the first attempt
        assert_eq!(node.retry_count(), 2);
    }

    #[tokio::test]
    async fn test_retry_respects_exit_code_filter() {
        let mut step = Step::command("a", "false");
        step.retry_policy = RetryPolicy {
            limit: 5,
            interval_sec: 0,
            exit_codes: Some(vec![75]),
        };
        let ctx = run_context(dag_with(step.clone()), "");
        let node = Arc::new(Node::new(step));

        // Exit 1 is not in the retryable set: fail immediately
        let status = run(Arc::clone(&node), ctx).await;
        assert_eq!(status, NodeStatus::Failed);
        assert_eq!(node.retry_count(), 0);
    }

    #[tokio::test]
    async fn test_continue_on_failure_is_partial_success() {
        let mut step = Step::command("a", "false");
        step.continue_on = ContinueOn {
            failure: true,
            ..ContinueOn::default()
        };
        let ctx = run_context(dag_with(step.clone()), "");
        let node = Arc::new(Node::new(step));

        let status = run(Arc::clone(&node), ctx).await;
        assert_eq!(status, NodeStatus::PartialSuccess);
        assert!(status.satisfies_dependency());
    }

    #[tokio::test]
    async fn test_repeat_increments_done_count_until_cancel() {
        let mut step = Step::command("a", "echo tick");
        step.repeat_policy = RepeatPolicy {
            repeat: true,
            interval_sec: 0,
        };
        let ctx = run_context(dag_with(step.clone()), "");
        let node = Arc::new(Node::new(step));

        let cancel = ctx.cancel.clone();
        let task = tokio::spawn(run(Arc::clone(&node), ctx));
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();

        // Cancellation may land between iterations (Succeeded stands) or
        // mid-attempt (Cancelled); either way the loop must have produced
        // completions without blocking.
        let status = task.await.unwrap();
        assert!(matches!(
            status,
            NodeStatus::Succeeded | NodeStatus::Cancelled
        ));
        assert!(node.done_count() >= 1, "repeat should have completed at least once");
    }

    #[tokio::test]
    async fn test_cancel_running_step() {
        let mut step = Step::command("sleeper", "sleep 30");
        step.signal_on_stop = Some("SIGTERM".to_string());
        let ctx = run_context(dag_with(step.clone()), "");
        let node = Arc::new(Node::new(step));

        let cancel = ctx.cancel.clone();
        let task = tokio::spawn(run(Arc::clone(&node), ctx));
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();

        let status = task.await.unwrap();
        assert_eq!(status, NodeStatus::Cancelled);
        let snapshot = node.snapshot();
        assert!(snapshot.started_at.unwrap() <= snapshot.finished_at.unwrap());
    }
}
