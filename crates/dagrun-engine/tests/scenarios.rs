//! End-to-end run scenarios against the file-backed store

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use dagrun_core::{Config, Dag, NodeStatus, ParamSet, Precondition, RetryPolicy, RunStatus, Step};
use dagrun_engine::{Agent, EngineContext};
use dagrun_storage::{FileRunStore, RunStore};

fn engine(data_dir: &std::path::Path, dag_dir: &std::path::Path) -> EngineContext {
    EngineContext::new(
        Arc::new(FileRunStore::new(data_dir)),
        Arc::new(Config::default()),
    )
    .with_dag_dir(dag_dir)
}

#[tokio::test]
async fn test_simple_chain_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let dag = Arc::new(Dag::new(
        "chain",
        vec![
            Step::command("a", "echo A"),
            Step::command("b", "echo B").with_depends("a"),
        ],
    ));

    let engine = engine(dir.path(), dir.path());
    let store = Arc::clone(&engine.store);
    let agent = Agent::new(Arc::clone(&dag), ParamSet::default(), engine);
    let workflow_id = agent.workflow_id();

    let status = agent.run().await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);

    let snapshot = store.find("chain", workflow_id).await.unwrap();
    assert_eq!(snapshot.status, RunStatus::Succeeded);
    let a = snapshot.node("a").unwrap();
    let b = snapshot.node("b").unwrap();
    assert_eq!(a.status, NodeStatus::Succeeded);
    assert_eq!(b.status, NodeStatus::Succeeded);
    assert!(a.finished_at.unwrap() <= b.started_at.unwrap());
}

#[tokio::test]
async fn test_precondition_skip_is_not_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut gated = Step::command("gated", "echo never");
    gated.preconditions = vec![Precondition {
        condition: "$1".to_string(),
        expected: "foo".to_string(),
    }];
    let dag = Arc::new(Dag::new("gated-flow", vec![gated]));

    let engine = engine(dir.path(), dir.path());
    let store = Arc::clone(&engine.store);
    let agent = Agent::new(Arc::clone(&dag), ParamSet::parse("bar"), engine);
    let workflow_id = agent.workflow_id();

    let status = agent.run().await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);

    let snapshot = store.find("gated-flow", workflow_id).await.unwrap();
    let node = snapshot.node("gated").unwrap();
    assert_eq!(node.status, NodeStatus::Skipped);
    assert_eq!(node.error.as_deref(), Some("$1 != foo"));
}

#[tokio::test]
async fn test_zero_retry_failure_ends_failed() {
    let dir = tempfile::tempdir().unwrap();
    let mut step = Step::command("flaky", "false");
    step.retry_policy = RetryPolicy {
        limit: 0,
        interval_sec: 0,
        exit_codes: None,
    };
    let dag = Arc::new(Dag::new("no-retries", vec![step]));

    let engine = engine(dir.path(), dir.path());
    let agent = Agent::new(Arc::clone(&dag), ParamSet::default(), engine);
    let status = agent.run().await.unwrap();
    assert_eq!(status, RunStatus::Failed);
}

#[tokio::test]
async fn test_sub_dag_call_through_run_shorthand() {
    let dir = tempfile::tempdir().unwrap();

    let child = Dag::new("child-flow", vec![Step::command("inner", "echo inner")]);
    std::fs::write(
        dir.path().join("child-flow.json"),
        serde_json::to_string(&child).unwrap(),
    )
    .unwrap();

    let mut call = Step::command("call-child", "unused");
    call.command = None;
    call.run = Some("child-flow.json".into());
    let parent = Arc::new(Dag::new("parent-flow", vec![call]));

    let engine = engine(dir.path(), dir.path());
    let store = Arc::clone(&engine.store);
    let agent = Agent::new(Arc::clone(&parent), ParamSet::default(), engine);
    let parent_id = agent.workflow_id();

    let status = agent.run().await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);

    // The child run exists with a back reference to its parent
    let child_run = store.latest("child-flow").await.unwrap().unwrap();
    assert_eq!(child_run.status, RunStatus::Succeeded);
    assert_eq!(child_run.parent_workflow_id, Some(parent_id));
    assert_eq!(child_run.root_workflow_id, parent_id);
}

#[tokio::test]
async fn test_step_log_files_are_written() {
    let dir = tempfile::tempdir().unwrap();
    let dag = Arc::new(Dag::new(
        "logged",
        vec![Step::command("speak", "echo words-for-the-log").with_output("OUT")],
    ));

    let engine = engine(dir.path(), dir.path());
    let agent = Agent::new(Arc::clone(&dag), ParamSet::default(), engine);
    let workflow_id = agent.workflow_id();
    agent.run().await.unwrap();

    let log_path = dir
        .path()
        .join("logged/runs")
        .join(workflow_id.to_string())
        .join("logs/speak.log");
    let log = std::fs::read_to_string(log_path).unwrap();
    assert!(log.contains("words-for-the-log"));
    assert!(log.contains("exit: 0"));
}
