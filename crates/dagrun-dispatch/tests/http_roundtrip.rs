//! Coordinator and poller over real HTTP
//!
//! Exercises the long-poll transport end to end: dispatch-then-poll,
//! poll-then-dispatch, label routing, and idle timeouts, with the
//! coordinator served by axum on an ephemeral port.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dagrun_core::{Dag, Step};
use dagrun_dispatch::{
    Coordinator, CoordinatorConfig, DispatchClient, Poller, PollerConfig, Task,
};
use uuid::Uuid;

async fn serve(poll_timeout: Duration) -> (Arc<Coordinator>, String) {
    let coordinator = Arc::new(Coordinator::new(CoordinatorConfig { poll_timeout }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = Arc::clone(&coordinator).router();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (coordinator, format!("http://{addr}"))
}

fn task(labels: &[(&str, &str)]) -> Task {
    let mut dag = Dag::new("remote-demo", vec![Step::command("a", "echo hi")]);
    dag.worker_selector = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Task::from_run(dag, Uuid::now_v7(), "")
}

fn poller(endpoint: &str, labels: &[(&str, &str)]) -> Poller {
    let labels: BTreeMap<String, String> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Poller::new(
        PollerConfig::new(vec![endpoint.to_string()])
            .with_worker_id("test-worker")
            .with_labels(labels),
    )
    .unwrap()
}

#[tokio::test]
async fn test_dispatch_then_poll_round_trip() {
    let (_coordinator, endpoint) = serve(Duration::from_secs(5)).await;

    let client = DispatchClient::new(vec![endpoint.clone()]).unwrap();
    let sent = task(&[]);
    let expected_id = sent.workflow_id;
    client.dispatch(&sent).await.unwrap();

    let mut poller = poller(&endpoint, &[]);
    let received = poller.poll_once().await.unwrap().unwrap();
    assert_eq!(received.workflow_id, expected_id);
    assert_eq!(received.definition.name, "remote-demo");
}

#[tokio::test]
async fn test_poll_then_dispatch_delivers_to_waiter() {
    let (coordinator, endpoint) = serve(Duration::from_secs(5)).await;

    let mut poller = poller(&endpoint, &[]);
    let poll = tokio::spawn(async move { poller.poll_once().await });

    // Wait until the long-poll has registered
    for _ in 0..50 {
        if coordinator.waiter_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(coordinator.waiter_count(), 1);

    let client = DispatchClient::new(vec![endpoint]).unwrap();
    let sent = task(&[]);
    let expected_id = sent.workflow_id;
    client.dispatch(&sent).await.unwrap();

    let received = poll.await.unwrap().unwrap().unwrap();
    assert_eq!(received.workflow_id, expected_id);
    assert_eq!(coordinator.pending_count(), 0);
}

#[tokio::test]
async fn test_label_mismatch_parks_until_matching_poller() {
    let (coordinator, endpoint) = serve(Duration::from_millis(300)).await;

    // Only a non-matching poller is waiting
    let mut wrong = poller(&endpoint, &[("gpu", "no")]);
    let wrong_poll = tokio::spawn(async move { wrong.poll_once().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let client = DispatchClient::new(vec![endpoint.clone()]).unwrap();
    client.dispatch(&task(&[("gpu", "yes")])).await.unwrap();
    assert_eq!(coordinator.pending_count(), 1);

    // The mismatched poller times out empty
    assert!(wrong_poll.await.unwrap().unwrap().is_none());

    // A matching poller receives the parked task immediately
    let mut matching = poller(&endpoint, &[("gpu", "yes"), ("region", "us")]);
    let received = matching.poll_once().await.unwrap();
    assert!(received.is_some());
    assert_eq!(coordinator.pending_count(), 0);
}

#[tokio::test]
async fn test_idle_poll_times_out_with_no_task() {
    let (_coordinator, endpoint) = serve(Duration::from_millis(200)).await;
    let mut poller = poller(&endpoint, &[]);
    assert!(poller.poll_once().await.unwrap().is_none());
}

#[tokio::test]
async fn test_poller_recovers_after_coordinator_comes_up() {
    // Point at a dead endpoint first: transport errors, not panics
    let mut poller = poller("http://127.0.0.1:1", &[]);
    assert!(poller.poll_once().await.is_err());
    assert!(!poller.connection_state().is_connected);
    assert_eq!(poller.connection_state().consecutive_fails, 1);
}
