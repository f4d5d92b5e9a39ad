//! Worker-side long-poll client
//!
//! A poller issues long-poll requests against an ordered list of
//! coordinator endpoints. Transport errors are swallowed and retried
//! indefinitely with exponential backoff and jitter (capped at one
//! minute); sustained failure rotates to the next endpoint. Connection
//! state transitions are reported at higher severity than steady-state
//! results.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::task::{DispatchError, PollRequest, PollResponse, Task, TASK_VERSION};

/// Poller configuration
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Coordinator endpoints, tried in order
    pub endpoints: Vec<String>,

    /// Stable worker identity
    pub worker_id: String,

    /// Labels offered to the coordinator for matching
    pub labels: BTreeMap<String, String>,

    /// First retry delay after a failure
    pub initial_backoff: Duration,

    /// Backoff cap
    pub max_backoff: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,

    /// Jitter factor (0.0-1.0)
    pub jitter: f64,

    /// Consecutive failures before rotating to the next endpoint
    pub rotate_after: u32,

    /// Client-side request timeout; must exceed the coordinator's idle
    /// poll timeout
    pub request_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:8090".to_string()],
            worker_id: format!("worker-{}", Uuid::now_v7()),
            labels: BTreeMap::new(),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: 0.1,
            rotate_after: 3,
            request_timeout: Duration::from_secs(90),
        }
    }
}

impl PollerConfig {
    /// Create a configuration for the given endpoints.
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            ..Default::default()
        }
    }

    /// Set the worker id.
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set the offered labels.
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Set the backoff cap.
    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    /// Set the jitter factor (0.0-1.0).
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }
}

/// Connection-state tracking
///
/// `connected → disconnected` on any failed call; `disconnected →
/// connected` on the first success.
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    pub is_connected: bool,
    pub consecutive_fails: u32,
    pub last_error: Option<String>,
}

/// Long-poll client for one worker
pub struct Poller {
    config: PollerConfig,
    client: reqwest::Client,
    state: ConnectionState,
    endpoint_index: usize,
    backoff: Duration,
}

impl Poller {
    /// Create a poller.
    pub fn new(config: PollerConfig) -> Result<Self, DispatchError> {
        if config.endpoints.is_empty() {
            return Err(DispatchError::NoEndpoints);
        }
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            backoff: config.initial_backoff,
            config,
            client,
            state: ConnectionState::default(),
            endpoint_index: 0,
        })
    }

    /// Current connection state.
    pub fn connection_state(&self) -> &ConnectionState {
        &self.state
    }

    /// The endpoint the next poll will use.
    pub fn current_endpoint(&self) -> &str {
        &self.config.endpoints[self.endpoint_index]
    }

    /// Poll until cancelled, handing each received task to `handler`.
    ///
    /// The handler runs to completion before the next poll; one poller
    /// executes one task at a time. Run several pollers for parallelism.
    pub async fn run<F, Fut>(&mut self, cancel: CancellationToken, mut handler: F)
    where
        F: FnMut(Task) -> Fut,
        Fut: Future<Output = ()>,
    {
        info!(
            worker_id = %self.config.worker_id,
            endpoint = %self.current_endpoint(),
            "poller starting"
        );

        loop {
            if cancel.is_cancelled() {
                debug!(worker_id = %self.config.worker_id, "poller cancelled");
                return;
            }

            let result = tokio::select! {
                res = self.poll_once() => res,
                _ = cancel.cancelled() => return,
            };

            match result {
                Ok(Some(task)) => {
                    info!(
                        worker_id = %self.config.worker_id,
                        workflow = %task.root_workflow_name,
                        workflow_id = %task.workflow_id,
                        "received task"
                    );
                    handler(task).await;
                }
                Ok(None) => {
                    // Idle timeout; poll again immediately
                    trace!(worker_id = %self.config.worker_id, "idle poll");
                }
                Err(_) => {
                    let delay = self.next_backoff();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return,
                    }
                }
            }
        }
    }

    /// One long-poll round trip, updating connection state.
    pub async fn poll_once(&mut self) -> Result<Option<Task>, DispatchError> {
        match self.poll_inner().await {
            Ok(task) => {
                self.record_success();
                Ok(task)
            }
            Err(e) => {
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    async fn poll_inner(&mut self) -> Result<Option<Task>, DispatchError> {
        let endpoint = self.current_endpoint().to_string();
        let request = PollRequest {
            version: TASK_VERSION,
            worker_id: self.config.worker_id.clone(),
            // Fresh per call: each long-poll is its own registration
            poller_id: Uuid::now_v7().to_string(),
            labels: self.config.labels.clone(),
        };

        let response = self
            .client
            .post(format!("{endpoint}/api/v1/coordinator/poll"))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DispatchError::Protocol(format!(
                "poll returned {}",
                response.status()
            )));
        }

        let body: PollResponse = response.json().await?;
        Ok(body.task)
    }

    fn record_success(&mut self) {
        if !self.state.is_connected {
            // First success after a disconnected state
            info!(
                worker_id = %self.config.worker_id,
                endpoint = %self.current_endpoint(),
                "connected to coordinator"
            );
        }
        self.state.is_connected = true;
        self.state.consecutive_fails = 0;
        self.state.last_error = None;
        self.backoff = self.config.initial_backoff;
    }

    fn record_failure(&mut self, error: &DispatchError) {
        if self.state.is_connected {
            // First failure after a connected state
            warn!(
                worker_id = %self.config.worker_id,
                endpoint = %self.current_endpoint(),
                "lost coordinator connection: {error}"
            );
        } else {
            debug!(
                worker_id = %self.config.worker_id,
                fails = self.state.consecutive_fails + 1,
                "poll failed: {error}"
            );
        }
        self.state.is_connected = false;
        self.state.consecutive_fails += 1;
        self.state.last_error = Some(error.to_string());

        if self.config.endpoints.len() > 1
            && self.state.consecutive_fails % self.config.rotate_after == 0
        {
            self.endpoint_index = (self.endpoint_index + 1) % self.config.endpoints.len();
            info!(
                worker_id = %self.config.worker_id,
                endpoint = %self.current_endpoint(),
                "failing over to next coordinator endpoint"
            );
        }
    }

    fn next_backoff(&mut self) -> Duration {
        let current = self.backoff;

        let grown = current.as_secs_f64() * self.config.backoff_multiplier;
        self.backoff = Duration::from_secs_f64(grown).min(self.config.max_backoff);

        if self.config.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let range = current.as_secs_f64() * self.config.jitter;
            let offset = rng.gen_range(-range..=range);
            Duration::from_secs_f64((current.as_secs_f64() + offset).max(0.0))
        } else {
            current
        }
    }
}

/// Client used by agents and controllers to dispatch tasks
pub struct DispatchClient {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl DispatchClient {
    /// Create a client for the given endpoints.
    pub fn new(endpoints: Vec<String>) -> Result<Self, DispatchError> {
        if endpoints.is_empty() {
            return Err(DispatchError::NoEndpoints);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, endpoints })
    }

    /// Dispatch a task, trying each endpoint in order.
    pub async fn dispatch(&self, task: &Task) -> Result<(), DispatchError> {
        let mut last_error = None;
        for endpoint in &self.endpoints {
            let result = self
                .client
                .post(format!("{endpoint}/api/v1/coordinator/dispatch"))
                .json(task)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    last_error = Some(DispatchError::Protocol(format!(
                        "dispatch returned {}",
                        response.status()
                    )));
                }
                Err(e) => last_error = Some(DispatchError::Transport(e)),
            }
            warn!(%endpoint, "dispatch attempt failed, trying next endpoint");
        }
        Err(last_error.unwrap_or(DispatchError::NoEndpoints))
    }
}
