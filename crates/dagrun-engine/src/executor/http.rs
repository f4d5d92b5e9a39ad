//! HTTP request executor

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ExecContext, ExecError, Executor, Outcome};

/// Default request timeout when the step does not set one
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs a step as one HTTP request
///
/// A 2xx response maps to exit code 0 with the body as captured stdout;
/// any other status maps to the status code as the exit code. Transport
/// failures surface as executor-level errors. Signals abort the in-flight
/// request.
pub struct HttpExecutor {
    url: String,
    method: String,
    headers: BTreeMap<String, String>,
    body: Option<String>,
    timeout: Option<Duration>,

    resolved_url: String,
    resolved_body: Option<String>,
    capture_stdout: bool,
    cancel: CancellationToken,
    request: Option<JoinHandle<Outcome>>,
}

impl HttpExecutor {
    pub fn new(
        url: String,
        method: String,
        headers: BTreeMap<String, String>,
        body: Option<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            url,
            method,
            headers,
            body,
            timeout,
            resolved_url: String::new(),
            resolved_body: None,
            capture_stdout: false,
            cancel: CancellationToken::new(),
            request: None,
        }
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    async fn prepare(&mut self, ctx: &ExecContext) -> Result<(), ExecError> {
        self.resolved_url = ctx.expand(&self.url);
        self.resolved_body = self.body.as_ref().map(|b| ctx.expand(b));
        self.headers = self
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), ctx.expand(v)))
            .collect();
        self.capture_stdout = ctx.capture_stdout;
        Ok(())
    }

    async fn start(&mut self) -> Result<(), ExecError> {
        if self.resolved_url.is_empty() {
            return Err(ExecError::NotPrepared);
        }

        let client = reqwest::Client::builder()
            .timeout(self.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()?;

        let method = reqwest::Method::from_bytes(self.method.to_uppercase().as_bytes())
            .unwrap_or(reqwest::Method::GET);
        let mut request = client.request(method, &self.resolved_url);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &self.resolved_body {
            request = request.body(body.clone());
        }

        let cancel = self.cancel.clone();
        let capture = self.capture_stdout;
        let url = self.resolved_url.clone();
        debug!(%url, "http request started");

        self.request = Some(tokio::spawn(async move {
            let started_at = Instant::now();
            let send = async {
                let response = request.send().await?;
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                Ok::<_, reqwest::Error>((status, body))
            };

            tokio::select! {
                result = send => match result {
                    Ok((status, body)) if status.is_success() => Outcome {
                        exit_code: Some(0),
                        stdout: capture.then_some(body),
                        stderr: String::new(),
                        duration: started_at.elapsed(),
                        error: None,
                    },
                    Ok((status, body)) => Outcome {
                        exit_code: Some(i32::from(status.as_u16())),
                        stdout: capture.then_some(body),
                        stderr: String::new(),
                        duration: started_at.elapsed(),
                        error: Some(format!("http status {status}")),
                    },
                    Err(e) => Outcome::from_error(e, started_at.elapsed()),
                },
                _ = cancel.cancelled() => {
                    Outcome::from_error("request aborted", started_at.elapsed())
                }
            }
        }));
        Ok(())
    }

    async fn signal(&mut self, _signal: i32) -> Result<(), ExecError> {
        // Any signal aborts the in-flight request
        self.cancel.cancel();
        Ok(())
    }

    async fn wait(&mut self) -> Result<Outcome, ExecError> {
        let Some(request) = self.request.as_mut() else {
            return Err(ExecError::NotPrepared);
        };
        let outcome = request
            .await
            .unwrap_or_else(|e| Outcome::from_error(e, Duration::ZERO));
        self.request = None;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagrun_core::ParamSet;

    #[tokio::test]
    async fn test_prepare_expands_url_and_body() {
        let mut executor = HttpExecutor::new(
            "http://example.com/$1".to_string(),
            "POST".to_string(),
            BTreeMap::new(),
            Some("payload=$NAME".to_string()),
            None,
        );
        let ctx = crate::executor::test_exec_context(ParamSet::parse("item NAME=x"), true);

        executor.prepare(&ctx).await.unwrap();
        assert_eq!(executor.resolved_url, "http://example.com/item");
        assert_eq!(executor.resolved_body.as_deref(), Some("payload=x"));
    }

    #[tokio::test]
    async fn test_wait_before_start_is_misuse() {
        let mut executor = HttpExecutor::new(
            "http://example.com".to_string(),
            "GET".to_string(),
            BTreeMap::new(),
            None,
            None,
        );
        assert!(matches!(
            executor.wait().await,
            Err(ExecError::NotPrepared)
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_is_outcome_error() {
        // Nothing listens on this port
        let mut executor = HttpExecutor::new(
            "http://127.0.0.1:1/".to_string(),
            "GET".to_string(),
            BTreeMap::new(),
            None,
            Some(Duration::from_secs(1)),
        );
        let ctx = crate::executor::test_exec_context(ParamSet::default(), false);

        executor.prepare(&ctx).await.unwrap();
        executor.start().await.unwrap();
        let outcome = executor.wait().await.unwrap();
        assert!(!outcome.ok());
        assert!(outcome.error.is_some());
    }
}
