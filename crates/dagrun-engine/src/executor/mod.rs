//! Step executors
//!
//! Executors are polymorphic over a uniform prepare/start/signal/wait
//! surface. The node state machine owns retries, repeats, and continue-on
//! policies; an executor only runs one attempt of one step and reports its
//! [`Outcome`]. Variants share output-capture plumbing by composition, not
//! inheritance.

mod command;
mod http;
mod subdag;

pub use command::CommandExecutor;
pub use http::HttpExecutor;
pub use subdag::SubdagExecutor;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use dagrun_core::{ExecutorSpec, ParamSet, Step};

use crate::context::EngineContext;

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Step defines no way to execute (no command, script, or executor)
    #[error("step {0} has nothing to execute")]
    NothingToRun(String),

    /// Child process could not be spawned
    #[error("failed to spawn process: {0}")]
    Spawn(std::io::Error),

    /// Signal delivery failed
    #[error("failed to signal process: {0}")]
    Signal(String),

    /// Lifecycle misuse; prepare/start/wait were called out of order
    #[error("executor is not in a startable state")]
    NotPrepared,

    /// HTTP request construction failed
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Sub-DAG definition could not be loaded
    #[error("sub-dag error: {0}")]
    Subdag(String),

    /// File I/O (redirection targets, working directories)
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of one step attempt
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    /// Process exit code; `None` when terminated by a signal or when the
    /// executor failed before producing one
    pub exit_code: Option<i32>,

    /// Captured stdout, present iff the step declares an output variable;
    /// truncated to the configured cap
    pub stdout: Option<String>,

    /// Bounded stderr tail, for logs and error reporting
    pub stderr: String,

    /// Wall-clock duration of the attempt
    pub duration: Duration,

    /// Executor-level failure, distinct from a nonzero exit
    pub error: Option<String>,
}

impl Outcome {
    /// Whether the attempt succeeded.
    pub fn ok(&self) -> bool {
        self.error.is_none() && self.exit_code == Some(0)
    }

    /// An outcome representing an executor-level failure.
    pub fn from_error(error: impl std::fmt::Display, duration: Duration) -> Self {
        Self {
            exit_code: None,
            stdout: None,
            stderr: String::new(),
            duration,
            error: Some(error.to_string()),
        }
    }
}

/// Identity of the run a step belongs to
///
/// Sub-DAG calls use these as back references; hierarchy traversal is
/// always by id and lookup, never by ownership.
#[derive(Debug, Clone)]
pub struct RunIds {
    pub dag_name: String,
    pub workflow_id: uuid::Uuid,
    pub root_workflow_id: uuid::Uuid,
}

/// Expansion context handed to executors
///
/// All `$` references in commands, scripts, URLs, and bodies are resolved
/// against the run's parameters plus outputs captured by upstream steps.
#[derive(Clone)]
pub struct ExecContext {
    pub run: RunIds,

    pub params: ParamSet,

    /// Outputs captured by completed upstream steps
    pub outputs: BTreeMap<String, String>,

    /// Cap on captured output, in bytes
    pub capture_limit: usize,

    /// Whether stdout should be captured into the outcome
    pub capture_stdout: bool,

    /// Redirection targets from the step definition
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
}

impl ExecContext {
    /// Expand `$` references against parameters and captured outputs.
    pub fn expand(&self, input: &str) -> String {
        self.params.expand_with(input, &self.outputs)
    }

    /// Environment exported to child processes.
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = self.params.as_env();
        env.extend(self.outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

/// Uniform executor surface
///
/// Lifecycle: `prepare` resolves the work, `start` begins it, `wait` blocks
/// until the outcome, and `signal` interrupts a started execution. An
/// executor runs exactly one attempt; the node state machine constructs a
/// fresh one per retry or repetition.
#[async_trait]
pub trait Executor: Send {
    /// Resolve commands, requests, or child definitions against the context.
    async fn prepare(&mut self, ctx: &ExecContext) -> Result<(), ExecError>;

    /// Begin execution. Returns once the work is underway.
    async fn start(&mut self) -> Result<(), ExecError>;

    /// Deliver a signal to the running execution.
    ///
    /// SIGKILL (and anything on platforms without signals) forces
    /// termination.
    async fn signal(&mut self, signal: i32) -> Result<(), ExecError>;

    /// Wait for the attempt to finish.
    async fn wait(&mut self) -> Result<Outcome, ExecError>;
}

/// Select an executor for a step.
pub fn build_executor(
    step: &Step,
    engine: &EngineContext,
) -> Result<Box<dyn Executor>, ExecError> {
    // `run:` is shorthand for a sub-DAG call
    if let Some(path) = &step.run {
        return Ok(Box::new(SubdagExecutor::new(
            step.clone(),
            path.clone(),
            None,
            engine.clone(),
        )));
    }

    match &step.executor {
        Some(ExecutorSpec::Http {
            url,
            method,
            headers,
            body,
            timeout_sec,
        }) => Ok(Box::new(HttpExecutor::new(
            url.clone(),
            method.clone(),
            headers.clone(),
            body.clone(),
            timeout_sec.map(Duration::from_secs),
        ))),
        Some(ExecutorSpec::Subdag {
            path,
            dispatch_timeout_sec,
        }) => Ok(Box::new(SubdagExecutor::new(
            step.clone(),
            path.clone(),
            dispatch_timeout_sec.map(Duration::from_secs),
            engine.clone(),
        ))),
        Some(ExecutorSpec::Command { shell }) => {
            Ok(Box::new(CommandExecutor::new(step.clone(), shell.clone())))
        }
        None if step.command.is_some() || step.script.is_some() => {
            Ok(Box::new(CommandExecutor::new(step.clone(), None)))
        }
        None => Err(ExecError::NothingToRun(step.name.clone())),
    }
}

#[cfg(test)]
pub(crate) fn test_exec_context(params: ParamSet, capture_stdout: bool) -> ExecContext {
    ExecContext {
        run: RunIds {
            dag_name: "test".to_string(),
            workflow_id: uuid::Uuid::now_v7(),
            root_workflow_id: uuid::Uuid::now_v7(),
        },
        params,
        outputs: BTreeMap::new(),
        capture_limit: 1024,
        capture_stdout,
        stdout_path: None,
        stderr_path: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn engine() -> EngineContext {
        EngineContext::new(
            Arc::new(dagrun_storage::InMemoryRunStore::new()),
            Arc::new(dagrun_core::Config::default()),
        )
    }

    #[test]
    fn test_outcome_ok() {
        let ok = Outcome {
            exit_code: Some(0),
            ..Outcome::default()
        };
        assert!(ok.ok());

        let failed = Outcome {
            exit_code: Some(1),
            ..Outcome::default()
        };
        assert!(!failed.ok());

        let errored = Outcome::from_error("boom", Duration::ZERO);
        assert!(!errored.ok());
    }

    #[test]
    fn test_build_selects_command() {
        let step = Step::command("a", "echo hi");
        assert!(build_executor(&step, &engine()).is_ok());
    }

    #[test]
    fn test_build_rejects_empty_step() {
        let mut step = Step::command("a", "x");
        step.command = None;
        let err = match build_executor(&step, &engine()) {
            Err(e) => e,
            Ok(_) => panic!("expected build_executor to fail"),
        };
        assert!(matches!(err, ExecError::NothingToRun(name) if name == "a"));
    }

    #[test]
    fn test_exec_context_expansion_prefers_outputs() {
        let mut ctx = test_exec_context(ParamSet::parse("RESULT=0 foo"), false);
        ctx.outputs
            .insert("RESULT".to_string(), "42".to_string());
        assert_eq!(ctx.expand("$RESULT/$1"), "42/foo");
    }
}
