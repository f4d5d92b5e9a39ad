//! Workflow definition model
//!
//! A [`Dag`] is the immutable definition of a workflow: an ordered list of
//! [`Step`]s with dependencies, per-step policies, optional event handlers,
//! and scheduling metadata. Definitions are loaded from JSON files and
//! validated once at load time; a definition never changes for the lifetime
//! of a run.
//!
//! Field names mirror the definition file format (camelCase), while runtime
//! snapshot types use snake_case.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};

/// Errors raised while loading or validating a definition
#[derive(Debug, thiserror::Error)]
pub enum DagError {
    /// The definition has no steps
    #[error("definition has no steps")]
    EmptySteps,

    /// Two steps share a name
    #[error("duplicate step name: {0}")]
    DuplicateStep(String),

    /// A step depends on a name that does not exist
    #[error("step {step} depends on unknown step {depends_on}")]
    UnknownDependency { step: String, depends_on: String },

    /// The depends relation contains a cycle
    #[error("dependency cycle detected involving step {0}")]
    Cycle(String),

    /// The definition file could not be read
    #[error("failed to read definition: {0}")]
    Io(#[from] std::io::Error),

    /// The definition file is not valid JSON
    #[error("failed to parse definition: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A single precondition: an expression and the value it must resolve to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Precondition {
    /// Expression, expanded against run parameters and captured outputs
    pub condition: String,

    /// Value the expanded expression must equal
    pub expected: String,
}

/// Retry policy for a step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retries beyond the first attempt
    #[serde(default)]
    pub limit: u32,

    /// Seconds to sleep between attempts
    #[serde(default)]
    pub interval_sec: u64,

    /// Exit codes eligible for retry; `None` retries any failure
    #[serde(default)]
    pub exit_codes: Option<Vec<i32>>,
}

impl RetryPolicy {
    /// Whether a failure with this exit code is eligible for retry.
    pub fn retries(&self, exit_code: Option<i32>) -> bool {
        match &self.exit_codes {
            None => true,
            Some(codes) => exit_code.is_some_and(|c| codes.contains(&c)),
        }
    }
}

/// Repeat policy for a step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatPolicy {
    /// Re-run the step after each successful completion
    #[serde(default)]
    pub repeat: bool,

    /// Seconds to sleep between repetitions
    #[serde(default)]
    pub interval_sec: u64,
}

/// Continue-on policy: which non-success outcomes let the run proceed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueOn {
    /// Proceed past any failure of this step
    #[serde(default)]
    pub failure: bool,

    /// Proceed when this step is skipped
    #[serde(default)]
    pub skipped: bool,

    /// Proceed when the step exits with one of these codes
    #[serde(default)]
    pub exit_codes: Vec<i32>,
}

impl ContinueOn {
    /// Whether a failure with this exit code is absorbed by the policy.
    pub fn absorbs(&self, exit_code: Option<i32>) -> bool {
        self.failure || exit_code.is_some_and(|c| self.exit_codes.contains(&c))
    }
}

/// Executor selection for a step
///
/// Tagged variants share a uniform prepare/start/signal/wait surface in the
/// engine. Retry logic never lives here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorSpec {
    /// Local child process (the default when `command` is set)
    Command {
        /// Shell to wrap `script` bodies with; defaults to `sh`
        #[serde(default)]
        shell: Option<String>,
    },

    /// HTTP request
    Http {
        url: String,
        #[serde(default = "default_http_method")]
        method: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<String>,
        /// Request timeout in seconds
        #[serde(default)]
        timeout_sec: Option<u64>,
    },

    /// Run another DAG as a child run
    Subdag {
        /// Definition path, relative to the parent definition's directory
        path: PathBuf,

        /// How long to wait for a remotely dispatched child run before the
        /// step fails, in seconds
        #[serde(default)]
        dispatch_timeout_sec: Option<u64>,
    },
}

fn default_http_method() -> String {
    "GET".to_string()
}

/// One step of a workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Unique name within the DAG
    pub name: String,

    /// Command line to execute (program followed by arguments)
    #[serde(default)]
    pub command: Option<String>,

    /// Inline script body, run through the configured shell
    #[serde(default)]
    pub script: Option<String>,

    /// Executor selection; defaults to a local command process
    #[serde(default)]
    pub executor: Option<ExecutorSpec>,

    /// Names of steps that must reach a dependency-satisfying status first
    #[serde(default)]
    pub depends: Vec<String>,

    /// Evaluated in declaration order; the first unmet one skips the step
    #[serde(default)]
    pub preconditions: Vec<Precondition>,

    #[serde(default)]
    pub retry_policy: RetryPolicy,

    #[serde(default)]
    pub repeat_policy: RepeatPolicy,

    #[serde(default)]
    pub continue_on: ContinueOn,

    /// Signal delivered on stop; defaults to SIGTERM
    #[serde(default)]
    pub signal_on_stop: Option<String>,

    /// Variable name that captures stdout of the step
    #[serde(default)]
    pub output: Option<String>,

    /// Redirect stdout to this file
    #[serde(default)]
    pub stdout: Option<PathBuf>,

    /// Redirect stderr to this file
    #[serde(default)]
    pub stderr: Option<PathBuf>,

    /// Shorthand for a sub-DAG call: path of the child definition
    #[serde(default)]
    pub run: Option<PathBuf>,
}

impl Step {
    /// Minimal step with a command line, for tests and builders.
    pub fn command(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: Some(command.into()),
            script: None,
            executor: None,
            depends: Vec::new(),
            preconditions: Vec::new(),
            retry_policy: RetryPolicy::default(),
            repeat_policy: RepeatPolicy::default(),
            continue_on: ContinueOn::default(),
            signal_on_stop: None,
            output: None,
            stdout: None,
            stderr: None,
            run: None,
        }
    }

    /// Add a dependency on a prior step.
    pub fn with_depends(mut self, name: impl Into<String>) -> Self {
        self.depends.push(name.into());
        self
    }

    /// Capture stdout into the named output variable.
    pub fn with_output(mut self, name: impl Into<String>) -> Self {
        self.output = Some(name.into());
        self
    }
}

/// Event handlers attached to a DAG
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handlers {
    /// Runs iff every primary node succeeded or was skipped
    #[serde(default)]
    pub on_success: Option<Step>,

    /// Runs iff any primary node failed
    #[serde(default)]
    pub on_failure: Option<Step>,

    /// Runs iff the run was cancelled
    #[serde(default)]
    pub on_cancel: Option<Step>,

    /// Always runs last
    #[serde(default)]
    pub on_exit: Option<Step>,
}

/// A workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dag {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Declaration order is the tie-break for concurrently ready steps
    pub steps: Vec<Step>,

    #[serde(default)]
    pub handlers: Handlers,

    /// Named queue gating concurrent runs; defaults to a DAG-based queue
    #[serde(default)]
    pub queue: Option<String>,

    /// Concurrency cap for the DAG-based queue
    #[serde(default)]
    pub max_active_runs: Option<u32>,

    /// Seconds to wait between stop and start during a restart
    #[serde(default)]
    pub restart_wait_sec: u64,

    /// Default positional/named parameters
    #[serde(default)]
    pub params: Vec<String>,

    /// Cron expressions, optionally prefixed with `CRON_TZ=<zone>`
    #[serde(default)]
    pub schedules: Vec<String>,

    /// Run-level preconditions, checked before any step is dispatched
    #[serde(default)]
    pub preconditions: Vec<Precondition>,

    /// A suspended DAG is skipped by the scheduler
    #[serde(default)]
    pub suspended: bool,

    /// Label requirements a worker must carry to execute runs of this DAG.
    /// Empty means the run executes locally (or on any poller when
    /// dispatched).
    #[serde(default)]
    pub worker_selector: BTreeMap<String, String>,

    /// Grace period before stop escalates to SIGKILL, in seconds
    #[serde(default = "default_max_cleanup_sec")]
    pub max_cleanup_sec: u64,

    /// Days of run history to keep
    #[serde(default = "default_hist_retention_days")]
    pub hist_retention_days: u32,
}

fn default_max_cleanup_sec() -> u64 {
    60
}

fn default_hist_retention_days() -> u32 {
    30
}

impl Dag {
    /// Build a definition from steps, for tests and embedded front-ends.
    ///
    /// Alternative authoring front-ends (embedded scripting dialects and
    /// the like) are expected to emit this same canonical structure; the
    /// engine never depends on how a definition was produced.
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps,
            handlers: Handlers::default(),
            queue: None,
            max_active_runs: None,
            restart_wait_sec: 0,
            params: Vec::new(),
            schedules: Vec::new(),
            preconditions: Vec::new(),
            suspended: false,
            worker_selector: BTreeMap::new(),
            max_cleanup_sec: default_max_cleanup_sec(),
            hist_retention_days: default_hist_retention_days(),
        }
    }

    /// Load a definition from a JSON file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DagError> {
        let raw = std::fs::read_to_string(path)?;
        let dag: Self = serde_json::from_str(&raw)?;
        dag.validate()?;
        Ok(dag)
    }

    /// Validate the definition.
    ///
    /// Rejects empty definitions, duplicate step names, unknown dependency
    /// references, and dependency cycles.
    pub fn validate(&self) -> Result<(), DagError> {
        if self.steps.is_empty() {
            return Err(DagError::EmptySteps);
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(DagError::DuplicateStep(step.name.clone()));
            }
        }

        for step in &self.steps {
            for dep in &step.depends {
                if !seen.contains(dep.as_str()) {
                    return Err(DagError::UnknownDependency {
                        step: step.name.clone(),
                        depends_on: dep.clone(),
                    });
                }
            }
        }

        let mut graph = DiGraph::<&str, ()>::new();
        let mut indices = HashMap::new();
        for step in &self.steps {
            let idx = graph.add_node(step.name.as_str());
            indices.insert(step.name.as_str(), idx);
        }
        for step in &self.steps {
            for dep in &step.depends {
                graph.add_edge(indices[dep.as_str()], indices[step.name.as_str()], ());
            }
        }
        if is_cyclic_directed(&graph) {
            // Name a step on some back edge for the error message
            let offender = self
                .steps
                .iter()
                .find(|s| !s.depends.is_empty())
                .map(|s| s.name.clone())
                .unwrap_or_default();
            return Err(DagError::Cycle(offender));
        }

        Ok(())
    }

    /// Look up a step by name.
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Effective restart wait.
    pub fn restart_wait(&self) -> Duration {
        Duration::from_secs(self.restart_wait_sec)
    }

    /// Effective stop-escalation grace period.
    pub fn max_cleanup_time(&self) -> Duration {
        Duration::from_secs(self.max_cleanup_sec)
    }

    /// Event handlers matching an outcome, in execution order.
    pub fn handler_steps(&self) -> &Handlers {
        &self.handlers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> Dag {
        Dag::new(
            "chain",
            vec![
                Step::command("a", "echo A"),
                Step::command("b", "echo B").with_depends("a"),
            ],
        )
    }

    #[test]
    fn test_validate_ok() {
        assert!(chain().validate().is_ok());
    }

    #[test]
    fn test_validate_empty() {
        let dag = Dag::new("empty", vec![]);
        assert!(matches!(dag.validate(), Err(DagError::EmptySteps)));
    }

    #[test]
    fn test_validate_duplicate_names() {
        let dag = Dag::new(
            "dup",
            vec![Step::command("a", "true"), Step::command("a", "false")],
        );
        assert!(matches!(dag.validate(), Err(DagError::DuplicateStep(n)) if n == "a"));
    }

    #[test]
    fn test_validate_unknown_dependency() {
        let dag = Dag::new("bad", vec![Step::command("a", "true").with_depends("ghost")]);
        assert!(matches!(
            dag.validate(),
            Err(DagError::UnknownDependency { depends_on, .. }) if depends_on == "ghost"
        ));
    }

    #[test]
    fn test_validate_cycle() {
        let dag = Dag::new(
            "cyclic",
            vec![
                Step::command("a", "true").with_depends("b"),
                Step::command("b", "true").with_depends("a"),
            ],
        );
        assert!(matches!(dag.validate(), Err(DagError::Cycle(_))));
    }

    #[test]
    fn test_retry_policy_exit_codes() {
        let any = RetryPolicy {
            limit: 2,
            interval_sec: 0,
            exit_codes: None,
        };
        assert!(any.retries(Some(1)));
        assert!(any.retries(None));

        let selective = RetryPolicy {
            limit: 2,
            interval_sec: 0,
            exit_codes: Some(vec![75]),
        };
        assert!(selective.retries(Some(75)));
        assert!(!selective.retries(Some(1)));
        assert!(!selective.retries(None));
    }

    #[test]
    fn test_continue_on_absorbs() {
        let on_failure = ContinueOn {
            failure: true,
            ..ContinueOn::default()
        };
        assert!(on_failure.absorbs(Some(1)));
        assert!(on_failure.absorbs(None));

        let on_codes = ContinueOn {
            exit_codes: vec![3],
            ..ContinueOn::default()
        };
        assert!(on_codes.absorbs(Some(3)));
        assert!(!on_codes.absorbs(Some(1)));
    }

    #[test]
    fn test_definition_round_trip() {
        let mut dag = chain();
        dag.max_active_runs = Some(2);
        dag.schedules = vec!["CRON_TZ=UTC 0 * * * *".to_string()];

        let json = serde_json::to_string(&dag).unwrap();
        assert!(json.contains("maxActiveRuns"));
        let parsed: Dag = serde_json::from_str(&json).unwrap();
        assert_eq!(dag, parsed);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.json");
        std::fs::write(&path, serde_json::to_string(&chain()).unwrap()).unwrap();

        let dag = Dag::load(&path).unwrap();
        assert_eq!(dag.name, "chain");
        assert_eq!(dag.steps.len(), 2);
    }
}
