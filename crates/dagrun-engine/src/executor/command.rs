//! Local child-process executor

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use dagrun_core::Step;

use super::{ExecContext, ExecError, Executor, Outcome};

/// Bounded stderr tail kept for error reporting
const STDERR_TAIL_LIMIT: usize = 8 * 1024;

/// Runs a step as a local child process
///
/// `command` lines are split on whitespace into argv; `script` bodies run
/// through the configured shell (`sh` by default). Stdout and stderr are
/// drained concurrently, bounded by the capture cap, and tee'd into the
/// step's redirection targets when configured.
pub struct CommandExecutor {
    step: Step,
    shell: Option<String>,
    argv: Vec<String>,
    env: Vec<(String, String)>,
    capture_stdout: bool,
    capture_limit: usize,
    stdout_path: Option<std::path::PathBuf>,
    stderr_path: Option<std::path::PathBuf>,
    child: Option<Child>,
    stdout_task: Option<JoinHandle<String>>,
    stderr_task: Option<JoinHandle<String>>,
    started_at: Option<Instant>,
}

impl CommandExecutor {
    pub fn new(step: Step, shell: Option<String>) -> Self {
        Self {
            step,
            shell,
            argv: Vec::new(),
            env: Vec::new(),
            capture_stdout: false,
            capture_limit: 0,
            stdout_path: None,
            stderr_path: None,
            child: None,
            stdout_task: None,
            stderr_task: None,
            started_at: None,
        }
    }

    fn pid(&self) -> Option<i32> {
        self.child
            .as_ref()
            .and_then(|c| c.id())
            .map(|id| id as i32)
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn prepare(&mut self, ctx: &ExecContext) -> Result<(), ExecError> {
        self.argv = if let Some(script) = &self.step.script {
            let shell = self.shell.clone().unwrap_or_else(|| "sh".to_string());
            vec![shell, "-c".to_string(), ctx.expand(script)]
        } else if let Some(command) = &self.step.command {
            let expanded = ctx.expand(command);
            let argv: Vec<String> = expanded.split_whitespace().map(String::from).collect();
            if argv.is_empty() {
                return Err(ExecError::NothingToRun(self.step.name.clone()));
            }
            argv
        } else {
            return Err(ExecError::NothingToRun(self.step.name.clone()));
        };

        self.env = ctx.env();
        self.capture_stdout = ctx.capture_stdout;
        self.capture_limit = ctx.capture_limit;
        self.stdout_path = ctx.stdout_path.as_ref().map(|p| ctx.expand(&p.to_string_lossy()).into());
        self.stderr_path = ctx.stderr_path.as_ref().map(|p| ctx.expand(&p.to_string_lossy()).into());
        Ok(())
    }

    async fn start(&mut self) -> Result<(), ExecError> {
        if self.argv.is_empty() {
            return Err(ExecError::NotPrepared);
        }

        let mut command = Command::new(&self.argv[0]);
        command
            .args(&self.argv[1..])
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(ExecError::Spawn)?;
        debug!(step = %self.step.name, pid = ?child.id(), "process started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        self.stdout_task = stdout.map(|pipe| {
            tokio::spawn(drain(pipe, self.capture_limit, self.stdout_path.clone()))
        });
        self.stderr_task = stderr.map(|pipe| {
            tokio::spawn(drain(pipe, STDERR_TAIL_LIMIT, self.stderr_path.clone()))
        });

        self.child = Some(child);
        self.started_at = Some(Instant::now());
        Ok(())
    }

    async fn signal(&mut self, signal: i32) -> Result<(), ExecError> {
        let Some(pid) = self.pid() else {
            // Already reaped; nothing to signal
            return Ok(());
        };

        #[cfg(unix)]
        {
            if let Some(sig) = dagrun_core::signal::to_nix(signal) {
                nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), sig)
                    .map_err(|e| ExecError::Signal(e.to_string()))?;
                return Ok(());
            }
            warn!(signal, "unknown signal number, forcing termination");
        }

        // Windows, or an unknown signal number: forced termination
        if let Some(child) = self.child.as_mut() {
            child.start_kill().map_err(|e| ExecError::Signal(e.to_string()))?;
        }
        Ok(())
    }

    // Re-entrant: a dropped in-flight wait (cancellation racing completion)
    // leaves the child in place, and the next wait resumes it.
    async fn wait(&mut self) -> Result<Outcome, ExecError> {
        let started_at = self.started_at.unwrap_or_else(Instant::now);
        let status = {
            let child = self.child.as_mut().ok_or(ExecError::NotPrepared)?;
            child.wait().await?
        };
        self.child = None;
        let stdout = match self.stdout_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let stderr = match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        let exit_code = status.code();
        let error = if exit_code.is_none() {
            Some("process terminated by signal".to_string())
        } else {
            None
        };

        Ok(Outcome {
            exit_code,
            stdout: self
                .capture_stdout
                .then(|| stdout.trim_end_matches('\n').to_string()),
            stderr,
            duration: started_at.elapsed(),
            error,
        })
    }
}

/// Drain a pipe into a bounded buffer, tee'ing into a redirect file.
async fn drain<R>(mut pipe: R, limit: usize, redirect: Option<std::path::PathBuf>) -> String
where
    R: tokio::io::AsyncRead + Unpin + Send,
{
    let mut file = match &redirect {
        Some(path) => match tokio::fs::File::create(path).await {
            Ok(f) => Some(f),
            Err(e) => {
                warn!(path = %path.display(), "cannot open redirect target: {e}");
                None
            }
        },
        None => None,
    };

    let mut captured: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Some(f) = file.as_mut() {
                    let _ = f.write_all(&chunk[..n]).await;
                }
                if captured.len() < limit {
                    let take = n.min(limit - captured.len());
                    captured.extend_from_slice(&chunk[..take]);
                }
            }
        }
    }
    if let Some(f) = file.as_mut() {
        let _ = f.flush().await;
    }

    String::from_utf8_lossy(&captured).into_owned()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::executor::test_exec_context;
    use dagrun_core::ParamSet;

    fn ctx(capture: bool) -> ExecContext {
        test_exec_context(ParamSet::parse("foo NAME=bar"), capture)
    }

    async fn run(step: Step, ctx: &ExecContext) -> Outcome {
        let mut executor = CommandExecutor::new(step, None);
        executor.prepare(ctx).await.unwrap();
        executor.start().await.unwrap();
        executor.wait().await.unwrap()
    }

    #[tokio::test]
    async fn test_echo_succeeds_and_captures() {
        let step = Step::command("a", "echo hello").with_output("OUT");
        let outcome = run(step, &ctx(true)).await;
        assert!(outcome.ok());
        assert_eq!(outcome.stdout.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_param_expansion_in_command() {
        let step = Step::command("a", "echo $1-$NAME");
        let outcome = run(step, &ctx(true)).await;
        assert_eq!(outcome.stdout.as_deref(), Some("foo-bar"));
    }

    #[tokio::test]
    async fn test_nonzero_exit() {
        let mut step = Step::command("a", "");
        step.command = None;
        step.script = Some("exit 3".to_string());
        let outcome = run(step, &ctx(false)).await;
        assert!(!outcome.ok());
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_capture_truncated_to_limit() {
        let mut step = Step::command("a", "").with_output("OUT");
        step.command = None;
        step.script = Some("printf 'abcdefghij'".to_string());
        let mut small = ctx(true);
        small.capture_limit = 4;

        let outcome = run(step, &small).await;
        assert_eq!(outcome.stdout.as_deref(), Some("abcd"));
    }

    #[tokio::test]
    async fn test_signal_terminates_process() {
        let mut step = Step::command("sleeper", "sleep 30");
        step.signal_on_stop = Some("SIGTERM".to_string());

        let mut executor = CommandExecutor::new(step, None);
        executor.prepare(&ctx(false)).await.unwrap();
        executor.start().await.unwrap();

        executor.signal(dagrun_core::SIGTERM).await.unwrap();
        let outcome = executor.wait().await.unwrap();
        assert!(outcome.exit_code.is_none());
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn test_stdout_redirect() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.txt");

        let step = Step::command("a", "echo redirected");
        let mut c = ctx(false);
        c.stdout_path = Some(target.clone());

        let outcome = run(step, &c).await;
        assert!(outcome.ok());
        assert_eq!(std::fs::read_to_string(target).unwrap(), "redirected\n");
    }
}
