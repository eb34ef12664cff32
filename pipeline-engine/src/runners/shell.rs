// Command Runner
// Spawns step subprocesses, streams their output and kills them on cancellation

use crate::definition::Program;
use crate::error::ExecutionError;
use crate::execution::result::StepResult;

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long to keep draining output after the process is gone
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Shell executable and arguments used for script commands
fn shell_command() -> (&'static str, &'static [&'static str]) {
    if cfg!(target_os = "windows") {
        ("cmd", &["/C"])
    } else {
        ("sh", &["-c"])
    }
}

/// How the process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Ran to completion (exit code may be missing if a signal killed it)
    Exited,
    /// Killed because the cancellation token fired
    Cancelled,
    /// Never started
    SpawnFailed(String),
}

/// Output collected during command execution
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub termination: Termination,
}

impl CommandOutput {
    fn spawn_failed(message: String) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            termination: Termination::SpawnFailed(message),
        }
    }

    pub fn success(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == Some(0)
    }

    /// The error this output represents, if any
    pub fn error(&self) -> Option<ExecutionError> {
        match &self.termination {
            Termination::SpawnFailed(message) => Some(ExecutionError::Spawn {
                message: message.clone(),
            }),
            Termination::Cancelled => Some(ExecutionError::Cancelled),
            Termination::Exited => match self.exit_code {
                Some(0) => None,
                Some(exit_code) => Some(ExecutionError::Command { exit_code }),
                None => Some(ExecutionError::Terminated),
            },
        }
    }

    /// Copy output and outcome into a step result
    pub fn apply_to(self, result: &mut StepResult) {
        if let Some(error) = self.error() {
            result.fail(error);
        }
        result.exit_code = self.exit_code;
        result.stdout = self.stdout;
        result.stderr = self.stderr;
    }
}

/// Callback for handling output lines in real-time; the flag marks stderr
pub type OutputCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Runs step commands as subprocesses
#[derive(Debug, Clone, Default)]
pub struct CommandRunner;

impl CommandRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run a program to completion or until `cancel` fires.
    ///
    /// `env` is layered on top of the engine's own environment.
    pub async fn run(
        &self,
        program: &Program,
        env: &HashMap<String, String>,
        working_dir: &Path,
        cancel: &CancellationToken,
        on_output: Option<OutputCallback>,
    ) -> CommandOutput {
        let mut cmd = match program {
            Program::Script(script) => {
                let (shell_cmd, shell_args) = shell_command();
                let mut cmd = Command::new(shell_cmd);
                cmd.args(shell_args);
                cmd.arg(script);
                cmd
            }
            Program::Argv(argv) => match argv.split_first() {
                Some((program, args)) => {
                    let mut cmd = Command::new(program);
                    cmd.args(args);
                    cmd
                }
                None => return CommandOutput::spawn_failed("empty command".to_string()),
            },
        };

        cmd.current_dir(working_dir);
        cmd.envs(env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        // Own process group, so cancellation reaches grandchildren too
        #[cfg(unix)]
        cmd.process_group(0);

        if cancel.is_cancelled() {
            return CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: None,
                termination: Termination::Cancelled,
            };
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return CommandOutput::spawn_failed(format!("'{}': {}", program, e));
            }
        };

        let stdout_handle = child
            .stdout
            .take()
            .map(|out| spawn_reader(out, false, on_output.clone()));
        let stderr_handle = child
            .stderr
            .take()
            .map(|err| spawn_reader(err, true, on_output));

        let (exit_code, termination) = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => (status.code(), Termination::Exited),
                Err(e) => (None, Termination::SpawnFailed(e.to_string())),
            },
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                (None, Termination::Cancelled)
            }
        };

        CommandOutput {
            stdout: drain(stdout_handle).await,
            stderr: drain(stderr_handle).await,
            exit_code,
            termination,
        }
    }
}

fn spawn_reader<R>(
    reader: R,
    is_error: bool,
    on_output: Option<OutputCallback>,
) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut output = String::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "stopped reading command output");
                    break;
                }
            }

            // Output is not required to be UTF-8
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(callback) = &on_output {
                callback(line, is_error);
            }
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(line);
        }
        output
    })
}

async fn drain(handle: Option<JoinHandle<String>>) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };

    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut handle).await {
        Ok(output) => output.unwrap_or_default(),
        Err(_) => {
            // Something outside the process group still holds the pipe
            handle.abort();
            String::new()
        }
    }
}

/// Kill the child's whole process group and reap it
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: kill(2) has no memory-safety preconditions; a negative pid
            // addresses the process group created with `process_group(0)`.
            unsafe {
                libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
            }
        }
    }

    let _ = child.kill().await;
}
