/// Single subprocess lifecycle: spawn a measurement tool, capture stdout and
/// stderr, enforce a per-invocation timeout, and classify the outcome.
use chrono::{DateTime, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// A command to run: program, arguments, timeout and the exit codes that
/// count as success for this particular tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub success_codes: Vec<i32>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            success_codes: vec![0],
        }
    }

    pub fn with_success_codes(mut self, codes: &[i32]) -> Self {
        self.success_codes = codes.to_vec();
        self
    }

    /// Rendered command line, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How an invocation that actually ran ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Exited within the timeout with one of the tool's success codes.
    Success,
    /// Killed after exceeding the timeout. Output is diagnostic only.
    TimedOut,
    /// Ran to completion but reported failure (non-success exit or signal).
    ToolError,
}

/// One execution of an external tool. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub command: CommandSpec,
    pub outcome: Outcome,
    /// Process exit code (None if killed by signal or timed out).
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl Invocation {
    /// Stdout and stderr joined; several tools print their summary on stderr.
    pub fn combined_output(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Errors that prevent an invocation from happening at all.
#[derive(Debug)]
pub enum InvokeError {
    /// The program does not exist on PATH.
    ToolMissing { program: String },
    /// The program exists but could not be started.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// Failed while waiting on the child.
    Io { source: std::io::Error },
}

impl std::fmt::Display for InvokeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvokeError::ToolMissing { program } => write!(f, "command not found: {program}"),
            InvokeError::Spawn { program, source } => {
                write!(f, "failed to spawn {program}: {source}")
            }
            InvokeError::Io { source } => write!(f, "I/O error while waiting on tool: {source}"),
        }
    }
}

impl std::error::Error for InvokeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InvokeError::ToolMissing { .. } => None,
            InvokeError::Spawn { source, .. } => Some(source),
            InvokeError::Io { source } => Some(source),
        }
    }
}

/// Runs commands. Implemented by [`ProcessInvoker`] and by test doubles.
pub trait Invoke {
    async fn invoke(&self, command: &CommandSpec) -> Result<Invocation, InvokeError>;
}

/// Real subprocess invoker.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessInvoker;

impl Invoke for ProcessInvoker {
    async fn invoke(&self, command: &CommandSpec) -> Result<Invocation, InvokeError> {
        run_command(command).await
    }
}

fn spawn_reader<R>(pipe: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            // Partial output is still useful after a kill.
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    })
}

async fn collect(handle: JoinHandle<Vec<u8>>) -> String {
    let bytes = handle.await.unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Spawn the command, wait up to its timeout, and return the classified result.
///
/// The child is placed in its own process group (via `process_group(0)`) so a
/// timed-out tool and anything it forked can be killed together.
pub async fn run_command(command: &CommandSpec) -> Result<Invocation, InvokeError> {
    tracing::info!(
        command = %command.display(),
        timeout_secs = command.timeout.as_secs(),
        "spawning measurement tool"
    );

    let started_at = Utc::now();
    let start = Instant::now();

    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                InvokeError::ToolMissing {
                    program: command.program.clone(),
                }
            } else {
                InvokeError::Spawn {
                    program: command.program.clone(),
                    source: e,
                }
            }
        })?;

    let pid = child.id();
    let stdout = spawn_reader(child.stdout.take());
    let stderr = spawn_reader(child.stderr.take());

    let (outcome, exit_code) = match tokio::time::timeout(command.timeout, child.wait()).await {
        Ok(status) => {
            let status = status.map_err(|e| InvokeError::Io { source: e })?;
            let code = status.code();
            let outcome = match code {
                Some(c) if command.success_codes.contains(&c) => Outcome::Success,
                _ => Outcome::ToolError,
            };
            (outcome, code)
        }
        Err(_) => {
            tracing::warn!(
                command = %command.display(),
                timeout_secs = command.timeout.as_secs(),
                "tool exceeded timeout, killing process group"
            );
            if let Some(pid) = pid {
                if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    tracing::debug!(error = %e, pid, "killpg failed, falling back to kill");
                }
            }
            let _ = child.kill().await;
            (Outcome::TimedOut, None)
        }
    };

    let duration = start.elapsed();
    let stdout = collect(stdout).await;
    let stderr = collect(stderr).await;

    tracing::info!(
        command = %command.program,
        outcome = ?outcome,
        exit_code = ?exit_code,
        duration_ms = duration.as_millis() as u64,
        stdout_bytes = stdout.len(),
        "measurement tool finished"
    );

    Ok(Invocation {
        command: command.clone(),
        outcome,
        exit_code,
        stdout,
        stderr,
        started_at,
        duration,
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> CommandSpec {
        CommandSpec::new("sh", vec!["-c".to_string(), script.to_string()], timeout)
    }

    #[test]
    fn test_display_joins_program_and_args() {
        let cmd = CommandSpec::new(
            "speedtest",
            vec!["-f".into(), "json".into()],
            Duration::from_secs(1),
        );
        assert_eq!(cmd.display(), "speedtest -f json");
    }

    #[test]
    fn test_default_success_code_is_zero() {
        let cmd = CommandSpec::new("ping", vec![], Duration::from_secs(1));
        assert_eq!(cmd.success_codes, vec![0]);
        let cmd = cmd.with_success_codes(&[0, 1, 2]);
        assert_eq!(cmd.success_codes, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let inv = run_command(&sh(
            "echo stdout-line; echo stderr-line >&2",
            Duration::from_secs(5),
        ))
        .await
        .unwrap();

        assert_eq!(inv.outcome, Outcome::Success);
        assert_eq!(inv.exit_code, Some(0));
        assert_eq!(inv.stdout.trim(), "stdout-line");
        assert_eq!(inv.stderr.trim(), "stderr-line");
        assert!(inv.combined_output().contains("stdout-line"));
        assert!(inv.combined_output().contains("stderr-line"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_tool_error() {
        let inv = run_command(&sh("echo no network; exit 2", Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(inv.outcome, Outcome::ToolError);
        assert_eq!(inv.exit_code, Some(2));
        assert_eq!(inv.stdout.trim(), "no network");
    }

    #[tokio::test]
    async fn test_custom_success_codes() {
        let cmd = sh("exit 1", Duration::from_secs(5)).with_success_codes(&[0, 1]);
        let inv = run_command(&cmd).await.unwrap();
        assert_eq!(inv.outcome, Outcome::Success);
        assert_eq!(inv.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_timeout_kills_and_keeps_partial_output() {
        let cmd = sh("echo started; sleep 10; echo never", Duration::from_millis(300));
        let inv = run_command(&cmd).await.unwrap();

        assert_eq!(inv.outcome, Outcome::TimedOut);
        assert_eq!(inv.exit_code, None);
        assert!(inv.stdout.contains("started"));
        assert!(!inv.stdout.contains("never"));
        assert!(inv.duration.as_secs() < 5);
    }

    #[tokio::test]
    async fn test_missing_binary_is_tool_missing() {
        let cmd = CommandSpec::new("nonexistent-binary-xyz", vec![], Duration::from_secs(1));
        let err = run_command(&cmd).await.unwrap_err();
        assert!(matches!(err, InvokeError::ToolMissing { .. }));
        assert!(err.to_string().contains("nonexistent-binary-xyz"));
    }

    #[tokio::test]
    async fn test_duration_is_reasonable() {
        let cmd = CommandSpec::new("sleep", vec!["0.1".into()], Duration::from_secs(5));
        let inv = run_command(&cmd).await.unwrap();
        assert!(inv.duration.as_millis() >= 80);
        assert!(inv.duration.as_secs() < 5);
    }

    #[test]
    fn test_combined_output_prefers_non_empty_stream() {
        let inv = Invocation {
            command: CommandSpec::new("x", vec![], Duration::from_secs(1)),
            outcome: Outcome::Success,
            exit_code: Some(0),
            stdout: String::new(),
            stderr: "summary".into(),
            started_at: Utc::now(),
            duration: Duration::ZERO,
        };
        assert_eq!(inv.combined_output(), "summary");
    }
}
