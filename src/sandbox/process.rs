//! Host interpreter launcher.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};

use crate::error::{Result, SandboxError};
use crate::sandbox::env::RestrictedEnv;
use crate::sandbox::io::{drain, RunOutcome, SandboxIo};
use crate::sandbox::limits::RlimitPlan;
use crate::sandbox::program::PROGRAM_FILE_NAME;
use crate::telemetry::{sandbox_debug, sandbox_warn};

/// How long to wait for pipe readers after the child is gone. A surviving
/// descendant can hold the pipes open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Everything needed to start one child.
#[derive(Debug)]
pub struct ProcessLaunch<'a> {
    pub interpreter: &'a Path,
    /// Flags placed before the program file name.
    pub interpreter_args: &'a [&'a str],
    pub workdir: &'a Path,
    pub env: &'a RestrictedEnv,
    pub limits: Option<RlimitPlan>,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

/// CPython flags: no bytecode files, no user site-packages.
pub const PYTHON_FLAGS: &[&str] = &["-B", "-s"];

/// Run `program.py` in `workdir` under the host interpreter.
///
/// Returns `Err` only when the child could not be started.
pub async fn run(launch: ProcessLaunch<'_>) -> Result<RunOutcome> {
    let mut command = Command::new(launch.interpreter);
    command
        .args(launch.interpreter_args)
        .arg(PROGRAM_FILE_NAME)
        .current_dir(launch.workdir)
        .env_clear()
        .envs(launch.env.vars())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    {
        command.process_group(0);
        if let Some(plan) = launch.limits {
            // SAFETY: the closure only calls setrlimit and prctl, both
            // async-signal-safe, and allocates nothing.
            unsafe {
                command.pre_exec(move || plan.apply());
            }
        }
    }

    let started = Instant::now();
    let mut child = command.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            SandboxError::InterpreterNotFound(launch.interpreter.display().to_string())
        } else {
            SandboxError::Setup(anyhow::Error::new(e).context("failed to spawn interpreter"))
        }
    })?;
    sandbox_debug!(pid = ?child.id(), "spawned sandbox child");

    let io = SandboxIo::new(launch.max_output_bytes);
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SandboxError::Setup(anyhow::anyhow!("child stdout was not piped")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SandboxError::Setup(anyhow::anyhow!("child stderr was not piped")))?;
    let stdout_task = tokio::spawn(drain(stdout, io.stdout.clone()));
    let stderr_task = tokio::spawn(drain(stderr, io.stderr.clone()));

    let waited = tokio::time::timeout(launch.timeout, child.wait()).await;
    let elapsed = started.elapsed();

    let mut outcome = match waited {
        Ok(status) => {
            let status = status.map_err(|e| {
                SandboxError::Setup(anyhow::Error::new(e).context("failed to wait for child"))
            })?;
            finish_drains(stdout_task, stderr_task).await;
            let mut outcome = RunOutcome::from_io(&io, elapsed);
            outcome.exit_code = status.code();
            outcome.termination = describe_signal(&status);
            outcome
        }
        Err(_) => {
            sandbox_warn!(timeout_ms = launch.timeout.as_millis() as u64, "sandbox child timed out");
            kill_tree(&mut child);
            let _ = child.wait().await;
            finish_drains(stdout_task, stderr_task).await;
            let mut outcome = RunOutcome::from_io(&io, elapsed);
            outcome.timed_out = true;
            outcome
        }
    };
    outcome.truncated = io.truncated();
    Ok(outcome)
}

async fn finish_drains(
    stdout: tokio::task::JoinHandle<std::io::Result<()>>,
    stderr: tokio::task::JoinHandle<std::io::Result<()>>,
) {
    for task in [stdout, stderr] {
        let abort = task.abort_handle();
        if tokio::time::timeout(DRAIN_GRACE, task).await.is_err() {
            abort.abort();
        }
    }
}

/// Kill the child's whole process group.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: kill has no memory-safety preconditions. The child leads
        // its own group, so -pid addresses only its descendants.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
    let _ = child.start_kill();
}

#[cfg(unix)]
fn describe_signal(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status
        .signal()
        .map(|signal| format!("terminated by signal {}", signal))
}

#[cfg(not(unix))]
fn describe_signal(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell_launch<'a>(
        workdir: &'a Path,
        env: &'a RestrictedEnv,
        timeout: Duration,
        max_output_bytes: usize,
    ) -> ProcessLaunch<'a> {
        ProcessLaunch {
            interpreter: Path::new("sh"),
            interpreter_args: &[],
            workdir,
            env,
            limits: None,
            timeout,
            max_output_bytes,
        }
    }

    fn write_program(dir: &Path, body: &str) {
        std::fs::write(dir.join(PROGRAM_FILE_NAME), body).unwrap();
    }

    #[tokio::test]
    async fn test_captures_both_streams_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        write_program(dir.path(), "echo out\necho err >&2\nexit 3\n");
        let env = RestrictedEnv::from_host();

        let outcome = run(shell_launch(dir.path(), &env, Duration::from_secs(5), 1024))
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "out\n");
        assert_eq!(outcome.stderr, "err\n");
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_timeout_kills_and_keeps_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        write_program(dir.path(), "echo started\nsleep 30\n");
        let env = RestrictedEnv::from_host();

        let started = Instant::now();
        let outcome = run(shell_launch(dir.path(), &env, Duration::from_millis(300), 1024))
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.stdout, "started\n");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_output_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        write_program(dir.path(), "i=0\nwhile [ $i -lt 200 ]; do echo 0123456789; i=$((i+1)); done\n");
        let env = RestrictedEnv::from_host();

        let outcome = run(shell_launch(dir.path(), &env, Duration::from_secs(5), 64))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout.len(), 64);
        assert!(outcome.truncated);
    }

    #[tokio::test]
    async fn test_missing_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        let env = RestrictedEnv::from_host();
        let mut launch = shell_launch(dir.path(), &env, Duration::from_secs(1), 1024);
        launch.interpreter = Path::new("definitely-not-a-python-interpreter");

        let err = run(launch).await.unwrap_err();
        assert!(matches!(err, SandboxError::InterpreterNotFound(_)));
    }

    #[tokio::test]
    async fn test_env_is_restricted() {
        let dir = tempfile::tempdir().unwrap();
        write_program(dir.path(), "env\n");
        let env = RestrictedEnv::from_vars([("PATH", "/usr/bin:/bin"), ("OPENAI_API_KEY", "sk")]);

        let outcome = run(shell_launch(dir.path(), &env, Duration::from_secs(5), 4096))
            .await
            .unwrap();
        assert!(outcome.stdout.contains("PYTHONUNBUFFERED=1"));
        assert!(!outcome.stdout.contains("OPENAI_API_KEY"));
    }
}
