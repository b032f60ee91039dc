//! Core execution engine: compose, launch, classify.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Context;
use crate::error::{parse_child_failure, ErrorKind, Result, SandboxError};
use crate::policy::{IsolationPolicy, MAX_WALL_TIME_SECS};
use crate::sandbox::config::{Runtime, SandboxConfig};
use crate::sandbox::env::RestrictedEnv;
use crate::sandbox::io::RunOutcome;
use crate::sandbox::limits::RlimitPlan;
use crate::sandbox::process::{self, ProcessLaunch, PYTHON_FLAGS};
use crate::sandbox::program::{
    validate_code, CodeReport, GuardedProgram, PROGRAM_FILE_NAME, SUPPORT_MODULE_NAME,
    SUPPORT_MODULE_SOURCE,
};
use crate::sandbox::wasm::{WasmLaunch, WasmRunner};
use crate::telemetry::{sandbox_debug, sandbox_info, sandbox_warn};

/// Per-call knobs for [`SandboxManager::execute_with`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Wall-clock budget for this call instead of the policy's.
    pub timeout_override: Option<Duration>,
    /// Echo the composed program in the result.
    pub capture_script: bool,
}

impl ExecuteOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout_override: Some(timeout),
            ..Self::default()
        }
    }
}

/// Outcome of one sandboxed run.
///
/// On success `output` holds the value the script bound to `result`. On
/// failure `error` and `error_kind` say why; `stdout` and `stderr` keep
/// whatever the child wrote either way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: Option<Value>,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u64,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Exception class reported by the child, or the kind's name.
    pub error_type: Option<String>,
    pub exit_code: Option<i32>,
    /// Some output was dropped at the capture limit.
    pub truncated: bool,
    pub echoed_program: Option<String>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn is_timeout(&self) -> bool {
        self.error_kind == Some(ErrorKind::Timeout)
    }

    pub fn is_import_denied(&self) -> bool {
        self.error_kind == Some(ErrorKind::ImportDenied)
    }

    fn failed(kind: ErrorKind, error: String, error_type: Option<String>) -> Self {
        Self {
            success: false,
            output: None,
            stdout: String::new(),
            stderr: String::new(),
            execution_time_ms: 0,
            error: Some(error),
            error_kind: Some(kind),
            error_type: Some(error_type.unwrap_or_else(|| kind.as_str().to_string())),
            exit_code: None,
            truncated: false,
            echoed_program: None,
        }
    }

    fn setup_failure(err: &SandboxError, elapsed: Duration) -> Self {
        let mut result = Self::failed(err.kind(), err.to_string(), None);
        result.execution_time_ms = millis(elapsed);
        result
    }

    /// Classify a finished launch.
    fn from_outcome(outcome: RunOutcome, timeout: Duration) -> Self {
        let mut result = if outcome.timed_out {
            Self::failed(
                ErrorKind::Timeout,
                format!("Script timed out after {} ms", timeout.as_millis()),
                None,
            )
        } else if outcome.exit_code == Some(0) {
            match parse_single_value(&outcome.stdout) {
                Ok(value) => Self::succeeded(value),
                Err(reason) => Self::failed(
                    ErrorKind::OutputContract,
                    format!("Script did not return JSON-serializable output: {}", reason),
                    None,
                ),
            }
        } else if let Some(failure) = parse_child_failure(&outcome.stdout) {
            let kind = ErrorKind::from_child_error_type(&failure.error_type);
            Self::failed(kind, failure.error, Some(failure.error_type))
        } else {
            Self::failed(
                ErrorKind::Execution,
                describe_abnormal_exit(&outcome),
                None,
            )
        };

        result.stdout = outcome.stdout;
        result.stderr = outcome.stderr;
        result.execution_time_ms = millis(outcome.elapsed);
        result.exit_code = outcome.exit_code;
        result.truncated = outcome.truncated;
        result
    }

    fn succeeded(output: Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            stdout: String::new(),
            stderr: String::new(),
            execution_time_ms: 0,
            error: None,
            error_kind: None,
            error_type: None,
            exit_code: None,
            truncated: false,
            echoed_program: None,
        }
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Stdout must hold exactly one JSON value, surrounding whitespace aside.
fn parse_single_value(stdout: &str) -> std::result::Result<Value, String> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err("no output was produced".to_string());
    }
    serde_json::from_str(trimmed).map_err(|e| e.to_string())
}

fn describe_abnormal_exit(outcome: &RunOutcome) -> String {
    let mut message = match (&outcome.termination, outcome.exit_code) {
        (Some(termination), _) => format!("Script {}", termination),
        (None, Some(code)) => format!("Script exited with code {}", code),
        (None, None) => "Script exited abnormally".to_string(),
    };
    if let Some(line) = outcome.stderr.lines().rev().find(|l| !l.trim().is_empty()) {
        message.push_str(": ");
        message.push_str(line.trim());
    }
    message
}

#[derive(Debug, Clone)]
enum Runner {
    Process { interpreter: PathBuf },
    Wasm(WasmRunner),
}

/// Runs scripts under one [`SandboxConfig`].
///
/// # Example
///
/// ```rust,no_run
/// use analysis_sandbox_rs::prelude::*;
///
/// # async fn demo() -> analysis_sandbox_rs::Result<()> {
/// let manager = SandboxManager::new(SandboxConfig::new(IsolationPolicy::default())?)?;
/// let result = manager.execute("result = 2 + 2", &Context::new()).await;
/// assert_eq!(result.output, Some(serde_json::json!(4)));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SandboxManager {
    config: SandboxConfig,
    runner: Runner,
}

impl SandboxManager {
    /// Create a manager. For the Wasm runtime this loads (or reuses) the
    /// compiled interpreter, so a missing wasm file fails here.
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let runner = match config.runtime() {
            Runtime::Process { interpreter } => Runner::Process {
                interpreter: interpreter.clone(),
            },
            Runtime::Wasm {
                interpreter_path,
                epoch_tick_interval,
            } => Runner::Wasm(WasmRunner::load(interpreter_path, *epoch_tick_interval)?),
        };
        sandbox_debug!(
            runtime = config.runtime().name(),
            level = %config.policy().level,
            "sandbox manager created"
        );
        Ok(Self { config, runner })
    }

    pub fn policy(&self) -> &IsolationPolicy {
        self.config.policy()
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Advisory pre-flight scan; see [`validate_code`].
    pub fn validate_code(&self, script: &str) -> CodeReport {
        let report = validate_code(script);
        if !report.is_clean() {
            sandbox_debug!(tokens = ?report.tokens(), "suspicious tokens in script");
        }
        report
    }

    /// Run `script` with `context` bound as top-level names.
    ///
    /// Never fails: every problem is reported through the result.
    pub async fn execute(&self, script: &str, context: &Context) -> ExecutionResult {
        self.execute_with(script, context, &ExecuteOptions::default())
            .await
    }

    pub async fn execute_with(
        &self,
        script: &str,
        context: &Context,
        options: &ExecuteOptions,
    ) -> ExecutionResult {
        let started = Instant::now();
        let timeout = effective_timeout(options.timeout_override, self.config.timeout());

        sandbox_debug!(
            runtime = self.config.runtime().name(),
            timeout_ms = millis(timeout),
            "sandbox run starting"
        );

        let program = match GuardedProgram::compose(self.policy(), context, script) {
            Ok(program) => program,
            Err(err) => return ExecutionResult::setup_failure(&err, started.elapsed()),
        };
        let echoed = options
            .capture_script
            .then(|| program.source().to_string());

        let mut result = match self.launch(&program, timeout).await {
            Ok(outcome) => ExecutionResult::from_outcome(outcome, timeout),
            Err(err) => {
                sandbox_warn!(error = %err, "sandbox setup failed");
                ExecutionResult::setup_failure(&err, started.elapsed())
            }
        };
        result.echoed_program = echoed;

        sandbox_info!(
            success = result.success,
            error_kind = ?result.error_kind,
            execution_time_ms = result.execution_time_ms,
            "sandbox run finished"
        );
        result
    }

    /// Write the program into a scoped temp dir and run it there. The dir
    /// is removed when this returns, on every path.
    async fn launch(&self, program: &GuardedProgram, timeout: Duration) -> Result<RunOutcome> {
        let workdir = tempfile::Builder::new()
            .prefix("analysis-sandbox-")
            .tempdir()
            .map_err(|e| setup_io(e, "failed to create temp dir"))?;
        write_file(workdir.path(), PROGRAM_FILE_NAME, program.source())?;
        write_file(
            workdir.path(),
            &format!("{}.py", SUPPORT_MODULE_NAME),
            SUPPORT_MODULE_SOURCE,
        )?;

        let outcome = self.run_in(workdir.path(), timeout).await;
        if let Err(_err) = workdir.close() {
            sandbox_warn!(error = %_err, "failed to remove sandbox temp dir");
        }
        outcome
    }

    async fn run_in(&self, workdir: &Path, timeout: Duration) -> Result<RunOutcome> {
        let env = RestrictedEnv::from_host();
        match &self.runner {
            Runner::Process { interpreter } => {
                let limits = self
                    .config
                    .enforce_limits()
                    .then(|| RlimitPlan::for_run(&self.config, timeout));
                process::run(ProcessLaunch {
                    interpreter,
                    interpreter_args: PYTHON_FLAGS,
                    workdir,
                    env: &env,
                    limits,
                    timeout,
                    max_output_bytes: self.config.max_output_bytes(),
                })
                .await
            }
            Runner::Wasm(runner) => {
                runner
                    .run(WasmLaunch {
                        workdir: workdir.to_path_buf(),
                        env,
                        max_memory: self
                            .config
                            .enforce_limits()
                            .then(|| self.config.max_memory_bytes()),
                        timeout,
                        max_output_bytes: self.config.max_output_bytes(),
                    })
                    .await
            }
        }
    }
}

/// The per-call budget, capped at the longest wall time any policy accepts.
fn effective_timeout(requested: Option<Duration>, policy_default: Duration) -> Duration {
    let ceiling = Duration::from_secs(MAX_WALL_TIME_SECS);
    match requested {
        Some(timeout) if timeout > ceiling => {
            sandbox_warn!(
                requested_ms = millis(timeout),
                ceiling_ms = millis(ceiling),
                "timeout override clamped"
            );
            ceiling
        }
        Some(timeout) => timeout,
        None => policy_default,
    }
}

fn write_file(dir: &Path, name: &str, contents: &str) -> Result<()> {
    std::fs::write(dir.join(name), contents)
        .map_err(|e| setup_io(e, &format!("failed to write {}", name)))
}

fn setup_io(err: std::io::Error, what: &str) -> SandboxError {
    SandboxError::Setup(anyhow::Error::new(err).context(what.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outcome(stdout: &str, exit_code: Option<i32>) -> RunOutcome {
        RunOutcome {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code,
            termination: None,
            timed_out: false,
            truncated: false,
            elapsed: Duration::from_millis(42),
        }
    }

    #[test]
    fn test_classify_success() {
        let result = ExecutionResult::from_outcome(outcome("4\n", Some(0)), Duration::from_secs(1));
        assert!(result.is_success());
        assert_eq!(result.output, Some(json!(4)));
        assert_eq!(result.execution_time_ms, 42);
        assert!(result.error.is_none());
        assert!(result.error_kind.is_none());
    }

    #[test]
    fn test_classify_bad_stdout_on_zero_exit() {
        for stdout in ["", "not json", "1\n2\n"] {
            let result =
                ExecutionResult::from_outcome(outcome(stdout, Some(0)), Duration::from_secs(1));
            assert!(!result.success);
            assert_eq!(result.error_kind, Some(ErrorKind::OutputContract));
            assert!(result
                .error
                .unwrap()
                .contains("did not return JSON-serializable output"));
        }
    }

    #[test]
    fn test_classify_structured_failure() {
        let stdout = r#"{"success": false, "error": "ImportDenied: Import of module 'os' is not allowed", "error_type": "ImportDenied"}"#;
        let result = ExecutionResult::from_outcome(outcome(stdout, Some(1)), Duration::from_secs(1));
        assert!(result.is_import_denied());
        assert!(result.error.as_deref().unwrap().contains("'os'"));
        assert_eq!(result.error_type.as_deref(), Some("ImportDenied"));
        assert_eq!(result.exit_code, Some(1));

        let stdout = r#"{"success": false, "error": "ZeroDivisionError: division by zero", "error_type": "ZeroDivisionError"}"#;
        let result = ExecutionResult::from_outcome(outcome(stdout, Some(1)), Duration::from_secs(1));
        assert_eq!(result.error_kind, Some(ErrorKind::Script));
        assert_eq!(result.error_type.as_deref(), Some("ZeroDivisionError"));
    }

    #[test]
    fn test_classify_abnormal_exit() {
        let mut run = outcome("", Some(137));
        run.stderr = "Traceback...\nMemoryError\n".to_string();
        let result = ExecutionResult::from_outcome(run, Duration::from_secs(1));
        assert_eq!(result.error_kind, Some(ErrorKind::Execution));
        assert_eq!(
            result.error.as_deref(),
            Some("Script exited with code 137: MemoryError")
        );
        assert_eq!(result.error_type.as_deref(), Some("ExecutionError"));

        let mut run = outcome("", None);
        run.termination = Some("terminated by signal 24".to_string());
        let result = ExecutionResult::from_outcome(run, Duration::from_secs(1));
        assert_eq!(
            result.error.as_deref(),
            Some("Script terminated by signal 24")
        );
    }

    #[test]
    fn test_classify_timeout_keeps_partial_streams() {
        let mut run = outcome("", None);
        run.timed_out = true;
        run.stderr = "working...\n".to_string();
        run.elapsed = Duration::from_millis(1003);
        let result = ExecutionResult::from_outcome(run, Duration::from_secs(1));
        assert!(result.is_timeout());
        assert_eq!(result.error.as_deref(), Some("Script timed out after 1000 ms"));
        assert_eq!(result.stderr, "working...\n");
        assert_eq!(result.execution_time_ms, 1003);
    }

    #[test]
    fn test_timeout_override_is_clamped() {
        let policy_default = Duration::from_secs(30);
        assert_eq!(effective_timeout(None, policy_default), policy_default);
        assert_eq!(
            effective_timeout(Some(Duration::from_secs(2)), policy_default),
            Duration::from_secs(2)
        );
        assert_eq!(
            effective_timeout(Some(Duration::MAX), policy_default),
            Duration::from_secs(MAX_WALL_TIME_SECS)
        );
    }

    #[test]
    fn test_result_serializes() {
        let result = ExecutionResult::from_outcome(outcome("[1, 2]", Some(0)), Duration::from_secs(1));
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["success"], json!(true));
        assert_eq!(value["output"], json!([1, 2]));
        assert_eq!(value["echoed_program"], json!(null));
        let back: ExecutionResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, result);
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_setup_failure() {
        let config = SandboxConfig::builder()
            .runtime(Runtime::process("no-such-python-interpreter"))
            .build()
            .unwrap();
        let manager = SandboxManager::new(config).unwrap();
        let options = ExecuteOptions {
            capture_script: true,
            ..ExecuteOptions::default()
        };

        let result = manager
            .execute_with("result = 1", &Context::new(), &options)
            .await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Setup));
        assert!(result.error.unwrap().contains("no-such-python-interpreter"));
        assert!(result.echoed_program.unwrap().contains("\"result = 1\""));
    }

    #[test]
    fn test_missing_wasm_fails_at_construction() {
        let config = SandboxConfig::builder()
            .runtime(Runtime::wasm("missing/rustpython.wasm"))
            .build()
            .unwrap();
        let err = SandboxManager::new(config).unwrap_err();
        assert!(matches!(err, SandboxError::InterpreterNotFound(_)));
    }
}
