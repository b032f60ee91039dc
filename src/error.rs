//! Error types for the analysis sandbox.
//!
//! Two families live here. [`SandboxError`] is returned by fallible
//! configuration and data-engine calls and is raised synchronously.
//! [`ErrorKind`] classifies a failed run inside an
//! [`ExecutionResult`](crate::ExecutionResult); execution never returns
//! a `SandboxError` to the caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by configuration, context building and the data engines.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The isolation policy failed validation.
    #[error("policy error: {0}")]
    Policy(String),

    /// A data-engine call received an invalid argument (unknown operator,
    /// missing column, malformed records).
    #[error("validation error: {0}")]
    Validation(String),

    /// A context binding cannot be injected into the child program.
    #[error("invalid context: {0}")]
    InvalidContext(String),

    /// Preparing the run failed before the child ever started.
    #[error("setup failed: {0}")]
    Setup(#[source] anyhow::Error),

    /// Failed to initialize the Wasm runtime.
    #[error("failed to initialize runtime: {0}")]
    RuntimeInit(#[source] anyhow::Error),

    /// Failed to load or instantiate the Python interpreter module.
    #[error("failed to load Python interpreter: {0}")]
    ModuleLoad(#[source] anyhow::Error),

    /// The interpreter binary or wasm file was not found.
    #[error("Python interpreter not found at: {0}")]
    InterpreterNotFound(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SandboxError {
    /// Shorthand for a [`SandboxError::Validation`].
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        SandboxError::Validation(msg.into())
    }

    /// Check if this error comes from policy validation.
    pub fn is_policy(&self) -> bool {
        matches!(self, SandboxError::Policy(_))
    }

    /// Check if this error comes from a data-engine argument check.
    pub fn is_validation(&self) -> bool {
        matches!(self, SandboxError::Validation(_))
    }

    /// The execution-time classification of this error.
    ///
    /// Everything that can go wrong before the child runs is a setup
    /// failure from the caller's point of view.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Setup
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Why a sandboxed run did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The script imported a module outside the allow-list.
    ImportDenied,
    /// The script raised; reported through the structured failure contract.
    Script,
    /// The wall-clock budget was exhausted and the child was killed.
    Timeout,
    /// The child did not print exactly one JSON value.
    OutputContract,
    /// The child exited non-zero without the structured failure contract.
    Execution,
    /// The run could not be prepared (temp file, spawn, interpreter load).
    Setup,
}

impl ErrorKind {
    /// Map the `error_type` reported by the child's failure object.
    pub fn from_child_error_type(error_type: &str) -> Self {
        match error_type {
            "ImportDenied" => ErrorKind::ImportDenied,
            "OutputContractError" => ErrorKind::OutputContract,
            _ => ErrorKind::Script,
        }
    }

    /// Stable name used in logs and serialized results.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ImportDenied => "ImportDenied",
            ErrorKind::Script => "ScriptError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::OutputContract => "OutputContractError",
            ErrorKind::Execution => "ExecutionError",
            ErrorKind::Setup => "SetupError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure printed by the guarded program on a script fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildFailure {
    /// Human readable message.
    pub error: String,
    /// Exception class name raised inside the child.
    pub error_type: String,
}

/// Parse the `{success: false, error, error_type}` object from child stdout.
///
/// Returns `None` when stdout is not exactly that object, which the
/// manager then treats as a boundary failure.
pub fn parse_child_failure(stdout: &str) -> Option<ChildFailure> {
    let value: serde_json::Value = serde_json::from_str(stdout.trim()).ok()?;
    let obj = value.as_object()?;

    if obj.get("success").and_then(serde_json::Value::as_bool) != Some(false) {
        return None;
    }

    let error = obj.get("error")?.as_str()?.to_string();
    let error_type = obj
        .get("error_type")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("Exception")
        .to_string();

    Some(ChildFailure { error, error_type })
}
