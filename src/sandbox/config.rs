//! Sandbox configuration with builder pattern.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;
use crate::policy::IsolationPolicy;

/// Default cap on captured stdout/stderr, per stream.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Interpreter the guarded program runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Runtime {
    /// A host CPython executable launched as a child process.
    Process {
        /// Interpreter executable, resolved through `PATH` when relative.
        interpreter: PathBuf,
    },
    /// RustPython compiled to WebAssembly, run in-process under Wasmtime.
    Wasm {
        /// Path to the RustPython wasm file.
        interpreter_path: PathBuf,
        /// Epoch interruption interval for cooperative timeout.
        epoch_tick_interval: Duration,
    },
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::Process {
            interpreter: PathBuf::from("python3"),
        }
    }
}

impl Runtime {
    /// Host interpreter at `interpreter`.
    pub fn process(interpreter: impl Into<PathBuf>) -> Self {
        Runtime::Process {
            interpreter: interpreter.into(),
        }
    }

    /// RustPython wasm at `interpreter_path` with a 10ms epoch tick.
    pub fn wasm(interpreter_path: impl Into<PathBuf>) -> Self {
        Runtime::Wasm {
            interpreter_path: interpreter_path.into(),
            epoch_tick_interval: Duration::from_millis(10),
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Runtime::Process { .. } => "process",
            Runtime::Wasm { .. } => "wasm",
        }
    }
}

/// Execution-time configuration for a [`SandboxManager`](crate::SandboxManager).
///
/// A config owns an [`IsolationPolicy`] that has passed validation; there
/// is no way to build one around an invalid policy.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    policy: IsolationPolicy,
    runtime: Runtime,
    max_output_bytes: usize,
    enforce_limits: bool,
}

impl SandboxConfig {
    /// Config with default runtime settings around `policy`.
    pub fn new(policy: IsolationPolicy) -> Result<Self> {
        Self::builder().policy(policy).build()
    }

    /// Create a new builder for SandboxConfig.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    pub fn policy(&self) -> &IsolationPolicy {
        &self.policy
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Wall-clock budget for one run.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.policy.max_wall_time_secs)
    }

    /// Memory ceiling in bytes.
    pub fn max_memory_bytes(&self) -> u64 {
        self.policy.max_memory_mb * 1024 * 1024
    }

    /// Cap on captured bytes per output stream.
    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }

    /// Whether OS/runtime limits back the policy's memory and CPU ceilings.
    pub fn enforce_limits(&self) -> bool {
        self.enforce_limits
    }
}

/// Builder for creating SandboxConfig instances.
#[derive(Debug, Clone, Default)]
pub struct SandboxConfigBuilder {
    policy: Option<IsolationPolicy>,
    runtime: Option<Runtime>,
    max_output_bytes: Option<usize>,
    enforce_limits: Option<bool>,
}

impl SandboxConfigBuilder {
    /// Set the isolation policy (validated by `build`).
    pub fn policy(mut self, policy: IsolationPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Set the interpreter runtime.
    pub fn runtime(mut self, runtime: Runtime) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Set the per-stream capture limit in bytes.
    pub fn max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = Some(bytes);
        self
    }

    /// Enable or disable rlimit / Wasm-limiter enforcement.
    pub fn enforce_limits(mut self, enforce: bool) -> Self {
        self.enforce_limits = Some(enforce);
        self
    }

    /// Validate the policy and build the SandboxConfig.
    pub fn build(self) -> Result<SandboxConfig> {
        let policy = self.policy.unwrap_or_default();
        policy.validate()?;

        Ok(SandboxConfig {
            policy,
            runtime: self.runtime.unwrap_or_default(),
            max_output_bytes: self.max_output_bytes.unwrap_or(DEFAULT_MAX_OUTPUT_BYTES),
            enforce_limits: self.enforce_limits.unwrap_or(true),
        })
    }
}
