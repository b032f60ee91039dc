//! Preset-based construction of sandbox managers.

use crate::error::Result;
use crate::policy::{IsolationLevel, IsolationPolicy, PolicyOverrides};
use crate::sandbox::config::{Runtime, SandboxConfig, DEFAULT_MAX_OUTPUT_BYTES};
use crate::sandbox::executor::SandboxManager;

/// Builds [`SandboxManager`]s from named policy presets.
///
/// Runtime settings set on the factory apply to every manager it builds.
///
/// ```rust,no_run
/// use analysis_sandbox_rs::SandboxFactory;
///
/// let analysis = SandboxFactory::new().analysis()?;
/// let filtering = SandboxFactory::new().filtering()?;
/// assert!(analysis.policy().network_allowed);
/// assert!(!filtering.policy().network_allowed);
/// # Ok::<(), analysis_sandbox_rs::SandboxError>(())
/// ```
#[derive(Debug, Clone)]
pub struct SandboxFactory {
    runtime: Runtime,
    max_output_bytes: usize,
    enforce_limits: bool,
}

impl Default for SandboxFactory {
    fn default() -> Self {
        Self {
            runtime: Runtime::default(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            enforce_limits: true,
        }
    }
}

impl SandboxFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runtime(mut self, runtime: Runtime) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn enforce_limits(mut self, enforce: bool) -> Self {
        self.enforce_limits = enforce;
        self
    }

    /// Broad module set, 60 s / 512 MB, network to `localhost:8000`.
    pub fn analysis(&self) -> Result<SandboxManager> {
        self.build(IsolationPolicy::analysis())
    }

    /// `{json, math, re}`, 10 s / 64 MB, no network, no filesystem.
    pub fn filtering(&self) -> Result<SandboxManager> {
        self.build(IsolationPolicy::filtering())
    }

    /// Default policy with `overrides` layered on, then validated.
    pub fn custom(&self, overrides: &PolicyOverrides) -> Result<SandboxManager> {
        self.custom_from(IsolationPolicy::default(), overrides)
    }

    /// `base` with `overrides` layered on, then validated.
    pub fn custom_from(
        &self,
        mut base: IsolationPolicy,
        overrides: &PolicyOverrides,
    ) -> Result<SandboxManager> {
        base.apply_overrides(overrides);
        self.build(base)
    }

    /// A tier preset as-is.
    pub fn from_level(&self, level: IsolationLevel) -> Result<SandboxManager> {
        self.build(IsolationPolicy::with_level(level))
    }

    /// Any policy, validated.
    pub fn build(&self, policy: IsolationPolicy) -> Result<SandboxManager> {
        let config = SandboxConfig::builder()
            .policy(policy)
            .runtime(self.runtime.clone())
            .max_output_bytes(self.max_output_bytes)
            .enforce_limits(self.enforce_limits)
            .build()?;
        SandboxManager::new(config)
    }
}
