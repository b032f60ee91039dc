//! Resource ceilings for both runtimes.
//!
//! The process runtime applies an [`RlimitPlan`] in the child between
//! `fork` and `exec`. The Wasm runtime routes memory growth through a
//! [`SandboxLimiter`] on the store.

use std::time::Duration;

use wasmtime::{ResourceLimiter, Store};

use crate::sandbox::config::SandboxConfig;

/// OS resource limits applied to a child interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlimitPlan {
    /// Address-space ceiling in bytes.
    pub address_space: u64,
    /// CPU seconds before SIGXCPU.
    pub cpu_soft_secs: u64,
    /// CPU seconds before SIGKILL.
    pub cpu_hard_secs: u64,
    /// Deny creating or growing regular files.
    pub deny_file_writes: bool,
    /// Fail `socket(2)` in the child, see [`seccomp`](crate::sandbox::seccomp).
    pub deny_sockets: bool,
}

impl RlimitPlan {
    /// Plan for `config`, with the CPU ceiling derived from `timeout`.
    pub fn for_run(config: &SandboxConfig, timeout: Duration) -> Self {
        let secs = timeout
            .as_secs()
            .saturating_add(u64::from(timeout.subsec_nanos() > 0));
        Self {
            address_space: config.max_memory_bytes(),
            cpu_soft_secs: secs.saturating_add(1),
            cpu_hard_secs: secs.saturating_add(2),
            deny_file_writes: !config.policy().filesystem_write,
            deny_sockets: !config.policy().network_allowed,
        }
    }

    /// Apply the plan to the calling process.
    ///
    /// Runs inside `pre_exec`, so it only calls `setrlimit` and `prctl`.
    #[cfg(unix)]
    pub fn apply(&self) -> std::io::Result<()> {
        // SAFETY: setrlimit only reads the struct passed by reference.
        unsafe {
            check(libc::setrlimit(
                libc::RLIMIT_AS,
                &rlimit(self.address_space, self.address_space),
            ))?;
            check(libc::setrlimit(
                libc::RLIMIT_CPU,
                &rlimit(self.cpu_soft_secs, self.cpu_hard_secs),
            ))?;
            check(libc::setrlimit(libc::RLIMIT_CORE, &rlimit(0, 0)))?;
            if self.deny_file_writes {
                check(libc::setrlimit(libc::RLIMIT_FSIZE, &rlimit(0, 0)))?;
            }
        }
        if self.deny_sockets {
            crate::sandbox::seccomp::deny_sockets()?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn rlimit(soft: u64, hard: u64) -> libc::rlimit {
    libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    }
}

#[cfg(unix)]
fn check(ret: libc::c_int) -> std::io::Result<()> {
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Resource limiter that enforces memory and table size limits on a
/// Wasm store.
pub struct SandboxLimiter {
    max_memory: u64,
    current_memory: u64,
    peak_memory: u64,
    max_table_elements: u64,
    limit_exceeded: bool,
}

impl SandboxLimiter {
    pub fn new(max_memory: u64) -> Self {
        Self {
            max_memory,
            current_memory: 0,
            peak_memory: 0,
            max_table_elements: 10_000,
            limit_exceeded: false,
        }
    }

    /// Whether a growth request was refused.
    pub fn limit_exceeded(&self) -> bool {
        self.limit_exceeded
    }

    pub fn current_memory(&self) -> u64 {
        self.current_memory
    }

    /// Highest linear-memory size granted.
    pub fn peak_memory(&self) -> u64 {
        self.peak_memory
    }

    pub fn max_memory(&self) -> u64 {
        self.max_memory
    }
}

impl ResourceLimiter for SandboxLimiter {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        let desired_bytes = desired as u64;
        if desired_bytes > self.max_memory {
            self.limit_exceeded = true;
            return Ok(false);
        }

        self.current_memory = desired_bytes;
        self.peak_memory = self.peak_memory.max(desired_bytes);
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired as u64 > self.max_table_elements {
            self.limit_exceeded = true;
            return Ok(false);
        }
        Ok(true)
    }
}

/// Per-store state: the limiter and the WASI context.
pub struct StoreData {
    pub limiter: SandboxLimiter,
    pub wasi: wasmtime_wasi::preview1::WasiP1Ctx,
}

impl StoreData {
    pub fn new(max_memory: u64, wasi: wasmtime_wasi::preview1::WasiP1Ctx) -> Self {
        Self {
            limiter: SandboxLimiter::new(max_memory),
            wasi,
        }
    }
}

/// Extension trait for Store to configure resource limiting.
pub trait StoreLimiterExt {
    fn configure_limiter(&mut self);
}

impl StoreLimiterExt for Store<StoreData> {
    fn configure_limiter(&mut self) {
        self.limiter(|data| &mut data.limiter);
    }
}
