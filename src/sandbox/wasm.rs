//! RustPython-on-Wasmtime launcher.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;
use wasmtime::{Engine, Linker, Module, Store, Trap, UpdateDeadline};
use wasmtime_wasi::preview1;
use wasmtime_wasi::{
    DirPerms, FilePerms, HostOutputStream, I32Exit, StdoutStream, StreamError, StreamResult,
    Subscribe, WasiCtxBuilder,
};

use crate::error::{Result, SandboxError};
use crate::sandbox::cache::global_cache;
use crate::sandbox::env::RestrictedEnv;
use crate::sandbox::io::{CapturedOutput, RunOutcome, SandboxIo};
use crate::sandbox::limits::{StoreData, StoreLimiterExt};
use crate::sandbox::program::PROGRAM_FILE_NAME;
use crate::telemetry::sandbox_warn;

/// Guest path of the preopened scoped temp dir.
pub const GUEST_DIR: &str = "/sandbox";

/// Extra wall time allowed for the blocking task after the epoch deadline
/// should have fired.
const BACKSTOP: Duration = Duration::from_secs(2);

/// Largest single write offered to the guest.
const WRITE_PERMIT: usize = 64 * 1024;

/// Guest stdout or stderr backed by a bounded capture.
///
/// Writes past the capture limit succeed and are dropped, the same as the
/// process runtime's pipe drains, so a chatty script never sees a failed
/// write.
#[derive(Clone, Debug)]
struct CaptureStream(CapturedOutput);

impl StdoutStream for CaptureStream {
    fn stream(&self) -> Box<dyn HostOutputStream> {
        Box::new(self.clone())
    }

    fn isatty(&self) -> bool {
        false
    }
}

impl HostOutputStream for CaptureStream {
    fn write(&mut self, bytes: Bytes) -> StreamResult<()> {
        self.0
            .write_all(&bytes)
            .map_err(|e| StreamError::LastOperationFailed(e.into()))
    }

    fn flush(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn check_write(&mut self) -> StreamResult<usize> {
        Ok(WRITE_PERMIT)
    }
}

#[async_trait::async_trait]
impl Subscribe for CaptureStream {
    async fn ready(&mut self) {}
}

/// A loaded interpreter module and the engine that compiled it.
#[derive(Clone)]
pub struct WasmRunner {
    engine: Engine,
    module: Module,
    epoch_tick_interval: Duration,
}

impl std::fmt::Debug for WasmRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmRunner")
            .field("epoch_tick_interval", &self.epoch_tick_interval)
            .finish_non_exhaustive()
    }
}

/// Per-run settings for [`WasmRunner::run`].
#[derive(Debug, Clone)]
pub struct WasmLaunch {
    pub workdir: PathBuf,
    pub env: RestrictedEnv,
    /// Linear-memory ceiling; `None` disables the limiter.
    pub max_memory: Option<u64>,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

impl WasmRunner {
    /// Load (or reuse) the compiled interpreter at `interpreter_path`.
    pub fn load(interpreter_path: &Path, epoch_tick_interval: Duration) -> Result<Self> {
        let cache = global_cache()?;
        let module = cache.get_or_compile(interpreter_path)?;
        Ok(Self {
            engine: cache.engine().clone(),
            module,
            epoch_tick_interval,
        })
    }

    /// Run the guarded program in `launch.workdir` to completion or
    /// deadline.
    pub async fn run(&self, launch: WasmLaunch) -> Result<RunOutcome> {
        let ticker_engine = self.engine.clone();
        let tick = self.epoch_tick_interval;
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                ticker_engine.increment_epoch();
            }
        });

        let started = Instant::now();
        let timeout = launch.timeout;
        let engine = self.engine.clone();
        let module = self.module.clone();
        let io = SandboxIo::new(launch.max_output_bytes);
        let guest_io = io.clone();
        let mut handle =
            tokio::task::spawn_blocking(move || run_sync(&engine, &module, launch, guest_io));

        match tokio::time::timeout(timeout.saturating_add(BACKSTOP), &mut handle).await {
            Ok(joined) => {
                ticker.abort();
                joined.map_err(|join| {
                    SandboxError::Setup(anyhow::anyhow!("interpreter task failed: {}", join))
                })?
            }
            Err(_) => {
                sandbox_warn!("wasm run ignored its epoch deadline");
                // The guest is stuck in a host call. Keep ticking so the
                // next epoch check interrupts it, then stop the ticker.
                tokio::spawn(async move {
                    let _ = handle.await;
                    ticker.abort();
                });
                let mut outcome = RunOutcome::from_io(&io, started.elapsed());
                outcome.timed_out = true;
                Ok(outcome)
            }
        }
    }
}

fn run_sync(
    engine: &Engine,
    module: &Module,
    launch: WasmLaunch,
    io: SandboxIo,
) -> Result<RunOutcome> {
    let guest_program = format!("{}/{}", GUEST_DIR, PROGRAM_FILE_NAME);
    let env: Vec<(&str, &str)> = launch.env.vars().collect();

    let mut builder = WasiCtxBuilder::new();
    builder
        .args(&["python", guest_program.as_str()])
        .envs(env.as_slice())
        .stdout(CaptureStream(io.stdout.clone()))
        .stderr(CaptureStream(io.stderr.clone()));
    builder
        .preopened_dir(&launch.workdir, GUEST_DIR, DirPerms::READ, FilePerms::READ)
        .map_err(|e| SandboxError::Setup(e.context("failed to preopen sandbox dir")))?;
    let wasi = builder.build_p1();

    let limited = launch.max_memory.is_some();
    let mut store = Store::new(
        engine,
        StoreData::new(launch.max_memory.unwrap_or(u64::MAX), wasi),
    );
    if limited {
        store.configure_limiter();
    }

    let started = Instant::now();
    let deadline = started.checked_add(launch.timeout);
    store.set_epoch_deadline(1);
    store.epoch_deadline_callback(move |_| {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            Err(Trap::Interrupt.into())
        } else {
            Ok(UpdateDeadline::Continue(1))
        }
    });

    let mut linker = Linker::new(engine);
    preview1::add_to_linker_sync(&mut linker, |data: &mut StoreData| &mut data.wasi)
        .map_err(|e| SandboxError::RuntimeInit(anyhow::anyhow!("failed to link WASI: {}", e)))?;

    let instance = linker
        .instantiate(&mut store, module)
        .map_err(|e| SandboxError::ModuleLoad(anyhow::anyhow!("failed to instantiate: {}", e)))?;
    let start = instance
        .get_typed_func::<(), ()>(&mut store, "_start")
        .map_err(|e| {
            SandboxError::ModuleLoad(anyhow::anyhow!("failed to get _start function: {}", e))
        })?;

    let call = start.call(&mut store, ());
    let elapsed = started.elapsed();

    let mut outcome = RunOutcome::from_io(&io, elapsed);

    match call {
        Ok(()) => outcome.exit_code = Some(0),
        Err(e) => {
            if let Some(exit) = e.downcast_ref::<I32Exit>() {
                outcome.exit_code = Some(exit.0);
            } else if matches!(e.downcast_ref::<Trap>(), Some(Trap::Interrupt)) {
                outcome.timed_out = true;
            } else if store.data().limiter.limit_exceeded() {
                outcome.termination = Some(format!(
                    "memory limit of {} bytes exceeded",
                    store.data().limiter.max_memory()
                ));
            } else {
                outcome.termination = Some(format!("wasm trap: {}", e));
            }
        }
    }
    Ok(outcome)
}
