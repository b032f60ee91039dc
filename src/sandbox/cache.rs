//! Compiled interpreter cache for the Wasm runtime.
//!
//! A `wasmtime::Module` is only usable with the `Engine` that compiled it,
//! so the cache owns its engine and every module in it belongs to that
//! engine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{OnceLock, RwLock};

use wasmtime::{Engine, Module};

use crate::error::{Result, SandboxError};

/// A thread-safe cache of compiled interpreter modules keyed by
/// canonical path.
pub struct ModuleCache {
    engine: Engine,
    modules: RwLock<HashMap<PathBuf, Module>>,
}

impl std::fmt::Debug for ModuleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCache")
            .field("engine", &"<wasmtime::Engine>")
            .field("len", &self.len())
            .finish()
    }
}

impl ModuleCache {
    /// Create an empty cache around a new epoch-interruptible engine.
    pub fn new() -> Result<Self> {
        let mut config = wasmtime::Config::new();
        config.epoch_interruption(true);
        let engine = Engine::new(&config).map_err(|e| {
            SandboxError::RuntimeInit(anyhow::anyhow!("failed to create engine: {}", e))
        })?;
        Ok(Self {
            engine,
            modules: RwLock::new(HashMap::new()),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Get a cached module or compile it if not present.
    ///
    /// The path is canonicalized first so relative paths and symlinks to
    /// the same file share one entry.
    pub fn get_or_compile(&self, path: impl AsRef<Path>) -> Result<Module> {
        let path = path.as_ref();
        let canonical_path = std::fs::canonicalize(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SandboxError::InterpreterNotFound(path.display().to_string())
            } else {
                SandboxError::Io(e)
            }
        })?;

        if let Some(module) = self.read().get(&canonical_path) {
            return Ok(module.clone());
        }

        // Compile outside the lock.
        let wasm_bytes = std::fs::read(&canonical_path)?;
        let module = Module::new(&self.engine, &wasm_bytes).map_err(|e| {
            SandboxError::ModuleLoad(anyhow::anyhow!("failed to compile module: {}", e))
        })?;

        let mut modules = self.write();
        // Another thread may have compiled the same file meanwhile.
        let entry = modules.entry(canonical_path).or_insert(module);
        Ok(entry.clone())
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        std::fs::canonicalize(path)
            .map(|canonical| self.read().contains_key(&canonical))
            .unwrap_or(false)
    }

    /// Remove a module; returns `true` if it was present.
    pub fn remove(&self, path: impl AsRef<Path>) -> bool {
        std::fs::canonicalize(path)
            .map(|canonical| self.write().remove(&canonical).is_some())
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<PathBuf, Module>> {
        self.modules.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<PathBuf, Module>> {
        self.modules.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

static GLOBAL_CACHE: OnceLock<ModuleCache> = OnceLock::new();

/// The process-wide cache used by Wasm-backed managers.
pub fn global_cache() -> Result<&'static ModuleCache> {
    if let Some(cache) = GLOBAL_CACHE.get() {
        return Ok(cache);
    }
    let cache = ModuleCache::new()?;
    // A concurrent initializer may win; either engine is equivalent.
    let _ = GLOBAL_CACHE.set(cache);
    GLOBAL_CACHE
        .get()
        .ok_or_else(|| SandboxError::RuntimeInit(anyhow::anyhow!("module cache unavailable")))
}
