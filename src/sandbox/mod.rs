//! Sandbox module containing all execution-related components.

pub mod cache;
pub mod config;
pub mod env;
pub mod executor;
pub mod factory;
pub mod io;
pub mod limits;
pub mod process;
pub mod program;
pub mod seccomp;
pub mod wasm;
