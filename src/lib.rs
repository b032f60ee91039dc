//! # Analysis Sandbox
//!
//! Contained execution of generated Python analysis scripts.
//!
//! A [`SandboxManager`] takes an untrusted script plus a JSON [`Context`],
//! wraps both into a guarded program, runs it in a throwaway working
//! directory under a child interpreter and hands back an
//! [`ExecutionResult`]. `execute` never returns `Err`: every failure (a
//! denied import, an exception, a timeout, unparsable output, a setup
//! problem) is classified into the result.
//!
//! Scripts get a restricted data library, importable as `safe_data`, with
//! two engines whose Rust counterparts live in [`data`]:
//! [`SafeArray`] (statistics over a float vector) and [`SafeTable`]
//! (filter, group, aggregate, sort and join over records).
//!
//! ## Example
//!
//! ```rust,no_run
//! use analysis_sandbox_rs::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = SandboxFactory::new().filtering()?;
//!
//!     let mut context = Context::new();
//!     context.insert("prices", json!([10.0, 12.5, 11.0]))?;
//!
//!     let result = manager
//!         .execute("result = max(prices) - min(prices)", &context)
//!         .await;
//!
//!     assert!(result.is_success());
//!     assert_eq!(result.output, Some(json!(2.5)));
//!     Ok(())
//! }
//! ```
//!
//! ## Isolation layers
//!
//! Enforced outside the interpreter:
//!
//! - A fresh child per run with a cleared environment and a private temp
//!   dir as its working directory.
//! - On the process runtime, rlimits for address space, CPU time and file
//!   size, plus (on Linux x86_64/aarch64, when the policy disallows network)
//!   a seccomp filter that fails every `socket(2)` call.
//! - On the wasm runtime, a Wasmtime store with a memory limiter and a WASI
//!   context whose only preopened directory is the temp dir.
//! - A wall-clock deadline: the process group is killed, or the wasm guest
//!   is interrupted through epoch deadlines.
//!
//! Checked inside the interpreter, as a policy layer rather than a
//! boundary: the import allow-list, the `open`/`io.open` read and write
//! checks and the socket endpoint checks. A script can reach modules the
//! allow-list would refuse through attributes of modules it may import
//! (`json.codecs.sys.modules`), so host file reads on the process runtime
//! are only as private as the host account running the interpreter. Use
//! the wasm runtime when scripts must not see the host filesystem.

mod telemetry;

pub mod context;
pub mod data;
pub mod error;
pub mod policy;
pub mod prelude;
pub mod sandbox;

pub use context::Context;
pub use data::{Aggregation, JoinHow, Operator, SafeArray, SafeTable};
pub use error::{ErrorKind, Result, SandboxError};
pub use policy::{IsolationLevel, IsolationPolicy, PolicyOverrides};
pub use sandbox::cache::{global_cache, ModuleCache};
pub use sandbox::config::{Runtime, SandboxConfig, SandboxConfigBuilder};
pub use sandbox::executor::{ExecuteOptions, ExecutionResult, SandboxManager};
pub use sandbox::factory::SandboxFactory;
pub use sandbox::program::{validate_code, CodeFinding, CodeReport, FindingCategory, GuardedProgram};
