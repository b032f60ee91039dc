//! Prelude module for convenient imports.

pub use crate::context::Context;
pub use crate::data::{Aggregation, JoinHow, Operator, SafeArray, SafeTable};
pub use crate::error::{ErrorKind, Result, SandboxError};
pub use crate::policy::{IsolationLevel, IsolationPolicy, PolicyOverrides};
pub use crate::sandbox::{
    config::{Runtime, SandboxConfig},
    executor::{ExecuteOptions, ExecutionResult, SandboxManager},
    factory::SandboxFactory,
};
