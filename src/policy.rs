//! Declarative isolation policy.
//!
//! An [`IsolationPolicy`] states which modules a script may import, how
//! long and how much memory it may use, and whether it may touch the
//! network or the filesystem. A policy is built, optionally moved onto a
//! tier preset with [`IsolationPolicy::apply_level`], and then frozen by
//! [`SandboxConfig`](crate::SandboxConfig), which only accepts policies
//! that pass [`IsolationPolicy::validate`].

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};

/// Lowest accepted wall-clock budget, in seconds.
pub const MIN_WALL_TIME_SECS: u64 = 1;
/// Highest accepted wall-clock budget, in seconds.
pub const MAX_WALL_TIME_SECS: u64 = 300;
/// Lowest accepted memory ceiling, in megabytes.
pub const MIN_MEMORY_MB: u64 = 32;
/// Highest accepted memory ceiling, in megabytes.
pub const MAX_MEMORY_MB: u64 = 2048;

/// Modules a production script may import.
pub const STANDARD_MODULES: &[&str] = &[
    "bisect",
    "collections",
    "datetime",
    "decimal",
    "fractions",
    "functools",
    "heapq",
    "itertools",
    "json",
    "math",
    "operator",
    "random",
    "re",
    "statistics",
    "string",
    "time",
];

/// Extra modules granted to the analysis preset.
pub const ANALYSIS_EXTRA_MODULES: &[&str] = &["array", "calendar", "copy", "numbers", "typing"];

/// Minimal numeric/serialization subset kept by the hardened tier.
pub const HARDENED_MODULES: &[&str] = &["json", "math"];

/// Modules available to the filtering preset.
pub const FILTERING_MODULES: &[&str] = &["json", "math", "re"];

/// Named security tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IsolationLevel {
    /// Wide limits, network and reads enabled.
    Development,
    /// Moderate limits, no network, no filesystem.
    #[default]
    Production,
    /// Tight limits and a minimal module set.
    Hardened,
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IsolationLevel::Development => "DEVELOPMENT",
            IsolationLevel::Production => "PRODUCTION",
            IsolationLevel::Hardened => "HARDENED",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for IsolationLevel {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(IsolationLevel::Development),
            "production" | "prod" => Ok(IsolationLevel::Production),
            "hardened" => Ok(IsolationLevel::Hardened),
            other => Err(SandboxError::Policy(format!(
                "unknown isolation level '{other}'"
            ))),
        }
    }
}

/// Security contract for one sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationPolicy {
    /// Active tier.
    pub level: IsolationLevel,
    /// Top-level module names the script may import.
    pub allowed_modules: BTreeSet<String>,
    /// Wall-clock budget in seconds.
    pub max_wall_time_secs: u64,
    /// Memory ceiling in megabytes.
    pub max_memory_mb: u64,
    /// Whether outbound connections are permitted at all.
    pub network_allowed: bool,
    /// Hosts (optionally `host:port`) a script may connect to.
    pub allowed_endpoints: Vec<String>,
    /// Whether the script may open files for reading.
    pub filesystem_read: bool,
    /// Whether the script may open files for writing.
    pub filesystem_write: bool,
    /// Path prefixes readable when `filesystem_read` is set.
    pub allowed_read_paths: Vec<PathBuf>,
}

impl Default for IsolationPolicy {
    fn default() -> Self {
        Self {
            level: IsolationLevel::Production,
            allowed_modules: module_set(STANDARD_MODULES),
            max_wall_time_secs: 30,
            max_memory_mb: 256,
            network_allowed: false,
            allowed_endpoints: Vec::new(),
            filesystem_read: false,
            filesystem_write: false,
            allowed_read_paths: Vec::new(),
        }
    }
}

impl IsolationPolicy {
    /// Create a policy on the given tier.
    pub fn with_level(level: IsolationLevel) -> Self {
        let mut policy = Self::default();
        policy.apply_level(level);
        policy
    }

    /// Policy used by the analysis preset: broad module set, moderate
    /// limits, network restricted to a local endpoint.
    pub fn analysis() -> Self {
        let mut modules = module_set(STANDARD_MODULES);
        modules.extend(module_set(ANALYSIS_EXTRA_MODULES));
        Self {
            level: IsolationLevel::Production,
            allowed_modules: modules,
            max_wall_time_secs: 60,
            max_memory_mb: 512,
            network_allowed: true,
            allowed_endpoints: vec!["localhost:8000".to_string()],
            filesystem_read: false,
            filesystem_write: false,
            allowed_read_paths: Vec::new(),
        }
    }

    /// Policy used by the filtering preset: very small module set, tight
    /// limits, no network.
    pub fn filtering() -> Self {
        Self {
            level: IsolationLevel::Hardened,
            allowed_modules: module_set(FILTERING_MODULES),
            max_wall_time_secs: 10,
            max_memory_mb: 64,
            network_allowed: false,
            allowed_endpoints: Vec::new(),
            filesystem_read: false,
            filesystem_write: false,
            allowed_read_paths: Vec::new(),
        }
    }

    /// Move the policy onto a tier preset.
    ///
    /// Every field a tier controls is overwritten, so the outcome never
    /// depends on the tier applied before.
    pub fn apply_level(&mut self, level: IsolationLevel) {
        self.level = level;
        match level {
            IsolationLevel::Development => {
                self.allowed_modules = module_set(STANDARD_MODULES);
                self.max_wall_time_secs = 60;
                self.max_memory_mb = 512;
                self.network_allowed = true;
                self.allowed_endpoints = vec!["localhost".to_string()];
                self.filesystem_read = true;
                self.filesystem_write = false;
                self.allowed_read_paths = vec![PathBuf::from("/tmp")];
            }
            IsolationLevel::Production => {
                self.allowed_modules = module_set(STANDARD_MODULES);
                self.max_wall_time_secs = 30;
                self.max_memory_mb = 256;
                self.network_allowed = false;
                self.allowed_endpoints = Vec::new();
                self.filesystem_read = false;
                self.filesystem_write = false;
                self.allowed_read_paths = Vec::new();
            }
            IsolationLevel::Hardened => {
                self.allowed_modules = module_set(HARDENED_MODULES);
                self.max_wall_time_secs = 10;
                self.max_memory_mb = 128;
                self.network_allowed = false;
                self.allowed_endpoints = Vec::new();
                self.filesystem_read = false;
                self.filesystem_write = false;
                self.allowed_read_paths = Vec::new();
            }
        }
    }

    /// Check bounds and internal consistency.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_WALL_TIME_SECS..=MAX_WALL_TIME_SECS).contains(&self.max_wall_time_secs) {
            return Err(SandboxError::Policy(format!(
                "max_wall_time must be between {MIN_WALL_TIME_SECS} and {MAX_WALL_TIME_SECS} seconds, got {}",
                self.max_wall_time_secs
            )));
        }

        if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&self.max_memory_mb) {
            return Err(SandboxError::Policy(format!(
                "max_memory must be between {MIN_MEMORY_MB} and {MAX_MEMORY_MB} MB, got {}",
                self.max_memory_mb
            )));
        }

        if self.network_allowed && self.allowed_endpoints.is_empty() {
            return Err(SandboxError::Policy(
                "network access requires at least one allowed endpoint".to_string(),
            ));
        }

        if let Some(bad) = self
            .allowed_modules
            .iter()
            .find(|name| !is_module_name(name))
        {
            return Err(SandboxError::Policy(format!(
                "'{bad}' is not a valid top-level module name"
            )));
        }

        Ok(())
    }

    /// Whether `name` (possibly dotted) may be imported.
    pub fn is_module_allowed(&self, name: &str) -> bool {
        let root = name.split('.').next().unwrap_or(name);
        self.allowed_modules.contains(root)
    }

    /// Grant an additional module.
    pub fn allow_module(&mut self, name: impl Into<String>) -> &mut Self {
        self.allowed_modules.insert(name.into());
        self
    }

    /// Layer caller-supplied overrides onto this policy.
    ///
    /// The tier is applied first so that explicit overrides win over the
    /// tier's presets.
    pub fn apply_overrides(&mut self, overrides: &PolicyOverrides) {
        if let Some(level) = overrides.level {
            self.apply_level(level);
        }
        if let Some(modules) = &overrides.allowed_modules {
            self.allowed_modules = modules.iter().cloned().collect();
        }
        self.allowed_modules
            .extend(overrides.extra_modules.iter().cloned());
        if let Some(secs) = overrides.max_wall_time_secs {
            self.max_wall_time_secs = secs;
        }
        if let Some(mb) = overrides.max_memory_mb {
            self.max_memory_mb = mb;
        }
        if let Some(allowed) = overrides.network_allowed {
            self.network_allowed = allowed;
        }
        if let Some(endpoints) = &overrides.allowed_endpoints {
            self.allowed_endpoints = endpoints.clone();
        }
        if let Some(read) = overrides.filesystem_read {
            self.filesystem_read = read;
        }
        if let Some(write) = overrides.filesystem_write {
            self.filesystem_write = write;
        }
        if let Some(paths) = &overrides.allowed_read_paths {
            self.allowed_read_paths = paths.clone();
        }
    }
}

/// Optional changes layered onto a base policy by the custom preset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOverrides {
    pub level: Option<IsolationLevel>,
    /// Replaces the module set.
    pub allowed_modules: Option<Vec<String>>,
    /// Added to the module set after any replacement.
    pub extra_modules: Vec<String>,
    pub max_wall_time_secs: Option<u64>,
    pub max_memory_mb: Option<u64>,
    pub network_allowed: Option<bool>,
    pub allowed_endpoints: Option<Vec<String>>,
    pub filesystem_read: Option<bool>,
    pub filesystem_write: Option<bool>,
    pub allowed_read_paths: Option<Vec<PathBuf>>,
}

fn module_set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|name| name.to_string()).collect()
}

fn is_module_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_policy_is_valid() {
        let policy = IsolationPolicy::default();
        assert_eq!(policy.level, IsolationLevel::Production);
        assert!(policy.validate().is_ok());
        assert!(policy.is_module_allowed("math"));
        assert!(!policy.is_module_allowed("os"));
    }

    #[test]
    fn test_presets_are_valid() {
        for policy in [
            IsolationPolicy::analysis(),
            IsolationPolicy::filtering(),
            IsolationPolicy::with_level(IsolationLevel::Development),
            IsolationPolicy::with_level(IsolationLevel::Hardened),
        ] {
            assert!(policy.validate().is_ok(), "{policy:?}");
        }
    }

    #[test]
    fn test_validate_rejects_bounds() {
        let mut policy = IsolationPolicy::default();
        policy.max_wall_time_secs = 0;
        assert!(policy.validate().unwrap_err().is_policy());

        policy.max_wall_time_secs = 301;
        assert!(policy.validate().is_err());

        policy.max_wall_time_secs = 300;
        policy.max_memory_mb = 31;
        assert!(policy.validate().is_err());

        policy.max_memory_mb = 2049;
        assert!(policy.validate().is_err());

        policy.max_memory_mb = 2048;
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_network_requires_endpoint() {
        let mut policy = IsolationPolicy::default();
        policy.network_allowed = true;
        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("endpoint"));

        policy.allowed_endpoints.push("localhost".to_string());
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_module_names() {
        let mut policy = IsolationPolicy::default();
        policy.allow_module("os.path");
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_dotted_imports_check_root() {
        let policy = IsolationPolicy::default();
        assert!(policy.is_module_allowed("collections.abc"));
        assert!(!policy.is_module_allowed("os.path"));
    }

    #[test]
    fn test_hardened_overwrites_development() {
        let mut policy = IsolationPolicy::with_level(IsolationLevel::Development);
        policy.apply_level(IsolationLevel::Hardened);

        assert_eq!(policy.max_wall_time_secs, 10);
        assert_eq!(policy.max_memory_mb, 128);
        assert!(!policy.network_allowed);
        assert!(policy.allowed_endpoints.is_empty());
        assert!(!policy.filesystem_read);
        assert!(policy.allowed_read_paths.is_empty());
        assert_eq!(policy.allowed_modules, module_set(HARDENED_MODULES));
    }

    #[test]
    fn test_development_widens_limits() {
        let policy = IsolationPolicy::with_level(IsolationLevel::Development);
        assert_eq!(policy.max_wall_time_secs, 60);
        assert_eq!(policy.max_memory_mb, 512);
        assert!(policy.network_allowed);
        assert!(policy.filesystem_read);
    }

    #[test]
    fn test_overrides_layer_on_top_of_level() {
        let overrides = PolicyOverrides {
            level: Some(IsolationLevel::Hardened),
            extra_modules: vec!["statistics".to_string()],
            max_wall_time_secs: Some(5),
            ..Default::default()
        };

        let mut policy = IsolationPolicy::default();
        policy.apply_overrides(&overrides);

        assert_eq!(policy.level, IsolationLevel::Hardened);
        assert_eq!(policy.max_wall_time_secs, 5);
        assert_eq!(policy.max_memory_mb, 128);
        assert!(policy.is_module_allowed("statistics"));
        assert!(policy.is_module_allowed("math"));
        assert!(!policy.is_module_allowed("random"));
    }

    #[test]
    fn test_level_parse_and_display() {
        assert_eq!(
            "hardened".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::Hardened
        );
        assert_eq!(IsolationLevel::Development.to_string(), "DEVELOPMENT");
        assert!("paranoid".parse::<IsolationLevel>().is_err());
    }

    fn any_level() -> impl Strategy<Value = IsolationLevel> {
        prop_oneof![
            Just(IsolationLevel::Development),
            Just(IsolationLevel::Production),
            Just(IsolationLevel::Hardened),
        ]
    }

    proptest! {
        #[test]
        fn prop_validate_matches_bounds(
            secs in 0u64..400,
            mb in 0u64..3000,
            network in any::<bool>(),
            endpoints in 0usize..3,
        ) {
            let policy = IsolationPolicy {
                max_wall_time_secs: secs,
                max_memory_mb: mb,
                network_allowed: network,
                allowed_endpoints: (0..endpoints).map(|i| format!("host{i}")).collect(),
                ..IsolationPolicy::default()
            };

            let expected = (1..=300).contains(&secs)
                && (32..=2048).contains(&mb)
                && (!network || endpoints > 0);
            prop_assert_eq!(policy.validate().is_ok(), expected);
        }

        #[test]
        fn prop_apply_level_is_idempotent(first in any_level(), level in any_level()) {
            let mut once = IsolationPolicy::with_level(first);
            once.apply_level(level);

            let mut twice = once.clone();
            twice.apply_level(level);

            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_apply_level_forgets_previous_tier(a in any_level(), b in any_level(), level in any_level()) {
            let mut from_a = IsolationPolicy::with_level(a);
            from_a.apply_level(level);
            let mut from_b = IsolationPolicy::with_level(b);
            from_b.apply_level(level);

            prop_assert_eq!(from_a, from_b);
        }
    }
}
