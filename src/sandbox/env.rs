//! Restricted environment handed to the child interpreter.

use std::collections::BTreeMap;

/// Host variables copied into the child when present.
pub const PASSTHROUGH_VARS: &[&str] = &["PATH", "HOME"];

/// Secret-bearing variables that never reach the child.
pub const DENIED_VARS: &[&str] = &[
    "ALPACA_API_KEY",
    "ALPACA_SECRET_KEY",
    "ANTHROPIC_API_KEY",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "AZURE_CLIENT_SECRET",
    "BROKER_API_KEY",
    "BROKER_API_SECRET",
    "DATABASE_URL",
    "GITHUB_TOKEN",
    "GOOGLE_APPLICATION_CREDENTIALS",
    "OPENAI_API_KEY",
    "POLYGON_API_KEY",
    "REDIS_URL",
    "SECRET_KEY",
];

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Minimal environment for one child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestrictedEnv {
    vars: BTreeMap<String, String>,
}

impl RestrictedEnv {
    /// Build from the current process environment.
    pub fn from_host() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Build from an explicit variable list.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut kept = BTreeMap::new();
        for (key, value) in vars {
            let key = key.into();
            if PASSTHROUGH_VARS.contains(&key.as_str()) && !is_denied(&key) {
                kept.insert(key, value.into());
            }
        }

        kept.entry("PATH".to_string())
            .or_insert_with(|| FALLBACK_PATH.to_string());
        kept.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        kept.insert("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string());

        Self { vars: kept }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

fn is_denied(key: &str) -> bool {
    DENIED_VARS.iter().any(|denied| denied.eq_ignore_ascii_case(key))
}
