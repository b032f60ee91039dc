//! Variables injected into the sandboxed script as top-level bindings.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Number, Value};

use crate::error::{Result, SandboxError};

const PYTHON_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

/// JSON bindings handed to the script.
///
/// Keys are checked when inserted, so a `Context` can always be rendered
/// into the guarded program.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    bindings: BTreeMap<String, Value>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a JSON value.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Result<&mut Self> {
        let key = key.into();
        check_binding_name(&key)?;
        self.bindings.insert(key, value);
        Ok(self)
    }

    /// Bind a float, rejecting NaN and infinities which JSON cannot carry.
    pub fn insert_number(&mut self, key: impl Into<String>, value: f64) -> Result<&mut Self> {
        let key = key.into();
        let number = Number::from_f64(value).ok_or_else(|| {
            SandboxError::InvalidContext(format!("'{key}' is not a finite number: {value}"))
        })?;
        self.insert(key, Value::Number(number))
    }

    /// Bind any serializable value.
    pub fn insert_serialize<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<&mut Self> {
        let key = key.into();
        let value = serde_json::to_value(value).map_err(|e| {
            SandboxError::InvalidContext(format!("'{key}' is not JSON-representable: {e}"))
        })?;
        self.insert(key, value)
    }

    /// Build a context from a JSON object.
    pub fn from_object(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(SandboxError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        };

        let mut context = Self::new();
        for (key, value) in map {
            context.insert(key, value)?;
        }
        Ok(context)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.bindings.get(key)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Iterate bindings in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.bindings.iter()
    }

    /// Render the bindings as one JSON object.
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .bindings
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(map)
    }
}

fn check_binding_name(key: &str) -> Result<()> {
    let mut chars = key.chars();
    let valid_start = matches!(chars.next(), Some(c) if c == '_' || c.is_alphabetic());
    if !valid_start || !chars.all(|c| c == '_' || c.is_alphanumeric()) {
        return Err(SandboxError::InvalidContext(format!(
            "'{key}' is not a valid identifier"
        )));
    }
    if PYTHON_KEYWORDS.contains(&key) {
        return Err(SandboxError::InvalidContext(format!(
            "'{key}' is a reserved keyword"
        )));
    }
    if key.starts_with("__") {
        return Err(SandboxError::InvalidContext(format!(
            "'{key}' uses the reserved '__' prefix"
        )));
    }
    Ok(())
}
