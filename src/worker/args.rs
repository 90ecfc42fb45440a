//! Key/value arguments handed to a worker at spawn time

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Worker arguments, a JSON object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerArgs(Map<String, Value>);

impl WorkerArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Numeric value, also accepting numeric strings
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Parse whitespace-separated `key=value` pairs
    ///
    /// Unsigned integers and `true`/`false` become JSON numbers and booleans,
    /// everything else a string.
    pub fn parse_pairs(input: &str) -> Result<Self, String> {
        let mut args = Self::new();
        for pair in input.split_whitespace() {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("expected key=value, got '{}'", pair))?;
            if key.is_empty() {
                return Err(format!("empty key in '{}'", pair));
            }

            let value = if let Ok(n) = value.parse::<u64>() {
                Value::from(n)
            } else if let Ok(b) = value.parse::<bool>() {
                Value::from(b)
            } else {
                Value::from(value)
            };
            args.0.insert(key.to_string(), value);
        }
        Ok(args)
    }
}

impl From<Map<String, Value>> for WorkerArgs {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
