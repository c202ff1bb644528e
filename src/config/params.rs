//! Connection parameters
//!
//! A connection profile is a flat map of keys (`server`, `username`, `ssh_auth`,
//! `ssh_tunnel_privatekey`, ...) to string or integer values. The core reads it
//! through [`ConnectionParams`] and writes back only remembered secrets and an
//! edited username.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Parameter provider consumed by the session core.
pub trait ConnectionParams: Send + Sync {
    /// String value for `key`, `None` when unset.
    fn get_string(&self, key: &str) -> Option<String>;

    /// Integer value for `key`, `default` when unset or not numeric.
    fn get_int(&self, key: &str, default: i64) -> i64;

    /// Store (or with `None`, clear) a string value.
    fn set_string(&self, key: &str, value: Option<&str>);

    /// String value, treating the empty string as unset.
    fn get_non_empty(&self, key: &str) -> Option<String> {
        self.get_string(key).filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid parameter file: {0}")]
    Json(#[from] serde_json::Error),
}

/// A single parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Bool(bool),
    Str(String),
}

/// JSON-backed, in-memory implementation of [`ConnectionParams`].
#[derive(Debug, Default)]
pub struct ParamStore {
    values: RwLock<HashMap<String, ParamValue>>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(key, value)` string pairs.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let store = Self::new();
        for (k, v) in pairs {
            store.set_string(k, Some(v));
        }
        store
    }

    /// Parse a JSON object of parameters.
    pub fn from_json(content: &str) -> Result<Self, ParamsError> {
        let values: HashMap<String, ParamValue> = serde_json::from_str(content)?;
        Ok(Self {
            values: RwLock::new(values),
        })
    }

    /// Load a parameter file.
    pub fn load(path: &Path) -> Result<Self, ParamsError> {
        let content = std::fs::read_to_string(path)?;
        let store = Self::from_json(&content)?;
        debug!("Loaded {} connection parameters from {:?}", store.values.read().len(), path);
        Ok(store)
    }

    /// Write the parameters back as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), ParamsError> {
        let content = serde_json::to_string_pretty(&*self.values.read())?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn set_int(&self, key: &str, value: i64) {
        self.values.write().insert(key.to_string(), ParamValue::Int(value));
    }
}

impl ConnectionParams for ParamStore {
    fn get_string(&self, key: &str) -> Option<String> {
        match self.values.read().get(key)? {
            ParamValue::Str(s) => Some(s.clone()),
            ParamValue::Int(i) => Some(i.to_string()),
            ParamValue::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        }
    }

    fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.values.read().get(key) {
            Some(ParamValue::Int(i)) => *i,
            Some(ParamValue::Bool(b)) => *b as i64,
            Some(ParamValue::Str(s)) => s.trim().parse().unwrap_or(default),
            None => default,
        }
    }

    fn set_string(&self, key: &str, value: Option<&str>) {
        let mut values = self.values.write();
        match value {
            Some(v) => {
                values.insert(key.to_string(), ParamValue::Str(v.to_string()));
            }
            None => {
                values.remove(key);
            }
        }
    }
}
