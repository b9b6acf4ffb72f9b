//! Layered configuration with defined lookup precedence.
//!
//! Configuration comes from a colon-separated list of TOML files named by the
//! `BENCHKIT_USER_CONFIG` environment variable (first entry has the highest
//! priority) plus a snapshot of the process environment. Resolution order for
//! a dotted key such as `scanners.vxi11.scan_timeout`:
//!
//! 1. An environment variable directly mapped to the key (see
//!    [`ENV_OVERRIDES`]), if set.
//! 2. The files, in list order. Within one file a `<hostname>.<key>` entry is
//!    preferred over the unscoped `<key>`; the first file defining either
//!    form wins. A later file never overrides an earlier one, not even with
//!    a hostname-scoped entry.
//! 3. A hard-coded default supplied by the caller (`*_or` getters), else
//!    absent.
//!
//! Missing files are skipped without error. A malformed file fails the whole
//! store with [`ConfigError::Parse`]; the global store memoizes that outcome
//! so the failure is reported once, at first resolution, not per key.
//!
//! The store is explicit, documented global state: built lazily on first
//! lookup via [`ConfigStore::global`], immutable afterwards, torn down only
//! by process exit. Code needing isolation (tests, embedded use) builds a
//! private store with [`ConfigStore::from_files`] or
//! [`ConfigStore::from_strs`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::error::{ConfigError, Result};

/// Environment variable naming the colon-separated config file list.
pub const USER_CONFIG_ENV: &str = "BENCHKIT_USER_CONFIG";

/// Keys that can be overridden directly through the environment.
///
/// An entry `(key, var)` means that if `var` is set, it wins over every
/// configuration file for `key`. Values are parsed with the same coercion
/// rules as the typed getters.
pub const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("scopenet", "BENCHKIT_SCOPENET"),
    ("scanners.vxi11.scan_timeout", "BENCHKIT_VXI11_SCAN_TIMEOUT"),
    ("scanners.vxi11.scan_verbose", "BENCHKIT_SCAN_VERBOSE"),
    ("scanners.visa.backend", "BENCHKIT_VISA_BACKEND"),
];

/// A resolved configuration value.
///
/// Environment overrides always arrive as [`Value::Str`]; the typed getters
/// coerce strings into the requested type so `BENCHKIT_VXI11_SCAN_TIMEOUT=0.05`
/// behaves like `scan_timeout = 0.05` in a file.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// String value.
    Str(String),
    /// Floating point value.
    Float(f64),
    /// Integer value.
    Int(i64),
    /// Boolean value.
    Bool(bool),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Float(_) => "float",
            Value::Int(_) => "integer",
            Value::Bool(_) => "boolean",
        }
    }

    fn from_toml(value: &toml::Value) -> Option<Self> {
        match value {
            toml::Value::String(s) => Some(Value::Str(s.clone())),
            toml::Value::Float(f) => Some(Value::Float(*f)),
            toml::Value::Integer(i) => Some(Value::Int(*i)),
            toml::Value::Boolean(b) => Some(Value::Bool(*b)),
            // Tables, arrays and datetimes are not part of the key-value
            // model; treat them as absent.
            _ => None,
        }
    }
}

/// One loaded configuration file.
struct Layer {
    /// Where the layer came from (diagnostics only).
    source: String,
    table: toml::Table,
}

/// Merged, immutable view of the layered configuration.
pub struct ConfigStore {
    layers: Vec<Layer>,
    /// Snapshot of the process environment taken at load time.
    env: HashMap<String, String>,
    hostname: String,
}

static GLOBAL: OnceCell<std::result::Result<Arc<ConfigStore>, ConfigError>> = OnceCell::new();

impl ConfigStore {
    /// Process-wide store, loaded lazily from `BENCHKIT_USER_CONFIG`.
    ///
    /// The first call loads and memoizes; every later call returns the same
    /// store (or the same parse error).
    pub fn global() -> Result<Arc<ConfigStore>> {
        let loaded = GLOBAL.get_or_init(|| ConfigStore::load_default().map(Arc::new));
        loaded.clone().map_err(Into::into)
    }

    /// Load from the `BENCHKIT_USER_CONFIG` path list and the environment.
    pub fn load_default() -> std::result::Result<ConfigStore, ConfigError> {
        let paths: Vec<String> = std::env::var(USER_CONFIG_ENV)
            .map(|raw| {
                raw.split(':')
                    .filter(|p| !p.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        Self::from_files(paths.iter().map(Path::new))
    }

    /// Build a store from an explicit file list, first entry highest priority.
    ///
    /// Missing files are skipped; malformed files fail the whole store.
    pub fn from_files<'a>(
        paths: impl IntoIterator<Item = &'a Path>,
    ) -> std::result::Result<ConfigStore, ConfigError> {
        let mut layers = Vec::new();
        for path in paths {
            let text = match std::fs::read_to_string(path) {
                Ok(text) => text,
                Err(_) => {
                    debug!(path = %path.display(), "config file missing, skipped");
                    continue;
                }
            };
            let table: toml::Table =
                text.parse().map_err(|err: toml::de::Error| ConfigError::Parse {
                    path: path.display().to_string(),
                    message: err.to_string(),
                })?;
            layers.push(Layer {
                source: path.display().to_string(),
                table,
            });
        }
        debug!(layers = layers.len(), "configuration loaded");
        Ok(Self::assemble(layers))
    }

    /// Build a store from in-memory TOML sources (tests, embedded defaults).
    pub fn from_strs(sources: &[&str]) -> std::result::Result<ConfigStore, ConfigError> {
        let mut layers = Vec::new();
        for (idx, text) in sources.iter().enumerate() {
            let table: toml::Table =
                text.parse().map_err(|err: toml::de::Error| ConfigError::Parse {
                    path: format!("<inline:{idx}>"),
                    message: err.to_string(),
                })?;
            layers.push(Layer {
                source: format!("<inline:{idx}>"),
                table,
            });
        }
        Ok(Self::assemble(layers))
    }

    fn assemble(layers: Vec<Layer>) -> ConfigStore {
        ConfigStore {
            layers,
            env: std::env::vars().collect(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }

    /// Override the host identity used for `<hostname>.<key>` scoping.
    ///
    /// Intended for tests; production code keeps the detected hostname.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Host identity used for hostname-scoped entries.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Resolve a dotted key through the full precedence chain.
    pub fn resolve(&self, key: &str) -> Option<Value> {
        if let Some((_, var)) = ENV_OVERRIDES.iter().find(|(k, _)| *k == key) {
            if let Some(raw) = self.env.get(*var) {
                return Some(Value::Str(raw.clone()));
            }
        }
        let scoped = format!("{}.{}", self.hostname, key);
        for layer in &self.layers {
            let hit = lookup(&layer.table, &scoped).or_else(|| lookup(&layer.table, key));
            if let Some(value) = hit.and_then(Value::from_toml) {
                debug!(key, source = %layer.source, "config key resolved");
                return Some(value);
            }
        }
        None
    }

    /// String value for `key`, if present.
    pub fn get_str(&self, key: &str) -> Result<Option<String>> {
        match self.resolve(key) {
            Some(Value::Str(s)) => Ok(Some(s)),
            Some(other) => Err(self.mismatch(key, "string", &other)),
            None => Ok(None),
        }
    }

    /// Float value for `key`, if present. Integers and numeric strings coerce.
    pub fn get_f64(&self, key: &str) -> Result<Option<f64>> {
        match self.resolve(key) {
            Some(Value::Float(f)) => Ok(Some(f)),
            Some(Value::Int(i)) => Ok(Some(i as f64)),
            Some(Value::Str(s)) => s
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| self.mismatch(key, "float", &Value::Str(s))),
            Some(other) => Err(self.mismatch(key, "float", &other)),
            None => Ok(None),
        }
    }

    /// Unsigned integer value for `key`, if present.
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.resolve(key) {
            Some(Value::Int(i)) if i >= 0 => Ok(Some(i as u64)),
            Some(Value::Str(s)) => s
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| self.mismatch(key, "integer", &Value::Str(s))),
            Some(other) => Err(self.mismatch(key, "integer", &other)),
            None => Ok(None),
        }
    }

    /// Boolean value for `key`, if present.
    ///
    /// String coercion accepts `1/true/yes/on` and `0/false/no/off`
    /// (case-insensitive), matching common environment-variable usage.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.resolve(key) {
            Some(Value::Bool(b)) => Ok(Some(b)),
            Some(Value::Str(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                _ => Err(self.mismatch(key, "boolean", &Value::Str(s))),
            },
            Some(other) => Err(self.mismatch(key, "boolean", &other)),
            None => Ok(None),
        }
    }

    /// Float value for `key`, falling back to `default`.
    pub fn get_f64_or(&self, key: &str, default: f64) -> Result<f64> {
        Ok(self.get_f64(key)?.unwrap_or(default))
    }

    /// Unsigned integer value for `key`, falling back to `default`.
    pub fn get_u64_or(&self, key: &str, default: u64) -> Result<u64> {
        Ok(self.get_u64(key)?.unwrap_or(default))
    }

    /// Boolean value for `key`, falling back to `default`.
    pub fn get_bool_or(&self, key: &str, default: bool) -> Result<bool> {
        Ok(self.get_bool(key)?.unwrap_or(default))
    }

    fn mismatch(&self, key: &str, expected: &'static str, actual: &Value) -> crate::Error {
        ConfigError::TypeMismatch {
            key: key.to_string(),
            expected,
            actual: actual.type_name(),
        }
        .into()
    }
}

/// Walk a dotted path through nested TOML tables.
fn lookup<'a>(table: &'a toml::Table, dotted: &str) -> Option<&'a toml::Value> {
    let mut parts = dotted.split('.');
    let first = parts.next()?;
    let mut current = table.get(first)?;
    for part in parts {
        current = current.as_table()?.get(part)?;
    }
    Some(current)
}
