//! # Configuration
//!
//! A plain string key/value store. Keys are dotted (`database.url`,
//! `auth.jwt.secret`) and can be layered from defaults, code and the
//! process environment:
//!
//! ```rust
//! use tms_core::TmsConfig;
//!
//! let mut config = TmsConfig::new();
//! config.set("database.max_connections", "20");
//! config.load_vars("TMS__", [("TMS__DATABASE__MAX_CONNECTIONS", "40")]);
//!
//! let snapshot = config.snapshot();
//! assert_eq!(snapshot.get_u32("database.max_connections"), Some(40));
//! ```
//!
//! Environment variables are mapped by stripping the prefix, lower-casing
//! and turning `__` into `.`: `TMS__AUTH__JWT__SECRET` → `auth.jwt.secret`.

use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub struct TmsConfig {
    values: HashMap<String, String>,
}

impl TmsConfig {
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    /// Set a configuration key to a string value.
    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.values.insert(key.into(), value.into());
    }

    /// Set a key only if nothing has set it yet.
    pub fn set_default<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.values.entry(key.into()).or_insert_with(|| value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Overlay every `PREFIX...` variable of the process environment.
    pub fn load_env(&mut self, prefix: &str) {
        self.load_vars(prefix, std::env::vars());
    }

    /// Overlay an explicit set of variables, using the same mapping as [`load_env`](Self::load_env).
    pub fn load_vars<I, K, V>(&mut self, prefix: &str, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in vars {
            if let Some(stripped) = key.as_ref().strip_prefix(prefix) {
                let normalized = stripped.to_lowercase().replace("__", ".");
                if !normalized.is_empty() {
                    self.values.insert(normalized, value.into());
                }
            }
        }
    }

    pub fn snapshot(&self) -> TmsConfigSnapshot {
        TmsConfigSnapshot::new(self.values.clone())
    }
}

/// Immutable view handed to startup code once configuration is final.
#[derive(Debug, Clone, Default)]
pub struct TmsConfigSnapshot {
    map: HashMap<String, String>,
}

impl TmsConfigSnapshot {
    pub(crate) fn new(map: HashMap<String, String>) -> Self {
        Self { map }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(|s| s.as_str())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.map.get(key).cloned()
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|v| v.trim().parse::<usize>().ok())
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key).and_then(|v| v.trim().parse::<u32>().ok())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.trim().parse::<bool>().ok())
    }
}
