//! Payload assembly with collision-safe key insertion.

use serde_json::{Map, Value};
use tracing::warn;

/// One merged tick result: top-level key to arbitrary structured value.
pub type Payload = Map<String, Value>;

/// Key under which all plugin output is nested.
pub const PLUGINS_KEY: &str = "plugins";

/// Returns `key` if it is free, otherwise the first free `key_N` with N >= 2.
pub fn unique_key(key: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(key) {
        return key.to_string();
    }
    (2u32..)
        .map(|n| format!("{key}_{n}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| key.to_string())
}

/// Collects results for one tick. Every insert that would overwrite an
/// existing entry is renamed instead, logged once, and counted.
#[derive(Debug, Default)]
pub struct PayloadBuilder {
    entries: Payload,
    collisions: usize,
}

impl PayloadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `value` under `key`, renaming it if the key is already taken.
    /// Returns the key actually used.
    pub fn insert(&mut self, key: &str, value: Value) -> String {
        let used = unique_key(key, |k| self.entries.contains_key(k));
        if used != key {
            self.collisions += 1;
            warn!(key, renamed = %used, "Duplicate result key, storing under a suffixed key");
        }
        self.entries.insert(used.clone(), value);
        used
    }

    pub fn extend(&mut self, values: Payload) {
        for (key, value) in values {
            self.insert(&key, value);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of renames performed so far.
    pub fn collisions(&self) -> usize {
        self.collisions
    }

    pub fn into_payload(self) -> Payload {
        self.entries
    }
}
