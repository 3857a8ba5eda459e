//! Generic OS telemetry sources backed by `/proc` and `/sys`.
//!
//! Two backends exist: counter-sampled categories ([`counter`]) that derive
//! rates from consecutive samples, and queryable object classes ([`object`])
//! that return point-in-time property bags. Both yield ordered, named
//! [`Instance`]s so the selector and populator can treat them uniformly.

pub mod counter;
pub mod object;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub use counter::CounterSource;
pub use object::ObjectSource;

/// Which telemetry backend a descriptor reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Counter,
    Object,
}

/// One enumerated instance and its raw field values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Instance {
    pub name: String,
    pub values: BTreeMap<String, Value>,
}

impl Instance {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.values.insert(field.to_string(), value.into());
        self
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.values.insert(field.to_string(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Numeric field as f64, or 0 when absent.
    pub fn f64(&self, field: &str) -> f64 {
        self.values.get(field).and_then(Value::as_f64).unwrap_or(0.0)
    }
}

/// A resolvable telemetry category or class.
pub trait TelemetrySource: Send {
    /// Category or class name this source was opened for.
    fn category(&self) -> &str;

    /// Enumerates instances in a stable order with their current values.
    fn sample(&mut self) -> Result<Vec<Instance>>;
}

/// Filesystem roots the sources read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roots {
    pub proc_root: PathBuf,
    pub sys_root: PathBuf,
}

impl Default for Roots {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            sys_root: PathBuf::from("/sys"),
        }
    }
}

impl Roots {
    pub fn new(proc_root: impl Into<PathBuf>, sys_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            sys_root: sys_root.into(),
        }
    }

    pub fn proc(&self, rel: &str) -> PathBuf {
        self.proc_root.join(rel)
    }

    pub fn sys(&self, rel: &str) -> PathBuf {
        self.sys_root.join(rel)
    }

    /// Opens the concrete source a descriptor names.
    pub fn open(&self, kind: SourceKind, category: &str) -> Result<Box<dyn TelemetrySource>> {
        match kind {
            SourceKind::Counter => Ok(Box::new(CounterSource::open(self.clone(), category)?)),
            SourceKind::Object => Ok(Box::new(ObjectSource::open(self.clone(), category)?)),
        }
    }

    /// Resolves a subquery to the scalar its first instance carries.
    pub fn resolve_scalar(&self, class: &str, property: &str) -> Result<String> {
        let mut source = ObjectSource::open(self.clone(), class)?;
        let first = source
            .sample()?
            .into_iter()
            .next()
            .with_context(|| format!("subquery class '{class}' has no instances"))?;
        match first.get(property) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Null) | None => {
                bail!("subquery property '{property}' missing on '{}'", first.name)
            }
            Some(other) => Ok(other.to_string()),
        }
    }
}

pub(crate) fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Reads a small sysfs attribute, trimmed.
pub(crate) fn read_attr(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

/// Parses a `Key: value [kB]` style file into bytes-normalized numbers.
pub(crate) fn parse_kv_kb(content: &str) -> Vec<(String, u64)> {
    content
        .lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let mut parts = rest.split_whitespace();
            let value: u64 = parts.next()?.parse().ok()?;
            let value = match parts.next() {
                Some("kB") => value * 1024,
                _ => value,
            };
            Some((key.trim().to_string(), value))
        })
        .collect()
}
