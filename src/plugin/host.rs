//! Plugin registry living inside the sandbox process.
//!
//! Everything here runs in the sandbox child. The agent only ever sees the
//! keys and plain JSON this host hands back over the protocol.

use super::command::{resident_bytes, CommandCheck, CommandSpec, LongRunningProcess, ResultBuffer};
use super::manifest::{self, command_path, load_settings, CheckDecl};
use crate::check::{CheckDescriptor, CheckKind};
use crate::error::PluginError;
use crate::payload::{unique_key, Payload};
use crate::slice::{populate, record_label, SliceType};
use crate::telemetry::{Roots, TelemetrySource};
use anyhow::{anyhow, Context, Result};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

enum Registered {
    Immediate(Arc<CommandCheck>),
    LongRunning(LongRunningProcess),
}

/// A slice type plus the source it samples, opened on first use.
struct SliceEntry {
    slice: SliceType,
    source: Mutex<Option<Box<dyn TelemetrySource>>>,
}

pub struct PluginHost {
    roots: Roots,
    /// Snapshot root holding manifests and settings files
    root: PathBuf,
    checks: RwLock<HashMap<String, Registered>>,
    slices: RwLock<HashMap<String, Arc<SliceEntry>>>,
    buffer: ResultBuffer,
    baseline_rss: u64,
}

fn self_status() -> PathBuf {
    PathBuf::from("/proc/self/status")
}

impl PluginHost {
    /// Records the sandbox's own resident set as the zero point for
    /// [`PluginHost::allocated_bytes`].
    pub fn new(root: impl Into<PathBuf>, roots: Roots) -> Self {
        Self {
            roots,
            root: root.into(),
            checks: RwLock::new(HashMap::new()),
            slices: RwLock::new(HashMap::new()),
            buffer: ResultBuffer::default(),
            baseline_rss: resident_bytes(&self_status()).unwrap_or(0),
        }
    }

    /// Registers a module's checks. Long-running checks are started here.
    /// A key that is already taken gets a numeric suffix.
    pub async fn load_module(&self, path: &Path) -> Result<Vec<CheckDescriptor>, PluginError> {
        let info = manifest::inspect(path)?;
        let module = info.name();
        let mut loaded = Vec::new();

        for decl in &info.checks {
            let spec = self.command_spec(info.base_dir(), decl);
            let key = {
                let checks = self.checks.read();
                unique_key(&decl.key, |k| checks.contains_key(k))
            };
            if key != decl.key {
                warn!(key = %decl.key, renamed = %key, module = %module, "Duplicate plugin check key");
            }
            let spec = CommandSpec { key: key.clone(), ..spec };

            let registered = match decl.kind {
                CheckKind::Immediate => Registered::Immediate(Arc::new(CommandCheck::new(
                    spec,
                    Duration::from_secs(decl.timeout_secs()),
                ))),
                CheckKind::LongRunning => {
                    match LongRunningProcess::start(spec, self.buffer.clone()).await {
                        Ok(process) => Registered::LongRunning(process),
                        Err(e) => {
                            warn!(key = %key, module = %module, error = %format!("{e:#}"), "Long-running check failed to start");
                            continue;
                        }
                    }
                }
            };

            self.checks.write().insert(key.clone(), registered);
            loaded.push(CheckDescriptor {
                key,
                kind: decl.kind,
                module: module.clone(),
            });
        }

        info!(module = %module, checks = loaded.len(), "Plugin module loaded");
        Ok(loaded)
    }

    fn command_spec(&self, base: &Path, decl: &CheckDecl) -> CommandSpec {
        CommandSpec {
            key: decl.key.clone(),
            // Validated by inspect, so the fallback never applies
            program: command_path(base, &decl.command).unwrap_or_else(|| base.join(&decl.command)),
            args: decl.args.clone(),
            settings: load_settings(&self.root, &decl.type_name),
            cwd: self.root.clone(),
        }
    }

    /// Registers a module's slice types and returns their registered names.
    pub fn load_slice_descriptors(&self, path: &Path) -> Result<Vec<String>, PluginError> {
        let info = manifest::inspect(path)?;
        let mut slices = self.slices.write();
        let mut names = Vec::new();

        for decl in &info.slices {
            let mut slice = decl.to_slice_type();
            let name = unique_key(&slice.name, |k| slices.contains_key(k));
            if name != slice.name {
                warn!(slice = %slice.name, renamed = %name, "Duplicate slice type");
            }
            slice.name = name.clone();
            slices.insert(
                name.clone(),
                Arc::new(SliceEntry {
                    slice,
                    source: Mutex::new(None),
                }),
            );
            names.push(name);
        }
        Ok(names)
    }

    pub async fn run_check(&self, key: &str) -> Result<Option<Value>> {
        let check = match self.checks.read().get(key) {
            Some(Registered::Immediate(check)) => check.clone(),
            Some(Registered::LongRunning(_)) => return Err(anyhow!("'{key}' is a long-running check")),
            None => return Err(anyhow!("no check registered as '{key}'")),
        };
        check.run().await.with_context(|| format!("check '{key}' failed"))
    }

    /// Hands over and clears the buffered long-running results.
    pub fn long_running_results(&self) -> Payload {
        std::mem::take(&mut *self.buffer.lock())
    }

    /// Populates a slice type and returns its records keyed by label.
    pub async fn populate_slice(&self, type_name: &str) -> Result<Payload> {
        let entry = self
            .slices
            .read()
            .get(type_name)
            .cloned()
            .with_context(|| format!("no slice type registered as '{type_name}'"))?;
        let roots = self.roots.clone();

        tokio::task::spawn_blocking(move || populate_entry(&entry, &roots))
            .await
            .context("slice population panicked")?
    }

    /// Resident-set growth since this host started plus the resident set of
    /// every live long-running plugin process.
    pub fn allocated_bytes(&self) -> u64 {
        let own = resident_bytes(&self_status())
            .unwrap_or(0)
            .saturating_sub(self.baseline_rss);
        let children: u64 = self
            .checks
            .read()
            .values()
            .filter_map(|r| match r {
                Registered::LongRunning(process) => process.pid(),
                Registered::Immediate(_) => None,
            })
            .filter_map(|pid| resident_bytes(&PathBuf::from(format!("/proc/{pid}/status"))))
            .sum();
        own + children
    }

    /// Stops every long-running process and forgets all registrations.
    pub fn shutdown(&self) {
        let mut checks = self.checks.write();
        for registered in checks.values_mut() {
            if let Registered::LongRunning(process) = registered {
                info!(key = %process.key(), "Stopping long-running check");
                process.stop();
            }
        }
        checks.clear();
        self.slices.write().clear();
        self.buffer.lock().clear();
    }
}

fn populate_entry(entry: &SliceEntry, roots: &Roots) -> Result<Payload> {
    let slice = &entry.slice;
    let mut source = entry.source.lock();
    if source.is_none() {
        *source = Some(roots.open(slice.descriptor.source, &slice.descriptor.category)?);
    }
    let source = source
        .as_deref_mut()
        .context("telemetry source unavailable")?;

    let records = populate(slice, source, |sq| roots.resolve_scalar(&sq.class, &sq.property))?;
    let mut out = Payload::new();
    for (index, record) in records.into_iter().enumerate() {
        let label = record_label(&slice.name, &slice.schema, &record, index);
        let label = unique_key(&label, |k| out.contains_key(k));
        out.insert(label, Value::Object(record));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::fixtures;
    use serde_json::json;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_module(root: &Path, name: &str, manifest: &str) -> PathBuf {
        let path = root.join(name);
        fs::write(&path, manifest).unwrap();
        path
    }

    /// Plugin root, fixture host tree, and a host over both.
    fn host() -> (TempDir, TempDir, PluginHost) {
        let plugins = TempDir::new().unwrap();
        let (fixture, roots) = fixtures::host();
        let host = PluginHost::new(plugins.path(), roots);
        (plugins, fixture, host)
    }

    #[tokio::test]
    async fn duplicate_check_keys_are_suffixed_and_settings_delivered() {
        let (dir, _fixture, host) = host();
        let script = dir.path().join("echo.sh");
        fs::write(&script, "#!/bin/sh\ncat\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(dir.path().join("Echo.json"), r#"{"depth": 3}"#).unwrap();

        let manifest = r#"
[[check]]
type = "Echo"
key = "echo"
command = "echo.sh"
"#;
        let a = write_module(dir.path(), "a.toml", manifest);
        let b = write_module(dir.path(), "b.toml", manifest);
        let first = host.load_module(&a).await.unwrap();
        let second = host.load_module(&b).await.unwrap();
        assert_eq!(first[0].key, "echo");
        assert_eq!(second[0].key, "echo_2");
        assert_eq!(second[0].module, "b.toml");

        assert_eq!(host.run_check("echo_2").await.unwrap(), Some(json!({"depth": 3})));
        host.shutdown();
        assert!(host.run_check("echo").await.is_err());
    }

    #[test]
    fn duplicate_slice_types_are_suffixed() {
        let (dir, _fixture, host) = host();
        let manifest = r#"
[[slice]]
type = "Cpu"
source = "counter"
category = "processor"
selector = "total"

[[slice.field]]
name = "busy"
type = "float"
source = "processor_percent"
"#;
        let a = write_module(dir.path(), "a.toml", manifest);
        let b = write_module(dir.path(), "b.toml", manifest);
        assert_eq!(host.load_slice_descriptors(&a).unwrap(), ["Cpu"]);
        assert_eq!(host.load_slice_descriptors(&b).unwrap(), ["Cpu_2"]);
    }

    #[tokio::test]
    async fn populate_slice_labels_records() {
        let (dir, _fixture, host) = host();
        let path = write_module(
            dir.path(),
            "adapters.toml",
            r#"
[[slice]]
type = "ActiveAdapter"
source = "object"
category = "net_adapter"
subquery = { class = "default_route", property = "iface" }

[[slice.field]]
name = "name"
type = "text"
role = "instance_name"

[[slice.field]]
name = "mtu"
type = "int"
"#,
        );
        host.load_slice_descriptors(&path).unwrap();

        let records = host.populate_slice("ActiveAdapter").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records["Slice[ActiveAdapter]-[eth0]"],
            json!({"name": "eth0", "mtu": 1500})
        );
        assert!(host.populate_slice("Nope").await.is_err());
    }

    #[tokio::test]
    async fn unknown_key_is_an_error_and_buffer_starts_empty() {
        let (_dir, _fixture, host) = host();
        assert!(host.run_check("missing").await.is_err());
        assert!(host.long_running_results().is_empty());
    }
}
