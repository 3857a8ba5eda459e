//! Builds sandbox generations from the plugin directory.

use super::manifest::{self, ModuleInfo};
use super::sandbox::{Sandbox, SandboxFactory};
use super::snapshot::Snapshot;
use crate::check::{CheckDescriptor, CheckKind};
use crate::error::PluginError;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// One live incarnation of the plugin sandbox and what it registered.
pub struct Generation {
    pub id: u64,
    pub sandbox: Arc<dyn Sandbox>,
    pub checks: Vec<CheckDescriptor>,
    pub slice_types: Vec<String>,
    snapshot: Option<Snapshot>,
}

impl Generation {
    pub fn new(id: u64, sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            id,
            sandbox,
            checks: Vec::new(),
            slice_types: Vec::new(),
            snapshot: None,
        }
    }

    /// Registers checks, dropping any key already registered so no check is
    /// ever run twice in one tick.
    pub fn add_checks(&mut self, checks: Vec<CheckDescriptor>) {
        for check in checks {
            if self.checks.iter().any(|c| c.key == check.key) {
                warn!(generation = self.id, key = %check.key, module = %check.module, "Ignoring duplicate plugin check key");
                continue;
            }
            self.checks.push(check);
        }
    }

    pub fn add_slice_types(&mut self, names: Vec<String>) {
        for name in names {
            if self.slice_types.contains(&name) {
                warn!(generation = self.id, slice = %name, "Ignoring duplicate slice type");
                continue;
            }
            self.slice_types.push(name);
        }
    }

    /// Keys of the checks the scheduler runs each tick.
    pub fn immediate_keys(&self) -> impl Iterator<Item = &str> {
        self.checks
            .iter()
            .filter(|c| c.kind == CheckKind::Immediate)
            .map(|c| c.key.as_str())
    }

    /// Stops the sandbox and removes the working copy. Once this returns the
    /// generation's processes are gone.
    pub async fn shutdown(self) {
        if let Err(e) = self.sandbox.shutdown().await {
            warn!(generation = self.id, error = %e, "Sandbox shutdown failed");
        }
        if let Some(snapshot) = self.snapshot {
            snapshot.remove();
        }
        info!(generation = self.id, "Plugin generation torn down");
    }
}

pub struct PluginLoader {
    plugin_dir: PathBuf,
    work_dir: PathBuf,
    factory: Arc<dyn SandboxFactory>,
    next_generation: u64,
}

impl PluginLoader {
    pub fn new(plugin_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>, factory: Arc<dyn SandboxFactory>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            work_dir: work_dir.into(),
            factory,
            next_generation: 1,
        }
    }

    pub fn plugin_dir(&self) -> &std::path::Path {
        &self.plugin_dir
    }

    /// Snapshots the plugin directory, starts a fresh sandbox and loads every
    /// valid module into it. Broken modules are logged and skipped.
    pub async fn load(&mut self) -> Result<Generation, PluginError> {
        let id = self.next_generation;
        self.next_generation += 1;

        let snapshot = Snapshot::create(&self.plugin_dir, &self.work_dir, id)?;
        let modules = inspect_all(&snapshot);

        let sandbox = match self.factory.create(id, snapshot.root()).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                snapshot.remove();
                return Err(e.into());
            }
        };

        let mut generation = Generation::new(id, sandbox);
        for module in &modules {
            let name = module.name();
            if !module.checks.is_empty() {
                match generation.sandbox.load_module(&module.path).await {
                    Ok(checks) => generation.add_checks(checks),
                    Err(e) => warn!(generation = id, module = %name, error = %e, "Plugin module failed to load"),
                }
            }
            if !module.slices.is_empty() {
                match generation.sandbox.load_slice_descriptors(&module.path).await {
                    Ok(names) => generation.add_slice_types(names),
                    Err(e) => warn!(generation = id, module = %name, error = %e, "Slice descriptors failed to load"),
                }
            }
        }
        generation.snapshot = Some(snapshot);

        info!(
            generation = id,
            modules = modules.len(),
            checks = generation.checks.len(),
            slices = generation.slice_types.len(),
            "Plugin generation ready"
        );
        Ok(generation)
    }
}

/// Statically inspects every manifest in the snapshot; no plugin code runs.
fn inspect_all(snapshot: &Snapshot) -> Vec<ModuleInfo> {
    let paths = match manifest::discover(snapshot.root()) {
        Ok(paths) => paths,
        Err(e) => {
            warn!(error = %e, "Plugin discovery failed");
            return Vec::new();
        }
    };
    paths
        .iter()
        .filter_map(|path| match manifest::inspect(path) {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(error = %e, "Skipping plugin module");
                None
            }
        })
        .collect()
}
