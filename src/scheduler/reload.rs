//! When to throw away the sandbox generation and build a new one.

use anyhow::{Context, Result};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Sticky "plugins changed" flag, set by the watcher and consumed by a tick.
#[derive(Debug, Clone, Default)]
pub struct ReloadFlag(Arc<AtomicBool>);

impl ReloadFlag {
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Reads and clears the flag in one step.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

fn is_reload_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Remove(_)
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Modify(ModifyKind::Data(_))
    )
}

/// Watches the plugin directory and sets a [`ReloadFlag`] on changes.
pub struct PluginWatcher {
    _watcher: RecommendedWatcher,
}

impl PluginWatcher {
    /// Starts watching `dir`, creating it first if it does not exist yet.
    pub fn new(dir: &Path, flag: ReloadFlag) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create plugin directory {}", dir.display()))?;

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if is_reload_event(&event.kind) => {
                debug!(paths = ?event.paths, kind = ?event.kind, "Plugin directory changed");
                flag.set();
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Plugin watcher error"),
        })
        .context("Failed to create plugin watcher")?;

        watcher
            .watch(dir, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", dir.display()))?;
        Ok(Self { _watcher: watcher })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadReason {
    FilesChanged,
    MemoryCeiling { allocated: u64, limit: u64 },
}

impl fmt::Display for ReloadReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FilesChanged => write!(f, "plugin files changed"),
            Self::MemoryCeiling { allocated, limit } => {
                write!(f, "sandbox allocated {allocated} bytes, limit {limit}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReloadPolicy {
    pub memory_limit_bytes: u64,
}

impl ReloadPolicy {
    /// A limit of 0 disables the memory trigger.
    pub fn evaluate(&self, files_changed: bool, allocated: Option<u64>) -> Option<ReloadReason> {
        if files_changed {
            return Some(ReloadReason::FilesChanged);
        }
        match allocated {
            Some(allocated) if self.memory_limit_bytes > 0 && allocated > self.memory_limit_bytes => {
                Some(ReloadReason::MemoryCeiling {
                    allocated,
                    limit: self.memory_limit_bytes,
                })
            }
            _ => None,
        }
    }
}
