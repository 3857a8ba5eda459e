//! Private working copies of the plugin directory, one per generation.

use crate::error::PluginError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A copied plugin tree that lives as long as its generation.
#[derive(Debug)]
pub struct Snapshot {
    root: PathBuf,
}

impl Snapshot {
    /// Copies `plugin_dir` into `work_dir/generation-<id>`, replacing any
    /// leftover copy with the same id. A missing plugin directory yields an
    /// empty snapshot.
    pub fn create(plugin_dir: &Path, work_dir: &Path, generation: u64) -> Result<Self, PluginError> {
        let root = work_dir.join(format!("generation-{generation}"));
        let snapshot_err = |source: io::Error| PluginError::Snapshot {
            path: root.clone(),
            source,
        };

        if root.exists() {
            fs::remove_dir_all(&root).map_err(snapshot_err)?;
        }
        fs::create_dir_all(&root).map_err(snapshot_err)?;

        if plugin_dir.is_dir() {
            copy_tree(plugin_dir, &root).map_err(|source| PluginError::Snapshot {
                path: plugin_dir.to_path_buf(),
                source,
            })?;
        } else {
            warn!(dir = %plugin_dir.display(), "Plugin directory missing, starting with no plugins");
        }
        debug!(root = %root.display(), generation, "Plugin snapshot created");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn remove(self) {
        if let Err(e) = fs::remove_dir_all(&self.root) {
            warn!(root = %self.root.display(), error = %e, "Failed to remove plugin snapshot");
        }
    }
}

/// Recursive copy that tolerates entries vanishing mid-copy.
fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        let target = dst.join(entry.file_name());

        let copied = if file_type.is_dir() {
            fs::create_dir_all(&target).and_then(|_| copy_tree(&entry.path(), &target))
        } else {
            // fs::copy follows symlinks and keeps permission bits
            fs::copy(entry.path(), &target).map(|_| ())
        };
        match copied {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %entry.path().display(), "Entry removed during snapshot");
            }
            other => other?,
        }
    }
    Ok(())
}
