//! Plugin manifests: static declaration of a module's checks and slices.
//!
//! A manifest is read and validated before any plugin executable runs, so a
//! broken module is rejected without executing its code.

use crate::check::CheckKind;
use crate::error::PluginError;
use crate::selector::{Selector, SelectorMode};
use crate::slice::{FieldRole, FieldSpec, GroupingDescriptor, RecordSchema, SliceType, Subquery};
use crate::telemetry::{ObjectSource, Roots, SourceKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

pub const MANIFEST_EXTENSION: &str = "toml";
pub const DEFAULT_CHECK_TIMEOUT_SECS: u64 = 10;

/// A `[[check]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckDecl {
    #[serde(rename = "type")]
    pub type_name: String,
    pub key: String,
    #[serde(default)]
    pub kind: CheckKind,
    /// Executable, relative to the manifest's directory
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl CheckDecl {
    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(DEFAULT_CHECK_TIMEOUT_SECS)
    }
}

/// A `[[slice]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceDecl {
    #[serde(rename = "type")]
    pub type_name: String,
    pub source: SourceKind,
    pub category: String,
    #[serde(default)]
    pub selector: SelectorMode,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub exclusions: Vec<String>,
    #[serde(default)]
    pub subquery: Option<Subquery>,
    #[serde(default, rename = "field")]
    pub fields: Vec<FieldSpec>,
}

impl SliceDecl {
    pub fn to_slice_type(&self) -> SliceType {
        SliceType {
            name: self.type_name.clone(),
            descriptor: GroupingDescriptor {
                source: self.source,
                category: self.category.clone(),
                selector: Selector {
                    mode: self.selector,
                    value: self.value.clone(),
                    exclusions: self.exclusions.clone(),
                },
                subquery: self.subquery.clone(),
            },
            schema: RecordSchema::new(self.fields.clone()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawManifest {
    #[serde(default)]
    check: Vec<CheckDecl>,
    #[serde(default)]
    slice: Vec<SliceDecl>,
}

/// What static inspection found in one manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleInfo {
    pub path: PathBuf,
    pub checks: Vec<CheckDecl>,
    pub slices: Vec<SliceDecl>,
}

impl ModuleInfo {
    /// File name used to identify the module in logs and descriptors.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn base_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// Manifest files directly under `dir`, sorted by name.
pub fn discover(dir: &Path) -> Result<Vec<PathBuf>, PluginError> {
    let entries = fs::read_dir(dir).map_err(|source| PluginError::Read {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut manifests: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == MANIFEST_EXTENSION))
        .collect();
    manifests.sort();
    Ok(manifests)
}

/// Reads, parses and validates one manifest.
pub fn inspect(path: &Path) -> Result<ModuleInfo, PluginError> {
    let content = fs::read_to_string(path).map_err(|source| PluginError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: RawManifest = toml::from_str(&content).map_err(|source| PluginError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let info = ModuleInfo {
        path: path.to_path_buf(),
        checks: raw.check,
        slices: raw.slice,
    };
    let reasons = validate(&info);
    if !reasons.is_empty() {
        return Err(PluginError::Invalid {
            path: path.to_path_buf(),
            reasons,
        });
    }
    Ok(info)
}

fn validate(info: &ModuleInfo) -> Vec<String> {
    let mut reasons = Vec::new();
    if info.checks.is_empty() && info.slices.is_empty() {
        reasons.push("declares no checks and no slices".to_string());
    }

    for check in &info.checks {
        let label = format!("check '{}'", check.type_name);
        if check.type_name.trim().is_empty() {
            reasons.push("check with empty type".to_string());
        }
        if check.key.trim().is_empty() {
            reasons.push(format!("{label}: empty key"));
        }
        if check.timeout_secs == Some(0) {
            reasons.push(format!("{label}: timeout_secs must be positive"));
        }
        match command_path(info.base_dir(), &check.command) {
            Some(path) if path.is_file() => {}
            Some(path) => reasons.push(format!("{label}: command {} not found", path.display())),
            None => reasons.push(format!(
                "{label}: command '{}' must be a relative path inside the plugin directory",
                check.command
            )),
        }
    }

    for slice in &info.slices {
        let label = format!("slice '{}'", slice.type_name);
        if slice.type_name.trim().is_empty() {
            reasons.push("slice with empty type".to_string());
        }
        // Opening a source only resolves its name; nothing is read yet
        if let Err(e) = Roots::default().open(slice.source, &slice.category) {
            reasons.push(format!("{label}: {e}"));
        }
        if let Some(subquery) = &slice.subquery {
            if let Err(e) = ObjectSource::open(Roots::default(), &subquery.class) {
                reasons.push(format!("{label}: subquery {e}"));
            }
        }
        if slice.fields.is_empty() {
            reasons.push(format!("{label}: no fields"));
        }

        let mut seen = HashSet::new();
        for field in &slice.fields {
            if !seen.insert(field.name.as_str()) {
                reasons.push(format!("{label}: duplicate field '{}'", field.name));
            }
            match field.divisor {
                Some(0) => reasons.push(format!("{label}: field '{}' has divisor 0", field.name)),
                Some(_) if !field.ty.is_numeric() => reasons.push(format!(
                    "{label}: field '{}' is {} and cannot take a divisor",
                    field.name,
                    field.ty.name()
                )),
                _ => {}
            }
            if field.role == FieldRole::InstanceName && field.divisor.is_some() {
                reasons.push(format!("{label}: instance-name field '{}' has a divisor", field.name));
            }
        }
    }

    reasons
}

/// Resolves `command` under `base`, refusing absolute paths and `..`.
pub fn command_path(base: &Path, command: &str) -> Option<PathBuf> {
    let relative = Path::new(command);
    if command.is_empty()
        || relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return None;
    }
    Some(base.join(relative))
}

/// Loads `<type_name>.json` from the working-copy root, if present.
///
/// An unreadable or malformed settings file is logged and ignored.
pub fn load_settings(root: &Path, type_name: &str) -> Option<Value> {
    let path = root.join(format!("{type_name}.json"));
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot read check settings");
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(settings) => Some(settings),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Malformed check settings ignored");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slice::FieldType;
    use serde_json::json;
    use tempfile::TempDir;

    const QUEUE_MANIFEST: &str = r#"
[[check]]
type = "QueueDepth"
key = "queueDepth"
command = "bin/queue.sh"

[[check]]
type = "Tail"
key = "tail"
kind = "long_running"
command = "bin/queue.sh"
args = ["--follow"]
timeout_secs = 3

[[slice]]
type = "ActiveAdapter"
source = "object"
category = "net_adapter"
selector = "each"
subquery = { class = "default_route", property = "iface" }

[[slice.field]]
name = "Name"
type = "text"
role = "instance_name"

[[slice.field]]
name = "rxKb"
type = "int"
source = "rx_bytes"
divisor = 1024
"#;

    fn plugin_dir(manifest: &str) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::write(dir.path().join("bin/queue.sh"), "#!/bin/sh\necho 1\n").unwrap();
        let path = dir.path().join("queue.toml");
        fs::write(&path, manifest).unwrap();
        (dir, path)
    }

    #[test]
    fn inspect_reads_checks_and_slices() {
        let (_dir, path) = plugin_dir(QUEUE_MANIFEST);
        let info = inspect(&path).unwrap();

        assert_eq!(info.name(), "queue.toml");
        assert_eq!(info.checks.len(), 2);
        assert_eq!(info.checks[0].kind, CheckKind::Immediate);
        assert_eq!(info.checks[0].timeout_secs(), DEFAULT_CHECK_TIMEOUT_SECS);
        assert_eq!(info.checks[1].kind, CheckKind::LongRunning);

        let slice = info.slices[0].to_slice_type();
        assert_eq!(slice.descriptor.source, SourceKind::Object);
        assert_eq!(slice.schema.fields()[1].ty, FieldType::Int);
        assert_eq!(slice.schema.fields()[1].divisor, Some(1024));
        assert_eq!(slice.schema.label_field().unwrap().name, "Name");
    }

    #[test]
    fn invalid_manifest_lists_every_reason() {
        let (_dir, path) = plugin_dir(
            r#"
[[check]]
type = "Escape"
key = ""
command = "../outside.sh"

[[slice]]
type = "Gpu"
source = "counter"
category = "gpu"

[[slice.field]]
name = "label"
type = "text"
divisor = 10
"#,
        );

        let Err(PluginError::Invalid { reasons, .. }) = inspect(&path) else {
            panic!("expected an invalid manifest");
        };
        assert_eq!(reasons.len(), 4, "{reasons:?}");
        assert!(reasons.iter().any(|r| r.contains("empty key")));
        assert!(reasons.iter().any(|r| r.contains("relative path")));
        assert!(reasons.iter().any(|r| r.contains("gpu")));
        assert!(reasons.iter().any(|r| r.contains("cannot take a divisor")));
    }

    #[test]
    fn unparsable_manifest_is_a_parse_error() {
        let (_dir, path) = plugin_dir("[[check]\n");
        assert!(matches!(inspect(&path), Err(PluginError::Parse { .. })));
    }

    #[test]
    fn discover_lists_only_manifests() {
        let (dir, _) = plugin_dir(QUEUE_MANIFEST);
        fs::write(dir.path().join("QueueDepth.json"), "{}").unwrap();
        fs::write(dir.path().join("a.toml"), "").unwrap();

        let found = discover(dir.path()).unwrap();
        let names: Vec<String> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.toml", "queue.toml"]);
    }

    #[test]
    fn settings_are_matched_by_type_name() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("QueueDepth.json"), r#"{"queue": "jobs"}"#).unwrap();
        fs::write(dir.path().join("Broken.json"), "{not json").unwrap();

        assert_eq!(load_settings(dir.path(), "QueueDepth"), Some(json!({"queue": "jobs"})));
        assert_eq!(load_settings(dir.path(), "Broken"), None);
        assert_eq!(load_settings(dir.path(), "Missing"), None);
    }
}
