use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/monagent/agent.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_plugin_dir")]
    pub plugin_dir: PathBuf,
    /// Where per-generation plugin snapshots are created
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// 0 disables the memory reload trigger
    #[serde(default = "default_memory_limit")]
    pub plugin_memory_limit_bytes: u64,
    #[serde(default)]
    pub self_diagnostics: bool,
    #[serde(default = "default_call_timeout")]
    pub sandbox_call_timeout_secs: u64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,
    #[serde(default = "default_sys_root")]
    pub sys_root: PathBuf,
    #[serde(default)]
    pub poster: PosterConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PosterConfig {
    pub endpoint: Option<String>,
    #[serde(default = "default_agent_key")]
    pub agent_key: String,
    #[serde(default = "default_post_timeout")]
    pub timeout_secs: u64,
    /// JSON Lines file that receives every payload
    pub output: Option<PathBuf>,
}

fn default_interval() -> u64 {
    60
}

fn default_plugin_dir() -> PathBuf {
    PathBuf::from("plugins")
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("monagent")
}

fn default_memory_limit() -> u64 {
    256 * 1024 * 1024
}

fn default_call_timeout() -> u64 {
    30
}

fn default_max_workers() -> usize {
    8
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_sys_root() -> PathBuf {
    PathBuf::from("/sys")
}

fn default_agent_key() -> String {
    crate::check::system::hostname().unwrap_or_else(|| "monagent".to_string())
}

fn default_post_timeout() -> u64 {
    15
}

impl Default for PosterConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            agent_key: default_agent_key(),
            timeout_secs: default_post_timeout(),
            output: None,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            plugin_dir: default_plugin_dir(),
            work_dir: default_work_dir(),
            plugin_memory_limit_bytes: default_memory_limit(),
            self_diagnostics: false,
            sandbox_call_timeout_secs: default_call_timeout(),
            max_workers: default_max_workers(),
            proc_root: default_proc_root(),
            sys_root: default_sys_root(),
            poster: PosterConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// A missing file yields the defaults; a broken one is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            bail!("interval_secs must be positive");
        }
        if self.max_workers == 0 {
            bail!("max_workers must be positive");
        }
        if self.sandbox_call_timeout_secs == 0 {
            bail!("sandbox_call_timeout_secs must be positive");
        }
        if let Some(endpoint) = &self.poster.endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                bail!("poster.endpoint must be an http(s) URL, got '{endpoint}'");
            }
        }
        // Snapshots under the watched tree would retrigger reloads and copy themselves
        let plugin_dir = resolve(&self.plugin_dir)?;
        if resolve(&self.work_dir)?.starts_with(&plugin_dir) {
            bail!(
                "work_dir {} must not be inside plugin_dir {}",
                self.work_dir.display(),
                self.plugin_dir.display()
            );
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn sandbox_call_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox_call_timeout_secs)
    }
}

/// Absolute form of `path` with `.` and `..` folded, following symlinks
/// when the path exists.
fn resolve(path: &Path) -> Result<PathBuf> {
    if let Ok(real) = path.canonicalize() {
        return Ok(real);
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("Failed to read the current directory")?
            .join(path)
    };
    let mut resolved = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            other => resolved.push(other),
        }
    }
    Ok(resolved)
}
