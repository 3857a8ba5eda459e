//! Plugin executables, as run inside the sandbox.

use crate::payload::Payload;
use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How to start one plugin executable.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub key: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub settings: Option<Value>,
    /// Working directory, the generation's snapshot root
    pub cwd: PathBuf,
}

impl CommandSpec {
    fn spawn(&self) -> Result<Child> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(&self.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        die_with_parent(&mut command);
        command
            .spawn()
            .with_context(|| format!("Failed to start {}", self.program.display()))
    }
}

/// Asks the kernel to SIGKILL the child when the process that spawned it dies.
#[cfg(target_os = "linux")]
pub(crate) fn die_with_parent(command: &mut Command) {
    // SAFETY: prctl is async-signal-safe and touches no memory of the parent
    unsafe {
        command.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0 as libc::c_ulong, 0 as libc::c_ulong, 0 as libc::c_ulong) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn die_with_parent(_command: &mut Command) {}

/// Writes the settings document, if any, then closes stdin.
async fn feed_settings(settings: Option<Value>, stdin: Option<ChildStdin>) -> Result<()> {
    let (Some(settings), Some(mut stdin)) = (settings, stdin) else {
        return Ok(());
    };
    let mut body = serde_json::to_vec(&settings)?;
    body.push(b'\n');
    // A plugin that ignores its settings may exit before reading them
    match stdin.write_all(&body).await {
        Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e.into()),
        _ => Ok(()),
    }
}

/// A check run to completion once per request.
#[derive(Debug, Clone)]
pub struct CommandCheck {
    spec: CommandSpec,
    timeout: Duration,
}

impl CommandCheck {
    pub fn new(spec: CommandSpec, timeout: Duration) -> Self {
        Self { spec, timeout }
    }

    /// Empty stdout means no result; a non-zero exit or non-JSON output is an error.
    pub async fn run(&self) -> Result<Option<Value>> {
        let mut child = self.spec.spawn()?;
        let stdin = child.stdin.take();
        let settings = self.spec.settings.clone();

        // Settings are written while output is collected, both under the
        // timeout. Dropping the child on timeout kills it.
        let exchange = async move {
            let (fed, output) = tokio::join!(feed_settings(settings, stdin), child.wait_with_output());
            fed?;
            output.context("Failed to collect plugin output")
        };
        let output = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| anyhow::anyhow!("timed out after {}s", self.timeout.as_secs()))??;

        if !output.status.success() {
            bail!("{} exited with {}", self.spec.program.display(), output.status);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(None);
        }
        let value = serde_json::from_str(stdout)
            .with_context(|| format!("{} printed invalid JSON", self.spec.program.display()))?;
        Ok(Some(value))
    }
}

/// Shared buffer of the latest document per long-running key.
pub type ResultBuffer = Arc<Mutex<Payload>>;

/// A plugin process that streams one JSON document per line.
pub struct LongRunningProcess {
    key: String,
    child: Child,
    reader: JoinHandle<()>,
    feeder: JoinHandle<()>,
}

impl LongRunningProcess {
    pub async fn start(spec: CommandSpec, buffer: ResultBuffer) -> Result<Self> {
        let mut child = spec.spawn()?;
        // A plugin that never reads its settings must not stall the start
        let key = spec.key.clone();
        let stdin = child.stdin.take();
        let settings = spec.settings.clone();
        let feeder = tokio::spawn(async move {
            if let Err(e) = feed_settings(settings, stdin).await {
                warn!(key = %key, error = %format!("{e:#}"), "Writing plugin settings failed");
            }
        });
        let stdout = child
            .stdout
            .take()
            .context("Plugin stdout was not captured")?;

        let key = spec.key.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match serde_json::from_str::<Value>(&line) {
                        Ok(value) => {
                            buffer.lock().insert(key.clone(), value);
                        }
                        Err(e) => warn!(key = %key, error = %e, "Discarding malformed plugin output"),
                    },
                    Ok(None) => {
                        debug!(key = %key, "Long-running plugin closed its output");
                        break;
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Long-running plugin read failed");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            key: spec.key,
            child,
            reader,
            feeder,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn stop(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(key = %self.key, error = %e, "Long-running plugin already gone");
        }
        self.feeder.abort();
        self.reader.abort();
    }
}

impl Drop for LongRunningProcess {
    fn drop(&mut self) {
        self.feeder.abort();
        self.reader.abort();
    }
}

/// Resident set size of `pid` in bytes, from `/proc/<pid>/status`.
pub fn resident_bytes(status_path: &Path) -> Option<u64> {
    let status = std::fs::read_to_string(status_path).ok()?;
    status.lines().find_map(|line| {
        let rest = line.strip_prefix("VmRSS:")?;
        let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
        Some(kb * 1024)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn script(dir: &TempDir, name: &str, body: &str) -> CommandSpec {
        let path = dir.path().join(name);
        fs::write(&path, format!("{body}\n")).unwrap();
        CommandSpec {
            key: name.to_string(),
            program: PathBuf::from("/bin/sh"),
            args: vec![path.display().to_string()],
            settings: None,
            cwd: dir.path().to_path_buf(),
        }
    }

    #[tokio::test]
    async fn command_check_echoes_settings() {
        let dir = TempDir::new().unwrap();
        let mut spec = script(&dir, "echo.sh", "cat");
        spec.settings = Some(json!({"queue": "jobs"}));

        let check = CommandCheck::new(spec, Duration::from_secs(5));
        assert_eq!(check.run().await.unwrap(), Some(json!({"queue": "jobs"})));
    }

    #[tokio::test]
    async fn empty_output_is_absent_and_failures_are_errors() {
        let dir = TempDir::new().unwrap();
        let quiet = CommandCheck::new(script(&dir, "quiet.sh", "true"), Duration::from_secs(5));
        assert_eq!(quiet.run().await.unwrap(), None);

        let failing = CommandCheck::new(script(&dir, "fail.sh", "exit 3"), Duration::from_secs(5));
        assert!(failing.run().await.is_err());

        let garbage = CommandCheck::new(script(&dir, "bad.sh", "echo '{oops'"), Duration::from_secs(5));
        assert!(garbage.run().await.is_err());
    }

    #[tokio::test]
    async fn hung_check_times_out() {
        let dir = TempDir::new().unwrap();
        let check = CommandCheck::new(script(&dir, "hang.sh", "exec sleep 30"), Duration::from_millis(200));
        let err = check.run().await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    fn oversized_settings() -> Option<Value> {
        Some(json!({ "blob": "x".repeat(256 * 1024) }))
    }

    #[tokio::test]
    async fn unread_oversized_settings_still_time_out() {
        let dir = TempDir::new().unwrap();
        let mut spec = script(&dir, "deaf.sh", "exec sleep 20");
        spec.settings = oversized_settings();
        let check = CommandCheck::new(spec, Duration::from_millis(500));

        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(Duration::from_secs(5), check.run()).await;
        let err = outcome.expect("check ignored its own timeout").unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn long_running_start_ignores_unread_settings() {
        let dir = TempDir::new().unwrap();
        let mut spec = script(&dir, "deaf.sh", "echo '{\"up\":true}'; exec sleep 20");
        spec.settings = oversized_settings();
        let buffer = ResultBuffer::default();

        let started = tokio::time::timeout(Duration::from_secs(5), LongRunningProcess::start(spec, buffer.clone()))
            .await
            .expect("start blocked on settings");
        let mut process = started.unwrap();
        for _ in 0..50 {
            if buffer.lock().contains_key("deaf.sh") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(buffer.lock().get("deaf.sh"), Some(&json!({"up": true})));
        process.stop();
    }

    #[tokio::test]
    async fn long_running_keeps_latest_document() {
        let dir = TempDir::new().unwrap();
        let spec = script(&dir, "stream.sh", "echo '{\"n\":1}'; echo '{\"n\":2}'; exec sleep 30");
        let buffer = ResultBuffer::default();
        let mut process = LongRunningProcess::start(spec, buffer.clone()).await.unwrap();
        assert!(process.pid().is_some());

        let mut latest = None;
        for _ in 0..50 {
            latest = buffer.lock().get("stream.sh").cloned();
            if latest == Some(json!({"n": 2})) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(latest, Some(json!({"n": 2})));
        process.stop();
    }

    #[test]
    fn resident_bytes_reads_vmrss() {
        let dir = TempDir::new().unwrap();
        let status = dir.path().join("status");
        fs::write(&status, "Name:\tx\nVmRSS:\t  2048 kB\n").unwrap();
        assert_eq!(resident_bytes(&status), Some(2048 * 1024));
        assert_eq!(resident_bytes(&dir.path().join("none")), None);
    }
}
