//! The agent's handle on a sandbox generation.
//!
//! [`ProcessSandbox`] drives a `monagent sandbox` child over newline-delimited
//! JSON. Requests are multiplexed by id: a background task routes each reply
//! to the caller waiting on it, so a slow check does not hold up the others.

use super::command::die_with_parent;
use super::protocol::{Reply, Request, RequestFrame};
use crate::check::CheckDescriptor;
use crate::error::SandboxError;
use crate::payload::Payload;
use crate::telemetry::Roots;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a sandbox gets to exit after a shutdown request.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Operations the agent may invoke on a sandbox generation. Only plain data
/// crosses this boundary.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn generation(&self) -> u64;

    async fn load_module(&self, path: &Path) -> Result<Vec<CheckDescriptor>, SandboxError>;

    async fn load_slice_descriptors(&self, path: &Path) -> Result<Vec<String>, SandboxError>;

    /// `Ok(None)` when the check had nothing to report.
    async fn run_check(&self, key: &str) -> Result<Option<Value>, SandboxError>;

    /// Drains buffered long-running results.
    async fn long_running_results(&self) -> Result<Payload, SandboxError>;

    /// Records of one slice type keyed by record label.
    async fn populate_slice(&self, type_name: &str) -> Result<Payload, SandboxError>;

    /// Memory attributed to this generation, in bytes.
    async fn allocated_bytes(&self) -> Result<u64, SandboxError>;

    /// Destroys the generation. The handle is unusable afterwards.
    async fn shutdown(&self) -> Result<(), SandboxError>;
}

/// Creates one sandbox per generation.
#[async_trait]
pub trait SandboxFactory: Send + Sync {
    async fn create(&self, generation: u64, root: &Path) -> Result<Arc<dyn Sandbox>, SandboxError>;
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

pub struct ProcessSandbox {
    generation: u64,
    /// Process group id, equal to the child's pid
    process_group: u32,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: tokio::sync::Mutex<Option<Child>>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    call_timeout: Duration,
    reader: JoinHandle<()>,
}

impl ProcessSandbox {
    pub fn spawn(
        program: &Path,
        args: &[String],
        generation: u64,
        call_timeout: Duration,
    ) -> Result<Self, SandboxError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            // Plugin processes inherit the group, so teardown can reach them
            .process_group(0);
        die_with_parent(&mut command);
        let mut child = command.spawn().map_err(|source| SandboxError::Spawn {
            program: program.display().to_string(),
            source,
        })?;
        let process_group = child.id().ok_or(SandboxError::Closed(generation))?;

        let stdin = child.stdin.take().ok_or(SandboxError::Closed(generation))?;
        let stdout = child.stdout.take().ok_or(SandboxError::Closed(generation))?;
        let pending = Pending::default();
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(route_replies(stdout, pending.clone(), closed.clone(), generation));

        info!(generation, pid = process_group, "Sandbox started");
        Ok(Self {
            generation,
            process_group,
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            child: tokio::sync::Mutex::new(Some(child)),
            pending,
            closed,
            next_id: AtomicU64::new(1),
            call_timeout,
            reader,
        })
    }

    async fn call(&self, request: Request) -> Result<Value, SandboxError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SandboxError::Closed(self.generation));
        }
        let op = request.op();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut line = serde_json::to_string(&RequestFrame { id, request })?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        // The reader may have drained the pending table just before the insert
        if self.closed.load(Ordering::SeqCst) {
            self.pending.lock().remove(&id);
            return Err(SandboxError::Closed(self.generation));
        }
        if let Err(e) = self.write_line(&line).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(reply)) => reply.into_result(),
            Ok(Err(_)) => Err(SandboxError::Closed(self.generation)),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(SandboxError::Timeout {
                    op,
                    secs: self.call_timeout.as_secs(),
                })
            }
        }
    }

    async fn write_line(&self, line: &str) -> Result<(), SandboxError> {
        let mut stdin = self.stdin.lock().await;
        let stdin = stdin.as_mut().ok_or(SandboxError::Closed(self.generation))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }
}

/// Routes each reply line to the caller waiting on its id. When the child's
/// stdout closes every waiting caller is released with `Closed`.
async fn route_replies(stdout: ChildStdout, pending: Pending, closed: Arc<AtomicBool>, generation: u64) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match serde_json::from_str::<Reply>(&line) {
                Ok(reply) => {
                    let waiter = pending.lock().remove(&reply.id);
                    match waiter {
                        Some(tx) => {
                            // The caller may have timed out already
                            let _ = tx.send(reply);
                        }
                        None => debug!(generation, id = reply.id, "Reply for an abandoned request"),
                    }
                }
                Err(e) => warn!(generation, error = %e, "Malformed sandbox reply"),
            },
            Ok(None) => break,
            Err(e) => {
                warn!(generation, error = %e, "Sandbox output failed");
                break;
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    pending.lock().clear();
    debug!(generation, "Sandbox output closed");
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, SandboxError> {
    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn generation(&self) -> u64 {
        self.generation
    }

    async fn load_module(&self, path: &Path) -> Result<Vec<CheckDescriptor>, SandboxError> {
        decode(self.call(Request::LoadModule { path: path.to_path_buf() }).await?)
    }

    async fn load_slice_descriptors(&self, path: &Path) -> Result<Vec<String>, SandboxError> {
        decode(
            self.call(Request::LoadSliceDescriptors { path: path.to_path_buf() })
                .await?,
        )
    }

    async fn run_check(&self, key: &str) -> Result<Option<Value>, SandboxError> {
        let value = self.call(Request::RunCheck { key: key.to_string() }).await?;
        Ok((!value.is_null()).then_some(value))
    }

    async fn long_running_results(&self) -> Result<Payload, SandboxError> {
        match self.call(Request::LongRunningResults).await? {
            Value::Null => Ok(Payload::new()),
            value => decode(value),
        }
    }

    async fn populate_slice(&self, type_name: &str) -> Result<Payload, SandboxError> {
        match self
            .call(Request::PopulateSlice { type_name: type_name.to_string() })
            .await?
        {
            Value::Null => Ok(Payload::new()),
            value => decode(value),
        }
    }

    async fn allocated_bytes(&self) -> Result<u64, SandboxError> {
        decode(self.call(Request::AllocatedBytes).await?)
    }

    async fn shutdown(&self) -> Result<(), SandboxError> {
        if !self.closed.load(Ordering::SeqCst) {
            match tokio::time::timeout(SHUTDOWN_GRACE, self.call(Request::Shutdown)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!(generation = self.generation, error = %e, "Shutdown request failed"),
                Err(_) => debug!(generation = self.generation, "Shutdown request timed out"),
            }
        }
        self.closed.store(true, Ordering::SeqCst);
        // Closing stdin is the child's cue to exit even if it missed the request
        self.stdin.lock().await.take();

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(generation = self.generation, %status, "Sandbox exited"),
                Ok(Err(e)) => warn!(generation = self.generation, error = %e, "Waiting for sandbox failed"),
                Err(_) => {
                    warn!(generation = self.generation, "Sandbox did not exit, killing it");
                    child.kill().await?;
                }
            }
        }
        // Anything the child left behind, including plugins that outlived it
        kill_group(self.process_group);
        self.reader.abort();
        info!(generation = self.generation, "Sandbox torn down");
        Ok(())
    }
}

/// SIGKILLs every process in the group. A group that is already gone is fine.
fn kill_group(process_group: u32) {
    let Ok(pgid) = libc::pid_t::try_from(process_group) else {
        return;
    };
    // SAFETY: killpg takes plain integers and touches no memory
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == -1 {
        let e = std::io::Error::last_os_error();
        if e.raw_os_error() != Some(libc::ESRCH) {
            warn!(pgid, error = %e, "Killing sandbox process group failed");
        }
    }
}

impl Drop for ProcessSandbox {
    fn drop(&mut self) {
        // Not yet reaped, so the group id still belongs to this sandbox
        if self.child.get_mut().is_some() {
            kill_group(self.process_group);
        }
        self.reader.abort();
    }
}

/// Starts sandboxes by re-executing a `monagent` binary in sandbox mode.
#[derive(Debug, Clone)]
pub struct ProcessSandboxFactory {
    program: PathBuf,
    extra_args: Vec<String>,
    call_timeout: Duration,
    roots: Roots,
}

impl ProcessSandboxFactory {
    pub fn new(program: impl Into<PathBuf>, call_timeout: Duration, roots: Roots) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
            call_timeout,
            roots,
        }
    }

    /// Uses the running executable as the sandbox program.
    pub fn current_exe(call_timeout: Duration, roots: Roots) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, call_timeout, roots))
    }

    /// Arguments placed before the `sandbox` subcommand, such as logging flags.
    pub fn with_global_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn args(&self, generation: u64, root: &Path) -> Vec<String> {
        let mut args = self.extra_args.clone();
        args.extend([
            "sandbox".to_string(),
            "--root".to_string(),
            root.display().to_string(),
            "--generation".to_string(),
            generation.to_string(),
            "--proc-root".to_string(),
            self.roots.proc_root.display().to_string(),
            "--sys-root".to_string(),
            self.roots.sys_root.display().to_string(),
        ]);
        args
    }
}

#[async_trait]
impl SandboxFactory for ProcessSandboxFactory {
    async fn create(&self, generation: u64, root: &Path) -> Result<Arc<dyn Sandbox>, SandboxError> {
        let sandbox = ProcessSandbox::spawn(
            &self.program,
            &self.args(generation, root),
            generation,
            self.call_timeout,
        )?;
        Ok(Arc::new(sandbox))
    }
}
