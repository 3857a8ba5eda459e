//! Request loop of the sandbox child.

use super::host::PluginHost;
use super::protocol::{Reply, Request, RequestFrame};
use anyhow::Result;
use serde::Serialize;
use crate::telemetry::Roots;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// How long in-flight requests may finish after a shutdown request. Shorter
/// than the agent's grace period, so the reply still arrives in time.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(3);

/// Serves requests from `input` until a shutdown request or end of input.
/// Each request runs on its own task; replies are written as they complete.
pub async fn serve<R, W>(host: Arc<PluginHost>, input: R, output: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Reply>();
    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(reply) = rx.recv().await {
            let mut line = serde_json::to_vec(&reply)?;
            line.push(b'\n');
            output.write_all(&line).await?;
            output.flush().await?;
        }
        anyhow::Ok(())
    });

    let mut lines = BufReader::new(input).lines();
    let mut tasks = JoinSet::new();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let frame: RequestFrame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Unreadable request");
                continue;
            }
        };
        debug!(id = frame.id, op = frame.request.op(), "Request");

        if frame.request == Request::Shutdown {
            info!("Shutdown requested");
            let drained = tokio::time::timeout(SHUTDOWN_DRAIN, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(in_flight = tasks.len(), "Abandoning requests still running at shutdown");
                // Dropping a running plugin check kills its process
                tasks.shutdown().await;
            }
            host.shutdown();
            // The writer outlives this send, so it cannot fail here
            let _ = tx.send(Reply::ok(frame.id, Value::Null));
            break;
        }

        let host = host.clone();
        let tx = tx.clone();
        tasks.spawn(async move {
            let reply = handle(&host, frame).await;
            // A closed writer means the agent is gone and nobody awaits this reply
            let _ = tx.send(reply);
        });
    }

    tasks.shutdown().await;
    host.shutdown();
    drop(tx);
    writer.await??;
    Ok(())
}

/// Entry point of the `sandbox` subcommand: serves over stdin and stdout.
pub async fn run_sandbox(root: PathBuf, roots: Roots) -> Result<()> {
    info!(root = %root.display(), pid = std::process::id(), "Sandbox started");
    let host = Arc::new(PluginHost::new(root, roots));
    serve(host, tokio::io::stdin(), tokio::io::stdout()).await
}

fn encode<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

async fn handle(host: &PluginHost, frame: RequestFrame) -> Reply {
    let result = match frame.request {
        Request::LoadModule { path } => match host.load_module(&path).await {
            Ok(checks) => encode(checks),
            Err(e) => Err(e.into()),
        },
        Request::LoadSliceDescriptors { path } => match host.load_slice_descriptors(&path) {
            Ok(names) => encode(names),
            Err(e) => Err(e.into()),
        },
        Request::RunCheck { key } => host.run_check(&key).await.map(|v| v.unwrap_or(Value::Null)),
        Request::LongRunningResults => Ok(Value::Object(host.long_running_results())),
        Request::PopulateSlice { type_name } => host.populate_slice(&type_name).await.map(Value::Object),
        Request::AllocatedBytes => encode(host.allocated_bytes()),
        Request::Shutdown => {
            host.shutdown();
            Ok(Value::Null)
        }
    };

    match result {
        Ok(value) => Reply::ok(frame.id, value),
        Err(e) => Reply::err(frame.id, format!("{e:#}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::fixtures;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn serves_until_shutdown() {
        let plugins = TempDir::new().unwrap();
        let (_fixture, roots) = fixtures::host();
        let manifest = plugins.path().join("load.toml");
        fs::write(
            &manifest,
            r#"
[[slice]]
type = "Load"
source = "object"
category = "loadavg"

[[slice.field]]
name = "load1"
type = "float"
"#,
        )
        .unwrap();

        let host = Arc::new(PluginHost::new(plugins.path(), roots));
        let (mut agent_side, sandbox_side) = duplex(64 * 1024);
        let (sandbox_in, sandbox_out) = tokio::io::split(sandbox_side);
        let server = tokio::spawn(serve(host, sandbox_in, sandbox_out));

        let requests = [
            json!({"id": 1, "op": "load_slice_descriptors", "path": manifest}),
            json!({"id": 2, "op": "run_check", "key": "missing"}),
            json!({"id": 3, "op": "shutdown"}),
        ];
        for request in &requests {
            agent_side
                .write_all(format!("{request}\n").as_bytes())
                .await
                .unwrap();
        }

        let mut replies = Vec::new();
        let mut lines = BufReader::new(&mut agent_side).lines();
        while let Some(line) = lines.next_line().await.unwrap() {
            replies.push(serde_json::from_str::<Reply>(&line).unwrap());
        }
        server.await.unwrap().unwrap();

        let by_id = |id: u64| replies.iter().find(|r| r.id == id).cloned().unwrap();
        assert_eq!(by_id(1).ok, Some(json!(["Load"])));
        assert!(by_id(2).err.unwrap().contains("missing"));
        assert_eq!(by_id(3).into_result().unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn shutdown_abandons_hung_checks_after_drain() {
        use std::os::unix::fs::PermissionsExt;

        let plugins = TempDir::new().unwrap();
        let (_fixture, roots) = fixtures::host();
        let script = plugins.path().join("hang.sh");
        fs::write(&script, "#!/bin/sh\nexec sleep 60\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let manifest = plugins.path().join("hang.toml");
        fs::write(
            &manifest,
            "[[check]]\ntype = \"Hang\"\nkey = \"hang\"\ncommand = \"hang.sh\"\ntimeout_secs = 60\n",
        )
        .unwrap();

        let host = Arc::new(PluginHost::new(plugins.path(), roots));
        let (agent_side, sandbox_side) = duplex(64 * 1024);
        let (sandbox_in, sandbox_out) = tokio::io::split(sandbox_side);
        let server = tokio::spawn(serve(host, sandbox_in, sandbox_out));
        let (agent_in, mut agent_out) = tokio::io::split(agent_side);
        let mut lines = BufReader::new(agent_in).lines();

        let load = json!({"id": 1, "op": "load_module", "path": manifest});
        agent_out.write_all(format!("{load}\n").as_bytes()).await.unwrap();
        let loaded: Reply = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(loaded.id, 1);
        assert!(loaded.err.is_none());

        for request in [
            json!({"id": 2, "op": "run_check", "key": "hang"}),
            json!({"id": 3, "op": "shutdown"}),
        ] {
            agent_out.write_all(format!("{request}\n").as_bytes()).await.unwrap();
        }

        let finished = tokio::time::timeout(SHUTDOWN_DRAIN + Duration::from_secs(5), server).await;
        finished.expect("shutdown waited on a hung check").unwrap().unwrap();

        let mut replies = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            replies.push(serde_json::from_str::<Reply>(&line).unwrap());
        }
        assert!(replies.iter().any(|r| r.id == 3 && r.err.is_none()));
        assert!(!replies.iter().any(|r| r.id == 2));
    }
}
