//! Drives a real sandbox child through the compiled binary.

use monagent::check::CheckKind;
use monagent::plugin::{PluginLoader, ProcessSandboxFactory};
use monagent::telemetry::Roots;
use serde_json::json;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn plugin_tree() -> TempDir {
    let dir = TempDir::new().unwrap();
    script(dir.path(), "queue.sh", "cat");
    script(dir.path(), "stream.sh", "echo '{\"n\":1}'\nexec sleep 30");
    script(dir.path(), "fail.sh", "exit 2");
    fs::write(dir.path().join("Queue.json"), r#"{"depth": 3}"#).unwrap();
    fs::write(
        dir.path().join("checks.toml"),
        r#"
[[check]]
type = "Queue"
key = "queue"
command = "queue.sh"

[[check]]
type = "Stream"
key = "stream"
kind = "long_running"
command = "stream.sh"

[[check]]
type = "Broken"
key = "broken"
command = "fail.sh"
"#,
    )
    .unwrap();
    fs::write(
        dir.path().join("load.toml"),
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
    fs::write(dir.path().join("bad.toml"), "[[check]]\ntype = \"X\"\nkey = \"x\"\ncommand = \"/bin/true\"\n").unwrap();
    dir
}

#[tokio::test]
async fn sandbox_child_runs_plugins_end_to_end() {
    let plugins = plugin_tree();
    let work = TempDir::new().unwrap();
    let factory = ProcessSandboxFactory::new(
        env!("CARGO_BIN_EXE_monagent"),
        Duration::from_secs(20),
        Roots::default(),
    );
    let mut loader = PluginLoader::new(plugins.path(), work.path(), Arc::new(factory));
    let generation = loader.load().await.unwrap();

    let keys: Vec<_> = generation.checks.iter().map(|c| (c.key.as_str(), c.kind)).collect();
    assert_eq!(
        keys,
        [
            ("queue", CheckKind::Immediate),
            ("stream", CheckKind::LongRunning),
            ("broken", CheckKind::Immediate)
        ]
    );
    assert_eq!(generation.slice_types, ["Load"]);

    let sandbox = generation.sandbox.clone();
    assert_eq!(sandbox.run_check("queue").await.unwrap(), Some(json!({"depth": 3})));
    assert!(sandbox.run_check("broken").await.is_err());
    assert!(sandbox.run_check("stream").await.is_err());

    let mut streamed = None;
    for _ in 0..100 {
        let results = sandbox.long_running_results().await.unwrap();
        if let Some(value) = results.get("stream") {
            streamed = Some(value.clone());
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(streamed, Some(json!({"n": 1})));
    assert!(sandbox.long_running_results().await.unwrap().is_empty());

    let records = sandbox.populate_slice("Load").await.unwrap();
    assert!(records["Slice[Load]-[0]"]["load1"].is_number());
    assert!(sandbox.allocated_bytes().await.is_ok());

    let snapshot = work.path().join("generation-1");
    assert!(snapshot.join("checks.toml").exists());
    generation.shutdown().await;
    assert!(!snapshot.exists());
    assert!(sandbox.run_check("queue").await.is_err());
}

/// True while `pid` exists and is not a zombie.
fn running(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}

#[tokio::test]
async fn teardown_kills_plugins_even_with_a_hung_check() {
    let plugins = TempDir::new().unwrap();
    let marks = TempDir::new().unwrap();
    let pid_file = marks.path().join("stream.pid");
    script(plugins.path(), "stream.sh", "echo $$ > \"$1\"\necho '{\"n\":1}'\nexec sleep 120");
    script(plugins.path(), "hang.sh", "exec sleep 120");
    fs::write(
        plugins.path().join("plugins.toml"),
        format!(
            r#"
[[check]]
type = "Stream"
key = "stream"
kind = "long_running"
command = "stream.sh"
args = ["{}"]

[[check]]
type = "Hang"
key = "hang"
command = "hang.sh"
timeout_secs = 60
"#,
            pid_file.display()
        ),
    )
    .unwrap();

    let work = TempDir::new().unwrap();
    let factory = ProcessSandboxFactory::new(
        env!("CARGO_BIN_EXE_monagent"),
        Duration::from_secs(1),
        Roots::default(),
    );
    let mut loader = PluginLoader::new(plugins.path(), work.path(), Arc::new(factory));
    let generation = loader.load().await.unwrap();

    let mut stream_pid = None;
    for _ in 0..100 {
        if let Some(pid) = fs::read_to_string(&pid_file).ok().and_then(|s| s.trim().parse::<u32>().ok()) {
            stream_pid = Some(pid);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let stream_pid = stream_pid.expect("long-running plugin never started");
    assert!(running(stream_pid));

    // The sandbox keeps running the check after the agent gives up on it
    assert!(generation.sandbox.run_check("hang").await.is_err());
    generation.shutdown().await;

    let mut alive = true;
    for _ in 0..40 {
        alive = running(stream_pid);
        if !alive {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!alive, "long-running plugin {stream_pid} survived teardown");
}
