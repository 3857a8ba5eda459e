//! monagent - host metrics agent with sandboxed plugin checks.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use monagent::check::builtin_checks;
use monagent::config::{AgentConfig, DEFAULT_CONFIG_PATH};
use monagent::logging;
use monagent::plugin::{manifest, server, PluginLoader, ProcessSandboxFactory};
use monagent::poster::{HttpPoster, JsonLinesPoster, Poster, PosterSet};
use monagent::scheduler::{PollScheduler, SchedulerConfig};
use monagent::telemetry::Roots;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span, warn, Instrument};

/// Collects host metrics and plugin checks and ships them on an interval
#[derive(Parser, Debug)]
#[command(name = "monagent")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    log: LogArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LogArgs {
    /// Log filter, e.g. "monagent=debug" (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,
}

impl LogArgs {
    /// The same logging flags, for the sandbox child.
    fn forwarded(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(level) = &self.log_level {
            args.push("--log-level".to_string());
            args.push(level.clone());
        }
        if self.log_json {
            args.push("--log-json".to_string());
        }
        args
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent
    Run {
        /// Configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Poll interval in seconds
        #[arg(short, long)]
        interval: Option<u64>,

        /// Plugin directory
        #[arg(short, long)]
        plugin_dir: Option<PathBuf>,

        /// Run a single tick, print the payload and exit
        #[arg(long)]
        once: bool,
    },

    /// List the checks and slices every plugin manifest declares, without running any plugin
    Inspect {
        /// Configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Plugin directory
        #[arg(short, long)]
        plugin_dir: Option<PathBuf>,
    },

    /// Sandbox child process entry point
    #[command(hide = true)]
    Sandbox {
        #[arg(long)]
        root: PathBuf,

        #[arg(long)]
        generation: u64,

        #[arg(long, default_value = "/proc")]
        proc_root: PathBuf,

        #[arg(long, default_value = "/sys")]
        sys_root: PathBuf,
    },
}

fn build_poster(config: &AgentConfig) -> Result<Arc<dyn Poster>> {
    let mut posters = PosterSet::new();
    if let Some(endpoint) = &config.poster.endpoint {
        posters.push(Arc::new(HttpPoster::new(
            endpoint.clone(),
            config.poster.agent_key.clone(),
            Duration::from_secs(config.poster.timeout_secs),
        )?));
    }
    if let Some(output) = &config.poster.output {
        posters.push(Arc::new(JsonLinesPoster::new(output)?));
    }
    if posters.is_empty() {
        warn!("No poster configured, payloads are only logged at debug level");
    }
    Ok(Arc::new(posters))
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

async fn run(
    log: &LogArgs,
    config: PathBuf,
    interval: Option<u64>,
    plugin_dir: Option<PathBuf>,
    once: bool,
) -> Result<()> {
    let mut config = AgentConfig::load_or_default(&config)?;
    if let Some(interval) = interval {
        config.interval_secs = interval;
    }
    if let Some(plugin_dir) = plugin_dir {
        config.plugin_dir = plugin_dir;
    }
    config.validate()?;

    let roots = Roots::new(&config.proc_root, &config.sys_root);
    let factory = ProcessSandboxFactory::current_exe(config.sandbox_call_timeout(), roots.clone())
        .context("Failed to locate the agent executable")?
        .with_global_args(log.forwarded());
    let loader = PluginLoader::new(&config.plugin_dir, &config.work_dir, Arc::new(factory));

    let scheduler_config = SchedulerConfig {
        interval: config.interval(),
        max_workers: config.max_workers,
        memory_limit_bytes: config.plugin_memory_limit_bytes,
        self_diagnostics: config.self_diagnostics,
    };
    let mut scheduler = PollScheduler::start(scheduler_config, builtin_checks(&roots), loader, build_poster(&config)?)
        .await
        .context("Failed to start the poll scheduler")?;

    if once {
        let report = scheduler.tick().await;
        scheduler.stop().await;
        println!("{}", serde_json::to_string_pretty(&report.payload)?);
        return Ok(());
    }

    if let Err(e) = scheduler.watch_plugins() {
        warn!(error = %format!("{e:#}"), "Plugin directory is not watched, reloads only on memory ceiling");
    }
    scheduler.run(shutdown_signal()).await;
    Ok(())
}

fn inspect(config: PathBuf, plugin_dir: Option<PathBuf>) -> Result<()> {
    let config = AgentConfig::load_or_default(&config)?;
    let plugin_dir = plugin_dir.unwrap_or(config.plugin_dir);

    let mut modules = Vec::new();
    let mut errors = Vec::new();
    for path in manifest::discover(&plugin_dir)? {
        match manifest::inspect(&path) {
            Ok(info) => modules.push(info),
            Err(e) => errors.push(json!({ "path": path, "error": e.to_string() })),
        }
    }

    let report = json!({ "modules": modules, "errors": errors });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log.log_level.as_deref(), cli.log.log_json)?;

    match cli.command {
        Command::Run {
            config,
            interval,
            plugin_dir,
            once,
        } => run(&cli.log, config, interval, plugin_dir, once).await,
        Command::Inspect { config, plugin_dir } => inspect(config, plugin_dir),
        Command::Sandbox {
            root,
            generation,
            proc_root,
            sys_root,
        } => {
            server::run_sandbox(root, Roots::new(proc_root, sys_root))
                .instrument(info_span!("sandbox", generation))
                .await
        }
    }
}
