//! The poll loop: run every check, merge, post, then decide on a reload.

pub mod reload;

pub use reload::{PluginWatcher, ReloadFlag, ReloadPolicy, ReloadReason};

use crate::check::Check;
use crate::payload::{Payload, PayloadBuilder, PLUGINS_KEY};
use crate::plugin::{Generation, PluginLoader, Sandbox};
use crate::poster::Poster;
use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Key of the optional self-diagnostics entry.
pub const DIAGNOSTICS_KEY: &str = "agentDiagnostics";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub max_workers: usize,
    pub memory_limit_bytes: u64,
    pub self_diagnostics: bool,
}

struct BuiltinCheck {
    key: String,
    one_shot: bool,
    check: Arc<Mutex<Box<dyn Check>>>,
}

/// What one tick produced.
#[derive(Debug)]
pub struct TickReport {
    pub payload: Payload,
    pub collisions: usize,
    pub posted: bool,
    pub reloaded: Option<ReloadReason>,
}

enum Slot {
    Builtin { key: String, result: Result<Option<Value>> },
    Plugin { key: String, result: Result<Option<Value>> },
    LongRunning(Result<Payload>),
    Slice { type_name: String, result: Result<Payload> },
}

pub struct PollScheduler {
    config: SchedulerConfig,
    builtins: Vec<BuiltinCheck>,
    loader: PluginLoader,
    generation: Option<Generation>,
    reload_flag: ReloadFlag,
    policy: ReloadPolicy,
    poster: Arc<dyn Poster>,
    workers: Arc<Semaphore>,
    watcher: Option<PluginWatcher>,
}

impl PollScheduler {
    /// Validates the configuration and loads the first plugin generation.
    /// A failed plugin load is retried on the next tick; only an unusable
    /// configuration fails here.
    pub async fn start(
        config: SchedulerConfig,
        builtins: Vec<Box<dyn Check>>,
        mut loader: PluginLoader,
        poster: Arc<dyn Poster>,
    ) -> Result<Self> {
        if config.interval.is_zero() {
            bail!("poll interval must be positive");
        }
        if config.max_workers == 0 {
            bail!("max_workers must be positive");
        }

        let reload_flag = ReloadFlag::default();
        let generation = match loader.load().await {
            Ok(generation) => Some(generation),
            Err(e) => {
                error!(error = %e, "Initial plugin load failed, retrying next tick");
                reload_flag.set();
                None
            }
        };

        let builtins = builtins
            .into_iter()
            .map(|check| BuiltinCheck {
                key: check.key().to_string(),
                one_shot: check.one_shot(),
                check: Arc::new(Mutex::new(check)),
            })
            .collect();

        info!(
            interval_secs = config.interval.as_secs(),
            max_workers = config.max_workers,
            "Poll scheduler started"
        );
        Ok(Self {
            workers: Arc::new(Semaphore::new(config.max_workers)),
            policy: ReloadPolicy {
                memory_limit_bytes: config.memory_limit_bytes,
            },
            config,
            builtins,
            loader,
            generation,
            reload_flag,
            poster,
            watcher: None,
        })
    }

    /// Watches the plugin directory so edits trigger a reload.
    pub fn watch_plugins(&mut self) -> Result<()> {
        let watcher = PluginWatcher::new(self.loader.plugin_dir(), self.reload_flag.clone())?;
        self.watcher = Some(watcher);
        Ok(())
    }

    pub fn reload_flag(&self) -> ReloadFlag {
        self.reload_flag.clone()
    }

    pub fn builtin_keys(&self) -> Vec<&str> {
        self.builtins.iter().map(|b| b.key.as_str()).collect()
    }

    /// Id of the live sandbox generation, if one is loaded.
    pub fn generation_id(&self) -> Option<u64> {
        self.generation.as_ref().map(|g| g.id)
    }

    /// Ticks on the configured interval until `shutdown` resolves. Ticks
    /// never overlap; a tick that overruns skips the missed fires.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    debug!(
                        entries = report.payload.len(),
                        collisions = report.collisions,
                        posted = report.posted,
                        "Tick complete"
                    );
                }
            }
        }
        self.stop().await;
    }

    /// Tears down the live generation.
    pub async fn stop(&mut self) {
        self.watcher = None;
        if let Some(generation) = self.generation.take() {
            generation.shutdown().await;
        }
        info!("Poll scheduler stopped");
    }

    /// Runs one full cycle: fan out every check, merge, post, reload.
    pub async fn tick(&mut self) -> TickReport {
        let mut tasks = JoinSet::new();
        self.spawn_builtins(&mut tasks);
        if let Some(generation) = &self.generation {
            self.spawn_plugins(generation, &mut tasks);
        }

        let mut top = PayloadBuilder::new();
        let mut plugins = PayloadBuilder::new();
        let mut finished_one_shots = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            let slot = match joined {
                Ok(slot) => slot,
                Err(e) => {
                    error!(error = %e, "Check task panicked");
                    continue;
                }
            };
            match slot {
                Slot::Builtin { key, result } => match result {
                    Ok(Some(value)) => {
                        top.insert(&key, value);
                        finished_one_shots.insert(key);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(key = %key, error = %format!("{e:#}"), "Check failed"),
                },
                Slot::Plugin { key, result } => match result {
                    Ok(Some(value)) => {
                        plugins.insert(&key, value);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(key = %key, error = %format!("{e:#}"), "Plugin check failed"),
                },
                Slot::LongRunning(result) => match result {
                    Ok(results) => plugins.extend(results),
                    Err(e) => warn!(error = %format!("{e:#}"), "Draining long-running results failed"),
                },
                Slot::Slice { type_name, result } => match result {
                    Ok(records) => plugins.extend(records),
                    Err(e) => warn!(slice = %type_name, error = %format!("{e:#}"), "Slice population failed"),
                },
            }
        }

        let allocated = self.allocated_bytes().await;
        if self.config.self_diagnostics {
            top.insert(DIAGNOSTICS_KEY, self.diagnostics(allocated));
        }
        let collisions = top.collisions() + plugins.collisions();
        if !plugins.is_empty() {
            top.insert(PLUGINS_KEY, Value::Object(plugins.into_payload()));
        }

        let payload = top.into_payload();
        let posted = match self.poster.post(&payload).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %format!("{e:#}"), "Posting payload failed");
                false
            }
        };

        let reloaded = self.evaluate_reload(allocated).await;
        self.builtins
            .retain(|b| !(b.one_shot && finished_one_shots.contains(&b.key)));

        TickReport {
            payload,
            collisions,
            posted,
            reloaded,
        }
    }

    fn spawn_builtins(&self, tasks: &mut JoinSet<Slot>) {
        for builtin in &self.builtins {
            let key = builtin.key.clone();
            let check = builtin.check.clone();
            let workers = self.workers.clone();
            tasks.spawn(async move {
                let result = match workers.acquire_owned().await {
                    Ok(_permit) => tokio::task::spawn_blocking(move || {
                        let mut check = check.lock();
                        check.run()
                    })
                        .await
                        .unwrap_or_else(|e| Err(anyhow::anyhow!("check panicked: {e}"))),
                    Err(e) => Err(e.into()),
                };
                Slot::Builtin { key, result }
            });
        }
    }

    fn spawn_plugins(&self, generation: &Generation, tasks: &mut JoinSet<Slot>) {
        for key in generation.immediate_keys() {
            let key = key.to_string();
            let sandbox = generation.sandbox.clone();
            let workers = self.workers.clone();
            tasks.spawn(async move {
                let result = match workers.acquire_owned().await {
                    Ok(_permit) => sandbox.run_check(&key).await.map_err(Into::into),
                    Err(e) => Err(e.into()),
                };
                Slot::Plugin { key, result }
            });
        }

        let sandbox = generation.sandbox.clone();
        let workers = self.workers.clone();
        tasks.spawn(async move {
            let result = match workers.acquire_owned().await {
                Ok(_permit) => sandbox.long_running_results().await.map_err(Into::into),
                Err(e) => Err(e.into()),
            };
            Slot::LongRunning(result)
        });

        for type_name in &generation.slice_types {
            let type_name = type_name.clone();
            let sandbox = generation.sandbox.clone();
            let workers = self.workers.clone();
            tasks.spawn(async move {
                let result = match workers.acquire_owned().await {
                    Ok(_permit) => sandbox.populate_slice(&type_name).await.map_err(Into::into),
                    Err(e) => Err(e.into()),
                };
                Slot::Slice { type_name, result }
            });
        }
    }

    async fn allocated_bytes(&self) -> Option<u64> {
        let sandbox: &Arc<dyn Sandbox> = &self.generation.as_ref()?.sandbox;
        match sandbox.allocated_bytes().await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(generation = sandbox.generation(), error = %e, "Reading sandbox memory failed");
                None
            }
        }
    }

    fn diagnostics(&self, allocated: Option<u64>) -> Value {
        let generation = self.generation.as_ref();
        json!({
            "generation": generation.map(|g| g.id),
            "sandbox_allocated_bytes": allocated,
            "memory_limit_bytes": self.config.memory_limit_bytes,
            "plugin_checks": generation.map_or(0, |g| g.checks.len()),
            "slice_types": generation.map_or(0, |g| g.slice_types.len()),
        })
    }

    /// Consumes the reload flag, then tears down the old generation before
    /// the new one is built.
    async fn evaluate_reload(&mut self, allocated: Option<u64>) -> Option<ReloadReason> {
        let files_changed = self.reload_flag.take();
        let reason = self.policy.evaluate(files_changed, allocated)?;
        info!(reason = %reason, "Reloading plugins");

        if let Some(old) = self.generation.take() {
            old.shutdown().await;
        }
        match self.loader.load().await {
            Ok(generation) => self.generation = Some(generation),
            Err(e) => {
                error!(error = %e, "Plugin reload failed, retrying next tick");
                self.reload_flag.set();
            }
        }
        Some(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{CheckDescriptor, CheckKind};
    use crate::error::SandboxError;
    use crate::plugin::SandboxFactory;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Fixed(&'static str, Value);

    impl Check for Fixed {
        fn key(&self) -> &str {
            self.0
        }
        fn run(&mut self) -> Result<Option<Value>> {
            Ok(Some(self.1.clone()))
        }
    }

    struct AlwaysFails;

    impl Check for AlwaysFails {
        fn key(&self) -> &str {
            "broken"
        }
        fn run(&mut self) -> Result<Option<Value>> {
            bail!("source vanished")
        }
    }

    struct OneShot;

    impl Check for OneShot {
        fn key(&self) -> &str {
            "systemStats"
        }
        fn run(&mut self) -> Result<Option<Value>> {
            Ok(Some(json!({"hostname": "box"})))
        }
        fn one_shot(&self) -> bool {
            true
        }
    }

    /// In-process stand-in for a sandbox generation.
    struct FakeSandbox {
        generation: u64,
        allocated: AtomicU64,
        /// Also report a long-running result under the immediate check's key
        streams: bool,
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        fn generation(&self) -> u64 {
            self.generation
        }
        async fn load_module(&self, path: &Path) -> Result<Vec<CheckDescriptor>, SandboxError> {
            let module = path.file_name().unwrap().to_string_lossy().into_owned();
            Ok(vec![CheckDescriptor {
                key: "queue".into(),
                kind: CheckKind::Immediate,
                module,
            }])
        }
        async fn load_slice_descriptors(&self, _path: &Path) -> Result<Vec<String>, SandboxError> {
            Ok(vec!["Load".into()])
        }
        async fn run_check(&self, key: &str) -> Result<Option<Value>, SandboxError> {
            Ok(Some(json!({"key": key, "generation": self.generation})))
        }
        async fn long_running_results(&self) -> Result<Payload, SandboxError> {
            if !self.streams {
                return Err(SandboxError::Closed(self.generation));
            }
            let mut results = Payload::new();
            results.insert("queue".into(), json!({"streamed": true}));
            Ok(results)
        }
        async fn populate_slice(&self, type_name: &str) -> Result<Payload, SandboxError> {
            let mut records = Payload::new();
            records.insert(format!("Slice[{type_name}]-[0]"), json!({"load1": 0.5}));
            Ok(records)
        }
        async fn allocated_bytes(&self) -> Result<u64, SandboxError> {
            Ok(self.allocated.load(Ordering::SeqCst))
        }
        async fn shutdown(&self) -> Result<(), SandboxError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        created: AtomicUsize,
        last: Mutex<Option<Arc<FakeSandbox>>>,
        streams: bool,
    }

    #[async_trait]
    impl SandboxFactory for FakeFactory {
        async fn create(&self, generation: u64, _root: &Path) -> Result<Arc<dyn Sandbox>, SandboxError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let sandbox = Arc::new(FakeSandbox {
                generation,
                allocated: AtomicU64::new(0),
                streams: self.streams,
            });
            *self.last.lock() = Some(sandbox.clone());
            Ok(sandbox)
        }
    }

    #[derive(Default)]
    struct Collecting(Mutex<Vec<Payload>>);

    #[async_trait]
    impl Poster for Collecting {
        async fn post(&self, payload: &Payload) -> Result<()> {
            self.0.lock().push(payload.clone());
            Ok(())
        }
    }

    struct Down;

    #[async_trait]
    impl Poster for Down {
        async fn post(&self, _payload: &Payload) -> Result<()> {
            bail!("endpoint unreachable")
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(60),
            max_workers: 4,
            memory_limit_bytes: 1024,
            self_diagnostics: false,
        }
    }

    /// Plugin directory with `modules` identical check manifests and one slice.
    fn plugin_dir(modules: usize) -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("run.sh"), "#!/bin/sh\n").unwrap();
        for i in 0..modules {
            std::fs::write(
                dir.path().join(format!("m{i}.toml")),
                "[[check]]\ntype = \"Queue\"\nkey = \"queue\"\ncommand = \"run.sh\"\n",
            )
            .unwrap();
        }
        std::fs::write(
            dir.path().join("slices.toml"),
            "[[slice]]\ntype = \"Load\"\nsource = \"object\"\ncategory = \"loadavg\"\n\n[[slice.field]]\nname = \"load1\"\ntype = \"float\"\n",
        )
        .unwrap();
        dir
    }

    async fn scheduler(
        plugins: &TempDir,
        work: &TempDir,
        builtins: Vec<Box<dyn Check>>,
        poster: Arc<dyn Poster>,
    ) -> (PollScheduler, Arc<FakeFactory>) {
        let factory = Arc::new(FakeFactory::default());
        let loader = PluginLoader::new(plugins.path(), work.path(), factory.clone());
        let scheduler = PollScheduler::start(config(), builtins, loader, poster).await.unwrap();
        (scheduler, factory)
    }

    #[tokio::test]
    async fn failing_check_never_blocks_the_others() {
        let (plugins, work) = (plugin_dir(1), TempDir::new().unwrap());
        let poster = Arc::new(Collecting::default());
        let builtins: Vec<Box<dyn Check>> = vec![Box::new(AlwaysFails), Box::new(Fixed("loadAvrg", json!(0.25)))];
        let (mut scheduler, _) = scheduler(&plugins, &work, builtins, poster.clone()).await;

        for _ in 0..5 {
            let report = scheduler.tick().await;
            assert!(report.posted);
            assert!(!report.payload.contains_key("broken"));
            assert_eq!(report.payload["loadAvrg"], json!(0.25));
            assert_eq!(report.payload[PLUGINS_KEY]["queue"]["key"], json!("queue"));
            assert_eq!(report.payload[PLUGINS_KEY]["Slice[Load]-[0]"], json!({"load1": 0.5}));
        }
        assert_eq!(poster.0.lock().len(), 5);
        assert_eq!(scheduler.builtin_keys(), ["broken", "loadAvrg"]);
    }

    /// Counts warn events that carry a `renamed` field.
    #[derive(Clone, Default)]
    struct RenameWarnings(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for RenameWarnings {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            let meta = event.metadata();
            if *meta.level() == tracing::Level::WARN && meta.fields().field("renamed").is_some() {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test]
    async fn colliding_plugin_keys_are_both_kept() {
        use tracing_subscriber::layer::SubscriberExt;

        let warnings = RenameWarnings::default();
        let _subscriber = tracing::subscriber::set_default(tracing_subscriber::registry().with(warnings.clone()));

        let (plugins, work) = (plugin_dir(1), TempDir::new().unwrap());
        let factory = Arc::new(FakeFactory {
            streams: true,
            ..Default::default()
        });
        let loader = PluginLoader::new(plugins.path(), work.path(), factory);
        let mut scheduler = PollScheduler::start(config(), Vec::new(), loader, Arc::new(Collecting::default()))
            .await
            .unwrap();

        let report = scheduler.tick().await;
        let plugin_results = report.payload[PLUGINS_KEY].as_object().unwrap();
        let mut queued: Vec<_> = [&plugin_results["queue"], &plugin_results["queue_2"]].into_iter().cloned().collect();
        queued.sort_by_key(|v| v.get("streamed").is_some());
        assert_eq!(queued[0]["key"], json!("queue"));
        assert_eq!(queued[1], json!({"streamed": true}));
        assert_eq!(report.collisions, 1);
        assert_eq!(warnings.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn memory_ceiling_triggers_exactly_one_reload() {
        let (plugins, work) = (plugin_dir(1), TempDir::new().unwrap());
        let (mut scheduler, factory) =
            scheduler(&plugins, &work, Vec::new(), Arc::new(Collecting::default())).await;
        assert_eq!(scheduler.generation_id(), Some(1));

        let first = factory.last.lock().clone().unwrap();
        first.allocated.store(4096, Ordering::SeqCst);

        let report = scheduler.tick().await;
        assert_eq!(
            report.reloaded,
            Some(ReloadReason::MemoryCeiling {
                allocated: 4096,
                limit: 1024
            })
        );
        assert_eq!(scheduler.generation_id(), Some(2));
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);

        let fresh = factory.last.lock().clone().unwrap();
        assert_eq!(fresh.allocated_bytes().await.unwrap(), 0);
        let report = scheduler.tick().await;
        assert_eq!(report.reloaded, None);
        assert_eq!(report.payload[PLUGINS_KEY]["queue"]["generation"], json!(2));
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn file_change_reloads_and_one_shot_is_dropped() {
        let (plugins, work) = (plugin_dir(1), TempDir::new().unwrap());
        let builtins: Vec<Box<dyn Check>> = vec![Box::new(OneShot)];
        let (mut scheduler, factory) = scheduler(&plugins, &work, builtins, Arc::new(Down)).await;

        scheduler.reload_flag().set();
        let report = scheduler.tick().await;
        assert!(!report.posted);
        assert_eq!(report.payload["systemStats"], json!({"hostname": "box"}));
        assert_eq!(report.reloaded, Some(ReloadReason::FilesChanged));
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);

        let report = scheduler.tick().await;
        assert!(!report.payload.contains_key("systemStats"));
        assert_eq!(report.reloaded, None);
        assert!(scheduler.builtin_keys().is_empty());
    }

    #[tokio::test]
    async fn diagnostics_report_the_generation() {
        let (plugins, work) = (plugin_dir(1), TempDir::new().unwrap());
        let factory = Arc::new(FakeFactory::default());
        let loader = PluginLoader::new(plugins.path(), work.path(), factory);
        let config = SchedulerConfig {
            self_diagnostics: true,
            ..config()
        };
        let mut scheduler = PollScheduler::start(config, Vec::new(), loader, Arc::new(Collecting::default()))
            .await
            .unwrap();

        let report = scheduler.tick().await;
        let diagnostics = &report.payload[DIAGNOSTICS_KEY];
        assert_eq!(diagnostics["generation"], json!(1));
        assert_eq!(diagnostics["sandbox_allocated_bytes"], json!(0));
        assert_eq!(diagnostics["slice_types"], json!(1));
    }

    #[tokio::test]
    async fn zero_workers_is_fatal() {
        let (plugins, work) = (plugin_dir(0), TempDir::new().unwrap());
        let loader = PluginLoader::new(plugins.path(), work.path(), Arc::new(FakeFactory::default()));
        let config = SchedulerConfig {
            max_workers: 0,
            ..config()
        };
        assert!(PollScheduler::start(config, Vec::new(), loader, Arc::new(Collecting::default()))
            .await
            .is_err());
    }
}
