//! Supervisor: worker registry, config polling and shutdown.

use crate::config::{
    ChangedFile, Config, ConfigListener, ConfigStore, WorkerDefinition, load_definitions,
};
use crate::context::AppContext;
use crate::error::{Error, Result};
use crate::model::{StatusSnapshot, WorkerId};
use crate::worker::{JobFactory, Worker};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Configuration for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Directory polled for config changes.
    pub config_dir: PathBuf,
    /// Worker definitions file, relative to `config_dir`.
    pub definitions_file: String,
    pub poll_interval: Duration,
    /// How long shutdown waits for each worker task.
    pub shutdown_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("conf"),
            definitions_file: "workers.toml".to_string(),
            poll_interval: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(15),
        }
    }
}

impl From<&Config> for SupervisorConfig {
    fn from(config: &Config) -> Self {
        Self {
            config_dir: config.config_dir.clone(),
            definitions_file: config.definitions_file.clone(),
            poll_interval: config.poll_interval,
            shutdown_grace: config.shutdown_grace,
        }
    }
}

/// What one `load_workers` call did, by worker name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Registered and started.
    pub started: Vec<String>,
    /// Registered, left in `Init`.
    pub registered: Vec<String>,
    /// Registered in `Fatal` because their properties were rejected.
    pub fatal: Vec<String>,
    /// Registered but `start()` failed.
    pub failed: Vec<String>,
    /// Not registered: unknown implementation.
    pub skipped: Vec<String>,
    /// Already registered; left untouched.
    pub existing: Vec<String>,
}

pub struct Supervisor {
    app: AppContext,
    factory: JobFactory,
    config: SupervisorConfig,
    store: ConfigStore,
    workers: RwLock<BTreeMap<String, Arc<Worker>>>,
    next_id: AtomicU64,
    stopping: watch::Sender<bool>,
}

impl Supervisor {
    /// Build a supervisor and bind it as listener of the definitions file.
    pub fn new(app: AppContext, factory: JobFactory, config: SupervisorConfig) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let store = ConfigStore::open(&config.config_dir);
            let listener: Weak<dyn ConfigListener> = me.clone();
            store.register_listener(&config.definitions_file, listener);
            let (stopping, _) = watch::channel(false);
            Self {
                app,
                factory,
                config,
                store,
                workers: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                stopping,
            }
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn definitions_path(&self) -> PathBuf {
        self.config.config_dir.join(&self.config.definitions_file)
    }

    /// Read the definitions file and load what it declares.
    pub async fn load_definitions_file(&self) -> Result<LoadReport> {
        let defs = load_definitions(&self.definitions_path()).await?;
        Ok(self.load_workers(&defs).await)
    }

    /// Register every definition not yet present and start the auto-start
    /// ones. Existing names are left untouched. One worker's failure never
    /// affects the others.
    pub async fn load_workers(&self, defs: &[WorkerDefinition]) -> LoadReport {
        let mut report = LoadReport::default();
        if *self.stopping.borrow() {
            warn!("supervisor is shutting down, ignoring worker definitions");
            return report;
        }

        for def in defs {
            if self.workers.read().await.contains_key(&def.name) {
                report.existing.push(def.name.clone());
                continue;
            }

            let job = match self.factory.create(&def.implementation) {
                Ok(job) => job,
                Err(e) => {
                    error!(worker = %def.name, error = %e, "cannot instantiate worker, skipping");
                    report.skipped.push(def.name.clone());
                    continue;
                }
            };

            let id = WorkerId(self.next_id.fetch_add(1, Ordering::SeqCst));
            let (worker, rejected) = Worker::create(
                id,
                &def.name,
                &def.implementation,
                job,
                self.app.clone(),
                def.properties.clone(),
            )
            .await;

            {
                let mut workers = self.workers.write().await;
                if workers.contains_key(&def.name) {
                    report.existing.push(def.name.clone());
                    continue;
                }
                workers.insert(def.name.clone(), Arc::clone(&worker));
            }

            // Bound even when fatal: a fixed config file is the way out.
            worker.watch_config(&self.store);
            if let Some(e) = rejected {
                error!(worker = %def.name, error = %e, "invalid worker properties, registered as fatal");
                report.fatal.push(def.name.clone());
                continue;
            }

            if !def.auto_start {
                info!(worker = %def.name, %id, "worker registered");
                report.registered.push(def.name.clone());
                continue;
            }
            match worker.start().await {
                Ok(_) => report.started.push(def.name.clone()),
                Err(e) => {
                    error!(worker = %def.name, error = %e, "worker failed to start");
                    report.failed.push(def.name.clone());
                }
            }
        }

        info!(
            started = report.started.len(),
            registered = report.registered.len(),
            fatal = report.fatal.len(),
            skipped = report.skipped.len(),
            "worker definitions loaded"
        );
        report
    }

    pub async fn worker(&self, name: &str) -> Option<Arc<Worker>> {
        self.workers.read().await.get(name).cloned()
    }

    pub async fn worker_by_id(&self, id: WorkerId) -> Option<Arc<Worker>> {
        self.workers
            .read()
            .await
            .values()
            .find(|w| w.id() == id)
            .cloned()
    }

    pub async fn worker_id(&self, name: &str) -> Option<WorkerId> {
        self.worker(name).await.map(|w| w.id())
    }

    async fn require(&self, name: &str) -> Result<Arc<Worker>> {
        self.worker(name)
            .await
            .ok_or_else(|| Error::NotFound(format!("worker '{name}'")))
    }

    /// Start a registered worker. `Ok(false)` if it was already running.
    pub async fn start_worker(&self, name: &str) -> Result<bool> {
        self.require(name).await?.start().await
    }

    /// Stop a registered worker. `Ok(false)` if it was already stopped.
    pub async fn stop_worker(&self, name: &str) -> Result<bool> {
        Ok(self.require(name).await?.stop())
    }

    /// Hand data to the worker with the given id.
    pub async fn dispatch(&self, id: WorkerId, data: &[u8]) -> Result<i64> {
        let worker = self
            .worker_by_id(id)
            .await
            .ok_or_else(|| Error::NotFound(format!("worker id {id}")))?;
        worker.process_data(data).await
    }

    /// Status of every worker, ordered by id.
    pub async fn snapshots(&self) -> Vec<StatusSnapshot> {
        let workers: Vec<Arc<Worker>> = self.workers.read().await.values().cloned().collect();
        let mut snapshots: Vec<StatusSnapshot> = workers.iter().map(|w| w.status()).collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    /// Human-readable status of the whole host.
    pub async fn status_report(&self) -> String {
        let snapshots = self.snapshots().await;
        let active = snapshots.iter().filter(|s| s.status.is_active()).count();
        let mut report = format!(
            "{} worker(s), {active} active{}\n",
            snapshots.len(),
            if *self.stopping.borrow() {
                ", shutting down"
            } else {
                ""
            }
        );
        for snapshot in &snapshots {
            report.push_str(&snapshot.to_string());
            report.push('\n');
        }
        report
    }

    /// Check the config directory once.
    pub async fn poll_config(&self) -> Vec<ChangedFile> {
        self.store.poll_changes().await
    }

    /// Poll the config directory on a fixed period until shutdown.
    pub async fn run(&self) -> Result<()> {
        let mut stopping = self.stopping.subscribe();
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(
            dir = %self.config.config_dir.display(),
            interval = ?self.config.poll_interval,
            "config poll loop started"
        );
        loop {
            tokio::select! {
                // The watch guard must not live across the poll below.
                _ = async { let _ = stopping.wait_for(|stopping| *stopping).await; } => break,
                _ = ticker.tick() => {
                    let changed = self.poll_config().await;
                    if !changed.is_empty() {
                        info!(files = changed.len(), "config changes processed");
                    }
                }
            }
        }
        info!("config poll loop stopped");
        Ok(())
    }

    pub fn is_stopping(&self) -> bool {
        *self.stopping.borrow()
    }

    /// Stop every worker, wait for their tasks within the grace period and
    /// halt the poll loop. Returns `false` if shutdown had already run.
    pub async fn shutdown(&self) -> bool {
        if self.stopping.send_replace(true) {
            return false;
        }
        let workers: Vec<Arc<Worker>> = self.workers.read().await.values().cloned().collect();
        info!(workers = workers.len(), "supervisor shutting down");

        for worker in &workers {
            worker.stop();
        }
        let grace = self.config.shutdown_grace;
        let joined = futures::future::join_all(workers.iter().map(|w| w.join(grace))).await;
        let overran = joined.iter().filter(|clean| !**clean).count();
        if overran > 0 {
            warn!(overran, "some workers were aborted after the grace period");
        }
        info!("supervisor stopped");
        true
    }
}

#[async_trait]
impl ConfigListener for Supervisor {
    /// The definitions file changed: load any new workers.
    async fn load_conf(&self, path: &Path) -> Result<()> {
        let defs = load_definitions(path).await?;
        self.load_workers(&defs).await;
        Ok(())
    }
}
