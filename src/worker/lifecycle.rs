//! Worker lifecycle container.
//!
//! Status machine:
//!
//! ```text
//! Init --start--> Running --ok--> Idle --sleep--> Running ...
//!                    |  \--error--> Idle (3x sleep, operator notified)
//!                    \--panic--> Aborted
//! any --stop--> Stopped            bad properties --> Fatal
//! ```
//!
//! `stop()` is cooperative: it flips the status, and the loop notices at
//! its next check (or immediately if it is sleeping or waiting on
//! [`JobContext::stopped`]).

use super::{ExecutionMode, Job, JobContext, WorkerSettings};
use crate::config::store::ConfigListener;
use crate::config::{ConfigStore, Properties};
use crate::context::AppContext;
use crate::error::{Error, Result};
use crate::model::{StatusSnapshot, WorkerId, WorkerStatus};
use crate::telemetry::{cycle, metrics};
use async_trait::async_trait;
use futures::FutureExt;
use opentelemetry::KeyValue;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

/// How one processing cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    Completed,
    Failed,
    Panicked,
}

/// A supervised worker: one job plus its status, task and counters.
pub struct Worker {
    id: WorkerId,
    name: Arc<str>,
    implementation: String,
    job: Arc<dyn Job>,
    app: AppContext,
    /// Properties from the worker definition; file reloads layer on top.
    base_properties: Properties,
    properties: RwLock<Properties>,
    settings: RwLock<WorkerSettings>,
    permits: RwLock<Arc<Semaphore>>,
    status: watch::Sender<WorkerStatus>,
    action: Arc<Mutex<String>>,
    started_at: Mutex<Option<Instant>>,
    cycles: AtomicU64,
    errors: AtomicU64,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Create a worker in `Init` and apply its properties. If the job rejects
    /// them the worker is returned in `Fatal` together with the error.
    pub async fn create(
        id: WorkerId,
        name: &str,
        implementation: &str,
        job: Arc<dyn Job>,
        app: AppContext,
        properties: Properties,
    ) -> (Arc<Self>, Option<Error>) {
        let (status, _) = watch::channel(WorkerStatus::Init);
        let worker = Arc::new(Self {
            id,
            name: Arc::from(name),
            implementation: implementation.to_string(),
            job,
            app,
            base_properties: properties.clone(),
            properties: RwLock::new(Properties::new()),
            settings: RwLock::new(WorkerSettings::default()),
            permits: RwLock::new(Arc::new(Semaphore::new(1))),
            status,
            action: Arc::new(Mutex::new("created".to_string())),
            started_at: Mutex::new(None),
            cycles: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            handle: tokio::sync::Mutex::new(None),
        });
        let err = worker.set_properties(properties).await.err();
        (worker, err)
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn implementation(&self) -> &str {
        &self.implementation
    }

    pub fn current_status(&self) -> WorkerStatus {
        *self.status.borrow()
    }

    pub fn settings(&self) -> WorkerSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn properties(&self) -> Properties {
        self.properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Completed cycles since creation.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Failed cycles since creation.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }

    /// Subscribe to status changes.
    pub fn watch_status(&self) -> watch::Receiver<WorkerStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> StatusSnapshot {
        let running_ms = self
            .started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        StatusSnapshot {
            id: self.id,
            name: self.name.to_string(),
            implementation: self.implementation.clone(),
            status: self.current_status(),
            running_ms,
            current_action: self
                .action
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            cycles: self.cycles(),
            errors: self.errors(),
        }
    }

    /// Validate and apply a property bag. Lifecycle settings are parsed
    /// first, then the job configures itself. On failure nothing changes,
    /// except that a never-started worker becomes `Fatal`.
    pub async fn set_properties(&self, properties: Properties) -> Result<()> {
        let applied = match WorkerSettings::from_properties(&properties) {
            Ok(settings) => self.job.configure(&properties).await.map(|()| settings),
            Err(e) => Err(e),
        };

        match applied {
            Ok(settings) => {
                let resize = self.settings().max_concurrency != settings.max_concurrency;
                if resize {
                    *self.permits.write().unwrap_or_else(PoisonError::into_inner) =
                        Arc::new(Semaphore::new(settings.max_concurrency));
                }
                *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
                *self.properties.write().unwrap_or_else(PoisonError::into_inner) = properties;
                if self.current_status() == WorkerStatus::Fatal {
                    self.transition(WorkerStatus::Init);
                }
                debug!(worker = %self.name, "properties applied");
                Ok(())
            }
            Err(e) => {
                warn!(worker = %self.name, error = %e, "rejected worker properties");
                if self.current_status() == WorkerStatus::Init {
                    self.transition(WorkerStatus::Fatal);
                }
                Err(e)
            }
        }
    }

    /// Bind this worker to the `config_file` named by its definition, if
    /// any. Read from the raw definition so a rejected bag still binds.
    pub fn watch_config(self: &Arc<Self>, store: &ConfigStore) -> bool {
        let Some(file) = self.base_properties.get("config_file") else {
            return false;
        };
        let listener: Arc<dyn ConfigListener> = self.clone();
        store.register_listener(file, Arc::downgrade(&listener))
    }

    /// Start the worker. Returns `Ok(false)` if its loop is already alive.
    ///
    /// In inline mode the call runs one cycle before returning.
    pub async fn start(self: &Arc<Self>) -> Result<bool> {
        let mut handle = self.handle.lock().await;
        if let Some(previous) = handle.as_mut().filter(|h| !h.is_finished()) {
            if self.current_status().is_active() {
                debug!(worker = %self.name, "start ignored, already running");
                return Ok(false);
            }
            debug!(worker = %self.name, "waiting for the previous run to wind down");
            let _ = previous.await;
        }

        let from = self.current_status();
        if !self.transition(WorkerStatus::Running) {
            return Err(Error::InvalidTransition {
                from: from.to_string(),
                to: WorkerStatus::Running.to_string(),
            });
        }
        *self
            .started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());

        match self.settings().mode {
            ExecutionMode::Inline => {
                drop(handle);
                let cx = self.context();
                match self.run_cycle(&cx).await {
                    CycleOutcome::Panicked => {
                        self.transition(WorkerStatus::Aborted);
                    }
                    CycleOutcome::Completed | CycleOutcome::Failed => {
                        self.transition(WorkerStatus::Idle);
                    }
                }
            }
            ExecutionMode::Async => {
                let this = Arc::clone(self);
                let span = tracing::info_span!("worker", worker = %self.name, id = %self.id);
                *handle = Some(tokio::spawn(this.run_loop().instrument(span)));
                info!(worker = %self.name, "worker started");
            }
        }
        Ok(true)
    }

    /// Ask the worker to stop. Idempotent; returns whether the status changed.
    pub fn stop(&self) -> bool {
        let was = self.current_status();
        self.transition(WorkerStatus::Stopped);
        if was != WorkerStatus::Stopped {
            info!(worker = %self.name, from = %was, "worker stopped");
            true
        } else {
            false
        }
    }

    /// Wait up to `grace` for the worker task to finish. A task that
    /// overruns is aborted. Returns whether it finished on its own.
    pub async fn join(&self, grace: Duration) -> bool {
        let Some(mut handle) = self.handle.lock().await.take() else {
            return true;
        };
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!(worker = %self.name, ?grace, "worker did not stop in time, aborting");
                handle.abort();
                false
            }
        }
    }

    /// Hand injected data to the job, bounded by `max_concurrency`.
    pub async fn process_data(&self, data: &[u8]) -> Result<i64> {
        let permits = self
            .permits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let _permit = permits
            .acquire_owned()
            .await
            .map_err(|e| Error::Other(format!("worker {} permits closed: {e}", self.name)))?;
        let cx = self.context();
        self.job.process_data(&cx, data).await
    }

    fn context(&self) -> JobContext {
        JobContext::new(
            self.id,
            Arc::clone(&self.name),
            self.app.clone(),
            self.status.subscribe(),
            Arc::clone(&self.action),
        )
    }

    /// Apply a status change if the state machine allows it.
    fn transition(&self, to: WorkerStatus) -> bool {
        let mut from = to;
        let mut allowed = false;
        self.status.send_if_modified(|current| {
            from = *current;
            if !current.can_transition_to(to) {
                return false;
            }
            allowed = true;
            *current = to;
            from != to
        });
        if allowed && from != to {
            cycle::record_status_transition(
                &tracing::Span::current(),
                &from.to_string(),
                &to.to_string(),
            );
            metrics::worker_status_transitions().add(
                1,
                &[
                    KeyValue::new("from", from.to_string()),
                    KeyValue::new("to", to.to_string()),
                ],
            );
        }
        allowed
    }

    async fn run_loop(self: Arc<Self>) {
        let cx = self.context();
        loop {
            let outcome = self.run_cycle(&cx).await;
            if outcome == CycleOutcome::Panicked {
                self.transition(WorkerStatus::Aborted);
                break;
            }
            if !self.transition(WorkerStatus::Idle) {
                break;
            }
            let settings = self.settings();
            let pause = match outcome {
                CycleOutcome::Failed => settings.error_backoff(),
                _ => settings.sleep_interval,
            };
            if self.pause(pause).await || !self.transition(WorkerStatus::Running) {
                break;
            }
        }
        debug!(worker = %self.name, status = %self.current_status(), "worker loop exited");
    }

    /// Sleep for `delay`, waking early on stop. Returns true if stopped.
    async fn pause(&self, delay: Duration) -> bool {
        let mut status = self.status.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = status.wait_for(|s| !s.is_active()) => true,
        }
    }

    async fn run_cycle(&self, cx: &JobContext) -> CycleOutcome {
        let n = self.cycles() + self.errors() + 1;
        let span = cycle::start_cycle_span(&self.name, n);
        let started = Instant::now();
        cx.set_action("processing");

        let result = AssertUnwindSafe(self.job.do_processing(cx))
            .catch_unwind()
            .instrument(span.clone())
            .await;

        let worker_label = [KeyValue::new("worker", self.name.to_string())];
        metrics::cycle_duration_ms()
            .record(started.elapsed().as_secs_f64() * 1000.0, &worker_label);

        let producer = self.job.producer();
        match result {
            Ok(Ok(())) => {
                self.cycles.fetch_add(1, Ordering::SeqCst);
                metrics::worker_cycles().add(1, &worker_label);
                cycle::record_outcome(&span, "completed");
                cx.set_action("idle");
                CycleOutcome::Completed
            }
            Ok(Err(e)) => {
                self.errors.fetch_add(1, Ordering::SeqCst);
                metrics::worker_errors().add(
                    1,
                    &[
                        KeyValue::new("worker", self.name.to_string()),
                        KeyValue::new("kind", "error"),
                    ],
                );
                cycle::record_outcome(&span, "failed");
                error!(worker = %self.name, error = %e, "processing cycle failed");
                cx.set_action(format!("backing off after error: {e}"));
                self.app
                    .alert(
                        &format!("[{producer}] {} failed", self.name),
                        &format!(
                            "Worker {} ({}) failed a processing cycle and will retry \
                             after backoff.\n\nError: {e}",
                            self.name, self.implementation
                        ),
                    )
                    .await;
                CycleOutcome::Failed
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                self.errors.fetch_add(1, Ordering::SeqCst);
                metrics::worker_errors().add(
                    1,
                    &[
                        KeyValue::new("worker", self.name.to_string()),
                        KeyValue::new("kind", "panic"),
                    ],
                );
                cycle::record_outcome(&span, "panicked");
                error!(worker = %self.name, panic = %message, "processing cycle panicked");
                cx.set_action(format!("aborted: {message}"));
                self.app
                    .alert(
                        &format!("[{producer}] {} aborted", self.name),
                        &format!(
                            "Worker {} ({}) aborted and needs a restart.\n\nPanic: {message}",
                            self.name, self.implementation
                        ),
                    )
                    .await;
                CycleOutcome::Panicked
            }
        }
    }
}

#[async_trait]
impl ConfigListener for Worker {
    /// Re-read the worker's own config file and re-apply its properties on
    /// top of the definition's.
    async fn load_conf(&self, path: &Path) -> Result<()> {
        let overrides = ConfigStore::load(path).await?;
        let mut merged = self.base_properties.clone();
        for (key, value) in overrides {
            merged.insert(key, value);
        }
        self.set_properties(merged).await?;
        info!(worker = %self.name, file = %path.display(), "worker properties reloaded");
        Ok(())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
