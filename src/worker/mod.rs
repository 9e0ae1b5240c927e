//! Worker applications.
//!
//! A worker pairs a [`Job`] (the variant-specific processing logic) with a
//! lifecycle container ([`Worker`]) that owns its status, its execution task
//! and its counters. The supervisor only ever talks to `Worker`.

pub mod factory;
pub mod lifecycle;

use crate::config::Properties;
use crate::context::AppContext;
use crate::error::{Error, Result};
use crate::model::{Producer, WorkerId, WorkerStatus};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;

pub use factory::JobFactory;
pub use lifecycle::Worker;

/// Variant-specific processing logic.
///
/// Implementations keep their configuration behind interior mutability so a
/// property reload can swap it while a cycle is in flight.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// What kind of producer this job is, for alert and confirmation text.
    fn producer(&self) -> Producer {
        Producer::Custom
    }

    /// Apply a property bag. On error the previous configuration stays.
    async fn configure(&self, properties: &Properties) -> Result<()>;

    /// One processing cycle. Long-running consumers return when
    /// [`JobContext::stopped`] resolves.
    async fn do_processing(&self, cx: &JobContext) -> Result<()>;

    /// Process data injected through the control surface. Returns the number
    /// of units processed.
    async fn process_data(&self, _cx: &JobContext, _data: &[u8]) -> Result<i64> {
        Err(Error::Other(format!(
            "{} worker does not accept injected data",
            self.producer()
        )))
    }
}

/// What a job sees of its worker while it runs.
#[derive(Clone)]
pub struct JobContext {
    id: WorkerId,
    name: Arc<str>,
    app: AppContext,
    status: watch::Receiver<WorkerStatus>,
    action: Arc<Mutex<String>>,
}

impl JobContext {
    pub(crate) fn new(
        id: WorkerId,
        name: Arc<str>,
        app: AppContext,
        status: watch::Receiver<WorkerStatus>,
        action: Arc<Mutex<String>>,
    ) -> Self {
        Self {
            id,
            name,
            app,
            status,
            action,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.id
    }

    pub fn worker_name(&self) -> &str {
        &self.name
    }

    pub fn app(&self) -> &AppContext {
        &self.app
    }

    /// True until the worker is asked to stop.
    pub fn is_running(&self) -> bool {
        self.status.borrow().is_active()
    }

    /// Resolves once the worker leaves the running/idle states.
    pub async fn stopped(&self) {
        let mut status = self.status.clone();
        let _ = status.wait_for(|s| !s.is_active()).await;
    }

    /// Describe what the job is doing right now, for status reports.
    pub fn set_action(&self, action: impl Into<String>) {
        *self.action.lock().unwrap_or_else(PoisonError::into_inner) = action.into();
    }
}

// ---------------------------------------------------------------------------
// Worker settings
// ---------------------------------------------------------------------------

/// How `start()` runs the processing loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// A dedicated task loops until stopped.
    #[default]
    Async,
    /// The caller runs exactly one cycle; no task is spawned.
    Inline,
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "async" => Ok(ExecutionMode::Async),
            "inline" => Ok(ExecutionMode::Inline),
            other => Err(format!("expected 'async' or 'inline', got '{other}'")),
        }
    }
}

/// Lifecycle settings every worker reads from its property bag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Pause between successful cycles.
    pub sleep_interval: Duration,
    /// The pause after a failed cycle is `sleep_interval * error_backoff_factor`.
    pub error_backoff_factor: u32,
    /// Upper bound on concurrent `process_data` calls.
    pub max_concurrency: usize,
    pub mode: ExecutionMode,
    /// File under the config directory whose changes reload this worker.
    pub config_file: Option<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            sleep_interval: Duration::from_secs(1),
            error_backoff_factor: 3,
            max_concurrency: 1,
            mode: ExecutionMode::Async,
            config_file: None,
        }
    }
}

impl WorkerSettings {
    pub fn from_properties(props: &Properties) -> Result<Self> {
        let defaults = Self::default();
        let max_concurrency = props.parse_or("max_concurrency", defaults.max_concurrency)?;
        if max_concurrency == 0 {
            return Err(Error::Config("max_concurrency must be at least 1".to_string()));
        }
        Ok(Self {
            sleep_interval: props.millis_or("sleep_interval_ms", defaults.sleep_interval)?,
            error_backoff_factor: props
                .parse_or("error_backoff_factor", defaults.error_backoff_factor)?
                .max(1),
            max_concurrency,
            mode: props.parse_or("execution_mode", defaults.mode)?,
            config_file: props.get("config_file").map(str::to_string),
        })
    }

    /// Saturates at `Duration::MAX`.
    pub fn error_backoff(&self) -> Duration {
        self.sleep_interval
            .checked_mul(self.error_backoff_factor)
            .unwrap_or(Duration::MAX)
    }
}

// ---------------------------------------------------------------------------
// Settings cell
// ---------------------------------------------------------------------------

/// Swappable configuration snapshot for jobs. Readers get an `Arc` that
/// stays valid for the whole cycle even if a reload swaps the cell.
#[derive(Debug, Default)]
pub struct SettingsCell<T> {
    inner: RwLock<Option<Arc<T>>>,
}

impl<T> SettingsCell<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    /// Current settings, or a config error if the job was never configured.
    pub fn load(&self) -> Result<Arc<T>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| Error::Config("job has not been configured".to_string()))
    }

    pub fn store(&self, value: T) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(value));
    }
}
