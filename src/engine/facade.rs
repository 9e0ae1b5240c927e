//! Management surface over the supervisor.
//!
//! Every command returns a plain value: `false` or `0` means "not found or
//! nothing to do". Errors and panics inside a command are logged and turned
//! into those defaults, never propagated to the caller.

use super::Supervisor;
use crate::error::{Error, Result};
use crate::model::WorkerId;
use crate::worker::Worker;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures::FutureExt;
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, warn};

/// A job addressed by worker id or by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRef {
    Id(WorkerId),
    Name(String),
}

impl std::str::FromStr for JobRef {
    type Err = Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        Ok(match s.parse::<u64>() {
            Ok(id) => JobRef::Id(WorkerId(id)),
            Err(_) => JobRef::Name(s.to_string()),
        })
    }
}

impl std::fmt::Display for JobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobRef::Id(id) => write!(f, "{id}"),
            JobRef::Name(name) => write!(f, "{name}"),
        }
    }
}

/// Decode injected data. `b64:` and `url:` prefixes select the encoding.
/// Unprefixed input is percent-decoded, so plain text passes through as is.
pub fn decode_payload(encoded: &str) -> Result<Vec<u8>> {
    let encoded = encoded.trim();
    if let Some(rest) = encoded.strip_prefix("b64:") {
        return STANDARD
            .decode(rest)
            .map_err(|e| Error::Decode(format!("invalid base64: {e}")));
    }
    if let Some(rest) = encoded.strip_prefix("url:") {
        return Ok(urlencoding::decode_binary(rest.as_bytes()).into_owned());
    }
    Ok(urlencoding::decode_binary(encoded.as_bytes()).into_owned())
}

#[derive(Clone)]
pub struct ControlFacade {
    supervisor: Arc<Supervisor>,
}

impl ControlFacade {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }

    /// Worker id for `name`, or 0 if there is none.
    pub async fn get_app_id(&self, name: &str) -> u64 {
        self.supervisor
            .worker_id(name)
            .await
            .map_or(0, |id| id.0)
    }

    /// Start a job. A non-zero `app_id` must match the job's worker.
    pub async fn start_job(&self, app_id: u64, job: &JobRef) -> bool {
        let Some(worker) = self.resolve(app_id, job).await else {
            return false;
        };
        match AssertUnwindSafe(worker.start()).catch_unwind().await {
            Ok(Ok(started)) => started,
            Ok(Err(e)) => {
                warn!(job = %job, error = %e, "start_job failed");
                false
            }
            Err(_) => {
                error!(job = %job, "start_job panicked");
                false
            }
        }
    }

    /// Stop a job. `false` if it is unknown or already stopped.
    pub async fn stop_job(&self, app_id: u64, job: &JobRef) -> bool {
        match self.resolve(app_id, job).await {
            Some(worker) => worker.stop(),
            None => false,
        }
    }

    /// Decode `encoded` and hand it to worker `app_id`. Returns the units
    /// processed, or 0 on any failure.
    pub async fn process_data(&self, app_id: u64, encoded: &str) -> i64 {
        if app_id == 0 {
            return 0;
        }
        let data = match decode_payload(encoded) {
            Ok(data) => data,
            Err(e) => {
                warn!(app_id, error = %e, "process_data: undecodable payload");
                return 0;
            }
        };
        let dispatch = self.supervisor.dispatch(WorkerId(app_id), &data);
        match AssertUnwindSafe(dispatch).catch_unwind().await {
            Ok(Ok(processed)) => processed,
            Ok(Err(e)) => {
                warn!(app_id, error = %e, "process_data failed");
                0
            }
            Err(_) => {
                error!(app_id, "process_data panicked");
                0
            }
        }
    }

    pub async fn view_status_info(&self) -> String {
        self.supervisor.status_report().await
    }

    async fn resolve(&self, app_id: u64, job: &JobRef) -> Option<Arc<Worker>> {
        let worker = match job {
            JobRef::Id(id) => self.supervisor.worker_by_id(*id).await,
            JobRef::Name(name) => self.supervisor.worker(name).await,
        }?;
        if app_id != 0 && worker.id().0 != app_id {
            warn!(app_id, job = %job, worker = %worker.id(), "job does not belong to app");
            return None;
        }
        Some(worker)
    }
}
