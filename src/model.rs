//! Core data model.
//!
//! A worker is a named, independently supervised unit of processing. Its
//! status follows a small state machine; messages it consumes carry a
//! broker-assigned delivery tag used for acknowledgement.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Worker identity
// ---------------------------------------------------------------------------

/// Newtype for worker ids. Assigned monotonically by the supervisor and
/// never reused within one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Registered, never started (or properties repaired after `Fatal`).
    Init,
    /// Inside a processing cycle.
    Running,
    /// Between cycles, sleeping.
    Idle,
    /// Stopped on request. Terminal for the current run cycle.
    Stopped,
    /// The processing loop died unexpectedly (panic). Can be restarted.
    Aborted,
    /// The worker cannot run with its current properties.
    Fatal,
}

impl WorkerStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: WorkerStatus) -> bool {
        use WorkerStatus::*;
        matches!(
            (self, to),
            (Init, Running)
                | (Init, Stopped)
                | (Init, Fatal)
                | (Running, Idle)
                | (Running, Stopped)
                | (Running, Aborted)
                | (Idle, Running)
                | (Idle, Stopped)
                | (Idle, Fatal)
                | (Stopped, Stopped)    // stop is idempotent
                | (Stopped, Running)    // new run cycle
                | (Stopped, Fatal)
                | (Aborted, Running)
                | (Aborted, Stopped)
                | (Aborted, Fatal)
                | (Fatal, Init)         // properties repaired
                | (Fatal, Stopped)
        )
    }

    /// Whether the processing loop is (or should be) alive.
    pub fn is_active(self) -> bool {
        matches!(self, WorkerStatus::Running | WorkerStatus::Idle)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Init => "init",
            WorkerStatus::Running => "running",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Aborted => "aborted",
            WorkerStatus::Fatal => "fatal",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(WorkerStatus::Init),
            "running" => Ok(WorkerStatus::Running),
            "idle" => Ok(WorkerStatus::Idle),
            "stopped" => Ok(WorkerStatus::Stopped),
            "aborted" => Ok(WorkerStatus::Aborted),
            "fatal" => Ok(WorkerStatus::Fatal),
            other => Err(format!("unknown worker status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

/// Read-only projection of a worker, produced on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub id: WorkerId,
    pub name: String,
    pub implementation: String,
    pub status: WorkerStatus,
    /// Time since the current run cycle started. Zero when not started.
    pub running_ms: u64,
    /// Free-form description of what the worker is doing right now.
    pub current_action: String,
    /// Completed processing cycles since creation.
    pub cycles: u64,
    /// Failed processing cycles since creation.
    pub errors: u64,
}

impl std::fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} ({}) status={} up={}s cycles={} errors={} action={}",
            self.id,
            self.name,
            self.implementation,
            self.status,
            self.running_ms / 1000,
            self.cycles,
            self.errors,
            self.current_action
        )
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Broker-assigned handle identifying one in-flight message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryTag(pub u64);

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message handed over by the broker. Acknowledging its tag releases it
/// from the broker's redelivery set.
#[derive(Debug, Clone)]
pub struct JobMessage {
    pub tag: DeliveryTag,
    pub payload: Vec<u8>,
    /// Set when the broker has delivered this message before.
    pub redelivered: bool,
}

impl JobMessage {
    /// Payload as UTF-8, lossy.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

// ---------------------------------------------------------------------------
// Producers
// ---------------------------------------------------------------------------

/// The kinds of worker that produce notifications and confirmations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Producer {
    CatalogFeed,
    FaxTransmission,
    ReportDispatch,
    /// A worker variant registered outside the built-in set.
    Custom,
}

impl std::fmt::Display for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Producer::CatalogFeed => "catalog feed",
            Producer::FaxTransmission => "fax transmission",
            Producer::ReportDispatch => "report dispatch",
            Producer::Custom => "worker",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Transmission status
// ---------------------------------------------------------------------------

/// Final state of one outbound transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmissionStatus {
    /// The endpoint accepted the payload.
    Delivered,
    /// The endpoint rejected the payload; routed to the error disposition.
    Rejected,
    /// Retries exhausted without a rejection; routed to the resend disposition.
    Deferred,
}

impl std::fmt::Display for TransmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransmissionStatus::Delivered => "delivered",
            TransmissionStatus::Rejected => "rejected",
            TransmissionStatus::Deferred => "deferred",
        };
        write!(f, "{s}")
    }
}
