//! Datastore seam.
//!
//! Workers persist their results through this trait. The Postgres
//! implementation lives in [`crate::db`]; every operation checks a
//! connection out of the pool and releases it before returning, on every
//! exit path. Writes are idempotent so redelivered messages are harmless.

pub mod memory;

use crate::error::Result;
use crate::model::TransmissionStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use memory::MemoryDatastore;

/// One item split out of a catalog feed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    /// Stable item key within a feed. Upserts are keyed on (feed, sku).
    pub sku: String,
    /// Remaining item fields. Opaque to the host.
    pub data: serde_json::Value,
}

/// Outcome of one outbound transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmissionRecord {
    /// Caller-supplied reference. Re-recording the same reference overwrites.
    pub reference: String,
    pub worker: String,
    pub destination: String,
    pub status: TransmissionStatus,
    pub attempts: u32,
    /// Last response code from the gateway; 0 when no response arrived.
    pub response_code: u16,
    pub recorded_at: DateTime<Utc>,
}

/// A dispatched batch report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub id: Uuid,
    pub worker: String,
    pub items: u64,
    pub recipients: Vec<String>,
    pub dispatched_at: DateTime<Utc>,
}

#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    async fn health_check(&self) -> Result<()>;

    /// Upsert items for a feed. Returns the number of items written.
    async fn store_catalog_items(&self, feed: &str, items: &[CatalogItem]) -> Result<u64>;

    async fn record_transmission(&self, record: &TransmissionRecord) -> Result<()>;

    async fn record_report(&self, report: &ReportRecord) -> Result<()>;
}
