//! Bundled worker variants.
//!
//! | implementation     | delivery | ack mode (default) |
//! |--------------------|----------|--------------------|
//! | `catalog-ingest`   | push     | before             |
//! | `fax-transmission` | push     | after              |
//! | `report-dispatch`  | pull     | per message        |

pub mod catalog;
pub mod fax;
pub mod report;

use crate::config::Properties;
use crate::consumer::{AckMode, QueueConsumer};
use crate::error::Result;

pub use catalog::{CatalogIngestJob, CatalogSplitter, JsonLinesSplitter};
pub use fax::{FaxRequest, FaxTransmissionJob};
pub use report::ReportDispatchJob;

/// Push-consumer settings shared by the queue-fed jobs: `queue` (required),
/// `ack_mode` and `prefetch`.
fn queue_consumer(props: &Properties, default_mode: AckMode) -> Result<QueueConsumer> {
    let queue = props.require("queue")?;
    let mode = props.parse_or("ack_mode", default_mode)?;
    let prefetch = props.parse_or("prefetch", 1u16)?;
    Ok(QueueConsumer::new(queue, mode).prefetch(prefetch))
}
