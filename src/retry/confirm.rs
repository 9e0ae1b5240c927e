//! Delivery confirmations.
//!
//! Anything that knows the final status of a transmission implements
//! [`StatusProvider`]; the confirmation text is picked by producer kind.

use crate::model::{Producer, TransmissionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Capability to report how a transmission ended.
pub trait StatusProvider {
    fn transmission_status(&self) -> TransmissionStatus;
}

impl StatusProvider for TransmissionStatus {
    fn transmission_status(&self) -> TransmissionStatus {
        *self
    }
}

/// Confirmation published after a transmission settles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub producer: Producer,
    pub reference: String,
    pub status: TransmissionStatus,
    pub message: String,
    pub confirmed_at: DateTime<Utc>,
}

impl Confirmation {
    pub fn build(producer: Producer, reference: &str, provider: &dyn StatusProvider) -> Self {
        let status = provider.transmission_status();
        Self {
            producer,
            reference: reference.to_string(),
            status,
            message: message_for(producer, reference, status),
            confirmed_at: Utc::now(),
        }
    }
}

fn message_for(producer: Producer, reference: &str, status: TransmissionStatus) -> String {
    match (producer, status) {
        (Producer::FaxTransmission, TransmissionStatus::Delivered) => {
            format!("Fax {reference} was transmitted successfully.")
        }
        (Producer::FaxTransmission, TransmissionStatus::Rejected) => {
            format!("Fax {reference} was rejected by the gateway and will not be resent.")
        }
        (Producer::FaxTransmission, TransmissionStatus::Deferred) => {
            format!("Fax {reference} could not be transmitted and is queued for resend.")
        }
        (Producer::ReportDispatch, _) => format!("Report {reference} {status}."),
        (Producer::CatalogFeed, _) => format!("Catalog batch {reference} {status}."),
        (Producer::Custom, _) => format!("{reference}: {status}"),
    }
}
