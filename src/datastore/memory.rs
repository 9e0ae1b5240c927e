//! In-memory datastore for tests and local runs.

use super::{CatalogItem, Datastore, ReportRecord, TransmissionRecord};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct State {
    items: BTreeMap<(String, String), CatalogItem>,
    transmissions: BTreeMap<String, TransmissionRecord>,
    reports: Vec<ReportRecord>,
}

#[derive(Default)]
pub struct MemoryDatastore {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail, simulating an outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn items(&self, feed: &str) -> Vec<CatalogItem> {
        self.lock()
            .items
            .iter()
            .filter(|((f, _), _)| f == feed)
            .map(|(_, item)| item.clone())
            .collect()
    }

    pub fn transmission(&self, reference: &str) -> Option<TransmissionRecord> {
        self.lock().transmissions.get(reference).cloned()
    }

    pub fn transmissions(&self) -> Vec<TransmissionRecord> {
        self.lock().transmissions.values().cloned().collect()
    }

    pub fn reports(&self) -> Vec<ReportRecord> {
        self.lock().reports.clone()
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::Other("memory datastore unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn health_check(&self) -> Result<()> {
        self.check()
    }

    async fn store_catalog_items(&self, feed: &str, items: &[CatalogItem]) -> Result<u64> {
        self.check()?;
        let mut state = self.lock();
        for item in items {
            state
                .items
                .insert((feed.to_string(), item.sku.clone()), item.clone());
        }
        Ok(items.len() as u64)
    }

    async fn record_transmission(&self, record: &TransmissionRecord) -> Result<()> {
        self.check()?;
        self.lock()
            .transmissions
            .insert(record.reference.clone(), record.clone());
        Ok(())
    }

    async fn record_report(&self, report: &ReportRecord) -> Result<()> {
        self.check()?;
        self.lock().reports.push(report.clone());
        Ok(())
    }
}
