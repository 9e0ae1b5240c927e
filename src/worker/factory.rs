//! Job registry: maps the `implementation` id in a worker definition to a
//! constructor.

use super::Job;
use crate::error::{Error, Result};
use crate::jobs::{CatalogIngestJob, FaxTransmissionJob, ReportDispatchJob};
use std::collections::HashMap;
use std::sync::Arc;

type Constructor = Arc<dyn Fn() -> Arc<dyn Job> + Send + Sync>;

/// Registry of job constructors, indexed by implementation id.
#[derive(Clone, Default)]
pub struct JobFactory {
    constructors: HashMap<String, Constructor>,
}

impl JobFactory {
    /// Create an empty factory with no implementations.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A factory with the bundled jobs registered.
    pub fn with_builtin() -> Self {
        let mut factory = Self::empty();
        factory.register(CatalogIngestJob::IMPLEMENTATION, || {
            Arc::new(CatalogIngestJob::new())
        });
        factory.register(FaxTransmissionJob::IMPLEMENTATION, || {
            Arc::new(FaxTransmissionJob::new())
        });
        factory.register(ReportDispatchJob::IMPLEMENTATION, || {
            Arc::new(ReportDispatchJob::new())
        });
        factory
    }

    /// Register (or replace) a constructor.
    pub fn register<F>(&mut self, implementation: &str, constructor: F)
    where
        F: Fn() -> Arc<dyn Job> + Send + Sync + 'static,
    {
        self.constructors
            .insert(implementation.to_string(), Arc::new(constructor));
    }

    pub fn contains(&self, implementation: &str) -> bool {
        self.constructors.contains_key(implementation)
    }

    /// Build a fresh job instance.
    pub fn create(&self, implementation: &str) -> Result<Arc<dyn Job>> {
        self.constructors
            .get(implementation)
            .map(|ctor| ctor())
            .ok_or_else(|| Error::Config(format!("unknown implementation '{implementation}'")))
    }

    /// Registered ids, sorted.
    pub fn implementations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.constructors.keys().cloned().collect();
        ids.sort();
        ids
    }
}
