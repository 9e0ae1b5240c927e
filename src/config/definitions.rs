//! Worker definitions.
//!
//! The definitions file lists every worker the host should run:
//!
//! ```toml
//! [[worker]]
//! name = "fax-outbound"
//! implementation = "fax-transmission"
//! auto_start = true
//!
//! [worker.properties]
//! queue = "fax.outbound"
//! gateway_url = "http://fax-gw.internal/send"
//! ```
//!
//! Each entry is parsed on its own; a malformed entry is logged and skipped
//! without affecting the others.

use crate::config::{Properties, flatten_table};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct DefinitionsFile {
    #[serde(default)]
    worker: Vec<toml::Value>,
}

#[derive(Debug, Deserialize)]
struct RawDefinition {
    name: String,
    implementation: String,
    #[serde(default)]
    auto_start: bool,
    #[serde(default)]
    properties: toml::Table,
}

/// One worker as declared in the definitions file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDefinition {
    /// Unique key in the supervisor registry.
    pub name: String,
    /// Which worker variant to instantiate.
    pub implementation: String,
    pub auto_start: bool,
    pub properties: Properties,
}

impl WorkerDefinition {
    pub fn new(name: impl Into<String>, implementation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            implementation: implementation.into(),
            auto_start: false,
            properties: Properties::new(),
        }
    }

    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key, value);
        self
    }
}

/// Read and parse a definitions file.
pub async fn load_definitions(path: &Path) -> Result<Vec<WorkerDefinition>> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        Error::Config(format!("cannot read worker definitions {}: {e}", path.display()))
    })?;
    parse_definitions(&content)
}

/// Parse definitions from TOML text. Fails only if the document itself is
/// not valid TOML; bad entries and duplicate names are skipped.
pub fn parse_definitions(content: &str) -> Result<Vec<WorkerDefinition>> {
    let file: DefinitionsFile = toml::from_str(content)
        .map_err(|e| Error::Config(format!("bad worker definitions: {e}")))?;

    let mut seen = HashSet::new();
    let mut defs = Vec::with_capacity(file.worker.len());

    for (index, value) in file.worker.into_iter().enumerate() {
        let raw: RawDefinition = match value.try_into() {
            Ok(raw) => raw,
            Err(e) => {
                warn!(index, error = %e, "skipping malformed worker definition");
                continue;
            }
        };
        let name = raw.name.trim().to_string();
        if name.is_empty() || raw.implementation.trim().is_empty() {
            warn!(index, "skipping worker definition with empty name or implementation");
            continue;
        }
        if !seen.insert(name.clone()) {
            warn!(worker = %name, "duplicate worker name, keeping the first definition");
            continue;
        }
        defs.push(WorkerDefinition {
            name,
            implementation: raw.implementation.trim().to_string(),
            auto_start: raw.auto_start,
            properties: flatten_table(&raw.properties).into(),
        });
    }

    Ok(defs)
}
