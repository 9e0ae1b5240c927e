//! Typed configuration from environment variables, plus property bags.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

pub mod definitions;
pub mod secrets;
pub mod store;

use crate::error::{Error, Result};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub use definitions::{WorkerDefinition, load_definitions, parse_definitions};
pub use store::{ChangedFile, ConfigListener, ConfigStore};

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// Broker connection string. The pgmq broker lives in Postgres, so this
    /// defaults to the database URL.
    pub broker_url: SecretString,
    pub config_dir: PathBuf,
    /// Worker definitions file name, relative to `config_dir`.
    pub definitions_file: String,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    pub alert_recipients: Vec<String>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        let database_url = required_var("DATABASE_URL")?;
        let broker_url = std::env::var("BROKER_URL").unwrap_or_else(|_| database_url.clone());
        Ok(Self {
            database_url: SecretString::from(database_url),
            broker_url: SecretString::from(broker_url),
            config_dir: PathBuf::from(
                std::env::var("JOBHOST_CONFIG_DIR").unwrap_or_else(|_| "conf".to_string()),
            ),
            definitions_file: std::env::var("JOBHOST_DEFINITIONS")
                .unwrap_or_else(|_| "workers.toml".to_string()),
            poll_interval: Duration::from_secs(parsed_var("JOBHOST_POLL_INTERVAL_SECS", 10)?),
            shutdown_grace: Duration::from_secs(parsed_var("JOBHOST_SHUTDOWN_GRACE_SECS", 15)?),
            alert_recipients: split_list(
                &std::env::var("JOBHOST_ALERT_RECIPIENTS").unwrap_or_default(),
            ),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Absolute-ish path of the worker definitions file.
    pub fn definitions_path(&self) -> PathBuf {
        self.config_dir.join(&self.definitions_file)
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{name} must be an integer, got {raw:?}"))),
        Err(_) => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Property bag
// ---------------------------------------------------------------------------

/// A worker's property bag. Keys are unique; iteration order is sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Value of a property that must be present and non-empty.
    pub fn require(&self, key: &str) -> Result<&str> {
        match self.get(key).map(str::trim) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(Error::Config(format!("missing required property '{key}'"))),
        }
    }

    /// Parse a property, falling back to `default` when it is absent.
    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key).map(str::trim) {
            None | Some("") => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|e| Error::Config(format!("property '{key}' = {raw:?}: {e}"))),
        }
    }

    /// Milliseconds property as a `Duration`.
    pub fn millis_or(&self, key: &str, default: Duration) -> Result<Duration> {
        let ms = self.parse_or(key, default.as_millis() as u64)?;
        Ok(Duration::from_millis(ms))
    }

    /// Comma-separated list property.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.get(key).map(split_list).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, String>> for Properties {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Flatten a TOML table into `key -> string` pairs. Nested tables become
/// dotted keys; arrays are joined with `,`.
pub fn flatten_table(table: &toml::Table) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    flatten_into(&mut out, "", table);
    out
}

fn flatten_into(out: &mut BTreeMap<String, String>, prefix: &str, table: &toml::Table) {
    for (key, value) in table {
        let full = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            toml::Value::Table(inner) => flatten_into(out, &full, inner),
            other => {
                out.insert(full, scalar_to_string(other));
            }
        }
    }
}

fn scalar_to_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Array(items) => items
            .iter()
            .map(scalar_to_string)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}
