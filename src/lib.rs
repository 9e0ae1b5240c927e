//! # jobhost
//!
//! Always-on host for long-running queue workers.
//!
//! A [`engine::Supervisor`] owns a registry of named workers, each pairing a
//! lifecycle container ([`worker::Worker`]) with variant logic
//! ([`worker::Job`]). Workers consume from a message broker with explicit
//! acknowledgement ([`consumer`]), call unreliable endpoints through bounded
//! retry ([`retry`]), persist through a [`datastore::Datastore`] and alert
//! operators through a [`notify::Notifier`]. Config files are polled for
//! changes and the [`engine::ControlFacade`] exposes start/stop/status/process
//! commands.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod context;
pub mod datastore;
pub mod db;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod model;
pub mod notify;
pub mod retry;
pub mod telemetry;
pub mod worker;
