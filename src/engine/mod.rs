//! Supervision engine: worker registry, config polling and the control
//! surface.

pub mod console;
pub mod facade;
pub mod supervisor;

pub use console::{ControlCommand, run_console};
pub use facade::{ControlFacade, JobRef, decode_payload};
pub use supervisor::{LoadReport, Supervisor, SupervisorConfig};
