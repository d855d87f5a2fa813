//! EvoX Updater - in-place system partition updates
//!
//! Verifies the running system partition against an update file, backs it up,
//! and replaces files on the live partition so that running processes never
//! observe a half-written file.

pub mod engine;

pub use engine::{DriverError, RunRequest, RunSummary, UpdateDriver, UpdateError, UpdaterConfig};
