// EvoX Updater Engine - Core module structure
pub mod cli;
pub mod config;
pub mod error;
pub mod locks;
pub mod updater;

pub use config::UpdaterConfig;
pub use error::{DriverError, UpdateError};
pub use updater::{RunRequest, RunSummary, UpdateDriver};
