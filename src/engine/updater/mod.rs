//! EvoX System Updater
//!
//! Applies a file-level update to a mounted system partition in place, without
//! ever exposing a half-written file to running processes.
//!
//! Components:
//! - `digest` - SHA-1 digest engine
//! - `format` - Update file reader and writer
//! - `backup` - Partition backup and pre-image verification
//! - `storage` - Free-space planning
//! - `mounts` - Bind-mount topology and teardown
//! - `replace` - Per-file atomic replacement
//! - `state` - Run phases and the persisted journal
//! - `driver` - Sequences a whole run

pub mod backup;
pub mod digest;
pub mod driver;
pub mod format;
pub mod loopdev;
pub mod mounts;
pub mod patch;
pub mod replace;
pub mod state;
pub mod storage;

pub use backup::{BackupImage, Verification};
pub use driver::{scan_update, RunRequest, RunSummary, UpdateDriver, UpdateTotals};
pub use format::{UpdateHeader, UpdateReader, UpdateRecord, UpdateWriter};
pub use mounts::{MountOps, MountPlan, SyscallMounts};
pub use patch::{FullReplacement, PatchApplier};
pub use state::{Phase, RunJournal, RunStatus};
pub use storage::{SpaceProbe, StatvfsProbe, StorageDecision};
