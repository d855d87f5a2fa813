//! EvoX Updater CLI Module
//! Command-line interface for applying, inspecting and building updates

pub mod formatter;

use crate::engine::config::{ConfigError, UpdaterConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "evox-updater")]
#[command(author = "EvoX Team")]
#[command(version)]
#[command(about = "In-place system partition updater", long_about = None)]
pub struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Verify the system partition and apply an update file to it
    Apply {
        /// System block device (or image)
        system_image: PathBuf,

        /// Update file to apply
        update_file: PathBuf,

        /// Where to write the partition backup
        backup_file: PathBuf,

        /// Working directory for mounts, lock and journal
        scratch_dir: PathBuf,

        /// System mount point; looked up in the mount table when omitted
        #[arg(short, long)]
        mount_point: Option<PathBuf>,

        /// Leave mounts in place if the run fails
        #[arg(long)]
        keep_mounts: bool,

        /// Backup image filesystem type
        #[arg(long)]
        fs_type: Option<String>,
    },

    /// Validate an update file and list its records
    Inspect {
        /// Update file to read
        update_file: PathBuf,
    },

    /// Author a full-replacement update file
    Build {
        /// Output update file
        #[arg(short, long)]
        output: PathBuf,

        /// Tree holding the post-update content
        #[arg(long)]
        new_root: PathBuf,

        /// Tree holding the pre-update content, for removed byte counts
        #[arg(long)]
        old_root: Option<PathBuf>,

        /// Expected partition digest (40 hex chars); omitted means unchecked
        #[arg(long)]
        target_digest: Option<String>,

        /// Paths relative to the roots
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Show the journal of the last run in a scratch directory
    Status {
        /// Scratch directory of the run
        scratch_dir: PathBuf,
    },
}

impl Cli {
    /// Configuration from `--config`, or defaults
    pub fn load_config(&self) -> Result<UpdaterConfig, ConfigError> {
        match &self.config {
            Some(path) => UpdaterConfig::load(path),
            None => Ok(UpdaterConfig::default()),
        }
    }
}
