//! Update State Machine
//!
//! Tracks a run through its phases and persists a journal so a crashed or
//! failed run can be inspected afterwards.

use super::storage::StorageDecision;
use super::backup::Verification;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Journal file name inside the scratch directory
pub const JOURNAL_FILE: &str = "state.json";

/// Phases of a run, in the only order they may be visited
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Verifying,
    Planning,
    Mounting,
    Applying,
    Done,
}

impl Phase {
    /// Forward by exactly one step
    pub fn can_advance_to(self, next: Phase) -> bool {
        next as u8 == self as u8 + 1
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Verifying => "verifying",
            Phase::Planning => "planning",
            Phase::Mounting => "mounting",
            Phase::Applying => "applying",
            Phase::Done => "done",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current status of the run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Running { phase: Phase },
    Done,
    /// Terminal; reached from any phase
    Failed { phase: Phase, kind: String, reason: String },
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Running { phase: Phase::Init }
    }
}

/// Complete run state persisted to disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunJournal {
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub system_image: String,
    pub update_file: String,
    /// Hex digest of the pre-update partition, once known
    pub partition_digest: Option<String>,
    pub verification: Option<Verification>,
    pub storage: Option<StorageDecision>,
    pub records_applied: u64,
    /// Last path successfully replaced
    pub last_path: Option<String>,
}

impl RunJournal {
    pub fn new(system_image: &Path, update_file: &Path) -> Self {
        let now = Utc::now();
        Self {
            status: RunStatus::default(),
            started_at: now,
            updated_at: now,
            system_image: system_image.display().to_string(),
            update_file: update_file.display().to_string(),
            partition_digest: None,
            verification: None,
            storage: None,
            records_applied: 0,
            last_path: None,
        }
    }

    /// Load a journal from disk
    pub fn load(path: &Path) -> Result<Self, StateError> {
        let content = fs::read_to_string(path).map_err(|e| StateError::Read(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| StateError::Parse(e.to_string()))
    }

    /// Save state to disk atomically
    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let content = serde_json::to_string_pretty(self).map_err(|e| StateError::Serialize(e.to_string()))?;

        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &content).map_err(|e| StateError::Write(e.to_string()))?;
        fs::rename(&temp_path, path).map_err(|e| StateError::Write(e.to_string()))?;
        Ok(())
    }

    /// Phase the run is in, or failed in
    pub fn phase(&self) -> Phase {
        match &self.status {
            RunStatus::Running { phase } => *phase,
            RunStatus::Done => Phase::Done,
            RunStatus::Failed { phase, .. } => *phase,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, RunStatus::Done | RunStatus::Failed { .. })
    }

    /// Move to the next phase
    pub fn advance(&mut self, next: Phase) -> Result<(), StateError> {
        let current = match &self.status {
            RunStatus::Running { phase } => *phase,
            _ => return Err(StateError::Terminal),
        };
        if !current.can_advance_to(next) {
            return Err(StateError::InvalidTransition { from: current, to: next });
        }
        self.status = if next == Phase::Done {
            RunStatus::Done
        } else {
            RunStatus::Running { phase: next }
        };
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn record_applied(&mut self, path: &Path) {
        self.records_applied += 1;
        self.last_path = Some(path.display().to_string());
        self.updated_at = Utc::now();
    }

    /// Mark the run as failed in its current phase
    pub fn mark_failed(&mut self, kind: &str, reason: String) {
        if self.is_terminal() {
            return;
        }
        self.status = RunStatus::Failed {
            phase: self.phase(),
            kind: kind.to_string(),
            reason,
        };
        self.updated_at = Utc::now();
    }
}

/// State machine errors
#[derive(Error, Debug, Clone)]
pub enum StateError {
    #[error("Failed to read state: {0}")]
    Read(String),
    #[error("Failed to write state: {0}")]
    Write(String),
    #[error("Failed to parse state: {0}")]
    Parse(String),
    #[error("Failed to serialize state: {0}")]
    Serialize(String),
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: Phase, to: Phase },
    #[error("Run already finished")]
    Terminal,
}
