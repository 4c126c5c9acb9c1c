//! Persisted pipeline state.
//!
//! One JSON document per feature directory is the single source of truth.
//! Every runner operation takes an exclusive advisory lock, loads the
//! document, applies one transition and writes it back atomically (temp file
//! in the same directory, then rename). A document that fails to parse or
//! breaks an invariant is reported as corrupt and never reinitialised.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::errors::PipelineError;
use crate::retry::{RetryRecord, check_history};
use crate::review::ReviewCycle;

pub const STATE_FILE: &str = ".pipewright-state.json";
pub const LOCK_FILE: &str = ".pipewright-state.lock";
pub const SCHEMA_VERSION: u32 = 1;

/// Pending-approval kind for configured confirmation gates.
pub const GATE_APPROVAL: &str = "gate";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    #[default]
    Active,
    AwaitingApproval,
    Paused,
    Completed,
    RateLimited,
}

impl PipelineStatus {
    /// Whether the pipeline waits for an external resume.
    pub fn is_parked(&self) -> bool {
        matches!(self, Self::Paused | Self::RateLimited)
    }

    /// The permitted edges of the state machine. Staying put is not a
    /// transition and is handled by the caller.
    pub fn can_transition_to(&self, to: PipelineStatus) -> bool {
        use PipelineStatus::*;
        matches!(
            (self, to),
            (Active, AwaitingApproval)
                | (AwaitingApproval, Active)
                | (Active, Paused)
                | (Active, RateLimited)
                | (Paused, Active)
                | (RateLimited, Active)
                | (Active, Completed)
        )
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::RateLimited => "rate_limited",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingApproval {
    #[serde(rename = "type")]
    pub kind: String,
    pub step: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub flow: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    pub pipeline: Vec<String>,
    #[serde(default)]
    pub completed: Vec<String>,
    pub current: Option<String>,
    pub status: PipelineStatus,
    #[serde(default)]
    pub pause_reason: Option<String>,
    #[serde(default)]
    pub pending_approval: Option<PendingApproval>,
    /// Opaque value steps may set; drives conditional steps.
    #[serde(default)]
    pub condition: Option<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_phases: Vec<u32>,
    #[serde(default)]
    pub retries: Vec<RetryRecord>,
    #[serde(default)]
    pub approved_gates: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewCycle>,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl PipelineState {
    pub fn new(
        flow: &str,
        variant: Option<String>,
        pipeline: Vec<String>,
        condition: Option<serde_json::Value>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            flow: flow.to_string(),
            variant,
            current: pipeline.first().cloned(),
            pipeline,
            completed: Vec::new(),
            status: PipelineStatus::Active,
            pause_reason: None,
            pending_approval: None,
            condition,
            updated_at: Utc::now(),
            completed_phases: Vec::new(),
            retries: Vec::new(),
            approved_gates: Vec::new(),
            review: None,
        }
    }

    pub fn is_completed(&self, step: &str) -> bool {
        self.completed.iter().any(|s| s == step)
    }

    pub fn in_pipeline(&self, step: &str) -> bool {
        self.pipeline.iter().any(|s| s == step)
    }

    pub fn mark_completed(&mut self, step: &str) {
        if !self.is_completed(step) {
            self.completed.push(step.to_string());
        }
    }

    /// First pipeline step not yet completed.
    pub fn next_incomplete(&self) -> Option<&str> {
        self.pipeline
            .iter()
            .find(|s| !self.is_completed(s))
            .map(String::as_str)
    }

    pub fn all_completed(&self) -> bool {
        self.pipeline.iter().all(|s| self.is_completed(s))
    }

    pub fn is_gate_approved(&self, step: &str) -> bool {
        self.approved_gates.iter().any(|s| s == step)
    }

    pub fn completed_phase_set(&self) -> BTreeSet<u32> {
        self.completed_phases.iter().copied().collect()
    }

    /// Move to `to`, rejecting edges the state machine does not have.
    pub fn transition(&mut self, to: PipelineStatus) -> Result<(), PipelineError> {
        if self.status == to {
            return Ok(());
        }
        if !self.status.can_transition_to(to) {
            return Err(PipelineError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        debug!(from = %self.status, to = %to, "status transition");
        self.status = to;
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Check the document invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version > SCHEMA_VERSION {
            return Err(format!(
                "schema version {} is newer than supported version {}",
                self.schema_version, SCHEMA_VERSION
            ));
        }

        let mut seen = BTreeSet::new();
        for step in &self.completed {
            if !self.in_pipeline(step) {
                return Err(format!("completed step '{}' is not in the pipeline", step));
            }
            if !seen.insert(step.as_str()) {
                return Err(format!("step '{}' is completed twice", step));
            }
        }

        if let Some(current) = &self.current {
            if !self.in_pipeline(current) {
                return Err(format!("current step '{}' is not in the pipeline", current));
            }
            if self.is_completed(current) && self.status != PipelineStatus::Completed {
                return Err(format!(
                    "current step '{}' is already completed while status is {}",
                    current, self.status
                ));
            }
        }

        let mut phases = BTreeSet::new();
        for phase in &self.completed_phases {
            if !phases.insert(*phase) {
                return Err(format!("phase {} is completed twice", phase));
            }
        }

        if self.status == PipelineStatus::AwaitingApproval && self.pending_approval.is_none() {
            return Err("status is awaiting_approval without a pending approval".to_string());
        }

        check_history(&self.retries)
    }
}

/// Holds the feature lock until dropped.
#[derive(Debug)]
pub struct StateLock {
    file: File,
    path: PathBuf,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), error = %e, "failed to release state lock");
        }
    }
}

/// Reads and writes the state document of one feature directory.
#[derive(Debug, Clone)]
pub struct StateManager {
    feature_dir: PathBuf,
}

impl StateManager {
    pub fn new(feature_dir: impl Into<PathBuf>) -> Self {
        Self {
            feature_dir: feature_dir.into(),
        }
    }

    pub fn feature_dir(&self) -> &Path {
        &self.feature_dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.feature_dir.join(STATE_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.feature_dir.join(LOCK_FILE)
    }

    pub fn exists(&self) -> bool {
        self.state_path().exists()
    }

    /// Take the exclusive feature lock without blocking.
    pub fn lock(&self) -> Result<StateLock, PipelineError> {
        let path = self.lock_path();
        let io_err = |source| PipelineError::StateIo {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.feature_dir).map_err(io_err)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(io_err)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(StateLock { file, path }),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(PipelineError::Locked { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                Err(PipelineError::Locked { path })
            }
            Err(e) => Err(io_err(e)),
        }
    }

    /// Load and validate the state document.
    pub fn load(&self) -> Result<PipelineState, PipelineError> {
        let path = self.state_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::StateMissing { path });
            }
            Err(source) => return Err(PipelineError::StateIo { path, source }),
        };

        let state: PipelineState =
            serde_json::from_str(&content).map_err(|e| PipelineError::StateCorruption {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        state
            .validate()
            .map_err(|reason| PipelineError::StateCorruption { path, reason })?;
        Ok(state)
    }

    /// Write the document atomically, stamping `updated_at`.
    pub fn save(&self, state: &mut PipelineState) -> Result<(), PipelineError> {
        state.touch();
        let path = self.state_path();
        let io_err = |source| PipelineError::StateIo {
            path: path.clone(),
            source,
        };

        let json = serde_json::to_string_pretty(state)
            .map_err(|e| PipelineError::Other(anyhow::Error::new(e)))?;
        let mut tmp = NamedTempFile::new_in(&self.feature_dir).map_err(io_err)?;
        tmp.write_all(json.as_bytes()).map_err(io_err)?;
        tmp.write_all(b"\n").map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;

        debug!(path = %path.display(), status = %state.status, "state saved");
        Ok(())
    }

    /// Write a fresh document; fails if one already exists.
    pub fn create(&self, state: &mut PipelineState) -> Result<(), PipelineError> {
        if self.exists() {
            return Err(PipelineError::StateExists {
                path: self.state_path(),
            });
        }
        fs::create_dir_all(&self.feature_dir).map_err(|source| PipelineError::StateIo {
            path: self.feature_dir.clone(),
            source,
        })?;
        self.save(state)
    }
}
