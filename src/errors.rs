//! Typed error hierarchy for the pipeline core.
//!
//! Parser-level problems (flow overrides, task documents) are never raised:
//! they come back as structured error lists so the rest of a document can
//! still load. Everything in this module is a runtime failure that stops the
//! current operation:
//! - `PipelineError` — state machine, persistence and lookup failures

use std::path::PathBuf;
use thiserror::Error;

use crate::orchestrator::state::PipelineStatus;

/// Errors from the pipeline runner and its persisted state.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The state document exists but cannot be trusted. Never recovered by
    /// reinitialising; a human has to look at it.
    #[error("Pipeline state at {path} is corrupt: {reason}")]
    StateCorruption { path: PathBuf, reason: String },

    #[error("Failed to access pipeline state at {path}: {source}")]
    StateIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No pipeline state found at {path}; run intake first")]
    StateMissing { path: PathBuf },

    #[error("Pipeline state already exists at {path}")]
    StateExists { path: PathBuf },

    #[error("Another pipeline operation holds the lock at {path}")]
    Locked { path: PathBuf },

    #[error("Flow '{name}' not found")]
    FlowNotFound { name: String },

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: PipelineStatus,
        to: PipelineStatus,
    },

    #[error("Pipeline is {status}; operation requires {required}")]
    WrongStatus {
        status: PipelineStatus,
        required: PipelineStatus,
    },

    #[error("Step '{step}' is not the current step (current: {current})")]
    NotCurrentStep { step: String, current: String },

    #[error("Step '{step}' is not part of this pipeline")]
    UnknownStep { step: String },

    #[error("Step '{step}' requires '{missing}' to be completed first")]
    PrerequisiteMissing { step: String, missing: String },

    #[error("Phase {got} completed out of order (expected phase {expected})")]
    PhaseOutOfOrder { expected: u32, got: u32 },

    #[error("Phase {phase} is not declared in {document}")]
    UnknownPhase { phase: u32, document: PathBuf },

    #[error("Artifacts for phase {phase} are not committed yet")]
    PhaseNotCommitted { phase: u32 },

    #[error("Step '{step}' still has {remaining} pending phase(s)")]
    PhasesIncomplete { step: String, remaining: usize },

    #[error("Tasks document {path} is invalid: {}", errors.join("; "))]
    InvalidTasksDocument { path: PathBuf, errors: Vec<String> },

    #[error("No review cycle is in progress for step '{step}'")]
    NoActiveReview { step: String },

    #[error("Review step '{step}' has not converged (iteration {iteration}); submit reviews until it does")]
    ReviewNotConverged { step: String, iteration: u32 },

    #[error("Review cycle for step '{step}' is waiting for {expected}")]
    ReviewOutOfTurn { step: String, expected: &'static str },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Whether the error reflects a damaged state document rather than a
    /// rejected operation.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::StateCorruption { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_corruption_carries_path_and_reason() {
        let err = PipelineError::StateCorruption {
            path: PathBuf::from("/work/feat/.pipewright-state.json"),
            reason: "expected value at line 1".to_string(),
        };
        assert!(err.is_corruption());
        let msg = err.to_string();
        assert!(msg.contains(".pipewright-state.json"));
        assert!(msg.contains("expected value"));
    }

    #[test]
    fn state_io_preserves_source_kind() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = PipelineError::StateIo {
            path: PathBuf::from("/state.json"),
            source: io_err,
        };
        match &err {
            PipelineError::StateIo { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected StateIo"),
        }
        assert!(!err.is_corruption());
    }

    #[test]
    fn invalid_transition_names_both_statuses() {
        let err = PipelineError::InvalidTransition {
            from: PipelineStatus::Completed,
            to: PipelineStatus::Active,
        };
        let msg = err.to_string();
        assert!(msg.contains("completed"));
        assert!(msg.contains("active"));
    }

    #[test]
    fn invalid_tasks_document_joins_errors() {
        let err = PipelineError::InvalidTasksDocument {
            path: PathBuf::from("tasks.md"),
            errors: vec!["a".to_string(), "b".to_string()],
        };
        assert!(err.to_string().contains("a; b"));
    }

    #[test]
    fn converts_from_anyhow() {
        let err: PipelineError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, PipelineError::Other(_)));
    }

    #[test]
    fn implements_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&PipelineError::FlowNotFound {
            name: "feature".into(),
        });
    }
}
