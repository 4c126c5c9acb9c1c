//! Pipeline orchestration.
//!
//! - [`state`]: the persisted state document and its single-writer lock
//! - [`action`]: pure next-action computation
//! - [`runner`]: the driver that advances state and persists every transition

pub mod action;
pub mod runner;
pub mod state;

pub use action::{ActionConfig, Instruction, TeamAction, compute_next_instruction};
pub use runner::{
    AssumeCommitted, CommitAcknowledged, FailureOutcome, PhaseContinuation, PhaseOutcome,
    PipelineRunner, ReviewOutcome, StatusReport,
};
pub use state::{PipelineState, PipelineStatus, StateManager};
