//! Tasks document parsing.
//!
//! The tasks document produced by the `tasks` step is split into numbered
//! phases for phase-by-phase dispatch, and its checklist is validated before
//! any phase is handed out.

pub mod checklist;
pub mod phases;

pub use checklist::{TaskItem, TaskValidation, globs_overlap, parse_tasks};
pub use phases::{
    PhaseParse, TaskPhase, is_completed_prefix, next_pending_phase, parse_phases, phase_body,
};

/// File name of the tasks document inside a feature directory.
pub const TASKS_FILE: &str = "tasks.md";
