//! Pipeline runner: the operations that advance persisted state.
//!
//! Every operation takes the feature lock, loads the state document,
//! applies at most one transition and writes the document back before the
//! lock is released. Completion is reported by an external controller
//! calling back in (`complete_step`, `complete_phase`, `fail_step`,
//! `submit_reviews`, `submit_fix`); the runner itself never spawns or
//! waits on anything.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{EnvOverrides, PipewrightToml};
use crate::errors::PipelineError;
use crate::flow::{FlowDefinition, FlowRegistry};
use crate::orchestrator::action::{
    ActionConfig, Instruction, compute_next_instruction, load_phases, review_targets,
};
use crate::orchestrator::state::{
    GATE_APPROVAL, PendingApproval, PipelineState, PipelineStatus, StateLock, StateManager,
};
use crate::prompt::{
    DiskFs, FsView, build_fixer_base_prompt, build_fixer_prompt, build_verdict_correction_prompt,
};
use crate::retry::{FailureKind, RetryConfig, RetryDecision, classify, decide};
use crate::review::{Convergence, CycleStep, ReviewCycle, SeverityCounts, parse_fixer_output};
use crate::tasks::{TaskPhase, is_completed_prefix, next_pending_phase};

/// Hooks around recording an implementation phase.
pub trait PhaseContinuation {
    /// Whether the work of `phase` is committed and may be recorded.
    fn artifacts_committed(&self, phase: u32) -> bool;

    /// Runs after `phase` is recorded and before the next phase is handed out.
    fn on_phase_complete(&self, phase: u32) -> anyhow::Result<()> {
        debug!(phase, "phase complete");
        Ok(())
    }
}

/// Treats every phase as committed.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeCommitted;

impl PhaseContinuation for AssumeCommitted {
    fn artifacts_committed(&self, _phase: u32) -> bool {
        true
    }
}

/// Commit state as acknowledged by the caller (`--committed`).
#[derive(Debug, Clone, Copy)]
pub struct CommitAcknowledged(pub bool);

impl PhaseContinuation for CommitAcknowledged {
    fn artifacts_committed(&self, _phase: u32) -> bool {
        self.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseOutcome {
    pub phase: u32,
    /// The phase was already recorded; nothing changed.
    pub already_recorded: bool,
    pub next_phase: Option<u32>,
    /// Recording the phase completed the step.
    pub step_completed: bool,
    pub status: PipelineStatus,
    pub current: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailureOutcome {
    /// Redispatch the step after `backoff_secs`.
    Retry {
        step: String,
        attempt: u32,
        backoff_secs: u64,
    },
    /// Retries exhausted or a fatal failure; the pipeline is paused.
    Paused {
        step: String,
        kind: FailureKind,
        reason: String,
    },
    /// Parked until resumed; no attempt was consumed.
    RateLimited { step: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct VerdictCorrection {
    pub persona: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewOutcome {
    pub step: String,
    #[serde(flatten)]
    pub result: CycleStep,
    /// Re-prompts for reviewers that omitted the verdict line.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub corrections: Vec<VerdictCorrection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixer_prompt: Option<String>,
    pub status: PipelineStatus,
    pub current: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FixOutcome {
    pub step: String,
    pub fixed: usize,
    pub rejected: usize,
    /// Review round that comes next.
    pub iteration: u32,
    /// Where the cycle stands if the reviewers confirm the fixes.
    pub projected: Convergence,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseProgress {
    pub declared: Vec<u32>,
    pub completed: Vec<u32>,
    pub next: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewProgress {
    pub step: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub open: SeverityCounts,
    pub escalated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub feature_dir: PathBuf,
    pub flow: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    pub status: PipelineStatus,
    pub current: Option<String>,
    pub completed: Vec<String>,
    pub pipeline: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<PendingApproval>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phases: Option<PhaseProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewProgress>,
    pub retries: usize,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Drives one feature directory.
pub struct PipelineRunner {
    manager: StateManager,
    registry: FlowRegistry,
    config: PipewrightToml,
    retry: RetryConfig,
    env: EnvOverrides,
    fs: Box<dyn FsView>,
    continuation: Box<dyn PhaseContinuation>,
}

impl PipelineRunner {
    /// Runner over the real filesystem. Environment overrides are not
    /// applied; see [`PipelineRunner::with_env`] and
    /// [`PipelineRunner::with_retry`].
    pub fn new(feature_dir: impl Into<PathBuf>, registry: FlowRegistry, config: PipewrightToml) -> Self {
        let retry = config.retry.clone();
        Self {
            manager: StateManager::new(feature_dir),
            registry,
            config,
            retry,
            env: EnvOverrides::default(),
            fs: Box::new(DiskFs),
            continuation: Box::new(AssumeCommitted),
        }
    }

    pub fn with_fs(mut self, fs: Box<dyn FsView>) -> Self {
        self.fs = fs;
        self
    }

    pub fn with_continuation(mut self, continuation: Box<dyn PhaseContinuation>) -> Self {
        self.continuation = continuation;
        self
    }

    pub fn with_env(mut self, env: EnvOverrides) -> Self {
        self.env = env;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn feature_dir(&self) -> &Path {
        self.manager.feature_dir()
    }

    pub fn state_manager(&self) -> &StateManager {
        &self.manager
    }

    fn action_config(&self) -> ActionConfig {
        ActionConfig::from_toml(self.feature_dir(), &self.config, self.env.clone())
    }

    fn flow_for(&self, state: &PipelineState) -> Result<&FlowDefinition, PipelineError> {
        self.registry
            .resolve_variant(&state.flow, state.variant.as_deref())
            .ok_or_else(|| PipelineError::FlowNotFound {
                name: state.flow.clone(),
            })
    }

    /// Lock, load and settle. Settling that changed the state is saved
    /// right away.
    fn open(&self) -> Result<(StateLock, PipelineState), PipelineError> {
        let lock = self.manager.lock()?;
        let mut state = self.manager.load()?;
        if self.settle(&mut state)? {
            self.manager.save(&mut state)?;
        }
        Ok((lock, state))
    }

    /// Bring derived fields in line: point `current` at the first open
    /// step, and move past a phase-split step whose phases are all
    /// recorded.
    fn settle(&self, state: &mut PipelineState) -> Result<bool, PipelineError> {
        let flow = self.flow_for(state)?.clone();
        let mut changed = false;

        loop {
            if state.status == PipelineStatus::Completed {
                break;
            }

            let expected = state.next_incomplete().map(String::from);
            if state.current != expected {
                debug!(from = ?state.current, to = ?expected, "realigning current step");
                state.current = expected;
                changed = true;
            }

            let Some(current) = state.current.clone() else {
                if state.status == PipelineStatus::Active {
                    state.transition(PipelineStatus::Completed)?;
                    info!(flow = %state.flow, "pipeline completed");
                    changed = true;
                }
                break;
            };

            if !flow.is_phased(&current) {
                break;
            }
            let phases = self.phases()?;
            if phases.is_empty() {
                break;
            }
            self.check_phase_prefix(&phases, state)?;
            if next_pending_phase(&phases, &state.completed_phase_set()).is_some()
                || state.status != PipelineStatus::Active
            {
                break;
            }

            info!(step = %current, "all phases recorded; step satisfied");
            self.finish_step(state, &flow, &current)?;
            changed = true;
        }

        if state.status == PipelineStatus::Active && state.pending_approval.is_some() {
            // Best effort: an approval left behind after the gate moved on.
            warn!(pending = ?state.pending_approval, "clearing stale pending approval");
            state.pending_approval = None;
            changed = true;
        }

        Ok(changed)
    }

    fn phases(&self) -> Result<Vec<TaskPhase>, PipelineError> {
        Ok(load_phases(self.fs.as_ref(), self.feature_dir())?
            .map(|(_, phases)| phases)
            .unwrap_or_default())
    }

    fn check_phase_prefix(&self, phases: &[TaskPhase], state: &PipelineState) -> Result<(), PipelineError> {
        if is_completed_prefix(phases, &state.completed_phase_set()) {
            return Ok(());
        }
        Err(PipelineError::StateCorruption {
            path: self.manager.state_path(),
            reason: format!(
                "completed phases {:?} are not a prefix of the declared phases {:?}",
                state.completed_phases,
                phases.iter().map(|p| p.number).collect::<Vec<_>>()
            ),
        })
    }

    /// Mark `step` completed and advance. Clears per-step bookkeeping.
    fn finish_step(
        &self,
        state: &mut PipelineState,
        flow: &FlowDefinition,
        step: &str,
    ) -> Result<(), PipelineError> {
        state.mark_completed(step);
        if flow.is_phased(step) {
            state.completed_phases.clear();
        }
        if state.review.as_ref().is_some_and(|c| c.step == step) {
            state.review = None;
        }
        state.current = state.next_incomplete().map(String::from);
        info!(step, next = ?state.current, "step completed");
        if state.current.is_none() {
            state.transition(PipelineStatus::Completed)?;
            info!(flow = %state.flow, "pipeline completed");
        }
        Ok(())
    }

    fn require_active(state: &PipelineState) -> Result<(), PipelineError> {
        if state.status != PipelineStatus::Active {
            return Err(PipelineError::WrongStatus {
                status: state.status,
                required: PipelineStatus::Active,
            });
        }
        Ok(())
    }

    fn require_current<'a>(state: &'a PipelineState, step: &str) -> Result<&'a str, PipelineError> {
        if !state.in_pipeline(step) {
            return Err(PipelineError::UnknownStep {
                step: step.to_string(),
            });
        }
        match state.current.as_deref() {
            Some(current) if current == step => Ok(current),
            current => Err(PipelineError::NotCurrentStep {
                step: step.to_string(),
                current: current.unwrap_or("none").to_string(),
            }),
        }
    }

    /// Create the state document for a new pipeline.
    pub fn intake(
        &self,
        flow_name: &str,
        variant: Option<&str>,
        condition: Option<serde_json::Value>,
    ) -> Result<PipelineState, PipelineError> {
        let _lock = self.manager.lock()?;
        let flow = self
            .registry
            .resolve_variant(flow_name, variant)
            .ok_or_else(|| PipelineError::FlowNotFound {
                name: flow_name.to_string(),
            })?;

        let pipeline = flow.pipeline_steps(condition.as_ref());
        let mut state = PipelineState::new(
            flow_name,
            variant.map(String::from),
            pipeline,
            condition,
        );
        self.manager.create(&mut state)?;
        info!(
            flow = flow_name,
            variant = ?variant,
            steps = state.pipeline.len(),
            "pipeline created"
        );
        Ok(state)
    }

    /// Reload the pipeline, skipping everything already completed.
    pub fn resume(&self) -> Result<PipelineState, PipelineError> {
        let (_lock, state) = self.open()?;
        info!(current = ?state.current, status = %state.status, "pipeline resumed");
        Ok(state)
    }

    /// The instruction for the current step. A configured gate on the
    /// current step moves the pipeline to `awaiting_approval`.
    pub fn next_instruction(&self) -> Result<Instruction, PipelineError> {
        let (_lock, mut state) = self.open()?;
        let flow = self.flow_for(&state)?;

        if state.status == PipelineStatus::Active
            && let Some(current) = state.current.clone()
            && self.config.gates.is_gated(&current)
            && !state.is_gate_approved(&current)
        {
            state.pending_approval = Some(PendingApproval {
                kind: GATE_APPROVAL.to_string(),
                step: current.clone(),
            });
            state.transition(PipelineStatus::AwaitingApproval)?;
            self.manager.save(&mut state)?;
            info!(step = %current, "awaiting approval");
        }

        compute_next_instruction(flow, &state, self.fs.as_ref(), &self.action_config())
    }

    /// Record a successful dispatch of `step`.
    pub fn complete_step(&self, step: &str) -> Result<PipelineState, PipelineError> {
        let (_lock, mut state) = self.open()?;
        Self::require_active(&state)?;
        Self::require_current(&state, step)?;
        let flow = self.flow_for(&state)?.clone();

        for required in flow.prerequisites_for(step) {
            if state.in_pipeline(required) && !state.is_completed(required) {
                return Err(PipelineError::PrerequisiteMissing {
                    step: step.to_string(),
                    missing: required.clone(),
                });
            }
        }

        if flow.is_phased(step) {
            let phases = self.phases()?;
            let completed = state.completed_phase_set();
            let remaining = phases
                .iter()
                .filter(|p| !completed.contains(&p.number))
                .count();
            if remaining > 0 {
                return Err(PipelineError::PhasesIncomplete {
                    step: step.to_string(),
                    remaining,
                });
            }
        }

        if flow.is_review(step) {
            let cycle = state.review.as_ref().filter(|c| c.step == step);
            if !cycle.is_some_and(ReviewCycle::has_converged) {
                return Err(PipelineError::ReviewNotConverged {
                    step: step.to_string(),
                    iteration: cycle.map(|c| c.iteration).unwrap_or(0),
                });
            }
        }

        self.finish_step(&mut state, &flow, step)?;
        self.manager.save(&mut state)?;
        Ok(state)
    }

    /// Record implementation phase `phase` of the current phase-split step.
    pub fn complete_phase(&self, phase: u32) -> Result<PhaseOutcome, PipelineError> {
        let (_lock, mut state) = self.open()?;
        Self::require_active(&state)?;
        let flow = self.flow_for(&state)?.clone();

        let step = match state.current.clone() {
            Some(step) if flow.is_phased(&step) => step,
            current => {
                return Err(PipelineError::NotCurrentStep {
                    step: flow.phased.first().cloned().unwrap_or_else(|| "implement".into()),
                    current: current.unwrap_or_else(|| "none".to_string()),
                });
            }
        };

        let phases = self.phases()?;
        if !phases.iter().any(|p| p.number == phase) {
            return Err(PipelineError::UnknownPhase {
                phase,
                document: self.feature_dir().join(crate::tasks::TASKS_FILE),
            });
        }

        let completed = state.completed_phase_set();
        if completed.contains(&phase) {
            info!(phase, "phase already recorded");
            return Ok(PhaseOutcome {
                phase,
                already_recorded: true,
                next_phase: next_pending_phase(&phases, &completed).map(|p| p.number),
                step_completed: false,
                status: state.status,
                current: state.current.clone(),
            });
        }

        if let Some(expected) = next_pending_phase(&phases, &completed)
            && expected.number != phase
        {
            return Err(PipelineError::PhaseOutOfOrder {
                expected: expected.number,
                got: phase,
            });
        }

        if !self.continuation.artifacts_committed(phase) {
            return Err(PipelineError::PhaseNotCommitted { phase });
        }

        state.completed_phases.push(phase);
        let completed = state.completed_phase_set();
        let next_phase = next_pending_phase(&phases, &completed).map(|p| p.number);
        info!(step = %step, phase, next = ?next_phase, "phase recorded");

        let step_completed = next_phase.is_none();
        if step_completed {
            self.finish_step(&mut state, &flow, &step)?;
        }
        self.manager.save(&mut state)?;

        self.continuation.on_phase_complete(phase)?;

        Ok(PhaseOutcome {
            phase,
            already_recorded: false,
            next_phase,
            step_completed,
            status: state.status,
            current: state.current.clone(),
        })
    }

    /// Approve the pending gate and return to `active`.
    pub fn approve(&self) -> Result<PipelineState, PipelineError> {
        let (_lock, mut state) = self.open()?;
        if state.status != PipelineStatus::AwaitingApproval {
            return Err(PipelineError::WrongStatus {
                status: state.status,
                required: PipelineStatus::AwaitingApproval,
            });
        }

        match state.pending_approval.take() {
            Some(pending) if state.current.as_deref() == Some(pending.step.as_str()) => {
                info!(step = %pending.step, kind = %pending.kind, "approved");
                if !state.is_gate_approved(&pending.step) {
                    state.approved_gates.push(pending.step);
                }
            }
            stale => {
                warn!(pending = ?stale, current = ?state.current, "discarding stale approval");
            }
        }
        state.transition(PipelineStatus::Active)?;
        self.manager.save(&mut state)?;
        Ok(state)
    }

    /// Report a failed dispatch of `step` and apply the retry policy.
    pub fn fail_step(
        &self,
        step: &str,
        exit_code: Option<i32>,
        output: &str,
    ) -> Result<FailureOutcome, PipelineError> {
        let (_lock, mut state) = self.open()?;
        Self::require_active(&state)?;
        Self::require_current(&state, step)?;

        let kind = classify(exit_code, output);
        let decision = decide(&self.retry, &state.retries, step, kind, exit_code);
        debug!(step, ?kind, ?decision, "retry decision");

        let outcome = match decision {
            RetryDecision::Retry { record, backoff } => {
                let attempt = record.attempt;
                state.retries.push(record);
                info!(step, attempt, backoff_secs = backoff.as_secs(), "retrying step");
                FailureOutcome::Retry {
                    step: step.to_string(),
                    attempt,
                    backoff_secs: backoff.as_secs(),
                }
            }
            RetryDecision::Exhausted { attempts } => {
                let reason = format!(
                    "step '{}' failed ({}) after {} retr{}",
                    step,
                    crate::retry::describe_exit(exit_code),
                    attempts,
                    if attempts == 1 { "y" } else { "ies" }
                );
                self.park(&mut state, PipelineStatus::Paused, &reason)?;
                FailureOutcome::Paused {
                    step: step.to_string(),
                    kind,
                    reason,
                }
            }
            RetryDecision::Fatal { reason } => {
                self.park(&mut state, PipelineStatus::Paused, &reason)?;
                FailureOutcome::Paused {
                    step: step.to_string(),
                    kind,
                    reason,
                }
            }
            RetryDecision::RateLimited => {
                let reason = format!("rate limited while running step '{}'", step);
                self.park(&mut state, PipelineStatus::RateLimited, &reason)?;
                FailureOutcome::RateLimited {
                    step: step.to_string(),
                }
            }
        };

        self.manager.save(&mut state)?;
        Ok(outcome)
    }

    fn park(
        &self,
        state: &mut PipelineState,
        status: PipelineStatus,
        reason: &str,
    ) -> Result<(), PipelineError> {
        state.transition(status)?;
        state.pause_reason = Some(reason.to_string());
        warn!(status = %status, reason, "pipeline parked");
        Ok(())
    }

    /// Return a paused or rate-limited pipeline to `active`. An escalated
    /// review cycle restarts with a fresh iteration budget.
    pub fn resume_parked(&self) -> Result<PipelineState, PipelineError> {
        let (_lock, mut state) = self.open()?;
        if !state.status.is_parked() {
            return Err(PipelineError::WrongStatus {
                status: state.status,
                required: PipelineStatus::Paused,
            });
        }

        state.transition(PipelineStatus::Active)?;
        state.pause_reason = None;

        if let Some(cycle) = state.review.as_mut()
            && cycle.escalated
        {
            let mut fresh = ReviewCycle::begin(&cycle.step, cycle.max_iterations, &cycle.id_prefix);
            fresh.next_issue_id = cycle.next_issue_id;
            info!(step = %cycle.step, "restarting escalated review cycle");
            *cycle = fresh;
        }

        self.manager.save(&mut state)?;
        info!(current = ?state.current, "pipeline unparked");
        Ok(state)
    }

    /// Pause an active pipeline.
    pub fn pause(&self, reason: &str) -> Result<PipelineState, PipelineError> {
        let (_lock, mut state) = self.open()?;
        self.park(&mut state, PipelineStatus::Paused, reason)?;
        self.manager.save(&mut state)?;
        Ok(state)
    }

    /// Feed one round of `(persona, raw output)` reviewer submissions for
    /// the current review step.
    pub fn submit_reviews(&self, submissions: &[(String, String)]) -> Result<ReviewOutcome, PipelineError> {
        let (_lock, mut state) = self.open()?;
        Self::require_active(&state)?;
        let flow = self.flow_for(&state)?.clone();

        let step = match state.current.clone() {
            Some(step) if flow.is_review(&step) => step,
            current => {
                return Err(PipelineError::NoActiveReview {
                    step: current.unwrap_or_else(|| "none".to_string()),
                });
            }
        };

        let mut cycle = match state.review.take() {
            Some(cycle) if cycle.step == step => cycle,
            _ => ReviewCycle::begin(
                &step,
                self.config.review.max_iterations,
                &self.config.review.id_prefix,
            ),
        };

        let outputs = cycle.parse_round(submissions);
        let result = cycle.ingest_reviews(&outputs)?;
        let mut corrections = Vec::new();
        let mut fixer_prompt = None;

        match &result {
            CycleStep::Converged { .. } => {
                state.review = Some(cycle);
                self.finish_step(&mut state, &flow, &step)?;
            }
            CycleStep::NeedsFix { iteration, summary } => {
                let targets = review_targets(&flow, &state, self.fs.as_ref(), self.feature_dir());
                let base = build_fixer_base_prompt(
                    &step,
                    self.feature_dir(),
                    &flow,
                    self.fs.as_ref(),
                    &targets,
                    &self.config.prompt_options(),
                );
                fixer_prompt = Some(build_fixer_prompt(&base, *iteration, summary));
                state.review = Some(cycle);
            }
            CycleStep::MissingVerdict { personas } => {
                for persona in personas {
                    let issue_count = outputs
                        .iter()
                        .find(|o| o.persona.as_deref() == Some(persona.as_str()))
                        .map(|o| o.issues.len())
                        .unwrap_or(0);
                    corrections.push(VerdictCorrection {
                        persona: persona.clone(),
                        prompt: build_verdict_correction_prompt(&step, persona, issue_count),
                    });
                }
                state.review = Some(cycle);
            }
            CycleStep::Escalated { convergence } => {
                let reason = format!(
                    "review of '{}' did not converge after {} iteration(s); open issues {}",
                    step, cycle.iteration, convergence.counts
                );
                state.review = Some(cycle);
                self.park(&mut state, PipelineStatus::Paused, &reason)?;
            }
        }

        self.manager.save(&mut state)?;
        Ok(ReviewOutcome {
            step,
            result,
            corrections,
            fixer_prompt,
            status: state.status,
            current: state.current.clone(),
        })
    }

    /// Feed the fixer's output for the current review cycle.
    pub fn submit_fix(&self, raw: &str) -> Result<FixOutcome, PipelineError> {
        let (_lock, mut state) = self.open()?;
        Self::require_active(&state)?;

        let current = state.current.clone().unwrap_or_else(|| "none".to_string());
        let Some(cycle) = state.review.as_mut().filter(|c| c.step == current) else {
            return Err(PipelineError::NoActiveReview { step: current });
        };

        let fix = parse_fixer_output(raw);
        if fix.is_empty() {
            warn!(step = %current, "fixer output lists no fixed or rejected issues");
        }
        let projected = cycle.ingest_fix(&fix)?;
        let outcome = FixOutcome {
            step: current,
            fixed: fix.fixed.len(),
            rejected: fix.rejected.len(),
            iteration: cycle.iteration,
            projected,
        };

        self.manager.save(&mut state)?;
        Ok(outcome)
    }

    /// Snapshot of the pipeline for humans and dashboards.
    pub fn status(&self) -> Result<StatusReport, PipelineError> {
        let (_lock, state) = self.open()?;
        let flow = self.flow_for(&state)?;

        let phases = match state.current.as_deref() {
            Some(current) if flow.is_phased(current) => {
                let phases = self.phases()?;
                (!phases.is_empty()).then(|| {
                    let completed = state.completed_phase_set();
                    PhaseProgress {
                        declared: phases.iter().map(|p| p.number).collect(),
                        completed: completed.iter().copied().collect(),
                        next: next_pending_phase(&phases, &completed).map(|p| p.number),
                    }
                })
            }
            _ => None,
        };

        let review = state.review.as_ref().map(|cycle| ReviewProgress {
            step: cycle.step.clone(),
            iteration: cycle.iteration,
            max_iterations: cycle.max_iterations,
            open: SeverityCounts::tally(
                cycle
                    .open_issues
                    .iter()
                    .filter(|i| !cycle.fixed.contains(&i.id)),
            ),
            escalated: cycle.escalated,
        });

        Ok(StatusReport {
            feature_dir: self.feature_dir().to_path_buf(),
            flow: state.flow.clone(),
            variant: state.variant.clone(),
            status: state.status,
            current: state.current.clone(),
            completed: state.completed.clone(),
            pipeline: state.pipeline.clone(),
            pause_reason: state.pause_reason.clone(),
            pending_approval: state.pending_approval.clone(),
            phases,
            review,
            retries: state.retries.len(),
            updated_at: state.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::action::TeamAction;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    const TASKS: &str = "# Tasks\n\n## Phase 1: Setup\n- [ ] T001 scaffold\n\n## Phase 2: Core\n- [ ] T002 logic depends: [T001]\n\n## Phase 3: Polish\n- [ ] T003 docs\n";

    fn setup(config: PipewrightToml) -> (TempDir, PipelineRunner) {
        let dir = tempdir().unwrap();
        let runner = PipelineRunner::new(dir.path(), FlowRegistry::builtin(), config);
        (dir, runner)
    }

    fn write(dir: &TempDir, name: &str, content: &str) {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    /// Runner on the quick flow positioned at `review`.
    fn at_review(config: PipewrightToml) -> (TempDir, PipelineRunner) {
        let (dir, runner) = setup(config);
        write(&dir, "spec.md", "# Spec\n");
        runner.intake("quick", None, None).unwrap();
        runner.complete_step("specify").unwrap();
        runner.complete_step("implement").unwrap();
        (dir, runner)
    }

    fn round(entries: &[(&str, &str)]) -> Vec<(String, String)> {
        entries
            .iter()
            .map(|(p, r)| (p.to_string(), r.to_string()))
            .collect()
    }

    #[test]
    fn test_intake_and_resume() {
        let (_dir, runner) = setup(PipewrightToml::default());
        let state = runner.intake("feature", None, None).unwrap();
        assert_eq!(state.pipeline, vec!["specify", "plan", "tasks", "implement", "review"]);
        assert_eq!(state.current.as_deref(), Some("specify"));
        assert!(runner.state_manager().exists());

        let err = runner.intake("feature", None, None).unwrap_err();
        assert!(matches!(err, PipelineError::StateExists { .. }));

        let resumed = runner.resume().unwrap();
        assert_eq!(resumed.current.as_deref(), Some("specify"));
    }

    #[test]
    fn test_intake_with_condition_includes_conditional_step() {
        let (_dir, runner) = setup(PipewrightToml::default());
        let state = runner
            .intake("feature", None, Some(serde_json::json!("needs-clarification")))
            .unwrap();
        assert_eq!(state.pipeline[1], "clarify");
    }

    #[test]
    fn test_intake_unknown_flow() {
        let (_dir, runner) = setup(PipewrightToml::default());
        let err = runner.intake("nope", None, None).unwrap_err();
        assert!(matches!(err, PipelineError::FlowNotFound { .. }));
        assert!(!runner.state_manager().exists());
    }

    #[test]
    fn test_complete_steps_in_order() {
        let (_dir, runner) = setup(PipewrightToml::default());
        runner.intake("quick", None, None).unwrap();

        let err = runner.complete_step("implement").unwrap_err();
        assert!(matches!(err, PipelineError::NotCurrentStep { .. }));
        let err = runner.complete_step("deploy").unwrap_err();
        assert!(matches!(err, PipelineError::UnknownStep { .. }));

        let state = runner.complete_step("specify").unwrap();
        assert_eq!(state.completed, vec!["specify"]);
        assert_eq!(state.current.as_deref(), Some("implement"));
    }

    #[test]
    fn test_resume_skips_completed_steps() {
        let (_dir, runner) = setup(PipewrightToml::default());
        runner.intake("quick", None, None).unwrap();
        runner.complete_step("specify").unwrap();

        // Simulate a crash that left `current` pointing backwards.
        let manager = runner.state_manager();
        let mut state = manager.load().unwrap();
        state.current = None;
        manager.save(&mut state).unwrap();

        let state = runner.resume().unwrap();
        assert_eq!(state.current.as_deref(), Some("implement"));
        let instr = runner.next_instruction().unwrap();
        assert_eq!(instr.action.step(), Some("implement"));
    }

    #[test]
    fn test_phase_guard_never_redispatches_recorded_phases() {
        let (dir, runner) = setup(PipewrightToml::default());
        write(&dir, "tasks.md", TASKS);
        runner.intake("feature", None, None).unwrap();
        for step in ["specify", "plan", "tasks"] {
            runner.complete_step(step).unwrap();
        }

        let outcome = runner.complete_phase(1).unwrap();
        assert_eq!(outcome.next_phase, Some(2));
        assert!(!outcome.step_completed);
        runner.complete_phase(2).unwrap();

        // Re-running on this state hands out phase 3 only.
        for _ in 0..2 {
            let instr = runner.next_instruction().unwrap();
            match instr.action {
                TeamAction::BashDispatch { phase, .. } => {
                    assert_eq!(phase.unwrap().number, 3)
                }
                other => panic!("Expected BashDispatch, got {:?}", other),
            }
        }

        let again = runner.complete_phase(2).unwrap();
        assert!(again.already_recorded);
        assert_eq!(again.next_phase, Some(3));

        let last = runner.complete_phase(3).unwrap();
        assert!(last.step_completed);
        assert_eq!(last.current.as_deref(), Some("review"));
        let state = runner.resume().unwrap();
        assert!(state.is_completed("implement"));
        assert!(state.completed_phases.is_empty());
    }

    #[test]
    fn test_tasks_with_undefined_dependency_are_not_dispatched() {
        let (dir, runner) = setup(PipewrightToml::default());
        write(
            &dir,
            "tasks.md",
            "## Phase 1: Setup\n- [ ] T001 scaffold\n- [ ] T002 logic depends: [T003]\n",
        );
        runner.intake("feature", None, None).unwrap();
        for step in ["specify", "plan", "tasks"] {
            runner.complete_step(step).unwrap();
        }

        let err = runner.next_instruction().unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTasksDocument { .. }));
        let err = runner.complete_phase(1).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTasksDocument { .. }));
        assert!(runner.resume().unwrap().completed_phases.is_empty());
    }

    #[test]
    fn test_phase_order_and_commit_checks() {
        let (dir, runner) = setup(PipewrightToml::default());
        write(&dir, "tasks.md", TASKS);
        runner.intake("feature", None, None).unwrap();
        for step in ["specify", "plan", "tasks"] {
            runner.complete_step(step).unwrap();
        }

        let err = runner.complete_phase(2).unwrap_err();
        assert!(matches!(err, PipelineError::PhaseOutOfOrder { expected: 1, got: 2 }));
        let err = runner.complete_phase(9).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownPhase { phase: 9, .. }));
        let err = runner.complete_step("implement").unwrap_err();
        assert!(matches!(err, PipelineError::PhasesIncomplete { remaining: 3, .. }));

        let runner = runner.with_continuation(Box::new(CommitAcknowledged(false)));
        let err = runner.complete_phase(1).unwrap_err();
        assert!(matches!(err, PipelineError::PhaseNotCommitted { phase: 1 }));
        assert!(runner.resume().unwrap().completed_phases.is_empty());
    }

    #[test]
    fn test_all_phases_recorded_auto_completes_step() {
        let (dir, runner) = setup(PipewrightToml::default());
        write(&dir, "tasks.md", TASKS);
        runner.intake("feature", None, None).unwrap();
        for step in ["specify", "plan", "tasks"] {
            runner.complete_step(step).unwrap();
        }

        let manager = runner.state_manager();
        let mut state = manager.load().unwrap();
        state.completed_phases = vec![1, 2, 3];
        manager.save(&mut state).unwrap();

        let state = runner.resume().unwrap();
        assert!(state.is_completed("implement"));
        assert_eq!(state.current.as_deref(), Some("review"));
    }

    #[test]
    fn test_phase_gap_is_corruption() {
        let (dir, runner) = setup(PipewrightToml::default());
        write(&dir, "tasks.md", TASKS);
        runner.intake("feature", None, None).unwrap();
        for step in ["specify", "plan", "tasks"] {
            runner.complete_step(step).unwrap();
        }

        let manager = runner.state_manager();
        let mut state = manager.load().unwrap();
        state.completed_phases = vec![1, 3];
        manager.save(&mut state).unwrap();

        let err = runner.resume().unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_gate_then_approve() {
        let mut config = PipewrightToml::default();
        config.gates.steps = vec!["implement".into()];
        let (_dir, runner) = setup(config);
        runner.intake("quick", None, None).unwrap();
        runner.complete_step("specify").unwrap();

        let instr = runner.next_instruction().unwrap();
        assert_eq!(instr.action.kind(), "user_gate");
        let state = runner.resume().unwrap();
        assert_eq!(state.status, PipelineStatus::AwaitingApproval);
        assert_eq!(state.pending_approval.as_ref().unwrap().step, "implement");

        let err = runner.complete_step("implement").unwrap_err();
        assert!(matches!(err, PipelineError::WrongStatus { .. }));

        let state = runner.approve().unwrap();
        assert_eq!(state.status, PipelineStatus::Active);
        assert!(state.pending_approval.is_none());
        assert!(state.is_gate_approved("implement"));

        let instr = runner.next_instruction().unwrap();
        assert_eq!(instr.action.kind(), "bash_dispatch");

        let err = runner.approve().unwrap_err();
        assert!(matches!(err, PipelineError::WrongStatus { .. }));
    }

    #[test]
    fn test_stale_pending_approval_is_cleared() {
        let (_dir, runner) = setup(PipewrightToml::default());
        runner.intake("quick", None, None).unwrap();

        let manager = runner.state_manager();
        let mut state = manager.load().unwrap();
        state.pending_approval = Some(PendingApproval {
            kind: GATE_APPROVAL.into(),
            step: "specify".into(),
        });
        manager.save(&mut state).unwrap();

        let state = runner.resume().unwrap();
        assert!(state.pending_approval.is_none());
        assert_eq!(state.status, PipelineStatus::Active);
    }

    #[test]
    fn test_fail_step_retries_then_pauses() {
        let (_dir, runner) = setup(PipewrightToml::default());
        let runner = runner.with_retry(
            RetryConfig::default()
                .with_max_retries(2)
                .with_base_backoff_secs(5),
        );
        runner.intake("quick", None, None).unwrap();

        let first = runner.fail_step("specify", Some(1), "boom").unwrap();
        assert_eq!(
            first,
            FailureOutcome::Retry {
                step: "specify".into(),
                attempt: 1,
                backoff_secs: 5
            }
        );
        let second = runner.fail_step("specify", Some(1), "boom").unwrap();
        assert!(matches!(second, FailureOutcome::Retry { attempt: 2, backoff_secs: 10, .. }));

        let third = runner.fail_step("specify", Some(1), "boom").unwrap();
        match third {
            FailureOutcome::Paused { kind, reason, .. } => {
                assert_eq!(kind, FailureKind::Retryable);
                assert!(reason.contains("after 2 retries"));
            }
            other => panic!("Expected Paused, got {:?}", other),
        }

        let state = runner.resume().unwrap();
        assert_eq!(state.status, PipelineStatus::Paused);
        assert_eq!(state.retries.len(), 2);

        let err = runner.fail_step("specify", Some(1), "boom").unwrap_err();
        assert!(matches!(err, PipelineError::WrongStatus { .. }));
    }

    #[test]
    fn test_rate_limit_parks_without_attempt() {
        let (_dir, runner) = setup(PipewrightToml::default());
        runner.intake("quick", None, None).unwrap();

        let outcome = runner
            .fail_step("specify", Some(1), "429 Too Many Requests")
            .unwrap();
        assert_eq!(
            outcome,
            FailureOutcome::RateLimited {
                step: "specify".into()
            }
        );
        let state = runner.resume().unwrap();
        assert_eq!(state.status, PipelineStatus::RateLimited);
        assert!(state.retries.is_empty());

        let err = runner.pause("manual").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));

        let state = runner.resume_parked().unwrap();
        assert_eq!(state.status, PipelineStatus::Active);
        assert!(state.pause_reason.is_none());
    }

    #[test]
    fn test_fatal_failure_pauses() {
        let (_dir, runner) = setup(PipewrightToml::default());
        runner.intake("quick", None, None).unwrap();
        let outcome = runner.fail_step("specify", Some(127), "").unwrap();
        assert!(matches!(outcome, FailureOutcome::Paused { kind: FailureKind::Fatal, .. }));
    }

    #[test]
    fn test_pause_and_resume_parked() {
        let (_dir, runner) = setup(PipewrightToml::default());
        runner.intake("quick", None, None).unwrap();

        let err = runner.resume_parked().unwrap_err();
        assert!(matches!(err, PipelineError::WrongStatus { .. }));

        let state = runner.pause("waiting on design review").unwrap();
        assert_eq!(state.status, PipelineStatus::Paused);
        let instr = runner.next_instruction().unwrap();
        match instr.action {
            TeamAction::UserGate { message, .. } => assert_eq!(message, "waiting on design review"),
            other => panic!("Expected UserGate, got {:?}", other),
        }

        runner.resume_parked().unwrap();
        assert_eq!(runner.next_instruction().unwrap().action.kind(), "bash_dispatch");
    }

    #[test]
    fn test_review_converges_after_fix() {
        let (_dir, runner) = at_review(PipewrightToml::default());
        assert_eq!(runner.next_instruction().unwrap().action.kind(), "bash_review_dispatch");

        let outcome = runner
            .submit_reviews(&round(&[
                ("correctness", "C | crash on empty input | src/lib.rs:3\nVERDICT: NO-GO\n"),
                ("security", "L | verbose error | src/lib.rs:9\nVERDICT: GO\n"),
            ]))
            .unwrap();
        match &outcome.result {
            CycleStep::NeedsFix { iteration, summary } => {
                assert_eq!(*iteration, 1);
                assert!(summary.contains("RV001"));
            }
            other => panic!("Expected NeedsFix, got {:?}", other),
        }
        assert!(outcome.fixer_prompt.as_deref().unwrap().contains("RV001"));

        let err = runner.submit_reviews(&round(&[("correctness", "VERDICT: GO\n")])).unwrap_err();
        assert!(matches!(err, PipelineError::ReviewOutOfTurn { .. }));

        let fix = runner.submit_fix("FIXED:\nRV001\nREJECTED:\nRV002: intended\n").unwrap();
        assert_eq!(fix.fixed, 1);
        assert_eq!(fix.rejected, 1);
        assert_eq!(fix.iteration, 2);
        assert!(fix.projected.converged);

        let outcome = runner
            .submit_reviews(&round(&[
                ("correctness", "VERDICT: GO\n"),
                ("security", "M | log level | src/lib.rs:9\nVERDICT: CONDITIONAL\n"),
            ]))
            .unwrap();
        assert!(matches!(outcome.result, CycleStep::Converged { .. }));
        assert_eq!(outcome.status, PipelineStatus::Completed);
        assert!(outcome.current.is_none());

        let state = runner.resume().unwrap();
        assert!(state.review.is_none());
        assert_eq!(runner.next_instruction().unwrap().action.kind(), "done");
    }

    #[test]
    fn test_review_issue_ids_continue_across_rounds() {
        let (_dir, runner) = at_review(PipewrightToml::default());
        runner
            .submit_reviews(&round(&[("correctness", "H | a | x\nH | b | y\nVERDICT: NO-GO\n")]))
            .unwrap();
        runner.submit_fix("FIXED: RV001, RV002\n").unwrap();
        let outcome = runner
            .submit_reviews(&round(&[("correctness", "H | c | z\nVERDICT: NO-GO\n")]))
            .unwrap();
        match outcome.result {
            CycleStep::NeedsFix { summary, .. } => assert!(summary.contains("RV003")),
            other => panic!("Expected NeedsFix, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_verdict_yields_corrections() {
        let (_dir, runner) = at_review(PipewrightToml::default());
        let outcome = runner
            .submit_reviews(&round(&[
                ("correctness", "H | unchecked | src/a.rs\n"),
                ("security", "VERDICT: GO\n"),
            ]))
            .unwrap();
        assert!(matches!(outcome.result, CycleStep::MissingVerdict { .. }));
        assert_eq!(outcome.corrections.len(), 1);
        assert_eq!(outcome.corrections[0].persona, "correctness");
        assert!(outcome.corrections[0].prompt.contains("VERDICT: NO-GO"));

        let state = runner.resume().unwrap();
        assert_eq!(state.review.as_ref().unwrap().next_issue_id, 1);
    }

    #[test]
    fn test_review_escalation_pauses_and_resets() {
        let mut config = PipewrightToml::default();
        config.review.max_iterations = 1;
        let (_dir, runner) = at_review(config);

        let outcome = runner
            .submit_reviews(&round(&[("correctness", "C | data loss | db.rs\nVERDICT: NO-GO\n")]))
            .unwrap();
        assert!(matches!(outcome.result, CycleStep::Escalated { .. }));
        assert_eq!(outcome.status, PipelineStatus::Paused);

        let status = runner.status().unwrap();
        assert!(status.pause_reason.unwrap().contains("did not converge"));
        let review = status.review.unwrap();
        assert!(review.escalated);
        assert_eq!(review.open.critical, 1);

        let state = runner.resume_parked().unwrap();
        let cycle = state.review.unwrap();
        assert!(!cycle.escalated);
        assert_eq!(cycle.iteration, 1);
        assert_eq!(cycle.next_issue_id, 2);
    }

    #[test]
    fn test_review_step_cannot_be_completed_without_convergence() {
        let (_dir, runner) = at_review(PipewrightToml::default());
        let err = runner.complete_step("review").unwrap_err();
        assert!(matches!(err, PipelineError::ReviewNotConverged { iteration: 0, .. }));

        runner
            .submit_reviews(&round(&[("security", "H | open redirect | web.rs\nVERDICT: NO-GO\n")]))
            .unwrap();
        let err = runner.complete_step("review").unwrap_err();
        assert!(matches!(err, PipelineError::ReviewNotConverged { iteration: 1, .. }));

        let state = runner.state_manager().load().unwrap();
        assert_eq!(state.current.as_deref(), Some("review"));
        assert!(!state.is_completed("review"));
    }

    #[test]
    fn test_escalated_review_step_cannot_be_completed() {
        let mut config = PipewrightToml::default();
        config.review.max_iterations = 1;
        let (_dir, runner) = at_review(config);
        runner
            .submit_reviews(&round(&[("correctness", "C | data loss | db.rs\nVERDICT: NO-GO\n")]))
            .unwrap();

        let err = runner.complete_step("review").unwrap_err();
        assert!(matches!(err, PipelineError::WrongStatus { .. }));

        // Resuming restarts the cycle; it still has to converge.
        runner.resume_parked().unwrap();
        let err = runner.complete_step("review").unwrap_err();
        assert!(matches!(err, PipelineError::ReviewNotConverged { .. }));
    }

    #[test]
    fn test_submit_fix_without_cycle() {
        let (_dir, runner) = at_review(PipewrightToml::default());
        let err = runner.submit_fix("FIXED: RV001").unwrap_err();
        assert!(matches!(err, PipelineError::NoActiveReview { .. }));
    }

    #[test]
    fn test_submit_reviews_outside_review_step() {
        let (_dir, runner) = setup(PipewrightToml::default());
        runner.intake("quick", None, None).unwrap();
        let err = runner.submit_reviews(&round(&[("x", "VERDICT: GO")])).unwrap_err();
        assert!(matches!(err, PipelineError::NoActiveReview { .. }));
    }

    #[test]
    fn test_status_reports_phase_progress() {
        let (dir, runner) = setup(PipewrightToml::default());
        write(&dir, "tasks.md", TASKS);
        runner.intake("feature", None, None).unwrap();
        for step in ["specify", "plan", "tasks"] {
            runner.complete_step(step).unwrap();
        }
        runner.complete_phase(1).unwrap();

        let status = runner.status().unwrap();
        let phases = status.phases.unwrap();
        assert_eq!(phases.declared, vec![1, 2, 3]);
        assert_eq!(phases.completed, vec![1]);
        assert_eq!(phases.next, Some(2));
        assert_eq!(status.current.as_deref(), Some("implement"));
    }

    #[test]
    fn test_operations_without_state() {
        let (_dir, runner) = setup(PipewrightToml::default());
        assert!(matches!(runner.resume().unwrap_err(), PipelineError::StateMissing { .. }));
        assert!(matches!(runner.status().unwrap_err(), PipelineError::StateMissing { .. }));
    }

    #[test]
    fn test_corrupt_state_is_never_reinitialised() {
        let (dir, runner) = setup(PipewrightToml::default());
        write(&dir, crate::orchestrator::state::STATE_FILE, "{ not json");
        assert!(runner.resume().unwrap_err().is_corruption());
        let err = runner.intake("quick", None, None).unwrap_err();
        assert!(matches!(err, PipelineError::StateExists { .. }));
    }

    #[test]
    fn test_lock_held_fails_fast() {
        let (_dir, runner) = setup(PipewrightToml::default());
        runner.intake("quick", None, None).unwrap();
        let _held = runner.state_manager().lock().unwrap();
        let other =
            PipelineRunner::new(runner.feature_dir(), FlowRegistry::builtin(), PipewrightToml::default());
        let err = other.resume().unwrap_err();
        assert!(matches!(err, PipelineError::Locked { .. }));
    }
}
