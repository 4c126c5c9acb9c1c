//! Next-action computation.
//!
//! [`compute_next_instruction`] is a pure function of the flow, the persisted
//! state, a read-only filesystem view and configuration. It never writes;
//! the runner persists whatever transition the instruction implies.
//!
//! Decision order for the current step:
//!
//! 1. Pipeline completed → `Done`
//! 2. Paused, rate limited or awaiting approval → `UserGate`
//! 3. Configured gate not yet approved → `UserGate`
//! 4. Review step → `BashReviewDispatch`
//! 5. Anything else → `BashDispatch` (phase-split steps get the first
//!    pending phase)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::{
    EnvOverrides, ExecutorsSection, GatesSection, PipewrightToml, ResolvedExecutor, ReviewSection,
    Role, resolve_executor,
};
use crate::errors::PipelineError;
use crate::flow::{ArtifactSpec, FlowDefinition};
use crate::orchestrator::state::{PipelineState, PipelineStatus};
use crate::prompt::{
    FsView, PromptOptions, build_dispatch_prompt, build_fixer_base_prompt, build_fixer_prompt,
    build_phase_prompt, build_review_prompt,
};
use crate::review::{CycleTurn, ReviewCycle};
use crate::tasks::{TASKS_FILE, TaskPhase, next_pending_phase, parse_phases, parse_tasks};

/// Name of the binary the completion commands invoke.
pub const BINARY: &str = "pipewright";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub role: Role,
    #[serde(flatten)]
    pub executor: ResolvedExecutor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewerDescriptor {
    #[serde(flatten)]
    pub executor: ResolvedExecutor,
    pub personas: Vec<String>,
    pub id_prefix: String,
    /// Sequence number of the first issue id this round.
    pub start_id: u32,
}

/// The handoff contract to the external dispatch controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TeamAction {
    BashDispatch {
        step: String,
        worker: WorkerDescriptor,
        prompt: String,
        artifacts: Vec<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase: Option<TaskPhase>,
    },
    BashReviewDispatch {
        step: String,
        reviewer: ReviewerDescriptor,
        fixer: WorkerDescriptor,
        review_prompt: String,
        fixer_base_prompt: String,
        /// Present while the cycle waits for a fix.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fixer_prompt: Option<String>,
        target_files: Vec<PathBuf>,
        max_iterations: u32,
        iteration: u32,
    },
    UserGate {
        step: Option<String>,
        message: String,
        options: Vec<String>,
    },
    Done {
        summary: String,
        artifacts: Vec<PathBuf>,
    },
}

impl TeamAction {
    pub fn kind(&self) -> &'static str {
        match self {
            TeamAction::BashDispatch { .. } => "bash_dispatch",
            TeamAction::BashReviewDispatch { .. } => "bash_review_dispatch",
            TeamAction::UserGate { .. } => "user_gate",
            TeamAction::Done { .. } => "done",
        }
    }

    pub fn step(&self) -> Option<&str> {
        match self {
            TeamAction::BashDispatch { step, .. } | TeamAction::BashReviewDispatch { step, .. } => {
                Some(step)
            }
            TeamAction::UserGate { step, .. } => step.as_deref(),
            TeamAction::Done { .. } => None,
        }
    }
}

/// An action plus what the caller needs to recover and to report back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    #[serde(flatten)]
    pub action: TeamAction,
    pub recovery_hint: String,
    /// Exact command that signals completion of this action.
    pub complete_command: String,
}

/// Inputs to action computation that do not live in the state document.
#[derive(Debug, Clone)]
pub struct ActionConfig {
    pub feature_dir: PathBuf,
    pub prompt: PromptOptions,
    pub review: ReviewSection,
    pub gates: GatesSection,
    pub executors: ExecutorsSection,
    pub env: EnvOverrides,
    /// Phase completion must be acknowledged with `--committed`.
    pub require_commit: bool,
}

impl ActionConfig {
    pub fn new(feature_dir: impl Into<PathBuf>) -> Self {
        Self::from_toml(feature_dir, &PipewrightToml::default(), EnvOverrides::default())
    }

    pub fn from_toml(feature_dir: impl Into<PathBuf>, toml: &PipewrightToml, env: EnvOverrides) -> Self {
        Self {
            feature_dir: feature_dir.into(),
            prompt: toml.prompt_options(),
            review: toml.review.clone(),
            gates: toml.gates.clone(),
            executors: toml.executors.clone(),
            env,
            require_commit: toml.implement.require_commit,
        }
    }

    fn resolve(&self, step: &str, role: Role) -> ResolvedExecutor {
        resolve_executor(&self.executors, &self.env, step, role)
    }
}

/// The tasks document of a feature and its phases. `None` when the
/// document does not exist.
pub fn load_phases(
    fs: &dyn FsView,
    feature_dir: &Path,
) -> Result<Option<(String, Vec<TaskPhase>)>, PipelineError> {
    let path = feature_dir.join(TASKS_FILE);
    if !fs.exists(&path) {
        return Ok(None);
    }
    let text = fs
        .read_to_string(&path)
        .map_err(|source| PipelineError::StateIo {
            path: path.clone(),
            source,
        })?;
    // Task-level checks cover the phase errors as well.
    let report = parse_tasks(&text);
    if !report.valid {
        return Err(PipelineError::InvalidTasksDocument {
            path,
            errors: report.errors,
        });
    }
    for warning in &report.warnings {
        tracing::warn!(path = %path.display(), "{}", warning);
    }
    let phases = parse_phases(&text).phases;
    Ok(Some((text, phases)))
}

/// Files produced by the completed steps, in pipeline order. `"*"`
/// artifacts expand to the files currently in the feature directory.
pub fn review_targets(
    flow: &FlowDefinition,
    state: &PipelineState,
    fs: &dyn FsView,
    feature_dir: &Path,
) -> Vec<PathBuf> {
    let mut targets: Vec<PathBuf> = Vec::new();
    for step in state.pipeline.iter().filter(|s| state.is_completed(s)) {
        let paths = match flow.artifacts_for(step) {
            ArtifactSpec::All => fs
                .list_files(feature_dir)
                .into_iter()
                .map(|p| feature_dir.join(p))
                .collect(),
            spec => spec.resolve(feature_dir),
        };
        for path in paths {
            if !targets.contains(&path) {
                targets.push(path);
            }
        }
    }
    targets
}

/// Compute what the caller should do next.
pub fn compute_next_instruction(
    flow: &FlowDefinition,
    state: &PipelineState,
    fs: &dyn FsView,
    config: &ActionConfig,
) -> Result<Instruction, PipelineError> {
    let dir = config.feature_dir.as_path();

    let current = match state.current.as_deref() {
        Some(step) if state.status != PipelineStatus::Completed => step,
        _ if state.status == PipelineStatus::Completed || state.all_completed() => {
            return Ok(done(flow, state, fs, dir));
        }
        _ => {
            return Err(PipelineError::StateCorruption {
                path: dir.join(crate::orchestrator::state::STATE_FILE),
                reason: "no current step while steps remain".to_string(),
            });
        }
    };

    match state.status {
        PipelineStatus::Paused => {
            return Ok(Instruction {
                action: TeamAction::UserGate {
                    step: Some(current.to_string()),
                    message: state
                        .pause_reason
                        .clone()
                        .unwrap_or_else(|| "Pipeline is paused".to_string()),
                    options: vec!["resume".to_string()],
                },
                recovery_hint: "Resolve the cause, then resume the pipeline.".to_string(),
                complete_command: command(dir, "resume"),
            });
        }
        PipelineStatus::RateLimited => {
            return Ok(Instruction {
                action: TeamAction::UserGate {
                    step: Some(current.to_string()),
                    message: state
                        .pause_reason
                        .clone()
                        .unwrap_or_else(|| "Pipeline is rate limited".to_string()),
                    options: vec!["resume".to_string()],
                },
                recovery_hint: "Wait for the rate limit to clear, then resume. \
                                No retry attempt was consumed."
                    .to_string(),
                complete_command: command(dir, "resume"),
            });
        }
        PipelineStatus::AwaitingApproval => {
            let step = state
                .pending_approval
                .as_ref()
                .map(|p| p.step.as_str())
                .unwrap_or(current);
            return Ok(gate(step, config));
        }
        PipelineStatus::Active | PipelineStatus::Completed => {}
    }

    if config.gates.is_gated(current) && !state.is_gate_approved(current) {
        return Ok(gate(current, config));
    }

    if flow.is_review(current) {
        return Ok(review_dispatch(current, flow, state, fs, config));
    }

    if flow.is_phased(current)
        && let Some((tasks_text, phases)) = load_phases(fs, dir)?
        && !phases.is_empty()
    {
        let completed = state.completed_phase_set();
        let Some(phase) = next_pending_phase(&phases, &completed) else {
            // Every phase is recorded; the step itself is satisfied.
            let mut settled = state.clone();
            settled.mark_completed(current);
            settled.current = settled.next_incomplete().map(String::from);
            if settled.current.is_none() {
                settled.status = PipelineStatus::Completed;
            }
            return compute_next_instruction(flow, &settled, fs, config);
        };

        let prompt = build_phase_prompt(
            current,
            dir,
            flow,
            fs,
            phase,
            &tasks_text,
            &config.prompt,
        );
        let commit_flag = if config.require_commit {
            " --committed"
        } else {
            ""
        };
        return Ok(Instruction {
            recovery_hint: format!(
                "Phase {} of {} ({} already recorded). Commit the phase's work before \
                 reporting it; on failure run `{}`.",
                phase.number,
                phases.len(),
                completed.len(),
                command(dir, &format!("fail {} --exit-code <code>", current))
            ),
            complete_command: command(
                dir,
                &format!("complete-phase {}{}", phase.number, commit_flag),
            ),
            action: TeamAction::BashDispatch {
                step: current.to_string(),
                worker: WorkerDescriptor {
                    role: Role::Worker,
                    executor: config.resolve(current, Role::Worker),
                },
                prompt,
                artifacts: flow.artifacts_for(current).resolve(dir),
                phase: Some(phase.clone()),
            },
        });
    }

    let attempts = crate::retry::attempts_for(&state.retries, current);
    let recovery_hint = if attempts > 0 {
        format!(
            "Retry {} of step '{}'. On failure run `{}`.",
            attempts,
            current,
            command(dir, &format!("fail {} --exit-code <code>", current))
        )
    } else {
        format!(
            "On failure run `{}`; the pipeline decides between retry and pause.",
            command(dir, &format!("fail {} --exit-code <code>", current))
        )
    };

    Ok(Instruction {
        action: TeamAction::BashDispatch {
            step: current.to_string(),
            worker: WorkerDescriptor {
                role: Role::Worker,
                executor: config.resolve(current, Role::Worker),
            },
            prompt: build_dispatch_prompt(current, dir, flow, fs, &config.prompt),
            artifacts: flow.artifacts_for(current).resolve(dir),
            phase: None,
        },
        recovery_hint,
        complete_command: command(dir, &format!("complete {}", current)),
    })
}

fn review_dispatch(
    step: &str,
    flow: &FlowDefinition,
    state: &PipelineState,
    fs: &dyn FsView,
    config: &ActionConfig,
) -> Instruction {
    let dir = config.feature_dir.as_path();
    let targets = review_targets(flow, state, fs, dir);
    let personas = &config.review.personas;

    let fresh;
    let cycle = match state.review.as_ref().filter(|c| c.step == step) {
        Some(cycle) => cycle,
        None => {
            fresh = ReviewCycle::begin(step, config.review.max_iterations, &config.review.id_prefix);
            &fresh
        }
    };

    let fixer_base_prompt = build_fixer_base_prompt(step, dir, flow, fs, &targets, &config.prompt);
    let (fixer_prompt, recovery_hint, complete_command) = match cycle.turn {
        CycleTurn::Fix => (
            Some(build_fixer_prompt(
                &fixer_base_prompt,
                cycle.iteration,
                &cycle.fixer_summary(),
            )),
            format!(
                "Review round {} needs fixes. Dispatch the fixer step '{}-fixer' with \
                 the fixer prompt, then submit its output.",
                cycle.iteration, step
            ),
            command(dir, "review fix <fixer-output-file>"),
        ),
        CycleTurn::Reviews => {
            let args: Vec<String> = personas
                .iter()
                .map(|p| format!("{}=<output-file>", p))
                .collect();
            (
                None,
                format!(
                    "Run one reviewer per persona and submit every output together. \
                     After {} round(s) without convergence the pipeline pauses for a human.",
                    cycle.max_iterations
                ),
                command(dir, &format!("review submit {}", args.join(" "))),
            )
        }
    };

    Instruction {
        action: TeamAction::BashReviewDispatch {
            step: step.to_string(),
            reviewer: ReviewerDescriptor {
                executor: config.resolve(step, Role::Reviewer),
                personas: personas.clone(),
                id_prefix: cycle.id_prefix.clone(),
                start_id: cycle.next_issue_id,
            },
            fixer: WorkerDescriptor {
                role: Role::Fixer,
                executor: config.resolve(step, Role::Fixer),
            },
            review_prompt: build_review_prompt(
                step,
                dir,
                flow,
                fs,
                &targets,
                personas,
                &config.prompt,
            ),
            fixer_base_prompt,
            fixer_prompt,
            target_files: targets,
            max_iterations: cycle.max_iterations,
            iteration: cycle.iteration,
        },
        recovery_hint,
        complete_command,
    }
}

fn gate(step: &str, config: &ActionConfig) -> Instruction {
    let dir = config.feature_dir.as_path();
    Instruction {
        action: TeamAction::UserGate {
            step: Some(step.to_string()),
            message: config.gates.message_for(step),
            options: vec!["approve".to_string(), "pause".to_string()],
        },
        recovery_hint: format!(
            "Nothing is dispatched until step '{}' is approved.",
            step
        ),
        complete_command: command(dir, "approve"),
    }
}

fn done(flow: &FlowDefinition, state: &PipelineState, fs: &dyn FsView, dir: &Path) -> Instruction {
    let artifacts = review_targets(flow, state, fs, dir)
        .into_iter()
        .filter(|p| fs.exists(p))
        .collect();
    Instruction {
        action: TeamAction::Done {
            summary: format!(
                "Flow '{}' completed: {} of {} step(s) done",
                state.flow,
                state.completed.len(),
                state.pipeline.len()
            ),
            artifacts,
        },
        recovery_hint: "Nothing left to dispatch.".to_string(),
        complete_command: command(dir, "status"),
    }
}

/// Full CLI invocation for `args` against `feature_dir`.
pub fn command(feature_dir: &Path, args: &str) -> String {
    format!(
        "{} --feature-dir {} {}",
        BINARY,
        shell_quote(&feature_dir.display().to_string()),
        args
    )
}

fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:@%,=".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::builtin_flows;
    use crate::orchestrator::state::PendingApproval;
    use crate::prompt::MemoryFs;
    use crate::review::{ReviewIssue, Severity};

    const DIR: &str = "/work/feat";

    fn feature() -> FlowDefinition {
        builtin_flows().remove("feature").unwrap()
    }

    fn state_at(flow: &FlowDefinition, current: &str) -> PipelineState {
        let mut state = PipelineState::new("feature", None, flow.pipeline_steps(None), None);
        for step in flow.pipeline_steps(None) {
            if step == current {
                break;
            }
            state.mark_completed(&step);
        }
        state.current = Some(current.to_string());
        state
    }

    fn fs() -> MemoryFs {
        MemoryFs::new()
            .with_file(format!("{DIR}/spec.md"), "# Spec\n")
            .with_file(format!("{DIR}/plan.md"), "# Plan\n")
            .with_file(
                format!("{DIR}/tasks.md"),
                "# Tasks\n## Phase 1: Setup\n- [ ] T001 a\n## Phase 2: Core\n- [ ] T002 b\n## Phase 3: Polish\n- [ ] T003 c\n",
            )
            .with_file(format!("{DIR}/src/lib.rs"), "fn main() {}\n")
    }

    fn config() -> ActionConfig {
        ActionConfig::new(DIR)
    }

    #[test]
    fn test_plain_dispatch() {
        let flow = feature();
        let state = state_at(&flow, "plan");
        let instr = compute_next_instruction(&flow, &state, &fs(), &config()).unwrap();

        match &instr.action {
            TeamAction::BashDispatch {
                step,
                worker,
                prompt,
                artifacts,
                phase,
            } => {
                assert_eq!(step, "plan");
                assert_eq!(worker.role, Role::Worker);
                assert_eq!(worker.executor.executor, "claude");
                assert!(prompt.contains("Step: plan"));
                assert_eq!(
                    artifacts,
                    &vec![
                        PathBuf::from("/work/feat/plan.md"),
                        PathBuf::from("/work/feat/research.md")
                    ]
                );
                assert!(phase.is_none());
            }
            other => panic!("Expected BashDispatch, got {:?}", other),
        }
        assert_eq!(
            instr.complete_command,
            "pipewright --feature-dir /work/feat complete plan"
        );
        assert!(instr.recovery_hint.contains("fail plan"));
    }

    #[test]
    fn test_review_step_dispatches_reviewers_and_fixer() {
        let flow = feature();
        let state = state_at(&flow, "review");
        let instr = compute_next_instruction(&flow, &state, &fs(), &config()).unwrap();

        match &instr.action {
            TeamAction::BashReviewDispatch {
                step,
                reviewer,
                fixer,
                review_prompt,
                fixer_base_prompt,
                fixer_prompt,
                target_files,
                max_iterations,
                iteration,
            } => {
                assert_eq!(step, "review");
                assert_eq!(reviewer.personas, vec!["correctness", "security"]);
                assert_eq!(reviewer.id_prefix, "RV");
                assert_eq!(reviewer.start_id, 1);
                assert_eq!(fixer.role, Role::Fixer);
                assert!(review_prompt.contains("Role: reviewer"));
                assert!(fixer_base_prompt.contains("Role: fixer"));
                assert!(fixer_prompt.is_none());
                assert_eq!(*max_iterations, 3);
                assert_eq!(*iteration, 1);
                assert!(target_files.contains(&PathBuf::from("/work/feat/spec.md")));
                assert!(target_files.contains(&PathBuf::from("/work/feat/src/lib.rs")));
            }
            other => panic!("Expected BashReviewDispatch, got {:?}", other),
        }
        assert!(instr.complete_command.contains("review submit correctness=<output-file>"));
    }

    #[test]
    fn test_review_waiting_for_fix_names_fixer() {
        let flow = feature();
        let mut state = state_at(&flow, "review");
        let mut cycle = ReviewCycle::begin("review", 3, "RV");
        cycle.turn = CycleTurn::Fix;
        cycle.next_issue_id = 2;
        cycle
            .open_issues
            .push(ReviewIssue::new("RV001", Severity::High, "unchecked input", "src/lib.rs:1"));
        state.review = Some(cycle);

        let instr = compute_next_instruction(&flow, &state, &fs(), &config()).unwrap();
        assert!(instr.recovery_hint.contains("review-fixer"));
        assert!(instr.complete_command.ends_with("review fix <fixer-output-file>"));
        match &instr.action {
            TeamAction::BashReviewDispatch {
                fixer_prompt,
                reviewer,
                ..
            } => {
                let prompt = fixer_prompt.as_deref().unwrap();
                assert!(prompt.contains("RV001"));
                assert_eq!(reviewer.start_id, 2);
            }
            other => panic!("Expected BashReviewDispatch, got {:?}", other),
        }
    }

    #[test]
    fn test_phased_step_dispatches_only_pending_phase() {
        let flow = feature();
        let mut state = state_at(&flow, "implement");
        state.completed_phases = vec![1, 2];

        let instr = compute_next_instruction(&flow, &state, &fs(), &config()).unwrap();
        match &instr.action {
            TeamAction::BashDispatch { phase, prompt, .. } => {
                let phase = phase.as_ref().unwrap();
                assert_eq!(phase.number, 3);
                assert!(prompt.contains("## Phase 3: Polish"));
                assert!(prompt.contains("T003"));
                assert!(prompt.contains("lines 6-7 of the tasks document"));
            }
            other => panic!("Expected BashDispatch, got {:?}", other),
        }
        assert!(instr.complete_command.ends_with("complete-phase 3 --committed"));
    }

    #[test]
    fn test_phase_command_without_commit_requirement() {
        let flow = feature();
        let state = state_at(&flow, "implement");
        let mut config = config();
        config.require_commit = false;
        let instr = compute_next_instruction(&flow, &state, &fs(), &config).unwrap();
        assert!(instr.complete_command.ends_with("complete-phase 1"));
    }

    #[test]
    fn test_all_phases_recorded_moves_past_step() {
        let flow = feature();
        let mut state = state_at(&flow, "implement");
        state.completed_phases = vec![1, 2, 3];
        let instr = compute_next_instruction(&flow, &state, &fs(), &config()).unwrap();
        assert_eq!(instr.action.kind(), "bash_review_dispatch");
        assert_eq!(instr.action.step(), Some("review"));
    }

    #[test]
    fn test_invalid_tasks_document_is_an_error() {
        let flow = feature();
        let state = state_at(&flow, "implement");
        let fs = MemoryFs::new().with_file(
            format!("{DIR}/tasks.md"),
            "## Phase 2: B\n## Phase 1: A\n",
        );
        let err = compute_next_instruction(&flow, &state, &fs, &config()).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTasksDocument { .. }));
    }

    #[test]
    fn test_undefined_task_dependency_blocks_dispatch() {
        let flow = feature();
        let state = state_at(&flow, "implement");
        let fs = MemoryFs::new().with_file(
            format!("{DIR}/tasks.md"),
            "## Phase 1: A\n- [ ] T001 a\n- [ ] T002 b depends: [T003]\n",
        );
        match compute_next_instruction(&flow, &state, &fs, &config()).unwrap_err() {
            PipelineError::InvalidTasksDocument { errors, .. } => {
                assert_eq!(errors, vec!["T002 depends on undefined task T003"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_phased_step_without_tasks_document_is_plain() {
        let flow = feature();
        let state = state_at(&flow, "implement");
        let instr = compute_next_instruction(&flow, &state, &MemoryFs::new(), &config()).unwrap();
        match &instr.action {
            TeamAction::BashDispatch { phase, .. } => assert!(phase.is_none()),
            other => panic!("Expected BashDispatch, got {:?}", other),
        }
        assert!(instr.complete_command.ends_with("complete implement"));
    }

    #[test]
    fn test_gated_step_until_approved() {
        let flow = feature();
        let mut state = state_at(&flow, "implement");
        let mut config = config();
        config.gates.steps = vec!["impl*".to_string()];

        let instr = compute_next_instruction(&flow, &state, &fs(), &config).unwrap();
        match &instr.action {
            TeamAction::UserGate { step, options, .. } => {
                assert_eq!(step.as_deref(), Some("implement"));
                assert!(options.contains(&"approve".to_string()));
            }
            other => panic!("Expected UserGate, got {:?}", other),
        }
        assert!(instr.complete_command.ends_with(" approve"));

        state.approved_gates.push("implement".into());
        let instr = compute_next_instruction(&flow, &state, &fs(), &config).unwrap();
        assert_eq!(instr.action.kind(), "bash_dispatch");
    }

    #[test]
    fn test_awaiting_approval_and_parked_states() {
        let flow = feature();
        let mut state = state_at(&flow, "plan");
        state.status = PipelineStatus::AwaitingApproval;
        state.pending_approval = Some(PendingApproval {
            kind: "gate".into(),
            step: "plan".into(),
        });
        let instr = compute_next_instruction(&flow, &state, &fs(), &config()).unwrap();
        assert_eq!(instr.action.kind(), "user_gate");

        state.status = PipelineStatus::RateLimited;
        state.pending_approval = None;
        state.pause_reason = Some("rate limited while running 'plan'".into());
        let instr = compute_next_instruction(&flow, &state, &fs(), &config()).unwrap();
        match &instr.action {
            TeamAction::UserGate { message, options, .. } => {
                assert!(message.contains("rate limited"));
                assert_eq!(options, &vec!["resume".to_string()]);
            }
            other => panic!("Expected UserGate, got {:?}", other),
        }
        assert!(instr.complete_command.ends_with(" resume"));
    }

    #[test]
    fn test_done_when_all_completed() {
        let flow = feature();
        let mut state = state_at(&flow, "review");
        state.mark_completed("review");
        state.current = None;
        state.status = PipelineStatus::Completed;

        let instr = compute_next_instruction(&flow, &state, &fs(), &config()).unwrap();
        match &instr.action {
            TeamAction::Done { summary, artifacts } => {
                assert!(summary.contains("5 of 5"));
                assert!(artifacts.contains(&PathBuf::from("/work/feat/spec.md")));
                // research.md is declared but was never written.
                assert!(!artifacts.contains(&PathBuf::from("/work/feat/research.md")));
            }
            other => panic!("Expected Done, got {:?}", other),
        }
    }

    #[test]
    fn test_instruction_json_shape() {
        let flow = feature();
        let state = state_at(&flow, "specify");
        let instr = compute_next_instruction(&flow, &state, &fs(), &config()).unwrap();
        let json = serde_json::to_value(&instr).unwrap();
        assert_eq!(json["kind"], "bash_dispatch");
        assert_eq!(json["step"], "specify");
        assert_eq!(json["worker"]["role"], "worker");
        assert_eq!(json["worker"]["executor"], "claude");
        assert!(json["complete_command"].as_str().unwrap().contains("complete specify"));

        let back: Instruction = serde_json::from_value(json).unwrap();
        assert_eq!(back, instr);
    }

    #[test]
    fn test_command_quotes_unusual_paths() {
        assert_eq!(
            command(Path::new("/tmp/my feature"), "status"),
            "pipewright --feature-dir '/tmp/my feature' status"
        );
        assert_eq!(
            command(Path::new("/tmp/it's"), "status"),
            r"pipewright --feature-dir '/tmp/it'\''s' status"
        );
    }
}
