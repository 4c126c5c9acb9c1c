//! Pipeline lifecycle commands: `pipewright intake`, `next`, `complete`,
//! `complete-phase`, `fail`, `approve`, `resume`, `pause` and `status`.

use anyhow::{Context as _, Result};
use std::path::Path;

use pipewright::orchestrator::{
    AssumeCommitted, CommitAcknowledged, Instruction, PipelineStatus, StatusReport, TeamAction,
};
use pipewright::scratch::PromptStaging;

use super::{Context, print_json, read_input};

pub fn cmd_intake(
    ctx: &Context,
    flow: Option<&str>,
    variant: Option<&str>,
    condition: Option<&str>,
) -> Result<()> {
    let config = ctx.load_config()?;
    let flow = flow.unwrap_or(&config.toml.project.default_flow).to_string();
    let condition = condition.map(|raw| {
        serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
    });

    let state = ctx.runner(&config).intake(&flow, variant, condition)?;
    print_json(&state)
}

pub fn cmd_next(ctx: &Context, prompt_dir: Option<&Path>) -> Result<()> {
    let config = ctx.load_config()?;
    let instruction = ctx.runner(&config).next_instruction()?;

    let Some(dir) = prompt_dir else {
        return print_json(&instruction);
    };

    let files = stage_prompts(&instruction, dir)?;
    let mut value = serde_json::to_value(&instruction).context("Failed to serialize instruction")?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("prompt_files".to_string(), serde_json::to_value(files)?);
    }
    print_json(&value)
}

/// Write the prompts of `instruction` into `dir`, replacing what was there.
fn stage_prompts(instruction: &Instruction, dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut staging = PromptStaging::new(dir)?;
    match &instruction.action {
        TeamAction::BashDispatch { step, prompt, phase, .. } => {
            let name = match phase {
                Some(phase) => format!("{}-phase-{}.md", step, phase.number),
                None => format!("{}.md", step),
            };
            staging.write_prompt(&name, prompt)?;
        }
        TeamAction::BashReviewDispatch {
            step,
            review_prompt,
            fixer_base_prompt,
            fixer_prompt,
            ..
        } => {
            staging.write_prompt(&format!("{}-review.md", step), review_prompt)?;
            staging.write_prompt(&format!("{}-fixer-base.md", step), fixer_base_prompt)?;
            if let Some(fixer) = fixer_prompt {
                staging.write_prompt(&format!("{}-fixer.md", step), fixer)?;
            }
        }
        TeamAction::UserGate { .. } | TeamAction::Done { .. } => {}
    }
    staging.commit()
}

pub fn cmd_complete(ctx: &Context, step: &str) -> Result<()> {
    let config = ctx.load_config()?;
    let state = ctx.runner(&config).complete_step(step)?;
    print_json(&state)
}

pub fn cmd_complete_phase(ctx: &Context, phase: u32, committed: bool) -> Result<()> {
    let config = ctx.load_config()?;
    let runner = ctx.runner(&config);
    let runner = if config.toml.implement.require_commit {
        runner.with_continuation(Box::new(CommitAcknowledged(committed)))
    } else {
        runner.with_continuation(Box::new(AssumeCommitted))
    };
    let outcome = runner.complete_phase(phase)?;
    print_json(&outcome)
}

pub fn cmd_fail(
    ctx: &Context,
    step: &str,
    exit_code: Option<i32>,
    output_file: Option<&Path>,
) -> Result<()> {
    let config = ctx.load_config()?;
    let output = match output_file {
        Some(path) => read_input(path)?,
        None => String::new(),
    };
    let outcome = ctx.runner(&config).fail_step(step, exit_code, &output)?;
    print_json(&outcome)
}

pub fn cmd_approve(ctx: &Context) -> Result<()> {
    let config = ctx.load_config()?;
    let state = ctx.runner(&config).approve()?;
    print_json(&state)
}

pub fn cmd_resume(ctx: &Context) -> Result<()> {
    let config = ctx.load_config()?;
    let runner = ctx.runner(&config);
    let state = runner.resume()?;
    let state = if state.status.is_parked() {
        runner.resume_parked()?
    } else {
        state
    };
    print_json(&state)
}

pub fn cmd_pause(ctx: &Context, reason: &str) -> Result<()> {
    let config = ctx.load_config()?;
    let state = ctx.runner(&config).pause(reason)?;
    print_json(&state)
}

pub fn cmd_status(ctx: &Context, text: bool) -> Result<()> {
    let config = ctx.load_config()?;
    let report = ctx.runner(&config).status()?;
    if text {
        print_status(&report);
        Ok(())
    } else {
        print_json(&report)
    }
}

fn print_status(report: &StatusReport) {
    let status = match report.status {
        PipelineStatus::Active => console::style(report.status.to_string()).green(),
        PipelineStatus::Completed => console::style(report.status.to_string()).green().bold(),
        PipelineStatus::AwaitingApproval => console::style(report.status.to_string()).cyan(),
        PipelineStatus::Paused | PipelineStatus::RateLimited => {
            console::style(report.status.to_string()).yellow()
        }
    };

    println!();
    println!("{} {}", console::style("Pipeline").bold(), report.feature_dir.display());
    match &report.variant {
        Some(variant) => println!("  Flow:    {} ({})", report.flow, variant),
        None => println!("  Flow:    {}", report.flow),
    }
    println!("  Status:  {}", status);
    if let Some(reason) = &report.pause_reason {
        println!("  Reason:  {}", reason);
    }
    if let Some(pending) = &report.pending_approval {
        println!("  Waiting: {} on '{}'", pending.kind, pending.step);
    }
    println!();

    for step in &report.pipeline {
        let marker = if report.completed.contains(step) {
            console::style("✓").green()
        } else if report.current.as_deref() == Some(step.as_str()) {
            console::style("▶").cyan()
        } else {
            console::style("·").dim()
        };
        println!("  {} {}", marker, step);
    }

    if let Some(phases) = &report.phases {
        println!();
        println!(
            "  Phases:  {}/{} done{}",
            phases.completed.len(),
            phases.declared.len(),
            phases
                .next
                .map(|n| format!(", next {}", n))
                .unwrap_or_default()
        );
    }
    if let Some(review) = &report.review {
        println!();
        println!(
            "  Review:  {} iteration {}/{}, open {}{}",
            review.step,
            review.iteration,
            review.max_iterations,
            review.open,
            if review.escalated {
                console::style(" (escalated)").red().to_string()
            } else {
                String::new()
            }
        );
    }
    if report.retries > 0 {
        println!("  Retries: {}", report.retries);
    }
    println!(
        "  Updated: {}",
        console::style(report.updated_at.format("%Y-%m-%d %H:%M:%S UTC")).dim()
    );
    println!();
}
