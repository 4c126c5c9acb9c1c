//! Tasks document validation: `pipewright tasks`.

use anyhow::{Result, bail};
use std::path::Path;

use pipewright::tasks::{TASKS_FILE, parse_phases, parse_tasks};

use super::{Context, print_json, read_input};

pub fn cmd_tasks(ctx: &Context, file: Option<&Path>) -> Result<()> {
    let path = match file {
        Some(path) => path.to_path_buf(),
        None => ctx.feature_dir.join(TASKS_FILE),
    };
    let text = read_input(&path)?;

    let phases = parse_phases(&text);
    let report = parse_tasks(&text);
    for warning in &report.warnings {
        tracing::warn!("{}", warning);
    }

    print_json(&serde_json::json!({
        "file": path,
        "valid": report.valid,
        "phases": phases.phases,
        "tasks": report.tasks,
        "errors": report.errors,
        "warnings": report.warnings,
    }))?;

    if !report.valid {
        bail!(
            "Tasks document {} has {} error(s)",
            path.display(),
            report.errors.len()
        );
    }
    Ok(())
}
