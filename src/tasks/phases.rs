//! Phase headings inside a tasks document.
//!
//! A heading looks like `## Phase 2: Core services` (two to four `#`, the
//! `:` or `-` separator optional). Each phase spans the lines from its own
//! heading up to the next emitted heading or the end of the document.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::LazyLock;

static PHASE_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*#{2,4}\s+phase\s+(\d+)\s*(?:[:-]\s*)?(.*?)\s*$").unwrap()
});

/// One phase of a tasks document. `start..end` is a 0-based, half-open
/// line range that includes the heading line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPhase {
    pub number: u32,
    pub name: String,
    pub start: usize,
    pub end: usize,
}

impl TaskPhase {
    pub fn contains_line(&self, line: usize) -> bool {
        (self.start..self.end).contains(&line)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseParse {
    pub phases: Vec<TaskPhase>,
    pub errors: Vec<String>,
}

impl PhaseParse {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn numbers(&self) -> Vec<u32> {
        self.phases.iter().map(|p| p.number).collect()
    }
}

/// Split a tasks document into phases.
///
/// Numbers must strictly increase. A heading that repeats or goes backwards
/// produces an error naming both numbers and is not emitted; its lines stay
/// in the preceding phase.
pub fn parse_phases(text: &str) -> PhaseParse {
    let lines: Vec<&str> = text.lines().collect();
    let mut result = PhaseParse::default();

    for (idx, line) in lines.iter().enumerate() {
        let Some(caps) = PHASE_HEADING.captures(line) else {
            continue;
        };
        let raw = &caps[1];
        let Ok(number) = raw.parse::<u32>() else {
            result.errors.push(format!(
                "line {}: phase number '{}' is out of range",
                idx + 1,
                raw
            ));
            continue;
        };

        if let Some(last) = result.phases.last_mut() {
            if number <= last.number {
                result.errors.push(format!(
                    "line {}: phase {} follows phase {}; phase numbers must strictly increase",
                    idx + 1,
                    number,
                    last.number
                ));
                continue;
            }
            last.end = idx;
        }

        result.phases.push(TaskPhase {
            number,
            name: caps[2].trim().to_string(),
            start: idx,
            end: lines.len(),
        });
    }

    result
}

/// First declared phase not in `completed`.
pub fn next_pending_phase<'a>(
    phases: &'a [TaskPhase],
    completed: &BTreeSet<u32>,
) -> Option<&'a TaskPhase> {
    phases.iter().find(|p| !completed.contains(&p.number))
}

/// Whether `completed` is exactly the first `completed.len()` declared
/// phases, with nothing undeclared in it.
pub fn is_completed_prefix(phases: &[TaskPhase], completed: &BTreeSet<u32>) -> bool {
    completed.len() <= phases.len()
        && phases
            .iter()
            .take(completed.len())
            .all(|p| completed.contains(&p.number))
}

/// The lines of `text` covered by `phase`.
pub fn phase_body(text: &str, phase: &TaskPhase) -> String {
    text.lines()
        .skip(phase.start)
        .take(phase.end.saturating_sub(phase.start))
        .collect::<Vec<_>>()
        .join("\n")
}
