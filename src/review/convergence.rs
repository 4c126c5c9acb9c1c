//! Convergence policy.
//!
//! Issues from every reviewer of a round are pooled, fixed ids are removed
//! and what remains is counted by severity. The loop has converged when no
//! Critical or High issue remains; Medium and Low never block.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

use super::types::{ReviewIssue, ReviewerOutput, Severity, Verdict};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl SeverityCounts {
    pub fn tally<'a>(issues: impl IntoIterator<Item = &'a ReviewIssue>) -> Self {
        let mut counts = Self::default();
        for issue in issues {
            match issue.severity {
                Severity::Critical => counts.critical += 1,
                Severity::High => counts.high += 1,
                Severity::Medium => counts.medium += 1,
                Severity::Low => counts.low += 1,
            }
        }
        counts
    }

    pub fn blocking(&self) -> usize {
        self.critical + self.high
    }

    pub fn total(&self) -> usize {
        self.critical + self.high + self.medium + self.low
    }
}

impl std::fmt::Display for SeverityCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "C:{} H:{} M:{} L:{}",
            self.critical, self.high, self.medium, self.low
        )
    }
}

/// Result of evaluating one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Convergence {
    pub converged: bool,
    pub verdict: Verdict,
    pub counts: SeverityCounts,
    /// Unfixed issues, in reviewer order.
    pub remaining: Vec<ReviewIssue>,
}

/// Pool the issues of `outputs`, drop `fixed_ids`, and apply the policy.
///
/// An id reported by more than one output counts once.
pub fn check_convergence(outputs: &[ReviewerOutput], fixed_ids: &BTreeSet<String>) -> Convergence {
    let mut seen = HashSet::new();
    let remaining: Vec<ReviewIssue> = outputs
        .iter()
        .flat_map(|o| o.issues.iter())
        .filter(|i| !fixed_ids.contains(&i.id))
        .filter(|i| seen.insert(i.id.clone()))
        .cloned()
        .collect();

    let counts = SeverityCounts::tally(&remaining);
    let converged = counts.blocking() == 0;
    let verdict = if !converged {
        Verdict::NoGo
    } else if counts.total() == 0 {
        Verdict::Go
    } else {
        Verdict::Conditional
    };

    Convergence {
        converged,
        verdict,
        counts,
        remaining,
    }
}

/// Render open issues for the fixer, most severe first, then by id.
pub fn summarize_issues_for_fixer(issues: &[ReviewIssue]) -> String {
    if issues.is_empty() {
        return "No open issues.".to_string();
    }

    let mut sorted: Vec<&ReviewIssue> = issues.iter().collect();
    sorted.sort_by(|a, b| a.severity.cmp(&b.severity).then_with(|| a.id.cmp(&b.id)));

    let mut out = String::new();
    for issue in sorted {
        out.push_str(&format!("- {}", issue));
        if let Some(persona) = &issue.persona {
            out.push_str(&format!(" <{}>", persona));
        }
        out.push('\n');
    }
    out
}
