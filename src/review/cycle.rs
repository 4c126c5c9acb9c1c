//! Persisted state of one review-convergence loop.
//!
//! A cycle alternates between two turns: a round of reviewer outputs, then
//! one fixer output. Issue ids keep counting across rounds so every issue of
//! the cycle has a unique id. The cycle escalates when the last allowed
//! review round still has blocking issues.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use super::convergence::{Convergence, SeverityCounts, check_convergence, summarize_issues_for_fixer};
use super::parser::parse_reviewer_output;
use super::types::{FixerOutput, RejectedIssue, ReviewIssue, ReviewerOutput, Verdict};
use crate::errors::PipelineError;

/// Whose output the cycle expects next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleTurn {
    #[default]
    Reviews,
    Fix,
}

/// Summary of one completed review round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub iteration: u32,
    pub counts: SeverityCounts,
    pub verdict: Verdict,
}

/// What the caller has to do after feeding the cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleStep {
    /// No Critical or High issue remains; the step is done.
    Converged { convergence: Convergence },
    /// Dispatch the fixer with this summary, then review again.
    NeedsFix { iteration: u32, summary: String },
    /// These reviewers printed no verdict line; re-prompt them and resubmit
    /// the whole round. Nothing was recorded.
    MissingVerdict { personas: Vec<String> },
    /// The iteration budget is spent with blocking issues left.
    Escalated { convergence: Convergence },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewCycle {
    pub step: String,
    /// 1-based number of the current review round.
    pub iteration: u32,
    pub max_iterations: u32,
    pub id_prefix: String,
    /// Sequence number the next parsed issue receives.
    pub next_issue_id: u32,
    #[serde(default)]
    pub turn: CycleTurn,
    /// Issues still open after the latest round.
    #[serde(default)]
    pub open_issues: Vec<ReviewIssue>,
    #[serde(default)]
    pub fixed: BTreeSet<String>,
    #[serde(default)]
    pub rejected: Vec<RejectedIssue>,
    #[serde(default)]
    pub rounds: Vec<RoundRecord>,
    #[serde(default)]
    pub escalated: bool,
}

impl ReviewCycle {
    pub fn begin(step: &str, max_iterations: u32, id_prefix: &str) -> Self {
        debug!(step, max_iterations, "review cycle started");
        Self {
            step: step.to_string(),
            iteration: 1,
            max_iterations: max_iterations.max(1),
            id_prefix: id_prefix.to_string(),
            next_issue_id: 1,
            turn: CycleTurn::Reviews,
            open_issues: Vec::new(),
            fixed: BTreeSet::new(),
            rejected: Vec::new(),
            rounds: Vec::new(),
            escalated: false,
        }
    }

    /// Parse a round of `(persona, raw)` reviewer outputs with this cycle's
    /// id sequence. Does not record anything.
    pub fn parse_round(&self, submissions: &[(String, String)]) -> Vec<ReviewerOutput> {
        let mut next = self.next_issue_id;
        submissions
            .iter()
            .map(|(persona, raw)| {
                let output = parse_reviewer_output(raw, &self.id_prefix, next).with_persona(persona);
                next += output.issues.len() as u32;
                output
            })
            .collect()
    }

    /// Record a round of reviewer outputs and decide what comes next.
    pub fn ingest_reviews(&mut self, outputs: &[ReviewerOutput]) -> Result<CycleStep, PipelineError> {
        if self.turn != CycleTurn::Reviews || self.escalated {
            return Err(PipelineError::ReviewOutOfTurn {
                step: self.step.clone(),
                expected: "a fixer output",
            });
        }

        let missing: Vec<String> = outputs
            .iter()
            .filter(|o| !o.has_verdict_line)
            .map(|o| o.persona.clone().unwrap_or_else(|| "reviewer".to_string()))
            .collect();
        if !missing.is_empty() {
            warn!(step = %self.step, personas = ?missing, "reviewer output without verdict line");
            return Ok(CycleStep::MissingVerdict { personas: missing });
        }

        self.next_issue_id += outputs.iter().map(|o| o.issues.len() as u32).sum::<u32>();
        let convergence = check_convergence(outputs, &self.fixed);
        self.open_issues = convergence.remaining.clone();
        self.rounds.push(RoundRecord {
            iteration: self.iteration,
            counts: convergence.counts,
            verdict: convergence.verdict,
        });

        if convergence.converged {
            info!(
                step = %self.step,
                iteration = self.iteration,
                verdict = %convergence.verdict,
                "review converged"
            );
            return Ok(CycleStep::Converged { convergence });
        }

        if self.iteration >= self.max_iterations {
            self.escalated = true;
            warn!(
                step = %self.step,
                iterations = self.iteration,
                open = %convergence.counts,
                "review did not converge; escalating"
            );
            return Ok(CycleStep::Escalated { convergence });
        }

        self.turn = CycleTurn::Fix;
        Ok(CycleStep::NeedsFix {
            iteration: self.iteration,
            summary: self.fixer_summary(),
        })
    }

    /// Record the fixer's claims and hand the turn back to the reviewers.
    ///
    /// Ids that are not open in this cycle are ignored. Returns the
    /// convergence the claims would reach if the next review confirms them.
    pub fn ingest_fix(&mut self, fix: &FixerOutput) -> Result<Convergence, PipelineError> {
        if self.turn != CycleTurn::Fix {
            return Err(PipelineError::ReviewOutOfTurn {
                step: self.step.clone(),
                expected: "reviewer outputs",
            });
        }

        let open: BTreeSet<&str> = self.open_issues.iter().map(|i| i.id.as_str()).collect();
        for id in &fix.fixed {
            if open.contains(id.as_str()) {
                self.fixed.insert(id.clone());
            } else {
                debug!(step = %self.step, id = %id, "fixer reported unknown issue id");
            }
        }
        for rejected in &fix.rejected {
            if open.contains(rejected.id.as_str()) {
                self.rejected.push(rejected.clone());
            }
        }

        let projected = check_convergence(
            &[ReviewerOutput {
                persona: None,
                raw: String::new(),
                issues: self.open_issues.clone(),
                verdict: None,
                has_verdict_line: true,
            }],
            &self.fixed,
        );

        self.iteration += 1;
        self.turn = CycleTurn::Reviews;
        debug!(
            step = %self.step,
            iteration = self.iteration,
            projected = %projected.counts,
            "fix recorded"
        );
        Ok(projected)
    }

    /// Issue summary for the next fixer turn.
    pub fn fixer_summary(&self) -> String {
        let open: Vec<ReviewIssue> = self
            .open_issues
            .iter()
            .filter(|i| !self.fixed.contains(&i.id))
            .cloned()
            .collect();
        summarize_issues_for_fixer(&open)
    }

    /// The latest round let the step progress and the cycle is not
    /// escalated.
    pub fn has_converged(&self) -> bool {
        !self.escalated
            && self
                .rounds
                .last()
                .is_some_and(|r| r.verdict.allows_progression())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::parser::parse_fixer_output;

    fn round(cycle: &ReviewCycle, raws: &[(&str, &str)]) -> Vec<ReviewerOutput> {
        let subs: Vec<(String, String)> = raws
            .iter()
            .map(|(p, r)| (p.to_string(), r.to_string()))
            .collect();
        cycle.parse_round(&subs)
    }

    #[test]
    fn test_converges_first_round() {
        let mut cycle = ReviewCycle::begin("review", 3, "RV");
        let outputs = round(&cycle, &[("correctness", "L | nit | a.rs\nVERDICT: GO\n")]);
        match cycle.ingest_reviews(&outputs).unwrap() {
            CycleStep::Converged { convergence } => {
                assert_eq!(convergence.verdict, Verdict::Conditional);
            }
            other => panic!("Expected Converged, got {:?}", other),
        }
        assert_eq!(cycle.rounds.len(), 1);
        assert!(cycle.has_converged());
    }

    #[test]
    fn test_has_converged_tracks_latest_round() {
        let mut cycle = ReviewCycle::begin("review", 3, "RV");
        assert!(!cycle.has_converged());

        let outputs = round(&cycle, &[("correctness", "H | leak | a.rs\nVERDICT: NO-GO\n")]);
        cycle.ingest_reviews(&outputs).unwrap();
        assert!(!cycle.has_converged());

        cycle.ingest_fix(&parse_fixer_output("FIXED: RV001\n")).unwrap();
        assert!(!cycle.has_converged());

        let outputs = round(&cycle, &[("correctness", "VERDICT: GO\n")]);
        cycle.ingest_reviews(&outputs).unwrap();
        assert!(cycle.has_converged());

        cycle.escalated = true;
        assert!(!cycle.has_converged());
    }

    #[test]
    fn test_ids_continue_across_reviewers_and_rounds() {
        let mut cycle = ReviewCycle::begin("review", 3, "RV");
        let outputs = round(
            &cycle,
            &[
                ("correctness", "C | a | x\nVERDICT: NO-GO\n"),
                ("security", "H | b | y\nM | c | z\nVERDICT: NO-GO\n"),
            ],
        );
        let ids: Vec<&str> = outputs
            .iter()
            .flat_map(|o| o.issues.iter().map(|i| i.id.as_str()))
            .collect();
        assert_eq!(ids, vec!["RV001", "RV002", "RV003"]);
        assert_eq!(outputs[1].issues[0].persona.as_deref(), Some("security"));

        cycle.ingest_reviews(&outputs).unwrap();
        cycle
            .ingest_fix(&parse_fixer_output("FIXED:\nRV001\nRV002\n"))
            .unwrap();

        let second = round(&cycle, &[("correctness", "H | d | w\nVERDICT: NO-GO\n")]);
        assert_eq!(second[0].issues[0].id, "RV004");
    }

    #[test]
    fn test_full_loop_needs_fix_then_converges() {
        let mut cycle = ReviewCycle::begin("review", 3, "RV");
        let outputs = round(&cycle, &[("correctness", "C | crash | a.rs\nVERDICT: NO-GO\n")]);

        match cycle.ingest_reviews(&outputs).unwrap() {
            CycleStep::NeedsFix { iteration, summary } => {
                assert_eq!(iteration, 1);
                assert!(summary.contains("RV001 [C] crash"));
            }
            other => panic!("Expected NeedsFix, got {:?}", other),
        }
        assert_eq!(cycle.turn, CycleTurn::Fix);

        let projected = cycle.ingest_fix(&parse_fixer_output("FIXED: RV001\n")).unwrap();
        assert!(projected.converged);
        assert_eq!(cycle.iteration, 2);
        assert_eq!(cycle.turn, CycleTurn::Reviews);

        let outputs = round(&cycle, &[("correctness", "VERDICT: GO\n")]);
        assert!(matches!(
            cycle.ingest_reviews(&outputs).unwrap(),
            CycleStep::Converged { .. }
        ));
    }

    #[test]
    fn test_escalates_at_max_iterations() {
        let mut cycle = ReviewCycle::begin("review", 2, "RV");
        let bad = "H | still broken | a.rs\nVERDICT: NO-GO\n";

        let outputs = round(&cycle, &[("correctness", bad)]);
        assert!(matches!(
            cycle.ingest_reviews(&outputs).unwrap(),
            CycleStep::NeedsFix { .. }
        ));
        cycle.ingest_fix(&FixerOutput::default()).unwrap();

        let outputs = round(&cycle, &[("correctness", bad)]);
        match cycle.ingest_reviews(&outputs).unwrap() {
            CycleStep::Escalated { convergence } => {
                assert_eq!(convergence.verdict, Verdict::NoGo);
            }
            other => panic!("Expected Escalated, got {:?}", other),
        }
        assert!(cycle.escalated);
        assert!(cycle.ingest_reviews(&outputs).is_err());
    }

    #[test]
    fn test_missing_verdict_records_nothing() {
        let mut cycle = ReviewCycle::begin("review", 3, "RV");
        let outputs = round(
            &cycle,
            &[
                ("correctness", "H | a | x\nVERDICT: NO-GO\n"),
                ("security", "H | b | y\n"),
            ],
        );
        match cycle.ingest_reviews(&outputs).unwrap() {
            CycleStep::MissingVerdict { personas } => assert_eq!(personas, vec!["security"]),
            other => panic!("Expected MissingVerdict, got {:?}", other),
        }
        assert_eq!(cycle.next_issue_id, 1);
        assert!(cycle.rounds.is_empty());
        assert_eq!(cycle.turn, CycleTurn::Reviews);
    }

    #[test]
    fn test_out_of_turn_submissions_rejected() {
        let mut cycle = ReviewCycle::begin("review", 3, "RV");
        let err = cycle.ingest_fix(&FixerOutput::default()).unwrap_err();
        assert!(matches!(err, PipelineError::ReviewOutOfTurn { .. }));

        let outputs = round(&cycle, &[("c", "H | a | x\nVERDICT: NO-GO\n")]);
        cycle.ingest_reviews(&outputs).unwrap();
        let err = cycle.ingest_reviews(&outputs).unwrap_err();
        assert!(matches!(err, PipelineError::ReviewOutOfTurn { .. }));
    }

    #[test]
    fn test_fix_ignores_unknown_ids_and_keeps_rejections() {
        let mut cycle = ReviewCycle::begin("review", 3, "RV");
        let outputs = round(&cycle, &[("c", "H | a | x\nM | b | y\nVERDICT: NO-GO\n")]);
        cycle.ingest_reviews(&outputs).unwrap();

        let projected = cycle
            .ingest_fix(&parse_fixer_output("FIXED: RV001, RV999\nREJECTED:\nRV002: matches the documented API\n"))
            .unwrap();
        assert!(cycle.fixed.contains("RV001"));
        assert!(!cycle.fixed.contains("RV999"));
        assert_eq!(cycle.rejected.len(), 1);
        assert!(projected.converged);
        assert_eq!(projected.verdict, Verdict::Conditional);
    }

    #[test]
    fn test_cycle_serde_round_trip() {
        let mut cycle = ReviewCycle::begin("review", 3, "RV");
        let outputs = round(&cycle, &[("c", "C | a | x\nVERDICT: NO-GO\n")]);
        cycle.ingest_reviews(&outputs).unwrap();

        let json = serde_json::to_string(&cycle).unwrap();
        let back: ReviewCycle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cycle);
        assert_eq!(back.turn, CycleTurn::Fix);
    }
}
