//! Review-convergence engine.
//!
//! Reviewers report issues as plain text; a fixer answers with the ids it
//! fixed or rejected; the loop repeats until no Critical or High issue is
//! left or the iteration budget runs out.
//!
//! ## Components
//!
//! - [`types`]: severities, verdicts, issues and parsed outputs
//! - [`parser`]: line-oriented reviewer and fixer parsers
//! - [`convergence`]: the convergence policy and fixer summary
//! - [`cycle`]: persisted loop state driven by the runner
//!
//! ## Example
//!
//! ```
//! use pipewright::review::{check_convergence, parse_reviewer_output, Verdict};
//! use std::collections::BTreeSet;
//!
//! let output = parse_reviewer_output("C | panics on empty input | src/lib.rs:7\nVERDICT: NO-GO\n", "RV", 1);
//! assert_eq!(output.issues[0].id, "RV001");
//!
//! let fixed: BTreeSet<String> = ["RV001".to_string()].into_iter().collect();
//! let result = check_convergence(&[output], &fixed);
//! assert!(result.converged);
//! assert_eq!(result.verdict, Verdict::Go);
//! ```

pub mod convergence;
pub mod cycle;
pub mod parser;
pub mod types;

pub use convergence::{Convergence, SeverityCounts, check_convergence, summarize_issues_for_fixer};
pub use cycle::{CycleStep, CycleTurn, ReviewCycle, RoundRecord};
pub use parser::{issue_id, parse_fixer_output, parse_reviewer_output};
pub use types::{FixerOutput, RejectedIssue, ReviewIssue, ReviewerOutput, Severity, Verdict};
