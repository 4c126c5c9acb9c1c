//! Line-oriented parsers for reviewer and fixer output.
//!
//! The formats are loose on purpose: agents add bullets, bold markers and
//! chatter around the lines that matter. Anything that does not match is
//! ignored (reviewers) or ends the current block (fixers).

use regex::Regex;
use std::sync::LazyLock;

use super::types::{FixerOutput, RejectedIssue, ReviewIssue, ReviewerOutput, Severity, Verdict};

// `C | description | location`, optionally bulleted, severity optionally bracketed
static ISSUE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:[-*]\s+)?\[?(C|H|M|L|CRITICAL|HIGH|MEDIUM|LOW)\]?\s*\|\s*([^|]*?\S[^|]*?)\s*\|\s*(.*?)\s*$",
    )
    .unwrap()
});

static VERDICT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:[-*]\s+)?\**verdict\**\s*:\s*\**\s*(NO[- _]?GO|CONDITIONAL|GO)\b").unwrap()
});

static BLOCK_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:#+\s*)?\**(FIXED|REJECTED)\**\s*:\s*(.*)$").unwrap()
});

static ID_LIST_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*]\s+)?[A-Za-z]+\d+(?:\s*,?\s*[A-Za-z]+\d+)*\s*,?\s*$").unwrap()
});

static REJECTED_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*]\s+)?([A-Za-z]+\d+)\s*[:-]\s*(.+?)\s*$").unwrap()
});

static ISSUE_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[A-Za-z]+\d+\b").unwrap());

/// Format the id of the `seq`-th issue of a cycle.
pub fn issue_id(prefix: &str, seq: u32) -> String {
    format!("{}{:03}", prefix, seq)
}

/// Parse one reviewer's raw output.
///
/// The k-th matching issue line (0-based) gets id `prefix + pad(start_id + k)`
/// so several reviewers in one cycle can share a sequence. Only the first
/// verdict line counts.
pub fn parse_reviewer_output(raw: &str, id_prefix: &str, start_id: u32) -> ReviewerOutput {
    let mut issues = Vec::new();
    let mut verdict = None;
    let mut has_verdict_line = false;

    for line in raw.lines() {
        if let Some(caps) = ISSUE_LINE.captures(line)
            && let Ok(severity) = caps[1].parse::<Severity>()
        {
            let seq = start_id + issues.len() as u32;
            issues.push(ReviewIssue::new(
                issue_id(id_prefix, seq),
                severity,
                &caps[2],
                &caps[3],
            ));
            continue;
        }

        if !has_verdict_line && let Some(caps) = VERDICT_LINE.captures(line) {
            has_verdict_line = true;
            verdict = caps[1].parse::<Verdict>().ok();
        }
    }

    ReviewerOutput {
        persona: None,
        raw: raw.to_string(),
        issues,
        verdict,
        has_verdict_line,
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Block {
    None,
    Fixed,
    Rejected,
}

fn push_fixed(out: &mut FixerOutput, text: &str) {
    for m in ISSUE_ID.find_iter(text) {
        let id = m.as_str().to_string();
        if !out.fixed.contains(&id) {
            out.fixed.push(id);
        }
    }
}

/// Parse a fixer's raw output into fixed and rejected ids.
///
/// Blank lines inside a block are skipped. Any other line that does not
/// fit the current block closes it.
pub fn parse_fixer_output(raw: &str) -> FixerOutput {
    let mut out = FixerOutput::default();
    let mut block = Block::None;

    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }

        if let Some(caps) = BLOCK_HEADER.captures(line) {
            let inline = caps[2].trim();
            if caps[1].eq_ignore_ascii_case("fixed") {
                block = Block::Fixed;
                if ID_LIST_LINE.is_match(inline) {
                    push_fixed(&mut out, inline);
                }
            } else {
                block = Block::Rejected;
                if let Some(rej) = REJECTED_LINE.captures(inline) {
                    out.rejected.push(RejectedIssue {
                        id: rej[1].to_string(),
                        reason: rej[2].to_string(),
                    });
                }
            }
            continue;
        }

        match block {
            Block::Fixed if ID_LIST_LINE.is_match(line) => push_fixed(&mut out, line),
            Block::Rejected => match REJECTED_LINE.captures(line) {
                Some(rej) => out.rejected.push(RejectedIssue {
                    id: rej[1].to_string(),
                    reason: rej[2].to_string(),
                }),
                None => block = Block::None,
            },
            _ => block = Block::None,
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reviewer_issues_and_verdict() {
        let raw = "Looked at everything.\n\
                   C | SQL built by string concat | src/db.rs:10\n\
                   - [H] | missing auth check | src/api.rs\n\
                   * M | naming | \n\
                   VERDICT: NO-GO\n";
        let out = parse_reviewer_output(raw, "RV", 1);

        assert_eq!(out.issues.len(), 3);
        assert_eq!(out.issues[0].id, "RV001");
        assert_eq!(out.issues[0].severity, Severity::Critical);
        assert_eq!(out.issues[0].description, "SQL built by string concat");
        assert_eq!(out.issues[0].location, "src/db.rs:10");
        assert_eq!(out.issues[1].id, "RV002");
        assert_eq!(out.issues[1].severity, Severity::High);
        assert_eq!(out.issues[2].location, "");
        assert!(out.has_verdict_line);
        assert_eq!(out.verdict, Some(Verdict::NoGo));
    }

    #[test]
    fn test_ids_continue_from_start_id() {
        let raw = "L | a | x\nM | b | y\nH | c | z\n";
        let out = parse_reviewer_output(raw, "SEC", 7);
        let ids: Vec<&str> = out.issues.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["SEC007", "SEC008", "SEC009"]);
    }

    #[test]
    fn test_issue_id_padding() {
        assert_eq!(issue_id("RV", 1), "RV001");
        assert_eq!(issue_id("RV", 42), "RV042");
        assert_eq!(issue_id("RV", 1234), "RV1234");
    }

    #[test]
    fn test_missing_verdict_is_reported() {
        let out = parse_reviewer_output("H | bad | here\nLooks mostly fine.\n", "RV", 1);
        assert!(!out.has_verdict_line);
        assert_eq!(out.verdict, None);
    }

    #[test]
    fn test_first_verdict_line_wins() {
        let out = parse_reviewer_output("VERDICT: GO\nverdict: no-go\n", "RV", 1);
        assert_eq!(out.verdict, Some(Verdict::Go));
    }

    #[test]
    fn test_verdict_variants() {
        let cases = [
            ("**VERDICT:** CONDITIONAL", Verdict::Conditional),
            ("Verdict: NO GO", Verdict::NoGo),
            ("- VERDICT: NOGO", Verdict::NoGo),
            ("VERDICT: GO (ship it)", Verdict::Go),
        ];
        for (line, expected) in cases {
            let out = parse_reviewer_output(line, "RV", 1);
            assert_eq!(out.verdict, Some(expected), "line: {}", line);
        }
    }

    #[test]
    fn test_non_issue_pipes_ignored() {
        let raw = "| Column | Other |\nX | not a severity | here\nC || empty description\n";
        let out = parse_reviewer_output(raw, "RV", 1);
        assert!(out.issues.is_empty());
    }

    #[test]
    fn test_full_severity_words() {
        let out = parse_reviewer_output("CRITICAL | boom | a.rs\nlow | nit | b.rs\n", "RV", 1);
        assert_eq!(out.issues[0].severity, Severity::Critical);
        assert_eq!(out.issues[1].severity, Severity::Low);
    }

    #[test]
    fn test_parse_fixer_blocks() {
        let raw = "Done.\n\nFIXED:\n- RV001\n- RV003\n\nREJECTED:\n- RV002: intended behaviour\nRV004 - out of scope\n";
        let out = parse_fixer_output(raw);
        assert_eq!(out.fixed, vec!["RV001", "RV003"]);
        assert_eq!(out.rejected.len(), 2);
        assert_eq!(out.rejected[0].id, "RV002");
        assert_eq!(out.rejected[0].reason, "intended behaviour");
        assert_eq!(out.rejected[1].id, "RV004");
        assert_eq!(out.rejected[1].reason, "out of scope");
    }

    #[test]
    fn test_fixer_inline_lists() {
        let out = parse_fixer_output("FIXED: RV001, RV002\nREJECTED: RV003: wontfix\n");
        assert_eq!(out.fixed, vec!["RV001", "RV002"]);
        assert_eq!(out.rejected[0].id, "RV003");
    }

    #[test]
    fn test_unrecognized_line_ends_block() {
        let raw = "FIXED:\nRV001\nI also refactored the parser.\nRV002\n";
        let out = parse_fixer_output(raw);
        assert_eq!(out.fixed, vec!["RV001"]);
    }

    #[test]
    fn test_fixer_headers_with_markup_and_dedup() {
        let out = parse_fixer_output("## **Fixed**:\n- RV001\n- RV001\n");
        assert_eq!(out.fixed, vec!["RV001"]);
    }

    #[test]
    fn test_fixer_nothing_recognized() {
        let out = parse_fixer_output("I fixed some stuff.\nFIXED: none\n");
        assert!(out.is_empty());
    }
}
