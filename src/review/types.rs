//! Review issue and verdict types.
//!
//! ## Types
//!
//! - [`Severity`]: issue criticality, `C > H > M > L`
//! - [`Verdict`]: a reviewer's overall recommendation
//! - [`ReviewIssue`]: one parsed finding with its deterministic id
//! - [`ReviewerOutput`]: everything parsed from one reviewer run
//! - [`FixerOutput`]: fixed and rejected ids from one fixer run
//!
//! ## Example
//!
//! ```
//! use pipewright::review::types::{ReviewIssue, Severity};
//!
//! let issue = ReviewIssue::new("RV001", Severity::High, "unchecked index", "src/lib.rs:42")
//!     .with_persona("security");
//!
//! assert!(issue.severity.is_blocking());
//! assert_eq!(issue.to_string(), "RV001 [H] unchecked index (src/lib.rs:42)");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Issue severity. Ordered from most to least critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    #[serde(rename = "C")]
    Critical,
    #[serde(rename = "H")]
    High,
    #[serde(rename = "M")]
    Medium,
    #[serde(rename = "L")]
    Low,
}

impl Severity {
    /// Only Critical and High issues hold back convergence.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Critical | Self::High)
    }

    pub fn letter(&self) -> char {
        match self {
            Self::Critical => 'C',
            Self::High => 'H',
            Self::Medium => 'M',
            Self::Low => 'L',
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "C" | "CRITICAL" => Ok(Self::Critical),
            "H" | "HIGH" => Ok(Self::High),
            "M" | "MEDIUM" => Ok(Self::Medium),
            "L" | "LOW" => Ok(Self::Low),
            _ => anyhow::bail!("Invalid severity '{}'. Valid values: C, H, M, L", s),
        }
    }
}

/// A reviewer's overall recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "GO")]
    Go,
    #[serde(rename = "CONDITIONAL")]
    Conditional,
    #[serde(rename = "NO-GO")]
    NoGo,
}

impl Verdict {
    pub fn allows_progression(&self) -> bool {
        !matches!(self, Self::NoGo)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Go => "GO",
            Self::Conditional => "CONDITIONAL",
            Self::NoGo => "NO-GO",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Verdict {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace(['_', ' '], "-").as_str() {
            "GO" => Ok(Self::Go),
            "CONDITIONAL" => Ok(Self::Conditional),
            "NO-GO" | "NOGO" => Ok(Self::NoGo),
            _ => anyhow::bail!(
                "Invalid verdict '{}'. Valid values: GO, CONDITIONAL, NO-GO",
                s
            ),
        }
    }
}

/// One finding from a reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub id: String,
    pub severity: Severity,
    pub description: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
}

impl ReviewIssue {
    pub fn new(
        id: impl Into<String>,
        severity: Severity,
        description: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            severity,
            description: description.into(),
            location: location.into(),
            persona: None,
        }
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = Some(persona.into());
        self
    }
}

impl fmt::Display for ReviewIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.id, self.severity, self.description)?;
        if !self.location.is_empty() {
            write!(f, " ({})", self.location)?;
        }
        Ok(())
    }
}

/// Parsed output of one reviewer run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewerOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    pub raw: String,
    pub issues: Vec<ReviewIssue>,
    pub verdict: Option<Verdict>,
    pub has_verdict_line: bool,
}

impl ReviewerOutput {
    /// Attribute the output and each of its issues to a persona.
    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        let persona = persona.into();
        for issue in &mut self.issues {
            issue.persona = Some(persona.clone());
        }
        self.persona = Some(persona);
        self
    }

    pub fn blocking_count(&self) -> usize {
        self.issues.iter().filter(|i| i.severity.is_blocking()).count()
    }
}

/// An issue the fixer declined, with its reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedIssue {
    pub id: String,
    pub reason: String,
}

/// Parsed output of one fixer run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixerOutput {
    pub fixed: Vec<String>,
    pub rejected: Vec<RejectedIssue>,
}

impl FixerOutput {
    pub fn is_empty(&self) -> bool {
        self.fixed.is_empty() && self.rejected.is_empty()
    }
}
