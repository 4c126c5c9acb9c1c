//! Flow definition types.
//!
//! A flow is an ordered list of step names plus per-step metadata: which
//! files a step should see, which of them are inlined into the prompt,
//! which artifacts the step produces, and which steps are review steps.
//!
//! ## YAML shape
//!
//! ```yaml
//! feature:
//!   steps: [specify, plan, tasks, implement, review]
//!   reviews: [review]
//!   conditionals:
//!     - { step: clarify, when: needs-clarification }
//!   context:
//!     plan: { spec: spec.md }
//!     review: { feature: "*" }
//!   inject:
//!     plan: [spec]
//!   artifacts:
//!     plan: [plan.md, research.md]
//!     implement: "*"
//!   prerequisites:
//!     plan: [specify]
//!   phased: [implement]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Context reference meaning "the whole feature directory".
pub const WHOLE_FEATURE_DIR: &str = "*";

/// What a step is expected to produce.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawArtifact", into = "RawArtifact")]
pub enum ArtifactSpec {
    /// Nothing declared; the prompt uses a generic output phrase.
    #[default]
    None,
    /// Every file in the feature directory (`"*"`).
    All,
    /// One file, relative to the feature directory.
    Single(String),
    /// Several files, relative to the feature directory.
    Many(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawArtifact {
    Many(Vec<String>),
    One(String),
    Nothing,
}

impl From<RawArtifact> for ArtifactSpec {
    fn from(raw: RawArtifact) -> Self {
        match raw {
            RawArtifact::Nothing => ArtifactSpec::None,
            RawArtifact::One(s) if s == WHOLE_FEATURE_DIR => ArtifactSpec::All,
            RawArtifact::One(s) => ArtifactSpec::Single(s),
            RawArtifact::Many(list) if list.is_empty() => ArtifactSpec::None,
            RawArtifact::Many(list) => ArtifactSpec::Many(list),
        }
    }
}

impl From<ArtifactSpec> for RawArtifact {
    fn from(spec: ArtifactSpec) -> Self {
        match spec {
            ArtifactSpec::None => RawArtifact::Nothing,
            ArtifactSpec::All => RawArtifact::One(WHOLE_FEATURE_DIR.to_string()),
            ArtifactSpec::Single(s) => RawArtifact::One(s),
            ArtifactSpec::Many(list) => RawArtifact::Many(list),
        }
    }
}

impl ArtifactSpec {
    /// Declared paths, relative to the feature directory. `All` and `None`
    /// declare no individual paths.
    pub fn declared(&self) -> Vec<String> {
        match self {
            ArtifactSpec::None | ArtifactSpec::All => Vec::new(),
            ArtifactSpec::Single(s) => vec![s.clone()],
            ArtifactSpec::Many(list) => list.clone(),
        }
    }

    /// Declared paths joined onto the feature directory.
    pub fn resolve(&self, feature_dir: &Path) -> Vec<PathBuf> {
        self.declared()
            .iter()
            .map(|p| feature_dir.join(p))
            .collect()
    }

    pub fn is_none(&self) -> bool {
        matches!(self, ArtifactSpec::None)
    }
}

/// A step that only joins the pipeline under a condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Conditional {
    /// Included whenever the pipeline carries a truthy condition value.
    Step(String),
    /// Included when the condition value renders to exactly `when`.
    When { step: String, when: String },
}

impl Conditional {
    pub fn step(&self) -> &str {
        match self {
            Conditional::Step(step) => step,
            Conditional::When { step, .. } => step,
        }
    }

    /// Whether the step is included for the given condition value.
    pub fn applies(&self, condition: Option<&serde_json::Value>) -> bool {
        let Some(value) = condition else {
            return false;
        };
        match self {
            Conditional::Step(_) => is_truthy(value),
            Conditional::When { when, .. } => condition_text(value).as_deref() == Some(when.as_str()),
        }
    }
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
        serde_json::Value::Number(_) => true,
    }
}

fn condition_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A named workflow: ordered steps plus per-step metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// Ordered step names.
    pub steps: Vec<String>,
    /// Steps that run the review-convergence loop instead of a plain dispatch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reviews: Vec<String>,
    /// Steps included only under a condition.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditionals: Vec<Conditional>,
    /// step -> (context key -> file reference relative to the feature dir)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, BTreeMap<String, String>>,
    /// step -> context keys whose content is embedded in the prompt
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inject: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, ArtifactSpec>,
    /// step -> steps that must be completed before it
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub prerequisites: BTreeMap<String, Vec<String>>,
    /// Steps dispatched phase by phase from the tasks document.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phased: Vec<String>,
}

impl FlowDefinition {
    pub fn new<S: Into<String>>(steps: impl IntoIterator<Item = S>) -> Self {
        Self {
            steps: steps.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_review(mut self, step: &str) -> Self {
        self.reviews.push(step.to_string());
        self
    }

    pub fn with_conditional(mut self, conditional: Conditional) -> Self {
        self.conditionals.push(conditional);
        self
    }

    pub fn with_context(mut self, step: &str, key: &str, reference: &str) -> Self {
        self.context
            .entry(step.to_string())
            .or_default()
            .insert(key.to_string(), reference.to_string());
        self
    }

    /// Mark a context key of a step for inline injection.
    pub fn with_inject(mut self, step: &str, key: &str) -> Self {
        self.inject
            .entry(step.to_string())
            .or_default()
            .push(key.to_string());
        self
    }

    pub fn with_artifacts(mut self, step: &str, artifacts: ArtifactSpec) -> Self {
        self.artifacts.insert(step.to_string(), artifacts);
        self
    }

    pub fn with_prerequisites(mut self, step: &str, required: &[&str]) -> Self {
        self.prerequisites.insert(
            step.to_string(),
            required.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    pub fn with_phased(mut self, step: &str) -> Self {
        self.phased.push(step.to_string());
        self
    }

    pub fn is_review(&self, step: &str) -> bool {
        self.reviews.iter().any(|s| s == step)
    }

    pub fn is_phased(&self, step: &str) -> bool {
        self.phased.iter().any(|s| s == step)
    }

    pub fn is_conditional(&self, step: &str) -> bool {
        self.conditionals.iter().any(|c| c.step() == step)
    }

    /// Context references declared for a step, in key order.
    pub fn context_for(&self, step: &str) -> Vec<(&str, &str)> {
        self.context
            .get(step)
            .map(|m| m.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect())
            .unwrap_or_default()
    }

    pub fn injects(&self, step: &str, key: &str) -> bool {
        self.inject
            .get(step)
            .is_some_and(|keys| keys.iter().any(|k| k == key))
    }

    pub fn artifacts_for(&self, step: &str) -> ArtifactSpec {
        self.artifacts.get(step).cloned().unwrap_or_default()
    }

    pub fn prerequisites_for(&self, step: &str) -> &[String] {
        self.prerequisites
            .get(step)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Materialise the step list for a pipeline with the given condition.
    ///
    /// Unconditional steps keep their order. A conditional step that also
    /// appears in `steps` is dropped when its condition does not apply.
    pub fn pipeline_steps(&self, condition: Option<&serde_json::Value>) -> Vec<String> {
        self.steps
            .iter()
            .filter(|step| {
                let mut rules = self
                    .conditionals
                    .iter()
                    .filter(|c| c.step() == step.as_str())
                    .peekable();
                rules.peek().is_none() || rules.any(|c| c.applies(condition))
            })
            .cloned()
            .collect()
    }

    /// References to steps that are not in `steps`. Reported as warnings by
    /// validation; they never make a flow invalid.
    pub fn dangling_references(&self) -> Vec<String> {
        let known = |s: &str| self.steps.iter().any(|step| step == s);
        let mut problems = Vec::new();

        for step in &self.reviews {
            if !known(step) {
                problems.push(format!("reviews names unknown step '{}'", step));
            }
        }
        for step in &self.phased {
            if !known(step) {
                problems.push(format!("phased names unknown step '{}'", step));
            }
        }
        for conditional in &self.conditionals {
            if !known(conditional.step()) {
                problems.push(format!(
                    "conditionals names unknown step '{}'",
                    conditional.step()
                ));
            }
        }
        for (step, required) in &self.prerequisites {
            if !known(step) {
                problems.push(format!("prerequisites declared for unknown step '{}'", step));
            }
            for req in required {
                if !known(req) {
                    problems.push(format!(
                        "step '{}' requires unknown step '{}'",
                        step, req
                    ));
                }
            }
        }
        for (step, keys) in &self.inject {
            for key in keys {
                let declared = self.context.get(step).is_some_and(|m| m.contains_key(key));
                if !declared {
                    problems.push(format!(
                        "step '{}' injects undeclared context key '{}'",
                        step, key
                    ));
                }
            }
        }
        problems
    }
}

impl fmt::Display for FlowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .steps
            .iter()
            .map(|s| {
                if self.is_review(s) {
                    format!("{}*", s)
                } else if self.is_conditional(s) {
                    format!("({})", s)
                } else {
                    s.clone()
                }
            })
            .collect();
        write!(f, "{}", rendered.join(" -> "))
    }
}
