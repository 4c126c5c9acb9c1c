//! Executor selection for dispatched steps.
//!
//! Lookups run through an ordered chain of resolvers and the first one with
//! an answer wins:
//!
//! 1. `PIPEWRIGHT_EXECUTOR` / `PIPEWRIGHT_MODEL`
//! 2. `[executors.steps.<step>]`
//! 3. `[executors.patterns."<glob>"]` (patterns tried in sorted order)
//! 4. `[executors.roles.<worker|reviewer|fixer>]`
//! 5. `[executors.default]`
//!
//! A match only needs to supply one field; the rest come from the global
//! default.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::pattern_matches;

pub const ENV_EXECUTOR: &str = "PIPEWRIGHT_EXECUTOR";
pub const ENV_MODEL: &str = "PIPEWRIGHT_MODEL";

pub const DEFAULT_EXECUTOR: &str = "claude";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorChoice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ExecutorChoice {
    pub fn is_empty(&self) -> bool {
        self.executor.is_none() && self.model.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Worker,
    Reviewer,
    Fixer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Worker => "worker",
            Role::Reviewer => "reviewer",
            Role::Fixer => "fixer",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `[executors.roles]`: per-role defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolesSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<ExecutorChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<ExecutorChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixer: Option<ExecutorChoice>,
}

impl RolesSection {
    pub fn get(&self, role: Role) -> Option<&ExecutorChoice> {
        match role {
            Role::Worker => self.worker.as_ref(),
            Role::Reviewer => self.reviewer.as_ref(),
            Role::Fixer => self.fixer.as_ref(),
        }
    }
}

/// The `[executors]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorsSection {
    #[serde(default)]
    pub default: ExecutorChoice,
    #[serde(default)]
    pub roles: RolesSection,
    #[serde(default)]
    pub steps: BTreeMap<String, ExecutorChoice>,
    #[serde(default)]
    pub patterns: BTreeMap<String, ExecutorChoice>,
}

impl ExecutorsSection {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for (step, choice) in &self.steps {
            if choice.is_empty() {
                warnings.push(format!("executors.steps.{} sets neither executor nor model", step));
            }
        }
        for (pattern, choice) in &self.patterns {
            if choice.is_empty() {
                warnings.push(format!(
                    "executors.patterns.\"{}\" sets neither executor nor model",
                    pattern
                ));
            }
            if glob::Pattern::new(pattern).is_err() {
                warnings.push(format!(
                    "executors.patterns.\"{}\" is not a valid glob and never matches",
                    pattern
                ));
            }
            if self.steps.contains_key(pattern) {
                warnings.push(format!(
                    "executors.patterns.\"{}\" is shadowed by executors.steps.{}",
                    pattern, pattern
                ));
            }
        }
        warnings
    }
}

/// Snapshot of the environment overrides, taken once so resolution stays
/// a pure function of its inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub executor: Option<String>,
    pub model: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let read = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            executor: read(ENV_EXECUTOR),
            model: read(ENV_MODEL),
        }
    }
}

/// Query handed to each resolver.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorQuery<'a> {
    pub step: &'a str,
    pub role: Role,
    pub section: &'a ExecutorsSection,
    pub env: &'a EnvOverrides,
}

pub trait ExecutorResolver {
    /// Label recorded as the source of a resolution.
    fn name(&self) -> &'static str;

    fn resolve(&self, query: &ExecutorQuery<'_>) -> Option<ExecutorChoice>;
}

pub struct EnvOverrideResolver;

impl ExecutorResolver for EnvOverrideResolver {
    fn name(&self) -> &'static str {
        "env"
    }

    fn resolve(&self, query: &ExecutorQuery<'_>) -> Option<ExecutorChoice> {
        let choice = ExecutorChoice {
            executor: query.env.executor.clone(),
            model: query.env.model.clone(),
        };
        (!choice.is_empty()).then_some(choice)
    }
}

pub struct ExactStepResolver;

impl ExecutorResolver for ExactStepResolver {
    fn name(&self) -> &'static str {
        "step"
    }

    fn resolve(&self, query: &ExecutorQuery<'_>) -> Option<ExecutorChoice> {
        query.section.steps.get(query.step).cloned()
    }
}

pub struct StepPatternResolver;

impl ExecutorResolver for StepPatternResolver {
    fn name(&self) -> &'static str {
        "pattern"
    }

    fn resolve(&self, query: &ExecutorQuery<'_>) -> Option<ExecutorChoice> {
        query
            .section
            .patterns
            .iter()
            .find(|(pattern, _)| pattern_matches(pattern, query.step))
            .map(|(_, choice)| choice.clone())
    }
}

pub struct RoleDefaultResolver;

impl ExecutorResolver for RoleDefaultResolver {
    fn name(&self) -> &'static str {
        "role"
    }

    fn resolve(&self, query: &ExecutorQuery<'_>) -> Option<ExecutorChoice> {
        query.section.roles.get(query.role).cloned()
    }
}

pub struct GlobalDefaultResolver;

impl ExecutorResolver for GlobalDefaultResolver {
    fn name(&self) -> &'static str {
        "default"
    }

    fn resolve(&self, query: &ExecutorQuery<'_>) -> Option<ExecutorChoice> {
        Some(query.section.default.clone())
    }
}

pub fn default_chain() -> Vec<Box<dyn ExecutorResolver>> {
    vec![
        Box::new(EnvOverrideResolver),
        Box::new(ExactStepResolver),
        Box::new(StepPatternResolver),
        Box::new(RoleDefaultResolver),
        Box::new(GlobalDefaultResolver),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedExecutor {
    pub executor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Name of the resolver that matched.
    pub source: String,
}

/// Resolve the executor for `step` in `role` through [`default_chain`].
pub fn resolve_executor(
    section: &ExecutorsSection,
    env: &EnvOverrides,
    step: &str,
    role: Role,
) -> ResolvedExecutor {
    resolve_with(&default_chain(), section, env, step, role)
}

pub fn resolve_with(
    chain: &[Box<dyn ExecutorResolver>],
    section: &ExecutorsSection,
    env: &EnvOverrides,
    step: &str,
    role: Role,
) -> ResolvedExecutor {
    let query = ExecutorQuery {
        step,
        role,
        section,
        env,
    };

    let (choice, source) = chain
        .iter()
        .find_map(|resolver| {
            resolver
                .resolve(&query)
                .filter(|c| !c.is_empty())
                .map(|c| (c, resolver.name()))
        })
        .unwrap_or_else(|| (ExecutorChoice::default(), "builtin"));

    let resolved = ResolvedExecutor {
        executor: choice
            .executor
            .or_else(|| section.default.executor.clone())
            .unwrap_or_else(|| DEFAULT_EXECUTOR.to_string()),
        model: choice.model.or_else(|| section.default.model.clone()),
        source: source.to_string(),
    };
    tracing::debug!(
        step,
        role = %role,
        executor = %resolved.executor,
        source = %resolved.source,
        "resolved executor"
    );
    resolved
}
