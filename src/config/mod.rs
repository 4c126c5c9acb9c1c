//! Project configuration.
//!
//! Settings are read from `.pipewright/pipewright.toml` next to the optional
//! flow overrides. Every section has defaults, so an empty or missing file
//! is a valid configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "my-service"
//! default_flow = "feature"
//!
//! [retry]
//! enabled = true
//! max_retries = 3
//! base_backoff_secs = 30
//! max_backoff_secs = 600
//!
//! [review]
//! max_iterations = 3
//! personas = ["correctness", "security"]
//! id_prefix = "RV"
//!
//! [prompt]
//! max_inject_chars = 12000
//! extra_instructions = "Run `cargo fmt` before finishing."
//!
//! [gates]
//! steps = ["implement", "deploy-*"]
//! message = "Check the plan before implementation starts."
//!
//! [implement]
//! require_commit = true
//!
//! [executors.default]
//! executor = "claude"
//! model = "sonnet"
//!
//! [executors.roles.reviewer]
//! model = "opus"
//!
//! [executors.steps.plan]
//! model = "opus"
//!
//! [executors.patterns."impl*"]
//! executor = "codex"
//! ```
//!
//! Environment variables override the file: `PIPEWRIGHT_EXECUTOR`,
//! `PIPEWRIGHT_MODEL` and `PIPEWRIGHT_MAX_RETRIES`.

pub mod executors;

pub use executors::{
    EnvOverrides, ExecutorChoice, ExecutorResolver, ExecutorsSection, ResolvedExecutor, Role,
    RolesSection, default_chain, resolve_executor,
};

use anyhow::{Context, Result};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::prompt::{DEFAULT_MAX_INJECT_CHARS, PromptOptions, TRUNCATION_MARKER};
use crate::retry::RetryConfig;

/// Project-local directory holding configuration and flow overrides.
pub const PIPEWRIGHT_DIR: &str = ".pipewright";
pub const CONFIG_FILE: &str = "pipewright.toml";

pub const ENV_MAX_RETRIES: &str = "PIPEWRIGHT_MAX_RETRIES";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSection {
    #[serde(default)]
    pub name: Option<String>,
    /// Flow used by `intake` when none is named.
    #[serde(default = "default_flow")]
    pub default_flow: String,
}

fn default_flow() -> String {
    "feature".to_string()
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            name: None,
            default_flow: default_flow(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewSection {
    /// Review rounds allowed before the cycle escalates.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_personas")]
    pub personas: Vec<String>,
    #[serde(default = "default_id_prefix")]
    pub id_prefix: String,
}

fn default_max_iterations() -> u32 {
    3
}

fn default_personas() -> Vec<String> {
    vec!["correctness".to_string(), "security".to_string()]
}

fn default_id_prefix() -> String {
    "RV".to_string()
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            personas: default_personas(),
            id_prefix: default_id_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptSection {
    #[serde(default = "default_max_inject_chars")]
    pub max_inject_chars: usize,
    #[serde(default)]
    pub extra_instructions: Option<String>,
}

fn default_max_inject_chars() -> usize {
    DEFAULT_MAX_INJECT_CHARS
}

impl Default for PromptSection {
    fn default() -> Self {
        Self {
            max_inject_chars: default_max_inject_chars(),
            extra_instructions: None,
        }
    }
}

/// Steps that wait for an explicit approval before dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatesSection {
    /// Step names or glob patterns.
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl GatesSection {
    pub fn is_gated(&self, step: &str) -> bool {
        self.steps.iter().any(|p| pattern_matches(p, step))
    }

    pub fn message_for(&self, step: &str) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| format!("Step '{}' requires approval before it runs.", step))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplementSection {
    /// `complete-phase` must be told the phase's work is committed.
    #[serde(default = "default_require_commit")]
    pub require_commit: bool,
}

fn default_require_commit() -> bool {
    true
}

impl Default for ImplementSection {
    fn default() -> Self {
        Self {
            require_commit: default_require_commit(),
        }
    }
}

/// The complete pipewright.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipewrightToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub review: ReviewSection,
    #[serde(default)]
    pub prompt: PromptSection,
    #[serde(default)]
    pub gates: GatesSection,
    #[serde(default)]
    pub implement: ImplementSection,
    #[serde(default)]
    pub executors: ExecutorsSection,
}

impl PipewrightToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse pipewright.toml")
    }

    /// Load `pipewright.toml` from `pw_dir`, or defaults when it is absent.
    pub fn load_or_default(pw_dir: &Path) -> Result<Self> {
        let config_path = pw_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize pipewright.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Retry settings with `PIPEWRIGHT_MAX_RETRIES` applied.
    pub fn effective_retry(&self) -> RetryConfig {
        let mut retry = self.retry.clone();
        if let Ok(value) = std::env::var(ENV_MAX_RETRIES) {
            match value.trim().parse::<u32>() {
                Ok(max) => retry.max_retries = max,
                Err(_) => tracing::warn!(
                    value = %value,
                    "ignoring invalid {}",
                    ENV_MAX_RETRIES
                ),
            }
        }
        retry
    }

    pub fn prompt_options(&self) -> PromptOptions {
        PromptOptions {
            max_inject_chars: self.prompt.max_inject_chars,
            extra_instructions: self.prompt.extra_instructions.clone(),
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.review.max_iterations == 0 {
            warnings.push("review.max_iterations is 0; one review round will still run".to_string());
        }
        if self.review.personas.is_empty() {
            warnings.push("review.personas is empty; reviews will have no persona".to_string());
        }
        if self.review.id_prefix.is_empty()
            || !self.review.id_prefix.chars().all(|c| c.is_ascii_alphabetic())
        {
            warnings.push(format!(
                "review.id_prefix '{}' should be ASCII letters; fixer output will not match",
                self.review.id_prefix
            ));
        }
        if self.prompt.max_inject_chars <= TRUNCATION_MARKER.chars().count() {
            warnings.push(format!(
                "prompt.max_inject_chars {} leaves no room for content next to the truncation marker",
                self.prompt.max_inject_chars
            ));
        }
        if self.retry.base_backoff_secs > self.retry.max_backoff_secs {
            warnings.push(format!(
                "retry.base_backoff_secs ({}) exceeds retry.max_backoff_secs ({})",
                self.retry.base_backoff_secs, self.retry.max_backoff_secs
            ));
        }
        for pattern in &self.gates.steps {
            if Pattern::new(pattern).is_err() {
                warnings.push(format!("gates.steps pattern '{}' is not a valid glob", pattern));
            }
        }
        warnings.extend(self.executors.validate());

        warnings
    }
}

/// Configuration bound to a project directory.
#[derive(Debug, Clone)]
pub struct PipewrightConfig {
    pub project_dir: PathBuf,
    pub pw_dir: PathBuf,
    pub toml: PipewrightToml,
}

impl PipewrightConfig {
    pub fn new(project_dir: &Path) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory {}", project_dir.display()))?;
        let pw_dir = project_dir.join(PIPEWRIGHT_DIR);
        let toml = PipewrightToml::load_or_default(&pw_dir)?;
        Ok(Self {
            project_dir,
            pw_dir,
            toml,
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.pw_dir.join(CONFIG_FILE)
    }

    pub fn flows_file(&self) -> PathBuf {
        crate::flow::registry::flows_file(&self.project_dir)
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

/// Case-insensitive glob match of a step name. Invalid patterns match
/// nothing.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    let options = MatchOptions {
        case_sensitive: false,
        ..MatchOptions::new()
    };
    Pattern::new(pattern).is_ok_and(|p| p.matches_with(name, options))
}
