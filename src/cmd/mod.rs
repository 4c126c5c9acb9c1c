//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled                                              |
//! |------------|---------------------------------------------------------------|
//! | `pipeline` | `Intake`, `Next`, `Complete`, `CompletePhase`, `Fail`, ...     |
//! | `review`   | `Review`                                                      |
//! | `flows`    | `Flows`                                                       |
//! | `tasks`    | `Tasks`                                                       |
//! | `config`   | `Config`                                                      |

pub mod config;
pub mod flows;
pub mod pipeline;
pub mod review;
pub mod tasks;

use anyhow::{Context as _, Result};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};

use pipewright::config::{EnvOverrides, PipewrightConfig};
use pipewright::flow::FlowRegistry;
use pipewright::orchestrator::PipelineRunner;

pub use config::cmd_config;
pub use flows::cmd_flows;
pub use pipeline::{
    cmd_approve, cmd_complete, cmd_complete_phase, cmd_fail, cmd_intake, cmd_next, cmd_pause,
    cmd_resume, cmd_status,
};
pub use review::cmd_review;
pub use tasks::cmd_tasks;

/// Directories every command works against.
pub struct Context {
    pub project_dir: PathBuf,
    pub feature_dir: PathBuf,
}

impl Context {
    pub fn new(project_dir: PathBuf, feature_dir: PathBuf) -> Self {
        Self {
            project_dir,
            feature_dir,
        }
    }

    pub fn load_config(&self) -> Result<PipewrightConfig> {
        PipewrightConfig::new(&self.project_dir)
    }

    /// Runner for the feature directory with configuration, project flows
    /// and environment overrides applied.
    pub fn runner(&self, config: &PipewrightConfig) -> PipelineRunner {
        let (registry, _load) = FlowRegistry::for_project(&config.project_dir);
        let retry = config.toml.effective_retry();
        PipelineRunner::new(&self.feature_dir, registry, config.toml.clone())
            .with_env(EnvOverrides::from_env())
            .with_retry(retry)
    }
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", out);
    Ok(())
}

/// Read a file, or stdin when the path is `-`.
pub(crate) fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}
