//! Staging area for prompt files handed to the dispatch controller.
//!
//! Prompts are written into a temporary directory next to their final
//! location. [`PromptStaging::commit`] moves the whole set into place in one
//! rename; dropping the handle without committing removes everything that
//! was staged, whichever way the caller exits.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct PromptStaging {
    staging: TempDir,
    target: PathBuf,
    files: Vec<String>,
}

impl PromptStaging {
    /// Stage prompts destined for `target`. The staging directory is created
    /// in the same parent so the final move is a rename.
    pub fn new(target: impl Into<PathBuf>) -> Result<Self> {
        let target = target.into();
        let parent = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
        let staging = tempfile::Builder::new()
            .prefix(".prompt-staging-")
            .tempdir_in(parent)
            .with_context(|| format!("Failed to create staging directory in {}", parent.display()))?;
        Ok(Self {
            staging,
            target,
            files: Vec::new(),
        })
    }

    pub fn staging_dir(&self) -> &Path {
        self.staging.path()
    }

    /// Write `content` as `name` and return the path it will have after
    /// commit.
    pub fn write_prompt(&mut self, name: &str, content: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            anyhow::bail!("Invalid prompt file name '{}'", name);
        }
        let path = self.staging.path().join(name);
        fs::write(&path, content)
            .with_context(|| format!("Failed to write prompt file {}", path.display()))?;
        if !self.files.iter().any(|f| f == name) {
            self.files.push(name.to_string());
        }
        Ok(self.target.join(name))
    }

    /// Move the staged prompts to the target directory, replacing whatever
    /// prompts were there before.
    pub fn commit(self) -> Result<Vec<PathBuf>> {
        if self.target.exists() {
            fs::remove_dir_all(&self.target).with_context(|| {
                format!("Failed to remove previous prompts in {}", self.target.display())
            })?;
        }
        fs::rename(self.staging.path(), &self.target).with_context(|| {
            format!("Failed to move staged prompts to {}", self.target.display())
        })?;
        tracing::debug!(dir = %self.target.display(), files = self.files.len(), "prompts committed");
        // The TempDir no longer exists at its old path; dropping it is a no-op.
        Ok(self.files.iter().map(|f| self.target.join(f)).collect())
    }
}
