//! Prompt assembly for dispatched steps.
//!
//! Every prompt follows the same skeleton:
//!
//! 1. Step identity and feature directory
//! 2. Either the expected output (dispatch) or a role line plus the explicit
//!    target-file list (review and fixer)
//! 3. The context block, with inline injection capped per file
//! 4. The non-interactive dispatch contract
//!
//! Assembly is deterministic for a given filesystem view and only ever
//! reads files.

pub mod fs;

pub use fs::{DiskFs, FsView, MemoryFs};

use std::path::{Path, PathBuf};

use crate::flow::{ArtifactSpec, FlowDefinition, WHOLE_FEATURE_DIR};
use crate::tasks::{TaskPhase, phase_body};

/// Default per-file inline injection budget, in characters.
pub const DEFAULT_MAX_INJECT_CHARS: usize = 12_000;

/// Appended to injected content that hit the budget. Counted against it.
pub const TRUNCATION_MARKER: &str = "\n[... truncated: file exceeds the injection limit, read the rest from disk ...]";

/// Fixed suffix of every dispatched prompt.
pub const DISPATCH_CONTRACT: &str = "\
## Dispatch contract

You are running as a non-interactive job. There is no message channel back to
the orchestrator: do not ask questions and do not wait for input. Do the work,
write results to the files named above, and exit.

- Reviewers print findings directly to stdout, one per line, as
  `SEVERITY | description | location` where SEVERITY is C, H, M or L, then
  exactly one line `VERDICT: GO`, `VERDICT: CONDITIONAL` or `VERDICT: NO-GO`.
- Fixers print a `FIXED:` block listing every issue id they fixed, one per
  line, and a `REJECTED:` block of `ID: reason` lines for issues they decline.
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptOptions {
    /// Per-file budget for inline injection, marker included.
    pub max_inject_chars: usize,
    /// Project-specific text placed before the contract.
    pub extra_instructions: Option<String>,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self {
            max_inject_chars: DEFAULT_MAX_INJECT_CHARS,
            extra_instructions: None,
        }
    }
}

impl PromptOptions {
    pub fn with_max_inject_chars(mut self, max: usize) -> Self {
        self.max_inject_chars = max;
        self
    }

    pub fn with_extra_instructions(mut self, text: impl Into<String>) -> Self {
        self.extra_instructions = Some(text.into());
        self
    }
}

/// Cap `content` at `cap` characters, marker included. Returns the text to
/// inject and whether it was cut.
pub fn cap_injection(content: &str, cap: usize) -> (String, bool) {
    if content.chars().count() <= cap {
        return (content.to_string(), false);
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    if marker_len >= cap {
        return (TRUNCATION_MARKER.chars().take(cap).collect(), true);
    }
    let mut out: String = content.chars().take(cap - marker_len).collect();
    out.push_str(TRUNCATION_MARKER);
    (out, true)
}

/// Prompt for a plain dispatched step.
pub fn build_dispatch_prompt(
    step: &str,
    feature_dir: &Path,
    flow: &FlowDefinition,
    fs: &dyn FsView,
    opts: &PromptOptions,
) -> String {
    let mut prompt = header(step, feature_dir);
    prompt.push_str("## Output\n\n");
    prompt.push_str(&describe_output(&flow.artifacts_for(step), feature_dir));
    prompt.push_str("\n\n");
    prompt.push_str(&context_block(step, feature_dir, flow, fs, opts));
    prompt.push_str(&footer(opts));
    prompt
}

/// Dispatch prompt narrowed to one phase of the tasks document.
pub fn build_phase_prompt(
    step: &str,
    feature_dir: &Path,
    flow: &FlowDefinition,
    fs: &dyn FsView,
    phase: &TaskPhase,
    tasks_text: &str,
    opts: &PromptOptions,
) -> String {
    let mut prompt = header(step, feature_dir);
    prompt.push_str("## Output\n\n");
    prompt.push_str(&describe_output(&flow.artifacts_for(step), feature_dir));
    prompt.push_str("\n\n");
    prompt.push_str(&context_block(step, feature_dir, flow, fs, opts));

    prompt.push_str(&format!("## Phase {}: {}\n\n", phase.number, phase.name));
    prompt.push_str(&format!(
        "Implement only the tasks below (lines {}-{} of the tasks document). \
         Earlier phases are complete; later phases are dispatched separately. \
         Commit your work before exiting.\n\n",
        phase.start + 1,
        phase.end
    ));
    let (body, truncated) = cap_injection(&phase_body(tasks_text, phase), opts.max_inject_chars);
    if truncated {
        tracing::debug!(
            step,
            phase = phase.number,
            cap = opts.max_inject_chars,
            "truncated phase body"
        );
    }
    prompt.push_str("```markdown\n");
    prompt.push_str(&body);
    prompt.push_str("\n```\n\n");

    prompt.push_str(&footer(opts));
    prompt
}

/// Prompt for the reviewers of a review step.
pub fn build_review_prompt(
    step: &str,
    feature_dir: &Path,
    flow: &FlowDefinition,
    fs: &dyn FsView,
    target_files: &[PathBuf],
    personas: &[String],
    opts: &PromptOptions,
) -> String {
    let mut prompt = header(step, feature_dir);
    prompt.push_str(&format!(
        "Role: reviewer ({}). Produce one independent review per persona.\n\n",
        personas.join(", ")
    ));
    prompt.push_str(&target_list(target_files));
    prompt.push_str(&context_block(step, feature_dir, flow, fs, opts));
    prompt.push_str(&footer(opts));
    prompt
}

/// Prompt skeleton for the fixer; the issue summary of each iteration is
/// appended with [`build_fixer_prompt`].
pub fn build_fixer_base_prompt(
    step: &str,
    feature_dir: &Path,
    flow: &FlowDefinition,
    fs: &dyn FsView,
    target_files: &[PathBuf],
    opts: &PromptOptions,
) -> String {
    let mut prompt = header(step, feature_dir);
    prompt.push_str(
        "Role: fixer. Resolve the review issues listed at the end of this prompt. \
         Fix every C and H issue; fix or explicitly reject M and L issues.\n\n",
    );
    prompt.push_str(&target_list(target_files));
    prompt.push_str(&context_block(step, feature_dir, flow, fs, opts));
    prompt.push_str(&footer(opts));
    prompt
}

/// Full fixer prompt: the base plus this iteration's issue summary.
pub fn build_fixer_prompt(base: &str, iteration: u32, summary: &str) -> String {
    format!(
        "{}\n## Issues to resolve (iteration {})\n\n{}\n",
        base, iteration, summary
    )
}

/// Corrective re-prompt for a reviewer whose output had no verdict line.
pub fn build_verdict_correction_prompt(step: &str, persona: &str, issue_count: usize) -> String {
    format!(
        "Your review of step '{}' as {} did not end with a verdict line.\n\n\
         {} issue line(s) were recognized. Re-emit your findings as \
         `SEVERITY | description | location` lines and finish with exactly one of:\n\n\
         VERDICT: GO\nVERDICT: CONDITIONAL\nVERDICT: NO-GO\n\n\
         Print nothing after the verdict line.\n",
        step, persona, issue_count
    )
}

fn header(step: &str, feature_dir: &Path) -> String {
    format!(
        "# Pipeline step: {}\n\nStep: {}\nFeature directory: {}\n\n",
        step,
        step,
        feature_dir.display()
    )
}

fn footer(opts: &PromptOptions) -> String {
    let mut out = String::new();
    if let Some(extra) = &opts.extra_instructions {
        out.push_str("## Project instructions\n\n");
        out.push_str(extra.trim_end());
        out.push_str("\n\n");
    }
    out.push_str(DISPATCH_CONTRACT);
    out
}

fn describe_output(spec: &ArtifactSpec, feature_dir: &Path) -> String {
    match spec {
        ArtifactSpec::None => {
            "Produce whatever this step calls for inside the feature directory.".to_string()
        }
        ArtifactSpec::All => format!("All files in {}", feature_dir.display()),
        ArtifactSpec::Single(path) => format!("Write {}", feature_dir.join(path).display()),
        ArtifactSpec::Many(paths) => {
            let mut out = "Write:".to_string();
            for path in paths {
                out.push_str(&format!("\n- {}", feature_dir.join(path).display()));
            }
            out
        }
    }
}

fn target_list(target_files: &[PathBuf]) -> String {
    let mut out = "## Target files\n\n".to_string();
    if target_files.is_empty() {
        out.push_str("(none declared; review the feature directory)\n");
    }
    for file in target_files {
        out.push_str(&format!("- {}\n", file.display()));
    }
    out.push('\n');
    out
}

fn context_block(
    step: &str,
    feature_dir: &Path,
    flow: &FlowDefinition,
    fs: &dyn FsView,
    opts: &PromptOptions,
) -> String {
    let refs = flow.context_for(step);
    if refs.is_empty() {
        return String::new();
    }

    let mut listed = String::new();
    let mut inlined = String::new();

    for (key, reference) in refs {
        if reference == WHOLE_FEATURE_DIR {
            listed.push_str(&format!(
                "- {}: the whole feature directory {}\n",
                key,
                feature_dir.display()
            ));
            for file in fs.list_files(feature_dir) {
                listed.push_str(&format!("  - {}\n", file.display()));
            }
            continue;
        }

        let path = feature_dir.join(reference);
        if !fs.exists(&path) {
            listed.push_str(&format!("- {}: {} (missing)\n", key, path.display()));
            continue;
        }
        if !flow.injects(step, key) {
            listed.push_str(&format!("- {}: {} (read it yourself)\n", key, path.display()));
            continue;
        }

        match fs.read_to_string(&path) {
            Ok(content) => {
                let (text, truncated) = cap_injection(&content, opts.max_inject_chars);
                if truncated {
                    tracing::debug!(
                        step,
                        file = %path.display(),
                        cap = opts.max_inject_chars,
                        "truncated injected context"
                    );
                }
                listed.push_str(&format!("- {}: {} (included below)\n", key, path.display()));
                inlined.push_str(&format!("### {} ({})\n\n```\n{}\n```\n\n", key, path.display(), text));
            }
            Err(e) => {
                listed.push_str(&format!(
                    "- {}: {} (could not be read: {}; read it yourself)\n",
                    key,
                    path.display(),
                    e
                ));
            }
        }
    }

    format!("## Context\n\n{}\n{}", listed, inlined)
}
