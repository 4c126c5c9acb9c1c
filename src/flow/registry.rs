//! Flow catalog: builtin flows merged with project-local overrides.
//!
//! Overrides live in `.pipewright/flows.yaml` as a mapping of flow name to
//! definition. Loading never fails: a broken file yields zero custom flows
//! and one error, and each entry is validated on its own so a single bad
//! entry does not take the others down with it.

use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::definition::{ArtifactSpec, Conditional, FlowDefinition, WHOLE_FEATURE_DIR};
use crate::config::PIPEWRIGHT_DIR;

/// File name of the project-local flow override document.
pub const FLOWS_FILE: &str = "flows.yaml";

/// Outcome of validating one flow entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    /// Cross-reference problems (unknown step names and the like). These
    /// never affect `valid`.
    pub warnings: Vec<String>,
}

/// Custom flows read from a project plus everything that went wrong.
#[derive(Debug, Clone, Default)]
pub struct FlowLoad {
    pub flows: BTreeMap<String, FlowDefinition>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

const SEQUENCE_FIELDS: &[&str] = &["reviews", "conditionals", "phased"];
const MAPPING_FIELDS: &[&str] = &["context", "prerequisites", "inject", "artifacts"];

/// Validate a raw flow entry field by field.
///
/// `steps` must be a non-empty sequence of strings; every optional field
/// that is present must have its declared shape. Unknown fields are left
/// alone.
pub fn validate(name: &str, def: &Value) -> FlowValidation {
    let mut errors = Vec::new();

    let Some(map) = def.as_mapping() else {
        return FlowValidation {
            valid: false,
            errors: vec![format!("flow '{}': definition must be a mapping", name)],
            warnings: Vec::new(),
        };
    };

    match map.get("steps") {
        None => errors.push(format!("flow '{}': 'steps' is required", name)),
        Some(Value::Sequence(steps)) => {
            if steps.is_empty() {
                errors.push(format!("flow '{}': 'steps' must not be empty", name));
            }
            for (i, step) in steps.iter().enumerate() {
                if !step.is_string() {
                    errors.push(format!("flow '{}': 'steps[{}]' must be a string", name, i));
                }
            }
        }
        Some(_) => errors.push(format!("flow '{}': 'steps' must be a sequence", name)),
    }

    for field in SEQUENCE_FIELDS {
        if let Some(value) = map.get(*field)
            && !value.is_sequence()
        {
            errors.push(format!("flow '{}': '{}' must be a sequence", name, field));
        }
    }

    for field in MAPPING_FIELDS {
        if let Some(value) = map.get(*field)
            && !value.is_mapping()
        {
            errors.push(format!("flow '{}': '{}' must be a mapping", name, field));
        }
    }

    FlowValidation {
        valid: errors.is_empty(),
        errors,
        warnings: Vec::new(),
    }
}

/// Parse and validate an override document.
pub fn load_from_str(content: &str, source: &Path) -> FlowLoad {
    let mut load = FlowLoad::default();

    let doc: Value = match serde_yaml::from_str(content) {
        Ok(doc) => doc,
        Err(e) => {
            load.errors
                .push(format!("{}: failed to parse: {}", source.display(), e));
            return load;
        }
    };

    let entries = match doc {
        Value::Null => return load,
        Value::Mapping(entries) => entries,
        _ => {
            load.errors.push(format!(
                "{}: top level must be a mapping of flow name to definition",
                source.display()
            ));
            return load;
        }
    };

    for (key, value) in entries {
        let Some(name) = key.as_str().map(str::to_string) else {
            load.errors
                .push(format!("{}: flow names must be strings", source.display()));
            continue;
        };

        let validation = validate(&name, &value);
        if !validation.valid {
            load.errors.extend(validation.errors);
            continue;
        }

        match serde_yaml::from_value::<FlowDefinition>(value) {
            Ok(flow) => {
                for problem in flow.dangling_references() {
                    load.warnings.push(format!("flow '{}': {}", name, problem));
                }
                load.flows.insert(name, flow);
            }
            Err(e) => load
                .errors
                .push(format!("flow '{}': rejected: {}", name, e)),
        }
    }

    load
}

/// Path of the override document for a project.
pub fn flows_file(project_dir: &Path) -> PathBuf {
    project_dir.join(PIPEWRIGHT_DIR).join(FLOWS_FILE)
}

/// Read the optional override document of a project.
pub fn load(project_dir: &Path) -> FlowLoad {
    let path = flows_file(project_dir);
    if !path.exists() {
        return FlowLoad::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => load_from_str(&content, &path),
        Err(e) => FlowLoad {
            errors: vec![format!("{}: failed to read: {}", path.display(), e)],
            ..Default::default()
        },
    }
}

/// Merge custom flows over builtin ones. A custom entry replaces the builtin
/// entry of the same name wholesale; no field-level merging happens.
pub fn merge(
    builtin: BTreeMap<String, FlowDefinition>,
    custom: BTreeMap<String, FlowDefinition>,
) -> BTreeMap<String, FlowDefinition> {
    let mut merged = builtin;
    for (name, flow) in custom {
        if merged.contains_key(&name) {
            debug!(flow = %name, "custom flow overrides builtin");
        }
        merged.insert(name, flow);
    }
    merged
}

/// The builtin flow catalog.
pub fn builtin_flows() -> BTreeMap<String, FlowDefinition> {
    let mut flows = BTreeMap::new();

    let feature = FlowDefinition::new(["specify", "clarify", "plan", "tasks", "implement", "review"])
        .with_review("review")
        .with_conditional(Conditional::When {
            step: "clarify".into(),
            when: "needs-clarification".into(),
        })
        .with_context("clarify", "spec", "spec.md")
        .with_inject("clarify", "spec")
        .with_context("plan", "spec", "spec.md")
        .with_inject("plan", "spec")
        .with_context("tasks", "spec", "spec.md")
        .with_context("tasks", "plan", "plan.md")
        .with_inject("tasks", "plan")
        .with_context("implement", "spec", "spec.md")
        .with_context("implement", "plan", "plan.md")
        .with_context("implement", "tasks", "tasks.md")
        .with_inject("implement", "tasks")
        .with_context("review", "spec", "spec.md")
        .with_context("review", "feature", WHOLE_FEATURE_DIR)
        .with_inject("review", "spec")
        .with_artifacts("specify", ArtifactSpec::Single("spec.md".into()))
        .with_artifacts("clarify", ArtifactSpec::Single("spec.md".into()))
        .with_artifacts(
            "plan",
            ArtifactSpec::Many(vec!["plan.md".into(), "research.md".into()]),
        )
        .with_artifacts("tasks", ArtifactSpec::Single("tasks.md".into()))
        .with_artifacts("implement", ArtifactSpec::All)
        .with_prerequisites("plan", &["specify"])
        .with_prerequisites("tasks", &["plan"])
        .with_prerequisites("implement", &["tasks"])
        .with_prerequisites("review", &["implement"])
        .with_phased("implement");
    flows.insert("feature".to_string(), feature);

    let bugfix = FlowDefinition::new(["specify", "plan", "implement", "review"])
        .with_review("review")
        .with_context("plan", "spec", "spec.md")
        .with_inject("plan", "spec")
        .with_context("implement", "spec", "spec.md")
        .with_context("implement", "plan", "plan.md")
        .with_inject("implement", "plan")
        .with_context("review", "spec", "spec.md")
        .with_context("review", "feature", WHOLE_FEATURE_DIR)
        .with_artifacts("specify", ArtifactSpec::Single("spec.md".into()))
        .with_artifacts("plan", ArtifactSpec::Single("plan.md".into()))
        .with_artifacts("implement", ArtifactSpec::All)
        .with_prerequisites("plan", &["specify"])
        .with_prerequisites("implement", &["plan"])
        .with_prerequisites("review", &["implement"]);
    flows.insert("bugfix".to_string(), bugfix);

    let quick = FlowDefinition::new(["specify", "implement", "review"])
        .with_review("review")
        .with_context("implement", "spec", "spec.md")
        .with_inject("implement", "spec")
        .with_context("review", "feature", WHOLE_FEATURE_DIR)
        .with_artifacts("specify", ArtifactSpec::Single("spec.md".into()))
        .with_artifacts("implement", ArtifactSpec::All)
        .with_prerequisites("implement", &["specify"]);
    flows.insert("quick".to_string(), quick);

    flows
}

/// Merged flow catalog for a project.
#[derive(Debug, Clone)]
pub struct FlowRegistry {
    flows: BTreeMap<String, FlowDefinition>,
}

impl FlowRegistry {
    /// Registry with only the builtin catalog.
    pub fn builtin() -> Self {
        Self {
            flows: builtin_flows(),
        }
    }

    pub fn from_flows(flows: BTreeMap<String, FlowDefinition>) -> Self {
        Self { flows }
    }

    /// Builtins merged with the project's overrides. Returns the load report
    /// alongside so callers can surface errors without failing.
    pub fn for_project(project_dir: &Path) -> (Self, FlowLoad) {
        let mut report = load(project_dir);
        for error in &report.errors {
            warn!("{}", error);
        }
        let custom = std::mem::take(&mut report.flows);
        let names: Vec<String> = custom.keys().cloned().collect();
        let registry = Self {
            flows: merge(builtin_flows(), custom),
        };
        report.flows = names
            .into_iter()
            .filter_map(|n| registry.flows.get(&n).map(|f| (n, f.clone())))
            .collect();
        (registry, report)
    }

    pub fn resolve(&self, name: &str) -> Option<&FlowDefinition> {
        self.flows.get(name)
    }

    /// Resolve `"{name}-{variant}"` when it exists, otherwise `name`.
    pub fn resolve_variant(&self, name: &str, variant: Option<&str>) -> Option<&FlowDefinition> {
        variant
            .and_then(|v| self.flows.get(&format!("{}-{}", name, v)))
            .or_else(|| self.resolve(name))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.flows.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FlowDefinition)> {
        self.flows.iter().map(|(k, v)| (k.as_str(), v))
    }
}
