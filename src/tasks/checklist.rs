//! Task checklist parsing and validation.
//!
//! Task lines are markdown checkboxes carrying an id and optional
//! annotations:
//!
//! ```text
//! - [ ] T003 [P] Wire the cache layer depends: [T001, T002] files: src/cache/**, src/lib.rs
//! ```
//!
//! Structural problems (duplicate ids, unknown or circular dependencies,
//! bad phase numbering) make the document invalid. Two parallel tasks in the
//! same phase that touch overlapping files only produce a warning.

use glob::Pattern;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::LazyLock;

use super::phases::parse_phases;

static TASK_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[-*]\s+\[([ xX])\]\s+(T\d+)\b\s*(.*)$").unwrap()
});

static PARALLEL_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[P\]\s*").unwrap());

static DEPENDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bdepends:\s*\[([^\]]*)\]").unwrap());

static FILES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bfiles:\s*(.+)$").unwrap());

/// One checklist entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskItem {
    pub id: String,
    pub description: String,
    pub done: bool,
    /// Marked `[P]`: may run alongside other parallel tasks of its phase.
    pub parallel: bool,
    pub depends: Vec<String>,
    pub files: Vec<String>,
    /// Owning phase, `None` for tasks above the first phase heading.
    pub phase: Option<u32>,
    /// 0-based line index.
    pub line: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskValidation {
    pub valid: bool,
    pub tasks: Vec<TaskItem>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Parse every task line of a tasks document and validate the set.
pub fn parse_tasks(text: &str) -> TaskValidation {
    let phase_parse = parse_phases(text);
    let mut errors = phase_parse.errors.clone();
    let mut tasks = Vec::new();

    for (idx, line) in text.lines().enumerate() {
        let Some(caps) = TASK_LINE.captures(line) else {
            continue;
        };
        let phase = phase_parse
            .phases
            .iter()
            .find(|p| p.contains_line(idx))
            .map(|p| p.number);
        tasks.push(parse_task_body(
            &caps[2],
            &caps[3],
            !caps[1].trim().is_empty(),
            phase,
            idx,
        ));
    }

    errors.extend(check_ids(&tasks));
    errors.extend(check_dependencies(&tasks));
    let warnings = check_overlaps(&tasks);

    TaskValidation {
        valid: errors.is_empty(),
        tasks,
        errors,
        warnings,
    }
}

fn parse_task_body(id: &str, rest: &str, done: bool, phase: Option<u32>, line: usize) -> TaskItem {
    let parallel = PARALLEL_MARKER.is_match(rest);
    let stripped = PARALLEL_MARKER.replace(rest, "");
    let rest = stripped.as_ref();

    let depends_clause = DEPENDS.captures(rest);
    let depends = depends_clause
        .as_ref()
        .map(|c| split_list(&c[1]))
        .unwrap_or_default();
    // The file list runs to the end of the line or to a later `depends:`.
    let files = FILES
        .captures(rest)
        .and_then(|c| c.get(1))
        .map(|list| {
            let end = depends_clause
                .as_ref()
                .and_then(|d| d.get(0))
                .map(|d| d.start())
                .filter(|&start| start > list.start())
                .unwrap_or(list.end());
            split_list(&rest[list.start()..end])
        })
        .unwrap_or_default();

    let cut = [DEPENDS.find(rest), FILES.find(rest)]
        .into_iter()
        .flatten()
        .map(|m| m.start())
        .min()
        .unwrap_or(rest.len());

    TaskItem {
        id: id.to_string(),
        description: rest[..cut].trim().to_string(),
        done,
        parallel,
        depends,
        files,
        phase,
        line,
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn check_ids(tasks: &[TaskItem]) -> Vec<String> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    let mut errors = Vec::new();
    for task in tasks {
        if let Some(first) = seen.get(task.id.as_str()) {
            errors.push(format!(
                "duplicate task id {} (lines {} and {})",
                task.id,
                first + 1,
                task.line + 1
            ));
        } else {
            seen.insert(&task.id, task.line);
        }
    }
    errors
}

fn check_dependencies(tasks: &[TaskItem]) -> Vec<String> {
    let known: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    let mut errors = Vec::new();

    for task in tasks {
        for dep in &task.depends {
            if dep == &task.id {
                errors.push(format!("{} depends on itself", task.id));
            } else if !known.contains(dep.as_str()) {
                errors.push(format!("{} depends on undefined task {}", task.id, dep));
            }
        }
    }

    if let Some(cycle) = find_cycle(tasks) {
        errors.push(format!("dependency cycle: {}", cycle.join(" -> ")));
    }
    errors
}

/// Depth-first search for a dependency cycle longer than one task.
fn find_cycle(tasks: &[TaskItem]) -> Option<Vec<String>> {
    let graph: BTreeMap<&str, Vec<&str>> = tasks
        .iter()
        .map(|t| {
            let deps = t
                .depends
                .iter()
                .map(String::as_str)
                .filter(|d| *d != t.id)
                .collect();
            (t.id.as_str(), deps)
        })
        .collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        node: &'a str,
        graph: &BTreeMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(node) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = path.iter().position(|n| *n == node).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(node.to_string());
                return Some(cycle);
            }
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        path.push(node);
        for &dep in graph.get(node).into_iter().flatten() {
            if graph.contains_key(dep)
                && let Some(cycle) = visit(dep, graph, marks, path)
            {
                return Some(cycle);
            }
        }
        path.pop();
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    for node in graph.keys().copied() {
        let mut path = Vec::new();
        if let Some(cycle) = visit(node, &graph, &mut marks, &mut path) {
            return Some(cycle);
        }
    }
    None
}

fn check_overlaps(tasks: &[TaskItem]) -> Vec<String> {
    let mut warnings = Vec::new();
    let parallel: Vec<&TaskItem> = tasks.iter().filter(|t| t.parallel).collect();

    for (i, a) in parallel.iter().enumerate() {
        for b in &parallel[i + 1..] {
            if a.phase != b.phase {
                continue;
            }
            for fa in &a.files {
                for fb in &b.files {
                    if globs_overlap(fa, fb) {
                        warnings.push(format!(
                            "parallel tasks {} and {} both touch {} / {}",
                            a.id, b.id, fa, fb
                        ));
                    }
                }
            }
        }
    }
    warnings
}

/// Whether two file globs may name the same file: identical, one matches
/// the other literally, or their literal directory prefixes nest.
pub fn globs_overlap(a: &str, b: &str) -> bool {
    let a = a.trim_start_matches("./");
    let b = b.trim_start_matches("./");
    if a == b {
        return true;
    }
    let matches = |pattern: &str, path: &str| {
        Pattern::new(pattern).is_ok_and(|p| p.matches(path))
    };
    if matches(a, b) || matches(b, a) {
        return true;
    }

    let pa = literal_prefix(a);
    let pb = literal_prefix(b);
    is_component_prefix(&pa, &pb) || is_component_prefix(&pb, &pa)
}

/// Leading path components that contain no glob metacharacters.
fn literal_prefix(pattern: &str) -> Vec<&str> {
    pattern
        .split('/')
        .filter(|c| !c.is_empty())
        .take_while(|c| !c.contains(['*', '?', '[']))
        .collect()
}

fn is_component_prefix(prefix: &[&str], path: &[&str]) -> bool {
    !prefix.is_empty() && prefix.len() <= path.len() && path[..prefix.len()] == *prefix
}
