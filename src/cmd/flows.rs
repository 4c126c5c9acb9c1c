//! Flow catalog commands: `pipewright flows list` and `flows validate`.

use anyhow::{Result, bail};
use serde::Serialize;

use pipewright::flow::{self, FlowRegistry};

use super::super::FlowsCommands;
use super::{Context, print_json};

#[derive(Serialize)]
struct FlowSummary<'a> {
    name: &'a str,
    source: &'static str,
    steps: &'a [String],
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    reviews: &'a [String],
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    phased: &'a [String],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    conditional: Vec<&'a str>,
}

pub fn cmd_flows(ctx: &Context, command: Option<FlowsCommands>) -> Result<()> {
    match command {
        None | Some(FlowsCommands::List) => {
            let (registry, load) = FlowRegistry::for_project(&ctx.project_dir);
            let summaries: Vec<FlowSummary> = registry
                .iter()
                .map(|(name, def)| FlowSummary {
                    name,
                    source: if load.flows.contains_key(name) {
                        "project"
                    } else {
                        "builtin"
                    },
                    steps: &def.steps,
                    reviews: &def.reviews,
                    phased: &def.phased,
                    conditional: def.conditionals.iter().map(|c| c.step()).collect(),
                })
                .collect();
            print_json(&summaries)
        }
        Some(FlowsCommands::Validate) => {
            let path = flow::registry::flows_file(&ctx.project_dir);
            if !path.exists() {
                println!("No flows file at {}; builtin flows only.", path.display());
                return Ok(());
            }

            let load = flow::load(&ctx.project_dir);
            for (name, def) in &load.flows {
                println!(
                    "  {} {} ({} steps)",
                    console::style("✓").green(),
                    name,
                    def.steps.len()
                );
            }
            for warning in &load.warnings {
                println!("  {} {}", console::style("!").yellow(), warning);
            }
            for error in &load.errors {
                println!("  {} {}", console::style("✗").red(), error);
            }

            if !load.errors.is_empty() {
                bail!("{} has {} error(s)", path.display(), load.errors.len());
            }
            println!("Flows are valid.");
            Ok(())
        }
    }
}
