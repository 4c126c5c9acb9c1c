//! Review-loop commands: `pipewright review submit` and `review fix`.

use anyhow::{Result, bail};
use std::path::Path;

use super::super::ReviewCommands;
use super::{Context, print_json, read_input};

pub fn cmd_review(ctx: &Context, command: ReviewCommands) -> Result<()> {
    let config = ctx.load_config()?;
    let runner = ctx.runner(&config);

    match command {
        ReviewCommands::Submit { outputs } => {
            let submissions = outputs
                .iter()
                .map(|pair| parse_submission(pair))
                .collect::<Result<Vec<_>>>()?;
            let outcome = runner.submit_reviews(&submissions)?;
            print_json(&outcome)
        }
        ReviewCommands::Fix { output } => {
            let raw = read_input(&output)?;
            let outcome = runner.submit_fix(&raw)?;
            print_json(&outcome)
        }
    }
}

/// Split `PERSONA=FILE` and read the file.
fn parse_submission(pair: &str) -> Result<(String, String)> {
    let Some((persona, file)) = pair.split_once('=') else {
        bail!("Expected PERSONA=FILE, got '{}'", pair);
    };
    let persona = persona.trim();
    if persona.is_empty() || file.is_empty() {
        bail!("Expected PERSONA=FILE, got '{}'", pair);
    }
    Ok((persona.to_string(), read_input(Path::new(file))?))
}
