//! Configuration view and validation commands: `pipewright config`.

use anyhow::{Context as _, Result};

use pipewright::config::{PIPEWRIGHT_DIR, PipewrightConfig, PipewrightToml};

use super::super::ConfigCommands;
use super::Context;

pub fn cmd_config(ctx: &Context, command: Option<ConfigCommands>) -> Result<()> {
    let pw_dir = ctx.project_dir.join(PIPEWRIGHT_DIR);
    let config_path = pw_dir.join(pipewright::config::CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Pipewright Configuration");
            println!("========================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No pipewright.toml found. Using defaults.");
            }
            println!();

            let config = PipewrightConfig::new(&ctx.project_dir)?;
            let rendered = toml::to_string_pretty(&config.toml)
                .context("Failed to render configuration")?;
            println!("{}", rendered.trim_end());

            let retry = config.toml.effective_retry();
            if retry.max_retries != config.toml.retry.max_retries {
                println!();
                println!(
                    "Effective max_retries = {} (from {})",
                    retry.max_retries,
                    pipewright::config::ENV_MAX_RETRIES
                );
            }

            if !config_path.exists() {
                println!();
                println!("Run 'pipewright config init' to create a pipewright.toml file.");
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No pipewright.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = PipewrightToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("pipewright.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !pw_dir.exists() {
                std::fs::create_dir_all(&pw_dir)
                    .with_context(|| format!("Failed to create {}", pw_dir.display()))?;
            }

            PipewrightToml::default().save(&config_path)?;

            println!("Created pipewright.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [project] name, default_flow");
            println!("  - [retry] max_retries, base_backoff_secs, max_backoff_secs");
            println!("  - [review] max_iterations, personas, id_prefix");
            println!("  - [gates] steps that wait for approval");
            println!("  - [executors.steps] / [executors.patterns] per-step executors");
            println!();
        }
    }

    Ok(())
}
