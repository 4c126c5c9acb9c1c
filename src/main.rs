use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "pipewright")]
#[command(version, about = "Resumable delivery pipeline driver for external coding agents")]
pub struct Cli {
    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Feature directory holding the pipeline state (defaults to the current directory)
    #[arg(long, global = true)]
    pub feature_dir: Option<PathBuf>,

    /// Project root holding .pipewright/ (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a pipeline in the feature directory
    Intake {
        /// Flow name (defaults to project.default_flow)
        #[arg(long)]
        flow: Option<String>,
        /// Flow variant; `<flow>-<variant>` is preferred when it exists
        #[arg(long)]
        variant: Option<String>,
        /// Condition value for conditional steps (JSON, or a bare string)
        #[arg(long)]
        condition: Option<String>,
    },
    /// Print the next instruction as JSON
    Next {
        /// Also write the instruction's prompts into this directory
        #[arg(long)]
        prompt_dir: Option<PathBuf>,
    },
    /// Mark the current step as completed
    Complete { step: String },
    /// Record an implementation phase of the current step
    CompletePhase {
        phase: u32,
        /// The phase's work is committed
        #[arg(long)]
        committed: bool,
    },
    /// Report a failed dispatch of a step
    Fail {
        step: String,
        /// Exit code of the job; omit when it was killed by a signal
        #[arg(long)]
        exit_code: Option<i32>,
        /// File with the job's captured output ("-" for stdin)
        #[arg(long)]
        output_file: Option<PathBuf>,
    },
    /// Approve the pending gate
    Approve,
    /// Resume a paused or rate-limited pipeline, or re-sync an active one
    Resume,
    /// Pause an active pipeline
    Pause {
        #[arg(long, default_value = "paused by operator")]
        reason: String,
    },
    /// Show pipeline status
    Status {
        /// Human-readable output instead of JSON
        #[arg(long)]
        text: bool,
    },
    /// Feed the review-convergence loop
    Review {
        #[command(subcommand)]
        command: ReviewCommands,
    },
    /// List or validate flows
    Flows {
        #[command(subcommand)]
        command: Option<FlowsCommands>,
    },
    /// Validate the tasks document of the feature
    Tasks {
        /// Tasks document (defaults to tasks.md in the feature directory)
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ReviewCommands {
    /// Submit one round of reviewer outputs as PERSONA=FILE pairs ("-" for stdin)
    Submit {
        #[arg(required = true)]
        outputs: Vec<String>,
    },
    /// Submit the fixer's output ("-" for stdin)
    Fix { output: PathBuf },
}

#[derive(Subcommand, Clone)]
pub enum FlowsCommands {
    /// List builtin and project flows
    List,
    /// Validate .pipewright/flows.yaml
    Validate,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default pipewright.toml file
    Init,
}

fn init_tracing(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let project_dir = cli.project_dir.clone().unwrap_or_else(|| cwd.clone());
    let feature_dir = cli.feature_dir.clone().unwrap_or(cwd);
    let ctx = cmd::Context::new(project_dir, feature_dir);

    match &cli.command {
        Commands::Intake {
            flow,
            variant,
            condition,
        } => cmd::cmd_intake(&ctx, flow.as_deref(), variant.as_deref(), condition.as_deref())?,
        Commands::Next { prompt_dir } => cmd::cmd_next(&ctx, prompt_dir.as_deref())?,
        Commands::Complete { step } => cmd::cmd_complete(&ctx, step)?,
        Commands::CompletePhase { phase, committed } => {
            cmd::cmd_complete_phase(&ctx, *phase, *committed)?
        }
        Commands::Fail {
            step,
            exit_code,
            output_file,
        } => cmd::cmd_fail(&ctx, step, *exit_code, output_file.as_deref())?,
        Commands::Approve => cmd::cmd_approve(&ctx)?,
        Commands::Resume => cmd::cmd_resume(&ctx)?,
        Commands::Pause { reason } => cmd::cmd_pause(&ctx, reason)?,
        Commands::Status { text } => cmd::cmd_status(&ctx, *text)?,
        Commands::Review { command } => cmd::cmd_review(&ctx, command.clone())?,
        Commands::Flows { command } => cmd::cmd_flows(&ctx, command.clone())?,
        Commands::Tasks { file } => cmd::cmd_tasks(&ctx, file.as_deref())?,
        Commands::Config { command } => cmd::cmd_config(&ctx, command.clone())?,
    }

    Ok(())
}
