use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;

#[derive(Parser)]
#[command(name = "anvil")]
#[command(version, about = "Gated multi-stage build orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Skip confirmation prompts
    #[arg(long, global = true)]
    pub yes: bool,

    /// Project directory (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Provider kind, overriding anvil.toml and ANVIL_PROVIDER
    #[arg(long, global = true)]
    pub provider: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Continue the active run, or start a new one
    Start { project: Option<PathBuf> },
    /// Continue the active run after a decision has been recorded
    Resume { project: Option<PathBuf> },
    /// Show the current run, its stages and any pending decision
    Status { project: Option<PathBuf> },
    /// Terminally fail the active run
    Abort {
        project: Option<PathBuf>,
        /// Reason recorded on the run
        #[arg(short, long, default_value = "aborted by operator")]
        reason: String,
    },
    /// Record the decision for a gate (`<stage>:<axis>`)
    Decide {
        gate: String,
        /// One of the gate's options; prompts interactively when omitted
        choice: Option<String>,
        #[arg(short, long)]
        rationale: Option<String>,
    },
    /// List declared decision gates and their state
    Gates { project: Option<PathBuf> },
    /// Print the trace ledger
    Trace {
        project: Option<PathBuf>,
        /// Only entries of the current run
        #[arg(long)]
        current: bool,
    },
}

impl Commands {
    fn project(&self) -> Option<&PathBuf> {
        match self {
            Commands::Start { project }
            | Commands::Resume { project }
            | Commands::Status { project }
            | Commands::Abort { project, .. }
            | Commands::Gates { project }
            | Commands::Trace { project, .. } => project.as_ref(),
            Commands::Decide { .. } => None,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {:#}", console::style("error:").red().bold(), err);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let project_dir = match cli.command.project().or(cli.project_dir.as_ref()) {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    dotenvy::dotenv().ok();
    dotenvy::from_path(project_dir.join(".env")).ok();

    let config = anvil::config::Config::new(project_dir, cli.verbose, cli.provider.clone())?;
    let _log_guard = anvil::logging::init(
        cli.verbose,
        &config.log_dir,
        config.settings.logging.file,
    )?;

    match &cli.command {
        Commands::Start { .. } => cmd::cmd_start(config).await,
        Commands::Resume { .. } => cmd::cmd_resume(config).await,
        Commands::Status { .. } => cmd::cmd_status(config),
        Commands::Abort { reason, .. } => cmd::cmd_abort(config, reason, cli.yes),
        Commands::Decide {
            gate,
            choice,
            rationale,
        } => cmd::cmd_decide(config, gate, choice.as_deref(), rationale.clone()),
        Commands::Gates { .. } => cmd::cmd_gates(config),
        Commands::Trace { current, .. } => cmd::cmd_trace(config, *current),
    }
}
