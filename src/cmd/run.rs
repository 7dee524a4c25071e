//! Pipeline execution: `anvil start`, `anvil resume`, `anvil abort`.

use anyhow::{Context, Result};
use console::style;
use std::process::ExitCode;

use anvil::config::Config;
use anvil::orchestrator::{Orchestrator, RunReport};
use anvil::provider::build_provider;

use super::wrap;

pub async fn cmd_start(config: Config) -> Result<ExitCode> {
    config.ensure_directories()?;
    let provider = build_provider(&config.settings.provider, &config.project_dir)
        .context("Failed to configure provider")?;
    let orchestrator = Orchestrator::new(config);
    let report = orchestrator.start(provider.as_ref()).await?;
    Ok(print_report(orchestrator.config(), &report))
}

pub async fn cmd_resume(config: Config) -> Result<ExitCode> {
    let provider = build_provider(&config.settings.provider, &config.project_dir)
        .context("Failed to configure provider")?;
    let orchestrator = Orchestrator::new(config);
    let report = orchestrator.resume(provider.as_ref()).await?;
    Ok(print_report(orchestrator.config(), &report))
}

pub fn cmd_abort(config: Config, reason: &str, yes: bool) -> Result<ExitCode> {
    if !yes {
        let confirmed = dialoguer::Confirm::new()
            .with_prompt("Abort the active run? This cannot be undone")
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Abort cancelled.");
            return Ok(ExitCode::SUCCESS);
        }
    }

    let orchestrator = Orchestrator::new(config);
    let run = orchestrator.abort(reason)?;
    println!(
        "{} run {} at stage {}",
        style("Aborted").red().bold(),
        run.run_id,
        run.current_stage
    );
    Ok(ExitCode::SUCCESS)
}

/// Print the user-facing outcome and map it to the process exit code.
pub(crate) fn print_report(config: &Config, report: &RunReport) -> ExitCode {
    println!();
    match report {
        RunReport::Completed { run, outputs } => {
            println!(
                "{} run {} ({})",
                style("Completed").green().bold(),
                run.run_id,
                run.project_id
            );
            println!();
            println!("Artifacts:");
            for output in outputs {
                let path = config
                    .state_dir
                    .join(output.subarea.dir_name())
                    .join(&output.key);
                println!("  {}", path.display());
            }
        }
        RunReport::Suspended { run, request } => {
            println!(
                "{} run {} at stage {}",
                style("Suspended").yellow().bold(),
                run.run_id,
                run.current_stage
            );
            println!();
            println!("Decision required: {}", style(&request.gate).cyan());
            println!("{}", wrap(&request.question, "  "));
            println!();
            println!("Options:");
            for option in &request.options {
                println!("  - {}", option);
            }
            println!();
            println!(
                "Record a decision with 'anvil decide {} <choice>', then run 'anvil resume'.",
                request.gate
            );
        }
        RunReport::Failed { run, stage, error } => {
            println!(
                "{} run {} at stage {}",
                style("Failed").red().bold(),
                run.run_id,
                stage
            );
            println!("{}", wrap(&error.to_string(), "  "));
        }
    }
    println!();
    ExitCode::from(report.exit_code())
}
