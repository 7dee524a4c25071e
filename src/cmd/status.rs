//! Read-only views: `anvil status`, `anvil trace`.

use anyhow::Result;
use console::style;
use std::process::ExitCode;

use anvil::audit::short_hash;
use anvil::config::Config;
use anvil::orchestrator::Orchestrator;
use anvil::stage::StageStatus;

use super::wrap;

fn styled_status(status: StageStatus) -> String {
    match status {
        StageStatus::Completed => style(status).green().to_string(),
        StageStatus::Failed => style(status).red().to_string(),
        StageStatus::Suspended => style(status).yellow().to_string(),
        StageStatus::Running => style(status).cyan().to_string(),
        StageStatus::Pending => style(status).dim().to_string(),
    }
}

pub fn cmd_status(config: Config) -> Result<ExitCode> {
    let orchestrator = Orchestrator::new(config);
    let report = orchestrator.status()?;

    println!();
    println!("Anvil Pipeline Status");
    println!("=====================");
    println!();
    println!(
        "Project dir: {}",
        orchestrator.config().project_dir.display()
    );
    if let Some(ref description) = report.description {
        println!("{}", wrap(description, "             "));
    }
    if let Some(ref domain) = report.domain {
        println!("Domain:      {}", domain);
    }

    let Some(run) = report.run else {
        println!("Run:         none");
        println!();
        println!("Run 'anvil start' to begin.");
        println!();
        return Ok(ExitCode::SUCCESS);
    };

    println!("Run:         {} ({})", run.run_id, run.project_id);
    println!("Status:      {}", run.status);
    println!("Stage:       {}", run.current_stage);
    println!(
        "Updated:     {}",
        run.updated_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(ref error) = run.error {
        println!("Error:       {}", error);
    }

    println!();
    println!("Stages:");
    for record in &report.stages {
        println!(
            "  {:<10} {:<20} attempts {}",
            record.stage.as_str(),
            styled_status(record.status),
            record.attempts
        );
    }

    if let Some(request) = report.awaiting {
        println!();
        println!("Awaiting decision: {}", style(&request.gate).cyan());
        println!("{}", wrap(&request.question, "  "));
        println!("  options: {}", request.options.join(" | "));
    }

    println!();
    println!(
        "Trace entries: {} ({})",
        report.trace_len,
        report.trace_file.display()
    );
    if report.lock_held {
        println!("Lock:          held by another invocation");
    }
    for warning in &report.warnings {
        println!("{} {}", style("warning:").yellow(), warning);
    }
    println!();
    Ok(ExitCode::SUCCESS)
}

pub fn cmd_trace(config: Config, current_only: bool) -> Result<ExitCode> {
    let orchestrator = Orchestrator::new(config);
    let entries = orchestrator.trace(current_only)?;

    if entries.is_empty() {
        println!("No trace entries.");
        return Ok(ExitCode::SUCCESS);
    }

    for entry in &entries {
        let decisions: Vec<String> = entry
            .decisions
            .iter()
            .map(|d| format!("{}={}", d.gate, d.choice))
            .collect();
        println!(
            "{:>4}  {}  {:<10} in {} out {}  {}{}",
            entry.sequence,
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.stage.as_str(),
            short_hash(&entry.input_hash),
            short_hash(&entry.output_hash),
            entry.provider.as_deref().unwrap_or("-"),
            if decisions.is_empty() {
                String::new()
            } else {
                format!("  [{}]", decisions.join(", "))
            }
        );
    }
    Ok(ExitCode::SUCCESS)
}
