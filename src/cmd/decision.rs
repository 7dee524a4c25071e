//! Decision gates: `anvil decide`, `anvil gates`.

use anyhow::{Context, Result};
use console::style;
use std::process::ExitCode;

use anvil::config::Config;
use anvil::gates::{GateId, RequestStatus, prompt_choice};
use anvil::orchestrator::Orchestrator;

use super::wrap;

fn resolver() -> String {
    std::env::var("USER").unwrap_or_else(|_| "operator".to_string())
}

pub fn cmd_decide(
    config: Config,
    gate: &str,
    choice: Option<&str>,
    rationale: Option<String>,
) -> Result<ExitCode> {
    let gate = GateId::parse(gate)?;
    let orchestrator = Orchestrator::new(config);

    let choice = match choice {
        Some(choice) => choice.to_string(),
        None => {
            let declaration = orchestrator
                .declaration(&gate)?
                .with_context(|| format!("Gate '{}' is not declared", gate))?;
            prompt_choice(&declaration)?
        }
    };

    let decision = orchestrator.decide(&gate, &choice, rationale, &resolver())?;
    println!(
        "{} {} = {}",
        style("Decided").green().bold(),
        decision.gate,
        decision.choice
    );
    println!("Run 'anvil resume' to continue the pipeline.");
    Ok(ExitCode::SUCCESS)
}

pub fn cmd_gates(config: Config) -> Result<ExitCode> {
    let orchestrator = Orchestrator::new(config);
    let gates = orchestrator.gates()?;

    if gates.is_empty() {
        println!("No decision gates declared.");
        return Ok(ExitCode::SUCCESS);
    }

    for gate in gates {
        let state = match (&gate.decision, &gate.request) {
            (Some(decision), _) => style(format!("decided: {}", decision.choice))
                .green()
                .to_string(),
            (None, Some(request)) if request.status == RequestStatus::Pending => {
                style("pending".to_string()).yellow().to_string()
            }
            _ => style("not raised".to_string()).dim().to_string(),
        };
        println!("{}  {}", style(gate.declaration.id()).cyan(), state);
        println!("{}", wrap(&gate.declaration.question, "    "));
        println!("    options: {}", gate.declaration.options.join(" | "));
        if let Some(rationale) = gate.decision.as_ref().and_then(|d| d.rationale.as_ref()) {
            println!("{}", wrap(&format!("rationale: {}", rationale), "    "));
        }
    }
    Ok(ExitCode::SUCCESS)
}
