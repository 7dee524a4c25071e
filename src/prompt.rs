//! Per-stage prompt templates.
//!
//! Defaults are embedded in the binary from `prompts/`; a project may
//! override any of them with `<project>/prompts/<stage>.txt`. Templates use
//! `{name}` placeholders; unknown placeholders are left as written.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use rust_embed::RustEmbed;

use crate::errors::PipelineError;
use crate::gates::{Decision, GateDeclaration};
use crate::stage::Stage;

#[derive(RustEmbed)]
#[folder = "$CARGO_MANIFEST_DIR/prompts/"]
struct DefaultPrompts;

static PLACEHOLDER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_]+)\}").unwrap());

/// Resolves the template for a stage.
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    override_dir: PathBuf,
}

impl PromptLibrary {
    pub fn new(override_dir: impl Into<PathBuf>) -> Self {
        Self {
            override_dir: override_dir.into(),
        }
    }

    pub fn template(&self, stage: Stage) -> Result<String, PipelineError> {
        let file_name = format!("{}.txt", stage);
        let override_path = self.override_dir.join(&file_name);
        if override_path.is_file() {
            return std::fs::read_to_string(&override_path).map_err(|e| {
                PipelineError::Configuration(format!(
                    "Failed to read prompt override {}: {}",
                    override_path.display(),
                    e
                ))
            });
        }

        let embedded = DefaultPrompts::get(&file_name).ok_or_else(|| {
            PipelineError::Configuration(format!("No prompt template for stage {}", stage))
        })?;
        Ok(String::from_utf8_lossy(&embedded.data).into_owned())
    }
}

/// Substitute `{name}` placeholders from `vars`.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    PLACEHOLDER_REGEX
        .replace_all(template, |caps: &regex::Captures| {
            let name = &caps[1];
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Section describing decisions already made, empty when there are none.
pub fn decisions_context(decisions: &[Decision]) -> String {
    if decisions.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n## Decisions already made\n");
    for decision in decisions {
        out.push_str(&format!("- {}: {}", decision.gate.axis, decision.choice));
        if let Some(ref rationale) = decision.rationale {
            out.push_str(&format!(" ({})", rationale));
        }
        out.push('\n');
    }
    out
}

/// The declared axes a stage may raise, with their options.
pub fn axes_context<'a>(declarations: impl Iterator<Item = &'a GateDeclaration>) -> String {
    let lines: Vec<String> = declarations
        .map(|d| format!("- {}: {} (options: {})", d.axis, d.question, d.options.join(" | ")))
        .collect();
    if lines.is_empty() {
        "None. Do not emit DECISION_REQUIRED.".to_string()
    } else {
        lines.join("\n")
    }
}
