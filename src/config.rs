use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::anvil_config::AnvilToml;
use crate::stage::GATES_FILE;

/// Runtime configuration for anvil.
///
/// Resolves every path the engine touches once, from the project directory,
/// and carries the layered `anvil.toml` settings. Passed explicitly to the
/// orchestrator and the state store.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub trace_file: PathBuf,
    pub lock_file: PathBuf,
    pub log_dir: PathBuf,
    pub prompts_dir: PathBuf,
    pub gates_file: PathBuf,
    pub verbose: bool,
    pub settings: AnvilToml,
}

impl Config {
    /// Load configuration for `project_dir`: file, then environment, then
    /// the CLI provider override.
    pub fn new(
        project_dir: PathBuf,
        verbose: bool,
        provider_override: Option<String>,
    ) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;

        let mut settings = AnvilToml::load_or_default(&project_dir)?;
        settings.apply_env();
        if let Some(kind) = provider_override {
            settings.provider.kind = kind;
        }

        Ok(Self::with_settings(project_dir, verbose, settings))
    }

    /// Build from already-resolved settings.
    pub fn with_settings(project_dir: PathBuf, verbose: bool, settings: AnvilToml) -> Self {
        let state_dir = project_dir.join("state");
        Self {
            runs_dir: state_dir.join("runs"),
            trace_file: state_dir.join("TRACE.jsonl"),
            lock_file: state_dir.join("run.lock"),
            log_dir: state_dir.join("logs"),
            gates_file: state_dir.join("inputs").join(GATES_FILE),
            prompts_dir: project_dir.join("prompts"),
            state_dir,
            project_dir,
            verbose,
            settings,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir).context("Failed to create state directory")?;
        std::fs::create_dir_all(&self.runs_dir).context("Failed to create runs directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }
}
