//! Engine configuration read from `anvil.toml` at the project root.
//!
//! Settings are layered file → environment → CLI:
//!
//! ```toml
//! [provider]
//! kind = "command"          # command | anthropic | openai
//! model = "claude-sonnet-4-20250514"
//! command = "claude"
//! args = ["--print"]
//! timeout_secs = 600
//! max_tokens = 4096
//!
//! [retry]
//! max_attempts = 3
//! initial_backoff_ms = 500
//! max_backoff_ms = 8000
//!
//! [logging]
//! file = false
//! ```
//!
//! Environment overrides: `ANVIL_PROVIDER`, `ANVIL_MODEL`, `ANVIL_CMD`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CONFIG_FILE: &str = "anvil.toml";

pub const PROVIDER_KINDS: &[&str] = &["command", "anthropic", "openai"];

/// Text provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderSection {
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Program spawned by the `command` provider
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Override the API endpoint of the HTTP providers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

fn default_kind() -> String {
    "command".to_string()
}

fn default_command() -> String {
    "claude".to_string()
}

fn default_args() -> Vec<String> {
    vec!["--print".to_string()]
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            model: None,
            command: default_command(),
            args: default_args(),
            timeout_secs: default_timeout_secs(),
            max_tokens: default_max_tokens(),
            base_url: None,
        }
    }
}

/// Retry policy for transient provider failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LoggingSection {
    /// Also write JSON logs to `state/logs/`
    #[serde(default)]
    pub file: bool,
}

/// The complete anvil.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AnvilToml {
    #[serde(default)]
    pub provider: ProviderSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl AnvilToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse anvil.toml")
    }

    /// Load `anvil.toml` from the project root, or defaults if absent.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize anvil.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `ANVIL_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(kind) = lookup("ANVIL_PROVIDER") {
            self.provider.kind = kind;
        }
        if let Some(model) = lookup("ANVIL_MODEL") {
            self.provider.model = Some(model);
        }
        if let Some(cmd) = lookup("ANVIL_CMD") {
            self.provider.command = cmd;
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !PROVIDER_KINDS.contains(&self.provider.kind.as_str()) {
            warnings.push(format!(
                "Unknown provider kind '{}': expected one of {}",
                self.provider.kind,
                PROVIDER_KINDS.join(", ")
            ));
        }
        if self.provider.kind == "command" && self.provider.command.trim().is_empty() {
            warnings.push("provider.command is empty".to_string());
        }
        if self.provider.timeout_secs == 0 {
            warnings.push("provider.timeout_secs is 0; every call will time out".to_string());
        }
        if self.retry.max_attempts == 0 {
            warnings.push("retry.max_attempts is 0; treated as 1".to_string());
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            warnings.push(format!(
                "retry.initial_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.retry.initial_backoff_ms, self.retry.max_backoff_ms
            ));
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let toml = AnvilToml::default();
        assert_eq!(toml.provider.kind, "command");
        assert_eq!(toml.provider.command, "claude");
        assert_eq!(toml.provider.args, vec!["--print".to_string()]);
        assert_eq!(toml.provider.max_tokens, 4096);
        assert_eq!(toml.retry.max_attempts, 3);
        assert!(!toml.logging.file);
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_sections() {
        let content = r#"
[provider]
kind = "anthropic"
model = "claude-sonnet-4-20250514"

[retry]
max_attempts = 5
"#;
        let toml = AnvilToml::parse(content).unwrap();
        assert_eq!(toml.provider.kind, "anthropic");
        assert_eq!(
            toml.provider.model.as_deref(),
            Some("claude-sonnet-4-20250514")
        );
        assert_eq!(toml.provider.timeout_secs, 600);
        assert_eq!(toml.retry.max_attempts, 5);
        assert_eq!(toml.retry.initial_backoff_ms, 500);
    }

    #[test]
    fn test_parse_invalid() {
        assert!(AnvilToml::parse("[provider\nkind=").is_err());
    }

    #[test]
    fn test_load_or_default_and_save() {
        let dir = tempdir().unwrap();
        assert_eq!(
            AnvilToml::load_or_default(dir.path()).unwrap(),
            AnvilToml::default()
        );

        let mut toml = AnvilToml::default();
        toml.provider.kind = "openai".into();
        toml.logging.file = true;
        toml.save(&dir.path().join(CONFIG_FILE)).unwrap();

        let loaded = AnvilToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded, toml);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut toml = AnvilToml::parse("[provider]\nkind = \"anthropic\"\n").unwrap();
        let env: HashMap<&str, &str> = [
            ("ANVIL_PROVIDER", "command"),
            ("ANVIL_CMD", "/usr/local/bin/llm"),
            ("ANVIL_MODEL", ""),
        ]
        .into_iter()
        .collect();
        toml.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(toml.provider.kind, "command");
        assert_eq!(toml.provider.command, "/usr/local/bin/llm");
        // Empty values do not override
        assert!(toml.provider.model.is_none());
    }

    #[test]
    fn test_validate_warnings() {
        let content = r#"
[provider]
kind = "bard"
timeout_secs = 0

[retry]
max_attempts = 0
initial_backoff_ms = 10000
max_backoff_ms = 100
"#;
        let warnings = AnvilToml::parse(content).unwrap().validate();
        assert_eq!(warnings.len(), 4);
        assert!(warnings[0].contains("bard"));
    }
}
