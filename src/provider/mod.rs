//! Text-generation providers.
//!
//! The pipeline only sees the `TextProvider` capability; which backend sits
//! behind it is decided once, from configuration, by `build_provider`.

mod command;
mod http;

pub use command::CommandProvider;
pub use http::{AnthropicProvider, OpenAiProvider};

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::anvil_config::{ProviderSection, RetrySection};
use crate::errors::ProviderError;

/// Generates text for a prompt.
#[async_trait]
pub trait TextProvider: Send + Sync {
    /// Identifier recorded in the trace, e.g. `anthropic:claude-sonnet-4-20250514`.
    fn id(&self) -> String;

    async fn generate(&self, prompt: &str) -> Result<String, ProviderError>;
}

/// Bounded retry with capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn from_section(section: &RetrySection) -> Self {
        Self {
            max_attempts: section.max_attempts.max(1),
            initial_backoff: Duration::from_millis(section.initial_backoff_ms),
            max_backoff: Duration::from_millis(section.max_backoff_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based count of failures so far).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// The last error from a provider call that will not be retried further.
#[derive(Debug)]
pub struct RetryFailure {
    pub attempts: u32,
    pub error: ProviderError,
}

/// Call `provider` until it succeeds, fails fatally, or attempts run out.
pub async fn generate_with_retry(
    provider: &dyn TextProvider,
    prompt: &str,
    policy: &RetryPolicy,
) -> Result<(String, u32), RetryFailure> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match provider.generate(prompt).await {
            Ok(text) => return Ok((text, attempt)),
            Err(error) if error.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    provider = %provider.id(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient provider failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                return Err(RetryFailure {
                    attempts: attempt,
                    error,
                });
            }
        }
    }
}

/// Construct the configured provider.
pub fn build_provider(
    section: &ProviderSection,
    project_dir: &Path,
) -> Result<Box<dyn TextProvider>, ProviderError> {
    let timeout = Duration::from_secs(section.timeout_secs);
    match section.kind.as_str() {
        "command" => Ok(Box::new(CommandProvider::new(
            &section.command,
            section.args.clone(),
            project_dir,
            timeout,
            section.model.clone(),
        ))),
        "anthropic" => Ok(Box::new(AnthropicProvider::from_env(
            section.model.clone(),
            section.max_tokens,
            timeout,
            section.base_url.clone(),
        )?)),
        "openai" => Ok(Box::new(OpenAiProvider::from_env(
            section.model.clone(),
            section.max_tokens,
            timeout,
            section.base_url.clone(),
        )?)),
        other => Err(ProviderError::UnknownKind(other.to_string())),
    }
}
