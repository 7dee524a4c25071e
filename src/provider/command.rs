use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::TextProvider;
use crate::errors::ProviderError;

/// Runs a local program with the prompt on stdin and takes stdout as output.
pub struct CommandProvider {
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
    timeout: Duration,
    model: Option<String>,
}

impl CommandProvider {
    pub fn new(
        program: &str,
        args: Vec<String>,
        working_dir: &Path,
        timeout: Duration,
        model: Option<String>,
    ) -> Self {
        Self {
            program: program.to_string(),
            args,
            working_dir: working_dir.to_path_buf(),
            timeout,
            model,
        }
    }

    async fn run(&self, prompt: &str) -> Result<String, ProviderError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref model) = self.model {
            cmd.env("ANVIL_MODEL", model);
        }

        let mut child = cmd.spawn().map_err(|source| ProviderError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        debug!(program = %self.program, pid = child.id().unwrap_or(0), "Spawned provider command");

        // Feed stdin concurrently so a chatty child cannot deadlock on a full pipe
        let stdin_task = child.stdin.take().map(|mut stdin| {
            let prompt = prompt.to_string();
            tokio::spawn(async move {
                stdin.write_all(prompt.as_bytes()).await?;
                stdin.shutdown().await
            })
        });

        let output = child.wait_with_output().await.map_err(ProviderError::Io)?;
        if let Some(task) = stdin_task {
            // A child that exits without reading stdin is judged by its exit code
            let _ = task.await;
        }

        if !output.status.success() {
            return Err(ProviderError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let text = String::from_utf8_lossy(&output.stdout).to_string();
        if text.trim().is_empty() {
            return Err(ProviderError::InvalidResponse(
                "provider command produced no output".into(),
            ));
        }
        Ok(text)
    }
}

#[async_trait]
impl TextProvider for CommandProvider {
    fn id(&self) -> String {
        match self.model {
            Some(ref model) => format!("command:{}:{}", self.program, model),
            None => format!("command:{}", self.program),
        }
    }

    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        match tokio::time::timeout(self.timeout, self.run(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                secs: self.timeout.as_secs(),
            }),
        }
    }
}
