//! Typed error hierarchy for the anvil orchestrator.
//!
//! One enum per subsystem, converging on `PipelineError`:
//! - `StoreError`: state store and run ledger I/O
//! - `TraceError`: trace ledger appends and replay
//! - `GateError`: gate declarations, requests and decisions
//! - `ProviderError`: text-generation collaborator calls
//! - `PipelineError`: stage executor and orchestrator failures

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::stage::{RunStatus, Stage, StageStatus};
use crate::store::Subarea;

/// Errors from the state store and the run ledger.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Artifact {subarea}/{key} not found")]
    NotFound { subarea: Subarea, key: String },

    #[error("Invalid artifact key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("Stage {stage} may not write to the {subarea} subarea")]
    NotOwner { stage: Stage, subarea: Subarea },

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors from the append-only trace ledger.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("Failed to access trace ledger {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to lock trace ledger {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Trace ledger corrupted at line {line}: {reason}")]
    Corrupted { line: usize, reason: String },

    #[error("Failed to encode trace entry: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Trace writer lock poisoned")]
    LockPoisoned,
}

/// Errors from decision gate declarations and resolution.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Gate '{gate}' is not declared")]
    Undeclared { gate: String },

    #[error("Invalid gate identifier '{0}': expected <stage>:<axis>")]
    InvalidGateId(String),

    #[error("Invalid gate declaration: {0}")]
    InvalidDeclaration(String),

    #[error("Failed to parse gate declarations {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("'{choice}' is not an option for gate '{gate}' (options: {})", options.join(", "))]
    InvalidChoice {
        gate: String,
        choice: String,
        options: Vec<String>,
    },

    #[error("Gate '{gate}' was already resolved with '{choice}'")]
    AlreadyResolved { gate: String, choice: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from a text-generation provider call.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Failed to spawn provider command '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Provider command exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("Provider call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Provider request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("Missing credential: set {var}")]
    MissingCredential { var: &'static str },

    #[error("Unexpected provider response: {0}")]
    InvalidResponse(String),

    #[error("Unknown provider kind '{0}'")]
    UnknownKind(String),

    #[error("Provider I/O failed: {0}")]
    Io(#[source] std::io::Error),
}

impl ProviderError {
    /// Whether a retry has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::NonZeroExit { .. } | ProviderError::Timeout { .. } => true,
            ProviderError::Http { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Request(e) => e.is_timeout() || e.is_connect(),
            ProviderError::Io(_) => true,
            _ => false,
        }
    }
}

/// Errors from the stage executor and pipeline orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Stage {stage} is missing required input {artifact}")]
    Precondition { stage: Stage, artifact: String },

    #[error("Stage {stage} gave up after {attempts} attempt(s): {source}")]
    ExternalExhausted {
        stage: Stage,
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("Failed to record trace for stage {stage}: {source}")]
    TraceWrite {
        stage: Stage,
        #[source]
        source: TraceError,
    },

    #[error("Run lock {path} is held by another invocation ({holder})")]
    RunLocked { path: PathBuf, holder: String },

    #[error("No active run for this project")]
    NoActiveRun,

    #[error("Run {run_id} is {status} and cannot continue")]
    RunTerminal { run_id: Uuid, status: RunStatus },

    #[error("Stage {stage} cannot move from {from} to {to}")]
    InvalidTransition {
        stage: Stage,
        from: StageStatus,
        to: StageStatus,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_not_found_names_artifact() {
        let err = StoreError::NotFound {
            subarea: Subarea::Designs,
            key: "abc/ARCHITECTURE.md".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Artifact designs/abc/ARCHITECTURE.md not found"
        );
    }

    #[test]
    fn provider_error_transient_classification() {
        assert!(ProviderError::Timeout { secs: 5 }.is_transient());
        assert!(
            ProviderError::NonZeroExit {
                code: 1,
                stderr: String::new()
            }
            .is_transient()
        );
        assert!(
            ProviderError::Http {
                status: 429,
                body: String::new()
            }
            .is_transient()
        );
        assert!(
            ProviderError::Http {
                status: 503,
                body: String::new()
            }
            .is_transient()
        );
        assert!(
            !ProviderError::Http {
                status: 401,
                body: String::new()
            }
            .is_transient()
        );
        assert!(!ProviderError::MissingCredential { var: "X" }.is_transient());
    }

    #[test]
    fn gate_error_invalid_choice_lists_options() {
        let err = GateError::InvalidChoice {
            gate: "design:architecture-choice".into(),
            choice: "C".into(),
            options: vec!["A".into(), "B".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("'C'"));
        assert!(msg.contains("A, B"));
    }

    #[test]
    fn pipeline_error_converts_from_store_error() {
        let inner = StoreError::InvalidKey {
            key: "../x".into(),
            reason: "parent components are not allowed",
        };
        let err: PipelineError = inner.into();
        assert!(matches!(
            err,
            PipelineError::Store(StoreError::InvalidKey { .. })
        ));
    }

    #[test]
    fn precondition_error_carries_stage() {
        let err = PipelineError::Precondition {
            stage: Stage::Implement,
            artifact: "designs/r/ARCHITECTURE.md".into(),
        };
        match &err {
            PipelineError::Precondition { stage, .. } => assert_eq!(*stage, Stage::Implement),
            _ => panic!("Expected Precondition"),
        }
        assert!(err.to_string().contains("implement"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&TraceError::LockPoisoned);
        assert_std_error(&GateError::InvalidGateId("x".into()));
        assert_std_error(&PipelineError::NoActiveRun);
        assert_std_error(&ProviderError::UnknownKind("x".into()));
    }
}
