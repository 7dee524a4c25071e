//! Stage definitions and per-stage execution records.
//!
//! This module provides:
//! - `Stage`, the fixed ordered set of pipeline stages
//! - the input/output contract of each stage against the state store
//! - `StageStatus` / `RunStatus` and their allowed transitions
//! - `StageRecord`, the persisted record of one stage within one run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::PipelineError;
use crate::gates::{DecisionRef, GateId};
use crate::store::{ArtifactRef, Subarea};

/// One ordered unit of pipeline work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Bootstrap,
    Design,
    Implement,
    Test,
    Verify,
}

/// Whether an input lives at the root of its subarea (written by intake)
/// or under the run's own directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Intake,
    Run,
}

/// An artifact a stage reads.
#[derive(Debug, Clone, Copy)]
pub struct StageInput {
    pub subarea: Subarea,
    pub name: &'static str,
    /// Placeholder name used by the stage's prompt template
    pub var: &'static str,
    pub scope: Scope,
    pub required: bool,
}

impl StageInput {
    const fn run(subarea: Subarea, name: &'static str, var: &'static str) -> Self {
        Self {
            subarea,
            name,
            var,
            scope: Scope::Run,
            required: true,
        }
    }

    const fn intake(name: &'static str, var: &'static str, required: bool) -> Self {
        Self {
            subarea: Subarea::Inputs,
            name,
            var,
            scope: Scope::Intake,
            required,
        }
    }

    /// Resolve this input to a concrete artifact for `run_id`.
    pub fn artifact(&self, run_id: Uuid) -> ArtifactRef {
        match self.scope {
            Scope::Intake => ArtifactRef::new(self.subarea, self.name),
            Scope::Run => ArtifactRef::run_scoped(self.subarea, run_id, self.name),
        }
    }
}

pub const PROJECT_SPEC_FILE: &str = "project_spec.yml";
pub const REQUIREMENTS_FILE: &str = "REQUIREMENTS.md";
pub const CONSTRAINTS_FILE: &str = "CONSTRAINTS.md";
pub const NON_GOALS_FILE: &str = "NON_GOALS.md";
pub const ACCEPTANCE_FILE: &str = "ACCEPTANCE_CRITERIA.md";
pub const GATES_FILE: &str = "DECISION_GATES.yml";

const BOOTSTRAP_INPUTS: &[StageInput] = &[
    StageInput::intake(PROJECT_SPEC_FILE, "project_spec", true),
    StageInput::intake(REQUIREMENTS_FILE, "requirements", true),
    StageInput::intake(CONSTRAINTS_FILE, "constraints", true),
    StageInput::intake(NON_GOALS_FILE, "non_goals", true),
    StageInput::intake(ACCEPTANCE_FILE, "acceptance_criteria", true),
    StageInput::intake(GATES_FILE, "decision_gates", false),
];

const DESIGN_INPUTS: &[StageInput] = &[
    StageInput::run(Subarea::Inputs, REQUIREMENTS_FILE, "requirements"),
    StageInput::run(Subarea::Inputs, CONSTRAINTS_FILE, "constraints"),
    StageInput::run(Subarea::Inputs, NON_GOALS_FILE, "non_goals"),
];

const IMPLEMENT_INPUTS: &[StageInput] = &[
    StageInput::run(Subarea::Designs, "ARCHITECTURE.md", "architecture"),
    StageInput::run(Subarea::Inputs, REQUIREMENTS_FILE, "requirements"),
    StageInput::run(Subarea::Inputs, CONSTRAINTS_FILE, "constraints"),
];

const TEST_INPUTS: &[StageInput] = &[
    StageInput::run(Subarea::Implementations, "IMPLEMENTATION.md", "implementation"),
    StageInput::run(Subarea::Inputs, REQUIREMENTS_FILE, "requirements"),
    StageInput::run(Subarea::Inputs, ACCEPTANCE_FILE, "acceptance_criteria"),
];

const VERIFY_INPUTS: &[StageInput] = &[
    StageInput::run(Subarea::Tests, "TEST_RESULTS.md", "test_results"),
    StageInput::run(Subarea::Inputs, ACCEPTANCE_FILE, "acceptance_criteria"),
    StageInput::run(Subarea::Inputs, REQUIREMENTS_FILE, "requirements"),
];

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Bootstrap,
        Stage::Design,
        Stage::Implement,
        Stage::Test,
        Stage::Verify,
    ];

    pub fn first() -> Stage {
        Stage::Bootstrap
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Bootstrap => "bootstrap",
            Stage::Design => "design",
            Stage::Implement => "implement",
            Stage::Test => "test",
            Stage::Verify => "verify",
        }
    }

    /// The stage that follows this one, or `None` after verify.
    pub fn next(self) -> Option<Stage> {
        let idx = Stage::ALL.iter().position(|s| *s == self)?;
        Stage::ALL.get(idx + 1).copied()
    }

    /// Subarea this stage exclusively writes to.
    pub fn subarea(self) -> Subarea {
        match self {
            Stage::Bootstrap => Subarea::Inputs,
            Stage::Design => Subarea::Designs,
            Stage::Implement => Subarea::Implementations,
            Stage::Test | Stage::Verify => Subarea::Tests,
        }
    }

    /// Artifacts this stage reads.
    pub fn inputs(self) -> &'static [StageInput] {
        match self {
            Stage::Bootstrap => BOOTSTRAP_INPUTS,
            Stage::Design => DESIGN_INPUTS,
            Stage::Implement => IMPLEMENT_INPUTS,
            Stage::Test => TEST_INPUTS,
            Stage::Verify => VERIFY_INPUTS,
        }
    }

    /// The single document produced by a generating stage.
    /// Bootstrap produces a snapshot of its inputs instead.
    pub fn output_name(self) -> Option<&'static str> {
        match self {
            Stage::Bootstrap => None,
            Stage::Design => Some("ARCHITECTURE.md"),
            Stage::Implement => Some("IMPLEMENTATION.md"),
            Stage::Test => Some("TEST_RESULTS.md"),
            Stage::Verify => Some("VERIFICATION.md"),
        }
    }

    /// Whether this stage's work is delegated to the text provider.
    pub fn uses_provider(self) -> bool {
        self != Stage::Bootstrap
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bootstrap" => Ok(Stage::Bootstrap),
            "design" => Ok(Stage::Design),
            "implement" => Ok(Stage::Implement),
            "test" => Ok(Stage::Test),
            "verify" => Ok(Stage::Verify),
            _ => anyhow::bail!(
                "Invalid stage '{}'. Valid values: bootstrap, design, implement, test, verify",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Failed)
    }

    /// Forward-only transitions. Suspended may only fail through an abort.
    pub fn can_transition_to(self, to: StageStatus) -> bool {
        use StageStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Running, Suspended)
                | (Running, Completed)
                | (Running, Failed)
                | (Suspended, Running)
                | (Suspended, Failed)
                | (Pending, Failed)
        )
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Suspended => "suspended",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Suspended,
    Completed,
    Failed,
}

impl RunStatus {
    /// Running and suspended runs hold the project's single active slot.
    pub fn is_active(self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Suspended)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Suspended => "suspended",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Persisted record of one stage within one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageRecord {
    pub run_id: Uuid,
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(default)]
    pub inputs: Vec<ArtifactRef>,
    #[serde(default)]
    pub outputs: Vec<ArtifactRef>,
    /// Decisions incorporated into this stage's outputs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decisions: Vec<DecisionRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awaiting_gate: Option<GateId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of times the executor entered `running`
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StageRecord {
    pub fn new(run_id: Uuid, stage: Stage) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            stage,
            status: StageStatus::Pending,
            inputs: Vec::new(),
            outputs: Vec::new(),
            decisions: Vec::new(),
            awaiting_gate: None,
            error: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `to`, enforcing the forward-only state machine.
    pub fn transition(&mut self, to: StageStatus) -> Result<(), PipelineError> {
        if !self.status.can_transition_to(to) {
            return Err(PipelineError::InvalidTransition {
                stage: self.stage,
                from: self.status,
                to,
            });
        }
        if to == StageStatus::Running {
            self.attempts += 1;
            self.awaiting_gate = None;
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_is_fixed() {
        assert_eq!(Stage::first(), Stage::Bootstrap);
        assert_eq!(Stage::Bootstrap.next(), Some(Stage::Design));
        assert_eq!(Stage::Design.next(), Some(Stage::Implement));
        assert_eq!(Stage::Implement.next(), Some(Stage::Test));
        assert_eq!(Stage::Test.next(), Some(Stage::Verify));
        assert_eq!(Stage::Verify.next(), None);
        assert!(Stage::Bootstrap < Stage::Verify);
    }

    #[test]
    fn test_stage_from_str_and_display() {
        for stage in Stage::ALL {
            let parsed: Stage = stage.to_string().parse().unwrap();
            assert_eq!(parsed, stage);
        }
        assert_eq!("DESIGN".parse::<Stage>().unwrap(), Stage::Design);
        assert!("deploy".parse::<Stage>().is_err());
    }

    #[test]
    fn test_stage_serializes_lowercase() {
        let json = serde_json::to_string(&Stage::Implement).unwrap();
        assert_eq!(json, "\"implement\"");
    }

    #[test]
    fn test_each_generating_stage_reads_previous_output() {
        let run = Uuid::new_v4();
        let implement_inputs: Vec<_> = Stage::Implement
            .inputs()
            .iter()
            .map(|i| i.artifact(run))
            .collect();
        assert!(
            implement_inputs
                .contains(&ArtifactRef::run_scoped(Subarea::Designs, run, "ARCHITECTURE.md"))
        );

        let verify_inputs: Vec<_> = Stage::Verify
            .inputs()
            .iter()
            .map(|i| i.artifact(run))
            .collect();
        assert!(verify_inputs.contains(&ArtifactRef::run_scoped(
            Subarea::Tests,
            run,
            "TEST_RESULTS.md"
        )));
    }

    #[test]
    fn test_bootstrap_reads_intake_root() {
        let run = Uuid::new_v4();
        let spec = Stage::Bootstrap.inputs()[0].artifact(run);
        assert_eq!(spec.key, PROJECT_SPEC_FILE);
        assert!(!Stage::Bootstrap.uses_provider());
        assert!(Stage::Bootstrap.output_name().is_none());
    }

    #[test]
    fn test_transitions_are_forward_only() {
        use StageStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Suspended.can_transition_to(Completed));
    }

    #[test]
    fn test_record_transition_counts_attempts() {
        let mut record = StageRecord::new(Uuid::new_v4(), Stage::Design);
        record.transition(StageStatus::Running).unwrap();
        record.transition(StageStatus::Suspended).unwrap();
        record.transition(StageStatus::Running).unwrap();
        assert_eq!(record.attempts, 2);
        record.transition(StageStatus::Completed).unwrap();

        let err = record.transition(StageStatus::Running).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
        assert_eq!(record.status, StageStatus::Completed);
    }

    #[test]
    fn test_run_status_active() {
        assert!(RunStatus::Running.is_active());
        assert!(RunStatus::Suspended.is_active());
        assert!(!RunStatus::Completed.is_active());
        assert!(!RunStatus::Failed.is_active());
    }
}
