//! The ProjectSpec: the validated build request produced by intake.
//!
//! Intake writes its artifacts to the root of the `inputs` subarea; the engine
//! treats them as read-only.

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::errors::{PipelineError, StoreError};
use crate::gates::GateDeclarations;
use crate::stage::{
    ACCEPTANCE_FILE, CONSTRAINTS_FILE, GATES_FILE, NON_GOALS_FILE, PROJECT_SPEC_FILE,
    REQUIREMENTS_FILE, Stage,
};
use crate::store::{StateStore, Subarea};

#[derive(Debug, Deserialize)]
struct ProjectFile {
    project: ProjectInfo,
}

#[derive(Debug, Deserialize)]
struct ProjectInfo {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    domain: Option<String>,
}

/// Normalized build request.
#[derive(Debug, Clone)]
pub struct ProjectSpec {
    pub id: String,
    pub description: String,
    pub domain: Option<String>,
    pub requirements: String,
    pub constraints: String,
    pub non_goals: String,
    pub acceptance_criteria: String,
    pub gates: GateDeclarations,
    raw_spec: String,
}

impl ProjectSpec {
    /// Load from the intake artifacts in `store`.
    ///
    /// A missing intake document is a broken precondition of bootstrap; a
    /// malformed one is a configuration error.
    pub fn load(store: &StateStore) -> Result<Self, PipelineError> {
        let read = |name: &str| -> Result<String, PipelineError> {
            store.read(Subarea::Inputs, name).map_err(|e| match e {
                StoreError::NotFound { subarea, key } => PipelineError::Precondition {
                    stage: Stage::Bootstrap,
                    artifact: format!("{}/{}", subarea, key),
                },
                other => other.into(),
            })
        };

        let raw_spec = read(PROJECT_SPEC_FILE)?;
        let file: ProjectFile = serde_yaml::from_str(&raw_spec).map_err(|e| {
            PipelineError::Configuration(format!("{} is malformed: {}", PROJECT_SPEC_FILE, e))
        })?;
        let id = file.project.name.trim().to_string();
        if id.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "{}: project.name must not be empty",
                PROJECT_SPEC_FILE
            )));
        }

        let gates_path = store.path_of(Subarea::Inputs, GATES_FILE)?;
        let gates = GateDeclarations::load(&gates_path)
            .map_err(|e| PipelineError::Configuration(e.to_string()))?;

        Ok(Self {
            id,
            description: file.project.description,
            domain: file.project.domain,
            requirements: read(REQUIREMENTS_FILE)?,
            constraints: read(CONSTRAINTS_FILE)?,
            non_goals: read(NON_GOALS_FILE)?,
            acceptance_criteria: read(ACCEPTANCE_FILE)?,
            gates,
            raw_spec,
        })
    }

    /// Digest of the intake documents, excluding gate declarations.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            &self.raw_spec,
            &self.requirements,
            &self.constraints,
            &self.non_goals,
            &self.acceptance_criteria,
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }
}
