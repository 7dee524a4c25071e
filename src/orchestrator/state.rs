use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::gates::GateId;
use crate::stage::{RunStatus, Stage, StageRecord};
use crate::store::{atomic_write, read_json, write_json};

/// One execution attempt over a project's ProjectSpec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub project_id: String,
    pub current_stage: Stage,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awaiting_gate: Option<GateId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Fingerprint of the ProjectSpec the run was created from
    pub spec_hash: String,
    /// Fingerprint of the gate declarations the run was created with
    pub gates_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(project_id: &str, spec_hash: &str, gates_hash: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            project_id: project_id.to_string(),
            current_stage: Stage::first(),
            status: RunStatus::Running,
            awaiting_gate: None,
            error: None,
            spec_hash: spec_hash.to_string(),
            gates_hash: gates_hash.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Persists runs and their stage records under `state/runs/`.
///
/// ```text
/// runs/CURRENT                    # id of the latest run
/// runs/<run-id>/run.json
/// runs/<run-id>/stages/<stage>.json
/// ```
pub struct RunLedger {
    runs_dir: PathBuf,
}

impl RunLedger {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    fn current_file(&self) -> PathBuf {
        self.runs_dir.join("CURRENT")
    }

    fn run_file(&self, run_id: Uuid) -> PathBuf {
        self.runs_dir.join(run_id.to_string()).join("run.json")
    }

    fn stage_file(&self, run_id: Uuid, stage: Stage) -> PathBuf {
        self.runs_dir
            .join(run_id.to_string())
            .join("stages")
            .join(format!("{}.json", stage))
    }

    /// The latest run for this project, whatever its status.
    pub fn current(&self) -> Result<Option<PipelineRun>, StoreError> {
        let path = self.current_file();
        let id = match fs::read_to_string(&path) {
            Ok(id) => id,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        let run_id = Uuid::parse_str(id.trim()).map_err(|_| StoreError::InvalidKey {
            key: id.trim().to_string(),
            reason: "CURRENT does not hold a run id",
        })?;
        self.load_run(run_id)
    }

    /// Create a run at the first stage and make it current.
    pub fn create(
        &self,
        project_id: &str,
        spec_hash: &str,
        gates_hash: &str,
    ) -> Result<PipelineRun, StoreError> {
        let mut run = PipelineRun::new(project_id, spec_hash, gates_hash);
        self.save_run(&mut run)?;
        atomic_write(&self.current_file(), run.run_id.to_string().as_bytes())?;
        Ok(run)
    }

    pub fn save_run(&self, run: &mut PipelineRun) -> Result<(), StoreError> {
        run.updated_at = Utc::now();
        write_json(&self.run_file(run.run_id), run)
    }

    pub fn load_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>, StoreError> {
        read_json(&self.run_file(run_id))
    }

    pub fn stage_record(
        &self,
        run_id: Uuid,
        stage: Stage,
    ) -> Result<Option<StageRecord>, StoreError> {
        read_json(&self.stage_file(run_id, stage))
    }

    /// Load the stage record, creating a pending one on first entry.
    pub fn ensure_stage(&self, run_id: Uuid, stage: Stage) -> Result<StageRecord, StoreError> {
        if let Some(record) = self.stage_record(run_id, stage)? {
            return Ok(record);
        }
        let record = StageRecord::new(run_id, stage);
        write_json(&self.stage_file(run_id, stage), &record)?;
        Ok(record)
    }

    pub fn save_stage(&self, record: &StageRecord) -> Result<(), StoreError> {
        write_json(&self.stage_file(record.run_id, record.stage), record)
    }

    /// Records that exist for a run, in stage order.
    pub fn stage_records(&self, run_id: Uuid) -> Result<Vec<StageRecord>, StoreError> {
        let mut records = Vec::new();
        for stage in Stage::ALL {
            if let Some(record) = self.stage_record(run_id, stage)? {
                records.push(record);
            }
        }
        Ok(records)
    }
}
