//! Trace spine: the append-only record of every completed stage execution.
//!
//! Each entry correlates what ran with content hashes of its inputs and
//! outputs, the provider and prompt used, and the decisions that unblocked it.

mod recorder;

pub use recorder::TraceRecorder;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gates::DecisionRef;
use crate::stage::Stage;

/// One line of `TRACE.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub sequence: u64,
    pub run_id: Uuid,
    pub stage: Stage,
    pub input_hash: String,
    pub output_hash: String,
    /// Provider identifier, absent for stages that make no provider call
    pub provider: Option<String>,
    pub prompt_hash: Option<String>,
    #[serde(default)]
    pub decisions: Vec<DecisionRef>,
    pub timestamp: DateTime<Utc>,
}

/// An entry before the recorder assigns its sequence number and timestamp.
#[derive(Debug, Clone)]
pub struct NewTraceEntry {
    pub run_id: Uuid,
    pub stage: Stage,
    pub input_hash: String,
    pub output_hash: String,
    pub provider: Option<String>,
    pub prompt_hash: Option<String>,
    pub decisions: Vec<DecisionRef>,
}

impl NewTraceEntry {
    fn into_entry(self, sequence: u64) -> TraceEntry {
        TraceEntry {
            sequence,
            run_id: self.run_id,
            stage: self.stage,
            input_hash: self.input_hash,
            output_hash: self.output_hash,
            provider: self.provider,
            prompt_hash: self.prompt_hash,
            decisions: self.decisions,
            timestamp: Utc::now(),
        }
    }
}

/// Short form of a content hash for display.
pub fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
