pub mod executor;
pub mod lock;
pub mod pipeline;
pub mod state;

pub use executor::{StageExecutor, StageOutcome};
pub use lock::{LockMarker, RunLock};
pub use pipeline::{GateStatus, Orchestrator, RunReport, StatusReport};
pub use state::{PipelineRun, RunLedger};
