//! Suspension controller: turns a pending gate into a durable paused run.
//!
//! Suspension is plain persisted data. Nothing waits in-process; a later
//! invocation (possibly a fresh process) re-opens the run, and resumption is
//! allowed only once the awaited gate has a decision.

use tracing::info;

use crate::errors::PipelineError;
use crate::gates::{DecisionGate, DecisionGateRequest, GateDeclarations, GateId, RequestStatus};
use crate::orchestrator::{PipelineRun, RunLedger};
use crate::stage::{RunStatus, StageStatus};
use crate::store::StateStore;

/// Outcome of trying to resume a run.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeCheck {
    /// The run is running again and its current stage may be re-invoked
    Resumed,
    /// The awaited gate is still undecided
    StillPending(DecisionGateRequest),
}

pub struct SuspensionController<'a> {
    ledger: &'a RunLedger,
    store: &'a StateStore,
    declarations: &'a GateDeclarations,
}

impl<'a> SuspensionController<'a> {
    pub fn new(
        ledger: &'a RunLedger,
        store: &'a StateStore,
        declarations: &'a GateDeclarations,
    ) -> Self {
        Self {
            ledger,
            store,
            declarations,
        }
    }

    /// Persist `run` as suspended on `gate`.
    pub fn suspend(&self, run: &mut PipelineRun, gate: &GateId) -> Result<(), PipelineError> {
        run.status = RunStatus::Suspended;
        run.current_stage = gate.stage;
        run.awaiting_gate = Some(gate.clone());
        self.ledger.save_run(run)?;
        info!(run_id = %run.run_id, gate = %gate, "Run suspended awaiting decision");
        Ok(())
    }

    /// Move a suspended run back to running if its gate has been decided.
    ///
    /// A run that is not suspended is left as is.
    pub fn prepare_resume(&self, run: &mut PipelineRun) -> Result<ResumeCheck, PipelineError> {
        if run.status != RunStatus::Suspended {
            return Ok(ResumeCheck::Resumed);
        }

        if let Some(gate) = run.awaiting_gate.clone() {
            let decisions = DecisionGate::new(self.store, self.declarations);
            if decisions.decision(&gate)?.is_none() {
                let request = match decisions.request(&gate)? {
                    Some(request) => request,
                    None => self.reconstruct_request(run, &gate)?,
                };
                info!(run_id = %run.run_id, gate = %gate, "Decision still pending");
                return Ok(ResumeCheck::StillPending(request));
            }
            info!(run_id = %run.run_id, gate = %gate, "Decision found, resuming");
        }

        run.status = RunStatus::Running;
        run.awaiting_gate = None;
        self.ledger.save_run(run)?;
        Ok(ResumeCheck::Resumed)
    }

    /// Mark an active run failed. Terminal: the run can never resume.
    pub fn abort(&self, run: &mut PipelineRun, reason: &str) -> Result<(), PipelineError> {
        if !run.status.is_active() {
            return Err(PipelineError::RunTerminal {
                run_id: run.run_id,
                status: run.status,
            });
        }

        let detail = format!("aborted: {}", reason);
        if let Some(mut record) = self.ledger.stage_record(run.run_id, run.current_stage)?
            && !record.status.is_terminal()
        {
            record.transition(StageStatus::Failed)?;
            record.error = Some(detail.clone());
            self.ledger.save_stage(&record)?;
        }

        run.status = RunStatus::Failed;
        run.awaiting_gate = None;
        run.error = Some(detail);
        self.ledger.save_run(run)?;
        info!(run_id = %run.run_id, stage = %run.current_stage, reason, "Run aborted");
        Ok(())
    }

    fn reconstruct_request(
        &self,
        run: &PipelineRun,
        gate: &GateId,
    ) -> Result<DecisionGateRequest, PipelineError> {
        let declaration = self.declarations.get(gate).ok_or_else(|| {
            PipelineError::Configuration(format!(
                "run {} awaits gate {} which is no longer declared",
                run.run_id, gate
            ))
        })?;
        Ok(DecisionGateRequest {
            gate: gate.clone(),
            question: declaration.question.clone(),
            options: declaration.options.clone(),
            status: RequestStatus::Pending,
            run_id: run.run_id,
            created_at: run.updated_at,
            resolved_at: None,
        })
    }
}
