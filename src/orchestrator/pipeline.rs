use std::path::PathBuf;

use tracing::{error, info};

use crate::audit::{TraceEntry, TraceRecorder};
use crate::config::Config;
use crate::errors::PipelineError;
use crate::gates::{
    Decision, DecisionGate, DecisionGateRequest, GateDeclaration, GateDeclarations, GateId,
};
use crate::orchestrator::{PipelineRun, RunLedger, RunLock, StageExecutor, StageOutcome};
use crate::project::ProjectSpec;
use crate::prompt::PromptLibrary;
use crate::provider::{RetryPolicy, TextProvider};
use crate::stage::{RunStatus, Stage, StageRecord, StageStatus};
use crate::store::{ArtifactRef, StateStore};
use crate::suspension::{ResumeCheck, SuspensionController};

/// Where an invocation left the run.
#[derive(Debug)]
pub enum RunReport {
    Completed {
        run: PipelineRun,
        outputs: Vec<ArtifactRef>,
    },
    Suspended {
        run: PipelineRun,
        request: DecisionGateRequest,
    },
    Failed {
        run: PipelineRun,
        stage: Stage,
        error: PipelineError,
    },
}

impl RunReport {
    pub fn run(&self) -> &PipelineRun {
        match self {
            RunReport::Completed { run, .. }
            | RunReport::Suspended { run, .. }
            | RunReport::Failed { run, .. } => run,
        }
    }

    /// Process exit code: completed 0, failed 1, suspended 2.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunReport::Completed { .. } => 0,
            RunReport::Failed { .. } => 1,
            RunReport::Suspended { .. } => 2,
        }
    }
}

/// Snapshot of a project's pipeline state.
#[derive(Debug)]
pub struct StatusReport {
    /// Intake description and domain, when the intake is readable
    pub description: Option<String>,
    pub domain: Option<String>,
    pub run: Option<PipelineRun>,
    pub stages: Vec<StageRecord>,
    pub awaiting: Option<DecisionGateRequest>,
    pub trace_len: usize,
    pub trace_file: PathBuf,
    pub lock_held: bool,
    pub warnings: Vec<String>,
}

/// A declared gate and how far it has progressed.
#[derive(Debug)]
pub struct GateStatus {
    pub declaration: GateDeclaration,
    pub request: Option<DecisionGateRequest>,
    pub decision: Option<Decision>,
}

/// Sequences the stages of a project's pipeline.
///
/// All state is recovered from the state directory on every call; nothing
/// about a run lives in process memory between invocations.
pub struct Orchestrator {
    config: Config,
    store: StateStore,
    ledger: RunLedger,
    trace: TraceRecorder,
    prompts: PromptLibrary,
    retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        Self {
            store: StateStore::new(&config.state_dir),
            ledger: RunLedger::new(&config.runs_dir),
            trace: TraceRecorder::new(&config.trace_file),
            prompts: PromptLibrary::new(&config.prompts_dir),
            retry: RetryPolicy::from_section(&config.settings.retry),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Continue the active run, or start a new one if there is none.
    pub async fn start(&self, provider: &dyn TextProvider) -> Result<RunReport, PipelineError> {
        let _lock = RunLock::acquire(&self.config.lock_file, "start")?;
        self.store.init()?;

        match self.ledger.current()? {
            Some(run) if run.status.is_active() => {
                info!(run_id = %run.run_id, status = %run.status, "Continuing active run");
                self.continue_run(run, provider).await
            }
            Some(run) if run.status == RunStatus::Completed => self.completed_report(run),
            _ => {
                let spec = ProjectSpec::load(&self.store)?;
                let run = self.ledger.create(
                    &spec.id,
                    &spec.fingerprint(),
                    &spec.gates.fingerprint(),
                )?;
                info!(run_id = %run.run_id, project = %spec.id, "Created run");
                self.drive(run, &spec.gates, provider).await
            }
        }
    }

    /// Continue the active run. Never creates a new run.
    pub async fn resume(&self, provider: &dyn TextProvider) -> Result<RunReport, PipelineError> {
        let _lock = RunLock::acquire(&self.config.lock_file, "resume")?;

        match self.ledger.current()? {
            None => Err(PipelineError::NoActiveRun),
            Some(run) if run.status == RunStatus::Completed => self.completed_report(run),
            Some(run) if run.status == RunStatus::Failed => Err(PipelineError::RunTerminal {
                run_id: run.run_id,
                status: run.status,
            }),
            Some(run) => self.continue_run(run, provider).await,
        }
    }

    async fn continue_run(
        &self,
        mut run: PipelineRun,
        provider: &dyn TextProvider,
    ) -> Result<RunReport, PipelineError> {
        let spec = match ProjectSpec::load(&self.store) {
            Ok(spec) => spec,
            Err(err @ PipelineError::Precondition { .. }) => {
                let stage = run.current_stage;
                return self.fail_run(run, stage, err);
            }
            Err(err) => return Err(err),
        };
        self.check_unchanged(&run, &spec)?;

        let controller = SuspensionController::new(&self.ledger, &self.store, &spec.gates);
        match controller.prepare_resume(&mut run)? {
            ResumeCheck::StillPending(request) => Ok(RunReport::Suspended { run, request }),
            ResumeCheck::Resumed => self.drive(run, &spec.gates, provider).await,
        }
    }

    /// Intake and gate declarations are fixed for the lifetime of a run.
    fn check_unchanged(&self, run: &PipelineRun, spec: &ProjectSpec) -> Result<(), PipelineError> {
        if run.spec_hash != spec.fingerprint() {
            return Err(PipelineError::Configuration(format!(
                "project inputs changed since run {} started; abort it and start a new run",
                run.run_id
            )));
        }
        if run.gates_hash != spec.gates.fingerprint() {
            return Err(PipelineError::Configuration(format!(
                "decision gate declarations changed since run {} started; abort it and start a new run",
                run.run_id
            )));
        }
        Ok(())
    }

    async fn drive(
        &self,
        mut run: PipelineRun,
        declarations: &GateDeclarations,
        provider: &dyn TextProvider,
    ) -> Result<RunReport, PipelineError> {
        let executor = StageExecutor::new(
            &self.store,
            &self.ledger,
            &self.trace,
            declarations,
            &self.prompts,
            provider,
            self.retry,
        );
        let controller = SuspensionController::new(&self.ledger, &self.store, declarations);

        let mut stage = run.current_stage;
        loop {
            if run.current_stage != stage || run.status != RunStatus::Running {
                run.current_stage = stage;
                run.status = RunStatus::Running;
                self.ledger.save_run(&mut run)?;
            }

            match executor.execute(stage, &run).await {
                StageOutcome::Completed(_) => match stage.next() {
                    Some(next) => stage = next,
                    None => {
                        run.status = RunStatus::Completed;
                        self.ledger.save_run(&mut run)?;
                        info!(run_id = %run.run_id, "Run completed");
                        return self.completed_report(run);
                    }
                },
                StageOutcome::Suspended(request) => {
                    controller.suspend(&mut run, &request.gate)?;
                    return Ok(RunReport::Suspended { run, request });
                }
                StageOutcome::Failed(err) => return self.fail_run(run, stage, err),
            }
        }
    }

    /// Mark `run` and its stage at `stage` failed with `err`.
    fn fail_run(
        &self,
        mut run: PipelineRun,
        stage: Stage,
        err: PipelineError,
    ) -> Result<RunReport, PipelineError> {
        if let Some(mut record) = self.ledger.stage_record(run.run_id, stage)?
            && !record.status.is_terminal()
        {
            record.transition(StageStatus::Failed)?;
            record.error = Some(err.to_string());
            self.ledger.save_stage(&record)?;
        }
        run.status = RunStatus::Failed;
        run.awaiting_gate = None;
        run.error = Some(err.to_string());
        self.ledger.save_run(&mut run)?;
        error!(run_id = %run.run_id, %stage, error = %err, "Run failed");
        Ok(RunReport::Failed {
            run,
            stage,
            error: err,
        })
    }

    fn completed_report(&self, run: PipelineRun) -> Result<RunReport, PipelineError> {
        let outputs = self
            .ledger
            .stage_records(run.run_id)?
            .into_iter()
            .flat_map(|r| r.outputs)
            .collect();
        Ok(RunReport::Completed { run, outputs })
    }

    fn declarations(&self) -> Result<GateDeclarations, PipelineError> {
        Ok(GateDeclarations::load(&self.config.gates_file)?)
    }

    pub fn status(&self) -> Result<StatusReport, PipelineError> {
        let run = self.ledger.current()?;
        let stages = match run {
            Some(ref run) => self.ledger.stage_records(run.run_id)?,
            None => Vec::new(),
        };

        let mut awaiting = None;
        if let Some(ref run) = run
            && let Some(ref gate) = run.awaiting_gate
        {
            let declarations = self.declarations()?;
            awaiting = DecisionGate::new(&self.store, &declarations).request(gate)?;
        }

        let (description, domain) = match ProjectSpec::load(&self.store) {
            Ok(spec) => (Some(spec.description), spec.domain),
            Err(_) => (None, None),
        };

        Ok(StatusReport {
            description,
            domain,
            run,
            stages,
            awaiting,
            trace_len: self.trace.len()?,
            trace_file: self.trace.path().to_path_buf(),
            lock_held: RunLock::is_held(&self.config.lock_file),
            warnings: self.config.settings.validate(),
        })
    }

    /// Terminally fail the active run.
    pub fn abort(&self, reason: &str) -> Result<PipelineRun, PipelineError> {
        let _lock = RunLock::acquire(&self.config.lock_file, "abort")?;
        let mut run = self.ledger.current()?.ok_or(PipelineError::NoActiveRun)?;
        let declarations = self.declarations()?;
        SuspensionController::new(&self.ledger, &self.store, &declarations)
            .abort(&mut run, reason)?;
        Ok(run)
    }

    /// Record the decision for a gate. The run itself is only advanced by a
    /// later `start`/`resume`.
    pub fn decide(
        &self,
        gate: &GateId,
        choice: &str,
        rationale: Option<String>,
        resolved_by: &str,
    ) -> Result<Decision, PipelineError> {
        self.store.init()?;
        let declarations = self.declarations()?;
        Ok(DecisionGate::new(&self.store, &declarations).resolve(
            gate,
            choice,
            rationale,
            resolved_by,
        )?)
    }

    pub fn gates(&self) -> Result<Vec<GateStatus>, PipelineError> {
        let declarations = self.declarations()?;
        let gate = DecisionGate::new(&self.store, &declarations);
        let mut statuses = Vec::new();
        for declaration in &declarations.gates {
            let id = declaration.id();
            statuses.push(GateStatus {
                request: gate.request(&id)?,
                decision: gate.decision(&id)?,
                declaration: declaration.clone(),
            });
        }
        Ok(statuses)
    }

    pub fn declaration(&self, gate: &GateId) -> Result<Option<GateDeclaration>, PipelineError> {
        Ok(self.declarations()?.get(gate).cloned())
    }

    /// Trace entries, optionally limited to the current run.
    pub fn trace(&self, current_only: bool) -> Result<Vec<TraceEntry>, PipelineError> {
        if current_only {
            return match self.ledger.current()? {
                Some(run) => Ok(self.trace.for_run(run.run_id)?),
                None => Ok(Vec::new()),
            };
        }
        Ok(self.trace.read_all()?)
    }
}
