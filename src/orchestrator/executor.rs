use tracing::{debug, info, warn};

use crate::audit::{NewTraceEntry, TraceRecorder};
use crate::errors::PipelineError;
use crate::gates::{
    Decision, DecisionGate, DecisionGateRequest, GateCheck, GateDeclarations, GateId,
    parse_markers, strip_markers,
};
use crate::orchestrator::{PipelineRun, RunLedger};
use crate::prompt::{self, PromptLibrary};
use crate::provider::{RetryPolicy, TextProvider, generate_with_retry};
use crate::stage::{Stage, StageRecord, StageStatus};
use crate::store::{ArtifactRef, StateStore, Subarea, content_hash};

/// Result of executing one stage.
#[derive(Debug)]
pub enum StageOutcome {
    Completed(Vec<ArtifactRef>),
    Suspended(DecisionGateRequest),
    Failed(PipelineError),
}

/// What the stage's work produced before anything is persisted.
struct Produced {
    outputs: Vec<ArtifactRef>,
    decisions: Vec<Decision>,
    provider: Option<String>,
    prompt_hash: Option<String>,
}

/// Runs a single stage against the store, the gates and the trace ledger.
pub struct StageExecutor<'a> {
    store: &'a StateStore,
    ledger: &'a RunLedger,
    trace: &'a TraceRecorder,
    declarations: &'a GateDeclarations,
    prompts: &'a PromptLibrary,
    provider: &'a dyn TextProvider,
    retry: RetryPolicy,
}

impl<'a> StageExecutor<'a> {
    pub fn new(
        store: &'a StateStore,
        ledger: &'a RunLedger,
        trace: &'a TraceRecorder,
        declarations: &'a GateDeclarations,
        prompts: &'a PromptLibrary,
        provider: &'a dyn TextProvider,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            ledger,
            trace,
            declarations,
            prompts,
            provider,
            retry,
        }
    }

    /// Execute `stage` for `run`. Failures are recorded on the stage record.
    pub async fn execute(&self, stage: Stage, run: &PipelineRun) -> StageOutcome {
        match self.try_execute(stage, run).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(run_id = %run.run_id, %stage, error = %err, "Stage failed");
                if let Err(record_err) = self.record_failure(stage, run, &err) {
                    warn!(run_id = %run.run_id, %stage, error = %record_err, "Failed to record stage failure");
                }
                StageOutcome::Failed(err)
            }
        }
    }

    async fn try_execute(
        &self,
        stage: Stage,
        run: &PipelineRun,
    ) -> Result<StageOutcome, PipelineError> {
        let mut record = self.ledger.ensure_stage(run.run_id, stage)?;
        let inputs = self.check_inputs(stage, run)?;

        match record.status {
            StageStatus::Completed => {
                debug!(run_id = %run.run_id, %stage, "Stage already completed");
                return Ok(StageOutcome::Completed(record.outputs));
            }
            StageStatus::Failed => {
                return Err(PipelineError::InvalidTransition {
                    stage,
                    from: StageStatus::Failed,
                    to: StageStatus::Running,
                });
            }
            _ => {}
        }

        if let Some(outputs) = self.recover_from_trace(&mut record, run, &inputs)? {
            return Ok(StageOutcome::Completed(outputs));
        }

        if record.status == StageStatus::Running {
            // Interrupted mid-execution by a crash
            record.attempts += 1;
        } else {
            record.transition(StageStatus::Running)?;
        }
        record.inputs = inputs.clone();
        self.ledger.save_stage(&record)?;
        info!(run_id = %run.run_id, %stage, attempt = record.attempts, "Executing stage");

        let produced = if stage.uses_provider() {
            match self.generate(stage, run, &inputs, &mut record).await? {
                Ok(produced) => produced,
                Err(request) => return Ok(StageOutcome::Suspended(request)),
            }
        } else {
            self.snapshot_inputs(run, &inputs)?
        };

        let input_hash = self.store.hash_artifacts(&inputs)?;
        let output_hash = self.store.hash_artifacts(&produced.outputs)?;
        let decisions: Vec<_> = produced.decisions.iter().map(Decision::to_ref).collect();
        let entry = self
            .trace
            .append(NewTraceEntry {
                run_id: run.run_id,
                stage,
                input_hash,
                output_hash,
                provider: produced.provider,
                prompt_hash: produced.prompt_hash,
                decisions: decisions.clone(),
            })
            .map_err(|source| PipelineError::TraceWrite { stage, source })?;

        record.outputs = produced.outputs.clone();
        record.decisions = decisions;
        record.awaiting_gate = None;
        record.error = None;
        record.transition(StageStatus::Completed)?;
        self.ledger.save_stage(&record)?;

        info!(
            run_id = %run.run_id,
            %stage,
            sequence = entry.sequence,
            outputs = produced.outputs.len(),
            "Stage completed"
        );
        Ok(StageOutcome::Completed(produced.outputs))
    }

    /// Every required upstream artifact must exist; optional ones are
    /// returned only when present.
    fn check_inputs(&self, stage: Stage, run: &PipelineRun) -> Result<Vec<ArtifactRef>, PipelineError> {
        let mut present = Vec::new();
        for input in stage.inputs() {
            let artifact = input.artifact(run.run_id);
            if self.store.exists(artifact.subarea, &artifact.key) {
                present.push(artifact);
            } else if input.required {
                return Err(PipelineError::Precondition {
                    stage,
                    artifact: artifact.to_string(),
                });
            }
        }
        Ok(present)
    }

    fn expected_outputs(stage: Stage, run: &PipelineRun, inputs: &[ArtifactRef]) -> Vec<ArtifactRef> {
        match stage.output_name() {
            Some(name) => vec![ArtifactRef::run_scoped(stage.subarea(), run.run_id, name)],
            None => inputs
                .iter()
                .map(|a| ArtifactRef::run_scoped(Subarea::Inputs, run.run_id, a.file_name()))
                .collect(),
        }
    }

    /// A trace entry whose output hash matches the stored outputs means the
    /// stage finished but its record was never updated. Only a record left
    /// running by an interrupted invocation can be in that state.
    fn recover_from_trace(
        &self,
        record: &mut StageRecord,
        run: &PipelineRun,
        inputs: &[ArtifactRef],
    ) -> Result<Option<Vec<ArtifactRef>>, PipelineError> {
        if record.status != StageStatus::Running {
            return Ok(None);
        }
        let Some(entry) = self.trace.last_for(run.run_id, record.stage)? else {
            return Ok(None);
        };
        let outputs = Self::expected_outputs(record.stage, run, inputs);
        if !outputs.iter().all(|a| self.store.exists(a.subarea, &a.key)) {
            return Ok(None);
        }
        if self.store.hash_artifacts(&outputs)? != entry.output_hash {
            return Ok(None);
        }

        record.inputs = inputs.to_vec();
        record.outputs = outputs.clone();
        record.decisions = entry.decisions;
        record.awaiting_gate = None;
        record.transition(StageStatus::Completed)?;
        self.ledger.save_stage(record)?;
        info!(
            run_id = %run.run_id,
            stage = %record.stage,
            sequence = entry.sequence,
            "Stage completion recovered from trace"
        );
        Ok(Some(outputs))
    }

    fn snapshot_inputs(
        &self,
        run: &PipelineRun,
        inputs: &[ArtifactRef],
    ) -> Result<Produced, PipelineError> {
        let mut outputs = Vec::with_capacity(inputs.len());
        for input in inputs {
            let contents = self.store.read(input.subarea, &input.key)?;
            let key = format!("{}/{}", run.run_id, input.file_name());
            outputs.push(
                self.store
                    .write(Stage::Bootstrap, Subarea::Inputs, &key, &contents)?,
            );
        }
        Ok(Produced {
            outputs,
            decisions: Vec::new(),
            provider: None,
            prompt_hash: None,
        })
    }

    /// Render the prompt, call the provider and settle any flagged gates.
    ///
    /// Returns `Ok(Err(request))` when a gate is pending; the record has then
    /// already been moved to suspended.
    async fn generate(
        &self,
        stage: Stage,
        run: &PipelineRun,
        inputs: &[ArtifactRef],
        record: &mut StageRecord,
    ) -> Result<Result<Produced, DecisionGateRequest>, PipelineError> {
        let gates = DecisionGate::new(self.store, self.declarations);
        let mut decisions = gates.resolved_for(stage)?;

        let mut contents = Vec::new();
        for input in stage.inputs() {
            let artifact = input.artifact(run.run_id);
            let text = self
                .store
                .read_optional(artifact.subarea, &artifact.key)?
                .unwrap_or_default();
            contents.push((input.var, text));
        }
        let decision_text = prompt::decisions_context(&decisions);
        let axes_text = prompt::axes_context(self.declarations.for_stage(stage));
        let mut vars: Vec<(&str, &str)> = contents.iter().map(|(k, v)| (*k, v.as_str())).collect();
        vars.push(("decisions", decision_text.as_str()));
        vars.push(("decision_axes", axes_text.as_str()));

        let template = self.prompts.template(stage)?;
        let rendered = prompt::render(&template, &vars);
        let prompt_hash = content_hash(rendered.as_bytes());
        debug!(%stage, prompt_hash = %prompt_hash, inputs = inputs.len(), "Rendered prompt");

        let (text, attempts) = generate_with_retry(self.provider, &rendered, &self.retry)
            .await
            .map_err(|failure| PipelineError::ExternalExhausted {
                stage,
                attempts: failure.attempts,
                source: failure.error,
            })?;
        if attempts > 1 {
            info!(%stage, attempts, "Provider succeeded after retries");
        }

        let mut flagged = Vec::new();
        for marker in parse_markers(&text) {
            let gate = GateId::new(stage, marker.axis.clone());
            let Some(declaration) = self.declarations.get(&gate) else {
                return Err(PipelineError::Configuration(format!(
                    "stage {} raised undeclared decision axis '{}'",
                    stage, marker.axis
                )));
            };
            // Declared options are authoritative
            let unknown: Vec<&str> = marker
                .options
                .iter()
                .filter(|o| declaration.option(o).is_none())
                .map(String::as_str)
                .collect();
            if !unknown.is_empty() {
                warn!(%stage, gate = %gate, ?unknown, "Ignoring undeclared options in marker");
            }
            flagged.push(gate);
        }

        for gate in &flagged {
            match gates.check(gate, run.run_id)? {
                GateCheck::Resolved(decision) => {
                    if !decisions.iter().any(|d| d.gate == decision.gate) {
                        decisions.push(decision);
                    }
                }
                GateCheck::Pending(request) => {
                    record.transition(StageStatus::Suspended)?;
                    record.awaiting_gate = Some(gate.clone());
                    self.ledger.save_stage(record)?;
                    info!(run_id = %run.run_id, %stage, gate = %gate, "Stage suspended on gate");
                    return Ok(Err(request));
                }
            }
        }

        let document = incorporate(&text, &decisions);
        let name = stage.output_name().ok_or_else(|| {
            PipelineError::Configuration(format!("stage {} has no output document", stage))
        })?;
        let key = format!("{}/{}", run.run_id, name);
        let output = self.store.write(stage, stage.subarea(), &key, &document)?;

        Ok(Ok(Produced {
            outputs: vec![output],
            decisions,
            provider: Some(self.provider.id()),
            prompt_hash: Some(prompt_hash),
        }))
    }

    fn record_failure(
        &self,
        stage: Stage,
        run: &PipelineRun,
        err: &PipelineError,
    ) -> Result<(), PipelineError> {
        let mut record = match self.ledger.stage_record(run.run_id, stage)? {
            Some(record) => record,
            None => StageRecord::new(run.run_id, stage),
        };
        if record.status.is_terminal() {
            return Ok(());
        }
        record.transition(StageStatus::Failed)?;
        record.error = Some(err.to_string());
        self.ledger.save_stage(&record)?;
        Ok(())
    }
}

/// Strip marker lines and append the decisions the output is based on.
fn incorporate(text: &str, decisions: &[Decision]) -> String {
    let mut document = strip_markers(text);
    if !decisions.is_empty() {
        document.push_str("\n\n## Decisions\n\n");
        for decision in decisions {
            document.push_str(&format!("- {}: {}", decision.gate.axis, decision.choice));
            if let Some(ref rationale) = decision.rationale {
                document.push_str(&format!(" ({})", rationale));
            }
            document.push('\n');
        }
    }
    if !document.ends_with('\n') {
        document.push('\n');
    }
    document
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ProviderError;
    use crate::project::testing::write_intake;
    use crate::provider::testing::ScriptedProvider;
    use crate::stage::GATES_FILE;
    use std::time::Duration;
    use tempfile::tempdir;

    const GATES: &str = "gates:\n  - {stage: design, axis: architecture-choice, question: Which architecture?, options: [A, B]}\n";
    const FLAGGING_DESIGN: &str =
        "# Architecture\n\nDECISION_REQUIRED: architecture-choice: A | B\n\nLayered design.";

    struct Fixture {
        _dir: tempfile::TempDir,
        store: StateStore,
        ledger: RunLedger,
        trace: TraceRecorder,
        declarations: GateDeclarations,
        prompts: PromptLibrary,
        run: PipelineRun,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let store = StateStore::new(dir.path().join("state"));
            store.init().unwrap();
            write_intake(&store);
            std::fs::write(store.root().join("inputs").join(GATES_FILE), GATES).unwrap();
            let declarations =
                GateDeclarations::load(&store.root().join("inputs").join(GATES_FILE)).unwrap();
            let ledger = RunLedger::new(dir.path().join("state/runs"));
            let trace = TraceRecorder::new(dir.path().join("state/TRACE.jsonl"));
            let prompts = PromptLibrary::new(dir.path().join("prompts"));
            let run = ledger.create("demo", "s", "g").unwrap();
            Self {
                _dir: dir,
                store,
                ledger,
                trace,
                declarations,
                prompts,
                run,
            }
        }

        fn executor<'a>(&'a self, provider: &'a dyn TextProvider) -> StageExecutor<'a> {
            StageExecutor::new(
                &self.store,
                &self.ledger,
                &self.trace,
                &self.declarations,
                &self.prompts,
                provider,
                RetryPolicy {
                    max_attempts: 3,
                    initial_backoff: Duration::from_millis(1),
                    max_backoff: Duration::from_millis(2),
                },
            )
        }

        fn record(&self, stage: Stage) -> StageRecord {
            self.ledger
                .stage_record(self.run.run_id, stage)
                .unwrap()
                .unwrap()
        }
    }

    fn completed(outcome: StageOutcome) -> Vec<ArtifactRef> {
        match outcome {
            StageOutcome::Completed(outputs) => outputs,
            other => panic!("expected completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bootstrap_snapshots_intake_without_provider() {
        let f = Fixture::new();
        let provider = ScriptedProvider::always("unused");
        let outputs = completed(f.executor(&provider).execute(Stage::Bootstrap, &f.run).await);

        assert_eq!(outputs.len(), 6);
        assert_eq!(provider.calls(), 0);
        let key = format!("{}/REQUIREMENTS.md", f.run.run_id);
        assert_eq!(f.store.read(Subarea::Inputs, &key).unwrap(), "- do things");

        let entry = f.trace.last_for(f.run.run_id, Stage::Bootstrap).unwrap().unwrap();
        assert!(entry.provider.is_none());
        assert!(entry.prompt_hash.is_none());
        assert_eq!(f.record(Stage::Bootstrap).status, StageStatus::Completed);
    }

    #[tokio::test]
    async fn test_missing_upstream_is_precondition_failure() {
        let f = Fixture::new();
        let provider = ScriptedProvider::always("# Impl");
        match f.executor(&provider).execute(Stage::Implement, &f.run).await {
            StageOutcome::Failed(PipelineError::Precondition { stage, artifact }) => {
                assert_eq!(stage, Stage::Implement);
                assert!(artifact.ends_with("ARCHITECTURE.md"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(provider.calls(), 0);
        assert_eq!(f.record(Stage::Implement).status, StageStatus::Failed);
    }

    #[tokio::test]
    async fn test_completed_stage_is_not_re_executed() {
        let f = Fixture::new();
        let provider = ScriptedProvider::always("# Design\n\nPlain.");
        let exec = f.executor(&provider);
        completed(exec.execute(Stage::Bootstrap, &f.run).await);
        let first = completed(exec.execute(Stage::Design, &f.run).await);
        let trace_len = f.trace.len().unwrap();

        let second = completed(exec.execute(Stage::Design, &f.run).await);
        assert_eq!(first, second);
        assert_eq!(provider.calls(), 1);
        assert_eq!(f.trace.len().unwrap(), trace_len);
    }

    #[tokio::test]
    async fn test_gate_suspends_then_incorporates_decision() {
        let f = Fixture::new();
        let provider = ScriptedProvider::always(FLAGGING_DESIGN);
        let exec = f.executor(&provider);
        completed(exec.execute(Stage::Bootstrap, &f.run).await);

        let request = match exec.execute(Stage::Design, &f.run).await {
            StageOutcome::Suspended(request) => request,
            other => panic!("expected suspended, got {other:?}"),
        };
        assert_eq!(request.gate.to_string(), "design:architecture-choice");
        let record = f.record(Stage::Design);
        assert_eq!(record.status, StageStatus::Suspended);
        assert!(f.trace.last_for(f.run.run_id, Stage::Design).unwrap().is_none());

        // Still pending: re-execution suspends again on the same gate
        match exec.execute(Stage::Design, &f.run).await {
            StageOutcome::Suspended(again) => assert_eq!(again.gate, request.gate),
            other => panic!("expected suspended, got {other:?}"),
        }

        DecisionGate::new(&f.store, &f.declarations)
            .resolve(&request.gate, "A", Some("simpler".into()), "tester")
            .unwrap();
        let outputs = completed(exec.execute(Stage::Design, &f.run).await);

        let doc = f.store.read(outputs[0].subarea, &outputs[0].key).unwrap();
        assert!(!doc.contains("DECISION_REQUIRED"));
        assert!(doc.contains("## Decisions"));
        assert!(doc.contains("- architecture-choice: A (simpler)"));

        let entry = f.trace.last_for(f.run.run_id, Stage::Design).unwrap().unwrap();
        assert_eq!(entry.decisions.len(), 1);
        assert_eq!(entry.decisions[0].choice, "A");
        assert_eq!(entry.provider.as_deref(), Some("scripted"));

        // The resolved decision was part of the final prompt
        let prompts = provider.prompts.lock().unwrap();
        assert!(prompts.last().unwrap().contains("architecture-choice: A"));
    }

    #[tokio::test]
    async fn test_undeclared_axis_is_configuration_error() {
        let f = Fixture::new();
        let provider = ScriptedProvider::always("DECISION_REQUIRED: database: pg | mysql");
        let exec = f.executor(&provider);
        completed(exec.execute(Stage::Bootstrap, &f.run).await);

        match exec.execute(Stage::Design, &f.run).await {
            StageOutcome::Failed(PipelineError::Configuration(msg)) => {
                assert!(msg.contains("database"))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(f.record(Stage::Design).status, StageStatus::Failed);
        assert!(
            DecisionGate::new(&f.store, &f.declarations)
                .pending()
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_transient_failures_retried_with_single_trace_entry() {
        let f = Fixture::new();
        let exec_provider = ScriptedProvider::new(vec![
            Ok("# Design".into()),
            Err(ProviderError::Timeout { secs: 1 }),
            Err(ProviderError::NonZeroExit {
                code: 1,
                stderr: "overloaded".into(),
            }),
            Ok("# Implementation".into()),
        ]);
        let exec = f.executor(&exec_provider);
        completed(exec.execute(Stage::Bootstrap, &f.run).await);
        completed(exec.execute(Stage::Design, &f.run).await);
        completed(exec.execute(Stage::Implement, &f.run).await);

        assert_eq!(exec_provider.calls(), 4);
        let implement_entries: Vec<_> = f
            .trace
            .for_run(f.run.run_id)
            .unwrap()
            .into_iter()
            .filter(|e| e.stage == Stage::Implement)
            .collect();
        assert_eq!(implement_entries.len(), 1);
        assert_eq!(f.record(Stage::Implement).attempts, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_stage() {
        let f = Fixture::new();
        let provider = ScriptedProvider::new(vec![
            Ok("# Design".into()),
            Err(ProviderError::Timeout { secs: 1 }),
            Err(ProviderError::Timeout { secs: 1 }),
            Err(ProviderError::Timeout { secs: 1 }),
        ]);
        let exec = f.executor(&provider);
        completed(exec.execute(Stage::Bootstrap, &f.run).await);
        completed(exec.execute(Stage::Design, &f.run).await);

        match exec.execute(Stage::Implement, &f.run).await {
            StageOutcome::Failed(PipelineError::ExternalExhausted { attempts, .. }) => {
                assert_eq!(attempts, 3)
            }
            other => panic!("unexpected {other:?}"),
        }
        let record = f.record(Stage::Implement);
        assert_eq!(record.status, StageStatus::Failed);
        assert!(record.error.is_some());
    }

    #[tokio::test]
    async fn test_recovers_completion_from_trace() {
        let f = Fixture::new();
        let provider = ScriptedProvider::always("# Design");
        let exec = f.executor(&provider);
        completed(exec.execute(Stage::Bootstrap, &f.run).await);
        completed(exec.execute(Stage::Design, &f.run).await);

        // Simulate a crash after the trace append but before the record update
        let mut record = f.record(Stage::Design);
        record.status = StageStatus::Running;
        record.outputs.clear();
        f.ledger.save_stage(&record).unwrap();
        let trace_len = f.trace.len().unwrap();

        let outputs = completed(exec.execute(Stage::Design, &f.run).await);
        assert_eq!(outputs.len(), 1);
        assert_eq!(provider.calls(), 1);
        assert_eq!(f.trace.len().unwrap(), trace_len);
        assert_eq!(f.record(Stage::Design).status, StageStatus::Completed);
    }

    #[tokio::test]
    async fn test_marker_options_do_not_override_declaration() {
        let f = Fixture::new();
        let provider = ScriptedProvider::always(
            "# Architecture\nDECISION_REQUIRED: architecture-choice: A | C\n",
        );
        let exec = f.executor(&provider);
        completed(exec.execute(Stage::Bootstrap, &f.run).await);

        match exec.execute(Stage::Design, &f.run).await {
            StageOutcome::Suspended(request) => {
                assert_eq!(request.options, vec!["A".to_string(), "B".to_string()])
            }
            other => panic!("expected suspended, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_trace_write_failure_never_completes_stage() {
        let f = Fixture::new();
        // A directory where the ledger file belongs makes every append fail
        std::fs::create_dir_all(f.trace.path()).unwrap();
        let provider = ScriptedProvider::always("unused");

        match f.executor(&provider).execute(Stage::Bootstrap, &f.run).await {
            StageOutcome::Failed(PipelineError::TraceWrite { stage, .. }) => {
                assert_eq!(stage, Stage::Bootstrap)
            }
            other => panic!("expected trace write failure, got {other:?}"),
        }
        let record = f.record(Stage::Bootstrap);
        assert_eq!(record.status, StageStatus::Failed);
        assert!(record.outputs.is_empty());
        assert!(record.error.unwrap().contains("trace"));
    }

    #[test]
    fn test_incorporate_without_decisions() {
        assert_eq!(incorporate("# Doc\nDECISION_REQUIRED: x\nbody", &[]), "# Doc\nbody\n");
    }
}
