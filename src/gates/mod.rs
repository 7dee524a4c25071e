//! Decision gates: pre-declared points where a stage may need a human choice.
//!
//! A gate is identified by `<stage>:<axis>`, derived only from the stage name
//! and the declared axis so that re-running an interrupted stage finds the
//! same gate and its prior resolution. Requests and decisions live in the
//! decisions subarea of the state store:
//!
//! ```text
//! decisions/<stage>__<axis>.request.json   # DecisionGateRequest
//! decisions/<stage>__<axis>.json           # Decision, written once
//! ```

mod markers;

pub use markers::{Marker, parse_markers, strip_markers};

use std::fmt;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use dialoguer::{Select, theme::ColorfulTheme};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::errors::{GateError, StoreError};
use crate::stage::Stage;
use crate::store::{StateStore, Subarea, WriteMode, content_hash, read_json};

const REQUEST_SUFFIX: &str = ".request.json";

/// Stable gate identifier, rendered `<stage>:<axis>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GateId {
    pub stage: Stage,
    pub axis: String,
}

impl GateId {
    pub fn new(stage: Stage, axis: impl Into<String>) -> Self {
        Self {
            stage,
            axis: axis.into(),
        }
    }

    pub fn parse(s: &str) -> Result<Self, GateError> {
        let (stage, axis) = s
            .split_once(':')
            .ok_or_else(|| GateError::InvalidGateId(s.to_string()))?;
        let stage: Stage = stage
            .trim()
            .parse()
            .map_err(|_| GateError::InvalidGateId(s.to_string()))?;
        let axis = axis.trim();
        if !is_valid_axis(axis) {
            return Err(GateError::InvalidGateId(s.to_string()));
        }
        Ok(Self::new(stage, axis))
    }

    /// File stem used in the decisions subarea.
    pub fn file_stem(&self) -> String {
        format!("{}__{}", self.stage, self.axis)
    }

    fn decision_key(&self) -> String {
        format!("{}.json", self.file_stem())
    }

    fn request_key(&self) -> String {
        format!("{}{}", self.file_stem(), REQUEST_SUFFIX)
    }
}

impl fmt::Display for GateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stage, self.axis)
    }
}

impl TryFrom<String> for GateId {
    type Error = GateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        GateId::parse(&value)
    }
}

impl From<GateId> for String {
    fn from(id: GateId) -> Self {
        id.to_string()
    }
}

fn is_valid_axis(axis: &str) -> bool {
    !axis.is_empty()
        && axis
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

/// One declared ambiguity axis for a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDeclaration {
    pub stage: Stage,
    pub axis: String,
    pub question: String,
    pub options: Vec<String>,
}

impl GateDeclaration {
    pub fn id(&self) -> GateId {
        GateId::new(self.stage, self.axis.clone())
    }

    /// Match `choice` against the declared options, ignoring case.
    pub fn option(&self, choice: &str) -> Option<&str> {
        let choice = choice.trim();
        self.options
            .iter()
            .find(|o| o.as_str() == choice)
            .or_else(|| self.options.iter().find(|o| o.eq_ignore_ascii_case(choice)))
            .map(String::as_str)
    }
}

/// The contents of `DECISION_GATES.yml`.
///
/// ```yaml
/// gates:
///   - stage: design
///     axis: architecture-choice
///     question: Which architecture should the design commit to?
///     options: [A, B]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateDeclarations {
    #[serde(default)]
    pub gates: Vec<GateDeclaration>,
}

impl GateDeclarations {
    /// Load and validate declarations. A missing file declares no gates.
    pub fn load(path: &Path) -> Result<Self, GateError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content, path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(GateError::Store(StoreError::io(path, e))),
        }
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self, GateError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let declarations: Self = serde_yaml::from_str(content).map_err(|source| GateError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        declarations.validate()?;
        Ok(declarations)
    }

    pub fn validate(&self) -> Result<(), GateError> {
        let mut seen = std::collections::HashSet::new();
        for gate in &self.gates {
            if !is_valid_axis(&gate.axis) {
                return Err(GateError::InvalidDeclaration(format!(
                    "axis '{}' for stage {} must be non-empty and use only [a-z0-9_-]",
                    gate.axis, gate.stage
                )));
            }
            if gate.stage == Stage::Bootstrap {
                return Err(GateError::InvalidDeclaration(
                    "bootstrap produces no provider output and cannot declare gates".into(),
                ));
            }
            if gate.question.trim().is_empty() {
                return Err(GateError::InvalidDeclaration(format!(
                    "gate {} has an empty question",
                    gate.id()
                )));
            }
            if gate.options.is_empty() {
                return Err(GateError::InvalidDeclaration(format!(
                    "gate {} declares no options",
                    gate.id()
                )));
            }
            let mut options = std::collections::HashSet::new();
            for option in &gate.options {
                if option.trim().is_empty() || !options.insert(option.to_lowercase()) {
                    return Err(GateError::InvalidDeclaration(format!(
                        "gate {} has an empty or duplicate option '{}'",
                        gate.id(),
                        option
                    )));
                }
            }
            if !seen.insert(gate.id()) {
                return Err(GateError::InvalidDeclaration(format!(
                    "gate {} is declared twice",
                    gate.id()
                )));
            }
        }
        Ok(())
    }

    pub fn for_stage(&self, stage: Stage) -> impl Iterator<Item = &GateDeclaration> {
        self.gates.iter().filter(move |g| g.stage == stage)
    }

    pub fn get(&self, id: &GateId) -> Option<&GateDeclaration> {
        self.gates
            .iter()
            .find(|g| g.stage == id.stage && g.axis == id.axis)
    }

    /// Stable digest of the declared gates.
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_string(&self.gates).unwrap_or_default();
        content_hash(json.as_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Resolved,
}

/// A specific ambiguity raised by a stage and awaiting a human choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionGateRequest {
    pub gate: GateId,
    pub question: String,
    pub options: Vec<String>,
    pub status: RequestStatus,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// The human resolution of a gate. Written once, never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub gate: GateId,
    pub choice: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    pub resolved_by: String,
    pub resolved_at: DateTime<Utc>,
}

impl Decision {
    pub fn to_ref(&self) -> DecisionRef {
        DecisionRef {
            gate: self.gate.clone(),
            choice: self.choice.clone(),
        }
    }
}

/// Gate id plus chosen option, as recorded on stage records and trace entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRef {
    pub gate: GateId,
    pub choice: String,
}

/// Outcome of consulting a gate.
#[derive(Debug, Clone, PartialEq)]
pub enum GateCheck {
    Resolved(Decision),
    Pending(DecisionGateRequest),
}

/// Evaluates and resolves gates against the decisions subarea.
pub struct DecisionGate<'a> {
    store: &'a StateStore,
    declarations: &'a GateDeclarations,
}

impl<'a> DecisionGate<'a> {
    pub fn new(store: &'a StateStore, declarations: &'a GateDeclarations) -> Self {
        Self {
            store,
            declarations,
        }
    }

    fn declaration(&self, gate: &GateId) -> Result<&'a GateDeclaration, GateError> {
        self.declarations
            .get(gate)
            .ok_or_else(|| GateError::Undeclared {
                gate: gate.to_string(),
            })
    }

    /// Return the existing decision for `gate`, or record a pending request.
    ///
    /// Creating the request never overwrites an earlier one, so a re-raised
    /// gate keeps its original request.
    pub fn check(&self, gate: &GateId, run_id: Uuid) -> Result<GateCheck, GateError> {
        let declaration = self.declaration(gate)?;
        if let Some(decision) = self.decision(gate)? {
            return Ok(GateCheck::Resolved(decision));
        }

        let request = DecisionGateRequest {
            gate: gate.clone(),
            question: declaration.question.clone(),
            options: declaration.options.clone(),
            status: RequestStatus::Pending,
            run_id,
            created_at: Utc::now(),
            resolved_at: None,
        };
        let json = serde_json::to_string_pretty(&request).map_err(StoreError::Encode)?;
        if self
            .store
            .write_decision(&gate.request_key(), &json, WriteMode::CreateNew)?
        {
            info!(gate = %gate, run_id = %run_id, "Decision requested");
            return Ok(GateCheck::Pending(request));
        }

        match self.request(gate)? {
            Some(existing) => Ok(GateCheck::Pending(existing)),
            None => Ok(GateCheck::Pending(request)),
        }
    }

    /// Write the decision for `gate` exactly once.
    pub fn resolve(
        &self,
        gate: &GateId,
        choice: &str,
        rationale: Option<String>,
        resolved_by: &str,
    ) -> Result<Decision, GateError> {
        let declaration = self.declaration(gate)?;
        let option = declaration
            .option(choice)
            .ok_or_else(|| GateError::InvalidChoice {
                gate: gate.to_string(),
                choice: choice.to_string(),
                options: declaration.options.clone(),
            })?;

        let decision = Decision {
            gate: gate.clone(),
            choice: option.to_string(),
            rationale: rationale.filter(|r| !r.trim().is_empty()),
            resolved_by: resolved_by.to_string(),
            resolved_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&decision).map_err(StoreError::Encode)?;
        if !self
            .store
            .write_decision(&gate.decision_key(), &json, WriteMode::CreateNew)?
        {
            let existing = self.decision(gate)?.map(|d| d.choice).unwrap_or_default();
            return Err(GateError::AlreadyResolved {
                gate: gate.to_string(),
                choice: existing,
            });
        }

        if let Some(mut request) = self.request(gate)? {
            request.status = RequestStatus::Resolved;
            request.resolved_at = Some(decision.resolved_at);
            let json = serde_json::to_string_pretty(&request).map_err(StoreError::Encode)?;
            self.store
                .write_decision(&gate.request_key(), &json, WriteMode::Replace)?;
        }

        info!(gate = %gate, choice = %decision.choice, by = %resolved_by, "Decision recorded");
        Ok(decision)
    }

    pub fn decision(&self, gate: &GateId) -> Result<Option<Decision>, GateError> {
        let path = self.store.path_of(Subarea::Decisions, &gate.decision_key())?;
        Ok(read_json(&path)?)
    }

    pub fn request(&self, gate: &GateId) -> Result<Option<DecisionGateRequest>, GateError> {
        let path = self.store.path_of(Subarea::Decisions, &gate.request_key())?;
        Ok(read_json(&path)?)
    }

    /// Requests that have no decision yet.
    pub fn pending(&self) -> Result<Vec<DecisionGateRequest>, GateError> {
        let mut pending = Vec::new();
        for name in self.store.list(Subarea::Decisions, None)? {
            if !name.ends_with(REQUEST_SUFFIX) {
                continue;
            }
            let path = self.store.path_of(Subarea::Decisions, &name)?;
            let Some(request) = read_json::<DecisionGateRequest>(&path)? else {
                continue;
            };
            if request.status == RequestStatus::Pending && self.decision(&request.gate)?.is_none()
            {
                pending.push(request);
            }
        }
        Ok(pending)
    }

    /// Decisions already made for the declared axes of `stage`.
    pub fn resolved_for(&self, stage: Stage) -> Result<Vec<Decision>, GateError> {
        let mut decisions = Vec::new();
        for declaration in self.declarations.for_stage(stage) {
            if let Some(decision) = self.decision(&declaration.id())? {
                decisions.push(decision);
            }
        }
        Ok(decisions)
    }
}

/// Ask the operator to pick one of the gate's options.
pub fn prompt_choice(declaration: &GateDeclaration) -> Result<String> {
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(declaration.question.as_str())
        .items(&declaration.options)
        .default(0)
        .interact()?;
    Ok(declaration.options[selection].clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const GATES_YAML: &str = r#"
gates:
  - stage: design
    axis: architecture-choice
    question: Which architecture?
    options: [A, B]
  - stage: implement
    axis: language
    question: Which language?
    options: [rust, go]
"#;

    fn setup() -> (tempfile::TempDir, StateStore, GateDeclarations) {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state"));
        store.init().unwrap();
        let declarations = GateDeclarations::parse(GATES_YAML, Path::new("gates.yml")).unwrap();
        (dir, store, declarations)
    }

    fn design_gate() -> GateId {
        GateId::new(Stage::Design, "architecture-choice")
    }

    // =========================================
    // GateId
    // =========================================

    #[test]
    fn test_gate_id_display_and_parse() {
        let id = design_gate();
        assert_eq!(id.to_string(), "design:architecture-choice");
        assert_eq!(GateId::parse("design:architecture-choice").unwrap(), id);
        assert_eq!(id.file_stem(), "design__architecture-choice");
    }

    #[test]
    fn test_gate_id_rejects_bad_input() {
        assert!(GateId::parse("design").is_err());
        assert!(GateId::parse("deploy:x").is_err());
        assert!(GateId::parse("design:Has Spaces").is_err());
        assert!(GateId::parse("design:").is_err());
    }

    #[test]
    fn test_gate_id_serializes_as_string() {
        let json = serde_json::to_string(&design_gate()).unwrap();
        assert_eq!(json, "\"design:architecture-choice\"");
        let back: GateId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, design_gate());
    }

    // =========================================
    // declarations
    // =========================================

    #[test]
    fn test_declarations_lookup() {
        let (_dir, _store, declarations) = setup();
        assert_eq!(declarations.for_stage(Stage::Design).count(), 1);
        assert_eq!(declarations.for_stage(Stage::Verify).count(), 0);
        assert!(declarations.get(&design_gate()).is_some());
        assert!(
            declarations
                .get(&GateId::new(Stage::Design, "language"))
                .is_none()
        );
    }

    #[test]
    fn test_declarations_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let declarations = GateDeclarations::load(&dir.path().join("none.yml")).unwrap();
        assert!(declarations.gates.is_empty());
    }

    #[test]
    fn test_declarations_reject_duplicates_and_empty_options() {
        let dup = "gates:\n  - {stage: design, axis: a, question: q, options: [x]}\n  - {stage: design, axis: a, question: q, options: [y]}\n";
        assert!(matches!(
            GateDeclarations::parse(dup, Path::new("g.yml")),
            Err(GateError::InvalidDeclaration(_))
        ));

        let empty = "gates:\n  - {stage: design, axis: a, question: q, options: []}\n";
        assert!(GateDeclarations::parse(empty, Path::new("g.yml")).is_err());

        let bad_axis = "gates:\n  - {stage: design, axis: 'Bad Axis', question: q, options: [x]}\n";
        assert!(GateDeclarations::parse(bad_axis, Path::new("g.yml")).is_err());

        let bad_stage = "gates:\n  - {stage: deploy, axis: a, question: q, options: [x]}\n";
        assert!(matches!(
            GateDeclarations::parse(bad_stage, Path::new("g.yml")),
            Err(GateError::Parse { .. })
        ));
    }

    #[test]
    fn test_fingerprint_tracks_changes() {
        let (_dir, _store, declarations) = setup();
        let mut changed = declarations.clone();
        changed.gates[0].options.push("C".into());
        assert_ne!(declarations.fingerprint(), changed.fingerprint());
        assert_eq!(declarations.fingerprint(), declarations.clone().fingerprint());
    }

    // =========================================
    // check / resolve
    // =========================================

    #[test]
    fn test_check_pending_until_resolved() {
        let (_dir, store, declarations) = setup();
        let gate = DecisionGate::new(&store, &declarations);
        let run = Uuid::new_v4();

        let first = gate.check(&design_gate(), run).unwrap();
        let GateCheck::Pending(request) = first else {
            panic!("expected pending");
        };
        assert_eq!(request.options, vec!["A".to_string(), "B".to_string()]);

        // Re-raising keeps the original request
        let again = gate.check(&design_gate(), Uuid::new_v4()).unwrap();
        match again {
            GateCheck::Pending(r) => assert_eq!(r.run_id, run),
            _ => panic!("expected pending"),
        }
        assert_eq!(gate.pending().unwrap().len(), 1);

        gate.resolve(&design_gate(), "A", Some("simpler".into()), "tester")
            .unwrap();
        for _ in 0..3 {
            match gate.check(&design_gate(), run).unwrap() {
                GateCheck::Resolved(d) => assert_eq!(d.choice, "A"),
                _ => panic!("expected resolved"),
            }
        }
        assert!(gate.pending().unwrap().is_empty());
        assert_eq!(
            gate.request(&design_gate()).unwrap().unwrap().status,
            RequestStatus::Resolved
        );
    }

    #[test]
    fn test_resolve_only_once() {
        let (_dir, store, declarations) = setup();
        let gate = DecisionGate::new(&store, &declarations);
        gate.resolve(&design_gate(), "a", None, "tester").unwrap();
        let err = gate
            .resolve(&design_gate(), "B", None, "tester")
            .unwrap_err();
        match err {
            GateError::AlreadyResolved { choice, .. } => assert_eq!(choice, "A"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(gate.decision(&design_gate()).unwrap().unwrap().choice, "A");
    }

    #[test]
    fn test_resolve_rejects_unknown_option_and_undeclared_gate() {
        let (_dir, store, declarations) = setup();
        let gate = DecisionGate::new(&store, &declarations);
        assert!(matches!(
            gate.resolve(&design_gate(), "C", None, "t"),
            Err(GateError::InvalidChoice { .. })
        ));
        assert!(matches!(
            gate.resolve(&GateId::new(Stage::Verify, "x"), "A", None, "t"),
            Err(GateError::Undeclared { .. })
        ));
        assert!(matches!(
            gate.check(&GateId::new(Stage::Verify, "x"), Uuid::new_v4()),
            Err(GateError::Undeclared { .. })
        ));
    }

    #[test]
    fn test_resolved_for_stage() {
        let (_dir, store, declarations) = setup();
        let gate = DecisionGate::new(&store, &declarations);
        gate.resolve(&GateId::new(Stage::Implement, "language"), "rust", None, "t")
            .unwrap();
        assert!(gate.resolved_for(Stage::Design).unwrap().is_empty());
        let implement = gate.resolved_for(Stage::Implement).unwrap();
        assert_eq!(implement.len(), 1);
        assert_eq!(implement[0].to_ref().choice, "rust");
    }
}
