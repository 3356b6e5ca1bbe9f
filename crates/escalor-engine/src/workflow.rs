//! Workflow specifications, durable runs and the DAG engine.
//!
//! A workflow is a named set of steps with dependencies. Structure is
//! validated once at load time (unique ids, known dependencies, no
//! cycles); after that, every failure during a run is either a handler
//! failure (visible in the run record, resumable) or state corruption.
//!
//! Each step is enforced through the same pipeline as a standalone
//! request. The run is checkpointed to `workflows/<run-id>.json` after
//! every completed step, so `resume` re-attempts only steps that never
//! completed — finished work is never redone.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use escalor_core::{Decision, EscalorError, EscalorResult, Fingerprint, TierCatalog, WorkItem};
use escalor_state::{read_json, write_json_atomic, EventKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::enforcer::{DecisionEnforcer, StateHandles};

/// One step of a workflow specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step id, unique within the workflow.
    pub id: String,
    /// Tier the step's work is routed to.
    pub tier: String,
    /// Ids of steps that must complete before this one runs.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Payload template; `{{name}}` placeholders substitute artifacts
    /// published by earlier steps.
    pub template: String,
    /// Artifact name this step's result is published under, if any.
    #[serde(default)]
    pub output_artifact: Option<String>,
}

/// A declarative multi-step workflow, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    pub steps: Vec<StepSpec>,
}

impl WorkflowSpec {
    /// Parse and structurally validate a workflow from TOML text.
    pub fn from_toml_str(text: &str) -> EscalorResult<Self> {
        let spec: WorkflowSpec = toml::from_str(text)
            .map_err(|e| EscalorError::Workflow(format!("invalid workflow spec: {e}")))?;
        spec.validate_structure()?;
        Ok(spec)
    }

    /// Load a workflow spec from a file.
    pub async fn load(path: &Path) -> EscalorResult<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            EscalorError::Workflow(format!(
                "cannot read workflow spec '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&text)
    }

    /// Unique step ids, known dependencies, no cycles. Violations are
    /// structural errors and reject the whole spec.
    pub fn validate_structure(&self) -> EscalorResult<()> {
        if self.steps.is_empty() {
            return Err(EscalorError::Workflow(format!(
                "workflow '{}' has no steps",
                self.name
            )));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(EscalorError::Workflow(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }
        for step in &self.steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(EscalorError::Workflow(format!(
                        "step '{}' depends on unknown step '{dep}'",
                        step.id
                    )));
                }
            }
        }

        if self.has_cycle() {
            return Err(EscalorError::Workflow(format!(
                "workflow '{}' has a dependency cycle",
                self.name
            )));
        }
        Ok(())
    }

    /// Every step tier must exist in the catalog.
    pub fn validate_tiers(&self, catalog: &TierCatalog) -> EscalorResult<()> {
        for step in &self.steps {
            if catalog.get(&step.tier).is_none() {
                return Err(EscalorError::Workflow(format!(
                    "step '{}' names unknown tier '{}'",
                    step.id, step.tier
                )));
            }
        }
        Ok(())
    }

    fn has_cycle(&self) -> bool {
        let mut visited: HashMap<&str, u8> = HashMap::new();
        for step in &self.steps {
            if self.dfs_cycle(&step.id, &mut visited) {
                return true;
            }
        }
        false
    }

    fn dfs_cycle<'a>(&'a self, id: &'a str, visited: &mut HashMap<&'a str, u8>) -> bool {
        match visited.get(id) {
            Some(1) => return true,  // back edge = cycle
            Some(2) => return false, // already processed
            _ => {}
        }
        visited.insert(id, 1); // mark as in progress
        if let Some(step) = self.steps.iter().find(|s| s.id == id) {
            for dep in &step.depends_on {
                if self.dfs_cycle(dep, visited) {
                    return true;
                }
            }
        }
        visited.insert(id, 2); // mark as done
        false
    }
}

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Durable record of one workflow execution.
///
/// The spec is embedded so `resume` needs only the run id;
/// `completed_steps` is what resume trusts when deciding what to skip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: Uuid,
    pub spec: WorkflowSpec,
    pub status: RunStatus,
    /// Fingerprint each completed step's work item resolved to.
    #[serde(default)]
    pub step_fingerprints: BTreeMap<String, Fingerprint>,
    #[serde(default)]
    pub completed_steps: BTreeSet<String>,
    /// Artifacts published by completed steps.
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    /// Step that caused the failure, when status is failed.
    #[serde(default)]
    pub failed_step: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    fn new(spec: WorkflowSpec) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            spec,
            status: RunStatus::Running,
            step_fingerprints: BTreeMap::new(),
            completed_steps: BTreeSet::new(),
            artifacts: BTreeMap::new(),
            failed_step: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Steps whose dependencies have all completed and which have not
    /// themselves completed.
    fn eligible_steps(&self) -> Vec<&StepSpec> {
        self.spec
            .steps
            .iter()
            .filter(|s| !self.completed_steps.contains(&s.id))
            .filter(|s| s.depends_on.iter().all(|d| self.completed_steps.contains(d)))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.completed_steps.len() == self.spec.steps.len()
    }
}

/// Substitute `{{artifact}}` placeholders in a step template.
///
/// A reference to an artifact no completed step has published is a
/// structural error, never silently passed through.
fn instantiate(
    placeholder: &Regex,
    template: &str,
    artifacts: &BTreeMap<String, String>,
) -> EscalorResult<String> {
    let mut missing = Vec::new();
    for caps in placeholder.captures_iter(template) {
        if let Some(name) = caps.get(1) {
            if !artifacts.contains_key(name.as_str()) {
                missing.push(name.as_str().to_string());
            }
        }
    }
    if !missing.is_empty() {
        return Err(EscalorError::Workflow(format!(
            "template references unknown artifacts: {}",
            missing.join(", ")
        )));
    }

    let out = placeholder.replace_all(template, |caps: &regex::Captures<'_>| {
        artifacts.get(&caps[1]).cloned().unwrap_or_default()
    });
    Ok(out.into_owned())
}

fn placeholder_regex() -> EscalorResult<Regex> {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.-]+)\s*\}\}")
        .map_err(|e| EscalorError::Workflow(format!("placeholder pattern: {e}")))
}

fn step_decision(step: &StepSpec) -> Decision {
    Decision {
        tier: step.tier.clone(),
        confidence: 1.0,
        rationale: format!("workflow step '{}'", step.id),
        enforced: true,
    }
}

/// Executes workflow runs through the decision enforcer.
///
/// The workflow layer only sequences steps, substitutes artifacts and
/// checkpoints; caching, quota, retries and escalation all come from
/// the per-step enforcement pipeline.
pub struct WorkflowEngine {
    enforcer: Arc<DecisionEnforcer>,
    state: StateHandles,
    runs_dir: PathBuf,
    placeholder: Regex,
}

impl WorkflowEngine {
    pub fn new(
        enforcer: Arc<DecisionEnforcer>,
        state: StateHandles,
        runs_dir: PathBuf,
    ) -> EscalorResult<Self> {
        Ok(Self {
            enforcer,
            state,
            runs_dir,
            placeholder: placeholder_regex()?,
        })
    }

    fn run_path(&self, run_id: Uuid) -> PathBuf {
        self.runs_dir.join(format!("{run_id}.json"))
    }

    /// Load a checkpointed run.
    pub async fn load_run(&self, run_id: Uuid) -> EscalorResult<Option<WorkflowRun>> {
        read_json(&self.run_path(run_id)).await
    }

    /// All checkpointed runs, oldest first.
    pub async fn list_runs(&self) -> EscalorResult<Vec<WorkflowRun>> {
        let mut dir = match tokio::fs::read_dir(&self.runs_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut runs = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(run) = read_json::<WorkflowRun>(&path).await? {
                runs.push(run);
            }
        }
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    /// Start a new run and drive it to completion or failure.
    pub async fn run(&self, spec: WorkflowSpec) -> EscalorResult<WorkflowRun> {
        spec.validate_structure()?;
        spec.validate_tiers(self.enforcer.catalog())?;

        let mut run = WorkflowRun::new(spec);
        info!(
            run_id = %run.run_id,
            name = %run.spec.name,
            steps = run.spec.steps.len(),
            "starting workflow run"
        );
        self.state
            .events
            .record(EventKind::WorkflowStarted {
                run_id: run.run_id,
                name: run.spec.name.clone(),
            })
            .await?;
        self.checkpoint(&mut run).await?;
        self.drive(&mut run).await?;
        Ok(run)
    }

    /// Resume a checkpointed run, re-attempting only steps that never
    /// completed. Resuming a completed run is a no-op.
    pub async fn resume(&self, run_id: Uuid) -> EscalorResult<WorkflowRun> {
        let mut run = self
            .load_run(run_id)
            .await?
            .ok_or_else(|| EscalorError::Workflow(format!("unknown workflow run {run_id}")))?;

        if run.status == RunStatus::Completed {
            info!(run_id = %run_id, "run already completed");
            return Ok(run);
        }

        // The embedded spec survived a process boundary; trust nothing
        // that was not validated in this process.
        run.spec.validate_structure()?;
        run.spec.validate_tiers(self.enforcer.catalog())?;

        info!(
            run_id = %run_id,
            completed = run.completed_steps.len(),
            total = run.spec.steps.len(),
            "resuming workflow run"
        );
        run.status = RunStatus::Running;
        run.failed_step = None;
        self.checkpoint(&mut run).await?;
        self.drive(&mut run).await?;
        Ok(run)
    }

    async fn drive(&self, run: &mut WorkflowRun) -> EscalorResult<()> {
        loop {
            if run.is_complete() {
                run.status = RunStatus::Completed;
                self.checkpoint(run).await?;
                self.state
                    .events
                    .record(EventKind::WorkflowFinished {
                        run_id: run.run_id,
                        status: run.status.to_string(),
                    })
                    .await?;
                info!(run_id = %run.run_id, "workflow run completed");
                return Ok(());
            }

            let eligible: Vec<StepSpec> =
                run.eligible_steps().into_iter().cloned().collect();
            if eligible.is_empty() {
                // Unreachable for a validated spec; refuse to spin.
                warn!(run_id = %run.run_id, "no eligible steps but run incomplete");
                return self
                    .fail_run(
                        run,
                        None,
                        EscalorError::Workflow(
                            "no eligible steps but run is incomplete".to_string(),
                        ),
                    )
                    .await;
            }

            // Instantiate every payload first, so a structural template
            // error fails the run before any step in the batch executes.
            let mut prepared = Vec::with_capacity(eligible.len());
            for step in eligible {
                match instantiate(&self.placeholder, &step.template, &run.artifacts) {
                    Ok(payload) => prepared.push((step, payload)),
                    Err(e) => {
                        let step_id = step.id.clone();
                        return self.fail_run(run, Some(step_id), e).await;
                    }
                }
            }

            // Eligible steps execute concurrently; each one is its own
            // enforcement pipeline.
            let mut handles = Vec::with_capacity(prepared.len());
            for (step, payload) in prepared {
                let enforcer = self.enforcer.clone();
                let deps: BTreeSet<Fingerprint> = step
                    .depends_on
                    .iter()
                    .filter_map(|d| run.step_fingerprints.get(d).cloned())
                    .collect();
                handles.push(tokio::spawn(async move {
                    let item = WorkItem::new(payload, step.tier.clone()).with_depends_on(deps);
                    let fingerprint = item.id.clone();
                    let decision = step_decision(&step);
                    let result = enforcer.enforce(&item, &decision).await;
                    (step, fingerprint, result)
                }));
            }

            let mut batch_failure: Option<(String, EscalorError)> = None;
            for handle in handles {
                let (step, fingerprint, result) = handle.await.map_err(|e| {
                    EscalorError::Workflow(format!("workflow step task panicked: {e}"))
                })?;

                match result {
                    Ok(record) if record.is_success() => {
                        if let Err(e) = self.complete_step(run, &step, fingerprint).await {
                            if batch_failure.is_none() {
                                batch_failure = Some((step.id.clone(), e));
                            }
                        }
                    }
                    Ok(record) => {
                        if batch_failure.is_none() {
                            batch_failure = Some((
                                step.id.clone(),
                                EscalorError::Handler(format!(
                                    "step '{}' failed on tier '{}' ({:?})",
                                    step.id, record.tier, record.outcome
                                )),
                            ));
                        }
                    }
                    Err(e) => {
                        if batch_failure.is_none() {
                            batch_failure = Some((step.id.clone(), e));
                        }
                    }
                }
            }

            if let Some((step_id, err)) = batch_failure {
                return self.fail_run(run, Some(step_id), err).await;
            }
        }
    }

    async fn complete_step(
        &self,
        run: &mut WorkflowRun,
        step: &StepSpec,
        fingerprint: Fingerprint,
    ) -> EscalorResult<()> {
        if let Some(name) = &step.output_artifact {
            // The entry can expire between execution and this read;
            // downstream templates need the value, so that is structural.
            let value = self
                .state
                .cache
                .get(&fingerprint)
                .await?
                .map(|entry| entry.result)
                .ok_or_else(|| {
                    EscalorError::Workflow(format!(
                        "artifact '{name}' from step '{}' is missing from the result cache",
                        step.id
                    ))
                })?;
            run.artifacts.insert(name.clone(), value);
        }
        run.step_fingerprints
            .insert(step.id.clone(), fingerprint.clone());
        run.completed_steps.insert(step.id.clone());
        self.checkpoint(run).await?;
        self.state
            .events
            .record(EventKind::StepCompleted {
                run_id: run.run_id,
                step_id: step.id.clone(),
                fingerprint,
            })
            .await?;
        info!(run_id = %run.run_id, step = %step.id, "workflow step completed");
        Ok(())
    }

    /// Mark the run failed and checkpoint before anything surfaces.
    /// Handler failures are terminal-but-resumable and reported through
    /// the run record; structural, quota and state errors propagate.
    async fn fail_run(
        &self,
        run: &mut WorkflowRun,
        step_id: Option<String>,
        err: EscalorError,
    ) -> EscalorResult<()> {
        run.status = RunStatus::Failed;
        run.failed_step = step_id.clone();
        self.checkpoint(run).await?;

        if let Some(step) = &step_id {
            self.state
                .events
                .record(EventKind::StepFailed {
                    run_id: run.run_id,
                    step_id: step.clone(),
                    reason: err.to_string(),
                })
                .await?;
        }
        self.state
            .events
            .record(EventKind::WorkflowFinished {
                run_id: run.run_id,
                status: run.status.to_string(),
            })
            .await?;
        error!(
            run_id = %run.run_id,
            step = step_id.as_deref().unwrap_or("-"),
            error = %err,
            "workflow run failed"
        );

        // Carry the run id in propagated errors so the caller can
        // resume once the underlying condition clears.
        let run_id = run.run_id;
        match err {
            EscalorError::Handler(_) => Ok(()),
            EscalorError::Quota(msg) => {
                Err(EscalorError::Quota(format!("workflow run {run_id}: {msg}")))
            }
            EscalorError::Workflow(msg) => {
                Err(EscalorError::Workflow(format!("workflow run {run_id}: {msg}")))
            }
            e => Err(e),
        }
    }

    async fn checkpoint(&self, run: &mut WorkflowRun) -> EscalorResult<()> {
        run.updated_at = Utc::now();
        write_json_atomic(&self.run_path(run.run_id), run).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
