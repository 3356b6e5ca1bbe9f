//! End-to-end workflow scenarios: artifact flow between steps, durable
//! checkpointing, resume semantics, and quota interaction.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use escalor_core::{
    Decision, EscalorError, EscalorResult, HandlerOutcome, RetryPolicy, TierCatalog, TierHandler,
    TierSpec, WorkItem,
};
use escalor_engine::{
    DecisionEnforcer, ProcessHandler, RunStatus, StateHandles, WorkflowEngine, WorkflowSpec,
};
use escalor_state::EventKind;

/// Echoes `out(<payload>)`, failing any payload containing the marker.
struct EchoHandler {
    fail_marker: Option<String>,
    seen: tokio::sync::Mutex<Vec<String>>,
    call_count: AtomicU32,
}

impl EchoHandler {
    fn new() -> Arc<Self> {
        Self::with_marker(None)
    }

    fn with_marker(fail_marker: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            fail_marker: fail_marker.map(str::to_string),
            seen: tokio::sync::Mutex::new(Vec::new()),
            call_count: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    async fn seen(&self) -> Vec<String> {
        self.seen.lock().await.clone()
    }
}

#[async_trait]
impl TierHandler for EchoHandler {
    async fn execute(&self, _tier: &TierSpec, payload: &str) -> EscalorResult<HandlerOutcome> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().await.push(payload.to_string());

        if let Some(marker) = &self.fail_marker {
            if payload.contains(marker.as_str()) {
                return Ok(HandlerOutcome {
                    stdout: String::new(),
                    stderr: format!("refusing payload containing {marker}"),
                    exit_code: Some(1),
                });
            }
        }
        Ok(HandlerOutcome {
            stdout: format!("out({payload})"),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }
}

fn tier(name: &str, priority: u32, quota_limit: u64) -> TierSpec {
    TierSpec {
        name: name.to_string(),
        priority,
        cost: 1,
        command: vec!["true".to_string()],
        timeout_secs: 5,
        quota_limit,
        fallback: None,
    }
}

fn instant_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        backoff_base_ms: 0,
        backoff_max_ms: 0,
    }
}

async fn engine_with(
    data_dir: &Path,
    tiers: Vec<TierSpec>,
    handler: Arc<dyn TierHandler>,
) -> (WorkflowEngine, StateHandles) {
    engine_with_ttl(data_dir, tiers, handler, 3600).await
}

async fn engine_with_ttl(
    data_dir: &Path,
    tiers: Vec<TierSpec>,
    handler: Arc<dyn TierHandler>,
    cache_ttl_secs: u64,
) -> (WorkflowEngine, StateHandles) {
    let state = StateHandles::open(data_dir, 3600).await.unwrap();
    let catalog = TierCatalog::new(tiers).unwrap();
    let enforcer = Arc::new(DecisionEnforcer::new(
        catalog,
        instant_policy(),
        cache_ttl_secs,
        state.clone(),
        handler,
    ));
    let engine = WorkflowEngine::new(enforcer, state.clone(), data_dir.join("workflows")).unwrap();
    (engine, state)
}

const LINEAR: &str = r#"
name = "brief"

[[steps]]
id = "collect"
tier = "fast"
template = "collect signals"
output_artifact = "signals"

[[steps]]
id = "draft"
tier = "fast"
depends_on = ["collect"]
template = "draft brief from {{signals}}"
"#;

const DIAMOND: &str = r#"
name = "diamond"

[[steps]]
id = "root"
tier = "fast"
template = "gather inputs"
output_artifact = "inputs"

[[steps]]
id = "left"
tier = "fast"
depends_on = ["root"]
template = "analyze left of {{inputs}}"
output_artifact = "left_report"

[[steps]]
id = "right"
tier = "fast"
depends_on = ["root"]
template = "analyze right of {{inputs}}"
output_artifact = "right_report"

[[steps]]
id = "merge"
tier = "fast"
depends_on = ["left", "right"]
template = "merge [fragile] {{left_report}} and {{right_report}}"
"#;

// --- Completing runs ---

#[tokio::test]
async fn test_linear_workflow_flows_artifacts() {
    let tmp = tempfile::tempdir().unwrap();
    let handler = EchoHandler::new();
    let (engine, _state) = engine_with(tmp.path(), vec![tier("fast", 1, 100)], handler.clone()).await;

    let spec = WorkflowSpec::from_toml_str(LINEAR).unwrap();
    let run = engine.run(spec).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.completed_steps.len(), 2);
    assert_eq!(run.artifacts.get("signals").unwrap(), "out(collect signals)");

    // The second step saw the first step's artifact in its payload
    let seen = handler.seen().await;
    assert!(seen.contains(&"draft brief from out(collect signals)".to_string()));
}

#[tokio::test]
async fn test_diamond_workflow_completes_all_steps() {
    let tmp = tempfile::tempdir().unwrap();
    let handler = EchoHandler::new();
    let (engine, state) = engine_with(tmp.path(), vec![tier("fast", 1, 100)], handler.clone()).await;

    let spec = WorkflowSpec::from_toml_str(DIAMOND).unwrap();
    let run = engine.run(spec).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.completed_steps.len(), 4);
    assert_eq!(handler.calls(), 4);

    // The merge step saw both branch artifacts
    let seen = handler.seen().await;
    let merge_payload = seen.iter().find(|p| p.starts_with("merge")).unwrap();
    assert!(merge_payload.contains("out(analyze left of out(gather inputs))"));
    assert!(merge_payload.contains("out(analyze right of out(gather inputs))"));

    let events = state.events.read_all().await.unwrap();
    let completed_steps = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::StepCompleted { .. }))
        .count();
    assert_eq!(completed_steps, 4);
    assert!(events.iter().any(|e| matches!(
        &e.kind,
        EventKind::WorkflowFinished { status, .. } if status == "completed"
    )));
}

#[tokio::test]
async fn test_rerun_within_ttl_is_served_from_cache() {
    let tmp = tempfile::tempdir().unwrap();
    let handler = EchoHandler::new();
    let (engine, _state) = engine_with(tmp.path(), vec![tier("fast", 1, 100)], handler.clone()).await;

    let first = engine
        .run(WorkflowSpec::from_toml_str(LINEAR).unwrap())
        .await
        .unwrap();
    let second = engine
        .run(WorkflowSpec::from_toml_str(LINEAR).unwrap())
        .await
        .unwrap();

    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(second.status, RunStatus::Completed);
    assert_ne!(first.run_id, second.run_id);
    // Identical payloads on the same tier never re-execute
    assert_eq!(handler.calls(), 2);
    assert_eq!(first.artifacts, second.artifacts);
}

// --- Failure and resume ---

#[tokio::test]
async fn test_failed_step_checkpoints_progress() {
    let tmp = tempfile::tempdir().unwrap();
    let handler = EchoHandler::with_marker(Some("[fragile]"));
    let (engine, _state) = engine_with(tmp.path(), vec![tier("fast", 1, 100)], handler.clone()).await;

    let spec = WorkflowSpec::from_toml_str(DIAMOND).unwrap();
    let run = engine.run(spec).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failed_step.as_deref(), Some("merge"));
    assert_eq!(run.completed_steps.len(), 3);
    assert!(run.completed_steps.contains("root"));
    assert!(run.completed_steps.contains("left"));
    assert!(run.completed_steps.contains("right"));
    // Three successes plus three attempts on the failing step
    assert_eq!(handler.calls(), 6);

    // The checkpoint on disk matches the returned run
    let reloaded = engine.load_run(run.run_id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, RunStatus::Failed);
    assert_eq!(reloaded.completed_steps, run.completed_steps);
}

#[tokio::test]
async fn test_resume_reattempts_only_incomplete_steps() {
    let tmp = tempfile::tempdir().unwrap();

    let failing = EchoHandler::with_marker(Some("[fragile]"));
    let run_id = {
        let (engine, _state) =
            engine_with(tmp.path(), vec![tier("fast", 1, 100)], failing.clone()).await;
        let run = engine
            .run(WorkflowSpec::from_toml_str(DIAMOND).unwrap())
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        run.run_id
    };

    // A fresh process where the failure condition has cleared
    let healed = EchoHandler::new();
    let (engine, _state) = engine_with(tmp.path(), vec![tier("fast", 1, 100)], healed.clone()).await;
    let resumed = engine.resume(run_id).await.unwrap();

    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.completed_steps.len(), 4);

    // Finished steps were not redone: only the failed step ran
    let seen = healed.seen().await;
    assert_eq!(seen.len(), 1);
    assert!(seen[0].starts_with("merge"));
}

#[tokio::test]
async fn test_resume_of_completed_run_is_a_noop() {
    let tmp = tempfile::tempdir().unwrap();
    let handler = EchoHandler::new();
    let (engine, _state) = engine_with(tmp.path(), vec![tier("fast", 1, 100)], handler.clone()).await;

    let run = engine
        .run(WorkflowSpec::from_toml_str(LINEAR).unwrap())
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let resumed = engine.resume(run.run_id).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(handler.calls(), 2);
}

#[tokio::test]
async fn test_resume_unknown_run_errors() {
    let tmp = tempfile::tempdir().unwrap();
    let (engine, _state) =
        engine_with(tmp.path(), vec![tier("fast", 1, 100)], EchoHandler::new()).await;

    let err = engine.resume(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, EscalorError::Workflow(_)));
}

// --- Structural and quota failures ---

#[tokio::test]
async fn test_unknown_artifact_is_structural() {
    let tmp = tempfile::tempdir().unwrap();
    let handler = EchoHandler::new();
    let (engine, _state) = engine_with(tmp.path(), vec![tier("fast", 1, 100)], handler.clone()).await;

    let text = r#"
name = "broken"
[[steps]]
id = "only"
tier = "fast"
template = "use {{ghost}}"
"#;
    let err = engine
        .run(WorkflowSpec::from_toml_str(text).unwrap())
        .await
        .unwrap_err();

    assert!(matches!(err, EscalorError::Workflow(_)));
    assert_eq!(handler.calls(), 0);

    // The failed run was checkpointed before the error surfaced
    let runs = engine.list_runs().await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[0].failed_step.as_deref(), Some("only"));
}

#[tokio::test]
async fn test_unknown_step_tier_is_structural() {
    let tmp = tempfile::tempdir().unwrap();
    let (engine, _state) =
        engine_with(tmp.path(), vec![tier("fast", 1, 100)], EchoHandler::new()).await;

    let text = r#"
name = "mistiered"
[[steps]]
id = "only"
tier = "warp"
template = "x"
"#;
    let err = engine
        .run(WorkflowSpec::from_toml_str(text).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, EscalorError::Workflow(_)));
}

#[tokio::test]
async fn test_quota_exhaustion_halts_run_resumably() {
    let tmp = tempfile::tempdir().unwrap();
    let handler = EchoHandler::new();
    let (engine, _state) = engine_with(tmp.path(), vec![tier("fast", 1, 1)], handler.clone()).await;

    let err = engine
        .run(WorkflowSpec::from_toml_str(LINEAR).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, EscalorError::Quota(_)));

    let runs = engine.list_runs().await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    // The first step's progress survived the halt
    assert!(runs[0].completed_steps.contains("collect"));
    assert_eq!(
        runs[0].artifacts.get("signals").unwrap(),
        "out(collect signals)"
    );
}

#[tokio::test]
async fn test_expired_artifact_fails_the_run() {
    let tmp = tempfile::tempdir().unwrap();
    let handler = EchoHandler::new();
    // A zero TTL expires every result the moment it is produced
    let (engine, _state) =
        engine_with_ttl(tmp.path(), vec![tier("fast", 1, 100)], handler.clone(), 0).await;

    let err = engine
        .run(WorkflowSpec::from_toml_str(LINEAR).unwrap())
        .await
        .unwrap_err();

    assert!(matches!(err, EscalorError::Workflow(_)));
    assert!(err.to_string().contains("artifact 'signals'"));
    // The producing step ran; nothing downstream saw an empty value
    assert_eq!(handler.calls(), 1);

    let runs = engine.list_runs().await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[0].failed_step.as_deref(), Some("collect"));
    assert!(runs[0].artifacts.is_empty());
    assert!(runs[0].completed_steps.is_empty());
}

// --- Subprocess handler end to end ---

#[tokio::test]
async fn test_enforce_with_subprocess_handler() {
    let tmp = tempfile::tempdir().unwrap();
    let state = StateHandles::open(tmp.path(), 3600).await.unwrap();

    let shell_tier = TierSpec {
        name: "shell".to_string(),
        priority: 1,
        cost: 1,
        command: vec![
            "sh".to_string(),
            "-c".to_string(),
            "printf 'ok:%s' \"$0\"".to_string(),
        ],
        timeout_secs: 10,
        quota_limit: 5,
        fallback: None,
    };
    let catalog = TierCatalog::new(vec![shell_tier]).unwrap();
    let enforcer = DecisionEnforcer::new(
        catalog,
        instant_policy(),
        3600,
        state.clone(),
        Arc::new(ProcessHandler::new()),
    );

    let item = WorkItem::new("ship it", "shell");
    let decision = Decision::new("shell", 1.0, "direct invocation");
    let record = enforcer.enforce(&item, &decision).await.unwrap();

    assert!(record.is_success());
    assert_eq!(record.exit_status, Some(0));

    let cached = state.cache.get(&item.id).await.unwrap().unwrap();
    assert_eq!(cached.result, "ok:ship it");
}
