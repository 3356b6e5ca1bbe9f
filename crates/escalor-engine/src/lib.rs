//! Escalor engine: mode selection, decision enforcement and workflows.
//!
//! This crate turns routing decisions into supervised executions. The
//! [`DecisionEnforcer`] owns the full pipeline for a single work item:
//! cache lookup, quota admission with fallback, bounded execution,
//! retry with backoff and a single escalation to the next-higher tier.
//! The [`WorkflowEngine`] sequences multi-step runs on top of it,
//! checkpointing after every completed step so an interrupted run can
//! be resumed.
//!
//! # Main types
//!
//! - [`DecisionEnforcer`] — single-item enforcement pipeline
//! - [`WorkflowEngine`] — DAG execution with durable checkpoints
//! - [`Mode`] / [`select_mode`] — directive vs. orchestration routing
//! - [`ProcessHandler`] / [`ProcessClassifier`] — subprocess adapters

/// Decision enforcement pipeline.
pub mod enforcer;
/// Handling-mode selection.
pub mod mode;
/// Subprocess-backed tier handler and classifier.
pub mod process;
/// Workflow specs, runs and the DAG engine.
pub mod workflow;

pub use enforcer::{DecisionEnforcer, StateHandles};
pub use mode::{select_mode, Mode, ModeContext};
pub use process::{ProcessClassifier, ProcessHandler};
pub use workflow::{RunStatus, StepSpec, WorkflowEngine, WorkflowRun, WorkflowSpec};
