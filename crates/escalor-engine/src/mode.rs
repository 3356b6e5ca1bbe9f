//! Selects how a request is handled before any execution happens.
//!
//! Mode selection is a pure function over the request context. It never
//! consults state, never fails, and is trivially auditable: the same
//! context always yields the same mode.

use std::fmt;
use std::str::FromStr;

use escalor_core::EscalorError;
use serde::{Deserialize, Serialize};

/// How a classified request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Surface the routing decision to the caller without enforcing it.
    Directive,
    /// Enforce the decision through the full execution pipeline.
    Orchestration,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Directive => write!(f, "directive"),
            Mode::Orchestration => write!(f, "orchestration"),
        }
    }
}

impl FromStr for Mode {
    type Err = EscalorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "directive" => Ok(Mode::Directive),
            "orchestration" => Ok(Mode::Orchestration),
            other => Err(EscalorError::Config(format!(
                "unknown mode '{other}' (expected 'directive' or 'orchestration')"
            ))),
        }
    }
}

/// Everything the mode decision is allowed to consider.
#[derive(Debug, Clone, Default)]
pub struct ModeContext {
    /// Request arrived from an interactive session.
    pub interactive: bool,
    /// Request is part of a batch or scheduled submission.
    pub batch: bool,
    /// Caller forced a mode; wins over every other signal.
    pub explicit_override: Option<Mode>,
    /// Request is one link of a multi-step workflow.
    pub workflow_chain: bool,
    /// Request is subject to compliance review.
    pub compliance_critical: bool,
}

/// Select the handling mode for a request.
///
/// Priority order: an explicit override wins outright; batch, workflow
/// and compliance-critical requests orchestrate; everything else,
/// including an entirely empty context, is directive.
pub fn select_mode(ctx: &ModeContext) -> Mode {
    if let Some(mode) = ctx.explicit_override {
        return mode;
    }
    if ctx.batch || ctx.workflow_chain || ctx.compliance_critical {
        return Mode::Orchestration;
    }
    Mode::Directive
}

// ─────────────────────────── Tests ───────────────────────────
