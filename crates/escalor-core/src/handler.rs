use crate::tier::TierSpec;
use crate::work::Decision;
use crate::EscalorResult;
use async_trait::async_trait;

/// Captured output of a completed tier handler invocation.
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code, when the process terminated normally.
    pub exit_code: Option<i32>,
}

impl HandlerOutcome {
    /// Whether the invocation exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Executes work on a tier.
///
/// Implementations run to completion and report what happened; they do not
/// bound their own runtime. The enforcer wraps every invocation in a
/// timeout derived from the tier configuration.
#[async_trait]
pub trait TierHandler: Send + Sync {
    async fn execute(&self, tier: &TierSpec, payload: &str) -> EscalorResult<HandlerOutcome>;
}

/// Produces routing decisions.
///
/// A failed classification must surface as
/// [`EscalorError::Classification`](crate::EscalorError::Classification);
/// the engine never substitutes a guessed tier for a failed classifier.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, request: &str) -> EscalorResult<Decision>;
}
