//! Subprocess adapters for tier execution and classification.

use async_trait::async_trait;
use escalor_core::{
    Classifier, Decision, EscalorError, EscalorResult, HandlerOutcome, TierHandler, TierSpec,
};

/// Tier handler that runs the tier's configured command as a subprocess.
///
/// The work item payload is appended as the final argument and stdout,
/// stderr and the exit status are captured. Runtime bounds are imposed
/// by the enforcer, not here; the child is killed when the bounding
/// future is dropped.
#[derive(Debug, Default)]
pub struct ProcessHandler;

impl ProcessHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TierHandler for ProcessHandler {
    async fn execute(&self, tier: &TierSpec, payload: &str) -> EscalorResult<HandlerOutcome> {
        let (program, args) = tier.command.split_first().ok_or_else(|| {
            EscalorError::Handler(format!("tier '{}' has an empty command", tier.name))
        })?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        cmd.arg(payload);
        cmd.kill_on_drop(true);

        tracing::info!(tier = %tier.name, program = %program, "spawning tier handler");

        let output = cmd.output().await.map_err(|e| {
            EscalorError::Handler(format!(
                "failed to run '{program}' for tier '{}': {e}",
                tier.name
            ))
        })?;

        Ok(HandlerOutcome {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }
}

/// Classifier that delegates to an external command.
///
/// The request text is appended as the final argument. The command must
/// print a JSON object with `tier`, `confidence` and `rationale` as its
/// last stdout line. Every failure propagates as a classification
/// error; no tier is ever guessed here.
pub struct ProcessClassifier {
    command: Vec<String>,
}

impl ProcessClassifier {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Classifier for ProcessClassifier {
    async fn classify(&self, request: &str) -> EscalorResult<Decision> {
        let (program, args) = self.command.split_first().ok_or_else(|| {
            EscalorError::Classification("classifier command is empty".to_string())
        })?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        cmd.arg(request);
        cmd.kill_on_drop(true);

        let output = cmd.output().await.map_err(|e| {
            EscalorError::Classification(format!("failed to run classifier '{program}': {e}"))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(EscalorError::Classification(format!(
                "classifier exited {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        let decision: Decision = stdout
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str(line).ok())
            .ok_or_else(|| {
                // Truncate on a char boundary; the output is arbitrary text.
                let mut end = stdout.len().min(500);
                while !stdout.is_char_boundary(end) {
                    end -= 1;
                }
                EscalorError::Classification(format!(
                    "classifier output is not a JSON decision: {}",
                    &stdout[..end]
                ))
            })?;

        tracing::debug!(tier = %decision.tier, confidence = decision.confidence, "classifier decision");
        Ok(decision)
    }
}

// ─────────────────────────── Tests ───────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn shell_tier(script: &str) -> TierSpec {
        TierSpec {
            name: "shell".to_string(),
            priority: 1,
            cost: 1,
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout_secs: 5,
            quota_limit: 10,
            fallback: None,
        }
    }

    #[tokio::test]
    async fn handler_captures_streams_and_exit_code() {
        let tier = shell_tier("printf out; printf err >&2; exit 3");
        let outcome = ProcessHandler::new().execute(&tier, "payload").await.unwrap();
        assert_eq!(outcome.stdout, "out");
        assert_eq!(outcome.stderr, "err");
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn handler_appends_payload_as_final_argument() {
        // With `sh -c`, the appended payload lands in $0.
        let tier = shell_tier("printf '%s' \"$0\"");
        let outcome = ProcessHandler::new()
            .execute(&tier, "hello world")
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "hello world");
        assert!(outcome.success());
    }

    #[tokio::test]
    async fn handler_reports_missing_program() {
        let tier = TierSpec {
            command: vec!["escalor-no-such-binary".to_string()],
            ..shell_tier("")
        };
        let err = ProcessHandler::new().execute(&tier, "x").await.unwrap_err();
        assert!(matches!(err, EscalorError::Handler(_)));
    }

    #[tokio::test]
    async fn classifier_parses_last_json_line() {
        let classifier = ProcessClassifier::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            concat!(
                "echo noise; ",
                r#"echo '{"tier":"deep","confidence":0.9,"rationale":"multi-step"}'"#
            )
            .to_string(),
        ]);
        let decision = classifier.classify("analyze this").await.unwrap();
        assert_eq!(decision.tier, "deep");
        assert!(!decision.enforced);
    }

    #[tokio::test]
    async fn classifier_failure_is_never_a_guess() {
        let classifier =
            ProcessClassifier::new(vec!["sh".to_string(), "-c".to_string(), "exit 1".to_string()]);
        let err = classifier.classify("anything").await.unwrap_err();
        assert!(matches!(err, EscalorError::Classification(_)));
    }

    #[tokio::test]
    async fn classifier_rejects_non_json_output() {
        let classifier = ProcessClassifier::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo not a decision".to_string(),
        ]);
        let err = classifier.classify("anything").await.unwrap_err();
        assert!(matches!(err, EscalorError::Classification(_)));
    }

    #[tokio::test]
    async fn classifier_rejects_long_multibyte_garbage() {
        // 600 bytes of multibyte text, so the error-message truncation
        // point lands inside a character
        let garbage = "€".repeat(200);
        let classifier = ProcessClassifier::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("printf '%s' '{garbage}'"),
        ]);
        let err = classifier.classify("anything").await.unwrap_err();
        assert!(matches!(err, EscalorError::Classification(_)));
    }
}
