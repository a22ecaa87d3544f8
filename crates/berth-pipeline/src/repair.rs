//! AI-assisted repair loop.
//!
//! Runs an operation; on failure, sends the current artifact, the captured
//! error and the history of earlier attempts to a [`Responder`], writes the
//! artifact it returns between `<FIXED_CONTENT>` markers, and tries again.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use berth_llm::{Responder, ResponderRequest};
use berth_tools::truncation::{truncate_output, TruncationMode};
use berth_tools::workspace::resolve_in_workspace;
use berth_types::{BerthError, CancellationToken, Result};
use serde::{Deserialize, Serialize};

use crate::progress::{ProgressReporter, ProgressToken};
use crate::retry::{backoff_sleep, BackoffPolicy};

pub const FIXED_CONTENT_OPEN: &str = "<FIXED_CONTENT>";
pub const FIXED_CONTENT_CLOSE: &str = "</FIXED_CONTENT>";

/// Artifact text beyond this many bytes is cut from the diagnostic payload.
const MAX_ARTIFACT_BYTES: usize = 32_000;
const MAX_ERROR_BYTES: usize = 8_000;

const SYSTEM_PROMPT: &str = "You repair deployment artifacts for a containerization pipeline. \
You receive the current artifact, the error it produced, and earlier failed attempts. \
Reply with the complete corrected artifact between <FIXED_CONTENT> and </FIXED_CONTENT>. \
Do not abbreviate or omit any part of the file.";

/// How a stage is repaired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairConfig {
    /// Total attempts including the first. Never below 1.
    pub max_attempts: usize,
    pub backoff: BackoffPolicy,
    /// Workspace-relative path of the artifact the responder rewrites.
    pub artifact: String,
}

impl RepairConfig {
    pub fn new(artifact: impl Into<String>) -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::fixed(Duration::from_secs(1)),
            artifact: artifact.into(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

/// One failed attempt in a repair loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairAttempt {
    pub attempt: usize,
    pub error: String,
    pub duration_ms: u64,
    /// Whether a replacement artifact was written after this attempt.
    pub fixed: bool,
}

/// A successful repair run.
#[derive(Debug, Clone)]
pub struct RepairOutcome<T> {
    pub value: T,
    pub attempts: usize,
    pub history: Vec<RepairAttempt>,
}

/// A failed repair run. `history` holds every attempt made before the error.
#[derive(Debug)]
pub struct RepairFailure {
    pub error: BerthError,
    pub attempts: usize,
    pub history: Vec<RepairAttempt>,
}

/// Where a repair loop runs and who hears about it.
pub struct RepairScope<'a> {
    pub stage: &'a str,
    pub workspace: &'a Path,
    pub progress: &'a ProgressReporter,
    pub token: ProgressToken,
}

/// Retry-with-feedback state machine shared by the build and deploy stages.
pub struct RepairLoop {
    responder: Arc<dyn Responder>,
    config: RepairConfig,
}

impl RepairLoop {
    pub fn new(responder: Arc<dyn Responder>, config: RepairConfig) -> Self {
        Self { responder, config }
    }

    pub fn config(&self) -> &RepairConfig {
        &self.config
    }

    /// Run `operation` until it succeeds or `max_attempts` are spent.
    ///
    /// `operation` receives the 1-based attempt number. Failures the error
    /// taxonomy marks as non-retryable end the loop at once, as do reply
    /// contract violations and responder errors. Cancellation is checked
    /// before each attempt and before a fix is applied.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        scope: RepairScope<'_>,
        mut operation: F,
    ) -> std::result::Result<RepairOutcome<T>, RepairFailure>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut history: Vec<RepairAttempt> = Vec::new();
        let artifact_path = match resolve_in_workspace(scope.workspace, &self.config.artifact) {
            Ok(path) => path,
            Err(e) => return Err(fail(e, history)),
        };

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(fail(cancelled(scope.stage), history));
            }

            scope.progress.mark_attempt(
                scope.token,
                &format!("attempt {attempt}/{max_attempts}"),
                attempt_percent(attempt, max_attempts),
            );

            let started = Instant::now();
            let err = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(stage = %scope.stage, attempt, "Repair succeeded");
                    }
                    return Ok(RepairOutcome {
                        value,
                        attempts: attempt,
                        history,
                    });
                }
                Err(e) => e,
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            history.push(RepairAttempt {
                attempt,
                error: err.to_string(),
                duration_ms,
                fixed: false,
            });

            if !err.is_retryable() {
                tracing::warn!(stage = %scope.stage, attempt, error = %err, "Non-retryable failure, repair abandoned");
                return Err(fail(err, history));
            }

            if attempt == max_attempts {
                break;
            }

            tracing::warn!(stage = %scope.stage, attempt, max_attempts, error = %err, "Attempt failed, requesting repair");
            if let Err(e) = self.repair(cancel, &scope, &artifact_path, &err, &history).await {
                return Err(fail(e, history));
            }
            if let Some(last) = history.last_mut() {
                last.fixed = true;
            }

            let delay = self.config.backoff.delay_for_attempt(attempt - 1);
            if let Err(e) = backoff_sleep(delay, cancel, scope.stage).await {
                return Err(fail(e, history));
            }
        }

        let attempts = history.len();
        let error = BerthError::ExhaustedRetries {
            stage: scope.stage.to_string(),
            attempts,
            history: history.iter().map(|h| h.error.clone()).collect(),
        };
        tracing::error!(stage = %scope.stage, attempts, "Repair attempts exhausted");
        Err(fail(error, history))
    }

    /// Diagnose the failure and write the responder's replacement artifact.
    async fn repair(
        &self,
        cancel: &CancellationToken,
        scope: &RepairScope<'_>,
        artifact_path: &Path,
        err: &BerthError,
        history: &[RepairAttempt],
    ) -> Result<()> {
        let current = match tokio::fs::read_to_string(artifact_path).await {
            Ok(text) => Some(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let payload = diagnostic_payload(
            scope.stage,
            &self.config.artifact,
            current.as_deref(),
            &err.to_string(),
            history,
        );
        let reply = self
            .responder
            .respond(&ResponderRequest::new(SYSTEM_PROMPT, payload), cancel)
            .await?;
        let fixed = extract_fixed_content(self.responder.name(), &reply.text)?;

        if cancel.is_cancelled() {
            return Err(cancelled(scope.stage));
        }

        if let Some(parent) = artifact_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(artifact_path, &fixed).await?;
        tracing::info!(
            stage = %scope.stage,
            artifact = %self.config.artifact,
            bytes = fixed.len(),
            responder = self.responder.name(),
            "Applied repaired artifact"
        );
        Ok(())
    }
}

/// Pull the artifact out of a responder reply.
///
/// The body between the first `<FIXED_CONTENT>` and the following
/// `</FIXED_CONTENT>` is returned trimmed, with a single trailing newline.
pub fn extract_fixed_content(responder: &str, reply: &str) -> Result<String> {
    let violation = |message: &str| BerthError::ContractViolation {
        responder: responder.to_string(),
        message: message.to_string(),
    };

    let start = reply
        .find(FIXED_CONTENT_OPEN)
        .ok_or_else(|| violation("reply has no <FIXED_CONTENT> marker"))?
        + FIXED_CONTENT_OPEN.len();
    let len = reply[start..]
        .find(FIXED_CONTENT_CLOSE)
        .ok_or_else(|| violation("reply has no closing </FIXED_CONTENT> marker"))?;

    let body = reply[start..start + len].trim();
    if body.is_empty() {
        return Err(violation("fixed content is empty"));
    }
    Ok(format!("{body}\n"))
}

fn diagnostic_payload(
    stage: &str,
    artifact: &str,
    current: Option<&str>,
    error: &str,
    history: &[RepairAttempt],
) -> String {
    let mut payload = format!("Stage: {stage}\nArtifact: {artifact}\n\n## Current artifact\n");
    match current {
        Some(text) => {
            payload.push_str("```\n");
            payload.push_str(&truncate_output(text, MAX_ARTIFACT_BYTES, TruncationMode::HeadTail));
            payload.push_str("\n```\n");
        }
        None => payload.push_str("(the artifact does not exist yet)\n"),
    }

    payload.push_str("\n## Error\n```\n");
    payload.push_str(&truncate_output(error, MAX_ERROR_BYTES, TruncationMode::Tail));
    payload.push_str("\n```\n");

    let earlier = history.len().saturating_sub(1);
    if earlier > 0 {
        payload.push_str("\n## Earlier attempts\n");
        for h in &history[..earlier] {
            let error = truncate_output(&h.error, 500, TruncationMode::Tail);
            payload.push_str(&format!("- attempt {}: {}\n", h.attempt, error));
        }
    }
    payload
}

fn attempt_percent(attempt: usize, max_attempts: usize) -> u32 {
    (((attempt - 1) * 100) / max_attempts) as u32
}

fn cancelled(stage: &str) -> BerthError {
    BerthError::Cancelled {
        operation: stage.to_string(),
    }
}

fn fail(error: BerthError, history: Vec<RepairAttempt>) -> RepairFailure {
    RepairFailure {
        error,
        attempts: history.len(),
        history,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventEmitter, PipelineEvent};
    use berth_llm::ScriptedResponder;
    use berth_types::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn reporter() -> ProgressReporter {
        ProgressReporter::with_limits(
            EventEmitter::new(256),
            Duration::ZERO,
            crate::progress::DEFAULT_RETENTION,
        )
    }

    fn fix(body: &str) -> String {
        format!("Here you go.\n<FIXED_CONTENT>\n{body}\n</FIXED_CONTENT>\n")
    }

    fn repair_loop(responder: ScriptedResponder, attempts: usize) -> RepairLoop {
        RepairLoop::new(
            Arc::new(responder),
            RepairConfig::new("Dockerfile")
                .with_max_attempts(attempts)
                .with_backoff(BackoffPolicy::None),
        )
    }

    fn build_error() -> BerthError {
        BerthError::retryable_execution("build_image", "unknown instruction: RUNN")
    }

    #[test]
    fn extracts_marked_content() {
        let body = extract_fixed_content("r", &fix("FROM node:20\nRUN npm ci")).unwrap();
        assert_eq!(body, "FROM node:20\nRUN npm ci\n");
    }

    #[test]
    fn missing_or_empty_markers_violate_contract() {
        for reply in [
            "FROM node:20",
            "<FIXED_CONTENT>FROM node:20",
            "<FIXED_CONTENT>   \n </FIXED_CONTENT>",
        ] {
            let err = extract_fixed_content("r", reply).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ContractViolation, "reply: {reply}");
        }
    }

    #[test]
    fn payload_includes_artifact_error_and_history() {
        let history = vec![
            RepairAttempt {
                attempt: 1,
                error: "first".into(),
                duration_ms: 1,
                fixed: true,
            },
            RepairAttempt {
                attempt: 2,
                error: "second".into(),
                duration_ms: 1,
                fixed: false,
            },
        ];
        let payload = diagnostic_payload("build", "Dockerfile", Some("FROM x"), "second", &history);
        assert!(payload.contains("FROM x"));
        assert!(payload.contains("## Error\n```\nsecond"));
        assert!(payload.contains("- attempt 1: first"));
        assert!(!payload.contains("- attempt 2"));

        let missing = diagnostic_payload("build", "Dockerfile", None, "boom", &[]);
        assert!(missing.contains("does not exist yet"));
    }

    #[tokio::test]
    async fn success_on_first_attempt_skips_responder() {
        let dir = tempfile::tempdir().unwrap();
        let responder = ScriptedResponder::new(Vec::<String>::new());
        let progress = reporter();
        let token = progress.start_stage("build");

        let outcome = repair_loop(responder, 3)
            .run(
                &CancellationToken::new(),
                RepairScope {
                    stage: "build",
                    workspace: dir.path(),
                    progress: &progress,
                    token,
                },
                |_| async { Ok("image") },
            )
            .await
            .unwrap();

        assert_eq!(outcome.value, "image");
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.history.is_empty());
    }

    #[tokio::test]
    async fn success_on_attempt_k_reports_k() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM node:20\nRUNN npm ci\n").unwrap();
        let responder = Arc::new(ScriptedResponder::repeating(fix("FROM node:20\nRUN npm ci")));
        let repair = RepairLoop::new(
            responder.clone(),
            RepairConfig::new("Dockerfile")
                .with_max_attempts(5)
                .with_backoff(BackoffPolicy::None),
        );
        let progress = reporter();
        let mut rx = progress.emitter().subscribe();
        let token = progress.start_stage("build");
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let outcome = repair
            .run(
                &CancellationToken::new(),
                RepairScope {
                    stage: "build",
                    workspace: dir.path(),
                    progress: &progress,
                    token,
                },
                move |_| {
                    let c = c.clone();
                    async move {
                        if c.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(build_error())
                        } else {
                            Ok(())
                        }
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.history.len(), 2);
        assert!(outcome.history.iter().all(|h| h.fixed));
        assert_eq!(responder.requests().len(), 2);
        assert!(responder.requests()[0].prompt.contains("RUNN npm ci"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("Dockerfile")).unwrap(),
            "FROM node:20\nRUN npm ci\n"
        );

        let mut messages = Vec::new();
        while let Ok(PipelineEvent::Progress(p)) = rx.try_recv() {
            messages.push(p.message);
        }
        assert!(messages.contains(&"attempt 1/5".to_string()));
        assert!(messages.contains(&"attempt 3/5".to_string()));
    }

    #[tokio::test]
    async fn n_failures_exhaust_with_n_history_entries() {
        let dir = tempfile::tempdir().unwrap();
        let responder = Arc::new(ScriptedResponder::repeating(fix("FROM scratch")));
        let repair = RepairLoop::new(
            responder.clone(),
            RepairConfig::new("Dockerfile")
                .with_max_attempts(4)
                .with_backoff(BackoffPolicy::None),
        );
        let progress = reporter();
        let token = progress.start_stage("build");

        let failure = repair
            .run(
                &CancellationToken::new(),
                RepairScope {
                    stage: "build",
                    workspace: dir.path(),
                    progress: &progress,
                    token,
                },
                |attempt| async move {
                    Err::<(), _>(BerthError::retryable_execution("build_image", format!("failure {attempt}")))
                },
            )
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 4);
        assert_eq!(failure.history.len(), 4);
        // No fix is requested after the final attempt.
        assert_eq!(responder.requests().len(), 3);
        match failure.error {
            BerthError::ExhaustedRetries {
                stage,
                attempts,
                history,
            } => {
                assert_eq!(stage, "build");
                assert_eq!(attempts, 4);
                assert_eq!(history.len(), 4);
                assert!(history[3].contains("failure 4"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn contract_violation_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let responder = ScriptedResponder::repeating("I think the base image is wrong.");
        let progress = reporter();
        let token = progress.start_stage("build");
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let failure = repair_loop(responder, 5)
            .run(
                &CancellationToken::new(),
                RepairScope {
                    stage: "build",
                    workspace: dir.path(),
                    progress: &progress,
                    token,
                },
                move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(build_error()) }
                },
            )
            .await
            .unwrap_err();

        assert_eq!(failure.error.kind(), ErrorKind::ContractViolation);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!dir.path().join("Dockerfile").exists());
    }

    #[tokio::test]
    async fn responder_error_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let responder = ScriptedResponder::new(Vec::<String>::new());
        let progress = reporter();
        let token = progress.start_stage("deploy");

        let failure = repair_loop(responder, 3)
            .run(
                &CancellationToken::new(),
                RepairScope {
                    stage: "deploy",
                    workspace: dir.path(),
                    progress: &progress,
                    token,
                },
                |_| async { Err::<(), _>(build_error()) },
            )
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.error.kind(), ErrorKind::ExecutionFailed);
    }

    #[tokio::test]
    async fn non_retryable_failure_stops_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let responder = Arc::new(ScriptedResponder::repeating(fix("FROM scratch")));
        let repair = RepairLoop::new(responder.clone(), RepairConfig::new("Dockerfile"));
        let progress = reporter();
        let token = progress.start_stage("build");

        let failure = repair
            .run(
                &CancellationToken::new(),
                RepairScope {
                    stage: "build",
                    workspace: dir.path(),
                    progress: &progress,
                    token,
                },
                |_| async { Err::<(), _>(BerthError::validation("build_image", "no image name")) },
            )
            .await
            .unwrap_err();

        assert_eq!(failure.error.kind(), ErrorKind::ValidationFailed);
        assert_eq!(failure.attempts, 1);
        assert!(responder.requests().is_empty());
    }

    #[tokio::test]
    async fn cancelled_before_first_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let progress = reporter();
        let token = progress.start_stage("build");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let failure = repair_loop(ScriptedResponder::repeating(fix("x")), 3)
            .run(
                &cancel,
                RepairScope {
                    stage: "build",
                    workspace: dir.path(),
                    progress: &progress,
                    token,
                },
                |_| async { Ok::<_, BerthError>(()) },
            )
            .await
            .unwrap_err();

        assert_eq!(failure.error.kind(), ErrorKind::Cancelled);
        assert_eq!(failure.attempts, 0);
    }
}
