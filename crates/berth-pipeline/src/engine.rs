//! Pipeline execution engine.
//!
//! Resolves an operation to a registered [`PipelineDefinition`], runs its
//! stages in order inside one session workspace under that session's
//! execution lock, and always answers with a [`PipelineResponse`].

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use berth_llm::Responder;
use berth_session::{Session, SessionConfig, SessionManager, SessionState, SessionUpdate};
use berth_tools::{ToolContext, ToolRegistry};
use berth_types::{BerthError, CancellationToken, ErrorKind, ErrorReport, Result};
use serde_json::Value;

use crate::events::{EventEmitter, PipelineEvent};
use crate::locks::{ContentionPolicy, SessionLocks};
use crate::progress::{ProgressReporter, ProgressToken};
use crate::repair::{RepairAttempt, RepairLoop, RepairScope};
use crate::request::{
    PipelineRequest, PipelineResponse, RunOptions, RunStatus, StageMetadata, StageStatus,
};
use crate::retry::{execute_with_retry, RetryPolicy};
use crate::stage::{PipelineDefinition, PipelineStep, Stage, StageInput};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Lifetime of sessions created for requests without a session ID.
pub const DEFAULT_AUTO_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Label marking sessions the engine created on its own.
pub const AUTO_SESSION_LABEL: &str = "auto";

/// Runs registered pipelines against sessions.
pub struct PipelineEngine {
    registry: Arc<ToolRegistry>,
    sessions: Arc<SessionManager>,
    responder: Option<Arc<dyn Responder>>,
    pipelines: RwLock<HashMap<String, Arc<PipelineDefinition>>>,
    events: EventEmitter,
    progress: ProgressReporter,
    locks: SessionLocks,
    default_timeout: Option<Duration>,
    default_retry: Option<RetryPolicy>,
    contention: ContentionPolicy,
    auto_session_ttl: Duration,
}

/// Listing entry for a registered pipeline.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PipelineSummary {
    pub name: String,
    pub description: String,
    pub stages: Vec<String>,
}

/// Everything one run needs while its stages execute.
struct Run<'a> {
    run_id: &'a str,
    input: &'a Value,
    options: &'a RunOptions,
    definition: &'a PipelineDefinition,
    session_id: String,
    workspace: PathBuf,
    progress: ProgressReporter,
    cancel: &'a CancellationToken,
}

type StageResult = (StageMetadata, Result<Value>);

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

impl PipelineEngine {
    pub fn new(registry: Arc<ToolRegistry>, sessions: Arc<SessionManager>) -> Self {
        let events = EventEmitter::default();
        Self {
            registry,
            sessions,
            responder: None,
            pipelines: RwLock::new(HashMap::new()),
            progress: ProgressReporter::new(events.clone()),
            events,
            locks: SessionLocks::new(),
            default_timeout: None,
            default_retry: None,
            contention: ContentionPolicy::default(),
            auto_session_ttl: DEFAULT_AUTO_SESSION_TTL,
        }
    }

    /// The responder consulted by repair loops. Without one, repair stages
    /// fall back to plain retries.
    pub fn with_responder(mut self, responder: Arc<dyn Responder>) -> Self {
        self.responder = Some(responder);
        self
    }

    /// Default timeout for stages whose pipeline and stage declare none.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Default retry policy for stages whose pipeline and stage declare none.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.default_retry = Some(retry);
        self
    }

    pub fn with_contention(mut self, contention: ContentionPolicy) -> Self {
        self.contention = contention;
        self
    }

    /// Lifetime of sessions the engine creates for requests that name none,
    /// applied when the session manager has no default TTL of its own.
    pub fn with_auto_session_ttl(mut self, ttl: Duration) -> Self {
        self.auto_session_ttl = ttl;
        self
    }

    /// Use `progress` (and its emitter) for all notifications.
    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.events = progress.emitter().clone();
        self.progress = progress;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    // -----------------------------------------------------------------------
    // Pipeline registration
    // -----------------------------------------------------------------------

    /// Register a pipeline under its name. Names are unique.
    pub fn register_pipeline(&self, definition: PipelineDefinition) -> Result<()> {
        definition.validate()?;
        let mut pipelines = self.pipelines.write().unwrap_or_else(|e| e.into_inner());
        if pipelines.contains_key(&definition.name) {
            return Err(BerthError::AlreadyExists {
                resource: "pipeline".into(),
                id: definition.name,
            });
        }
        tracing::debug!(pipeline = %definition.name, stages = definition.stage_count(), "Registered pipeline");
        pipelines.insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn pipeline(&self, name: &str) -> Option<Arc<PipelineDefinition>> {
        self.pipelines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Registered pipelines sorted by name.
    pub fn pipelines(&self) -> Vec<PipelineSummary> {
        let pipelines = self.pipelines.read().unwrap_or_else(|e| e.into_inner());
        let mut summaries: Vec<PipelineSummary> = pipelines
            .values()
            .map(|def| PipelineSummary {
                name: def.name.clone(),
                description: def.description.clone(),
                stages: def.stages().map(|s| s.name.clone()).collect(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    // -----------------------------------------------------------------------
    // Tool invocation
    // -----------------------------------------------------------------------

    /// Invoke a single tool inside a session's workspace, under the session lock.
    pub async fn invoke_tool(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
        tool: &str,
        arguments: Value,
        dry_run: bool,
    ) -> Result<Value> {
        let session = self.sessions.get(session_id)?;
        let _guard = self.acquire(cancel, session_id).await?;
        let ctx = ToolContext::new(&session.workspace)
            .with_session(session_id)
            .with_dry_run(dry_run)
            .with_cancel(cancel.clone());
        self.call_tool(tool, arguments, &ctx, self.default_timeout).await
    }

    // -----------------------------------------------------------------------
    // Pipeline execution
    // -----------------------------------------------------------------------

    /// Run `request` to completion or first terminal failure.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        request: PipelineRequest,
    ) -> PipelineResponse {
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let started = Instant::now();
        tracing::info!(run_id = %run_id, operation = %request.operation, "Pipeline run started");

        let mut response = self.run(cancel, &run_id, &request).await;
        response.duration_ms = started.elapsed().as_millis() as u64;

        match response.status {
            RunStatus::Completed => {
                tracing::info!(
                    run_id = %run_id,
                    operation = %request.operation,
                    duration_ms = response.duration_ms,
                    "Pipeline run completed"
                );
                self.events.emit(PipelineEvent::RunCompleted {
                    run_id: run_id.clone(),
                    operation: request.operation.clone(),
                    completed_stages: response.stage_names().iter().map(|s| s.to_string()).collect(),
                    duration_ms: response.duration_ms,
                });
            }
            RunStatus::Failed => {
                let error = response
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_default();
                tracing::error!(
                    run_id = %run_id,
                    operation = %request.operation,
                    stage = response.failed_stage.as_deref().unwrap_or("-"),
                    error = %error,
                    "Pipeline run failed"
                );
                self.events.emit(PipelineEvent::RunFailed {
                    run_id: run_id.clone(),
                    operation: request.operation.clone(),
                    stage: response.failed_stage.clone(),
                    error,
                });
            }
        }
        response
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        run_id: &str,
        request: &PipelineRequest,
    ) -> PipelineResponse {
        let operation = request.operation.as_str();
        let fail_early = |session_id: Option<String>, stage: Option<String>, err: BerthError| {
            PipelineResponse::failed(run_id, operation, session_id, stage, &err)
        };

        // Resolve the operation and every stage's tool before touching a session.
        let Some(definition) = self.pipeline(operation) else {
            return fail_early(
                request.session_id.clone(),
                None,
                BerthError::not_found("pipeline", operation),
            );
        };
        if let Some(stage) = definition.stages().find(|s| !self.registry.has(&s.tool)) {
            return fail_early(
                request.session_id.clone(),
                Some(stage.name.clone()),
                BerthError::not_found("tool", &stage.tool),
            );
        }

        let session = match &request.session_id {
            Some(id) => self.sessions.get(id),
            None => self.create_auto_session(operation).await,
        };
        let session = match session {
            Ok(s) => s,
            Err(e) => return fail_early(request.session_id.clone(), None, e),
        };

        let _guard = match self.acquire(cancel, &session.id).await {
            Ok(g) => g,
            Err(e) => return fail_early(Some(session.id), None, e),
        };

        let mut response = PipelineResponse {
            run_id: run_id.to_string(),
            operation: operation.to_string(),
            session_id: Some(session.id.clone()),
            status: RunStatus::Completed,
            output: Value::Object(Default::default()),
            failed_stage: None,
            error: None,
            stages: Vec::new(),
            duration_ms: 0,
        };

        if definition.steps.is_empty() {
            return response;
        }

        if let Err(e) = self
            .sessions
            .update(&session.id, SessionUpdate::state(SessionState::Active))
            .await
        {
            response.status = RunStatus::Failed;
            response.error = Some(ErrorReport::from(&e));
            return response;
        }

        self.events.emit(PipelineEvent::RunStarted {
            run_id: run_id.to_string(),
            operation: operation.to_string(),
            session_id: session.id.clone(),
            stage_count: definition.stage_count(),
        });

        let run = Run {
            run_id,
            input: &request.input,
            options: &request.options,
            definition: &definition,
            session_id: session.id.clone(),
            workspace: session.workspace.clone(),
            progress: self.progress.with_trace_id(run_id),
            cancel,
        };

        let mut outputs: BTreeMap<String, Value> = BTreeMap::new();
        for step in &definition.steps {
            let results: Vec<(&Stage, StageResult)> = match step {
                PipelineStep::Stage(stage) => vec![(stage, self.run_stage(&run, stage, &outputs).await)],
                PipelineStep::Group(stages) => {
                    let runs = stages.iter().map(|stage| self.run_stage(&run, stage, &outputs));
                    stages.iter().zip(futures::future::join_all(runs).await).collect()
                }
            };

            let mut failures: Vec<(String, BerthError)> = Vec::new();
            for (stage, (metadata, result)) in results {
                response.stages.push(metadata);
                match result {
                    Ok(value) => {
                        outputs.insert(stage.name.clone(), value);
                        self.record_completed(&run, &stage.name).await;
                    }
                    Err(e) => failures.push((stage.name.clone(), e)),
                }
            }

            if !failures.is_empty() {
                response.status = RunStatus::Failed;
                response.failed_stage = Some(failures[0].0.clone());
                response.error = Some(failure_report(&failures));
                break;
            }
        }

        response.output = Value::Object(outputs.into_iter().collect());
        response
    }

    async fn acquire(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
    ) -> Result<crate::locks::SessionGuard> {
        tokio::select! {
            guard = self.locks.acquire(session_id, self.contention) => guard,
            _ = cancel.cancelled() => Err(BerthError::Cancelled {
                operation: format!("waiting for session '{session_id}'"),
            }),
        }
    }

    async fn record_completed(&self, run: &Run<'_>, stage: &str) {
        if let Err(e) = self
            .sessions
            .update(&run.session_id, SessionUpdate::completed_stage(stage))
            .await
        {
            tracing::warn!(session_id = %run.session_id, stage, error = %e, "Failed to record completed stage");
        }
    }

    // -----------------------------------------------------------------------
    // Stage execution
    // -----------------------------------------------------------------------

    async fn run_stage(
        &self,
        run: &Run<'_>,
        stage: &Stage,
        outputs: &BTreeMap<String, Value>,
    ) -> StageResult {
        let started = Instant::now();
        let mut metadata = StageMetadata {
            name: stage.name.clone(),
            tool: stage.tool.clone(),
            status: StageStatus::Failed,
            duration_ms: 0,
            attempts: 0,
            retry_count: 0,
            repair_history: Vec::new(),
            error: None,
        };

        let input = StageInput {
            input: run.input,
            outputs,
            workspace: &run.workspace,
        };
        let prepared = stage.check(&input).and_then(|_| stage.build_args(&input));
        let args = match prepared {
            Ok(args) => args,
            Err(e) => {
                tracing::warn!(stage = %stage.name, error = %e, "Stage rejected before execution");
                metadata.error = Some(e.to_string());
                self.events.emit(PipelineEvent::StageFailed {
                    run_id: run.run_id.to_string(),
                    stage: stage.name.clone(),
                    error: e.to_string(),
                });
                return (metadata, Err(e));
            }
        };

        tracing::info!(run_id = %run.run_id, stage = %stage.name, tool = %stage.tool, "Stage started");
        self.events.emit(PipelineEvent::StageStarted {
            run_id: run.run_id.to_string(),
            stage: stage.name.clone(),
            tool: stage.tool.clone(),
        });
        let token = run.progress.start_stage(&stage.name);

        let timeout = stage
            .timeout
            .or(run.options.timeout)
            .or(run.definition.timeout)
            .or(self.default_timeout);
        let ctx = ToolContext::new(&run.workspace)
            .with_session(&run.session_id)
            .with_dry_run(run.options.dry_run)
            .with_cancel(run.cancel.clone());

        let result = if stage.repair.is_some() {
            self.run_repaired(run, stage, token, &args, &ctx, timeout, &mut metadata)
                .await
        } else if let Some(policy) = stage
            .retry
            .as_ref()
            .or(run.definition.retry.as_ref())
            .or(self.default_retry.as_ref())
        {
            // Timeouts are only worth repeating under a repair loop.
            let inner = policy.retry_on.clone();
            let policy = policy
                .clone()
                .with_predicate(move |e| e.kind() != ErrorKind::Timeout && inner(e));
            self.run_retried(run, stage, token, &policy, &args, &ctx, timeout, &mut metadata)
                .await
        } else {
            metadata.attempts = 1;
            self.call_stage_tool(stage, args, &ctx, timeout).await
        };

        metadata.duration_ms = started.elapsed().as_millis() as u64;
        metadata.retry_count = metadata.attempts.saturating_sub(1);
        match &result {
            Ok(_) => {
                metadata.status = StageStatus::Completed;
                run.progress.complete_stage(token, true, &format!("{} completed", stage.name));
                tracing::info!(
                    stage = %stage.name,
                    attempts = metadata.attempts,
                    duration_ms = metadata.duration_ms,
                    "Stage completed"
                );
                self.events.emit(PipelineEvent::StageCompleted {
                    run_id: run.run_id.to_string(),
                    stage: stage.name.clone(),
                    attempts: metadata.attempts,
                    duration_ms: metadata.duration_ms,
                });
            }
            Err(e) => {
                metadata.error = Some(e.to_string());
                run.progress.complete_stage(token, false, &e.to_string());
                tracing::warn!(
                    stage = %stage.name,
                    attempts = metadata.attempts,
                    kind = %e.kind(),
                    error = %e,
                    "Stage failed"
                );
                self.events.emit(PipelineEvent::StageFailed {
                    run_id: run.run_id.to_string(),
                    stage: stage.name.clone(),
                    error: e.to_string(),
                });
            }
        }
        (metadata, result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_repaired(
        &self,
        run: &Run<'_>,
        stage: &Stage,
        token: ProgressToken,
        args: &Value,
        ctx: &ToolContext,
        timeout: Option<Duration>,
        metadata: &mut StageMetadata,
    ) -> Result<Value> {
        let Some(repair) = stage.repair.as_ref() else {
            return Err(BerthError::execution(&stage.tool, "stage has no repair configuration"));
        };
        self.checkpoint_before_repair(run, stage).await;

        let attempt = |_: usize| self.call_stage_tool(stage, args.clone(), ctx, timeout);

        let Some(responder) = &self.responder else {
            tracing::warn!(stage = %stage.name, "No responder configured, repair falls back to plain retries");
            let policy = RetryPolicy::new(repair.max_attempts, repair.backoff.clone());
            let mut history = Vec::new();
            let result = self
                .run_retried_with(run, stage, token, &policy, attempt, &mut history, metadata)
                .await;
            let exhausted = metadata.attempts >= policy.max_attempts.max(1);
            let result = match result {
                Err(e) if exhausted && e.is_retryable() => {
                    tracing::error!(stage = %stage.name, attempts = metadata.attempts, "Retry attempts exhausted without repair");
                    Err(BerthError::ExhaustedRetries {
                        stage: stage.name.clone(),
                        attempts: metadata.attempts,
                        history: history.iter().map(|h| h.error.clone()).collect(),
                    })
                }
                other => other,
            };
            metadata.repair_history = history;
            return result;
        };

        let repair_loop = RepairLoop::new(responder.clone(), repair.clone());
        let scope = RepairScope {
            stage: &stage.name,
            workspace: &run.workspace,
            progress: &run.progress,
            token,
        };
        match repair_loop.run(run.cancel, scope, attempt).await {
            Ok(outcome) => {
                metadata.attempts = outcome.attempts;
                metadata.repair_history = outcome.history;
                Ok(outcome.value)
            }
            Err(failure) => {
                metadata.attempts = failure.attempts;
                metadata.repair_history = failure.history;
                Err(failure.error)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_retried(
        &self,
        run: &Run<'_>,
        stage: &Stage,
        token: ProgressToken,
        policy: &RetryPolicy,
        args: &Value,
        ctx: &ToolContext,
        timeout: Option<Duration>,
        metadata: &mut StageMetadata,
    ) -> Result<Value> {
        let attempt = |_: usize| self.call_stage_tool(stage, args.clone(), ctx, timeout);
        self.run_retried_with(run, stage, token, policy, attempt, &mut Vec::new(), metadata)
            .await
    }

    /// Run `attempt` under `policy`. Every failed attempt, the last one
    /// included, is appended to `failures` unless the run was cancelled.
    #[allow(clippy::too_many_arguments)]
    async fn run_retried_with<F, Fut>(
        &self,
        run: &Run<'_>,
        stage: &Stage,
        token: ProgressToken,
        policy: &RetryPolicy,
        attempt: F,
        failures: &mut Vec<RepairAttempt>,
        metadata: &mut StageMetadata,
    ) -> Result<Value>
    where
        F: FnMut(usize) -> Fut,
        Fut: std::future::Future<Output = Result<Value>>,
    {
        let max_attempts = policy.max_attempts;
        // Start of the attempt in flight; moved past the backoff on each retry.
        let mut started = Instant::now();
        let on_retry = |failed: usize, err: &BerthError, delay: Duration| {
            failures.push(RepairAttempt {
                attempt: failed,
                error: err.to_string(),
                duration_ms: Instant::now().saturating_duration_since(started).as_millis() as u64,
                fixed: false,
            });
            started = Instant::now() + delay;
            run.progress.mark_attempt(
                token,
                &format!("retry {}/{}", failed + 1, max_attempts),
                ((failed * 100) / max_attempts) as u32,
            );
            self.events.emit(PipelineEvent::StageRetrying {
                run_id: run.run_id.to_string(),
                stage: stage.name.clone(),
                attempt: failed + 1,
                delay_ms: delay.as_millis() as u64,
            });
        };
        let outcome = execute_with_retry(policy, &stage.name, run.cancel, on_retry, attempt).await;
        metadata.attempts = outcome.attempts;
        if let Err(e) = &outcome.result {
            if e.kind() != ErrorKind::Cancelled && failures.len() < outcome.attempts {
                failures.push(RepairAttempt {
                    attempt: outcome.attempts,
                    error: e.to_string(),
                    duration_ms: Instant::now().saturating_duration_since(started).as_millis() as u64,
                    fixed: false,
                });
            }
        }
        outcome.result
    }

    /// Create the session for a request that names none. These expire like
    /// any other session; when the table is full, expired ones are collected
    /// and creation is tried once more.
    async fn create_auto_session(&self, operation: &str) -> Result<Session> {
        let mut config = SessionConfig::default()
            .with_label("operation", operation)
            .with_label(AUTO_SESSION_LABEL, "true");
        if self.sessions.config().default_ttl.is_none() {
            config = config.with_ttl(self.auto_session_ttl);
        }

        match self.sessions.create(config.clone()).await {
            Err(e) if e.kind() == ErrorKind::ResourceExhausted => {
                let report = self.sessions.garbage_collect().await?;
                if report.expired_sessions.is_empty() {
                    return Err(e);
                }
                tracing::info!(
                    collected = report.expired_sessions.len(),
                    "Session limit reached, collected expired sessions"
                );
                self.sessions.create(config).await
            }
            other => other,
        }
    }

    /// Snapshot the workspace before a repair loop may rewrite it. Failure to
    /// checkpoint is logged and does not stop the stage.
    async fn checkpoint_before_repair(&self, run: &Run<'_>, stage: &Stage) {
        let note = format!("before {} repair ({})", stage.name, run.run_id);
        match self.sessions.checkpoint(&run.session_id, Some(note)).await {
            Ok(checkpoint) => self.events.emit(PipelineEvent::CheckpointCreated {
                run_id: run.run_id.to_string(),
                session_id: run.session_id.clone(),
                checkpoint_id: checkpoint.id,
            }),
            Err(e) => {
                tracing::warn!(session_id = %run.session_id, stage = %stage.name, error = %e, "Automatic checkpoint failed")
            }
        }
    }

    /// Run a stage's tool. Pre-flight saw it registered, so a tool missing
    /// now was removed mid-run and fails the stage rather than reading as an
    /// unknown name.
    async fn call_stage_tool(
        &self,
        stage: &Stage,
        arguments: Value,
        ctx: &ToolContext,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if !self.registry.has(&stage.tool) {
            tracing::error!(
                stage = %stage.name,
                tool = %stage.tool,
                session_id = ?ctx.session_id,
                "Tool was unregistered after pre-flight"
            );
            return Err(BerthError::execution(
                &stage.tool,
                format!("tool is no longer registered (stage '{}')", stage.name),
            ));
        }
        self.call_tool(&stage.tool, arguments, ctx, timeout).await
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        ctx: &ToolContext,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let call = self.registry.execute(tool, arguments, ctx);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                BerthError::Timeout {
                    operation: tool.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                }
            })?,
            None => call.await,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// One report for a step's failures. The first failure in declared order
/// decides the kind; the message lists every failing stage.
fn failure_report(failures: &[(String, BerthError)]) -> ErrorReport {
    match failures {
        [(_, only)] => ErrorReport::from(only),
        _ => {
            let mut report = ErrorReport::from(&failures[0].1);
            report.message = failures
                .iter()
                .map(|(stage, e)| format!("{stage}: {e}"))
                .collect::<Vec<_>>()
                .join("; ");
            report.history = failures
                .iter()
                .flat_map(|(_, e)| e.history().iter().cloned())
                .collect();
            report
        }
    }
}
