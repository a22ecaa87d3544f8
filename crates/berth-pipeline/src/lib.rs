//! Stage-based pipeline engine for the Berth orchestrator.
//!
//! This crate runs named pipelines of tool-backed stages inside session
//! workspaces: per-session execution locks, retry with backoff, per-stage
//! timeouts, the AI repair loop for build and deploy stages, stage progress
//! reporting, and lifecycle events on a broadcast channel.

pub mod engine;
pub mod events;
pub mod locks;
pub mod pipelines;
pub mod progress;
pub mod repair;
pub mod request;
pub mod retry;
pub mod stage;

pub use engine::{PipelineEngine, PipelineSummary, AUTO_SESSION_LABEL, DEFAULT_AUTO_SESSION_TTL};
pub use events::{EventEmitter, PipelineEvent};
pub use locks::{ContentionPolicy, SessionLocks};
pub use pipelines::{default_pipelines, register_default_pipelines, PipelineSettings};
pub use progress::{ProgressEvent, ProgressReporter, ProgressStage, ProgressStatus, ProgressToken};
pub use repair::{
    extract_fixed_content, RepairAttempt, RepairConfig, RepairFailure, RepairLoop, RepairOutcome,
    RepairScope,
};
pub use request::{
    PipelineRequest, PipelineResponse, RunOptions, RunStatus, StageMetadata, StageStatus,
};
pub use retry::{execute_with_retry, BackoffPolicy, RetryOutcome, RetryPolicy};
pub use stage::{PipelineDefinition, PipelineStep, Stage, StageInput};
