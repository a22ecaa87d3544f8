//! Pipeline run request and response types.

use std::time::Duration;

use berth_types::{BerthError, ErrorReport};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::repair::RepairAttempt;

/// Per-run options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Timeout applied to each stage that does not declare its own.
    #[serde(default, with = "opt_millis", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub dry_run: bool,
}

/// A request to run a named pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub operation: String,
    /// A new session is created when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub options: RunOptions,
}

impl PipelineRequest {
    pub fn new(operation: impl Into<String>, input: Value) -> Self {
        Self {
            operation: operation.into(),
            session_id: None,
            input,
            options: RunOptions::default(),
        }
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.options.dry_run = dry_run;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Failed,
}

/// What happened to one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMetadata {
    pub name: String,
    pub tool: String,
    pub status: StageStatus,
    pub duration_ms: u64,
    /// Attempts made, including the first. Zero when the stage never ran.
    pub attempts: usize,
    pub retry_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repair_history: Vec<RepairAttempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a pipeline run. Produced for every request, failed or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub run_id: String,
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: RunStatus,
    /// Stage outputs keyed by stage name.
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
    pub stages: Vec<StageMetadata>,
    pub duration_ms: u64,
}

impl PipelineResponse {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Names of the stages that ran, in execution order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn stage(&self, name: &str) -> Option<&StageMetadata> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub(crate) fn failed(
        run_id: &str,
        operation: &str,
        session_id: Option<String>,
        failed_stage: Option<String>,
        error: &BerthError,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            operation: operation.to_string(),
            session_id,
            status: RunStatus::Failed,
            output: Value::Object(Default::default()),
            failed_stage,
            error: Some(ErrorReport::from(error)),
            stages: Vec::new(),
            duration_ms: 0,
        }
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
