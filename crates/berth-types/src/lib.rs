//! Shared types and errors for the Berth orchestration engine.
//!
//! This crate provides the foundational types used across all other Berth crates:
//! - `BerthError`: unified error taxonomy with kind classification
//! - `ErrorKind`: the stable, serializable error category reported to callers
//! - `Labels`: key/value labels attached to sessions
//! - `CancellationToken`: the cancellation signal threaded through every long-running call

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use tokio_util::sync::CancellationToken;

/// Key/value labels attached to a session. Ordered so listings are stable.
pub type Labels = BTreeMap<String, String>;

/// Unified error type for all Berth subsystems.
#[derive(Debug, thiserror::Error)]
pub enum BerthError {
    // === Caller Errors ===
    #[error("Validation failed for '{subject}': {message}")]
    ValidationFailed { subject: String, message: String },

    #[error("{resource} '{id}' not found")]
    NotFound { resource: String, id: String },

    #[error("{resource} '{id}' already exists")]
    AlreadyExists { resource: String, id: String },

    // === Execution Errors ===
    #[error("Tool '{tool}' failed: {message}")]
    ExecutionFailed {
        tool: String,
        message: String,
        retryable: bool,
    },

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("'{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Repair exhausted for stage '{stage}' after {attempts} attempts")]
    ExhaustedRetries {
        stage: String,
        attempts: usize,
        history: Vec<String>,
    },

    #[error("Responder {responder} violated the reply contract: {message}")]
    ContractViolation { responder: String, message: String },

    #[error("Session '{session_id}' is busy with another pipeline run")]
    Busy { session_id: String },

    #[error("'{operation}' was cancelled")]
    Cancelled { operation: String },

    // === Responder Transport Errors ===
    #[error("Responder {provider} returned HTTP {status}: {message}")]
    ResponderError {
        provider: String,
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("Authentication failed for responder {provider}")]
    AuthError { provider: String },

    // === Generic ===
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Stable error categories surfaced in pipeline responses and tool results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationFailed,
    NotFound,
    AlreadyExists,
    ExecutionFailed,
    ResourceExhausted,
    Timeout,
    ExhaustedRetries,
    ContractViolation,
    Busy,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationFailed => "validation_failed",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::ExecutionFailed => "execution_failed",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ExhaustedRetries => "exhausted_retries",
            ErrorKind::ContractViolation => "contract_violation",
            ErrorKind::Busy => "busy",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BerthError {
    /// Shorthand for a non-retryable tool failure.
    pub fn execution(tool: impl Into<String>, message: impl Into<String>) -> Self {
        BerthError::ExecutionFailed {
            tool: tool.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Shorthand for a tool failure that a retry or repair may fix
    /// (a failed image build, a rejected manifest).
    pub fn retryable_execution(tool: impl Into<String>, message: impl Into<String>) -> Self {
        BerthError::ExecutionFailed {
            tool: tool.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        BerthError::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn validation(subject: impl Into<String>, message: impl Into<String>) -> Self {
        BerthError::ValidationFailed {
            subject: subject.into(),
            message: message.into(),
        }
    }

    /// The category reported to callers. Transport, storage and IO failures
    /// are all execution failures from the caller's point of view.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BerthError::ValidationFailed { .. } | BerthError::Json(_) => ErrorKind::ValidationFailed,
            BerthError::NotFound { .. } => ErrorKind::NotFound,
            BerthError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            BerthError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            BerthError::Timeout { .. } => ErrorKind::Timeout,
            BerthError::ExhaustedRetries { .. } => ErrorKind::ExhaustedRetries,
            BerthError::ContractViolation { .. } => ErrorKind::ContractViolation,
            BerthError::Busy { .. } => ErrorKind::Busy,
            BerthError::Cancelled { .. } => ErrorKind::Cancelled,
            BerthError::ExecutionFailed { .. }
            | BerthError::ResponderError { .. }
            | BerthError::AuthError { .. }
            | BerthError::Storage(_)
            | BerthError::Io(_)
            | BerthError::Other(_) => ErrorKind::ExecutionFailed,
        }
    }

    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BerthError::Timeout { .. }
                | BerthError::ExecutionFailed { retryable: true, .. }
                | BerthError::ResponderError { retryable: true, .. }
        )
    }

    /// Returns `true` if the error is permanent and retrying will not help.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BerthError::ValidationFailed { .. }
                | BerthError::NotFound { .. }
                | BerthError::AlreadyExists { .. }
                | BerthError::ExhaustedRetries { .. }
                | BerthError::ContractViolation { .. }
                | BerthError::Cancelled { .. }
                | BerthError::AuthError { .. }
        )
    }

    /// Maps the error to an HTTP status code for protocol adapters.
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::ValidationFailed => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::AlreadyExists | ErrorKind::Busy => 409,
            ErrorKind::ResourceExhausted => 429,
            ErrorKind::Timeout => 504,
            ErrorKind::Cancelled => 499,
            ErrorKind::ContractViolation => 502,
            ErrorKind::ExecutionFailed | ErrorKind::ExhaustedRetries => 500,
        }
    }

    /// Attempt history carried by an exhausted repair loop, empty otherwise.
    pub fn history(&self) -> &[String] {
        match self {
            BerthError::ExhaustedRetries { history, .. } => history,
            _ => &[],
        }
    }
}

/// A convenience alias for `Result<T, BerthError>`.
pub type Result<T> = std::result::Result<T, BerthError>;

/// Structured error payload returned across the tool invocation boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<String>,
}

impl From<&BerthError> for ErrorReport {
    fn from(err: &BerthError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            history: err.history().to_vec(),
        }
    }
}
