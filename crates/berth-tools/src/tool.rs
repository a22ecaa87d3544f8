use std::path::{Path, PathBuf};

use async_trait::async_trait;
use berth_types::{BerthError, CancellationToken, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Declared identity and contract of a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub version: String,
    pub description: String,
    /// JSON Schema the arguments are validated against before execution.
    pub input_schema: serde_json::Value,
    /// JSON Schema describing the result. Informational only.
    #[serde(default)]
    pub output_schema: serde_json::Value,
}

/// Listing entry for a registered tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
    pub version: String,
}

impl From<&ToolDefinition> for ToolSummary {
    fn from(def: &ToolDefinition) -> Self {
        Self {
            name: def.name.clone(),
            description: def.description.clone(),
            version: def.version.clone(),
        }
    }
}

/// Everything a tool may touch while executing: the session workspace it is
/// confined to, the dry-run flag and the caller's cancellation signal.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: Option<String>,
    pub workspace: PathBuf,
    pub dry_run: bool,
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            session_id: None,
            workspace: workspace.into(),
            dry_run: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Resolve a workspace-relative path, rejecting anything that escapes it.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        crate::workspace::resolve_in_workspace(&self.workspace, relative)
    }
}

/// Trait for tools that can be invoked by name through the registry.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value>;
}

/// Deserialize already schema-validated arguments into a tool's typed input.
pub fn parse_args<T: DeserializeOwned>(tool: &str, arguments: serde_json::Value) -> Result<T> {
    serde_json::from_value(arguments).map_err(|e| BerthError::validation(tool, e.to_string()))
}

/// Serialize a tool's typed output into the JSON result.
pub fn to_output<T: Serialize>(tool: &str, output: &T) -> Result<serde_json::Value> {
    serde_json::to_value(output).map_err(|e| BerthError::execution(tool, e.to_string()))
}
