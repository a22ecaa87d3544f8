use async_trait::async_trait;
use globset::Glob;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::tool::{parse_args, to_output, Tool, ToolContext, ToolDefinition};

const MAX_ENTRIES: usize = 5_000;

#[derive(Debug, Deserialize)]
struct ListFilesArgs {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    pattern: Option<String>,
}

#[derive(Debug, Serialize)]
struct ListFilesOutput {
    files: Vec<String>,
    truncated: bool,
}

/// Lists files under a workspace directory, optionally filtered by a glob.
pub struct ListFilesTool;

#[async_trait]
impl Tool for ListFilesTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list_files".to_string(),
            version: "1.0.0".to_string(),
            description: "List files in the session workspace, optionally matching a glob pattern."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Workspace-relative directory to list (defaults to the workspace root)"
                    },
                    "pattern": {
                        "type": "string",
                        "description": "Glob pattern matched against paths relative to the listed directory"
                    }
                }
            }),
            output_schema: json!({
                "type": "object",
                "properties": {
                    "files": { "type": "array", "items": { "type": "string" } },
                    "truncated": { "type": "boolean" }
                }
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> berth_types::Result<serde_json::Value> {
        let args: ListFilesArgs = parse_args("list_files", arguments)?;
        let base = match &args.path {
            Some(p) => ctx.resolve(p)?,
            None => ctx.workspace().to_path_buf(),
        };
        let matcher = match &args.pattern {
            Some(p) => Some(
                Glob::new(p)
                    .map_err(|e| berth_types::BerthError::validation("list_files", e.to_string()))?
                    .compile_matcher(),
            ),
            None => None,
        };

        let (files, truncated) = tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            let mut truncated = false;
            for entry in walkdir::WalkDir::new(&base)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                let Ok(rel) = entry.path().strip_prefix(&base) else {
                    continue;
                };
                if matcher.as_ref().is_some_and(|m| !m.is_match(rel)) {
                    continue;
                }
                if files.len() >= MAX_ENTRIES {
                    truncated = true;
                    break;
                }
                files.push(rel.to_string_lossy().replace('\\', "/"));
            }
            (files, truncated)
        })
        .await
        .map_err(|e| berth_types::BerthError::execution("list_files", e.to_string()))?;

        to_output("list_files", &ListFilesOutput { files, truncated })
    }
}
