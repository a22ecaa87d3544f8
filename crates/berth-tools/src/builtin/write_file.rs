use async_trait::async_trait;
use berth_types::BerthError;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::tool::{parse_args, to_output, Tool, ToolContext, ToolDefinition};

#[derive(Debug, Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct WriteOutput {
    path: String,
    bytes: usize,
    /// The file did not exist before this call.
    created: bool,
    dry_run: bool,
}

/// Replace (or create) a workspace file. Missing directories are created.
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "write_file".into(),
            version: "1.0.0".into(),
            description: "Create or overwrite a session workspace file.".into(),
            input_schema: json!({
                "type": "object",
                "required": ["path", "content"],
                "properties": {
                    "path": { "type": "string", "description": "Path relative to the workspace" },
                    "content": { "type": "string" }
                }
            }),
            output_schema: json!({
                "type": "object",
                "required": ["path", "bytes", "created", "dry_run"],
                "properties": {
                    "path": { "type": "string" },
                    "bytes": { "type": "integer" },
                    "created": { "type": "boolean" },
                    "dry_run": { "type": "boolean" }
                }
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> berth_types::Result<serde_json::Value> {
        let args: WriteArgs = parse_args("write_file", arguments)?;
        let path = ctx.resolve(&args.path)?;
        let created = !tokio::fs::try_exists(&path).await.unwrap_or(false);

        if ctx.dry_run {
            tracing::debug!(path = %args.path, "Dry run, not writing");
        } else {
            let failed = |e: std::io::Error| BerthError::execution("write_file", format!("{}: {e}", args.path));
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await.map_err(failed)?;
            }
            tokio::fs::write(&path, args.content.as_bytes())
                .await
                .map_err(failed)?;
        }

        to_output(
            "write_file",
            &WriteOutput {
                bytes: args.content.len(),
                path: args.path,
                created,
                dry_run: ctx.dry_run,
            },
        )
    }
}
