use async_trait::async_trait;
use berth_types::BerthError;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::tool::{parse_args, to_output, Tool, ToolContext, ToolDefinition};
use crate::truncation::{truncate_output, TruncationMode};

const MAX_CONTENT_BYTES: usize = 50_000;
const DEFAULT_MAX_LINES: usize = 2_000;

#[derive(Debug, Deserialize)]
struct ReadArgs {
    path: String,
    /// 1-based.
    #[serde(default = "first_line")]
    start_line: usize,
    #[serde(default = "default_max_lines")]
    max_lines: usize,
}

fn first_line() -> usize {
    1
}

fn default_max_lines() -> usize {
    DEFAULT_MAX_LINES
}

#[derive(Debug, Serialize)]
struct ReadOutput {
    path: String,
    content: String,
    total_lines: usize,
    /// Inclusive range actually returned; `None` when it is empty.
    lines: Option<[usize; 2]>,
}

/// Numbered view of a workspace file, e.g. `12: EXPOSE 8080`.
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "read_file".into(),
            version: "1.0.0".into(),
            description: "Show a session workspace file with line numbers.".into(),
            input_schema: json!({
                "type": "object",
                "required": ["path"],
                "properties": {
                    "path": { "type": "string", "description": "Path relative to the workspace" },
                    "start_line": { "type": "integer", "minimum": 1 },
                    "max_lines": { "type": "integer", "minimum": 1, "default": DEFAULT_MAX_LINES }
                }
            }),
            output_schema: json!({
                "type": "object",
                "required": ["path", "content", "total_lines"],
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" },
                    "total_lines": { "type": "integer" },
                    "lines": {
                        "type": ["array", "null"],
                        "items": { "type": "integer" }
                    }
                }
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> berth_types::Result<serde_json::Value> {
        let args: ReadArgs = parse_args("read_file", arguments)?;
        let path = ctx.resolve(&args.path)?;

        let text = tokio::fs::read_to_string(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BerthError::not_found("file", &args.path),
            _ => BerthError::execution("read_file", format!("{}: {e}", args.path)),
        })?;

        let total_lines = text.lines().count();
        let skip = args.start_line.max(1) - 1;
        let last = (skip + args.max_lines).min(total_lines);
        let width = last.max(1).to_string().len();

        let numbered = text
            .lines()
            .enumerate()
            .skip(skip)
            .take(args.max_lines)
            .map(|(i, line)| format!("{:>width$}: {line}", i + 1))
            .collect::<Vec<_>>()
            .join("\n");

        to_output(
            "read_file",
            &ReadOutput {
                path: args.path,
                content: truncate_output(&numbered, MAX_CONTENT_BYTES, TruncationMode::HeadTail),
                total_lines,
                lines: (skip < last).then(|| [skip + 1, last]),
            },
        )
    }
}
