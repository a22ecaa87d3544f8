use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use berth_types::{BerthError, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::analyze::RepositoryAnalysis;
use super::dockerfile::DOCKERFILE;
use super::runtime::{BuildRequest, ContainerRuntime};
use crate::command::CommandOutput;
use crate::tool::{parse_args, to_output, Tool, ToolContext, ToolDefinition};
use crate::truncation::{truncate_output, TruncationMode};

/// Build output kept in errors and results. The tail is where compilers and
/// package managers print the actual failure.
const MAX_LOG_BYTES: usize = 8_000;

#[derive(Debug, Deserialize)]
struct BuildArgs {
    #[serde(default)]
    image: Option<String>,
    #[serde(default = "default_tag")]
    tag: String,
    #[serde(default)]
    context: Option<PathBuf>,
    #[serde(default = "default_dockerfile")]
    dockerfile: String,
}

fn default_tag() -> String {
    "latest".to_string()
}

fn default_dockerfile() -> String {
    DOCKERFILE.to_string()
}

#[derive(Debug, Serialize)]
struct BuildOutput {
    image: String,
    command: String,
    dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    log_tail: Option<String>,
}

/// Turn a finished command into the tool's error contract: timeouts keep their
/// kind, non-zero exits become retryable failures carrying the log tail.
pub(crate) fn check_output(tool: &str, timeout_ms: u64, output: &CommandOutput) -> Result<()> {
    if output.timed_out {
        return Err(BerthError::Timeout {
            operation: tool.to_string(),
            timeout_ms,
        });
    }
    if !output.success() {
        return Err(BerthError::retryable_execution(
            tool,
            format!(
                "exit code {}\n{}",
                output.exit_code,
                truncate_output(&output.combined(), MAX_LOG_BYTES, TruncationMode::Tail)
            ),
        ));
    }
    Ok(())
}

pub struct BuildImageTool {
    runtime: Arc<dyn ContainerRuntime>,
    timeout_ms: u64,
}

impl BuildImageTool {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, timeout_ms: u64) -> Self {
        Self { runtime, timeout_ms }
    }
}

#[async_trait]
impl Tool for BuildImageTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "build_image".to_string(),
            version: "1.0.0".to_string(),
            description: "Build a container image from the workspace Dockerfile.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "image": { "type": "string", "description": "Image name (defaults to the analyzed app name)" },
                    "tag": { "type": "string", "default": "latest" },
                    "context": { "type": "string", "description": "Build context (defaults to the analyzed repository)" },
                    "dockerfile": { "type": "string", "default": "Dockerfile" }
                }
            }),
            output_schema: json!({
                "type": "object",
                "required": ["image", "command", "dry_run"]
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value> {
        let args: BuildArgs = parse_args("build_image", arguments)?;
        let dockerfile = ctx.resolve(&args.dockerfile)?;

        let (name, context) = match (args.image, args.context) {
            (Some(image), Some(context)) => (image, context),
            (image, context) => {
                let analysis = RepositoryAnalysis::load(ctx).await?;
                (
                    image.unwrap_or(analysis.app_name),
                    context.unwrap_or(analysis.repo_path),
                )
            }
        };
        let image = if name.contains(':') {
            name
        } else {
            format!("{name}:{}", args.tag)
        };

        let request = BuildRequest {
            image: image.clone(),
            dockerfile,
            context,
        };
        let command = self.runtime.describe_build(&request);

        if ctx.dry_run {
            tracing::info!(%command, "[dry-run] Would build image");
            return to_output(
                "build_image",
                &BuildOutput {
                    image,
                    command,
                    dry_run: true,
                    duration_ms: None,
                    log_tail: None,
                },
            );
        }

        if !request.dockerfile.is_file() {
            return Err(BerthError::not_found("file", &args.dockerfile));
        }

        let output = self.runtime.build(&request, &ctx.cancel).await?;
        check_output("build_image", self.timeout_ms, &output)?;

        to_output(
            "build_image",
            &BuildOutput {
                image,
                command,
                dry_run: false,
                duration_ms: Some(output.duration_ms),
                log_tail: Some(truncate_output(&output.stdout, 2_000, TruncationMode::Tail)),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containerize::testing::MockRuntime;

    fn ctx_with_dockerfile() -> (tempfile::TempDir, ToolContext) {
        let ws = tempfile::tempdir().unwrap();
        std::fs::write(ws.path().join(DOCKERFILE), "FROM scratch\n").unwrap();
        let ctx = ToolContext::new(ws.path());
        (ws, ctx)
    }

    #[tokio::test]
    async fn successful_build_reports_image() {
        let (_ws, ctx) = ctx_with_dockerfile();
        let runtime = Arc::new(MockRuntime::succeeding());
        let tool = BuildImageTool::new(runtime.clone(), 1000);

        let out = tool
            .execute(json!({"image": "demo", "context": "/src"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["image"], "demo:latest");
        assert_eq!(runtime.builds(), 1);
    }

    #[tokio::test]
    async fn failed_build_is_retryable_and_carries_log() {
        let (_ws, ctx) = ctx_with_dockerfile();
        let runtime = Arc::new(MockRuntime::failing("npm ERR! missing script: start"));
        let tool = BuildImageTool::new(runtime, 1000);

        let err = tool
            .execute(json!({"image": "demo:1", "context": "/src"}), &ctx)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("missing script"));
    }

    #[tokio::test]
    async fn dry_run_does_not_invoke_runtime() {
        let (_ws, ctx) = ctx_with_dockerfile();
        let ctx = ctx.with_dry_run(true);
        let runtime = Arc::new(MockRuntime::succeeding());
        let tool = BuildImageTool::new(runtime.clone(), 1000);

        let out = tool
            .execute(json!({"image": "demo", "context": "/src"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["dry_run"], true);
        assert!(out["command"].as_str().unwrap().contains("demo:latest"));
        assert_eq!(runtime.builds(), 0);
    }

    #[test]
    fn timed_out_output_maps_to_timeout() {
        let output = CommandOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            timed_out: true,
            duration_ms: 10,
        };
        let err = check_output("build_image", 10, &output).unwrap_err();
        assert_eq!(err.kind(), berth_types::ErrorKind::Timeout);
    }
}
