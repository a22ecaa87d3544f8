use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use berth_types::{BerthError, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::analyze::RepositoryAnalysis;
use super::build::check_output;
use super::manifests::{default_namespace, MANIFEST_DIR};
use super::runtime::ClusterClient;
use crate::tool::{parse_args, to_output, Tool, ToolContext, ToolDefinition};

#[derive(Debug, Deserialize)]
struct DeployArgs {
    #[serde(default = "default_namespace")]
    namespace: String,
    #[serde(default = "default_dir")]
    path: String,
}

fn default_dir() -> String {
    MANIFEST_DIR.to_string()
}

#[derive(Debug, Serialize)]
struct DeployOutput {
    namespace: String,
    command: String,
    dry_run: bool,
    applied: Vec<String>,
}

pub struct DeployManifestsTool {
    cluster: Arc<dyn ClusterClient>,
    timeout_ms: u64,
}

impl DeployManifestsTool {
    pub fn new(cluster: Arc<dyn ClusterClient>, timeout_ms: u64) -> Self {
        Self { cluster, timeout_ms }
    }
}

#[async_trait]
impl Tool for DeployManifestsTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "deploy_manifests".to_string(),
            version: "1.0.0".to_string(),
            description: "Apply the workspace manifests to the cluster.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "namespace": { "type": "string", "default": "default" },
                    "path": { "type": "string", "default": "manifests" }
                }
            }),
            output_schema: json!({
                "type": "object",
                "required": ["namespace", "command", "dry_run", "applied"]
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value> {
        let args: DeployArgs = parse_args("deploy_manifests", arguments)?;
        let manifests = ctx.resolve(&args.path)?;
        if !manifests.exists() {
            return Err(BerthError::not_found("manifests", &args.path));
        }
        let command = self.cluster.describe_apply(&manifests, &args.namespace);

        if ctx.dry_run {
            tracing::info!(%command, "[dry-run] Would apply manifests");
            return to_output(
                "deploy_manifests",
                &DeployOutput {
                    namespace: args.namespace,
                    command,
                    dry_run: true,
                    applied: vec![],
                },
            );
        }

        let output = self.cluster.apply(&manifests, &args.namespace, &ctx.cancel).await?;
        check_output("deploy_manifests", self.timeout_ms, &output)?;

        to_output(
            "deploy_manifests",
            &DeployOutput {
                namespace: args.namespace,
                command,
                dry_run: false,
                applied: output
                    .stdout
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .map(str::to_string)
                    .collect(),
            },
        )
    }
}

#[derive(Debug, Deserialize)]
struct VerifyArgs {
    #[serde(default)]
    app_name: Option<String>,
    #[serde(default = "default_namespace")]
    namespace: String,
    #[serde(default = "default_verify_timeout")]
    timeout_secs: u64,
}

fn default_verify_timeout() -> u64 {
    120
}

#[derive(Debug, Serialize)]
struct VerifyOutput {
    deployment: String,
    namespace: String,
    ready: bool,
    dry_run: bool,
    status: String,
}

pub struct VerifyDeploymentTool {
    cluster: Arc<dyn ClusterClient>,
}

impl VerifyDeploymentTool {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl Tool for VerifyDeploymentTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "verify_deployment".to_string(),
            version: "1.0.0".to_string(),
            description: "Wait for the deployment rollout to finish and report its status."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "app_name": { "type": "string" },
                    "namespace": { "type": "string", "default": "default" },
                    "timeout_secs": { "type": "integer", "minimum": 1, "default": 120 }
                }
            }),
            output_schema: json!({
                "type": "object",
                "required": ["deployment", "namespace", "ready"]
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value> {
        let args: VerifyArgs = parse_args("verify_deployment", arguments)?;
        let deployment = match args.app_name {
            Some(name) => name,
            None => RepositoryAnalysis::load(ctx).await?.app_name,
        };

        if ctx.dry_run {
            return to_output(
                "verify_deployment",
                &VerifyOutput {
                    deployment,
                    namespace: args.namespace,
                    ready: false,
                    dry_run: true,
                    status: "skipped (dry run)".to_string(),
                },
            );
        }

        let timeout = Duration::from_secs(args.timeout_secs);
        let output = self
            .cluster
            .rollout_status(&deployment, &args.namespace, timeout, &ctx.cancel)
            .await?;
        check_output("verify_deployment", timeout.as_millis() as u64, &output)?;

        to_output(
            "verify_deployment",
            &VerifyOutput {
                deployment,
                namespace: args.namespace,
                ready: true,
                dry_run: false,
                status: output.stdout.trim().to_string(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containerize::testing::MockCluster;

    #[tokio::test]
    async fn deploy_requires_manifests() {
        let ws = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(ws.path());
        let tool = DeployManifestsTool::new(Arc::new(MockCluster::healthy()), 1000);
        let err = tool.execute(json!({}), &ctx).await.unwrap_err();
        assert_eq!(err.kind(), berth_types::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn deploy_failure_is_retryable() {
        let ws = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(ws.path().join(MANIFEST_DIR)).unwrap();
        let ctx = ToolContext::new(ws.path());
        let tool = DeployManifestsTool::new(
            Arc::new(MockCluster::rejecting("error: unknown field \"contaners\"")),
            1000,
        );
        let err = tool.execute(json!({}), &ctx).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("contaners"));
    }

    #[tokio::test]
    async fn verify_reports_rollout_status() {
        let ws = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(ws.path());
        let tool = VerifyDeploymentTool::new(Arc::new(MockCluster::healthy()));
        let out = tool
            .execute(json!({"app_name": "web", "namespace": "prod"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["ready"], true);
        assert_eq!(out["deployment"], "web");
    }
}
