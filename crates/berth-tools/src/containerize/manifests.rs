use async_trait::async_trait;
use berth_types::{BerthError, ErrorKind, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::analyze::{sanitize_name, RepositoryAnalysis};
use crate::tool::{parse_args, to_output, Tool, ToolContext, ToolDefinition};

pub const MANIFEST_DIR: &str = "manifests";
pub const DEPLOYMENT_MANIFEST: &str = "manifests/deployment.yaml";
pub const SERVICE_MANIFEST: &str = "manifests/service.yaml";

#[derive(Debug, Deserialize)]
struct ManifestArgs {
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    app_name: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default = "default_replicas")]
    replicas: u32,
    #[serde(default = "default_namespace")]
    namespace: String,
}

fn default_replicas() -> u32 {
    1
}

pub(crate) fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Serialize)]
struct ManifestOutput {
    directory: String,
    files: Vec<String>,
    app_name: String,
    image: String,
    namespace: String,
    port: u16,
}

/// Parameters rendered into the Deployment and Service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestSpec {
    pub app_name: String,
    pub image: String,
    pub namespace: String,
    pub port: u16,
    pub replicas: u32,
}

pub fn render_deployment(spec: &ManifestSpec) -> String {
    format!(
        "apiVersion: apps/v1
kind: Deployment
metadata:
  name: {name}
  namespace: {ns}
  labels:
    app: {name}
spec:
  replicas: {replicas}
  selector:
    matchLabels:
      app: {name}
  template:
    metadata:
      labels:
        app: {name}
    spec:
      containers:
        - name: {name}
          image: {image}
          ports:
            - containerPort: {port}
",
        name = spec.app_name,
        ns = spec.namespace,
        replicas = spec.replicas,
        image = spec.image,
        port = spec.port,
    )
}

pub fn render_service(spec: &ManifestSpec) -> String {
    format!(
        "apiVersion: v1
kind: Service
metadata:
  name: {name}
  namespace: {ns}
spec:
  selector:
    app: {name}
  ports:
    - port: 80
      targetPort: {port}
",
        name = spec.app_name,
        ns = spec.namespace,
        port = spec.port,
    )
}

/// Load the workspace analysis if a previous stage produced one.
async fn optional_analysis(ctx: &ToolContext) -> Result<Option<RepositoryAnalysis>> {
    match RepositoryAnalysis::load(ctx).await {
        Ok(a) => Ok(Some(a)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

pub struct GenerateManifestsTool;

#[async_trait]
impl Tool for GenerateManifestsTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "generate_manifests".to_string(),
            version: "1.0.0".to_string(),
            description: "Generate Kubernetes Deployment and Service manifests into the workspace."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "image": { "type": "string" },
                    "app_name": { "type": "string" },
                    "port": { "type": "integer", "minimum": 1, "maximum": 65535 },
                    "replicas": { "type": "integer", "minimum": 1, "default": 1 },
                    "namespace": { "type": "string", "default": "default" }
                }
            }),
            output_schema: json!({
                "type": "object",
                "required": ["directory", "files", "app_name", "image"]
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value> {
        let args: ManifestArgs = parse_args("generate_manifests", arguments)?;
        let analysis = optional_analysis(ctx).await?;

        let app_name = match (args.app_name, &analysis) {
            (Some(name), _) => sanitize_name(&name),
            (None, Some(a)) => a.app_name.clone(),
            (None, None) => {
                return Err(BerthError::validation(
                    "generate_manifests",
                    "app_name is required when no repository analysis exists",
                ))
            }
        };
        let spec = ManifestSpec {
            image: args.image.unwrap_or_else(|| format!("{app_name}:latest")),
            port: args
                .port
                .or(analysis.as_ref().and_then(|a| a.port))
                .unwrap_or(8080),
            app_name,
            namespace: args.namespace,
            replicas: args.replicas,
        };

        tokio::fs::create_dir_all(ctx.resolve(MANIFEST_DIR)?).await?;
        tokio::fs::write(ctx.resolve(DEPLOYMENT_MANIFEST)?, render_deployment(&spec)).await?;
        tokio::fs::write(ctx.resolve(SERVICE_MANIFEST)?, render_service(&spec)).await?;
        tracing::info!(app = %spec.app_name, image = %spec.image, "Generated manifests");

        to_output(
            "generate_manifests",
            &ManifestOutput {
                directory: MANIFEST_DIR.to_string(),
                files: vec![DEPLOYMENT_MANIFEST.to_string(), SERVICE_MANIFEST.to_string()],
                app_name: spec.app_name,
                image: spec.image,
                namespace: spec.namespace,
                port: spec.port,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_carries_image_and_port() {
        let spec = ManifestSpec {
            app_name: "web".into(),
            image: "web:1.2".into(),
            namespace: "prod".into(),
            port: 3000,
            replicas: 2,
        };
        let yaml = render_deployment(&spec);
        assert!(yaml.contains("kind: Deployment"));
        assert!(yaml.contains("image: web:1.2"));
        assert!(yaml.contains("containerPort: 3000"));
        assert!(yaml.contains("replicas: 2"));
        assert!(render_service(&spec).contains("targetPort: 3000"));
    }

    #[tokio::test]
    async fn tool_writes_both_manifests() {
        let ws = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(ws.path());
        let out = GenerateManifestsTool
            .execute(json!({"app_name": "My App", "port": 8000}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["app_name"], "my-app");
        assert_eq!(out["image"], "my-app:latest");
        assert!(ws.path().join(DEPLOYMENT_MANIFEST).is_file());
        assert!(ws.path().join(SERVICE_MANIFEST).is_file());
    }

    #[tokio::test]
    async fn tool_without_name_or_analysis_is_rejected() {
        let ws = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(ws.path());
        let err = GenerateManifestsTool.execute(json!({}), &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }
}
