use async_trait::async_trait;
use berth_types::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::analyze::RepositoryAnalysis;
use crate::tool::{parse_args, to_output, Tool, ToolContext, ToolDefinition};

pub const DOCKERFILE: &str = "Dockerfile";

#[derive(Debug, Deserialize)]
struct GenerateArgs {
    #[serde(default)]
    base_image: Option<String>,
    #[serde(default)]
    port: Option<u16>,
}

#[derive(Debug, Serialize)]
struct GenerateOutput {
    path: String,
    language: String,
    base_image: String,
    port: u16,
}

fn default_base_image(language: &str) -> &'static str {
    match language {
        "javascript" | "typescript" => "node:20-alpine",
        "python" => "python:3.12-slim",
        "go" => "golang:1.22-alpine",
        "java" => "eclipse-temurin:21-jdk",
        "rust" => "rust:1-slim",
        "ruby" => "ruby:3.3-slim",
        "php" => "php:8.3-apache",
        _ => "alpine:3.20",
    }
}

fn default_port(analysis: &RepositoryAnalysis) -> u16 {
    if let Some(port) = analysis.port {
        return port;
    }
    match (analysis.language.as_str(), analysis.framework.as_deref()) {
        (_, Some("flask")) => 5000,
        (_, Some("django")) | (_, Some("fastapi")) => 8000,
        ("javascript" | "typescript", _) => 3000,
        _ => 8080,
    }
}

/// Render a Dockerfile for the analyzed repository.
pub fn render(analysis: &RepositoryAnalysis, base_image: &str, port: u16) -> String {
    let entry = analysis.entry_points.first().map(String::as_str);
    let body = match analysis.language.as_str() {
        "javascript" | "typescript" => format!(
            "COPY package*.json ./\nRUN npm install --omit=dev\nCOPY . .\nCMD [\"node\", \"{}\"]\n",
            entry.unwrap_or("index.js")
        ),
        "python" => format!(
            "COPY requirements.txt* ./\nRUN if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; fi\nCOPY . .\nCMD [\"python\", \"{}\"]\n",
            entry.unwrap_or("main.py")
        ),
        "go" => "COPY . .\nRUN go build -o /app/server .\nCMD [\"/app/server\"]\n".to_string(),
        "java" => match analysis.build_system.as_deref() {
            Some("gradle") => "COPY . .\nRUN ./gradlew build -x test\nCMD [\"sh\", \"-c\", \"java -jar build/libs/*.jar\"]\n".to_string(),
            _ => "COPY . .\nRUN ./mvnw -q package -DskipTests\nCMD [\"sh\", \"-c\", \"java -jar target/*.jar\"]\n".to_string(),
        },
        "rust" => format!(
            "COPY . .\nRUN cargo build --release\nCMD [\"./target/release/{}\"]\n",
            analysis.app_name
        ),
        _ => "COPY . .\nCMD [\"sh\"]\n".to_string(),
    };
    format!("FROM {base_image}\nWORKDIR /app\n{body}EXPOSE {port}\n")
}

pub struct GenerateDockerfileTool;

#[async_trait]
impl Tool for GenerateDockerfileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "generate_dockerfile".to_string(),
            version: "1.0.0".to_string(),
            description: "Generate a Dockerfile in the workspace from the repository analysis."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "base_image": { "type": "string", "description": "Override the base image" },
                    "port": { "type": "integer", "minimum": 1, "maximum": 65535 }
                }
            }),
            output_schema: json!({
                "type": "object",
                "required": ["path", "language", "base_image", "port"]
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value> {
        let args: GenerateArgs = parse_args("generate_dockerfile", arguments)?;
        let analysis = RepositoryAnalysis::load(ctx).await?;

        let base_image = args
            .base_image
            .unwrap_or_else(|| default_base_image(&analysis.language).to_string());
        let port = args.port.unwrap_or_else(|| default_port(&analysis));
        let content = render(&analysis, &base_image, port);

        tokio::fs::write(ctx.resolve(DOCKERFILE)?, content).await?;
        tracing::info!(language = %analysis.language, %base_image, port, "Generated Dockerfile");

        to_output(
            "generate_dockerfile",
            &GenerateOutput {
                path: DOCKERFILE.to_string(),
                language: analysis.language,
                base_image,
                port,
            },
        )
    }
}
