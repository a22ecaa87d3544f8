//! Tools that take a source repository to a running deployment.

mod analyze;
mod build;
mod deploy;
mod dockerfile;
mod manifests;
mod runtime;

use std::sync::Arc;

pub use analyze::{analyze, sanitize_name, AnalyzeRepositoryTool, RepositoryAnalysis, ANALYSIS_FILE};
pub use build::BuildImageTool;
pub use deploy::{DeployManifestsTool, VerifyDeploymentTool};
pub use dockerfile::{render as render_dockerfile, GenerateDockerfileTool, DOCKERFILE};
pub use manifests::{
    render_deployment, render_service, GenerateManifestsTool, ManifestSpec, DEPLOYMENT_MANIFEST,
    MANIFEST_DIR, SERVICE_MANIFEST,
};
pub use runtime::{BuildRequest, ClusterClient, ContainerRuntime, DockerCli, KubectlCli};

use crate::registry::ToolRegistry;

/// Register the six containerization tools against the given clients.
///
/// `command_timeout_ms` is the limit reported when a build or apply times out;
/// the clients enforce it.
pub fn register_containerization_tools(
    registry: &ToolRegistry,
    runtime: Arc<dyn ContainerRuntime>,
    cluster: Arc<dyn ClusterClient>,
    command_timeout_ms: u64,
) -> berth_types::Result<()> {
    registry.register(AnalyzeRepositoryTool)?;
    registry.register(GenerateDockerfileTool)?;
    registry.register(BuildImageTool::new(runtime, command_timeout_ms))?;
    registry.register(GenerateManifestsTool)?;
    registry.register(DeployManifestsTool::new(cluster.clone(), command_timeout_ms))?;
    registry.register(VerifyDeploymentTool::new(cluster))?;
    Ok(())
}
