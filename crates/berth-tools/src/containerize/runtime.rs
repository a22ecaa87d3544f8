//! Thin clients for the container daemon and the cluster.
//!
//! Both are traits so tests and embedders can substitute them; the default
//! implementations shell out to the `docker` and `kubectl` binaries through
//! [`CommandRunner`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use berth_types::{CancellationToken, Result};

use crate::command::{CommandOutput, CommandRunner};

/// Parameters for a single image build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub image: String,
    pub dockerfile: PathBuf,
    pub context: PathBuf,
}

/// Builds container images.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Human-readable command line for dry runs and logs.
    fn describe_build(&self, request: &BuildRequest) -> String;

    async fn build(&self, request: &BuildRequest, cancel: &CancellationToken) -> Result<CommandOutput>;
}

/// Applies manifests to a cluster and watches rollouts.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    fn name(&self) -> &str;

    fn describe_apply(&self, manifests: &Path, namespace: &str) -> String;

    async fn apply(
        &self,
        manifests: &Path,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput>;

    async fn rollout_status(
        &self,
        deployment: &str,
        namespace: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput>;
}

// ---------------------------------------------------------------------------
// docker
// ---------------------------------------------------------------------------

pub struct DockerCli {
    binary: String,
    runner: CommandRunner,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>, runner: CommandRunner) -> Self {
        Self {
            binary: binary.into(),
            runner,
        }
    }

    fn build_args(request: &BuildRequest) -> Vec<String> {
        vec![
            "build".into(),
            "-t".into(),
            request.image.clone(),
            "-f".into(),
            request.dockerfile.to_string_lossy().into_owned(),
            request.context.to_string_lossy().into_owned(),
        ]
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    fn name(&self) -> &str {
        &self.binary
    }

    fn describe_build(&self, request: &BuildRequest) -> String {
        format!("{} {}", self.binary, Self::build_args(request).join(" "))
    }

    async fn build(&self, request: &BuildRequest, cancel: &CancellationToken) -> Result<CommandOutput> {
        tracing::info!(image = %request.image, runtime = %self.binary, "Building image");
        self.runner
            .run(&self.binary, &Self::build_args(request), &request.context, cancel)
            .await
    }
}

// ---------------------------------------------------------------------------
// kubectl
// ---------------------------------------------------------------------------

pub struct KubectlCli {
    binary: String,
    runner: CommandRunner,
}

impl KubectlCli {
    pub fn new(binary: impl Into<String>, runner: CommandRunner) -> Self {
        Self {
            binary: binary.into(),
            runner,
        }
    }

    fn apply_args(manifests: &Path, namespace: &str) -> Vec<String> {
        vec![
            "apply".into(),
            "-n".into(),
            namespace.into(),
            "-f".into(),
            manifests.to_string_lossy().into_owned(),
        ]
    }
}

#[async_trait]
impl ClusterClient for KubectlCli {
    fn name(&self) -> &str {
        &self.binary
    }

    fn describe_apply(&self, manifests: &Path, namespace: &str) -> String {
        format!("{} {}", self.binary, Self::apply_args(manifests, namespace).join(" "))
    }

    async fn apply(
        &self,
        manifests: &Path,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        tracing::info!(namespace, manifests = %manifests.display(), "Applying manifests");
        let cwd = manifests.parent().unwrap_or(manifests);
        self.runner
            .run(&self.binary, &Self::apply_args(manifests, namespace), cwd, cancel)
            .await
    }

    async fn rollout_status(
        &self,
        deployment: &str,
        namespace: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        let args = vec![
            "rollout".to_string(),
            "status".to_string(),
            format!("deployment/{deployment}"),
            "-n".to_string(),
            namespace.to_string(),
            format!("--timeout={}s", timeout.as_secs().max(1)),
        ];
        let cwd = std::env::temp_dir();
        self.runner.run(&self.binary, &args, &cwd, cancel).await
    }
}
