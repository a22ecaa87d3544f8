//! Tool trait, registry, and built-in tools for the Berth orchestrator.
//!
//! Provides the `Tool` trait, the schema-validating `ToolRegistry`, the
//! workspace utilities (echo, read_file, write_file, list_files), and the
//! containerization tools (analyze_repository, generate_dockerfile,
//! build_image, generate_manifests, deploy_manifests, verify_deployment)
//! together with the `ContainerRuntime` and `ClusterClient` seams they use.

pub mod builtin;
pub mod command;
pub mod containerize;
pub mod metrics;
pub mod registry;
pub mod schema;
pub mod tool;
pub mod truncation;
pub mod workspace;

pub use builtin::{EchoTool, ListFilesTool, ReadFileTool, WriteFileTool};
pub use command::{CommandOutput, CommandRunner};
pub use containerize::{
    register_containerization_tools, BuildRequest, ClusterClient, ContainerRuntime, DockerCli,
    KubectlCli, RepositoryAnalysis,
};
pub use metrics::{ToolMetrics, DURATION_BUCKETS_MS};
pub use registry::{ToolListing, ToolRegistry};
pub use tool::{parse_args, to_output, Tool, ToolContext, ToolDefinition, ToolSummary};

/// Register the general-purpose workspace tools.
pub fn register_workspace_tools(registry: &ToolRegistry) -> berth_types::Result<()> {
    registry.register(EchoTool)?;
    registry.register(ReadFileTool)?;
    registry.register(WriteFileTool)?;
    registry.register(ListFilesTool)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use berth_types::{BerthError, CancellationToken, ErrorKind};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    /// A tool that sleeps, then returns a fixed value. Used for cancellation
    /// and metrics tests.
    struct SlowTool {
        name: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl Tool for SlowTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: self.name.to_string(),
                version: "0.1.0".to_string(),
                description: "Sleeps then answers".to_string(),
                input_schema: json!({"type": "object"}),
                output_schema: serde_json::Value::Null,
            }
        }

        async fn execute(
            &self,
            _arguments: serde_json::Value,
            _ctx: &ToolContext,
        ) -> berth_types::Result<serde_json::Value> {
            tokio::time::sleep(self.delay).await;
            Ok(json!({"done": true}))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "fail".to_string(),
                version: "0.1.0".to_string(),
                description: "Always fails".to_string(),
                input_schema: json!({}),
                output_schema: serde_json::Value::Null,
            }
        }

        async fn execute(
            &self,
            _arguments: serde_json::Value,
            _ctx: &ToolContext,
        ) -> berth_types::Result<serde_json::Value> {
            Err(BerthError::Other("disk on fire".into()))
        }
    }

    fn ctx() -> (tempfile::TempDir, ToolContext) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path());
        (dir, ctx)
    }

    #[test]
    fn registry_register_and_get() {
        let registry = ToolRegistry::new();
        assert!(registry.is_empty());

        registry.register(EchoTool).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.has("echo"));
        assert!(registry.get("echo").is_ok());
        assert_eq!(
            registry.get("nonexistent").err().map(|e| e.kind()),
            Some(ErrorKind::NotFound)
        );
    }

    #[test]
    fn duplicate_registration_keeps_first_tool() {
        let registry = ToolRegistry::new();
        registry
            .register(SlowTool {
                name: "echo",
                delay: Duration::ZERO,
            })
            .unwrap();

        let err = registry.register(EchoTool).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.definition("echo").unwrap().description, "Sleeps then answers");
    }

    #[tokio::test]
    async fn unregistered_tool_is_gone() {
        let registry = ToolRegistry::new();
        registry.register(EchoTool).unwrap();

        let removed = registry.unregister("echo").unwrap();
        assert_eq!(removed.definition().name, "echo");
        assert!(!registry.has("echo"));
        assert_eq!(
            registry.unregister("echo").err().map(|e| e.kind()),
            Some(ErrorKind::NotFound)
        );

        let (_dir, ctx) = ctx();
        let err = registry.execute("echo", json!({}), &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn uncompilable_schema_is_rejected() {
        struct BadSchema;

        #[async_trait]
        impl Tool for BadSchema {
            fn definition(&self) -> ToolDefinition {
                ToolDefinition {
                    name: "bad".into(),
                    version: "0.1.0".into(),
                    description: String::new(),
                    input_schema: json!({"type": "not-a-type"}),
                    output_schema: serde_json::Value::Null,
                }
            }

            async fn execute(
                &self,
                _arguments: serde_json::Value,
                _ctx: &ToolContext,
            ) -> berth_types::Result<serde_json::Value> {
                Ok(serde_json::Value::Null)
            }
        }

        let registry = ToolRegistry::new();
        let err = registry.register(BadSchema).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
        assert!(!registry.has("bad"));
    }

    #[test]
    fn list_is_sorted_and_restartable() {
        let registry = ToolRegistry::new();
        register_workspace_tools(&registry).unwrap();

        let listing = registry.list();
        let first: Vec<&str> = listing.iter().map(|t| t.name.as_str()).collect();
        let second: Vec<&str> = (&listing).into_iter().map(|t| t.name.as_str()).collect();
        assert_eq!(first, vec!["echo", "list_files", "read_file", "write_file"]);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn echo_returns_its_argument() {
        let registry = ToolRegistry::new();
        registry.register(EchoTool).unwrap();
        let (_dir, ctx) = ctx();

        let out = registry
            .execute("echo", json!({"msg": "hi"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out, json!({"msg": "hi"}));
    }

    #[tokio::test]
    async fn schema_violation_is_not_executed() {
        let registry = ToolRegistry::new();
        registry.register(EchoTool).unwrap();
        let (_dir, ctx) = ctx();

        let err = registry
            .execute("echo", json!({"msg": 5}), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
        assert_eq!(registry.tool_metrics("echo").unwrap().executions, 0);
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let registry = ToolRegistry::new();
        let (_dir, ctx) = ctx();
        let err = registry.execute("nope", json!({}), &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn cancellation_interrupts_execution() {
        let registry = ToolRegistry::new();
        registry
            .register(SlowTool {
                name: "slow",
                delay: Duration::from_secs(30),
            })
            .unwrap();
        let cancel = CancellationToken::new();
        let (_dir, ctx) = ctx();
        let ctx = ctx.with_cancel(cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = registry.execute("slow", json!({}), &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn untyped_failures_are_attributed_to_the_tool() {
        let registry = ToolRegistry::new();
        registry.register(FailingTool).unwrap();
        let (_dir, ctx) = ctx();

        let err = registry.execute("fail", json!({}), &ctx).await.unwrap_err();
        match err {
            BerthError::ExecutionFailed { tool, message, .. } => {
                assert_eq!(tool, "fail");
                assert_eq!(message, "disk on fire");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn metrics_track_successes_and_failures() {
        let registry = ToolRegistry::new();
        registry.register(EchoTool).unwrap();
        registry.register(FailingTool).unwrap();
        let (_dir, ctx) = ctx();

        for _ in 0..3 {
            registry.execute("echo", json!({"msg": "x"}), &ctx).await.unwrap();
        }
        let _ = registry.execute("fail", json!({}), &ctx).await;

        let echo = registry.tool_metrics("echo").unwrap();
        assert_eq!(echo.executions, 3);
        assert_eq!(echo.successes, 3);
        assert_eq!(echo.histogram[0], 3);

        let all = registry.metrics();
        assert_eq!(all["fail"].failures, 1);
    }

    #[tokio::test]
    async fn concurrent_invocations_share_registry() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(EchoTool).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            let ctx = ToolContext::new(dir.path());
            handles.push(tokio::spawn(async move {
                registry
                    .execute("echo", json!({"msg": format!("m{i}")}), &ctx)
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(registry.tool_metrics("echo").unwrap().executions, 16);
    }

    #[tokio::test]
    async fn workspace_tools_round_trip_a_file() {
        let registry = ToolRegistry::new();
        register_workspace_tools(&registry).unwrap();
        let (_dir, ctx) = ctx();

        registry
            .execute(
                "write_file",
                json!({"path": "sub/a.txt", "content": "one\ntwo"}),
                &ctx,
            )
            .await
            .unwrap();

        let read = registry
            .execute("read_file", json!({"path": "sub/a.txt"}), &ctx)
            .await
            .unwrap();
        assert_eq!(read["total_lines"], 2);
        assert_eq!(read["content"], "1: one\n2: two");
        assert_eq!(read["lines"], json!([1, 2]));

        let tail = registry
            .execute("read_file", json!({"path": "sub/a.txt", "start_line": 2}), &ctx)
            .await
            .unwrap();
        assert_eq!(tail["content"], "2: two");

        let listed = registry
            .execute("list_files", json!({"pattern": "**/*.txt"}), &ctx)
            .await
            .unwrap();
        assert_eq!(listed["files"], json!(["sub/a.txt"]));
    }

    #[tokio::test]
    async fn workspace_tools_refuse_escapes() {
        let registry = ToolRegistry::new();
        register_workspace_tools(&registry).unwrap();
        let (_dir, ctx) = ctx();

        let err = registry
            .execute("read_file", json!({"path": "../etc/passwd"}), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }

    #[tokio::test]
    async fn dry_run_write_leaves_workspace_untouched() {
        let registry = ToolRegistry::new();
        register_workspace_tools(&registry).unwrap();
        let (dir, ctx) = ctx();
        let ctx = ctx.with_dry_run(true);

        let out = registry
            .execute("write_file", json!({"path": "x.txt", "content": "abc"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["dry_run"], true);
        assert_eq!(out["created"], true);
        assert_eq!(out["bytes"], 3);
        assert!(!dir.path().join("x.txt").exists());
    }
}
