//! The built-in containerization pipelines.
//!
//! - `containerize`: analyze → dockerfile → build → manifests → deploy → verify
//! - `build`: analyze → dockerfile → build
//! - `deploy`: manifests → deploy → verify
//!
//! `build` and `deploy` stages run under repair loops that rewrite the
//! Dockerfile and the Deployment manifest respectively.

use std::time::Duration;

use berth_tools::containerize::{ANALYSIS_FILE, DEPLOYMENT_MANIFEST, DOCKERFILE};
use berth_types::{BerthError, Result};
use serde_json::{Map, Value};

use crate::engine::PipelineEngine;
use crate::repair::RepairConfig;
use crate::retry::BackoffPolicy;
use crate::stage::{PipelineDefinition, Stage, StageInput};

pub const CONTAINERIZE: &str = "containerize";
pub const BUILD: &str = "build";
pub const DEPLOY: &str = "deploy";

/// Knobs shared by the built-in pipelines.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub repair_attempts: usize,
    pub repair_backoff: BackoffPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            repair_attempts: 3,
            repair_backoff: BackoffPolicy::fixed(Duration::from_secs(1)),
        }
    }
}

pub fn default_pipelines(settings: &PipelineSettings) -> Vec<PipelineDefinition> {
    vec![
        PipelineDefinition::new(CONTAINERIZE)
            .describe("Analyze, build and deploy a repository")
            .stage(analyze_stage())
            .stage(dockerfile_stage())
            .stage(build_stage(settings))
            .stage(manifests_stage())
            .stage(deploy_stage(settings))
            .stage(verify_stage()),
        PipelineDefinition::new(BUILD)
            .describe("Analyze a repository and build its image")
            .stage(analyze_stage())
            .stage(dockerfile_stage())
            .stage(build_stage(settings)),
        PipelineDefinition::new(DEPLOY)
            .describe("Generate manifests, apply them and wait for the rollout")
            .stage(manifests_stage().with_validation(|s| {
                if s.input_str("app_name").is_some() || s.workspace.join(ANALYSIS_FILE).is_file() {
                    Ok(())
                } else {
                    Err(BerthError::validation(
                        "manifests",
                        "app_name is required when the session has no repository analysis",
                    ))
                }
            }))
            .stage(deploy_stage(settings))
            .stage(verify_stage()),
    ]
}

pub fn register_default_pipelines(engine: &PipelineEngine, settings: &PipelineSettings) -> Result<()> {
    for definition in default_pipelines(settings) {
        engine.register_pipeline(definition)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

fn analyze_stage() -> Stage {
    Stage::new("analyze", "analyze_repository")
        .with_validation(|s| {
            s.input_str("repo_path")
                .filter(|p| !p.is_empty())
                .map(|_| ())
                .ok_or_else(|| BerthError::validation("analyze", "input.repo_path is required"))
        })
        .with_args(|s| Ok(pick(s, &["repo_path", "app_name"])))
}

fn dockerfile_stage() -> Stage {
    Stage::new("dockerfile", "generate_dockerfile").with_args(|s| Ok(pick(s, &["base_image", "port"])))
}

fn build_stage(settings: &PipelineSettings) -> Stage {
    Stage::new("build", "build_image")
        .with_args(|s| Ok(pick(s, &["image", "tag"])))
        .with_repair(repair(DOCKERFILE, settings))
}

fn manifests_stage() -> Stage {
    Stage::new("manifests", "generate_manifests").with_args(|s| {
        let mut args = pick(s, &["app_name", "port", "replicas", "namespace", "image"]);
        if let Some(image) = s.output("build", "image") {
            args["image"] = image.clone();
        }
        Ok(args)
    })
}

fn deploy_stage(settings: &PipelineSettings) -> Stage {
    Stage::new("deploy", "deploy_manifests")
        .with_args(|s| Ok(pick(s, &["namespace"])))
        .with_repair(repair(DEPLOYMENT_MANIFEST, settings))
}

fn verify_stage() -> Stage {
    Stage::new("verify", "verify_deployment").with_args(|s| {
        let mut args = pick(s, &["app_name", "namespace", "timeout_secs"]);
        if let Some(app) = s.output("manifests", "app_name") {
            args["app_name"] = app.clone();
        }
        Ok(args)
    })
}

fn repair(artifact: &str, settings: &PipelineSettings) -> RepairConfig {
    RepairConfig::new(artifact)
        .with_max_attempts(settings.repair_attempts)
        .with_backoff(settings.repair_backoff.clone())
}

/// Copy the named keys that are present in the request input.
fn pick(s: &StageInput<'_>, keys: &[&str]) -> Value {
    let mut args = Map::new();
    for key in keys {
        if let Some(value) = s.input.get(*key).filter(|v| !v.is_null()) {
            args.insert((*key).to_string(), value.clone());
        }
    }
    Value::Object(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::path::Path;

    fn stage_input<'a>(input: &'a Value, outputs: &'a BTreeMap<String, Value>) -> StageInput<'a> {
        StageInput {
            input,
            outputs,
            workspace: Path::new("/nonexistent/ws"),
        }
    }

    #[test]
    fn default_pipelines_have_expected_stages() {
        let pipelines = default_pipelines(&PipelineSettings::default());
        let shapes: Vec<(String, Vec<String>)> = pipelines
            .iter()
            .map(|p| (p.name.clone(), p.stages().map(|s| s.name.clone()).collect()))
            .collect();
        assert_eq!(
            shapes,
            vec![
                (
                    "containerize".to_string(),
                    vec!["analyze", "dockerfile", "build", "manifests", "deploy", "verify"]
                        .into_iter()
                        .map(String::from)
                        .collect()
                ),
                (
                    "build".to_string(),
                    vec!["analyze", "dockerfile", "build"].into_iter().map(String::from).collect()
                ),
                (
                    "deploy".to_string(),
                    vec!["manifests", "deploy", "verify"].into_iter().map(String::from).collect()
                ),
            ]
        );
    }

    #[test]
    fn build_and_deploy_are_repaired() {
        let settings = PipelineSettings {
            repair_attempts: 5,
            repair_backoff: BackoffPolicy::None,
        };
        let pipelines = default_pipelines(&settings);
        let containerize = &pipelines[0];
        let repaired: Vec<(&str, &str, usize)> = containerize
            .stages()
            .filter_map(|s| {
                s.repair
                    .as_ref()
                    .map(|r| (s.name.as_str(), r.artifact.as_str(), r.max_attempts))
            })
            .collect();
        assert_eq!(
            repaired,
            vec![("build", "Dockerfile", 5), ("deploy", "manifests/deployment.yaml", 5)]
        );
    }

    #[test]
    fn analyze_requires_repo_path() {
        let outputs = BTreeMap::new();
        let stage = analyze_stage();
        let missing = json!({"app_name": "x"});
        assert!(stage.check(&stage_input(&missing, &outputs)).is_err());

        let present = json!({"repo_path": "/src", "app_name": "x", "replicas": 2});
        let args = stage.build_args(&stage_input(&present, &outputs)).unwrap();
        assert_eq!(args, json!({"repo_path": "/src", "app_name": "x"}));
    }

    #[test]
    fn manifests_prefer_the_built_image() {
        let mut outputs = BTreeMap::new();
        outputs.insert("build".to_string(), json!({"image": "shop:latest"}));
        let input = json!({"image": "ignored:1", "namespace": "prod"});
        let args = manifests_stage()
            .build_args(&stage_input(&input, &outputs))
            .unwrap();
        assert_eq!(args["image"], "shop:latest");
        assert_eq!(args["namespace"], "prod");
    }

    #[test]
    fn deploy_pipeline_needs_an_app_name_or_analysis() {
        let pipelines = default_pipelines(&PipelineSettings::default());
        let deploy = &pipelines[2];
        let manifests = deploy.stages().next().unwrap();
        let outputs = BTreeMap::new();

        let empty = json!({});
        assert!(manifests.check(&stage_input(&empty, &outputs)).is_err());
        let named = json!({"app_name": "shop"});
        assert!(manifests.check(&stage_input(&named, &outputs)).is_ok());
    }
}
