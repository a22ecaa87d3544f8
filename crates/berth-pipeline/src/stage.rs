//! Stage and pipeline definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use berth_types::{BerthError, Result};
use serde_json::Value;

use crate::repair::RepairConfig;
use crate::retry::RetryPolicy;

/// What a stage may look at when deriving its arguments or validating.
#[derive(Debug, Clone, Copy)]
pub struct StageInput<'a> {
    /// The request's free-form input.
    pub input: &'a Value,
    /// Outputs of the stages that already completed in this run, by stage name.
    pub outputs: &'a BTreeMap<String, Value>,
    pub workspace: &'a Path,
}

impl<'a> StageInput<'a> {
    /// A string field from the request input.
    pub fn input_str(&self, key: &str) -> Option<&'a str> {
        self.input.get(key).and_then(Value::as_str)
    }

    /// A field from an earlier stage's output.
    pub fn output(&self, stage: &str, key: &str) -> Option<&'a Value> {
        self.outputs.get(stage).and_then(|v| v.get(key))
    }
}

pub type ArgsBuilder = Arc<dyn Fn(&StageInput<'_>) -> Result<Value> + Send + Sync>;
pub type Validator = Arc<dyn Fn(&StageInput<'_>) -> Result<()> + Send + Sync>;

/// One step of a pipeline: a tool plus how to call it and how to recover.
#[derive(Clone)]
pub struct Stage {
    pub name: String,
    pub tool: String,
    pub args: ArgsBuilder,
    pub repair: Option<RepairConfig>,
    pub retry: Option<RetryPolicy>,
    pub timeout: Option<Duration>,
    pub validate: Option<Validator>,
}

impl Stage {
    /// A stage whose arguments are the request input, unchanged.
    pub fn new(name: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tool: tool.into(),
            args: Arc::new(pass_through),
            repair: None,
            retry: None,
            timeout: None,
            validate: None,
        }
    }

    pub fn with_args(
        mut self,
        builder: impl Fn(&StageInput<'_>) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.args = Arc::new(builder);
        self
    }

    pub fn with_repair(mut self, repair: RepairConfig) -> Self {
        self.repair = Some(repair);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_validation(
        mut self,
        predicate: impl Fn(&StageInput<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.validate = Some(Arc::new(predicate));
        self
    }

    pub(crate) fn build_args(&self, input: &StageInput<'_>) -> Result<Value> {
        (self.args)(input).map_err(|e| match e {
            BerthError::ValidationFailed { .. } => e,
            other => BerthError::validation(&self.name, other.to_string()),
        })
    }

    pub(crate) fn check(&self, input: &StageInput<'_>) -> Result<()> {
        match &self.validate {
            Some(predicate) => predicate(input).map_err(|e| match e {
                BerthError::ValidationFailed { .. } => e,
                other => BerthError::validation(&self.name, other.to_string()),
            }),
            None => Ok(()),
        }
    }
}

fn pass_through(input: &StageInput<'_>) -> Result<Value> {
    Ok(input.input.clone())
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("tool", &self.tool)
            .field("repair", &self.repair)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// A single stage, or a group of independent stages run concurrently.
#[derive(Debug, Clone)]
pub enum PipelineStep {
    Stage(Stage),
    Group(Vec<Stage>),
}

/// A named, ordered list of steps.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    pub name: String,
    pub description: String,
    pub steps: Vec<PipelineStep>,
    /// Default timeout for stages that lack their own.
    pub timeout: Option<Duration>,
    /// Default retry policy for stages that lack their own.
    pub retry: Option<RetryPolicy>,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
            timeout: None,
            retry: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.steps.push(PipelineStep::Stage(stage));
        self
    }

    /// Append stages that do not depend on one another. They see only the
    /// outputs of steps before the group.
    pub fn group(mut self, stages: Vec<Stage>) -> Self {
        if !stages.is_empty() {
            self.steps.push(PipelineStep::Group(stages));
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Every stage in declared order, groups flattened.
    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.steps.iter().flat_map(|step| match step {
            PipelineStep::Stage(stage) => std::slice::from_ref(stage).iter(),
            PipelineStep::Group(stages) => stages.iter(),
        })
    }

    pub fn stage_count(&self) -> usize {
        self.stages().count()
    }

    /// Stage names must be unique within a pipeline.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for stage in self.stages() {
            if !seen.insert(stage.name.as_str()) {
                return Err(BerthError::validation(
                    &self.name,
                    format!("duplicate stage name '{}'", stage.name),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_types::ErrorKind;
    use serde_json::json;

    fn input<'a>(value: &'a Value, outputs: &'a BTreeMap<String, Value>) -> StageInput<'a> {
        StageInput {
            input: value,
            outputs,
            workspace: Path::new("/tmp/ws"),
        }
    }

    #[test]
    fn default_args_pass_input_through() {
        let stage = Stage::new("echo", "echo");
        let value = json!({"msg": "hi"});
        let outputs = BTreeMap::new();
        assert_eq!(stage.build_args(&input(&value, &outputs)).unwrap(), value);
    }

    #[test]
    fn args_builder_reads_previous_outputs() {
        let stage = Stage::new("manifests", "generate_manifests").with_args(|s| {
            Ok(json!({"image": s.output("build", "image").cloned().unwrap_or(Value::Null)}))
        });
        let value = json!({});
        let mut outputs = BTreeMap::new();
        outputs.insert("build".to_string(), json!({"image": "app:latest"}));
        let args = stage.build_args(&input(&value, &outputs)).unwrap();
        assert_eq!(args["image"], "app:latest");
    }

    #[test]
    fn builder_errors_become_validation_failures() {
        let stage = Stage::new("x", "echo").with_args(|_| Err(BerthError::Other("no".into())));
        let value = json!({});
        let outputs = BTreeMap::new();
        let err = stage.build_args(&input(&value, &outputs)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }

    #[test]
    fn validation_predicate_runs() {
        let stage = Stage::new("analyze", "analyze_repository").with_validation(|s| {
            s.input_str("repo_path")
                .map(|_| ())
                .ok_or_else(|| BerthError::validation("analyze", "repo_path is required"))
        });
        let outputs = BTreeMap::new();
        assert!(stage.check(&input(&json!({"repo_path": "."}), &outputs)).is_ok());
        assert_eq!(
            stage.check(&input(&json!({}), &outputs)).unwrap_err().kind(),
            ErrorKind::ValidationFailed
        );
    }

    #[test]
    fn stages_flatten_groups_in_order() {
        let def = PipelineDefinition::new("p")
            .stage(Stage::new("a", "echo"))
            .group(vec![Stage::new("b", "echo"), Stage::new("c", "echo")])
            .group(vec![])
            .stage(Stage::new("d", "echo"));
        let names: Vec<&str> = def.stages().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
        assert_eq!(def.steps.len(), 3);
        assert!(def.validate().is_ok());
    }

    #[test]
    fn duplicate_stage_names_are_rejected() {
        let def = PipelineDefinition::new("p")
            .stage(Stage::new("a", "echo"))
            .group(vec![Stage::new("a", "echo")]);
        assert_eq!(def.validate().unwrap_err().kind(), ErrorKind::ValidationFailed);
    }
}
