//! Registry that holds named tools, validates their arguments and counts executions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use berth_types::{BerthError, Result};

use crate::metrics::ToolMetrics;
use crate::schema::CompiledSchema;
use crate::tool::{Tool, ToolContext, ToolDefinition, ToolSummary};

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    definition: ToolDefinition,
    schema: CompiledSchema,
    metrics: Mutex<ToolMetrics>,
}

/// Registry of named tools.
///
/// Registration is append-only: a name can be claimed once for the lifetime
/// of the registry. The map sits behind a reader/writer lock that is never
/// held across an `.await`, so concurrent invocations only contend for the
/// instant it takes to clone an `Arc`.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<RegisteredTool>>>,
}

/// Snapshot of the registered tools, sorted by name.
///
/// Iterating does not consume the listing, so it can be walked any number of times.
#[derive(Debug, Clone, Default)]
pub struct ToolListing {
    items: Vec<ToolSummary>,
}

impl ToolListing {
    pub fn iter(&self) -> std::slice::Iter<'_, ToolSummary> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<'a> IntoIterator for &'a ToolListing {
    type Item = &'a ToolSummary;
    type IntoIter = std::slice::Iter<'a, ToolSummary>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl IntoIterator for ToolListing {
    type Item = ToolSummary;
    type IntoIter = std::vec::IntoIter<ToolSummary>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tool. Fails with `AlreadyExists` if the name is taken and
    /// with `ValidationFailed` if the declared input schema does not compile.
    pub fn register(&self, tool: impl Tool + 'static) -> Result<()> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&self, tool: Arc<dyn Tool>) -> Result<()> {
        let definition = tool.definition();
        let schema = CompiledSchema::compile(&definition.name, &definition.input_schema)?;
        let name = definition.name.clone();

        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        if tools.contains_key(&name) {
            return Err(BerthError::AlreadyExists {
                resource: "tool".into(),
                id: name,
            });
        }
        tracing::debug!(tool = %name, version = %definition.version, "Registered tool");
        tools.insert(
            name,
            Arc::new(RegisteredTool {
                tool,
                definition,
                schema,
                metrics: Mutex::new(ToolMetrics::default()),
            }),
        );
        Ok(())
    }

    fn entry(&self, name: &str) -> Result<Arc<RegisteredTool>> {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| BerthError::not_found("tool", name))
    }

    /// Remove a tool. Calls already in flight keep their handle to it.
    pub fn unregister(&self, name: &str) -> Result<Arc<dyn Tool>> {
        let removed = self
            .tools
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .ok_or_else(|| BerthError::not_found("tool", name))?;
        tracing::debug!(tool = %name, "Unregistered tool");
        Ok(removed.tool.clone())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Tool>> {
        self.entry(name).map(|e| e.tool.clone())
    }

    pub fn definition(&self, name: &str) -> Result<ToolDefinition> {
        self.entry(name).map(|e| e.definition.clone())
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    pub fn list(&self) -> ToolListing {
        let mut items: Vec<ToolSummary> = self
            .tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|e| ToolSummary::from(&e.definition))
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        ToolListing { items }
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|e| e.definition.clone())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate `arguments` against the tool's schema and run it under the
    /// context's cancellation token.
    ///
    /// Schema violations are returned as `ValidationFailed` without running
    /// the tool and are not counted as executions.
    pub async fn execute(
        &self,
        name: &str,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value> {
        let entry = self.entry(name)?;
        entry.schema.validate(name, &arguments)?;

        if ctx.cancel.is_cancelled() {
            return Err(BerthError::Cancelled {
                operation: name.to_string(),
            });
        }

        tracing::debug!(tool = %name, session_id = ?ctx.session_id, "Executing tool");
        let start = Instant::now();
        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(BerthError::Cancelled {
                operation: name.to_string(),
            }),
            r = entry.tool.execute(arguments, ctx) => r,
        };
        let elapsed = start.elapsed();

        entry
            .metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(elapsed, result.is_ok());

        match &result {
            Ok(_) => tracing::debug!(
                tool = %name,
                duration_ms = elapsed.as_millis() as u64,
                "Tool succeeded"
            ),
            Err(e) => tracing::warn!(
                tool = %name,
                duration_ms = elapsed.as_millis() as u64,
                error = %e,
                "Tool failed"
            ),
        }

        result.map_err(|e| wrap_tool_error(name, e))
    }

    pub fn tool_metrics(&self, name: &str) -> Result<ToolMetrics> {
        let entry = self.entry(name)?;
        let metrics = entry.metrics.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Ok(metrics)
    }

    /// Metrics for every registered tool, keyed by name.
    pub fn metrics(&self) -> HashMap<String, ToolMetrics> {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, e)| {
                let m = e.metrics.lock().unwrap_or_else(|p| p.into_inner()).clone();
                (name.clone(), m)
            })
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Kinded errors pass through; anything that only describes a low-level
/// cause (IO, JSON, free text) is attributed to the tool.
fn wrap_tool_error(tool: &str, err: BerthError) -> BerthError {
    match err {
        BerthError::Io(e) => BerthError::execution(tool, e.to_string()),
        BerthError::Other(message) => BerthError::execution(tool, message),
        BerthError::Storage(message) => BerthError::execution(tool, message),
        other => other,
    }
}
