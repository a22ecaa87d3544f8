//! Argument validation against a tool's declared JSON Schema.

use berth_types::{BerthError, Result};
use jsonschema::Validator;

/// A tool's input schema, compiled once at registration.
pub struct CompiledSchema {
    validator: Validator,
}

impl std::fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledSchema").finish_non_exhaustive()
    }
}

impl CompiledSchema {
    /// Compile `schema` for the tool named `tool`. A `null` schema accepts anything.
    pub fn compile(tool: &str, schema: &serde_json::Value) -> Result<Self> {
        let schema = if schema.is_null() {
            serde_json::json!({})
        } else {
            schema.clone()
        };
        let validator = jsonschema::validator_for(&schema)
            .map_err(|e| BerthError::validation(tool, format!("invalid input schema: {e}")))?;
        Ok(Self { validator })
    }

    /// Validate `instance`, reporting every violation rather than the first.
    pub fn validate(&self, tool: &str, instance: &serde_json::Value) -> Result<()> {
        if self.validator.is_valid(instance) {
            return Ok(());
        }
        let messages: Vec<String> = self
            .validator
            .iter_errors(instance)
            .map(|err| err.to_string())
            .collect();
        Err(BerthError::validation(tool, messages.join("; ")))
    }
}
