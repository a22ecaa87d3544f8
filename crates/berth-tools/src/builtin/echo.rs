use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::tool::{parse_args, to_output, Tool, ToolContext, ToolDefinition};

#[derive(Debug, Serialize, Deserialize)]
struct EchoArgs {
    msg: String,
}

/// Returns its argument unchanged. Used to exercise the invocation path end to end.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "echo".to_string(),
            version: "1.0.0".to_string(),
            description: "Echo the message back to the caller.".to_string(),
            input_schema: json!({
                "type": "object",
                "required": ["msg"],
                "properties": {
                    "msg": { "type": "string", "description": "Message to echo" }
                },
                "additionalProperties": false
            }),
            output_schema: json!({
                "type": "object",
                "properties": { "msg": { "type": "string" } }
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        _ctx: &ToolContext,
    ) -> berth_types::Result<serde_json::Value> {
        let args: EchoArgs = parse_args("echo", arguments)?;
        to_output("echo", &args)
    }
}
