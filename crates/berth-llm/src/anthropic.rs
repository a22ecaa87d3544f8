use async_trait::async_trait;
use berth_types::{BerthError, CancellationToken, Result};
use serde_json::json;

use crate::responder::Responder;
use crate::types::{ResponderReply, ResponderRequest, Usage};

const PROVIDER: &str = "anthropic";

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
pub const DEFAULT_MAX_TOKENS: u32 = 8192;

// ---------------------------------------------------------------------------
// AnthropicResponder
// ---------------------------------------------------------------------------

/// Responder backed by the Anthropic Messages API.
#[derive(Debug)]
pub struct AnthropicResponder {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicResponder {
    pub fn new(api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: String) -> Self {
        self.model = model;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Read the API key from `var` (normally `ANTHROPIC_API_KEY`).
    pub fn from_env_var(var: &str) -> Result<Self> {
        match std::env::var(var) {
            Ok(key) if !key.trim().is_empty() => Ok(Self::new(key)),
            _ => Err(BerthError::AuthError {
                provider: PROVIDER.into(),
            }),
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_env_var("ANTHROPIC_API_KEY")
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send(&self, request: &ResponderRequest) -> Result<ResponderReply> {
        let body = build_request_body(request, &self.model, self.max_tokens);

        let resp = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(0, e.to_string()))?;

        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| transport_error(0, e.to_string()))?;

        if !(200..300).contains(&status) {
            return Err(status_error(status, &text));
        }

        let json: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| BerthError::ResponderError {
                provider: PROVIDER.into(),
                status,
                message: format!("unreadable reply body: {e}"),
                retryable: false,
            })?;

        Ok(parse_response(&json))
    }
}

// ---------------------------------------------------------------------------
// Request / response translation
// ---------------------------------------------------------------------------

fn build_request_body(request: &ResponderRequest, model: &str, max_tokens: u32) -> serde_json::Value {
    let mut body = json!({
        "model": model,
        "max_tokens": request.max_tokens.unwrap_or(max_tokens),
        "messages": [{
            "role": "user",
            "content": [{ "type": "text", "text": request.prompt }]
        }],
    });

    if !request.system.is_empty() {
        body["system"] = json!([{
            "type": "text",
            "text": request.system,
            "cache_control": { "type": "ephemeral" }
        }]);
    }

    body
}

fn parse_response(body: &serde_json::Value) -> ResponderReply {
    let text = body["content"]
        .as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b["type"] == "text")
                .filter_map(|b| b["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    let usage = &body["usage"];
    ResponderReply {
        text,
        model: body["model"].as_str().unwrap_or("").to_string(),
        usage: Usage {
            input_tokens: usage["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: usage["output_tokens"].as_u64().unwrap_or(0),
        },
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn transport_error(status: u16, message: String) -> BerthError {
    BerthError::ResponderError {
        provider: PROVIDER.into(),
        status,
        message,
        retryable: true,
    }
}

/// 401/403 are credential problems; throttling and server-side failures are
/// worth another attempt; any other status is final.
fn status_error(status: u16, body: &str) -> BerthError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.pointer("/error/message")?.as_str().map(str::to_owned))
        .unwrap_or_else(|| body.trim().to_owned());
    match status {
        401 | 403 => BerthError::AuthError {
            provider: PROVIDER.into(),
        },
        408 | 429 | 500..=599 => transport_error(status, message),
        _ => BerthError::ResponderError {
            provider: PROVIDER.into(),
            status,
            message,
            retryable: false,
        },
    }
}

// ---------------------------------------------------------------------------
// Responder implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Responder for AnthropicResponder {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn respond(
        &self,
        request: &ResponderRequest,
        cancel: &CancellationToken,
    ) -> Result<ResponderReply> {
        tracing::debug!(model = %self.model, prompt_bytes = request.prompt.len(), "Sending repair request");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BerthError::Cancelled {
                operation: "anthropic request".into(),
            }),
            reply = self.send(request) => {
                if let Ok(r) = &reply {
                    tracing::debug!(
                        input_tokens = r.usage.input_tokens,
                        output_tokens = r.usage.output_tokens,
                        "Received repair reply"
                    );
                }
                reply
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
