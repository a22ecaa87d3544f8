//! A responder that replays canned replies, for tests and offline runs.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use berth_types::{BerthError, CancellationToken, Result};

use crate::responder::Responder;
use crate::types::{ResponderReply, ResponderRequest};

enum Script {
    Reply(String),
    Fail(String),
}

pub struct ScriptedResponder {
    script: Mutex<VecDeque<Script>>,
    /// Replayed forever once the script runs dry.
    fallback: Option<String>,
    requests: Mutex<Vec<ResponderRequest>>,
}

impl ScriptedResponder {
    pub fn new(replies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            script: Mutex::new(replies.into_iter().map(|r| Script::Reply(r.into())).collect()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always answer with `reply`.
    pub fn repeating(reply: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(reply.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Load replies from a JSON array of strings.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let replies: Vec<String> = serde_json::from_str(&raw)?;
        Ok(Self::new(replies))
    }

    /// Queue a transport failure as the next reply.
    pub fn then_fail(self, message: impl Into<String>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Script::Fail(message.into()));
        self
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<ResponderRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Responder for ScriptedResponder {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn respond(
        &self,
        request: &ResponderRequest,
        cancel: &CancellationToken,
    ) -> Result<ResponderReply> {
        if cancel.is_cancelled() {
            return Err(BerthError::Cancelled {
                operation: "scripted responder".into(),
            });
        }
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match (next, &self.fallback) {
            (Some(Script::Reply(text)), _) => Ok(ResponderReply::text(text)),
            (Some(Script::Fail(message)), _) => Err(BerthError::ResponderError {
                provider: "scripted".into(),
                status: 0,
                message,
                retryable: false,
            }),
            (None, Some(text)) => Ok(ResponderReply::text(text.clone())),
            (None, None) => Err(BerthError::ResponderError {
                provider: "scripted".into(),
                status: 0,
                message: "no scripted replies left".into(),
                retryable: false,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_in_order_then_runs_dry() {
        let r = ScriptedResponder::new(["one", "two"]);
        let cancel = CancellationToken::new();
        let req = ResponderRequest::new("sys", "fix it");

        assert_eq!(r.respond(&req, &cancel).await.unwrap().text, "one");
        assert_eq!(r.respond(&req, &cancel).await.unwrap().text, "two");
        assert!(r.respond(&req, &cancel).await.is_err());
        assert_eq!(r.requests().len(), 3);
    }

    #[tokio::test]
    async fn repeating_never_runs_dry() {
        let r = ScriptedResponder::repeating("same");
        let cancel = CancellationToken::new();
        let req = ResponderRequest::new("sys", "p");
        for _ in 0..5 {
            assert_eq!(r.respond(&req, &cancel).await.unwrap().text, "same");
        }
    }

    #[tokio::test]
    async fn queued_failure_is_transport_error() {
        let r = ScriptedResponder::new(Vec::<String>::new()).then_fail("boom");
        let err = r
            .respond(&ResponderRequest::new("s", "p"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BerthError::ResponderError { .. }));
    }

    #[test]
    fn loads_replies_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replies.json");
        std::fs::write(&path, r#"["<FIXED_CONTENT>x</FIXED_CONTENT>"]"#).unwrap();
        let r = ScriptedResponder::from_file(&path).unwrap();
        assert_eq!(r.script.lock().unwrap().len(), 1);
    }
}
