//! AI responder interface for Berth repair loops.
//!
//! Provides the `Responder` trait, the request/reply types exchanged with it,
//! `AnthropicResponder` (Messages API over reqwest), and `ScriptedResponder`
//! for tests and offline runs.

mod anthropic;
mod responder;
mod scripted;
mod types;

pub use anthropic::{AnthropicResponder, DEFAULT_BASE_URL, DEFAULT_MAX_TOKENS, DEFAULT_MODEL};
pub use responder::Responder;
pub use scripted::ScriptedResponder;
pub use types::*;
