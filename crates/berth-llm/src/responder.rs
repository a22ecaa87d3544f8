use async_trait::async_trait;
use berth_types::{CancellationToken, Result};

use crate::types::{ResponderReply, ResponderRequest};

/// An external AI that answers a diagnostic request with free text.
///
/// Implementations must return promptly with `Cancelled` once `cancel` fires.
#[async_trait]
pub trait Responder: Send + Sync {
    fn name(&self) -> &str;

    async fn respond(
        &self,
        request: &ResponderRequest,
        cancel: &CancellationToken,
    ) -> Result<ResponderReply>;
}
