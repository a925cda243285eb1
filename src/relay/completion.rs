//! Fail-soft completion: whatever the provider does, the caller gets text back.

use std::future::Future;

use tracing::{info, warn};

use crate::deepseek;
use crate::relay::turn::PromptMessage;

/// Reply used when the provider cannot be reached or answers with an error.
pub const FALLBACK_REPLY: &str = "Sorry, I could not process your message.";

/// Something that turns a prompt into reply text without ever failing.
pub trait Completion: Send + Sync {
    fn complete(&self, messages: &[PromptMessage]) -> impl Future<Output = String> + Send;
}

impl Completion for deepseek::Client {
    async fn complete(&self, messages: &[PromptMessage]) -> String {
        info!("🤖 Sending {} message(s) to {}", messages.len(), self.model());
        match self.chat(messages).await {
            Ok(reply) => {
                info!("🤖 Reply: {} chars", reply.chars().count());
                reply
            }
            Err(e) => {
                warn!("Completion failed: {e}");
                FALLBACK_REPLY.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_provider_falls_back() {
        // Port 1 on loopback refuses connections
        let client = deepseek::Client::new(
            "key".to_string(),
            "http://127.0.0.1:1/v1/chat/completions".to_string(),
            deepseek::DEFAULT_MODEL.to_string(),
        );

        let reply = client.complete(&[PromptMessage::user("hello")]).await;
        assert_eq!(reply, FALLBACK_REPLY);
    }
}
