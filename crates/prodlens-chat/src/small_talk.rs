use std::sync::Arc;

use tracing::{info, warn};

use prodlens_core::error::{ProdLensError, Result};
use prodlens_core::prompts::{context, PromptLibrary, SMALL_TALK_SYSTEM, SMALL_TALK_USER};
use prodlens_core::services::TextGenerator;
use prodlens_core::types::HistoryEntry;

use crate::deadline::bounded;
use crate::error::TurnError;
use crate::rewriter::format_history;

/// Reply used when the conversational service is unavailable.
pub const SMALL_TALK_FALLBACK: &str = "Happy to help! Ask me about products, prices and \
specifications, what a technical term means, or what buyers think of a specific model.";

#[derive(Debug, Clone, PartialEq)]
pub struct SmallTalkReply {
    pub text: String,
    pub error: Option<TurnError>,
}

/// Conversational replies with no data access.
pub struct SmallTalkResponder {
    generator: Arc<dyn TextGenerator>,
    prompts: Arc<PromptLibrary>,
    timeout_secs: u64,
}

impl SmallTalkResponder {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        prompts: Arc<PromptLibrary>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            generator,
            prompts,
            timeout_secs,
        }
    }

    pub async fn respond(&self, query: &str, history: &[HistoryEntry]) -> SmallTalkReply {
        match self.call(query, history).await {
            Ok(text) => {
                info!(chars = text.chars().count(), "Small talk reply generated");
                SmallTalkReply { text, error: None }
            }
            Err(e) => {
                warn!(error = %e, "Small talk failed, using fallback reply");
                SmallTalkReply {
                    text: SMALL_TALK_FALLBACK.to_string(),
                    error: Some(TurnError::SmallTalk(e.to_string())),
                }
            }
        }
    }

    async fn call(&self, query: &str, history: &[HistoryEntry]) -> Result<String> {
        let system = self.prompts.render(SMALL_TALK_SYSTEM, context! {})?;
        let user = self.prompts.render(
            SMALL_TALK_USER,
            context! { history => format_history(history), query => query },
        )?;
        let text = bounded(self.timeout_secs, self.generator.generate(&system, &user)).await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(ProdLensError::Llm("empty reply".to_string()));
        }
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubText;

    fn responder(stub: Arc<StubText>) -> SmallTalkResponder {
        SmallTalkResponder::new(stub, Arc::new(PromptLibrary::builtin()), 5)
    }

    #[tokio::test]
    async fn test_reply_is_trimmed() {
        let stub = Arc::new(StubText::replying(" You're welcome! \n"));
        let reply = responder(stub.clone()).respond("Thanks!", &[]).await;
        assert_eq!(reply.text, "You're welcome!");
        assert!(reply.error.is_none());
        assert!(stub.calls()[0].1.contains("User: Thanks!"));
    }

    #[tokio::test]
    async fn test_history_is_included() {
        let stub = Arc::new(StubText::replying("Hi again"));
        let history = vec![HistoryEntry::user("hello"), HistoryEntry::assistant("Hi!")];
        responder(stub.clone()).respond("hey", &history).await;
        assert!(stub.calls()[0].1.contains("Assistant: Hi!"));
    }

    #[tokio::test]
    async fn test_failure_uses_non_empty_fallback() {
        let stub = Arc::new(StubText::failing("HTTP 429: rate limited"));
        let reply = responder(stub).respond("hello", &[]).await;
        assert_eq!(reply.text, SMALL_TALK_FALLBACK);
        assert!(!reply.text.contains("429"));
        assert!(matches!(reply.error, Some(TurnError::SmallTalk(_))));
    }

    #[tokio::test]
    async fn test_blank_reply_uses_fallback() {
        let stub = Arc::new(StubText::replying(""));
        let reply = responder(stub).respond("hello", &[]).await;
        assert_eq!(reply.text, SMALL_TALK_FALLBACK);
        assert!(reply.error.is_some());
    }
}
