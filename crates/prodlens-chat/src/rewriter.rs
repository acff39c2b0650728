//! Query rewriting: collapse recent history plus the latest message into one
//! standalone question.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use prodlens_core::error::{ProdLensError, Result};
use prodlens_core::prompts::{context, PromptLibrary, REWRITE_SYSTEM, REWRITE_USER};
use prodlens_core::services::TextGenerator;
use prodlens_core::types::HistoryEntry;

use crate::deadline::bounded;
use crate::error::TurnError;

/// Result of the rewrite step. `standalone_query` is always usable.
#[derive(Debug, Clone, PartialEq)]
pub struct Rewrite {
    pub standalone_query: String,
    pub error: Option<TurnError>,
}

pub struct QueryRewriter {
    generator: Arc<dyn TextGenerator>,
    prompts: Arc<PromptLibrary>,
    timeout_secs: u64,
}

impl QueryRewriter {
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

    /// Rewrite `raw_query` against `history`.
    ///
    /// Empty history short-circuits without calling the generator. Any
    /// failure falls back to `raw_query`.
    pub async fn rewrite(&self, raw_query: &str, history: &[HistoryEntry]) -> Rewrite {
        if history.is_empty() {
            return Rewrite {
                standalone_query: raw_query.to_string(),
                error: None,
            };
        }

        let started = Instant::now();
        match self.call(raw_query, history).await {
            Ok(standalone) => {
                info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Query rewritten"
                );
                debug!(raw = %raw_query, standalone = %standalone, "Rewrite");
                Rewrite {
                    standalone_query: standalone,
                    error: None,
                }
            }
            Err(e) => {
                warn!(error = %e, "Rewrite failed, using raw query");
                Rewrite {
                    standalone_query: raw_query.to_string(),
                    error: Some(TurnError::Rewrite(e.to_string())),
                }
            }
        }
    }

    async fn call(&self, raw_query: &str, history: &[HistoryEntry]) -> Result<String> {
        let system = self.prompts.render(REWRITE_SYSTEM, context! {})?;
        let user = self.prompts.render(
            REWRITE_USER,
            context! { history => format_history(history), query => raw_query },
        )?;
        let text = bounded(self.timeout_secs, self.generator.generate(&system, &user)).await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(ProdLensError::Llm("empty rewrite".to_string()));
        }
        Ok(text.to_string())
    }
}

/// One `Speaker: text` line per entry.
pub(crate) fn format_history(history: &[HistoryEntry]) -> String {
    history
        .iter()
        .map(|entry| format!("{}: {}", entry.speaker.label(), entry.text))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubText;

    fn history() -> Vec<HistoryEntry> {
        vec![
            HistoryEntry::user("Show me 27 inch monitors"),
            HistoryEntry::assistant("1. LG 27GN850-B ($399)"),
        ]
    }

    fn rewriter(stub: Arc<StubText>) -> QueryRewriter {
        QueryRewriter::new(stub, Arc::new(PromptLibrary::builtin()), 5)
    }

    #[tokio::test]
    async fn test_empty_history_short_circuits() {
        let stub = Arc::new(StubText::replying("should not be used"));
        let result = rewriter(stub.clone()).rewrite("What is DPI?", &[]).await;
        assert_eq!(result.standalone_query, "What is DPI?");
        assert!(result.error.is_none());
        assert_eq!(stub.call_count(), 0);
    }

    #[tokio::test]
    async fn test_rewrite_uses_history_and_trims() {
        let stub = Arc::new(StubText::replying("  What do buyers say about the LG 27GN850-B?\n"));
        let result = rewriter(stub.clone())
            .rewrite("what do buyers say about it?", &history())
            .await;
        assert_eq!(
            result.standalone_query,
            "What do buyers say about the LG 27GN850-B?"
        );
        assert!(result.error.is_none());

        let calls = stub.calls();
        assert!(calls[0].1.contains("User: Show me 27 inch monitors"));
        assert!(calls[0].1.contains("Assistant: 1. LG 27GN850-B ($399)"));
        assert!(calls[0].1.contains("Current Query: what do buyers say about it?"));
    }

    #[tokio::test]
    async fn test_failure_falls_back_to_raw_query() {
        let stub = Arc::new(StubText::failing("service unavailable"));
        let result = rewriter(stub).rewrite("and the cheaper one?", &history()).await;
        assert_eq!(result.standalone_query, "and the cheaper one?");
        assert!(matches!(result.error, Some(TurnError::Rewrite(_))));
    }

    #[tokio::test]
    async fn test_blank_reply_falls_back_to_raw_query() {
        let stub = Arc::new(StubText::replying("   "));
        let result = rewriter(stub).rewrite("and that one?", &history()).await;
        assert_eq!(result.standalone_query, "and that one?");
        assert!(result.error.is_some());
    }

    #[test]
    fn test_format_history() {
        assert_eq!(
            format_history(&history()),
            "User: Show me 27 inch monitors\nAssistant: 1. LG 27GN850-B ($399)"
        );
        assert_eq!(format_history(&[]), "");
    }
}
