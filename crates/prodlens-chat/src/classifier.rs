//! Content-type classification for semantic retrieval.

use std::sync::Arc;

use tracing::{info, warn};

use prodlens_core::error::Result;
use prodlens_core::prompts::{context, PromptLibrary, CONTENT_ROUTER_SYSTEM};
use prodlens_core::services::DecisionGenerator;
use prodlens_core::types::ContentFilter;

use crate::deadline::bounded;
use crate::decision::{content_schema, LabelDecision};
use crate::error::TurnError;

/// Reference material needs no entity id, so it is where unusable
/// decisions land.
pub const DEFAULT_CONTENT_FILTER: ContentFilter = ContentFilter::ReferenceMaterial;

#[derive(Debug, Clone, PartialEq)]
pub struct ContentDecision {
    pub filter: ContentFilter,
    pub reasoning: String,
    pub error: Option<TurnError>,
}

pub struct ContentClassifier {
    decisions: Arc<dyn DecisionGenerator>,
    prompts: Arc<PromptLibrary>,
    timeout_secs: u64,
}

impl ContentClassifier {
    pub fn new(
        decisions: Arc<dyn DecisionGenerator>,
        prompts: Arc<PromptLibrary>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            decisions,
            prompts,
            timeout_secs,
        }
    }

    pub async fn classify(&self, query: &str) -> ContentDecision {
        let decision = match self.call(query).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, "Content classification failed");
                return ContentDecision {
                    filter: DEFAULT_CONTENT_FILTER,
                    reasoning: format!(
                        "classification unavailable; defaulted to {}",
                        DEFAULT_CONTENT_FILTER
                    ),
                    error: Some(TurnError::ContentClassification(e.to_string())),
                };
            }
        };

        let parsed = decision.label.as_deref().and_then(ContentFilter::from_label);
        let result = match parsed {
            Some(filter) => ContentDecision {
                filter,
                reasoning: decision
                    .reasoning
                    .unwrap_or_else(|| "no reasoning given".to_string()),
                error: None,
            },
            None => {
                let problem = match decision.label {
                    Some(label) => format!("unrecognized content type {:?}", label),
                    None => "decision had no content type".to_string(),
                };
                warn!(problem = %problem, "Coercing content type");
                ContentDecision {
                    filter: DEFAULT_CONTENT_FILTER,
                    reasoning: format!("{}; defaulted to {}", problem, DEFAULT_CONTENT_FILTER),
                    error: Some(TurnError::ContentClassification(problem)),
                }
            }
        };
        info!(content_filter = %result.filter, "Content classified");
        result
    }

    async fn call(&self, query: &str) -> Result<LabelDecision> {
        let system = self.prompts.render(CONTENT_ROUTER_SYSTEM, context! {})?;
        let value = bounded(
            self.timeout_secs,
            self.decisions.decide(&system, query, &content_schema()),
        )
        .await?;
        Ok(LabelDecision::parse(&value, "content_type"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubDecisions;
    use prodlens_core::error::ProdLensError;
    use serde_json::json;

    fn classifier(stub: StubDecisions) -> ContentClassifier {
        ContentClassifier::new(Arc::new(stub), Arc::new(PromptLibrary::builtin()), 5)
    }

    #[tokio::test]
    async fn test_reviews_maps_to_user_opinion() {
        let stub = StubDecisions::new(|_, _| {
            Ok(json!({"content_type": "reviews", "reasoning": "asks what buyers think"}))
        });
        let d = classifier(stub).classify("What do buyers say about it?").await;
        assert_eq!(d.filter, ContentFilter::UserOpinion);
        assert!(d.error.is_none());
    }

    #[tokio::test]
    async fn test_spec_maps_to_reference_material() {
        let stub = StubDecisions::new(|_, _| Ok(json!({"content_type": "spec", "reasoning": "r"})));
        let d = classifier(stub).classify("What is refresh rate?").await;
        assert_eq!(d.filter, ContentFilter::ReferenceMaterial);
    }

    #[tokio::test]
    async fn test_unknown_label_defaults_to_reference_material() {
        let stub = StubDecisions::new(|_, _| Ok(json!({"content_type": "news", "reasoning": "r"})));
        let d = classifier(stub).classify("q").await;
        assert_eq!(d.filter, ContentFilter::ReferenceMaterial);
        assert!(d.reasoning.contains("news"));
        assert!(d.error.is_some());
    }

    #[tokio::test]
    async fn test_service_error_defaults_to_reference_material() {
        let stub = StubDecisions::new(|_, _| Err(ProdLensError::Timeout(45)));
        let d = classifier(stub).classify("q").await;
        assert_eq!(d.filter, ContentFilter::ReferenceMaterial);
        assert!(!d.reasoning.is_empty());
        assert!(matches!(d.error, Some(TurnError::ContentClassification(_))));
    }
}
