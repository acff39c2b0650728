//! Entity resolution for opinion lookups.
//!
//! Phase one asks the decision service to pick an id out of what the session
//! already knows (the last structured result, the last resolved id, recent
//! history). Only an id at or above the configured confidence is accepted.
//! Otherwise phase two runs a fresh structured lookup built from a template
//! and extracts the id from its rows. The resolver always ends with either
//! an integer id or [`EntityIdSource::Unresolved`].

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use prodlens_core::error::Result;
use prodlens_core::prompts::{
    context, PromptLibrary, ENTITY_EXTRACT_SYSTEM, ENTITY_EXTRACT_USER, ENTITY_LOOKUP,
};
use prodlens_core::services::DecisionGenerator;
use prodlens_core::types::{Confidence, EntityIdSource, HistoryEntry, TabularResult};

use crate::deadline::bounded;
use crate::decision::{entity_schema, EntityExtraction};
use crate::error::TurnError;
use crate::executor::StructuredQueryExecutor;
use crate::rewriter::format_history;

/// What the session already knows about previously discussed products.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolverContext<'a> {
    pub last_structured_result: Option<&'a TabularResult>,
    pub last_entity_id: Option<i64>,
    pub history: &'a [HistoryEntry],
}

impl ResolverContext<'_> {
    pub fn is_empty(&self) -> bool {
        self.last_structured_result.is_none() && self.last_entity_id.is_none()
    }

    fn to_text(&self) -> String {
        let mut sections = Vec::new();
        if let Some(result) = self.last_structured_result {
            sections.push(format!("Previous database results:\n{}", result.to_text()));
        }
        if let Some(id) = self.last_entity_id {
            sections.push(format!("Previously discussed product_id: {}", id));
        }
        if !self.history.is_empty() {
            sections.push(format!("Conversation:\n{}", format_history(self.history)));
        }
        sections.join("\n\n")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub entity_id: Option<i64>,
    pub source: EntityIdSource,
    /// Rows fetched by the fresh lookup, when phase two ran far enough.
    pub lookup_result: Option<TabularResult>,
    pub errors: Vec<TurnError>,
}

impl Resolution {
    fn resolved(
        id: i64,
        source: EntityIdSource,
        lookup_result: Option<TabularResult>,
        errors: Vec<TurnError>,
    ) -> Self {
        Self {
            entity_id: Some(id),
            source,
            lookup_result,
            errors,
        }
    }

    fn unresolved(lookup_result: Option<TabularResult>, errors: Vec<TurnError>) -> Self {
        Self {
            entity_id: None,
            source: EntityIdSource::Unresolved,
            lookup_result,
            errors,
        }
    }
}

pub struct EntityResolver {
    decisions: Arc<dyn DecisionGenerator>,
    structured: Arc<StructuredQueryExecutor>,
    prompts: Arc<PromptLibrary>,
    min_context_confidence: Confidence,
    timeout_secs: u64,
}

impl EntityResolver {
    pub fn new(
        decisions: Arc<dyn DecisionGenerator>,
        structured: Arc<StructuredQueryExecutor>,
        prompts: Arc<PromptLibrary>,
        min_context_confidence: Confidence,
        timeout_secs: u64,
    ) -> Self {
        Self {
            decisions,
            structured,
            prompts,
            min_context_confidence,
            timeout_secs,
        }
    }

    pub async fn resolve(&self, query: &str, ctx: ResolverContext<'_>) -> Resolution {
        let started = Instant::now();
        let mut errors = Vec::new();

        if !ctx.is_empty() {
            match self.extract(&ctx.to_text(), query).await {
                Ok(extraction) => {
                    if let Some(id) = extraction.accepted_at(self.min_context_confidence) {
                        info!(
                            entity_id = id,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Entity resolved from context"
                        );
                        return Resolution::resolved(id, EntityIdSource::FromContext, None, errors);
                    }
                    if let Some(problem) = extraction.malformed {
                        errors.push(TurnError::EntityResolution(problem));
                    }
                    debug!(
                        entity_id = ?extraction.entity_id,
                        confidence = ?extraction.confidence,
                        threshold = ?self.min_context_confidence,
                        "Context extraction not trusted, falling back to lookup"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Context extraction failed, falling back to lookup");
                    errors.push(TurnError::EntityResolution(format!(
                        "context extraction: {}",
                        e
                    )));
                }
            }
        }

        let resolution = self.fresh_lookup(query, errors).await;
        info!(
            entity_id = ?resolution.entity_id,
            source = ?resolution.source,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Entity resolution finished"
        );
        resolution
    }

    async fn fresh_lookup(&self, query: &str, mut errors: Vec<TurnError>) -> Resolution {
        let rendered = self.prompts.render(ENTITY_LOOKUP, context! { query => query });
        let lookup_question = match rendered {
            Ok(q) => q,
            Err(e) => {
                errors.push(TurnError::EntityResolution(e.to_string()));
                return Resolution::unresolved(None, errors);
            }
        };

        let rows = match self.structured.run(&lookup_question).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Entity lookup failed");
                errors.push(TurnError::EntityResolution(format!("lookup: {}", e)));
                return Resolution::unresolved(None, errors);
            }
        };
        if rows.is_empty() {
            errors.push(TurnError::EntityResolution("lookup returned no rows".to_string()));
            return Resolution::unresolved(Some(rows), errors);
        }

        let context_text = format!("Database results:\n{}", rows.to_text());
        match self.extract(&context_text, query).await {
            Ok(extraction) => match (extraction.entity_id, extraction.malformed) {
                (Some(id), _) => {
                    Resolution::resolved(id, EntityIdSource::FromFreshLookup, Some(rows), errors)
                }
                (None, Some(problem)) => {
                    errors.push(TurnError::EntityResolution(problem));
                    Resolution::unresolved(Some(rows), errors)
                }
                (None, None) => {
                    errors.push(TurnError::EntityResolution(
                        "no product id in lookup result".to_string(),
                    ));
                    Resolution::unresolved(Some(rows), errors)
                }
            },
            Err(e) => {
                errors.push(TurnError::EntityResolution(format!("lookup extraction: {}", e)));
                Resolution::unresolved(Some(rows), errors)
            }
        }
    }

    async fn extract(&self, context_text: &str, query: &str) -> Result<EntityExtraction> {
        let system = self.prompts.render(ENTITY_EXTRACT_SYSTEM, context! {})?;
        let user = self.prompts.render(
            ENTITY_EXTRACT_USER,
            context! { context => context_text, query => query },
        )?;
        let value = bounded(
            self.timeout_secs,
            self.decisions.decide(&system, &user, &entity_schema()),
        )
        .await?;
        Ok(EntityExtraction::parse(&value))
    }
}
