//! Thin delegation to the structured-query and semantic-retrieval
//! collaborators.
//!
//! Neither executor retries or degrades; failures are returned to the caller,
//! which owns the fallback.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use prodlens_core::config::RetrievalConfig;
use prodlens_core::error::Result;
use prodlens_core::services::{EmbeddingService, PassageSearch, QueryTranslator, StatementExecutor};
use prodlens_core::types::{MetadataFilter, RetrievalResult, TabularResult};

use crate::deadline::bounded;

/// Translate a question into a statement and run it.
pub struct StructuredQueryExecutor {
    translator: Arc<dyn QueryTranslator>,
    statements: Arc<dyn StatementExecutor>,
    schema_description: String,
    timeout_secs: u64,
}

impl StructuredQueryExecutor {
    pub fn new(
        translator: Arc<dyn QueryTranslator>,
        statements: Arc<dyn StatementExecutor>,
        schema_description: impl Into<String>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            translator,
            statements,
            schema_description: schema_description.into(),
            timeout_secs,
        }
    }

    pub async fn run(&self, question: &str) -> Result<TabularResult> {
        let started = Instant::now();
        let statement = bounded(
            self.timeout_secs,
            self.translator.translate(question, &self.schema_description),
        )
        .await?;
        debug!(statement = %statement, "Statement translated");

        let mut result = bounded(self.timeout_secs, self.statements.execute(&statement)).await?;
        if result.statement.is_empty() {
            result.statement = statement;
        }
        info!(
            rows = result.rows.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Structured lookup complete"
        );
        Ok(result)
    }
}

/// What a retrieval is allowed to see.
///
/// Opinion retrieval cannot be expressed without an entity id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalScope {
    Reference,
    Opinions { entity_id: i64 },
}

/// Embed a query and search passages under a metadata filter.
pub struct SemanticRetrievalExecutor {
    embeddings: Arc<dyn EmbeddingService>,
    search: Arc<dyn PassageSearch>,
    config: RetrievalConfig,
    timeout_secs: u64,
}

impl SemanticRetrievalExecutor {
    pub fn new(
        embeddings: Arc<dyn EmbeddingService>,
        search: Arc<dyn PassageSearch>,
        config: RetrievalConfig,
        timeout_secs: u64,
    ) -> Self {
        Self {
            embeddings,
            search,
            config,
            timeout_secs,
        }
    }

    /// Category equality, plus entity equality for opinions.
    pub fn filter_for(&self, scope: RetrievalScope) -> MetadataFilter {
        match scope {
            RetrievalScope::Reference => MetadataFilter::new().eq(
                self.config.category_key.as_str(),
                self.config.reference_category.as_str(),
            ),
            RetrievalScope::Opinions { entity_id } => MetadataFilter::new()
                .eq(
                    self.config.category_key.as_str(),
                    self.config.opinion_category.as_str(),
                )
                .eq(self.config.entity_key.as_str(), entity_id),
        }
    }

    pub async fn retrieve(&self, query: &str, scope: RetrievalScope) -> Result<RetrievalResult> {
        let started = Instant::now();
        let filter = self.filter_for(scope);
        let embedding = bounded(self.timeout_secs, self.embeddings.embed(query)).await?;
        let passages = bounded(
            self.timeout_secs,
            self.search.search(&embedding, self.config.top_k, &filter),
        )
        .await?;
        info!(
            passages = passages.len(),
            scope = ?scope,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Semantic retrieval complete"
        );
        Ok(RetrievalResult { passages })
    }
}
