//! Interfaces to the external collaborators consumed by the conversation core.
//!
//! Each trait is object-safe and injected as `Arc<dyn Trait>`, so production
//! clients and test doubles are interchangeable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::types::{MetadataFilter, RetrievedPassage, TabularResult};

/// Shape a structured decision must conform to.
///
/// `schema` is a JSON Schema object; `name` identifies it to services that
/// require a named schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionSchema {
    pub name: String,
    pub schema: Value,
}

impl DecisionSchema {
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }
}

/// Free-text generation: rewriting, synthesis, small talk.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, system: &str, user: &str) -> Result<String>;
}

/// Generation constrained to a fixed JSON shape: routing and extraction.
#[async_trait]
pub trait DecisionGenerator: Send + Sync {
    async fn decide(&self, system: &str, user: &str, schema: &DecisionSchema) -> Result<Value>;
}

/// Natural language to executable statement.
#[async_trait]
pub trait QueryTranslator: Send + Sync {
    async fn translate(&self, question: &str, schema_description: &str) -> Result<String>;
}

/// Runs a statement against the relational store.
#[async_trait]
pub trait StatementExecutor: Send + Sync {
    async fn execute(&self, statement: &str) -> Result<TabularResult>;
}

/// Text to fixed-length vector.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Length of every vector returned by `embed`.
    fn dimensions(&self) -> usize;
}

/// Nearest-neighbour search with a conjunctive metadata filter.
#[async_trait]
pub trait PassageSearch: Send + Sync {
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<RetrievedPassage>>;
}
