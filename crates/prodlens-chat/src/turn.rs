//! Per-turn records.

use serde::{Deserialize, Serialize};

use prodlens_core::types::{
    ContentFilter, EntityIdSource, RawResult, RetrievalResult, Route, SessionId, TabularResult,
};

use crate::error::TurnError;
use crate::graph::Node;

/// Working record of one turn. Created per call to `query`, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnRequest {
    pub raw_query: String,
    pub standalone_query: String,
    /// Set exactly once, by the route node.
    pub route: Option<Route>,
    pub reasoning: String,
    /// Only for semantic retrieval.
    pub content_filter: Option<ContentFilter>,
    pub content_reasoning: Option<String>,
    /// Only for opinion retrieval.
    pub resolved_entity_id: Option<i64>,
    pub entity_id_source: Option<EntityIdSource>,
    pub structured_result: Option<TabularResult>,
    pub retrieval_result: Option<RetrievalResult>,
    pub final_answer: String,
    pub errors: Vec<TurnError>,
    /// Nodes visited, in order.
    pub path: Vec<Node>,
}

impl TurnRequest {
    pub fn new(raw_query: impl Into<String>) -> Self {
        let raw_query = raw_query.into();
        Self {
            standalone_query: raw_query.clone(),
            raw_query,
            route: None,
            reasoning: String::new(),
            content_filter: None,
            content_reasoning: None,
            resolved_entity_id: None,
            entity_id_source: None,
            structured_result: None,
            retrieval_result: None,
            final_answer: String::new(),
            errors: Vec::new(),
            path: Vec::new(),
        }
    }

    pub fn record(&mut self, error: Option<TurnError>) {
        if let Some(error) = error {
            self.errors.push(error);
        }
    }

    /// All recorded errors on one line, if any.
    pub fn error_summary(&self) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        Some(
            self.errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn raw_result(&self) -> Option<RawResult> {
        match (&self.structured_result, &self.retrieval_result) {
            (Some(rows), _) => Some(RawResult::Structured(rows.clone())),
            (None, Some(passages)) => Some(RawResult::Retrieved(passages.clone())),
            (None, None) => None,
        }
    }
}

/// What `query` returns: the answer plus diagnostic metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub session_id: SessionId,
    pub final_answer: String,
    pub standalone_query: String,
    pub route: Route,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_filter: Option<ContentFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_entity_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id_source: Option<EntityIdSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_result: Option<RawResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub errors: Vec<TurnError>,
    #[serde(default)]
    pub path: Vec<Node>,
}

impl QueryResponse {
    pub fn from_turn(session_id: SessionId, route: Route, turn: TurnRequest) -> Self {
        Self {
            session_id,
            error: turn.error_summary(),
            raw_result: turn.raw_result(),
            final_answer: turn.final_answer,
            standalone_query: turn.standalone_query,
            route,
            reasoning: turn.reasoning,
            content_filter: turn.content_filter,
            content_reasoning: turn.content_reasoning,
            resolved_entity_id: turn.resolved_entity_id,
            entity_id_source: turn.entity_id_source,
            errors: turn.errors,
            path: turn.path,
        }
    }

    /// The statement that produced the structured result, if any.
    pub fn statement(&self) -> Option<&str> {
        match &self.raw_result {
            Some(RawResult::Structured(rows)) => Some(rows.statement.as_str()),
            _ => None,
        }
    }
}
