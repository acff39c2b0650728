//! Decision schemas and tolerant parsing of decision objects.
//!
//! Decision services are asked for a fixed JSON shape, but replies are still
//! treated as untrusted: every field is optional here and the callers decide
//! how to coerce what is missing or malformed.

use serde_json::{json, Value};

use prodlens_core::services::DecisionSchema;
use prodlens_core::types::{Confidence, Route};

pub const ROUTE_DECISION: &str = "route_decision";
pub const CONTENT_DECISION: &str = "content_decision";
pub const ENTITY_EXTRACTION: &str = "entity_extraction";

/// Schema for the intent router.
pub fn route_schema(small_talk_enabled: bool) -> DecisionSchema {
    let labels: Vec<&str> = Route::ALL
        .iter()
        .filter(|r| small_talk_enabled || **r != Route::SmallTalk)
        .map(|r| r.as_str())
        .collect();
    DecisionSchema::new(
        ROUTE_DECISION,
        json!({
            "type": "object",
            "properties": {
                "route": {"type": "string", "enum": labels},
                "reasoning": {"type": "string"}
            },
            "required": ["route", "reasoning"],
            "additionalProperties": false
        }),
    )
}

/// Schema for the content-type classifier.
pub fn content_schema() -> DecisionSchema {
    DecisionSchema::new(
        CONTENT_DECISION,
        json!({
            "type": "object",
            "properties": {
                "content_type": {"type": "string", "enum": ["spec", "reviews"]},
                "reasoning": {"type": "string"}
            },
            "required": ["content_type", "reasoning"],
            "additionalProperties": false
        }),
    )
}

/// Schema for entity id extraction.
pub fn entity_schema() -> DecisionSchema {
    DecisionSchema::new(
        ENTITY_EXTRACTION,
        json!({
            "type": "object",
            "properties": {
                "product_id": {"type": ["integer", "null"]},
                "confidence": {"type": "string", "enum": ["high", "medium", "low"]},
                "reasoning": {"type": "string"}
            },
            "required": ["product_id", "confidence", "reasoning"],
            "additionalProperties": false
        }),
    )
}

/// A label-plus-reasoning decision as returned by the service.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelDecision {
    pub label: Option<String>,
    pub reasoning: Option<String>,
}

impl LabelDecision {
    pub fn parse(value: &Value, label_key: &str) -> Self {
        Self {
            label: text_field(value, label_key),
            reasoning: text_field(value, "reasoning"),
        }
    }
}

/// Outcome of asking for an entity id.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityExtraction {
    pub entity_id: Option<i64>,
    pub confidence: Option<Confidence>,
    pub reasoning: Option<String>,
    /// Set when `product_id` was present but not an integer.
    pub malformed: Option<String>,
}

impl EntityExtraction {
    pub fn parse(value: &Value) -> Self {
        let (entity_id, malformed) = match value.get("product_id") {
            None | Some(Value::Null) => (None, None),
            Some(raw) => match parse_entity_id(raw) {
                Some(id) => (Some(id), None),
                None => (None, Some(format!("product_id {} is not an integer", raw))),
            },
        };
        Self {
            entity_id,
            confidence: text_field(value, "confidence").and_then(|c| Confidence::from_label(&c)),
            reasoning: text_field(value, "reasoning"),
            malformed,
        }
    }

    /// Whether the id can be trusted at the given threshold.
    pub fn accepted_at(&self, threshold: Confidence) -> Option<i64> {
        match (self.entity_id, self.confidence) {
            (Some(id), Some(confidence)) if confidence >= threshold => Some(id),
            _ => None,
        }
    }
}

/// Integer ids, integral floats and numeric strings are accepted.
fn parse_entity_id(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn text_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}
