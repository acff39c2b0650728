use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Maximum accepted length of a caller-supplied session id.
const MAX_SESSION_ID_LEN: usize = 128;

// =============================================================================
// Identifiers
// =============================================================================

/// Opaque identifier of one conversation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Allocate a fresh random session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accept a caller-supplied id.
    ///
    /// Returns `None` for empty ids, ids longer than 128 characters, or ids
    /// containing whitespace or control characters.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty()
            || raw.len() > MAX_SESSION_ID_LEN
            || raw.chars().any(|c| c.is_whitespace() || c.is_control())
        {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for SessionId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Who produced a history entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

impl Speaker {
    /// Label used when history is formatted into a prompt.
    pub fn label(self) -> &'static str {
        match self {
            Speaker::User => "User",
            Speaker::Assistant => "Assistant",
        }
    }
}

/// Execution path chosen for a turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Translate the question into a statement against the product catalog.
    StructuredLookup,
    /// Nearest-neighbour search over embedded passages.
    SemanticRetrieval,
    /// Conversational reply without any data access.
    SmallTalk,
}

impl Route {
    pub const ALL: [Route; 3] = [
        Route::StructuredLookup,
        Route::SemanticRetrieval,
        Route::SmallTalk,
    ];

    /// Map a decision label onto a route.
    ///
    /// Accepts the canonical snake_case names plus the labels used by older
    /// prompt versions (`text2sql`, `rag`, `chat`). Anything else is `None`.
    pub fn from_label(label: &str) -> Option<Self> {
        match normalize_label(label).as_str() {
            "structured_lookup" | "structured" | "text2sql" | "sql" => {
                Some(Route::StructuredLookup)
            }
            "semantic_retrieval" | "semantic" | "retrieval" | "rag" => {
                Some(Route::SemanticRetrieval)
            }
            "small_talk" | "smalltalk" | "chat" | "conversation" => Some(Route::SmallTalk),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Route::StructuredLookup => "structured_lookup",
            Route::SemanticRetrieval => "semantic_retrieval",
            Route::SmallTalk => "small_talk",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-classification of semantic retrieval requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentFilter {
    /// Definitions and explanations of specifications.
    ReferenceMaterial,
    /// Buyer reviews of one specific product.
    UserOpinion,
}

impl ContentFilter {
    pub fn from_label(label: &str) -> Option<Self> {
        match normalize_label(label).as_str() {
            "reference_material" | "reference" | "spec" | "specs" => {
                Some(ContentFilter::ReferenceMaterial)
            }
            "user_opinion" | "opinion" | "reviews" | "review" => Some(ContentFilter::UserOpinion),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContentFilter::ReferenceMaterial => "reference_material",
            ContentFilter::UserOpinion => "user_opinion",
        }
    }
}

impl fmt::Display for ContentFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Confidence label attached to an entity extraction.
///
/// Ordered `Low < Medium < High`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn from_label(label: &str) -> Option<Self> {
        match normalize_label(label).as_str() {
            "high" => Some(Confidence::High),
            "medium" | "med" => Some(Confidence::Medium),
            "low" => Some(Confidence::Low),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }
}

/// Where a resolved entity id came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityIdSource {
    FromContext,
    FromFreshLookup,
    Unresolved,
}

fn normalize_label(label: &str) -> String {
    label
        .trim()
        .to_lowercase()
        .replace(['-', ' '], "_")
}

// =============================================================================
// Conversation state
// =============================================================================

/// One utterance in a conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::User,
            text: text.into(),
            at: Utc::now(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Assistant,
            text: text.into(),
            at: Utc::now(),
        }
    }
}

/// Everything persisted for one session between turns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub session_id: SessionId,
    /// Append-only during a session; cleared only by a new conversation.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Rows of the most recent successful structured lookup.
    #[serde(default)]
    pub last_structured_result: Option<TabularResult>,
    /// Entity id resolved by the most recent opinion lookup.
    #[serde(default)]
    pub last_entity_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    /// Empty state for a new session.
    pub fn new(session_id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            history: Vec::new(),
            last_structured_result: None,
            last_entity_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The last `window` entries of history (fewer if history is shorter).
    pub fn recent(&self, window: usize) -> &[HistoryEntry] {
        let start = self.history.len().saturating_sub(window);
        &self.history[start..]
    }

    /// Append one user/assistant exchange.
    ///
    /// When `cap` is non-zero and the history grows past it, the oldest
    /// entries are dropped in whole exchanges so the history always starts
    /// with a user entry.
    pub fn append_exchange(&mut self, user: HistoryEntry, assistant: HistoryEntry, cap: usize) {
        self.history.push(user);
        self.history.push(assistant);
        self.updated_at = Utc::now();

        if cap > 0 && self.history.len() > cap {
            let mut excess = self.history.len() - cap;
            if excess % 2 == 1 {
                excess += 1;
            }
            let excess = excess.min(self.history.len());
            self.history.drain(..excess);
        }
    }
}

// =============================================================================
// Collaborator results
// =============================================================================

/// Raw rows returned by the structured-query collaborator.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TabularResult {
    /// The statement that produced the rows.
    pub statement: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl TabularResult {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Plain-text table: a header line, then one line per row.
    pub fn to_text(&self) -> String {
        if self.rows.is_empty() {
            return "(no rows)".to_string();
        }
        let mut lines = Vec::with_capacity(self.rows.len() + 1);
        if !self.columns.is_empty() {
            lines.push(self.columns.join(" | "));
        }
        for row in &self.rows {
            let cells: Vec<String> = row.iter().map(render_cell).collect();
            lines.push(cells.join(" | "));
        }
        lines.join("\n")
    }
}

fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One passage returned by the semantic retrieval collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetrievedPassage {
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub score: f32,
}

/// Passages returned for one retrieval call, best first.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub passages: Vec<RetrievedPassage>,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    /// Numbered passages, one per paragraph.
    pub fn to_text(&self) -> String {
        self.passages
            .iter()
            .enumerate()
            .map(|(i, p)| format!("[{}] {}", i + 1, p.content.trim()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Raw collaborator output for a turn, by route.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawResult {
    Structured(TabularResult),
    Retrieved(RetrievalResult),
}

// =============================================================================
// Metadata filter
// =============================================================================

/// A single `key == value` predicate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub key: String,
    pub value: Value,
}

/// Conjunction of equality predicates over passage metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter {
    predicates: Vec<Predicate>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `key == value` predicate.
    pub fn eq(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.predicates.push(Predicate {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// True when every predicate holds for `metadata`. Missing keys never match.
    pub fn matches(&self, metadata: &Map<String, Value>) -> bool {
        self.predicates
            .iter()
            .all(|p| metadata.get(&p.key).is_some_and(|v| values_equal(v, &p.value)))
    }
}

/// Numeric values compare by value so `42` matches `42.0`.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ---- SessionId ----

    #[test]
    fn test_session_id_new_is_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn test_session_id_parse_trims() {
        let id = SessionId::parse("  thread-1 ").unwrap();
        assert_eq!(id.as_str(), "thread-1");
    }

    #[test]
    fn test_session_id_parse_rejects_bad_input() {
        assert!(SessionId::parse("").is_none());
        assert!(SessionId::parse("   ").is_none());
        assert!(SessionId::parse("a b").is_none());
        assert!(SessionId::parse(&"x".repeat(129)).is_none());
        assert!(SessionId::parse("tab\there").is_none());
    }

    #[test]
    fn test_session_id_serializes_transparently() {
        let id = SessionId::parse("abc").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }

    // ---- Labels ----

    #[test]
    fn test_route_from_label_canonical_and_legacy() {
        assert_eq!(Route::from_label("structured_lookup"), Some(Route::StructuredLookup));
        assert_eq!(Route::from_label("TEXT2SQL"), Some(Route::StructuredLookup));
        assert_eq!(Route::from_label("rag"), Some(Route::SemanticRetrieval));
        assert_eq!(Route::from_label("semantic-retrieval"), Some(Route::SemanticRetrieval));
        assert_eq!(Route::from_label(" Small Talk "), Some(Route::SmallTalk));
        assert_eq!(Route::from_label("chat"), Some(Route::SmallTalk));
    }

    #[test]
    fn test_route_from_label_unknown() {
        assert_eq!(Route::from_label("weather"), None);
        assert_eq!(Route::from_label(""), None);
    }

    #[test]
    fn test_route_round_trips_through_as_str() {
        for route in Route::ALL {
            assert_eq!(Route::from_label(route.as_str()), Some(route));
            assert_eq!(route.to_string(), route.as_str());
        }
    }

    #[test]
    fn test_content_filter_from_label() {
        assert_eq!(ContentFilter::from_label("spec"), Some(ContentFilter::ReferenceMaterial));
        assert_eq!(ContentFilter::from_label("reviews"), Some(ContentFilter::UserOpinion));
        assert_eq!(
            ContentFilter::from_label("user_opinion"),
            Some(ContentFilter::UserOpinion)
        );
        assert_eq!(ContentFilter::from_label("blog"), None);
    }

    #[test]
    fn test_confidence_ordering() {
        assert!(Confidence::Low < Confidence::Medium);
        assert!(Confidence::Medium < Confidence::High);
        assert_eq!(Confidence::from_label("HIGH"), Some(Confidence::High));
        assert_eq!(Confidence::from_label("certain"), None);
    }

    // ---- ConversationState ----

    #[test]
    fn test_recent_window_shorter_than_history() {
        let mut state = ConversationState::new(SessionId::new());
        for i in 0..5 {
            state.append_exchange(
                HistoryEntry::user(format!("q{}", i)),
                HistoryEntry::assistant(format!("a{}", i)),
                0,
            );
        }
        let recent = state.recent(6);
        assert_eq!(recent.len(), 6);
        assert_eq!(recent[0].text, "q2");
        assert_eq!(recent[5].text, "a4");
    }

    #[test]
    fn test_recent_window_longer_than_history() {
        let mut state = ConversationState::new(SessionId::new());
        state.append_exchange(HistoryEntry::user("q"), HistoryEntry::assistant("a"), 0);
        assert_eq!(state.recent(6).len(), 2);
        assert!(ConversationState::new(SessionId::new()).recent(6).is_empty());
    }

    #[test]
    fn test_append_exchange_uncapped() {
        let mut state = ConversationState::new(SessionId::new());
        for _ in 0..100 {
            state.append_exchange(HistoryEntry::user("q"), HistoryEntry::assistant("a"), 0);
        }
        assert_eq!(state.history.len(), 200);
    }

    #[test]
    fn test_append_exchange_cap_drops_whole_exchanges() {
        let mut state = ConversationState::new(SessionId::new());
        for i in 0..4 {
            state.append_exchange(
                HistoryEntry::user(format!("q{}", i)),
                HistoryEntry::assistant(format!("a{}", i)),
                5,
            );
        }
        // Cap of 5 rounds down to whole exchanges.
        assert_eq!(state.history.len(), 4);
        assert_eq!(state.history[0].speaker, Speaker::User);
        assert_eq!(state.history[0].text, "q2");
    }

    #[test]
    fn test_state_deserializes_with_missing_optional_fields() {
        let json = json!({
            "session_id": "s1",
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z"
        });
        let state: ConversationState = serde_json::from_value(json).unwrap();
        assert!(state.history.is_empty());
        assert!(state.last_entity_id.is_none());
    }

    // ---- TabularResult ----

    #[test]
    fn test_tabular_to_text() {
        let result = TabularResult {
            statement: "SELECT name, price FROM products".to_string(),
            columns: vec!["name".to_string(), "price".to_string()],
            rows: vec![
                vec![json!("LG 27GN850-B"), json!(379.99)],
                vec![json!("Dell S2721DGF"), Value::Null],
            ],
        };
        let text = result.to_text();
        assert_eq!(
            text,
            "name | price\nLG 27GN850-B | 379.99\nDell S2721DGF | NULL"
        );
    }

    #[test]
    fn test_tabular_empty_text() {
        assert_eq!(TabularResult::default().to_text(), "(no rows)");
    }

    // ---- RetrievalResult ----

    #[test]
    fn test_retrieval_to_text_numbers_passages() {
        let result = RetrievalResult {
            passages: vec![
                RetrievedPassage {
                    content: "Refresh rate is measured in Hz. ".to_string(),
                    metadata: Map::new(),
                    score: 0.9,
                },
                RetrievedPassage {
                    content: "Higher is smoother.".to_string(),
                    metadata: Map::new(),
                    score: 0.8,
                },
            ],
        };
        assert_eq!(
            result.to_text(),
            "[1] Refresh rate is measured in Hz.\n\n[2] Higher is smoother."
        );
    }

    #[test]
    fn test_raw_result_tagged_serialization() {
        let raw = RawResult::Retrieved(RetrievalResult::default());
        let json = serde_json::to_value(&raw).unwrap();
        assert_eq!(json["kind"], "retrieved");
    }

    // ---- MetadataFilter ----

    fn meta(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_filter_conjunction() {
        let filter = MetadataFilter::new().eq("type", "reviews").eq("product_id", 42);
        assert!(filter.matches(&meta(json!({"type": "reviews", "product_id": 42}))));
        assert!(!filter.matches(&meta(json!({"type": "reviews", "product_id": 7}))));
        assert!(!filter.matches(&meta(json!({"type": "spec", "product_id": 42}))));
    }

    #[test]
    fn test_filter_missing_key_does_not_match() {
        let filter = MetadataFilter::new().eq("product_id", 42);
        assert!(!filter.matches(&meta(json!({"type": "reviews"}))));
    }

    #[test]
    fn test_filter_numeric_equality_across_representations() {
        let filter = MetadataFilter::new().eq("product_id", 42);
        assert!(filter.matches(&meta(json!({"product_id": 42.0}))));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = MetadataFilter::new();
        assert!(filter.is_empty());
        assert!(filter.matches(&Map::new()));
    }
}
