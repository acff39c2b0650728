//! Scriptable collaborator doubles.
//!
//! Each stub records what it was called with so tests can assert both the
//! answer and which collaborators a turn touched.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value};

use prodlens_core::config::ProdLensConfig;
use prodlens_core::error::{ProdLensError, Result};
use prodlens_core::prompts::PromptLibrary;
use prodlens_core::services::{
    DecisionGenerator, DecisionSchema, EmbeddingService, PassageSearch, QueryTranslator,
    StatementExecutor, TextGenerator,
};
use prodlens_core::types::{MetadataFilter, RetrievedPassage, TabularResult};
use prodlens_storage::InMemorySessionStore;

use crate::orchestrator::{ChatOrchestrator, Collaborators};

type TextHandler = Box<dyn Fn(&str, &str) -> Result<String> + Send + Sync>;
type DecisionHandler = Box<dyn Fn(&str, &str) -> Result<Value> + Send + Sync>;
type QueryHandler<T> = Box<dyn Fn(&str) -> Result<T> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Rows with the given column names and no statement.
pub fn table(columns: &[&str], rows: Vec<Vec<Value>>) -> TabularResult {
    TabularResult {
        statement: String::new(),
        columns: columns.iter().map(|c| c.to_string()).collect(),
        rows,
    }
}

/// A passage with object metadata and a perfect score.
pub fn passage(content: &str, metadata: Value) -> RetrievedPassage {
    let metadata = match metadata {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    RetrievedPassage {
        content: content.to_string(),
        metadata,
        score: 1.0,
    }
}

// =============================================================================
// Text generation
// =============================================================================

pub struct StubText {
    handler: TextHandler,
    calls: Mutex<Vec<(String, String)>>,
}

impl StubText {
    pub fn new(handler: impl Fn(&str, &str) -> Result<String> + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |_, _| Ok(text.clone()))
    }

    pub fn failing(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(move |_, _| Err(ProdLensError::Llm(message.clone())))
    }

    /// Behaves like a cooperative model under the built-in prompts: rewrites
    /// are the identity, syntheses quote the data they were given, anything
    /// else gets a short acknowledgment.
    pub fn canned() -> Self {
        Self::new(|_, user| {
            if user.contains("Reformulate the current query") {
                return Ok(between(user, "Current Query: ", "\n").to_string());
            }
            if user.contains("Database Results:") {
                return Ok(format!(
                    "Here is what I found:\n{}",
                    between(user, "Database Results:\n", "\n\nPlease")
                ));
            }
            if user.contains("Retrieved Information:") {
                return Ok(format!(
                    "In short: {}",
                    between(user, "Retrieved Information:\n", "\n\nPlease")
                ));
            }
            Ok("You're welcome! Anything else I can help with?".to_string())
        })
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

fn between<'a>(text: &'a str, start: &str, end: &str) -> &'a str {
    let Some(begin) = text.find(start).map(|i| i + start.len()) else {
        return "";
    };
    let rest = &text[begin..];
    match rest.find(end) {
        Some(stop) => &rest[..stop],
        None => rest,
    }
}

#[async_trait]
impl TextGenerator for StubText {
    async fn generate(&self, system: &str, user: &str) -> Result<String> {
        lock(&self.calls).push((system.to_string(), user.to_string()));
        (self.handler)(system, user)
    }
}

// =============================================================================
// Decisions
// =============================================================================

/// Decision stub; the handler sees the schema name and the user prompt.
pub struct StubDecisions {
    handler: DecisionHandler,
    calls: Mutex<Vec<(String, String, String)>>,
}

impl StubDecisions {
    pub fn new(handler: impl Fn(&str, &str) -> Result<Value> + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `(schema name, system prompt, user prompt)` per call.
    pub fn calls(&self) -> Vec<(String, String, String)> {
        lock(&self.calls).clone()
    }

    pub fn systems(&self) -> Vec<String> {
        lock(&self.calls).iter().map(|c| c.1.clone()).collect()
    }

    pub fn users(&self) -> Vec<String> {
        lock(&self.calls).iter().map(|c| c.2.clone()).collect()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn calls_for(&self, schema_name: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.0 == schema_name)
            .count()
    }
}

#[async_trait]
impl DecisionGenerator for StubDecisions {
    async fn decide(&self, system: &str, user: &str, schema: &DecisionSchema) -> Result<Value> {
        lock(&self.calls).push((schema.name.clone(), system.to_string(), user.to_string()));
        (self.handler)(&schema.name, user)
    }
}

// =============================================================================
// Structured lookup
// =============================================================================

pub struct StubTranslator {
    handler: QueryHandler<String>,
    calls: Mutex<Vec<String>>,
}

impl StubTranslator {
    pub fn new(handler: impl Fn(&str) -> Result<String> + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn returning(statement: impl Into<String>) -> Self {
        let statement = statement.into();
        Self::new(move |_| Ok(statement.clone()))
    }

    pub fn failing(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(move |_| Err(ProdLensError::Llm(message.clone())))
    }

    /// Questions received, in order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl QueryTranslator for StubTranslator {
    async fn translate(&self, question: &str, _schema_description: &str) -> Result<String> {
        lock(&self.calls).push(question.to_string());
        (self.handler)(question)
    }
}

pub struct StubStatements {
    handler: QueryHandler<TabularResult>,
    calls: Mutex<Vec<String>>,
}

impl StubStatements {
    pub fn new(handler: impl Fn(&str) -> Result<TabularResult> + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Always returns `result`, stamped with the executed statement.
    pub fn returning(result: TabularResult) -> Self {
        Self::new(move |statement| {
            let mut result = result.clone();
            result.statement = statement.to_string();
            Ok(result)
        })
    }

    pub fn failing(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(move |_| Err(ProdLensError::Sql(message.clone())))
    }

    /// Statements executed, in order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl StatementExecutor for StubStatements {
    async fn execute(&self, statement: &str) -> Result<TabularResult> {
        lock(&self.calls).push(statement.to_string());
        (self.handler)(statement)
    }
}

// =============================================================================
// Semantic retrieval
// =============================================================================

/// Constant unit vectors of a fixed length.
pub struct StubEmbedding {
    dimensions: usize,
}

impl StubEmbedding {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

#[async_trait]
impl EmbeddingService for StubEmbedding {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        let value = 1.0 / (self.dimensions.max(1) as f32).sqrt();
        Ok(vec![value; self.dimensions])
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Search over a fixed corpus, honouring the metadata filter and `top_k`.
pub struct StubSearch {
    corpus: Vec<RetrievedPassage>,
    failure: Option<String>,
    calls: Mutex<Vec<(usize, MetadataFilter)>>,
}

impl StubSearch {
    pub fn new(corpus: Vec<RetrievedPassage>) -> Self {
        Self {
            corpus,
            failure: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            corpus: Vec::new(),
            failure: Some(message.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `(top_k, filter)` per call.
    pub fn calls(&self) -> Vec<(usize, MetadataFilter)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl PassageSearch for StubSearch {
    async fn search(
        &self,
        _query: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<RetrievedPassage>> {
        lock(&self.calls).push((top_k, filter.clone()));
        if let Some(message) = &self.failure {
            return Err(ProdLensError::Retrieval(message.clone()));
        }
        Ok(self
            .corpus
            .iter()
            .filter(|p| filter.matches(&p.metadata))
            .take(top_k)
            .cloned()
            .collect())
    }
}

// =============================================================================
// Rig
// =============================================================================

/// A full set of stubs wired into an orchestrator with an in-memory store.
pub struct StubRig {
    pub text: Arc<StubText>,
    pub decisions: Arc<StubDecisions>,
    pub translator: Arc<StubTranslator>,
    pub statements: Arc<StubStatements>,
    pub search: Arc<StubSearch>,
    pub sessions: Arc<InMemorySessionStore>,
}

impl StubRig {
    pub fn new(decisions: StubDecisions) -> Self {
        Self {
            text: Arc::new(StubText::canned()),
            decisions: Arc::new(decisions),
            translator: Arc::new(StubTranslator::returning("SELECT * FROM products LIMIT 10")),
            statements: Arc::new(StubStatements::returning(TabularResult::default())),
            search: Arc::new(StubSearch::new(Vec::new())),
            sessions: Arc::new(InMemorySessionStore::new()),
        }
    }

    pub fn with_text(mut self, text: StubText) -> Self {
        self.text = Arc::new(text);
        self
    }

    pub fn with_translator(mut self, translator: StubTranslator) -> Self {
        self.translator = Arc::new(translator);
        self
    }

    pub fn with_statements(mut self, statements: StubStatements) -> Self {
        self.statements = Arc::new(statements);
        self
    }

    pub fn with_search(mut self, search: StubSearch) -> Self {
        self.search = Arc::new(search);
        self
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            rewriter: self.text.clone(),
            responder: self.text.clone(),
            decisions: self.decisions.clone(),
            translator: self.translator.clone(),
            statements: self.statements.clone(),
            embeddings: Arc::new(StubEmbedding::new(8)),
            search: self.search.clone(),
            sessions: self.sessions.clone(),
            prompts: Arc::new(PromptLibrary::builtin()),
            schema_description: "CREATE TABLE products (product_id INTEGER, name TEXT, price REAL)"
                .to_string(),
        }
    }

    pub fn orchestrator(&self) -> ChatOrchestrator {
        self.orchestrator_with(&ProdLensConfig::default())
    }

    pub fn orchestrator_with(&self, config: &ProdLensConfig) -> ChatOrchestrator {
        ChatOrchestrator::new(config, self.collaborators())
    }
}
