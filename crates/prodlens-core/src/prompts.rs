//! Named prompt templates.
//!
//! Every prompt the conversation core sends is rendered from a template looked
//! up by name. Built-in defaults ship with the binary; a file named
//! `<name>.txt` in the configured template directory replaces the default.

use std::collections::BTreeMap;
use std::path::Path;

use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{expand_home, PromptConfig};
use crate::error::{ProdLensError, Result};

pub use minijinja::context;

pub const REWRITE_SYSTEM: &str = "rewrite_system";
pub const REWRITE_USER: &str = "rewrite_user";
pub const ROUTER_SYSTEM: &str = "router_system";
pub const CONTENT_ROUTER_SYSTEM: &str = "content_router_system";
pub const ENTITY_EXTRACT_SYSTEM: &str = "entity_extract_system";
pub const ENTITY_EXTRACT_USER: &str = "entity_extract_user";
pub const ENTITY_LOOKUP: &str = "entity_lookup";
pub const SMALL_TALK_SYSTEM: &str = "small_talk_system";
pub const SMALL_TALK_USER: &str = "small_talk_user";
pub const POSTPROCESS_SQL: &str = "postprocess_sql";
pub const POSTPROCESS_SQL_USER: &str = "postprocess_sql_user";
pub const POSTPROCESS_RAG: &str = "postprocess_rag";
pub const POSTPROCESS_RAG_USER: &str = "postprocess_rag_user";
pub const TEXT2SQL: &str = "text2sql";

const BUILTIN: &[(&str, &str)] = &[
    (
        REWRITE_SYSTEM,
        r#"You reformulate follow-up questions about consumer electronics into standalone questions.

Given the conversation history and the user's latest message, rewrite the latest message so that it can be understood without the history. Replace pronouns and vague references ("it", "that one", "the second monitor") with the concrete product names, brands or attributes they refer to.

If the latest message is already standalone, return it unchanged. Return only the rewritten question, with no explanation or quotes."#,
    ),
    (
        REWRITE_USER,
        r#"Conversation History:
{{ history }}

Current Query: {{ query }}

Reformulate the current query into a standalone query:"#,
    ),
    (
        ROUTER_SYSTEM,
        r#"You are a query routing assistant for an electronics product database.

The system has the following capabilities:

1. structured_lookup: queries structured product data (specifications, prices, ratings, comparisons)
- Examples: "Show me monitors under $500", "What's the best gaming mouse?", "Compare keyboards"
- Use when: the query needs filtering, aggregation, sorting, or comparing specific product attributes

2. semantic_retrieval: searches unstructured text for definitions, explanations and buyer reviews
- Examples: "What is response time?", "Why is DPI important?", "What do buyers say about the G502?"
- Use when: the query asks for definitions, meanings, importance, explanations, or opinions
{% if small_talk_enabled %}
3. small_talk: conversational messages that need no product data
- Examples: "Thanks!", "Hello", "What can you do?"
- Use when: the message is a greeting, thanks, or a question about the assistant itself
{% endif %}
Respond with JSON:
{"route": "<one of the capabilities above>", "reasoning": "Brief explanation"}"#,
    ),
    (
        CONTENT_ROUTER_SYSTEM,
        r#"You classify questions about consumer electronics by the kind of text that answers them.

- spec: definitions and explanations of specifications and technologies ("What is refresh rate?", "Why does DPI matter?")
- reviews: opinions and experiences of buyers about one specific product ("What do people say about the LG 27GN850-B?", "Is it reliable?")

Respond with JSON:
{"content_type": "spec" | "reviews", "reasoning": "Brief explanation"}"#,
    ),
    (
        ENTITY_EXTRACT_SYSTEM,
        r#"You identify which catalog product a question refers to.

You are given context made of earlier database results and conversation, and the user's question. Find the numeric product_id of the single product the question is about.

Rules:
- Only use product ids that literally appear in the context.
- Use "high" confidence only when exactly one product clearly matches.
- If no id fits, return null.

Respond with JSON:
{"product_id": <integer or null>, "confidence": "high" | "medium" | "low", "reasoning": "Brief explanation"}"#,
    ),
    (
        ENTITY_EXTRACT_USER,
        r#"Context:
{{ context }}

Question: {{ query }}"#,
    ),
    (
        ENTITY_LOOKUP,
        r#"Find the product_id and name of the product this question is about: {{ query }}"#,
    ),
    (
        SMALL_TALK_SYSTEM,
        r#"You are ProdLens, a friendly assistant for questions about consumer electronics such as monitors, keyboards, mice and headsets.

Reply briefly and warmly. You can look up products, prices and specifications, explain technical terms, and summarize what buyers say about a product. Do not invent product facts in small talk."#,
    ),
    (
        SMALL_TALK_USER,
        r#"Conversation History:
{{ history }}

User: {{ query }}"#,
    ),
    (
        POSTPROCESS_SQL,
        r#"You are a helpful assistant that presents database query results in natural language.

Your task:
1. Take the SQL query results and present them in a clear, conversational way
2. Use proper formatting (bullet points, tables if needed)
3. Highlight key insights from the data
4. Be concise but informative
5. If there are no results, explain that politely

Do not make up information. Only use what is in the results."#,
    ),
    (
        POSTPROCESS_SQL_USER,
        r#"Original Query: {{ query }}
Query Used: {{ statement }}
Database Results:
{{ results }}

Please provide a natural language response to the user's query based on these results."#,
    ),
    (
        POSTPROCESS_RAG,
        r#"You are a helpful assistant that explains technical concepts about electronics.

Your task:
1. Take the retrieved information and explain it clearly
2. Use examples where appropriate
3. Keep explanations accessible to non-experts
4. Maintain accuracy and do not add information beyond what is provided
5. Structure the response with clear paragraphs
6. Keep your response concise

Do not make up information. Only use the retrieved context."#,
    ),
    (
        POSTPROCESS_RAG_USER,
        r#"Original Query: {{ query }}

Retrieved Information:
{{ passages }}

Please provide a clear, natural language explanation to answer the user's query."#,
    ),
    (
        TEXT2SQL,
        r#"You translate questions about an electronics catalog into a single SQLite SELECT statement.

Database schema:
{{ schema }}

Rules:
- Return exactly one read-only statement (SELECT or WITH ... SELECT).
- Always include the product id column when selecting products.
- Use LIMIT 10 unless the question asks for a specific number.
- Return only SQL, with no explanation."#,
    ),
];

/// Template store with strict rendering.
#[derive(Debug)]
pub struct PromptLibrary {
    env: Environment<'static>,
    templates: BTreeMap<String, String>,
    version: String,
}

impl PromptLibrary {
    /// Library containing only the built-in templates.
    pub fn builtin() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        let templates = BUILTIN
            .iter()
            .map(|(name, source)| (name.to_string(), source.to_string()))
            .collect();
        Self {
            env,
            templates,
            version: "builtin".to_string(),
        }
    }

    /// Built-in templates, overridden by any `<name>.txt` found in the
    /// configured template directory.
    pub fn from_config(config: &PromptConfig) -> Result<Self> {
        let mut library = Self::builtin();
        library.version = config.version.clone();
        if let Some(dir) = &config.template_dir {
            let dir = expand_home(dir);
            library.load_overrides(&dir)?;
        }
        Ok(library)
    }

    fn load_overrides(&mut self, dir: &Path) -> Result<()> {
        if !dir.is_dir() {
            return Err(ProdLensError::Config(format!(
                "template directory {} does not exist",
                dir.display()
            )));
        }
        let mut overridden = 0usize;
        for (name, _) in BUILTIN {
            let path = dir.join(format!("{}.txt", name));
            if path.is_file() {
                let source = std::fs::read_to_string(&path)?;
                debug!(template = %name, path = %path.display(), "Template override loaded");
                self.templates.insert(name.to_string(), source);
                overridden += 1;
            }
        }
        info!(dir = %dir.display(), overridden, "Prompt templates loaded");
        Ok(())
    }

    /// Replace or add one template.
    pub fn with_template(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.templates.insert(name.into(), source.into());
        self
    }

    /// Render a template by name. Undefined variables are an error.
    pub fn render<S: Serialize>(&self, name: &str, ctx: S) -> Result<String> {
        let source = self
            .templates
            .get(name)
            .ok_or_else(|| ProdLensError::Template(format!("unknown template '{}'", name)))?;
        let rendered = self.env.render_str(source, ctx)?;
        Ok(rendered.trim().to_string())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

impl Default for PromptLibrary {
    fn default() -> Self {
        Self::builtin()
    }
}
