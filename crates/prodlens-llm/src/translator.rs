use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use prodlens_core::error::{ProdLensError, Result};
use prodlens_core::prompts::{context, PromptLibrary, TEXT2SQL};
use prodlens_core::services::{QueryTranslator, TextGenerator};

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```(?:sql)?\s*([\s\S]*?)```").expect("valid regex"));

/// Text-to-SQL translation backed by a text generator.
///
/// The schema description goes into the system prompt; the question is the
/// user message. Markdown fences in the reply are stripped.
pub struct LlmQueryTranslator {
    generator: Arc<dyn TextGenerator>,
    prompts: Arc<PromptLibrary>,
}

impl LlmQueryTranslator {
    pub fn new(generator: Arc<dyn TextGenerator>, prompts: Arc<PromptLibrary>) -> Self {
        Self { generator, prompts }
    }
}

#[async_trait]
impl QueryTranslator for LlmQueryTranslator {
    async fn translate(&self, question: &str, schema_description: &str) -> Result<String> {
        let system = self
            .prompts
            .render(TEXT2SQL, context! { schema => schema_description })?;
        let raw = self.generator.generate(&system, question).await?;
        let statement = strip_code_fences(&raw);
        if statement.is_empty() {
            return Err(ProdLensError::Llm(
                "translator returned an empty statement".to_string(),
            ));
        }
        debug!(statement = %statement, "Translated question");
        Ok(statement)
    }
}

/// Remove markdown code fences, keeping their contents.
pub fn strip_code_fences(text: &str) -> String {
    CODE_FENCE.replace_all(text, "$1").trim().to_string()
}
