//! Answer synthesis: raw collaborator output to the final answer text.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use prodlens_core::error::{ProdLensError, Result};
use prodlens_core::prompts::{
    context, PromptLibrary, POSTPROCESS_RAG, POSTPROCESS_RAG_USER, POSTPROCESS_SQL,
    POSTPROCESS_SQL_USER,
};
use prodlens_core::services::TextGenerator;
use prodlens_core::types::{RetrievalResult, TabularResult};

use crate::deadline::bounded;
use crate::error::TurnError;

/// Literal answer when synthesis fails and there is nothing raw to show.
pub const NO_RESULTS: &str = "No results available";

/// Answer when an opinion lookup could not be tied to a product.
pub const UNRESOLVED_ENTITY_ANSWER: &str = "I couldn't identify which product you mean. \
Could you name the product, or look it up first and then ask what buyers think of it?";

/// What the execution branch produced for this turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Structured(TabularResult),
    Retrieved(RetrievalResult),
    SmallTalk(String),
    /// Opinion retrieval was not attempted for lack of an entity id.
    UnresolvedEntity,
    /// The collaborator failed; carries a user-safe description.
    Failed { hint: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    pub answer: String,
    pub error: Option<TurnError>,
}

pub struct AnswerSynthesizer {
    generator: Arc<dyn TextGenerator>,
    prompts: Arc<PromptLibrary>,
    timeout_secs: u64,
}

impl AnswerSynthesizer {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        prompts: Arc<PromptLibrary>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            generator,
            prompts,
            timeout_secs,
        }
    }

    /// Produce the final answer. Never returns empty text.
    pub async fn synthesize(&self, query: &str, outcome: &ExecutionOutcome) -> Synthesis {
        let started = Instant::now();
        let (system, user, fallback) = match outcome {
            ExecutionOutcome::SmallTalk(text) => return plain(text.clone()),
            ExecutionOutcome::UnresolvedEntity => {
                return plain(UNRESOLVED_ENTITY_ANSWER.to_string())
            }
            ExecutionOutcome::Failed { hint } => return plain(apology(hint)),
            ExecutionOutcome::Structured(result) => {
                let user = self.prompts.render(
                    POSTPROCESS_SQL_USER,
                    context! {
                        query => query,
                        statement => &result.statement,
                        results => result.to_text(),
                    },
                );
                (
                    self.prompts.render(POSTPROCESS_SQL, context! {}),
                    user,
                    raw_or_placeholder(result.is_empty(), || result.to_text()),
                )
            }
            ExecutionOutcome::Retrieved(result) => {
                let user = self.prompts.render(
                    POSTPROCESS_RAG_USER,
                    context! { query => query, passages => result.to_text() },
                );
                (
                    self.prompts.render(POSTPROCESS_RAG, context! {}),
                    user,
                    raw_or_placeholder(result.is_empty(), || result.to_text()),
                )
            }
        };

        match self.call(system, user).await {
            Ok(answer) => {
                info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Answer synthesized"
                );
                Synthesis {
                    answer,
                    error: None,
                }
            }
            Err(e) => {
                warn!(error = %e, "Synthesis failed, returning raw result");
                Synthesis {
                    answer: fallback,
                    error: Some(TurnError::Synthesis(e.to_string())),
                }
            }
        }
    }

    async fn call(&self, system: Result<String>, user: Result<String>) -> Result<String> {
        let (system, user) = (system?, user?);
        let text = bounded(self.timeout_secs, self.generator.generate(&system, &user)).await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(ProdLensError::Llm("empty answer".to_string()));
        }
        Ok(text.to_string())
    }
}

/// Apology naming the failing collaborator without leaking its error.
pub fn apology(hint: &str) -> String {
    format!(
        "Sorry, I couldn't complete that request because {}. Please try again in a moment or rephrase your question.",
        hint
    )
}

fn plain(answer: String) -> Synthesis {
    Synthesis {
        answer,
        error: None,
    }
}

fn raw_or_placeholder(empty: bool, raw: impl FnOnce() -> String) -> String {
    if empty {
        NO_RESULTS.to_string()
    } else {
        raw()
    }
}
