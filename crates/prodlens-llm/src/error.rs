use thiserror::Error;

use prodlens_core::error::ProdLensError;

/// Failures talking to an OpenAI-compatible service.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("http error: {0}")]
    Http(String),

    #[error("response error: {0}")]
    Response(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<LlmError> for ProdLensError {
    fn from(err: LlmError) -> Self {
        ProdLensError::Llm(err.to_string())
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        LlmError::Http(err.to_string())
    }
}
