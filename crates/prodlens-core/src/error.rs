use thiserror::Error;

/// Top-level error type for ProdLens.
///
/// Each variant wraps a failure from one collaborator or subsystem. Subsystem
/// crates define their own error types and implement
/// `From<SubsystemError> for ProdLensError` so that `?` works across crate
/// boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProdLensError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQL error: {0}")]
    Sql(String),

    #[error("Retrieval error: {0}")]
    Retrieval(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProdLensError {
    /// Short, user-safe description of which collaborator failed.
    ///
    /// Used when a failure has to be mentioned in conversational text; never
    /// includes the inner message.
    pub fn user_hint(&self) -> &'static str {
        match self {
            ProdLensError::Sql(_) => "the product database returned an error",
            ProdLensError::Retrieval(_) => "the knowledge base returned an error",
            ProdLensError::Llm(_) | ProdLensError::Template(_) => {
                "the language service returned an error"
            }
            ProdLensError::Timeout(_) => "the request took too long",
            ProdLensError::Storage(_) | ProdLensError::Io(_) => "a storage error occurred",
            ProdLensError::Config(_) | ProdLensError::Serialization(_) => {
                "an internal error occurred"
            }
        }
    }
}

impl From<toml::de::Error> for ProdLensError {
    fn from(err: toml::de::Error) -> Self {
        ProdLensError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for ProdLensError {
    fn from(err: toml::ser::Error) -> Self {
        ProdLensError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for ProdLensError {
    fn from(err: serde_json::Error) -> Self {
        ProdLensError::Serialization(err.to_string())
    }
}

impl From<minijinja::Error> for ProdLensError {
    fn from(err: minijinja::Error) -> Self {
        ProdLensError::Template(err.to_string())
    }
}

/// A specialized `Result` type for ProdLens operations.
pub type Result<T> = std::result::Result<T, ProdLensError>;
