pub mod config;
pub mod error;
pub mod prompts;
pub mod services;
pub mod types;

pub use config::ProdLensConfig;
pub use error::{ProdLensError, Result};
pub use prompts::PromptLibrary;
pub use services::{
    DecisionGenerator, DecisionSchema, EmbeddingService, PassageSearch, QueryTranslator,
    StatementExecutor, TextGenerator,
};
pub use types::*;
