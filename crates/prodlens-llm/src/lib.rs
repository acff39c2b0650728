//! ProdLens LLM crate: HTTP client for OpenAI-compatible services and the
//! text-to-SQL translator built on it.

pub mod client;
pub mod error;
pub mod translator;

pub use client::{HttpLlmClient, HttpLlmClientConfig};
pub use error::LlmError;
pub use translator::LlmQueryTranslator;
