//! Conversational query routing for ProdLens.
//!
//! Each turn rewrites the message into a standalone query, routes it to a
//! structured lookup, semantic retrieval or small talk, and synthesizes the
//! collaborator output into an answer. Session state carries the last
//! lookup rows and resolved product between turns.

pub mod classifier;
mod deadline;
pub mod decision;
pub mod error;
pub mod executor;
pub mod graph;
pub mod orchestrator;
pub mod resolver;
pub mod rewriter;
pub mod router;
pub mod small_talk;
pub mod synthesizer;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod turn;

pub use error::{ChatError, TurnError};
pub use graph::Node;
pub use orchestrator::{ChatOrchestrator, Collaborators};
pub use prodlens_storage::SessionSummary;
pub use turn::{QueryResponse, TurnRequest};
