//! ProdLens vector crate: the passage index used for semantic retrieval and a
//! deterministic embedding for tests and offline runs.

pub mod embedding;
pub mod index;

pub use embedding::{MockEmbedding, MOCK_MODEL_NAME};
pub use index::{IndexEntry, VectorIndex};
