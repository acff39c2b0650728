//! HTTP surface for ProdLens: query, conversation reset, history and the
//! turn graph, served with axum.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::{create_router, start_server};
pub use state::AppState;
