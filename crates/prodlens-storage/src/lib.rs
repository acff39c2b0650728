//! ProdLens storage crate: the session store and the read-only product catalog.
//!
//! Sessions live in a WAL-mode SQLite database with versioned migrations, or
//! in memory for single-process deployments. The catalog executor runs
//! translated statements against a SQLite file opened read-only.

pub mod catalog;
pub mod db;
pub mod migrations;
pub mod session;

pub use catalog::SqliteStatementExecutor;
pub use db::Database;
pub use session::{InMemorySessionStore, SessionStore, SessionSummary, SqliteSessionStore};
