//! Read-only access to the SQLite product catalog.
//!
//! The catalog is populated by an external ingestion job; this side only
//! reads it. Statements produced by the translator are checked before they
//! reach SQLite and the connection itself is opened read-only.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::Value;
use tracing::{debug, info};

use prodlens_core::error::{ProdLensError, Result};
use prodlens_core::services::StatementExecutor;
use prodlens_core::types::TabularResult;

/// Default cap on returned rows.
pub const DEFAULT_MAX_ROWS: usize = 200;

/// [`StatementExecutor`] over a read-only SQLite file.
#[derive(Clone)]
pub struct SqliteStatementExecutor {
    conn: Arc<Mutex<Connection>>,
    max_rows: usize,
}

impl SqliteStatementExecutor {
    /// Open an existing catalog database read-only.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(ProdLensError::Sql(format!(
                "catalog database {} does not exist",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| ProdLensError::Sql(format!("Failed to open catalog: {}", e)))?;
        info!("Catalog opened read-only at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_rows: DEFAULT_MAX_ROWS,
        })
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows.max(1);
        self
    }

    /// `CREATE` statements of every table and view, as stored by SQLite.
    ///
    /// Used as the translator's schema description when no schema file is
    /// configured.
    pub fn describe_schema(&self) -> Result<String> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ProdLensError::Sql(format!("Catalog lock poisoned: {}", e)))?;
        let mut stmt = conn
            .prepare(
                "SELECT sql FROM sqlite_master
                 WHERE type IN ('table', 'view') AND sql IS NOT NULL AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )
            .map_err(|e| ProdLensError::Sql(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| ProdLensError::Sql(e.to_string()))?;

        let mut statements = Vec::new();
        for row in rows {
            statements.push(format!(
                "{};",
                row.map_err(|e| ProdLensError::Sql(e.to_string()))?
            ));
        }
        Ok(statements.join("\n\n"))
    }
}

impl std::fmt::Debug for SqliteStatementExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStatementExecutor")
            .field("max_rows", &self.max_rows)
            .finish()
    }
}

#[async_trait]
impl StatementExecutor for SqliteStatementExecutor {
    async fn execute(&self, statement: &str) -> Result<TabularResult> {
        let statement = check_read_only(statement)?;
        let conn = Arc::clone(&self.conn);
        let max_rows = self.max_rows;

        let started = Instant::now();
        let result = tokio::task::spawn_blocking(move || run_query(&conn, &statement, max_rows))
            .await
            .map_err(|e| ProdLensError::Sql(format!("Catalog task failed: {}", e)))??;

        info!(
            rows = result.rows.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Catalog query executed"
        );
        debug!(statement = %result.statement, "Catalog statement");
        Ok(result)
    }
}

fn run_query(conn: &Mutex<Connection>, statement: &str, max_rows: usize) -> Result<TabularResult> {
    let conn = conn
        .lock()
        .map_err(|e| ProdLensError::Sql(format!("Catalog lock poisoned: {}", e)))?;
    let mut stmt = conn
        .prepare(statement)
        .map_err(|e| ProdLensError::Sql(e.to_string()))?;
    if !stmt.readonly() {
        return Err(ProdLensError::Sql(
            "only read-only statements are allowed".to_string(),
        ));
    }

    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let width = columns.len();

    let mut rows = stmt
        .query([])
        .map_err(|e| ProdLensError::Sql(e.to_string()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(|e| ProdLensError::Sql(e.to_string()))? {
        if out.len() >= max_rows {
            break;
        }
        let mut cells = Vec::with_capacity(width);
        for i in 0..width {
            let value = row
                .get_ref(i)
                .map_err(|e| ProdLensError::Sql(e.to_string()))?;
            cells.push(cell_to_json(value));
        }
        out.push(cells);
    }

    Ok(TabularResult {
        statement: statement.to_string(),
        columns,
        rows: out,
    })
}

fn cell_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<{} bytes>", b.len())),
    }
}

/// Accept a single `SELECT` or `WITH` statement. Trailing semicolons are
/// stripped; a second statement after one is rejected. Semicolons inside
/// quoted text are part of the statement.
pub fn check_read_only(statement: &str) -> Result<String> {
    let statement = statement.trim();
    let trimmed = match statement_end(statement) {
        Some(end) => {
            let rest = statement[end..].trim_start_matches(|c: char| c == ';' || c.is_whitespace());
            if !rest.is_empty() {
                return Err(ProdLensError::Sql(
                    "multiple statements are not allowed".to_string(),
                ));
            }
            statement[..end].trim_end()
        }
        None => statement,
    };
    if trimmed.is_empty() {
        return Err(ProdLensError::Sql("empty statement".to_string()));
    }
    let keyword = trimmed
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    if keyword != "SELECT" && keyword != "WITH" {
        return Err(ProdLensError::Sql(format!(
            "only SELECT statements are allowed, got {}",
            keyword
        )));
    }
    Ok(trimmed.to_string())
}

/// Byte offset of the first `;` outside quoted text.
fn statement_end(sql: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in sql.char_indices() {
        match quote {
            Some(open) if c == open => quote = None,
            Some(_) => {}
            None if matches!(c, '\'' | '"' | '`') => quote = Some(c),
            None if c == ';' => return Some(i),
            None => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_catalog() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE products (
                product_id  INTEGER PRIMARY KEY,
                name        TEXT NOT NULL,
                category    TEXT NOT NULL,
                price       REAL,
                image       BLOB
            );
            INSERT INTO products VALUES (1, 'LG 27GN850-B', 'monitor', 379.99, NULL);
            INSERT INTO products VALUES (2, 'Dell S2721DGF', 'monitor', 429.0, x'0102');
            INSERT INTO products VALUES (3, 'Logitech G502', 'mouse', 49.99, NULL);",
        )
        .unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn test_execute_select() {
        let (_dir, path) = sample_catalog();
        let executor = SqliteStatementExecutor::open(&path).unwrap();
        let result = executor
            .execute("SELECT product_id, name, price FROM products WHERE category = 'monitor' ORDER BY price;")
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["product_id", "name", "price"]);
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[0], vec![json!(1), json!("LG 27GN850-B"), json!(379.99)]);
        assert!(!result.statement.ends_with(';'));
    }

    #[tokio::test]
    async fn test_execute_null_and_blob_cells() {
        let (_dir, path) = sample_catalog();
        let executor = SqliteStatementExecutor::open(&path).unwrap();
        let result = executor
            .execute("SELECT image FROM products ORDER BY product_id")
            .await
            .unwrap();
        assert_eq!(result.rows[0][0], Value::Null);
        assert_eq!(result.rows[1][0], json!("<2 bytes>"));
    }

    #[tokio::test]
    async fn test_execute_with_cte() {
        let (_dir, path) = sample_catalog();
        let executor = SqliteStatementExecutor::open(&path).unwrap();
        let result = executor
            .execute("WITH cheap AS (SELECT * FROM products WHERE price < 100) SELECT name FROM cheap")
            .await
            .unwrap();
        assert_eq!(result.rows, vec![vec![json!("Logitech G502")]]);
    }

    #[tokio::test]
    async fn test_execute_respects_max_rows() {
        let (_dir, path) = sample_catalog();
        let executor = SqliteStatementExecutor::open(&path).unwrap().with_max_rows(1);
        let result = executor.execute("SELECT name FROM products").await.unwrap();
        assert_eq!(result.rows.len(), 1);
    }

    #[tokio::test]
    async fn test_execute_rejects_writes() {
        let (_dir, path) = sample_catalog();
        let executor = SqliteStatementExecutor::open(&path).unwrap();
        for statement in [
            "DELETE FROM products",
            "UPDATE products SET price = 0",
            "DROP TABLE products",
            "SELECT 1; DELETE FROM products",
        ] {
            let err = executor.execute(statement).await.unwrap_err();
            assert!(matches!(err, ProdLensError::Sql(_)), "{}", statement);
        }
        let count = executor.execute("SELECT COUNT(*) FROM products").await.unwrap();
        assert_eq!(count.rows[0][0], json!(3));
    }

    #[tokio::test]
    async fn test_execute_bad_sql_is_sql_error() {
        let (_dir, path) = sample_catalog();
        let executor = SqliteStatementExecutor::open(&path).unwrap();
        let err = executor.execute("SELECT * FROM nope").await.unwrap_err();
        assert!(err.to_string().contains("no such table"));
    }

    #[test]
    fn test_open_missing_file() {
        let err = SqliteStatementExecutor::open(Path::new("/nonexistent/catalog.db")).unwrap_err();
        assert!(matches!(err, ProdLensError::Sql(_)));
    }

    #[test]
    fn test_describe_schema() {
        let (_dir, path) = sample_catalog();
        let executor = SqliteStatementExecutor::open(&path).unwrap();
        let schema = executor.describe_schema().unwrap();
        assert!(schema.starts_with("CREATE TABLE products"));
        assert!(schema.ends_with(';'));
    }

    #[test]
    fn test_check_read_only() {
        assert_eq!(check_read_only("  select 1 ;; ").unwrap(), "select 1");
        assert!(check_read_only("").is_err());
        assert!(check_read_only(";").is_err());
        assert!(check_read_only("INSERT INTO t VALUES (1)").is_err());
        assert!(check_read_only("PRAGMA table_info(products)").is_err());
        assert!(check_read_only("SELECT 1; DROP TABLE products").is_err());
    }

    #[test]
    fn test_check_read_only_allows_semicolon_in_literal() {
        assert_eq!(
            check_read_only("SELECT * FROM products WHERE name = 'a;b';").unwrap(),
            "SELECT * FROM products WHERE name = 'a;b'"
        );
        assert_eq!(
            check_read_only("SELECT 'it''s; fine', \"x;y\" FROM t").unwrap(),
            "SELECT 'it''s; fine', \"x;y\" FROM t"
        );
        assert!(check_read_only("SELECT 'a;b'; SELECT 2").is_err());
    }
}
