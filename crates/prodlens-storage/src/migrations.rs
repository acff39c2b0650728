//! Session store schema migrations.

use rusqlite::Connection;
use tracing::info;

use prodlens_core::error::ProdLensError;

/// Migrations in order. Each runs in its own transaction together with the
/// row recording it.
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (
        1,
        "sessions",
        "CREATE TABLE IF NOT EXISTS sessions (
            session_id      TEXT PRIMARY KEY NOT NULL,
            state           TEXT NOT NULL,
            message_count   INTEGER NOT NULL DEFAULT 0,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_updated_at
            ON sessions (updated_at ASC);",
    ),
];

/// Run all pending database migrations.
pub fn run_migrations(conn: &mut Connection) -> Result<(), ProdLensError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| ProdLensError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version = current_version(conn)?;

    for (version, name, sql) in MIGRATIONS {
        if *version <= current_version {
            continue;
        }
        let tx = conn
            .transaction()
            .map_err(|e| ProdLensError::Storage(e.to_string()))?;
        tx.execute_batch(sql).map_err(|e| {
            ProdLensError::Storage(format!("Failed to apply migration v{}: {}", version, e))
        })?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
            rusqlite::params![version, name],
        )
        .map_err(|e| ProdLensError::Storage(e.to_string()))?;
        tx.commit()
            .map_err(|e| ProdLensError::Storage(e.to_string()))?;
        info!("Applied migration v{}: {}", version, name);
    }

    Ok(())
}

/// Highest applied migration version, 0 when none.
pub fn current_version(conn: &Connection) -> Result<i64, ProdLensError> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| ProdLensError::Storage(format!("Failed to query migration version: {}", e)))
}
