//! SQLite pool setup and the embedded schema migration.

use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::path::Path;

const INIT_MIGRATION: &str = include_str!("../migrations/0001_init.sql");

/// Open a pool for `database_url`, creating the parent directory of a
/// file-backed database if needed.
pub async fn connect(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let db_path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    let in_memory = db_path.starts_with(":memory:");
    if !in_memory {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
    }

    let url = if in_memory || database_url.contains("mode=") {
        database_url.to_string()
    } else {
        // Let SQLite create the file on first start.
        let separator = if database_url.contains('?') { '&' } else { '?' };
        format!("{}{}mode=rwc", database_url, separator)
    };

    // An in-memory database exists per connection; keep exactly one.
    let max_connections = if in_memory { 1 } else { 5 };
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(&url)
        .await
}

/// Apply the embedded schema. Every statement is idempotent.
pub async fn run_migrations(db: &SqlitePool) -> Result<(), sqlx::Error> {
    let statements = INIT_MIGRATION
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}
