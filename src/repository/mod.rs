//! Repository layer for database persistence.

mod catalog;
mod checks;
mod exceptions;
mod mirror;

pub use catalog::{CatalogEntry, CatalogRepository, CrawlerStatus};
pub use checks::{CheckRepository, StatsBucket, StatusCodeCount};
pub use exceptions::{ResourceException, ResourceExceptionRepository};
pub use mirror::{parse_bool, ColumnType, MirrorRepository};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

/// Parse a datetime string from the database, defaulting to Unix epoch on error.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Parse an optional datetime string from the database.
pub fn parse_datetime_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

/// Convert a rusqlite Result<T> to Result<Option<T>>, treating QueryReturnedNoRows as None.
pub fn to_option<T>(result: rusqlite::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Create a database connection with optimized settings for concurrency.
pub fn connect(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;

    // WAL mode persists, so this is effectively a one-time setting per database
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 30000;
        PRAGMA cache_size = -64000;
        PRAGMA temp_store = MEMORY;
    "#,
    )?;

    Ok(conn)
}

/// Create every table the service needs. Safe to run repeatedly.
/// Returns the list of tables present afterwards.
pub fn run_migrations(db_path: &Path) -> Result<Vec<String>> {
    // Creating the repositories runs their init_schema
    let _catalog = CatalogRepository::new(db_path)?;
    let _checks = CheckRepository::new(db_path)?;
    let _exceptions = ResourceExceptionRepository::new(db_path)?;

    let conn = connect(db_path)?;
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name"
    )?;
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();

    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_migrations_creates_tables() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let tables = run_migrations(&db_path).unwrap();
        assert!(tables.contains(&"catalog".to_string()));
        assert!(tables.contains(&"checks".to_string()));
        assert!(tables.contains(&"resources_exceptions".to_string()));
    }

    #[test]
    fn test_parse_datetime_fallback() {
        assert_eq!(parse_datetime("garbage"), DateTime::UNIX_EPOCH);
        let parsed = parse_datetime("2025-03-01T10:00:00+00:00");
        assert_eq!(parsed.to_rfc3339(), "2025-03-01T10:00:00+00:00");
    }
}
