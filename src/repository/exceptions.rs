//! Resource exceptions: size-cap overrides with custom mirror-table indexes.
//!
//! All statements are parameterized; the `table_indexes` mapping travels as
//! a JSON text column.

use std::collections::HashMap;

use rusqlite::params;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{to_option, Result};

/// One row of the `resources_exceptions` table.
#[derive(Debug, Clone)]
pub struct ResourceException {
    pub resource_id: Uuid,
    /// Column name -> index kind, from the supported closed set.
    pub table_indexes: HashMap<String, String>,
    pub comment: Option<String>,
}

/// SQLite-backed repository for the `resources_exceptions` table.
pub struct ResourceExceptionRepository {
    db_path: PathBuf,
}

impl ResourceExceptionRepository {
    pub fn new(db_path: &Path) -> Result<Self> {
        let repo = Self {
            db_path: db_path.to_path_buf(),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    fn connect(&self) -> Result<rusqlite::Connection> {
        super::connect(&self.db_path)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            -- Resources exempt from the per-format size ceiling
            CREATE TABLE IF NOT EXISTS resources_exceptions (
                resource_id TEXT PRIMARY KEY,
                table_indexes TEXT NOT NULL DEFAULT '{}',
                comment TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
        "#,
        )?;
        Ok(())
    }

    pub fn get(&self, resource_id: Uuid) -> Result<Option<ResourceException>> {
        let conn = self.connect()?;
        to_option(conn.query_row(
            "SELECT resource_id, table_indexes, comment FROM resources_exceptions
             WHERE resource_id = ?1",
            params![resource_id.to_string()],
            |row| {
                let raw: String = row.get(1)?;
                Ok(ResourceException {
                    resource_id,
                    table_indexes: serde_json::from_str(&raw).unwrap_or_default(),
                    comment: row.get(2)?,
                })
            },
        ))
    }

    pub fn get_all(&self) -> Result<Vec<ResourceException>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT resource_id, table_indexes, comment FROM resources_exceptions
             ORDER BY resource_id",
        )?;
        let exceptions = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let resource_id = Uuid::parse_str(&id).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;
                let raw: String = row.get(1)?;
                Ok(ResourceException {
                    resource_id,
                    table_indexes: serde_json::from_str(&raw).unwrap_or_default(),
                    comment: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(exceptions)
    }

    pub fn insert(
        &self,
        resource_id: Uuid,
        table_indexes: &HashMap<String, String>,
        comment: Option<&str>,
    ) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO resources_exceptions (resource_id, table_indexes, comment)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(resource_id) DO UPDATE SET
                table_indexes = excluded.table_indexes,
                comment = excluded.comment
            "#,
            params![
                resource_id.to_string(),
                serde_json::to_string(table_indexes)?,
                comment,
            ],
        )?;
        Ok(())
    }

    /// Returns false when no exception existed.
    pub fn delete(&self, resource_id: Uuid) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "DELETE FROM resources_exceptions WHERE resource_id = ?1",
            params![resource_id.to_string()],
        )?;
        Ok(changed > 0)
    }
}
