//! Mirror tables: per-resource relational copies of parsed tabular payloads.
//!
//! Table names are computed server-side (md5 of the resource URL, 32 hex
//! chars) and validated before entering DDL; column identifiers are quoted.
//! DDL cannot take bound parameters, so identifier hygiene is the contract
//! here; cell values always go through bound parameters.

use std::collections::HashMap;

use rusqlite::types::Value;
use std::path::{Path, PathBuf};

use super::{RepositoryError, Result};

/// Inferred column type of a mirror table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Boolean,
}

impl ColumnType {
    fn sqlite_type(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Integer => "INTEGER",
            Self::Float => "REAL",
            Self::Boolean => "INTEGER",
        }
    }

    /// Bind a raw CSV cell according to the inferred type. Cells that no
    /// longer fit the inferred type are kept as text rather than dropped.
    fn bind(&self, raw: &str) -> Value {
        match self {
            Self::Text => Value::Text(raw.to_string()),
            Self::Integer => match raw.trim().parse::<i64>() {
                Ok(n) => Value::Integer(n),
                Err(_) => Value::Text(raw.to_string()),
            },
            Self::Float => match raw.trim().parse::<f64>() {
                Ok(f) => Value::Real(f),
                Err(_) => Value::Text(raw.to_string()),
            },
            Self::Boolean => match parse_bool(raw) {
                Some(b) => Value::Integer(b as i64),
                None => Value::Text(raw.to_string()),
            },
        }
    }
}

/// Accepted boolean spellings in tabular data.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "t" | "yes" | "1" => Some(true),
        "false" | "f" | "no" | "0" => Some(false),
        _ => None,
    }
}

/// SQLite-backed store for mirror tables. Shares the service database.
pub struct MirrorRepository {
    db_path: PathBuf,
}

impl MirrorRepository {
    pub fn new(db_path: &Path) -> Result<Self> {
        Ok(Self {
            db_path: db_path.to_path_buf(),
        })
    }

    fn connect(&self) -> Result<rusqlite::Connection> {
        super::connect(&self.db_path)
    }

    /// Recreate the mirror table for a resource from an inferred schema.
    pub fn create_table(&self, table: &str, columns: &[(String, ColumnType)]) -> Result<()> {
        validate_table_name(table)?;
        let conn = self.connect()?;
        let column_defs: Vec<String> = columns
            .iter()
            .map(|(name, kind)| format!("{} {}", quote_ident(name), kind.sqlite_type()))
            .collect();
        conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS {t};\nCREATE TABLE {t} ({cols});",
            t = quote_ident(table),
            cols = column_defs.join(", "),
        ))?;
        Ok(())
    }

    /// Load rows into a mirror table inside one transaction.
    /// Returns the number of rows inserted.
    pub fn insert_rows<I>(
        &self,
        table: &str,
        columns: &[(String, ColumnType)],
        rows: I,
    ) -> Result<usize>
    where
        I: IntoIterator<Item = Vec<Option<String>>>,
    {
        validate_table_name(table)?;
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let placeholders: Vec<String> =
                (1..=columns.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(table),
                columns
                    .iter()
                    .map(|(name, _)| quote_ident(name))
                    .collect::<Vec<_>>()
                    .join(", "),
                placeholders.join(", "),
            );
            let mut stmt = tx.prepare(&sql)?;
            for row in rows {
                let values: Vec<Value> = columns
                    .iter()
                    .zip(row.iter().chain(std::iter::repeat(&None)))
                    .map(|((_, kind), cell)| match cell {
                        Some(raw) if !raw.is_empty() => kind.bind(raw),
                        _ => Value::Null,
                    })
                    .collect();
                stmt.execute(rusqlite::params_from_iter(values))?;
                inserted += 1;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Create the indexes requested by a resource exception. Kinds must
    /// already be validated against the supported set; unknown columns are
    /// skipped.
    pub fn apply_indexes(
        &self,
        table: &str,
        columns: &[(String, ColumnType)],
        indexes: &HashMap<String, String>,
    ) -> Result<()> {
        validate_table_name(table)?;
        let conn = self.connect()?;
        for (idx, (column, kind)) in indexes.iter().enumerate() {
            if !columns.iter().any(|(name, _)| name == column) {
                tracing::warn!(
                    "Skipping index on unknown column {} of table {}",
                    column,
                    table
                );
                continue;
            }
            let unique = if kind == "unique" { "UNIQUE " } else { "" };
            conn.execute_batch(&format!(
                "CREATE {unique}INDEX IF NOT EXISTS {name} ON {table} ({column});",
                unique = unique,
                name = quote_ident(&format!("idx_{}_{}", table, idx)),
                table = quote_ident(table),
                column = quote_ident(column),
            ))?;
        }
        Ok(())
    }

    pub fn drop_table(&self, table: &str) -> Result<()> {
        validate_table_name(table)?;
        let conn = self.connect()?;
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", quote_ident(table)))?;
        Ok(())
    }

    pub fn row_count(&self, table: &str) -> Result<i64> {
        validate_table_name(table)?;
        let conn = self.connect()?;
        let count = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

/// Mirror-table names are md5 hex digests, nothing else reaches DDL.
fn validate_table_name(table: &str) -> Result<()> {
    if table.len() == 32 && table.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(RepositoryError::InvalidIdentifier(table.to_string()))
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
