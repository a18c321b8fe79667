//! Check repository: the append-only probe log.
//!
//! The prober appends rows; the analysis pipeline fills the
//! checksum/mime/parsing columns on the same row later. Nothing is ever
//! deleted and the probe-outcome columns are never rewritten.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{parse_datetime, parse_datetime_opt, to_option, Result};
use crate::models::{Check, NewCheck};

/// SQLite-backed repository for the `checks` table.
pub struct CheckRepository {
    db_path: PathBuf,
}

/// One status bucket of `/api/stats`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsBucket {
    pub label: &'static str,
    pub count: i64,
    pub percentage: f64,
}

/// One HTTP status code row of `/api/stats`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusCodeCount {
    pub code: u16,
    pub count: i64,
    pub percentage: f64,
}

fn row_to_check(row: &Row<'_>) -> rusqlite::Result<Check> {
    let resource_id: String = row.get("resource_id")?;
    let resource_id = Uuid::parse_str(&resource_id).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let headers_raw: String = row.get("headers")?;
    let headers: HashMap<String, String> = serde_json::from_str(&headers_raw).unwrap_or_default();
    let created_at: String = row.get("created_at")?;
    Ok(Check {
        id: row.get("id")?,
        catalog_id: row.get("catalog_id")?,
        resource_id,
        dataset_id: row.get("dataset_id")?,
        url: row.get("url")?,
        domain: row.get("domain")?,
        created_at: parse_datetime(&created_at),
        status: row.get::<_, Option<i64>>("status")?.map(|s| s as u16),
        timeout: row.get::<_, i64>("timeout")? != 0,
        response_time: row.get("response_time")?,
        error: row.get("error")?,
        headers,
        checksum: row.get("checksum")?,
        filesize: row.get("filesize")?,
        mime_type: row.get("mime_type")?,
        analysis_error: row.get("analysis_error")?,
        detected_last_modified_at: parse_datetime_opt(row.get("detected_last_modified_at")?),
        next_check_at: parse_datetime_opt(row.get("next_check_at")?),
        parsing_started_at: parse_datetime_opt(row.get("parsing_started_at")?),
        parsing_finished_at: parse_datetime_opt(row.get("parsing_finished_at")?),
        parsing_error: row.get("parsing_error")?,
        parsing_table: row.get("parsing_table")?,
    })
}

impl CheckRepository {
    pub fn new(db_path: &Path) -> Result<Self> {
        let repo = Self {
            db_path: db_path.to_path_buf(),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    pub(crate) fn connect(&self) -> Result<rusqlite::Connection> {
        super::connect(&self.db_path)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            -- Append-only probe log
            CREATE TABLE IF NOT EXISTS checks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                catalog_id INTEGER NOT NULL,
                resource_id TEXT NOT NULL,
                dataset_id TEXT NOT NULL,
                url TEXT NOT NULL,
                domain TEXT NOT NULL,
                created_at TEXT NOT NULL,
                status INTEGER,
                timeout INTEGER NOT NULL DEFAULT 0,
                response_time REAL,
                error TEXT,
                headers TEXT NOT NULL DEFAULT '{}',

                -- filled by the analysis pipeline
                checksum TEXT,
                filesize INTEGER,
                mime_type TEXT,
                analysis_error TEXT,
                detected_last_modified_at TEXT,
                next_check_at TEXT,
                parsing_started_at TEXT,
                parsing_finished_at TEXT,
                parsing_error TEXT,
                parsing_table TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_checks_resource
                ON checks(resource_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_checks_url
                ON checks(url);
            CREATE INDEX IF NOT EXISTS idx_checks_domain
                ON checks(domain);
        "#,
        )?;
        Ok(())
    }

    /// Append a probe outcome. Returns the new row id.
    pub fn insert(&self, check: &NewCheck, created_at: DateTime<Utc>) -> Result<i64> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO checks (catalog_id, resource_id, dataset_id, url, domain,
                                created_at, status, timeout, response_time, error, headers)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                check.catalog_id,
                check.resource_id.to_string(),
                check.dataset_id,
                check.url,
                check.domain,
                created_at.to_rfc3339(),
                check.status.map(|s| s as i64),
                check.timeout as i64,
                check.response_time,
                check.error,
                serde_json::to_string(&check.headers)?,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get(&self, check_id: i64) -> Result<Option<Check>> {
        let conn = self.connect()?;
        to_option(conn.query_row(
            "SELECT * FROM checks WHERE id = ?1",
            params![check_id],
            row_to_check,
        ))
    }

    pub fn latest_for_resource(&self, resource_id: Uuid) -> Result<Option<Check>> {
        let conn = self.connect()?;
        to_option(conn.query_row(
            "SELECT * FROM checks WHERE resource_id = ?1 ORDER BY created_at DESC, id DESC LIMIT 1",
            params![resource_id.to_string()],
            row_to_check,
        ))
    }

    /// All checks for a resource, newest first.
    pub fn all_for_resource(&self, resource_id: Uuid) -> Result<Vec<Check>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM checks WHERE resource_id = ?1 ORDER BY created_at DESC, id DESC",
        )?;
        let checks = stmt
            .query_map(params![resource_id.to_string()], row_to_check)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(checks)
    }

    /// The two most recent checks (current first), feeding the detection
    /// cascade.
    pub fn last_two(&self, resource_id: Uuid) -> Result<Vec<Check>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM checks WHERE resource_id = ?1 ORDER BY created_at DESC, id DESC LIMIT 2",
        )?;
        let checks = stmt
            .query_map(params![resource_id.to_string()], row_to_check)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(checks)
    }

    /// Record download analysis results on the check row.
    pub fn update_analysis(
        &self,
        check_id: i64,
        checksum: Option<&str>,
        analysis_error: Option<&str>,
        filesize: Option<i64>,
        mime_type: Option<&str>,
    ) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            UPDATE checks
            SET checksum = ?1, analysis_error = ?2, filesize = ?3, mime_type = ?4
            WHERE id = ?5
            "#,
            params![checksum, analysis_error, filesize, mime_type, check_id],
        )?;
        Ok(())
    }

    /// Record the detected modification date and the planned next check.
    pub fn update_modification_dates(
        &self,
        check_id: i64,
        detected_last_modified_at: DateTime<Utc>,
        next_check_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE checks SET detected_last_modified_at = ?1, next_check_at = ?2 WHERE id = ?3",
            params![
                detected_last_modified_at.to_rfc3339(),
                next_check_at.to_rfc3339(),
                check_id,
            ],
        )?;
        Ok(())
    }

    pub fn start_parsing(&self, check_id: i64, at: DateTime<Utc>) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE checks SET parsing_started_at = ?1, parsing_finished_at = NULL,
             parsing_error = NULL, parsing_table = NULL WHERE id = ?2",
            params![at.to_rfc3339(), check_id],
        )?;
        Ok(())
    }

    pub fn finish_parsing(&self, check_id: i64, at: DateTime<Utc>, table: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE checks SET parsing_finished_at = ?1, parsing_table = ?2 WHERE id = ?3",
            params![at.to_rfc3339(), table, check_id],
        )?;
        Ok(())
    }

    pub fn fail_parsing(&self, check_id: i64, at: DateTime<Utc>, error: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE checks SET parsing_finished_at = ?1, parsing_error = ?2 WHERE id = ?3",
            params![at.to_rfc3339(), error, check_id],
        )?;
        Ok(())
    }

    /// `/api/stats` aggregates. Only each resource's latest check counts.
    pub fn stats(&self) -> Result<(Vec<StatsBucket>, Vec<StatusCodeCount>)> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT c.status, c.timeout, c.error
            FROM checks c
            JOIN catalog cat ON cat.last_check = c.id
            WHERE cat.deleted = 0
            "#,
        )?;
        let rows: Vec<(Option<i64>, bool, Option<String>)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get::<_, i64>(1)? != 0,
                    row.get(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let total = rows.len() as i64;
        let mut errors = 0i64;
        let mut timeouts = 0i64;
        let mut oks = 0i64;
        let mut codes: HashMap<u16, i64> = HashMap::new();

        for (status, timeout, error) in &rows {
            if let Some(code) = status {
                *codes.entry(*code as u16).or_insert(0) += 1;
            }
            if *timeout {
                timeouts += 1;
            } else if error.is_some() || status.is_none() || status.unwrap_or(0) >= 400 {
                errors += 1;
            } else {
                oks += 1;
            }
        }

        let buckets = vec![
            StatsBucket {
                label: "error",
                count: errors,
                percentage: percentage(errors, total),
            },
            StatsBucket {
                label: "timeout",
                count: timeouts,
                percentage: percentage(timeouts, total),
            },
            StatsBucket {
                label: "ok",
                count: oks,
                percentage: percentage(oks, total),
            },
        ];

        let mut status_codes: Vec<StatusCodeCount> = codes
            .into_iter()
            .map(|(code, count)| StatusCodeCount {
                code,
                count,
                percentage: percentage(count, total),
            })
            .collect();
        status_codes.sort_by(|a, b| b.count.cmp(&a.count).then(a.code.cmp(&b.code)));

        Ok((buckets, status_codes))
    }
}

fn percentage(part: i64, total: i64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (part as f64 * 1000.0 / total as f64).round() / 10.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::CatalogRepository;

    fn setup() -> (CatalogRepository, CheckRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let catalog = CatalogRepository::new(&db_path).unwrap();
        let checks = CheckRepository::new(&db_path).unwrap();
        (catalog, checks, dir)
    }

    fn new_check(resource_id: Uuid, status: Option<u16>, timeout: bool) -> NewCheck {
        NewCheck {
            catalog_id: 1,
            resource_id,
            dataset_id: "d1".to_string(),
            url: "https://example.com/resource-1".to_string(),
            domain: "example.com".to_string(),
            status,
            timeout,
            response_time: Some(0.1),
            error: if status.map(|s| s >= 500).unwrap_or(false) {
                Some("Internal Server Error".to_string())
            } else {
                None
            },
            headers: HashMap::new(),
        }
    }

    #[test]
    fn test_insert_and_fetch_ordering() {
        let (_catalog, checks, _dir) = setup();
        let resource_id = Uuid::new_v4();
        let t0 = Utc::now();
        checks
            .insert(&new_check(resource_id, Some(500), false), t0)
            .unwrap();
        checks
            .insert(
                &new_check(resource_id, Some(200), false),
                t0 + chrono::Duration::seconds(1),
            )
            .unwrap();

        let latest = checks.latest_for_resource(resource_id).unwrap().unwrap();
        assert_eq!(latest.status, Some(200));

        let all = checks.all_for_resource(resource_id).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].status, Some(200));
        assert_eq!(all[1].status, Some(500));
        assert_eq!(all[1].error.as_deref(), Some("Internal Server Error"));
    }

    #[test]
    fn test_stats_only_latest_check_counts() {
        let (catalog, checks, _dir) = setup();
        let resource_id = Uuid::new_v4();
        catalog
            .upsert_resource("d1", resource_id, "https://example.com/resource-1", None)
            .unwrap();

        let t0 = Utc::now();
        let ok = checks
            .insert(&new_check(resource_id, Some(200), false), t0)
            .unwrap();
        catalog.set_last_check(resource_id, ok).unwrap();
        let to = checks
            .insert(
                &new_check(resource_id, None, true),
                t0 + chrono::Duration::seconds(1),
            )
            .unwrap();
        catalog.set_last_check(resource_id, to).unwrap();
        let err = checks
            .insert(
                &new_check(resource_id, Some(500), false),
                t0 + chrono::Duration::seconds(2),
            )
            .unwrap();
        catalog.set_last_check(resource_id, err).unwrap();

        let (buckets, status_codes) = checks.stats().unwrap();
        assert_eq!(
            buckets,
            vec![
                StatsBucket { label: "error", count: 1, percentage: 100.0 },
                StatsBucket { label: "timeout", count: 0, percentage: 0.0 },
                StatsBucket { label: "ok", count: 0, percentage: 0.0 },
            ]
        );
        assert_eq!(
            status_codes,
            vec![StatusCodeCount { code: 500, count: 1, percentage: 100.0 }]
        );
    }

    #[test]
    fn test_parsing_bookkeeping() {
        let (_catalog, checks, _dir) = setup();
        let resource_id = Uuid::new_v4();
        let id = checks
            .insert(&new_check(resource_id, Some(200), false), Utc::now())
            .unwrap();

        let started = Utc::now();
        checks.start_parsing(id, started).unwrap();
        checks
            .finish_parsing(id, started + chrono::Duration::seconds(2), "abcdef")
            .unwrap();
        let check = checks.get(id).unwrap().unwrap();
        assert!(check.parsing_started_at.is_some());
        assert_eq!(check.parsing_table.as_deref(), Some("abcdef"));
        assert!(check.parsing_error.is_none());
    }
}
