//! Catalog repository: the persistent list of known resources.
//!
//! The scheduler is the only writer of `next_check_at`, `priority` and the
//! streak counters; upstream events mutate identity fields in place and
//! soft-delete via the tombstone flag.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{parse_datetime_opt, to_option, Result};
use crate::models::{Resource, ResourceStatus};

/// SQLite-backed repository for the `catalog` table.
pub struct CatalogRepository {
    db_path: PathBuf,
}

/// Aggregates served by `/api/status/crawler`.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlerStatus {
    pub total: i64,
    pub pending_checks: i64,
    pub fresh_checks: i64,
    pub checks_percentage: f64,
    pub fresh_checks_percentage: f64,
}

/// One entry of a bulk catalog load.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub dataset_id: String,
    pub resource_id: Uuid,
    pub url: String,
}

pub(crate) fn row_to_resource(row: &Row<'_>) -> rusqlite::Result<Resource> {
    let resource_id: String = row.get("resource_id")?;
    let resource_id = Uuid::parse_str(&resource_id).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let status: Option<String> = row.get("status")?;
    Ok(Resource {
        catalog_id: row.get("id")?,
        dataset_id: row.get("dataset_id")?,
        resource_id,
        url: row.get("url")?,
        domain: row.get("domain")?,
        deleted: row.get::<_, i64>("deleted")? != 0,
        priority: row.get::<_, i64>("priority")? != 0,
        initialization: row.get::<_, i64>("initialization")? != 0,
        last_check: row.get("last_check")?,
        next_check_at: parse_datetime_opt(row.get("next_check_at")?),
        harvest_modified_at: parse_datetime_opt(row.get("harvest_modified_at")?),
        status: status.as_deref().and_then(ResourceStatus::from_str),
        unchanged_streak: row.get::<_, i64>("unchanged_streak")? as u32,
        failure_streak: row.get::<_, i64>("failure_streak")? as u32,
    })
}

impl CatalogRepository {
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
            -- One row per known resource
            CREATE TABLE IF NOT EXISTS catalog (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                dataset_id TEXT NOT NULL,
                resource_id TEXT NOT NULL UNIQUE,
                url TEXT NOT NULL,
                domain TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                priority INTEGER NOT NULL DEFAULT 0,
                initialization INTEGER NOT NULL DEFAULT 1,
                status TEXT,
                last_check INTEGER,
                next_check_at TEXT,
                harvest_modified_at TEXT,
                unchanged_streak INTEGER NOT NULL DEFAULT 0,
                failure_streak INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_catalog_next_check
                ON catalog(next_check_at) WHERE deleted = 0;
            CREATE INDEX IF NOT EXISTS idx_catalog_priority
                ON catalog(priority) WHERE priority = 1;
            CREATE INDEX IF NOT EXISTS idx_catalog_url
                ON catalog(url);
        "#,
        )?;
        Ok(())
    }

    /// Insert a resource, or update the existing row in place (URL changes
    /// never create a duplicate). Marks the row priority for the next pick
    /// and clears any tombstone.
    pub fn upsert_resource(
        &self,
        dataset_id: &str,
        resource_id: Uuid,
        url: &str,
        harvest_modified_at: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let conn = self.connect()?;
        let domain = Resource::domain_of(url);
        let id = conn.query_row(
            r#"
            INSERT INTO catalog (dataset_id, resource_id, url, domain, priority, harvest_modified_at)
            VALUES (?1, ?2, ?3, ?4, 1, ?5)
            ON CONFLICT(resource_id) DO UPDATE SET
                dataset_id = excluded.dataset_id,
                url = excluded.url,
                domain = excluded.domain,
                harvest_modified_at = excluded.harvest_modified_at,
                priority = 1,
                deleted = 0
            RETURNING id
            "#,
            params![
                dataset_id,
                resource_id.to_string(),
                url,
                domain,
                harvest_modified_at.map(|d| d.to_rfc3339()),
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Bulk-insert catalog rows, skipping resources already known.
    /// Returns the number of new rows.
    pub fn insert_many(&self, entries: &[CatalogEntry]) -> Result<usize> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT OR IGNORE INTO catalog (dataset_id, resource_id, url, domain)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )?;
            for entry in entries {
                inserted += stmt.execute(params![
                    entry.dataset_id,
                    entry.resource_id.to_string(),
                    entry.url,
                    Resource::domain_of(&entry.url),
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn get(&self, resource_id: Uuid) -> Result<Option<Resource>> {
        let conn = self.connect()?;
        to_option(conn.query_row(
            "SELECT * FROM catalog WHERE resource_id = ?1",
            params![resource_id.to_string()],
            row_to_resource,
        ))
    }

    pub fn get_by_url(&self, url: &str) -> Result<Option<Resource>> {
        let conn = self.connect()?;
        to_option(conn.query_row(
            "SELECT * FROM catalog WHERE url = ?1 ORDER BY id LIMIT 1",
            params![url],
            row_to_resource,
        ))
    }

    /// Mark a resource deleted. Check history stays queryable.
    /// Returns false when the resource is unknown.
    pub fn soft_delete(&self, resource_id: Uuid) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE catalog SET deleted = 1 WHERE resource_id = ?1",
            params![resource_id.to_string()],
        )?;
        Ok(changed > 0)
    }

    pub fn set_status(&self, resource_id: Uuid, status: Option<ResourceStatus>) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE catalog SET status = ?1 WHERE resource_id = ?2",
            params![status.map(|s| s.as_str()), resource_id.to_string()],
        )?;
        Ok(())
    }

    pub fn set_last_check(&self, resource_id: Uuid, check_id: i64) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE catalog SET last_check = ?1 WHERE resource_id = ?2",
            params![check_id, resource_id.to_string()],
        )?;
        Ok(())
    }

    /// Atomically claim up to `limit` eligible resources for probing.
    ///
    /// Eligibility tiers, most urgent first: priority rows, never-probed
    /// rows, then rows whose `next_check_at` has passed (NULL sorts first).
    /// Claimed rows get `priority`/`initialization` cleared and move to
    /// `CRAWLING`, so a second scheduler pass cannot pick them again.
    pub fn claim_batch(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<Resource>> {
        let conn = self.connect()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;

        let result: Result<Vec<Resource>> = (|| {
            let mut stmt = conn.prepare(
                r#"
                SELECT * FROM catalog
                WHERE deleted = 0
                  AND (status IS NULL OR status = 'ANALYSED')
                  AND (priority = 1 OR initialization = 1
                       OR next_check_at IS NULL OR next_check_at <= ?1)
                ORDER BY priority DESC,
                         initialization DESC,
                         (next_check_at IS NOT NULL),
                         next_check_at ASC,
                         resource_id ASC
                LIMIT ?2
                "#,
            )?;
            let resources: Vec<Resource> = stmt
                .query_map(params![now.to_rfc3339(), limit as i64], row_to_resource)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            for resource in &resources {
                conn.execute(
                    "UPDATE catalog SET priority = 0, initialization = 0, status = 'CRAWLING'
                     WHERE resource_id = ?1",
                    params![resource.resource_id.to_string()],
                )?;
            }

            Ok(resources
                .into_iter()
                .map(|mut r| {
                    r.priority = false;
                    r.initialization = false;
                    r.status = Some(ResourceStatus::Crawling);
                    r
                })
                .collect())
        })();

        if result.is_ok() {
            conn.execute_batch("COMMIT")?;
        } else {
            let _ = conn.execute_batch("ROLLBACK");
        }

        result
    }

    /// Claim a single resource for an on-demand probe. Fails when the
    /// resource is mid-pipeline (non-terminal status), keeping at most one
    /// probe in flight per resource.
    pub fn claim_for_probe(&self, resource_id: Uuid) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn.execute(
            r#"
            UPDATE catalog
            SET priority = 0, initialization = 0, status = 'CRAWLING'
            WHERE resource_id = ?1 AND deleted = 0
              AND (status IS NULL OR status = 'ANALYSED')
            "#,
            params![resource_id.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// Drop claims that never completed (process shutdown). The rows keep
    /// their previous `next_check_at`, so no probe is lost.
    pub fn release_crawling(&self) -> Result<usize> {
        let conn = self.connect()?;
        Ok(conn.execute(
            "UPDATE catalog SET status = NULL WHERE status = 'CRAWLING'",
            [],
        )?)
    }

    /// Persist the scheduling decision for a resource.
    pub fn schedule_next(
        &self,
        resource_id: Uuid,
        next_check_at: DateTime<Utc>,
        unchanged_streak: u32,
        failure_streak: u32,
    ) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            UPDATE catalog
            SET next_check_at = ?1, unchanged_streak = ?2, failure_streak = ?3
            WHERE resource_id = ?4
            "#,
            params![
                next_check_at.to_rfc3339(),
                unchanged_streak,
                failure_streak,
                resource_id.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Aggregates for `/api/status/crawler`.
    pub fn crawler_status(&self, now: DateTime<Utc>) -> Result<CrawlerStatus> {
        let conn = self.connect()?;
        let now_str = now.to_rfc3339();
        let (total, checked, pending): (i64, i64, i64) = conn.query_row(
            r#"
            SELECT COUNT(*),
                   COUNT(last_check),
                   SUM(CASE WHEN last_check IS NULL
                             OR next_check_at IS NULL
                             OR next_check_at <= ?1
                        THEN 1 ELSE 0 END)
            FROM catalog WHERE deleted = 0
            "#,
            params![now_str],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                ))
            },
        )?;
        let fresh = total - pending;
        Ok(CrawlerStatus {
            total,
            pending_checks: pending,
            fresh_checks: fresh,
            checks_percentage: percentage(checked, total),
            fresh_checks_percentage: percentage(fresh, total),
        })
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
    use chrono::Duration;

    fn repo() -> (CatalogRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let repo = CatalogRepository::new(&dir.path().join("test.db")).unwrap();
        (repo, dir)
    }

    fn add(repo: &CatalogRepository, url: &str) -> Uuid {
        let resource_id = Uuid::new_v4();
        repo.upsert_resource("d1", resource_id, url, None).unwrap();
        resource_id
    }

    #[test]
    fn test_upsert_updates_in_place() {
        let (repo, _dir) = repo();
        let resource_id = add(&repo, "https://example.com/a.csv");
        let first = repo.get(resource_id).unwrap().unwrap();

        repo.upsert_resource("d1", resource_id, "https://example.com/b.csv", None)
            .unwrap();
        let second = repo.get(resource_id).unwrap().unwrap();
        assert_eq!(first.catalog_id, second.catalog_id);
        assert_eq!(second.url, "https://example.com/b.csv");
        assert!(second.priority);
    }

    #[test]
    fn test_claim_batch_tiers_and_exclusions() {
        let (repo, _dir) = repo();
        let now = Utc::now();

        // due row
        let due = add(&repo, "https://a.example.com/1");
        repo.set_status(due, None).unwrap();
        repo.schedule_next(due, now - Duration::hours(1), 0, 0).unwrap();
        // future row, not eligible
        let future = add(&repo, "https://a.example.com/2");
        repo.schedule_next(future, now + Duration::hours(1), 0, 0)
            .unwrap();
        // upsert marks rows priority/initialization; clear both so these
        // two rows compete on next_check_at alone
        {
            let conn = repo.connect().unwrap();
            conn.execute(
                "UPDATE catalog SET initialization = 0, priority = 0 WHERE resource_id IN (?1, ?2)",
                params![due.to_string(), future.to_string()],
            )
            .unwrap();
        }
        // priority row wins the first slot
        let prio = add(&repo, "https://b.example.com/3");
        // deleted row never selected
        let gone = add(&repo, "https://b.example.com/4");
        repo.soft_delete(gone).unwrap();

        let batch = repo.claim_batch(10, now).unwrap();
        let ids: Vec<Uuid> = batch.iter().map(|r| r.resource_id).collect();
        assert_eq!(ids.first(), Some(&prio));
        assert!(ids.contains(&due));
        assert!(!ids.contains(&future));
        assert!(!ids.contains(&gone));

        // claimed rows are CRAWLING and not re-claimable
        let again = repo.claim_batch(10, now).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_release_crawling() {
        let (repo, _dir) = repo();
        let resource_id = add(&repo, "https://example.com/a");
        repo.claim_batch(1, Utc::now()).unwrap();
        assert_eq!(
            repo.get(resource_id).unwrap().unwrap().status,
            Some(crate::models::ResourceStatus::Crawling)
        );
        assert_eq!(repo.release_crawling().unwrap(), 1);
        assert_eq!(repo.get(resource_id).unwrap().unwrap().status, None);
    }

    #[test]
    fn test_crawler_status_percentages() {
        let (repo, _dir) = repo();
        let now = Utc::now();
        let resource_id = add(&repo, "https://example.com/a");

        let status = repo.crawler_status(now).unwrap();
        assert_eq!(status.total, 1);
        assert_eq!(status.pending_checks, 1);
        assert_eq!(status.fresh_checks, 0);
        assert_eq!(status.checks_percentage, 0.0);
        assert_eq!(status.fresh_checks_percentage, 0.0);

        repo.set_last_check(resource_id, 1).unwrap();
        repo.schedule_next(resource_id, now + Duration::days(7), 0, 0)
            .unwrap();
        let status = repo.crawler_status(now).unwrap();
        assert_eq!(status.pending_checks, 0);
        assert_eq!(status.fresh_checks, 1);
        assert_eq!(status.checks_percentage, 100.0);
        assert_eq!(status.fresh_checks_percentage, 100.0);
    }
}
