//! Deferred analysis pipeline.
//!
//! Runs off the work queue after a successful probe: downloads the
//! resource under a size cap, computes content metadata, upgrades the
//! change verdict from the checksum when headers were inconclusive, hands
//! tabular payloads to the CSV ingester and notifies the upstream catalog.
//! Handlers refetch rows before writing and are idempotent, matching the
//! queue's at-least-once delivery.

pub mod change;
pub mod csv;
pub mod download;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::crawl::{NextCheckPolicy, ScheduleVerdict};
use crate::models::{Change, ChangeDetection, ResourceStatus};
use crate::queue::{JobKind, Priority, WorkQueue};
use crate::repository::{
    CatalogEntry, CatalogRepository, CheckRepository, MirrorRepository,
    ResourceExceptionRepository,
};
use crate::utils::mime::{detect_tabular_from_headers, format_for_cap, sniff_mime_from_file};
use crate::utils::compute_checksum_from_file;
use crate::webhook::WebhookSender;

/// Analysis worker dependencies, shared across the pool.
pub struct Analyser {
    pub catalog: Arc<CatalogRepository>,
    pub checks: Arc<CheckRepository>,
    pub exceptions: Arc<ResourceExceptionRepository>,
    pub mirror: Arc<MirrorRepository>,
    pub queue: Arc<WorkQueue>,
    pub webhook: Arc<WebhookSender>,
    pub policy: Arc<NextCheckPolicy>,
    pub settings: Arc<Settings>,
    client: reqwest::Client,
}

impl Analyser {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<CatalogRepository>,
        checks: Arc<CheckRepository>,
        exceptions: Arc<ResourceExceptionRepository>,
        mirror: Arc<MirrorRepository>,
        queue: Arc<WorkQueue>,
        webhook: Arc<WebhookSender>,
        policy: Arc<NextCheckPolicy>,
        settings: Arc<Settings>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&settings.crawl.user_agent)
            .connect_timeout(settings.connect_timeout())
            .gzip(false)
            .build()?;
        Ok(Self {
            catalog,
            checks,
            exceptions,
            mirror,
            queue,
            webhook,
            policy,
            settings,
            client,
        })
    }

    /// Dispatch one queue job.
    pub async fn handle(&self, kind: &JobKind) -> anyhow::Result<()> {
        match kind {
            JobKind::AnalyseResource { check_id, force } => {
                self.analyse_resource(*check_id, *force).await
            }
            JobKind::IngestCsv {
                check_id,
                file_path,
                gzipped,
            } => self.ingest_csv(*check_id, file_path, *gzipped).await,
            JobKind::SendWebhook {
                dataset_id,
                resource_id,
                document,
            } => self.webhook.send(dataset_id, *resource_id, document).await,
            JobKind::RefreshCatalog { path } => self.refresh_catalog(path),
        }
    }

    /// Analyse the resource a probe was run for: change verdict, optional
    /// download, content metadata, CSV handoff and upstream notification.
    pub async fn analyse_resource(&self, check_id: i64, force: bool) -> anyhow::Result<()> {
        let Some(check) = self.checks.get(check_id)? else {
            warn!("Analysis job for unknown check {}", check_id);
            return Ok(());
        };
        let Some(resource) = self.catalog.get(check.resource_id)? else {
            return Ok(());
        };
        if resource.deleted {
            self.catalog.set_status(resource.resource_id, None)?;
            return Ok(());
        }

        debug!(
            "Analysis for resource {} in dataset {}",
            resource.resource_id, resource.dataset_id
        );
        self.catalog
            .set_status(resource.resource_id, Some(ResourceStatus::AnalysingResource))?;

        let exception = self.exceptions.get(check.resource_id)?;
        let history = self.checks.last_two(check.resource_id)?;
        let previous = history.iter().find(|c| c.id != check.id).cloned();

        let (mut change_status, mut change_payload) =
            change::detect_on_early_hints(&resource, &check, previous.as_ref());

        let hint = detect_tabular_from_headers(&check.headers);
        let max_size = if exception.is_some() {
            None
        } else {
            Some(self.settings.max_filesize_for(format_for_cap(hint)))
        };

        let mut dl_error: Option<String> = None;
        let mut checksum: Option<String> = None;
        let mut filesize: Option<i64> = None;
        let mut mime_type: Option<String> = None;
        let mut tmp_file: Option<tempfile::NamedTempFile> = None;

        if change_status != Change::HasNotChanged || force {
            match download::download_resource(&self.client, &check.url, max_size).await {
                Err(download::DownloadError::TooLarge) => {
                    dl_error = Some("File too large to download".to_string());
                }
                Err(e) => {
                    dl_error = Some(e.to_string());
                }
                Ok(file) => {
                    filesize = Some(file.as_file().metadata()?.len() as i64);
                    let sum = compute_checksum_from_file(file.path())?;
                    if change_status == Change::NoGuess {
                        let (status, payload) =
                            change::detect_from_checksum(&sum, previous.as_ref(), Utc::now());
                        if status != Change::NoGuess {
                            change_status = status;
                            change_payload = payload;
                        }
                    }
                    checksum = Some(sum);
                    mime_type = Some(sniff_mime_from_file(file.path())?);
                    tmp_file = Some(file);
                }
            }
            self.checks.update_analysis(
                check_id,
                checksum.as_deref(),
                dl_error.as_deref(),
                filesize,
                mime_type.as_deref(),
            )?;
        }

        // date the next probe; a bare content-length flip cannot date the
        // change, so it falls back to the base interval
        let verdict = match change_status {
            Change::HasChanged => ScheduleVerdict::Changed {
                last_modified_at: change_payload.as_ref().map(|p| p.last_modified_at),
                reliable: change_payload
                    .as_ref()
                    .map(|p| p.detection != ChangeDetection::ContentLengthHeader)
                    .unwrap_or(false),
            },
            Change::HasNotChanged => ScheduleVerdict::Unchanged,
            Change::NoGuess => ScheduleVerdict::Inconclusive,
        };
        let plan = self.policy.plan(
            Utc::now(),
            verdict,
            resource.unchanged_streak,
            resource.failure_streak,
        );
        self.catalog.schedule_next(
            resource.resource_id,
            plan.next_check_at,
            plan.unchanged_streak,
            plan.failure_streak,
        )?;
        if let Some(payload) = &change_payload {
            self.checks.update_modification_dates(
                check_id,
                payload.last_modified_at,
                plan.next_check_at,
            )?;
        }

        let mut analysis_keys = Map::new();
        if let Some(size) = filesize {
            analysis_keys.insert("analysis:content-length".to_string(), json!(size));
        }
        if let Some(sum) = &checksum {
            analysis_keys.insert("analysis:checksum".to_string(), json!(sum));
        }
        if let Some(mime) = &mime_type {
            analysis_keys.insert("analysis:mime-type".to_string(), json!(mime));
        }
        if let Some(error) = &dl_error {
            analysis_keys.insert("analysis:error".to_string(), json!(error));
        }
        if let Some(payload) = &change_payload {
            analysis_keys.extend(payload.to_analysis_keys());
        }

        let first_check = previous.is_none();
        if change_status == Change::HasChanged || first_check || force {
            if let Some(file) = tmp_file.take().filter(|_| hint.is_tabular()) {
                self.catalog
                    .set_status(resource.resource_id, Some(ResourceStatus::ToAnalyseCsv))?;
                // keep the temp file alive for the ingest job
                let kept: PathBuf = file
                    .into_temp_path()
                    .keep()
                    .map_err(|e| anyhow::anyhow!("keeping temp file: {}", e))?;
                self.queue.push(
                    JobKind::IngestCsv {
                        check_id,
                        file_path: kept,
                        gzipped: hint.binary,
                    },
                    Priority::Default,
                );
            } else {
                // non-tabular payloads (or failed downloads) end the cycle;
                // any leftover temp file was dropped by the take above
                self.catalog.set_status(resource.resource_id, None)?;
            }

            // the probe already reported check:* keys; this document carries
            // the analysis results
            self.queue.push(
                JobKind::SendWebhook {
                    dataset_id: resource.dataset_id.clone(),
                    resource_id: resource.resource_id,
                    document: serde_json::Value::Object(analysis_keys),
                },
                Priority::High,
            );
        } else {
            self.catalog.set_status(resource.resource_id, None)?;
        }

        Ok(())
    }

    /// Ingest a downloaded tabular file into its mirror table.
    pub async fn ingest_csv(
        &self,
        check_id: i64,
        file_path: &Path,
        gzipped: bool,
    ) -> anyhow::Result<()> {
        let Some(check) = self.checks.get(check_id)? else {
            let _ = std::fs::remove_file(file_path);
            return Ok(());
        };

        self.catalog
            .set_status(check.resource_id, Some(ResourceStatus::AnalysingCsv))?;
        self.checks.start_parsing(check_id, Utc::now())?;

        let table_indexes = self
            .exceptions
            .get(check.resource_id)?
            .map(|e| e.table_indexes);

        let mirror = self.mirror.clone();
        let url = check.url.clone();
        let path = file_path.to_path_buf();
        let lookahead = self.settings.analysis.csv_lookahead_rows;
        let sniff_bytes = self.settings.analysis.csv_sniff_bytes;
        let result = tokio::task::spawn_blocking(move || {
            csv::parse_into_mirror(
                &mirror,
                table_indexes.as_ref(),
                &url,
                &path,
                gzipped,
                lookahead,
                sniff_bytes,
            )
        })
        .await?;

        match result {
            Ok((table, rows)) => {
                info!(
                    "Parsed {} rows of resource {} into {}",
                    rows, check.resource_id, table
                );
                self.checks.finish_parsing(check_id, Utc::now(), &table)?;
                self.catalog
                    .set_status(check.resource_id, Some(ResourceStatus::Analysed))?;
            }
            Err(e) => {
                warn!("CSV parsing failed for resource {}: {}", check.resource_id, e);
                self.checks.fail_parsing(check_id, Utc::now(), &e.to_string())?;
                self.catalog.set_status(check.resource_id, None)?;
            }
        }

        let _ = std::fs::remove_file(file_path);
        Ok(())
    }

    /// Low-priority catalog refresh: merge a catalog dump, keeping known
    /// rows untouched.
    fn refresh_catalog(&self, path: &Path) -> anyhow::Result<()> {
        let entries = read_catalog_file(path)?;
        let inserted = self.catalog.insert_many(&entries)?;
        info!(
            "Catalog refresh from {}: {} new of {} listed",
            path.display(),
            inserted,
            entries.len()
        );
        Ok(())
    }
}

/// Read a catalog dump: CSV with `dataset_id,resource_id,url` columns.
pub fn read_catalog_file(path: &Path) -> anyhow::Result<Vec<CatalogEntry>> {
    let mut reader = ::csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let index_of = |name: &str| headers.iter().position(|h| h == name);
    let (Some(dataset_idx), Some(resource_idx), Some(url_idx)) = (
        index_of("dataset_id"),
        index_of("resource_id"),
        index_of("url"),
    ) else {
        anyhow::bail!("catalog file must have dataset_id, resource_id and url columns");
    };

    let mut entries = Vec::new();
    for record in reader.records() {
        let record = record?;
        let resource_id = record
            .get(resource_idx)
            .and_then(|raw| uuid::Uuid::parse_str(raw.trim()).ok());
        let (Some(resource_id), Some(dataset_id), Some(url)) =
            (resource_id, record.get(dataset_idx), record.get(url_idx))
        else {
            continue;
        };
        entries.push(CatalogEntry {
            dataset_id: dataset_id.trim().to_string(),
            resource_id,
            url: url.trim().to_string(),
        });
    }
    Ok(entries)
}

/// Spawn the analysis worker pool. Workers drain the queue until shutdown.
pub fn spawn_workers(
    analyser: Arc<Analyser>,
    count: usize,
    shutdown: watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..count)
        .map(|worker_id| {
            let analyser = analyser.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    let job = tokio::select! {
                        job = analyser.queue.pop() => job,
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                            continue;
                        }
                    };
                    match analyser.handle(&job.kind).await {
                        Ok(()) => analyser.queue.ack(job.id),
                        Err(e) => {
                            warn!("Worker {}: job {} failed: {}", worker_id, job.id, e);
                            analyser.queue.nack(job.id);
                        }
                    }
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_catalog_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let id = uuid::Uuid::new_v4();
        writeln!(tmp, "dataset_id,resource_id,url").unwrap();
        writeln!(tmp, "d1,{},https://example.com/a.csv", id).unwrap();
        writeln!(tmp, "d2,not-a-uuid,https://example.com/b.csv").unwrap();

        let entries = read_catalog_file(tmp.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].resource_id, id);
        assert_eq!(entries[0].dataset_id, "d1");
    }

    #[test]
    fn test_read_catalog_file_missing_columns() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "a,b").unwrap();
        writeln!(tmp, "1,2").unwrap();
        assert!(read_catalog_file(tmp.path()).is_err());
    }
}
