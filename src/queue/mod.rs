//! In-process work queue with three priority levels.
//!
//! Delivery is at-least-once: a popped job must be acked; jobs that fail
//! (or whose worker vanishes past the visibility window) are redelivered
//! with an incremented attempt count until `max_attempts`, then dropped.
//! Handlers are idempotent, so redelivery is safe. There is no ordering
//! guarantee across jobs; per-resource ordering comes from the resource
//! status machine.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

/// Queue lanes, drained most urgent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Default,
    Low,
}

/// Unit of deferred work.
#[derive(Debug, Clone)]
pub enum JobKind {
    /// Download + metadata analysis for a fresh check.
    AnalyseResource { check_id: i64, force: bool },
    /// Mirror-table ingestion of a downloaded tabular file.
    IngestCsv {
        check_id: i64,
        file_path: PathBuf,
        gzipped: bool,
    },
    /// Notify the upstream catalog.
    SendWebhook {
        dataset_id: String,
        resource_id: Uuid,
        document: Value,
    },
    /// Re-read the catalog dump and insert unknown resources.
    RefreshCatalog { path: PathBuf },
}

/// A delivered job. Hand it back via `ack` or `nack`.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: u64,
    pub kind: JobKind,
    pub attempts: u32,
    priority: Priority,
}

#[derive(Default)]
struct Lanes {
    high: VecDeque<Job>,
    default: VecDeque<Job>,
    low: VecDeque<Job>,
    /// Delivered but not yet acked, with delivery time.
    in_flight: HashMap<u64, (Job, Instant)>,
}

/// Shared in-process queue.
pub struct WorkQueue {
    lanes: Mutex<Lanes>,
    notify: Notify,
    counter: AtomicU64,
    visibility: Duration,
    max_attempts: u32,
}

impl WorkQueue {
    pub fn new(visibility: Duration, max_attempts: u32) -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            notify: Notify::new(),
            counter: AtomicU64::new(1),
            visibility,
            max_attempts,
        }
    }

    /// Enqueue a job on the given lane.
    pub fn push(&self, kind: JobKind, priority: Priority) -> u64 {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let job = Job {
            id,
            kind,
            attempts: 0,
            priority,
        };
        {
            let mut lanes = self.lanes.lock().unwrap();
            match priority {
                Priority::High => lanes.high.push_back(job),
                Priority::Default => lanes.default.push_back(job),
                Priority::Low => lanes.low.push_back(job),
            }
        }
        self.notify.notify_one();
        id
    }

    /// Wait for the next job. Redelivers in-flight jobs whose visibility
    /// window lapsed before handing out new work.
    pub async fn pop(&self) -> Job {
        loop {
            if let Some(job) = self.try_pop() {
                return job;
            }
            // wake either on a push or periodically to re-scan visibility
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.visibility / 2 + Duration::from_millis(50)) => {}
            }
        }
    }

    /// Non-blocking variant of `pop`, used by drain loops.
    pub fn try_pop(&self) -> Option<Job> {
        let mut lanes = self.lanes.lock().unwrap();

        // reclaim lost deliveries first
        let expired: Vec<u64> = lanes
            .in_flight
            .iter()
            .filter(|(_, (_, delivered))| delivered.elapsed() >= self.visibility)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some((mut job, _)) = lanes.in_flight.remove(&id) {
                job.attempts += 1;
                if job.attempts >= self.max_attempts {
                    warn!("Dropping job {} after {} attempts (lost)", job.id, job.attempts);
                    continue;
                }
                debug!("Redelivering job {} (visibility window lapsed)", job.id);
                match job.priority {
                    Priority::High => lanes.high.push_back(job),
                    Priority::Default => lanes.default.push_back(job),
                    Priority::Low => lanes.low.push_back(job),
                }
            }
        }

        let job = lanes
            .high
            .pop_front()
            .or_else(|| lanes.default.pop_front())
            .or_else(|| lanes.low.pop_front())?;
        lanes.in_flight.insert(job.id, (job.clone(), Instant::now()));
        Some(job)
    }

    /// The job completed; forget it.
    pub fn ack(&self, job_id: u64) {
        let mut lanes = self.lanes.lock().unwrap();
        lanes.in_flight.remove(&job_id);
    }

    /// The job failed; requeue it unless its attempts are exhausted.
    /// Returns true when the job will be retried.
    pub fn nack(&self, job_id: u64) -> bool {
        let mut lanes = self.lanes.lock().unwrap();
        let Some((mut job, _)) = lanes.in_flight.remove(&job_id) else {
            return false;
        };
        job.attempts += 1;
        if job.attempts >= self.max_attempts {
            warn!("Dropping job {} after {} attempts", job.id, job.attempts);
            return false;
        }
        match job.priority {
            Priority::High => lanes.high.push_back(job),
            Priority::Default => lanes.default.push_back(job),
            Priority::Low => lanes.low.push_back(job),
        }
        drop(lanes);
        self.notify.notify_one();
        true
    }

    /// Jobs currently queued or in flight.
    pub fn depth(&self) -> usize {
        let lanes = self.lanes.lock().unwrap();
        lanes.high.len() + lanes.default.len() + lanes.low.len() + lanes.in_flight.len()
    }
}
