//! Crawl side of the pipeline: scheduling, per-domain politeness and the
//! HTTP prober.

mod domain_gate;
mod prober;
mod scheduler;

pub use domain_gate::{DomainGate, DomainPermit};
pub use prober::{header_snapshot, is_success, ProbeOutcome, Prober};
pub use scheduler::{Crawler, NextCheckPolicy, SchedulePlan, ScheduleVerdict, Scheduler};
