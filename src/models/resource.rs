//! Catalog resource model and its processing state machine.
//!
//! A resource is one catalogued URL. Its `status` column is an explicit
//! state machine: `None` and `Analysed` are terminal, everything else marks
//! a stage of the probe/analysis pipeline and blocks re-selection by the
//! scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pipeline stage of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceStatus {
    Crawling,
    ToAnalyseResource,
    AnalysingResource,
    ToAnalyseCsv,
    AnalysingCsv,
    Analysed,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crawling => "CRAWLING",
            Self::ToAnalyseResource => "TO_ANALYSE_RESOURCE",
            Self::AnalysingResource => "ANALYSING_RESOURCE",
            Self::ToAnalyseCsv => "TO_ANALYSE_CSV",
            Self::AnalysingCsv => "ANALYSING_CSV",
            Self::Analysed => "ANALYSED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "CRAWLING" => Some(Self::Crawling),
            "TO_ANALYSE_RESOURCE" => Some(Self::ToAnalyseResource),
            "ANALYSING_RESOURCE" => Some(Self::AnalysingResource),
            "TO_ANALYSE_CSV" => Some(Self::ToAnalyseCsv),
            "ANALYSING_CSV" => Some(Self::AnalysingCsv),
            "ANALYSED" => Some(Self::Analysed),
            _ => None,
        }
    }

    /// Human-readable label served by the status API.
    pub fn verbose(&self) -> &'static str {
        match self {
            Self::Crawling => "crawling URL",
            Self::ToAnalyseResource => "to analyse resource",
            Self::AnalysingResource => "analysing resource",
            Self::ToAnalyseCsv => "to analyse CSV",
            Self::AnalysingCsv => "analysing CSV",
            Self::Analysed => "analysed",
        }
    }

    /// Verbose label for an optional status, `None` being the idle state.
    pub fn verbose_opt(status: Option<ResourceStatus>) -> &'static str {
        match status {
            Some(s) => s.verbose(),
            None => "idle, waiting for next check",
        }
    }
}

/// Whether a resource may be picked up for a new probe.
pub fn is_terminal(status: Option<ResourceStatus>) -> bool {
    matches!(status, None | Some(ResourceStatus::Analysed))
}

/// One row of the `catalog` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    /// Database row ID (`catalog.id`).
    pub catalog_id: i64,
    pub dataset_id: String,
    pub resource_id: Uuid,
    pub url: String,
    /// URL host, lowercased. Drives per-domain politeness.
    pub domain: String,
    /// Soft-delete tombstone. Deleted rows keep their check history.
    pub deleted: bool,
    /// Set by upstream create/update events; wins the next scheduling pick.
    pub priority: bool,
    /// True until the first probe.
    pub initialization: bool,
    /// FK to the latest `checks.id`.
    pub last_check: Option<i64>,
    /// When the resource becomes eligible again. `None` means immediately.
    pub next_check_at: Option<DateTime<Utc>>,
    /// Modification timestamp supplied by the upstream harvester.
    pub harvest_modified_at: Option<DateTime<Utc>>,
    pub status: Option<ResourceStatus>,
    /// Consecutive `HasNotChanged` verdicts; drives interval backoff.
    pub unchanged_streak: u32,
    /// Consecutive failed probes; drives the short retry lane.
    pub failure_streak: u32,
}

impl Resource {
    /// Derive the politeness domain from a resource URL.
    pub fn domain_of(url: &str) -> String {
        url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            ResourceStatus::Crawling,
            ResourceStatus::ToAnalyseResource,
            ResourceStatus::AnalysingResource,
            ResourceStatus::ToAnalyseCsv,
            ResourceStatus::AnalysingCsv,
            ResourceStatus::Analysed,
        ] {
            assert_eq!(ResourceStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(ResourceStatus::from_str("NOPE"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(is_terminal(None));
        assert!(is_terminal(Some(ResourceStatus::Analysed)));
        assert!(!is_terminal(Some(ResourceStatus::Crawling)));
        assert!(!is_terminal(Some(ResourceStatus::AnalysingCsv)));
    }

    #[test]
    fn test_domain_of() {
        assert_eq!(
            Resource::domain_of("https://Example.COM/data.csv"),
            "example.com"
        );
        assert_eq!(Resource::domain_of("not a url"), "");
    }
}
