//! Change detection outcome types.
//!
//! A probe plus its history yields a [`Change`] verdict and, when the
//! verdict is `HasChanged`, a payload dating the modification and naming
//! the heuristic that detected it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Verdict of the change-detection cascade for a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    HasChanged,
    HasNotChanged,
    NoGuess,
}

/// Which heuristic in the cascade produced the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeDetection {
    HarvestMetadata,
    LastModifiedHeader,
    ContentLengthHeader,
    ComputedChecksum,
}

impl ChangeDetection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HarvestMetadata => "harvest-resource-metadata",
            Self::LastModifiedHeader => "last-modified-header",
            Self::ContentLengthHeader => "content-length-header",
            Self::ComputedChecksum => "computed-checksum",
        }
    }
}

/// Payload attached to a `HasChanged` verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangePayload {
    /// Best estimate of when the remote content last changed.
    pub last_modified_at: DateTime<Utc>,
    /// Heuristic that dated the change.
    pub detection: ChangeDetection,
}

impl ChangePayload {
    /// Flatten into the `analysis:*` keys carried by the upstream webhook.
    pub fn to_analysis_keys(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        map.insert(
            "analysis:last-modified-at".to_string(),
            serde_json::Value::String(self.last_modified_at.to_rfc3339()),
        );
        map.insert(
            "analysis:last-modified-detection".to_string(),
            serde_json::Value::String(self.detection.as_str().to_string()),
        );
        map
    }
}
