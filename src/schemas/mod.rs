//! Validation layer for API payloads.
//!
//! Incoming documents are deserialized strictly: unknown fields are
//! rejected, UUIDs and timestamps are coerced, and the resulting error
//! string is served verbatim as the 400 body.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body of `POST /api/checks/`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckCreateSchema {
    pub resource_id: Uuid,
    #[serde(default)]
    pub force_analysis: bool,
}

/// Resource event envelope received from the upstream catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceSchema {
    pub dataset_id: String,
    pub resource_id: Uuid,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub document: Option<ResourceDocumentSchema>,
}

/// The resource document carried by create/update events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDocumentSchema {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub format: Option<String>,
    pub title: String,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub filetype: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub filesize: Option<i64>,
    #[serde(default)]
    pub checksum_type: Option<String>,
    #[serde(default)]
    pub checksum_value: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub extras: Option<serde_json::Value>,
    #[serde(default)]
    pub harvest: Option<HarvestSchema>,
}

/// Harvester-provided provenance. Extra keys are tolerated; only
/// `modified_at` feeds change detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestSchema {
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extras: serde_json::Map<String, serde_json::Value>,
}

impl ResourceDocumentSchema {
    pub fn harvest_modified_at(&self) -> Option<DateTime<Utc>> {
        self.harvest.as_ref().and_then(|h| h.modified_at)
    }
}

/// Body of `POST /api/resources-exceptions/`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceExceptionSchema {
    pub resource_id: Uuid,
    #[serde(default)]
    pub table_indexes: Option<HashMap<String, String>>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl ResourceExceptionSchema {
    /// Check every requested index kind against the supported closed set.
    pub fn validate_table_indexes(
        table_indexes: &HashMap<String, String>,
        supported: &[String],
    ) -> Result<(), String> {
        for kind in table_indexes.values() {
            if !supported.iter().any(|s| s == kind) {
                return Err(format!(
                    "error, index type must be one of: {}",
                    supported.join(", ")
                ));
            }
        }
        Ok(())
    }
}
