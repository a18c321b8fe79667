//! Outbound webhook to the upstream catalog.
//!
//! Every probe or analysis outcome becomes a flat `check:*`/`analysis:*`
//! document PUT to the upstream resource-extras endpoint. Sends go through
//! the work queue (high priority) and are retried there; a repeatedly
//! failing upstream never blocks the pipeline.

use serde_json::{json, Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::Check;

/// Build the flat document describing a check, merging in any
/// `analysis:*` keys produced by the analysis pipeline.
pub fn build_check_document(check: &Check, analysis: Option<&Map<String, Value>>) -> Value {
    // availability: unknown when the origin rate-limited us, false when it
    // never answered or answered 5xx, true for everything else
    let available = match check.status {
        Some(429) => Value::Null,
        Some(code) if code >= 500 => Value::Bool(false),
        Some(_) => Value::Bool(true),
        None => Value::Bool(false),
    };

    let mut document = Map::new();
    document.insert(
        "check:date".to_string(),
        json!(check.created_at.to_rfc3339()),
    );
    document.insert("check:available".to_string(), available);
    document.insert("check:timeout".to_string(), json!(check.timeout));
    document.insert("check:status".to_string(), json!(check.status));
    if let Some(content_type) = check.content_type() {
        document.insert(
            "check:headers:content-type".to_string(),
            json!(content_type),
        );
    }
    if let Some(content_length) = check.content_length() {
        document.insert(
            "check:headers:content-length".to_string(),
            json!(content_length),
        );
    }
    if let Some(analysis) = analysis {
        for (key, value) in analysis {
            document.insert(key.clone(), value.clone());
        }
    }
    Value::Object(document)
}

/// Sends check documents upstream. With no configured base URL every send
/// is a no-op, which keeps single-node deployments and tests quiet.
pub struct WebhookSender {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl WebhookSender {
    pub fn new(base_url: Option<String>, user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self { client, base_url })
    }

    pub async fn send(
        &self,
        dataset_id: &str,
        resource_id: Uuid,
        document: &Value,
    ) -> anyhow::Result<()> {
        let Some(base) = &self.base_url else {
            debug!(
                "No webhook URL configured, dropping notification for resource {}",
                resource_id
            );
            return Ok(());
        };
        let url = format!(
            "{}/datasets/{}/resources/{}/extras/",
            base.trim_end_matches('/'),
            dataset_id,
            resource_id
        );
        let response = self.client.put(&url).json(document).send().await?;
        if !response.status().is_success() {
            anyhow::bail!(
                "Upstream webhook returned {} for resource {}",
                response.status(),
                resource_id
            );
        }
        info!("Sent check document for resource {} upstream", resource_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn check(status: Option<u16>, timeout: bool, headers: &[(&str, &str)]) -> Check {
        Check {
            id: 1,
            catalog_id: 1,
            resource_id: Uuid::new_v4(),
            dataset_id: "d1".to_string(),
            url: "https://example.com/resource-1".to_string(),
            domain: "example.com".to_string(),
            created_at: Utc::now(),
            status,
            timeout,
            response_time: Some(0.1),
            error: None,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            checksum: None,
            filesize: None,
            mime_type: None,
            analysis_error: None,
            detected_last_modified_at: None,
            next_check_at: None,
            parsing_started_at: None,
            parsing_finished_at: None,
            parsing_error: None,
            parsing_table: None,
        }
    }

    #[test]
    fn test_available_flag_matrix() {
        let doc = build_check_document(&check(Some(200), false, &[]), None);
        assert_eq!(doc["check:available"], true);

        let doc = build_check_document(&check(Some(404), false, &[]), None);
        assert_eq!(doc["check:available"], true);

        let doc = build_check_document(&check(Some(500), false, &[]), None);
        assert_eq!(doc["check:available"], false);

        // 429 is our problem, not the origin's: availability is unknown
        let doc = build_check_document(&check(Some(429), false, &[]), None);
        assert!(doc["check:available"].is_null());

        let doc = build_check_document(&check(None, true, &[]), None);
        assert_eq!(doc["check:available"], false);
        assert_eq!(doc["check:timeout"], true);
    }

    #[test]
    fn test_header_keys_typed() {
        let doc = build_check_document(
            &check(
                Some(200),
                false,
                &[
                    ("content-type", "application/json"),
                    ("content-length", "10"),
                ],
            ),
            None,
        );
        assert_eq!(doc["check:headers:content-type"], "application/json");
        assert_eq!(doc["check:headers:content-length"], 10);
    }

    #[test]
    fn test_analysis_keys_merged() {
        let mut analysis = Map::new();
        analysis.insert("analysis:checksum".to_string(), json!("abc"));
        analysis.insert(
            "analysis:last-modified-detection".to_string(),
            json!("content-length-header"),
        );
        let doc = build_check_document(&check(Some(200), false, &[]), Some(&analysis));
        assert_eq!(doc["analysis:checksum"], "abc");
        assert_eq!(
            doc["analysis:last-modified-detection"],
            "content-length-header"
        );
    }
}
