//! Probe log model.
//!
//! One `Check` is one probe attempt and its outcome. Rows are append-only;
//! the analysis pipeline later fills the checksum/mime/parsing columns on
//! the same row.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

/// One row of the `checks` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Check {
    pub id: i64,
    pub catalog_id: i64,
    pub resource_id: Uuid,
    pub dataset_id: String,
    pub url: String,
    pub domain: String,
    pub created_at: DateTime<Utc>,
    /// HTTP status, `None` on transport failure or timeout.
    pub status: Option<u16>,
    pub timeout: bool,
    /// Wall time of the request-response exchange, in seconds.
    pub response_time: Option<f64>,
    /// Short failure classification, `None` on success and plain 4xx.
    pub error: Option<String>,
    /// Response headers, keys lowercased.
    pub headers: HashMap<String, String>,
    pub checksum: Option<String>,
    pub filesize: Option<i64>,
    pub mime_type: Option<String>,
    pub analysis_error: Option<String>,
    pub detected_last_modified_at: Option<DateTime<Utc>>,
    pub next_check_at: Option<DateTime<Utc>>,
    pub parsing_started_at: Option<DateTime<Utc>>,
    pub parsing_finished_at: Option<DateTime<Utc>>,
    pub parsing_error: Option<String>,
    /// Name of the mirror table when parsing succeeded (md5 of the URL).
    pub parsing_table: Option<String>,
}

impl Check {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| s.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn content_length(&self) -> Option<i64> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }

    /// Raw `last-modified` header value, if any.
    pub fn last_modified_header(&self) -> Option<&str> {
        self.header("last-modified")
    }

    /// Parse the `last-modified` header, accepting HTTP-date and RFC 3339.
    pub fn parsed_last_modified(&self) -> Option<DateTime<Utc>> {
        let raw = self.last_modified_header()?;
        parse_http_date(raw)
    }

    /// JSON document served by the checks API. `deleted` comes from the
    /// owning catalog row. Canonical field names are `id` and `status`.
    pub fn to_api_json(&self, deleted: bool) -> serde_json::Value {
        json!({
            "id": self.id,
            "catalog_id": self.catalog_id,
            "resource_id": self.resource_id,
            "dataset_id": self.dataset_id,
            "url": self.url,
            "domain": self.domain,
            "created_at": self.created_at.to_rfc3339(),
            "status": self.status,
            "timeout": self.timeout,
            "response_time": self.response_time,
            "error": self.error,
            "headers": self.headers,
            "checksum": self.checksum,
            "filesize": self.filesize,
            "mime_type": self.mime_type,
            "analysis_error": self.analysis_error,
            "deleted": deleted,
            "parsing_started_at": self.parsing_started_at.map(|d| d.to_rfc3339()),
            "parsing_finished_at": self.parsing_finished_at.map(|d| d.to_rfc3339()),
            "parsing_error": self.parsing_error,
            "parsing_table": self.parsing_table,
        })
    }
}

/// Outcome of a probe, before the row exists.
#[derive(Debug, Clone)]
pub struct NewCheck {
    pub catalog_id: i64,
    pub resource_id: Uuid,
    pub dataset_id: String,
    pub url: String,
    pub domain: String,
    pub status: Option<u16>,
    pub timeout: bool,
    pub response_time: Option<f64>,
    pub error: Option<String>,
    pub headers: HashMap<String, String>,
}

/// Parse an HTTP date, tolerating RFC 3339 values some origins emit.
pub fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_with_headers(pairs: &[(&str, &str)]) -> Check {
        Check {
            id: 1,
            catalog_id: 1,
            resource_id: Uuid::new_v4(),
            dataset_id: "d1".to_string(),
            url: "https://example.com/data.csv".to_string(),
            domain: "example.com".to_string(),
            created_at: Utc::now(),
            status: Some(200),
            timeout: false,
            response_time: Some(0.1),
            error: None,
            headers: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
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
    fn test_content_length_parsing() {
        let check = check_with_headers(&[("content-length", " 1234 ")]);
        assert_eq!(check.content_length(), Some(1234));
        let check = check_with_headers(&[("content-length", "nope")]);
        assert_eq!(check.content_length(), None);
    }

    #[test]
    fn test_parse_http_date_formats() {
        let rfc2822 = parse_http_date("Wed, 21 Oct 2015 07:28:00 GMT").unwrap();
        assert_eq!(rfc2822.to_rfc3339(), "2015-10-21T07:28:00+00:00");
        assert!(parse_http_date("2015-10-21T07:28:00Z").is_some());
        assert!(parse_http_date("last tuesday").is_none());
    }

    #[test]
    fn test_api_json_uses_canonical_names() {
        let check = check_with_headers(&[("x-do", "you")]);
        let doc = check.to_api_json(false);
        assert_eq!(doc["id"], 1);
        assert_eq!(doc["status"], 200);
        assert_eq!(doc["deleted"], false);
        assert_eq!(doc["headers"]["x-do"], "you");
        assert!(doc.get("check_id").is_none());
    }
}
