//! Layered change-detection cascade.
//!
//! Cheap signals first: harvest metadata, then the Last-Modified header,
//! then Content-Length. The downloaded-checksum comparison only runs after
//! the analysis pipeline fetched the file. The first heuristic returning a
//! verdict other than `NoGuess` wins. Detection is deterministic given the
//! same check history and resource metadata.

use chrono::{DateTime, Utc};

use crate::models::{Change, ChangeDetection, ChangePayload, Check, Resource};

/// Run the header-level cascade over the current check and its
/// predecessor.
pub fn detect_on_early_hints(
    resource: &Resource,
    current: &Check,
    previous: Option<&Check>,
) -> (Change, Option<ChangePayload>) {
    let (change, payload) = detect_from_harvest(resource, previous);
    if change != Change::NoGuess {
        return (change, payload);
    }

    let (change, payload) = detect_from_last_modified_header(current, previous);
    if change != Change::NoGuess {
        return (change, payload);
    }

    detect_from_content_length_header(current, previous)
}

/// Harvest metadata is authoritative when present: compare the upstream
/// modification date against what the previous check detected.
fn detect_from_harvest(
    resource: &Resource,
    previous: Option<&Check>,
) -> (Change, Option<ChangePayload>) {
    let Some(previous) = previous else {
        return (Change::NoGuess, None);
    };
    let Some(harvest_modified_at) = resource.harvest_modified_at else {
        return (Change::NoGuess, None);
    };

    if Some(harvest_modified_at) == previous.detected_last_modified_at {
        return (Change::HasNotChanged, None);
    }
    (
        Change::HasChanged,
        Some(ChangePayload {
            last_modified_at: harvest_modified_at,
            detection: ChangeDetection::HarvestMetadata,
        }),
    )
}

/// Compare raw Last-Modified header values between the two latest checks.
/// A first check carrying the header counts as changed.
fn detect_from_last_modified_header(
    current: &Check,
    previous: Option<&Check>,
) -> (Change, Option<ChangePayload>) {
    let Some(previous) = previous else {
        if let Some(parsed) = current.parsed_last_modified() {
            return (
                Change::HasChanged,
                Some(ChangePayload {
                    last_modified_at: parsed,
                    detection: ChangeDetection::LastModifiedHeader,
                }),
            );
        }
        return (Change::NoGuess, None);
    };

    let Some(current_raw) = current.last_modified_header() else {
        return (Change::NoGuess, None);
    };

    if previous.last_modified_header() != Some(current_raw) {
        // an unparseable value cannot date the change; leave it to the
        // next heuristic
        if let Some(parsed) = current.parsed_last_modified() {
            return (
                Change::HasChanged,
                Some(ChangePayload {
                    last_modified_at: parsed,
                    detection: ChangeDetection::LastModifiedHeader,
                }),
            );
        }
        return (Change::NoGuess, None);
    }
    (Change::HasNotChanged, None)
}

/// Content-Length flips date the change only to the current check time.
fn detect_from_content_length_header(
    current: &Check,
    previous: Option<&Check>,
) -> (Change, Option<ChangePayload>) {
    let Some(previous) = previous else {
        return (Change::NoGuess, None);
    };
    let Some(current_length) = current.content_length() else {
        return (Change::NoGuess, None);
    };

    if previous.content_length() != Some(current_length) {
        return (
            Change::HasChanged,
            Some(ChangePayload {
                last_modified_at: current.created_at,
                detection: ChangeDetection::ContentLengthHeader,
            }),
        );
    }
    (Change::HasNotChanged, None)
}

/// Compare the freshly computed checksum against the previous check's.
/// Only runs after download; an absent previous checksum proves nothing.
pub fn detect_from_checksum(
    new_checksum: &str,
    previous: Option<&Check>,
    now: DateTime<Utc>,
) -> (Change, Option<ChangePayload>) {
    match previous.and_then(|p| p.checksum.as_deref()) {
        Some(old) if old != new_checksum => (
            Change::HasChanged,
            Some(ChangePayload {
                last_modified_at: now,
                detection: ChangeDetection::ComputedChecksum,
            }),
        ),
        _ => (Change::NoGuess, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parse_http_date;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn resource(harvest_modified_at: Option<DateTime<Utc>>) -> Resource {
        Resource {
            catalog_id: 1,
            dataset_id: "d1".to_string(),
            resource_id: Uuid::new_v4(),
            url: "https://example.com/data.csv".to_string(),
            domain: "example.com".to_string(),
            deleted: false,
            priority: false,
            initialization: false,
            last_check: None,
            next_check_at: None,
            harvest_modified_at,
            status: None,
            unchanged_streak: 0,
            failure_streak: 0,
        }
    }

    fn check(headers: &[(&str, &str)]) -> Check {
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

    const LM_OLD: &str = "Wed, 21 Oct 2015 07:28:00 GMT";
    const LM_NEW: &str = "Thu, 22 Oct 2015 07:28:00 GMT";

    #[test]
    fn test_harvest_wins_over_headers() {
        let harvest = Utc::now();
        let resource = resource(Some(harvest));
        let current = check(&[("last-modified", LM_NEW)]);
        let mut previous = check(&[("last-modified", LM_NEW)]);
        previous.detected_last_modified_at = Some(harvest);

        // harvest date matches what we detected before: unchanged, even
        // though the header heuristic would also fire
        let (change, payload) = detect_on_early_hints(&resource, &current, Some(&previous));
        assert_eq!(change, Change::HasNotChanged);
        assert!(payload.is_none());

        previous.detected_last_modified_at = Some(harvest - chrono::Duration::days(1));
        let (change, payload) = detect_on_early_hints(&resource, &current, Some(&previous));
        assert_eq!(change, Change::HasChanged);
        let payload = payload.unwrap();
        assert_eq!(payload.detection, ChangeDetection::HarvestMetadata);
        assert_eq!(payload.last_modified_at, harvest);
    }

    #[test]
    fn test_first_check_with_last_modified_is_a_change() {
        let resource = resource(None);
        let current = check(&[("last-modified", LM_OLD)]);
        let (change, payload) = detect_on_early_hints(&resource, &current, None);
        assert_eq!(change, Change::HasChanged);
        assert_eq!(
            payload.unwrap().detection,
            ChangeDetection::LastModifiedHeader
        );
    }

    #[test]
    fn test_first_check_without_hints_is_no_guess() {
        let resource = resource(None);
        let current = check(&[]);
        let (change, payload) = detect_on_early_hints(&resource, &current, None);
        assert_eq!(change, Change::NoGuess);
        assert!(payload.is_none());
    }

    #[test]
    fn test_last_modified_comparison() {
        let resource = resource(None);
        let current = check(&[("last-modified", LM_NEW)]);
        let previous = check(&[("last-modified", LM_OLD)]);
        let (change, payload) = detect_on_early_hints(&resource, &current, Some(&previous));
        assert_eq!(change, Change::HasChanged);
        assert_eq!(
            payload.unwrap().last_modified_at,
            parse_http_date(LM_NEW).unwrap()
        );

        let same = check(&[("last-modified", LM_NEW)]);
        let (change, _) = detect_on_early_hints(&resource, &current, Some(&same));
        assert_eq!(change, Change::HasNotChanged);
    }

    #[test]
    fn test_content_length_fallback() {
        let resource = resource(None);
        let current = check(&[("content-length", "200")]);
        let previous = check(&[("content-length", "100")]);
        let (change, payload) = detect_on_early_hints(&resource, &current, Some(&previous));
        assert_eq!(change, Change::HasChanged);
        let payload = payload.unwrap();
        assert_eq!(payload.detection, ChangeDetection::ContentLengthHeader);
        assert_eq!(payload.last_modified_at, current.created_at);

        let same = check(&[("content-length", "200")]);
        let (change, _) = detect_on_early_hints(&resource, &current, Some(&same));
        assert_eq!(change, Change::HasNotChanged);
    }

    #[test]
    fn test_checksum_comparison() {
        let now = Utc::now();
        let mut previous = check(&[]);
        previous.checksum = Some("aaa".to_string());

        let (change, payload) = detect_from_checksum("bbb", Some(&previous), now);
        assert_eq!(change, Change::HasChanged);
        let payload = payload.unwrap();
        assert_eq!(payload.detection, ChangeDetection::ComputedChecksum);
        assert_eq!(payload.last_modified_at, now);

        let (change, _) = detect_from_checksum("aaa", Some(&previous), now);
        assert_eq!(change, Change::NoGuess);

        let no_checksum = check(&[]);
        let (change, _) = detect_from_checksum("bbb", Some(&no_checksum), now);
        assert_eq!(change, Change::NoGuess);
    }

    #[test]
    fn test_detection_is_deterministic() {
        let resource = resource(None);
        let current = check(&[("last-modified", LM_NEW), ("content-length", "10")]);
        let previous = check(&[("last-modified", LM_OLD), ("content-length", "10")]);
        let first = detect_on_early_hints(&resource, &current, Some(&previous));
        let second = detect_on_early_hints(&resource, &current, Some(&previous));
        assert_eq!(first.0, second.0);
        assert_eq!(first.1, second.1);
    }
}
