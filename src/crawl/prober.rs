//! HTTP prober.
//!
//! One probe is a HEAD request (GET fallback when the origin rejects HEAD)
//! behind the per-domain gate. Every outcome, including transport
//! failures, is classified and lands as exactly one `checks` row; the
//! prober never propagates origin-side errors to its caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tracing::debug;

use crate::config::Settings;
use crate::crawl::DomainGate;
use crate::models::{Check, NewCheck, Resource};
use crate::repository::{CatalogRepository, CheckRepository, RepositoryError};

/// Probe worker shared by the scheduler loop and the on-demand API path.
pub struct Prober {
    client: reqwest::Client,
    gate: Arc<DomainGate>,
    catalog: Arc<CatalogRepository>,
    checks: Arc<CheckRepository>,
}

/// Mutually exclusive classification of one probe outcome.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub status: Option<u16>,
    pub timeout: bool,
    pub error: Option<String>,
    pub headers: HashMap<String, String>,
}

impl Prober {
    pub fn new(
        settings: &Settings,
        gate: Arc<DomainGate>,
        catalog: Arc<CatalogRepository>,
        checks: Arc<CheckRepository>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&settings.crawl.user_agent)
            .timeout(settings.probe_timeout())
            .connect_timeout(settings.connect_timeout())
            .gzip(true)
            .brotli(true)
            .build()?;
        Ok(Self {
            client,
            gate,
            catalog,
            checks,
        })
    }

    /// Probe one resource and append its `checks` row.
    ///
    /// Only storage errors surface; origin failures become the row's
    /// classification.
    pub async fn probe(&self, resource: &Resource) -> Result<Check, RepositoryError> {
        let _permit = self.gate.acquire(&resource.domain).await;

        let started = Instant::now();
        let outcome = match self.request(&resource.url).await {
            Ok((status, headers)) => classify_response(status, &headers),
            Err(e) => classify_transport_error(&e),
        };
        let response_time = started.elapsed().as_secs_f64();

        debug!(
            "Probed {} -> status={:?} timeout={} in {:.3}s",
            resource.url, outcome.status, outcome.timeout, response_time
        );

        let new_check = NewCheck {
            catalog_id: resource.catalog_id,
            resource_id: resource.resource_id,
            dataset_id: resource.dataset_id.clone(),
            url: resource.url.clone(),
            domain: resource.domain.clone(),
            status: outcome.status,
            timeout: outcome.timeout,
            response_time: Some(response_time),
            error: outcome.error,
            headers: outcome.headers,
        };
        let check_id = self.checks.insert(&new_check, Utc::now())?;
        self.catalog
            .set_last_check(resource.resource_id, check_id)?;
        self.checks
            .get(check_id)?
            .ok_or_else(|| RepositoryError::NotFound(format!("check {}", check_id)))
    }

    /// HEAD, retried once as GET when the origin rejects the method.
    /// The GET response body is never read.
    async fn request(&self, url: &str) -> Result<(StatusCode, HeaderMap), reqwest::Error> {
        let response = self.client.head(url).send().await?;
        if matches!(response.status().as_u16(), 405 | 501) {
            let response = self.client.get(url).send().await?;
            return Ok((response.status(), response.headers().clone()));
        }
        Ok((response.status(), response.headers().clone()))
    }
}

/// Snapshot response headers with lowercased keys.
pub fn header_snapshot(headers: &HeaderMap) -> HashMap<String, String> {
    let mut snapshot = HashMap::new();
    for (name, value) in headers {
        if let Ok(v) = value.to_str() {
            snapshot.insert(name.as_str().to_lowercase(), v.to_string());
        }
    }
    snapshot
}

/// Classification for a response the origin actually produced.
fn classify_response(status: StatusCode, headers: &HeaderMap) -> ProbeOutcome {
    let error = if status.is_server_error() {
        Some(
            status
                .canonical_reason()
                .unwrap_or("Server Error")
                .to_string(),
        )
    } else {
        // 4xx (including 429) is recorded without an error string
        None
    };
    ProbeOutcome {
        status: Some(status.as_u16()),
        timeout: false,
        error,
        headers: header_snapshot(headers),
    }
}

/// Classification for a request that never produced a response.
fn classify_transport_error(e: &reqwest::Error) -> ProbeOutcome {
    if e.is_timeout() {
        return ProbeOutcome {
            status: None,
            timeout: true,
            error: None,
            headers: HashMap::new(),
        };
    }
    let kind = if e.is_connect() {
        "ConnectError"
    } else if e.is_redirect() {
        "RedirectError"
    } else if e.is_body() || e.is_decode() {
        "BodyError"
    } else {
        "RequestError"
    };
    ProbeOutcome {
        status: None,
        timeout: false,
        error: Some(format!("{}: {}", kind, e)),
        headers: HashMap::new(),
    }
}

/// A probe worth analysing: the origin answered with 2xx/3xx.
pub fn is_success(check: &Check) -> bool {
    matches!(check.status, Some(code) if code < 400)
}
