//! HTTP API for operators and the upstream catalog service.
//!
//! Serves check lookups, on-demand probes, resource lifecycle events,
//! size-cap exceptions and operational statistics. Mutating endpoints
//! require the configured bearer token.

mod auth;
mod handlers;
mod routes;

pub use routes::create_router;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::Settings;
use crate::crawl::{Crawler, DomainGate, NextCheckPolicy, Prober};
use crate::queue::WorkQueue;
use crate::repository::{CatalogRepository, CheckRepository, ResourceExceptionRepository};

/// Shared state for the web server.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<CatalogRepository>,
    pub checks: Arc<CheckRepository>,
    pub exceptions: Arc<ResourceExceptionRepository>,
    pub crawler: Arc<Crawler>,
    pub settings: Arc<Settings>,
}

impl AppState {
    /// Wire the repositories and the probe path onto a shared queue.
    pub fn new(settings: Arc<Settings>, queue: Arc<WorkQueue>) -> anyhow::Result<Self> {
        let catalog = Arc::new(CatalogRepository::new(&settings.database_path)?);
        let checks = Arc::new(CheckRepository::new(&settings.database_path)?);
        let exceptions = Arc::new(ResourceExceptionRepository::new(&settings.database_path)?);
        let gate = Arc::new(DomainGate::new(
            settings.crawl.per_domain_concurrency,
            settings.crawl.per_domain_rate,
        ));
        let prober = Arc::new(Prober::new(
            &settings,
            gate,
            catalog.clone(),
            checks.clone(),
        )?);
        let policy = Arc::new(NextCheckPolicy::new(settings.schedule.clone()));
        let crawler = Arc::new(Crawler {
            catalog: catalog.clone(),
            prober,
            queue,
            policy,
        });

        Ok(Self {
            catalog,
            checks,
            exceptions,
            crawler,
            settings,
        })
    }
}

/// Start the web server.
pub async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::models::NewCheck;

    const TOKEN: &str = "s3cr3t";

    fn test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            database_path: dir.path().join("test.db"),
            api_token: TOKEN.to_string(),
            ..Settings::default()
        };
        let queue = Arc::new(WorkQueue::new(Duration::from_secs(300), 5));
        let state = AppState::new(Arc::new(settings), queue).unwrap();
        (state, dir)
    }

    fn setup_app() -> (axum::Router, AppState, tempfile::TempDir) {
        let (state, dir) = test_state();
        let app = create_router(state.clone());
        (app, state, dir)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn send(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        builder
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn insert_resource(state: &AppState, url: &str) -> Uuid {
        let resource_id = Uuid::new_v4();
        state
            .catalog
            .upsert_resource("dataset-1", resource_id, url, None)
            .unwrap();
        resource_id
    }

    fn insert_check(state: &AppState, resource_id: Uuid, url: &str, status: Option<u16>) -> i64 {
        let check_id = state
            .checks
            .insert(
                &NewCheck {
                    catalog_id: 1,
                    resource_id,
                    dataset_id: "dataset-1".to_string(),
                    url: url.to_string(),
                    domain: "example.com".to_string(),
                    status,
                    timeout: status.is_none(),
                    response_time: Some(0.1),
                    error: match status {
                        Some(code) if code >= 500 => Some("Internal Server Error".to_string()),
                        _ => None,
                    },
                    headers: HashMap::from([("x-do".to_string(), "you".to_string())]),
                },
                Utc::now(),
            )
            .unwrap();
        state.catalog.set_last_check(resource_id, check_id).unwrap();
        check_id
    }

    #[tokio::test]
    async fn test_latest_check_unknown_query() {
        let (app, _state, _dir) = setup_app();
        let response = app
            .oneshot(get("/api/checks/latest/?stupid=stupid"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_latest_check_unknown_resource() {
        let (app, _state, _dir) = setup_app();
        let response = app
            .oneshot(get(&format!(
                "/api/checks/latest/?resource_id={}",
                Uuid::new_v4()
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_latest_check_round_trip_and_deleted() {
        let (app, state, _dir) = setup_app();
        let url = "https://example.com/resource-1";
        let resource_id = insert_resource(&state, url);
        insert_check(&state, resource_id, url, Some(200));

        for query in [
            format!("resource_id={}", resource_id),
            format!("url={}", url),
        ] {
            let response = app
                .clone()
                .oneshot(get(&format!("/api/checks/latest/?{}", query)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = body_json(response).await;
            assert_eq!(body["status"], 200);
            assert_eq!(body["resource_id"], resource_id.to_string());
            assert_eq!(body["headers"]["x-do"], "you");
            assert_eq!(body["deleted"], false);
            assert!(body["id"].is_i64());
        }

        state.catalog.soft_delete(resource_id).unwrap();
        let response = app
            .oneshot(get(&format!(
                "/api/checks/latest/?resource_id={}",
                resource_id
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn test_all_checks_newest_first() {
        let (app, state, _dir) = setup_app();
        let url = "https://example.com/resource-1";
        let resource_id = insert_resource(&state, url);

        let response = app
            .clone()
            .oneshot(get(&format!("/api/checks/all/?resource_id={}", resource_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        insert_check(&state, resource_id, url, Some(500));
        std::thread::sleep(std::time::Duration::from_millis(5));
        insert_check(&state, resource_id, url, Some(200));

        let response = app
            .oneshot(get(&format!("/api/checks/all/?resource_id={}", resource_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let checks = body.as_array().unwrap();
        assert_eq!(checks.len(), 2);
        assert_eq!(checks[0]["status"], 200);
        assert_eq!(checks[1]["status"], 500);
        assert_eq!(checks[1]["error"], "Internal Server Error");
    }

    #[tokio::test]
    async fn test_create_check_validation_and_auth() {
        let (app, _state, _dir) = setup_app();

        // no token
        let response = app
            .clone()
            .oneshot(send(
                "POST",
                "/api/checks/",
                None,
                json!({"resource_id": Uuid::new_v4()}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // wrong token
        let response = app
            .clone()
            .oneshot(send(
                "POST",
                "/api/checks/",
                Some("wrong"),
                json!({"resource_id": Uuid::new_v4()}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // invalid body
        let response = app
            .clone()
            .oneshot(send(
                "POST",
                "/api/checks/",
                Some(TOKEN),
                json!({"stupid_data": "stupid"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // unknown resource
        let response = app
            .oneshot(send(
                "POST",
                "/api/checks/",
                Some(TOKEN),
                json!({"resource_id": Uuid::new_v4()}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    fn resource_payload(resource_id: Uuid, url: &str) -> Value {
        json!({
            "dataset_id": "dataset-1",
            "resource_id": resource_id,
            "document": {
                "id": resource_id,
                "url": url,
                "title": "random title",
                "description": "random description",
                "filetype": "file",
                "type": "documentation",
                "mime": "text/plain",
                "filesize": 1024,
                "checksum_type": "sha1",
                "checksum_value": "b7b1cd8230881b18b6b487d550039949867ec7c5",
                "created_at": Utc::now().to_rfc3339(),
                "last_modified": Utc::now().to_rfc3339(),
            },
        })
    }

    #[tokio::test]
    async fn test_create_resource() {
        let (app, state, _dir) = setup_app();
        let resource_id = Uuid::new_v4();
        let payload = resource_payload(resource_id, "https://example.com/new.csv");

        // auth first
        let response = app
            .clone()
            .oneshot(send("POST", "/api/resources/", None, payload.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(send(
                "POST",
                "/api/resources/",
                Some("wrong"),
                payload.clone(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // invalid document
        let response = app
            .clone()
            .oneshot(send(
                "POST",
                "/api/resources/",
                Some(TOKEN),
                json!({"stupid": "stupid"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // success
        let response = app
            .clone()
            .oneshot(send("POST", "/api/resources/", Some(TOKEN), payload.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["id"], resource_id.to_string());
        let resource = state.catalog.get(resource_id).unwrap().unwrap();
        assert!(resource.priority);

        // missing document body
        let mut no_document = payload;
        no_document["document"] = Value::Null;
        let response = app
            .oneshot(send("POST", "/api/resources/", Some(TOKEN), no_document))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_update_resource_url_in_place() {
        let (app, state, _dir) = setup_app();
        let resource_id = insert_resource(&state, "https://example.com/resource-0");
        let before = state.catalog.get(resource_id).unwrap().unwrap();

        let payload = resource_payload(resource_id, "https://example.com/resource-1");
        let response = app
            .oneshot(send(
                "PUT",
                &format!("/api/resources/{}", resource_id),
                Some(TOKEN),
                payload,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // no duplicate row, same catalog id, new url
        let after = state.catalog.get(resource_id).unwrap().unwrap();
        assert_eq!(after.catalog_id, before.catalog_id);
        assert_eq!(after.url, "https://example.com/resource-1");
    }

    #[tokio::test]
    async fn test_delete_resource() {
        let (app, state, _dir) = setup_app();
        let resource_id = insert_resource(&state, "https://example.com/resource-1");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/resources/{}", Uuid::new_v4()))
                    .header("Authorization", format!("Bearer {}", TOKEN))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/resources/{}", resource_id))
                    .header("Authorization", format!("Bearer {}", TOKEN))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.catalog.get(resource_id).unwrap().unwrap().deleted);
    }

    #[tokio::test]
    async fn test_resource_status_endpoint() {
        let (app, state, _dir) = setup_app();
        let resource_id = insert_resource(&state, "https://example.com/resource-1");
        state
            .catalog
            .set_status(resource_id, Some(crate::models::ResourceStatus::Crawling))
            .unwrap();

        let response = app
            .oneshot(get(&format!("/api/resources/{}/status/", resource_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["resource_id"], resource_id.to_string());
        assert_eq!(body["status"], "CRAWLING");
        assert_eq!(body["status_verbose"], "crawling URL");
        let latest_check_url = body["latest_check_url"].as_str().unwrap();
        assert!(crate::utils::is_valid_uri(latest_check_url));
        assert!(latest_check_url
            .ends_with(&format!("/api/checks/latest?resource_id={}", resource_id)));
    }

    #[tokio::test]
    async fn test_crawler_status_progression() {
        let (app, state, _dir) = setup_app();
        let url = "https://example.com/resource-1";
        let resource_id = insert_resource(&state, url);

        let response = app.clone().oneshot(get("/api/status/crawler")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(
            body,
            json!({
                "total": 1,
                "pending_checks": 1,
                "fresh_checks": 0,
                "checks_percentage": 0.0,
                "fresh_checks_percentage": 0.0,
            })
        );

        insert_check(&state, resource_id, url, Some(200));
        state
            .catalog
            .schedule_next(
                resource_id,
                Utc::now() + chrono::Duration::days(7),
                0,
                0,
            )
            .unwrap();

        let response = app.oneshot(get("/api/status/crawler")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["pending_checks"], 0);
        assert_eq!(body["fresh_checks"], 1);
        assert_eq!(body["checks_percentage"], 100.0);
        assert_eq!(body["fresh_checks_percentage"], 100.0);
    }

    #[tokio::test]
    async fn test_stats_only_latest_counts() {
        let (app, state, _dir) = setup_app();

        let response = app.clone().oneshot(get("/api/stats")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(
            body["status"],
            json!([
                {"label": "error", "count": 0, "percentage": 0.0},
                {"label": "timeout", "count": 0, "percentage": 0.0},
                {"label": "ok", "count": 0, "percentage": 0.0},
            ])
        );
        assert_eq!(body["status_codes"], json!([]));

        let url = "https://example.com/resource-1";
        let resource_id = insert_resource(&state, url);
        insert_check(&state, resource_id, url, Some(200));
        std::thread::sleep(std::time::Duration::from_millis(5));
        insert_check(&state, resource_id, url, None); // timeout
        std::thread::sleep(std::time::Duration::from_millis(5));
        insert_check(&state, resource_id, url, Some(500));

        let response = app.oneshot(get("/api/stats")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(
            body["status"],
            json!([
                {"label": "error", "count": 1, "percentage": 100.0},
                {"label": "timeout", "count": 0, "percentage": 0.0},
                {"label": "ok", "count": 0, "percentage": 0.0},
            ])
        );
        assert_eq!(
            body["status_codes"],
            json!([{"code": 500, "count": 1, "percentage": 100.0}])
        );
    }

    #[tokio::test]
    async fn test_exceptions_lifecycle() {
        let (app, state, _dir) = setup_app();
        let resource_id = insert_resource(&state, "https://example.com/huge.csv");

        // unsupported index kind
        let response = app
            .clone()
            .oneshot(send(
                "POST",
                "/api/resources-exceptions/",
                Some(TOKEN),
                json!({
                    "resource_id": resource_id,
                    "table_indexes": {"siren": "fulltext"},
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // unknown resource
        let response = app
            .clone()
            .oneshot(send(
                "POST",
                "/api/resources-exceptions/",
                Some(TOKEN),
                json!({"resource_id": Uuid::new_v4()}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // success
        let response = app
            .clone()
            .oneshot(send(
                "POST",
                "/api/resources-exceptions/",
                Some(TOKEN),
                json!({
                    "resource_id": resource_id,
                    "table_indexes": {"siren": "unique"},
                    "comment": "too big but wanted",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(get("/api/resources-exceptions/"))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/resources-exceptions/{}", resource_id))
                    .header("Authorization", format!("Bearer {}", TOKEN))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.exceptions.get(resource_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _state, _dir) = setup_app();
        let response = app.oneshot(get("/api/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
