use std::path::PathBuf;
use std::sync::Arc;

use axum::{extract::DefaultBodyLimit, routing, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use port_common::metrics;
use port_common::port::Port;
use port_common::repository::MemoryRepository;
use port_ingestor::ingestor::Ingestor;

use super::ports;
use crate::cache::ListCache;

pub type PortIngestor = Ingestor<MemoryRepository<Port>>;

/// Shared by every handler. `shutdown` is handed to each ingestion so a server shutdown also
/// stops runs that are still in progress.
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<PortIngestor>,
    /// Ingested by `POST /ports`. Relative paths resolve against the ingestor's data directory.
    pub ports_file: PathBuf,
    pub list_cache: ListCache,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        ingestor: PortIngestor,
        ports_file: impl Into<PathBuf>,
        list_cache: ListCache,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ingestor: Arc::new(ingestor),
            ports_file: ports_file.into(),
            list_cache,
            shutdown,
        }
    }
}

pub fn app(state: AppState, metrics: Option<PrometheusHandle>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/", routing::get(index))
        .route("/health", routing::get(health))
        .route(
            "/metrics",
            routing::get(move || match metrics {
                Some(ref recorder_handle) => std::future::ready(recorder_handle.render()),
                None => std::future::ready("no metrics recorder installed".to_owned()),
            }),
        )
        .route("/ports", routing::get(ports::list).post(ports::post))
        .route("/ports/from-file", routing::post(ports::post_from_file))
        .with_state(state)
        // Uploads are streamed, so the limit applies to the whole body instead of per extractor.
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(metrics::track_metrics))
}

pub async fn index() -> &'static str {
    "port ingestion api"
}

pub async fn health() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroUsize;
    use std::time::Duration;

    use assert_json_diff::assert_json_eq;
    use axum::{
        body::Body,
        http::{self, Request, StatusCode},
    };
    use http_body_util::BodyExt; // for `collect`
    use port_ingestor::ingestor::IngestorConfig;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    const BOUNDARY: &str = "port-upload-boundary";

    const PORTS: &str = r#"{
        "AEAJM": {
            "name": "Ajman",
            "city": "Ajman",
            "country": "United Arab Emirates",
            "alias": [],
            "regions": [],
            "coordinates": [55.5136433, 25.4052165],
            "province": "Ajman",
            "timezone": "Asia/Dubai",
            "unlocs": ["AEAJM"],
            "code": "52000"
        },
        "AEAUH": {
            "name": "Abu Dhabi",
            "coordinates": [54.37, 24.47],
            "city": "Abu Dhabi",
            "province": "Abu Dhabi",
            "country": "United Arab Emirates",
            "alias": [],
            "regions": [],
            "timezone": "Asia/Dubai",
            "unlocs": ["AEAUH"],
            "code": "52001"
        }
    }"#;

    fn state(data_dir: &TempDir, repository: Arc<MemoryRepository<Port>>) -> AppState {
        let config = IngestorConfig::new(data_dir.path(), NonZeroUsize::new(4).unwrap());

        AppState::new(
            Ingestor::new(repository, config),
            "ports.json",
            ListCache::new(Duration::from_secs(60)),
            CancellationToken::new(),
        )
    }

    fn test_app(data_dir: &TempDir) -> Router {
        app(
            state(data_dir, Arc::new(MemoryRepository::new())),
            None,
            1024 * 1024,
        )
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn post(uri: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method(http::Method::POST)
            .uri(uri)
            .body(body.into())
            .unwrap()
    }

    fn multipart_body(field: &str, contents: &str) -> String {
        format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"{field}\"; filename=\"ports.json\"\r\n\
             Content-Type: application/json\r\n\
             \r\n\
             {contents}\r\n\
             --{BOUNDARY}--\r\n"
        )
    }

    fn upload_request() -> http::request::Builder {
        Request::builder()
            .method(http::Method::POST)
            .uri("/ports/from-file")
            .header(
                http::header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
    }

    /// A multipart/form-data upload with a single field.
    fn upload(field: &str, contents: &str) -> Request<Body> {
        upload_request()
            .body(Body::from(multipart_body(field, contents)))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn index() {
        let data_dir = TempDir::new().unwrap();
        let response = test_app(&data_dir).oneshot(get("/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"port ingestion api");
    }

    #[tokio::test]
    async fn health() {
        let data_dir = TempDir::new().unwrap();
        let response = test_app(&data_dir).oneshot(get("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn metrics_without_recorder() {
        let data_dir = TempDir::new().unwrap();
        let response = test_app(&data_dir).oneshot(get("/metrics")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"no metrics recorder installed");
    }

    #[tokio::test]
    async fn list_is_empty_before_ingestion() {
        let data_dir = TempDir::new().unwrap();
        let response = test_app(&data_dir).oneshot(get("/ports")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[http::header::CONTENT_TYPE],
            "application/json"
        );
        assert_json_eq!(body_json(response).await, json!({}));
    }

    #[tokio::test]
    async fn upload_then_list() {
        let data_dir = TempDir::new().unwrap();
        let app = test_app(&data_dir);

        let response = app.clone().oneshot(upload("file", PORTS)).await.unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_json_eq!(
            body_json(response).await,
            json!({"created": 2, "updated": 0})
        );

        let response = app.oneshot(get("/ports")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let ports = body_json(response).await;
        assert_eq!(ports.as_object().unwrap().len(), 2);
        assert_eq!(ports["AEAJM"]["name"], "Ajman");
        assert_eq!(ports["AEAUH"]["coordinates"], json!([54.37, 24.47]));
    }

    #[tokio::test]
    async fn upload_without_file_field() {
        let data_dir = TempDir::new().unwrap();
        let repository = Arc::new(MemoryRepository::new());
        let app = app(state(&data_dir, repository.clone()), None, 1024 * 1024);

        let response = app.oneshot(upload("document", PORTS)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_json_eq!(body_json(response).await, json!({"error": "file not found"}));
        assert!(repository.is_empty().await);
    }

    #[tokio::test]
    async fn upload_without_multipart_framing() {
        let data_dir = TempDir::new().unwrap();
        let response = test_app(&data_dir)
            .oneshot(post("/ports/from-file", PORTS))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upload_with_malformed_document() {
        let data_dir = TempDir::new().unwrap();
        let app = test_app(&data_dir);

        let response = app
            .clone()
            .oneshot(upload("file", r#"["AEAJM"]"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body_json(response).await;
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("expected opening delimiter"));

        let response = app.oneshot(get("/ports")).await.unwrap();
        assert_json_eq!(body_json(response).await, json!({}));
    }

    #[tokio::test]
    async fn post_ingests_default_file() {
        let data_dir = TempDir::new().unwrap();
        std::fs::write(data_dir.path().join("ports.json"), PORTS).unwrap();
        let app = test_app(&data_dir);

        let response = app
            .clone()
            .oneshot(post("/ports", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        // A second run updates what the first one created.
        let response = app.oneshot(post("/ports", Body::empty())).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_json_eq!(
            body_json(response).await,
            json!({"created": 0, "updated": 2})
        );
    }

    #[tokio::test]
    async fn post_with_missing_default_file() {
        let data_dir = TempDir::new().unwrap();
        let response = test_app(&data_dir)
            .oneshot(post("/ports", Body::empty()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body_json(response).await;
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("failed to open"));
    }

    #[tokio::test]
    async fn list_is_refreshed_after_ingestion() {
        let data_dir = TempDir::new().unwrap();
        std::fs::write(data_dir.path().join("ports.json"), PORTS).unwrap();
        let app = test_app(&data_dir);

        // Fills the cache with the empty listing.
        let response = app.clone().oneshot(get("/ports")).await.unwrap();
        assert_json_eq!(body_json(response).await, json!({}));

        let response = app
            .clone()
            .oneshot(post("/ports", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app.clone().oneshot(get("/ports")).await.unwrap();
        let ports = body_json(response).await;
        assert_eq!(ports.as_object().unwrap().len(), 2);

        let document = r#"{"AEDXB": {"name": "Dubai"}}"#;
        let response = app.clone().oneshot(upload("file", document)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app.oneshot(get("/ports")).await.unwrap();
        let ports = body_json(response).await;
        assert_eq!(ports.as_object().unwrap().len(), 3);
        assert_eq!(ports["AEDXB"]["name"], "Dubai");
    }

    #[tokio::test]
    async fn upload_over_limit() {
        let data_dir = TempDir::new().unwrap();
        let repository = Arc::new(MemoryRepository::new());
        let app = app(state(&data_dir, repository.clone()), None, 16);

        let body = multipart_body("file", PORTS);
        let request = upload_request()
            .header(http::header::CONTENT_LENGTH, body.len())
            .body(Body::from(body))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(repository.is_empty().await);
    }
}
