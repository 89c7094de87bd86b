use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use threadview_api::{MigrateResult, SchemaStatus, ThreadViewApi, API_CONTRACT_VERSION};
use threadview_core::{ThreadError, ThreadParams, ThreadView, MAX_THREAD_BOUND, RENDER_STACK_SIZE};
use tracing::info;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const VIEWER_HEADER: &str = "x-viewer-did";
const REPO_REV_HEADER: &str = "atproto-repo-rev";

#[derive(Debug, Clone)]
struct ServiceState {
    api: ThreadViewApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: &'static str,
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Query string of `/v1/feed/post-thread`. Bounds are signed so negative
/// values reach the same error envelope as oversized ones.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostThreadQuery {
    uri: String,
    depth: Option<i64>,
    parent_height: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
struct PostThreadResponse {
    thread: ThreadView,
}

#[derive(Debug, Parser)]
#[command(name = "threadview-service")]
#[command(about = "Local HTTP service rendering post threads")]
struct Args {
    #[arg(long, default_value = "./threadview.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    /// Used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_filter: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn internal(err: &anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: "InternalServerError",
            message: err.to_string(),
        }
    }
}

impl From<ThreadError> for ServiceError {
    fn from(err: ThreadError) -> Self {
        let status = match &err {
            ThreadError::NotFound(_) => StatusCode::NOT_FOUND,
            ThreadError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ThreadError::Collaborator(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: err.code(),
            message: err.to_string(),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/feed/post-thread", get(feed_post_thread))
        .with_state(state)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&args.log_filter))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Handlers serialize whole thread trees on the worker threads.
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_stack_size(RENDER_STACK_SIZE)
        .build()
        .context("failed to start async runtime")?
        .block_on(serve(args))
}

async fn serve(args: Args) -> Result<()> {
    let api = ThreadViewApi::new(args.db.clone());
    let migrated = api.migrate(false)?;
    info!(
        db = %args.db.display(),
        schema_version = ?migrated.after_version,
        "schema ready"
    );

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, db = %args.db.display(), "threadview service listening");
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceError::internal(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run).map_err(|err| ServiceError::internal(&err))?;
    Ok(Json(envelope(result)))
}

async fn feed_post_thread(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    query: Result<Query<PostThreadQuery>, QueryRejection>,
) -> Result<Response, ServiceError> {
    let Query(query) =
        query.map_err(|rejection| ThreadError::InvalidRequest(rejection.body_text()))?;
    let viewer = headers
        .get(VIEWER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let params = ThreadParams::new(
        query.uri,
        viewer,
        bound("depth", query.depth)?,
        bound("parentHeight", query.parent_height)?,
    )?;

    let response = state.api.post_thread(params).await?;
    let mut headers = HeaderMap::new();
    if let Some(rev) = response.repo_rev.as_deref().and_then(|rev| HeaderValue::from_str(rev).ok()) {
        headers.insert(REPO_REV_HEADER, rev);
    }
    Ok((headers, Json(envelope(PostThreadResponse { thread: response.thread })))
        .into_response())
}

fn bound(name: &str, value: Option<i64>) -> Result<Option<u32>, ThreadError> {
    value
        .map(|value| {
            u32::try_from(value).map_err(|_| {
                ThreadError::InvalidRequest(format!(
                    "{name} MUST be in 0..={MAX_THREAD_BOUND}, got {value}"
                ))
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use threadview_api::{AddGateRequest, AddPostRequest, NewActor};
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("threadview-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn cleanup(db_path: &std::path::Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", db_path.display(), suffix));
        }
    }

    async fn send(router: Router, request: Request<axum::body::Body>) -> Response {
        match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn get_request(uri: &str, viewer: Option<&str>) -> Request<axum::body::Body> {
        let mut builder = Request::builder().uri(uri).method("GET");
        if let Some(viewer) = viewer {
            builder = builder.header(VIEWER_HEADER, viewer);
        }
        builder
            .body(axum::body::Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    /// Root by alice with an owner-only gate, one reply by bob.
    fn seed(api: &ThreadViewApi) -> Result<(String, String)> {
        for did in ["did:plc:alice", "did:plc:bob"] {
            api.add_actor(NewActor {
                did: did.to_string(),
                handle: Some(format!("{}.test", did.trim_start_matches("did:plc:"))),
                display_name: None,
                avatar_cid: None,
            })?;
        }
        let root = api.add_post(AddPostRequest {
            author: "did:plc:alice".to_string(),
            text: "root".to_string(),
            ..AddPostRequest::default()
        })?;
        let reply = api.add_post(AddPostRequest {
            author: "did:plc:bob".to_string(),
            text: "reply".to_string(),
            reply_to: Some(root.uri.clone()),
            ..AddPostRequest::default()
        })?;
        api.add_gate(AddGateRequest { post_uri: root.uri.clone(), allow: Some(Vec::new()) })?;
        api.set_repo_rev("did:plc:alice", "3kalicerev")?;
        Ok((root.uri, reply.uri))
    }

    fn seeded_api(db_path: &std::path::Path) -> (ThreadViewApi, String, String) {
        let api = ThreadViewApi::new(db_path.to_path_buf());
        match seed(&api) {
            Ok((root, reply)) => (api, root, reply),
            Err(err) => panic!("failed to seed fixture: {err}"),
        }
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = app(ServiceState { api: ThreadViewApi::new(unique_temp_db_path()) });

        let response = send(router, get_request("/v1/health", None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let router = app(ServiceState { api: ThreadViewApi::new(unique_temp_db_path()) });

        let response = send(router, get_request("/v1/openapi", None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = String::from_utf8_lossy(&bytes);
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/feed/post-thread"));
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn post_thread_returns_envelope_and_repo_rev_header() {
        let db_path = unique_temp_db_path();
        let (api, root, reply) = seeded_api(&db_path);
        let router = app(ServiceState { api });

        let response = send(
            router,
            get_request(&format!("/v1/feed/post-thread?uri={root}&depth=1"), Some("did:plc:alice")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(REPO_REV_HEADER).and_then(|value| value.to_str().ok()),
            Some("3kalicerev")
        );

        let value = response_json(response).await;
        assert_eq!(
            value.get("api_contract_version").and_then(serde_json::Value::as_str),
            Some(API_CONTRACT_VERSION)
        );
        let thread = &value["data"]["thread"];
        assert_eq!(thread["$type"], "app.bsky.feed.defs#threadViewPost");
        assert_eq!(thread["post"]["uri"], root.as_str());
        assert_eq!(thread["viewer"]["canReply"], true);
        assert_eq!(thread["replies"][0]["post"]["uri"], reply.as_str());
        assert!(thread.get("parent").is_none());

        cleanup(&db_path);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn post_thread_maps_errors_to_status_codes() {
        let db_path = unique_temp_db_path();
        let (api, root, _reply) = seeded_api(&db_path);
        let router = app(ServiceState { api });

        let missing = send(
            router.clone(),
            get_request("/v1/feed/post-thread?uri=at://did:plc:alice/app.bsky.feed.post/missing", None),
        )
        .await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        let value = response_json(missing).await;
        assert_eq!(value["error"], "NotFound");
        assert_eq!(
            value["message"],
            "Post not found: at://did:plc:alice/app.bsky.feed.post/missing"
        );

        for query in [
            format!("uri={root}&depth=1001"),
            format!("uri={root}&parentHeight=-1"),
            "uri=not-a-uri".to_string(),
        ] {
            let response = send(
                router.clone(),
                get_request(&format!("/v1/feed/post-thread?{query}"), None),
            )
            .await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "query {query}");
            let value = response_json(response).await;
            assert_eq!(value["error"], "InvalidRequest");
        }

        cleanup(&db_path);
    }

    // Test IDs: TSVC-006
    #[tokio::test]
    async fn malformed_queries_stay_inside_the_error_envelope() {
        let db_path = unique_temp_db_path();
        let (api, root, _reply) = seeded_api(&db_path);
        let router = app(ServiceState { api });

        for (query, fragment) in [
            (format!("uri={root}&depth=abc"), "Failed to deserialize query string"),
            ("depth=2".to_string(), "uri"),
            (format!("uri={root}&parentHeight=5000000000"), "parentHeight MUST be in 0..=1000"),
            (format!("uri={root}&depth=-3"), "depth MUST be in 0..=1000"),
        ] {
            let response = send(
                router.clone(),
                get_request(&format!("/v1/feed/post-thread?{query}"), None),
            )
            .await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "query {query}");
            let value = response_json(response).await;
            assert_eq!(value["service_contract_version"], SERVICE_CONTRACT_VERSION);
            assert_eq!(value["error"], "InvalidRequest");
            let message = value["message"].as_str().unwrap_or_default();
            assert!(message.contains(fragment), "query {query}: {message}");
        }

        cleanup(&db_path);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn migrate_endpoint_supports_dry_run() {
        let db_path = unique_temp_db_path();
        let router = app(ServiceState { api: ThreadViewApi::new(db_path.clone()) });

        let response = send(
            router.clone(),
            Request::builder()
                .uri("/v1/db/migrate")
                .method("POST")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(r#"{"dry_run": true}"#))
                .unwrap_or_else(|err| panic!("failed to build migrate request: {err}")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value["data"]["dry_run"], true);
        assert_eq!(value["data"]["current_version"], 0);

        let response = send(
            router,
            Request::builder()
                .uri("/v1/db/schema-version")
                .method("POST")
                .body(axum::body::Body::empty())
                .unwrap_or_else(|err| panic!("failed to build schema request: {err}")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value["data"]["current_version"], 0);

        cleanup(&db_path);
    }
}
