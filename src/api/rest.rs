//! REST and SSE surface of the daemon.
//!
//! Thin layer: validation and status mapping happen here, everything else is
//! delegated to the registry and the store.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use crate::domain::registry::{ClusterOpError, InstallationRegistry, RunFixError};
use crate::domain::store::ClusterStore;
use crate::domain::types::{Cluster, ClusterHealth, Installation, InstallationRequest, LogEntry};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<InstallationRegistry>,
    pub store: Arc<ClusterStore>,
    pub started: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/installations", post(start_installation))
        .route("/api/v1/installations/{id}", get(installation_status))
        .route("/api/v1/installations/{id}/logs", get(installation_logs))
        .route("/api/v1/installations/{id}/events", get(installation_events))
        .route("/api/v1/installations/{id}/cancel", post(cancel_installation))
        .route("/api/v1/installations/{id}/retry", post(retry_installation))
        .route("/api/v1/fix", post(run_fix))
        .route("/api/v1/clusters", get(list_clusters))
        .route("/api/v1/clusters/{id}", delete(delete_cluster))
        .route("/api/v1/clusters/{id}/kubeconfig", get(cluster_kubeconfig))
        .route("/api/v1/clusters/{id}/health", get(cluster_health))
        .with_state(state)
}

type ApiError = (StatusCode, String);

fn not_found() -> ApiError {
    (StatusCode::NOT_FOUND, "installation not found".into())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started.elapsed().as_secs(),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    installation_id: String,
    status: &'static str,
}

async fn start_installation(
    State(state): State<AppState>,
    Json(request): Json<InstallationRequest>,
) -> Result<(StatusCode, Json<StartResponse>), ApiError> {
    if request.cluster_name.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "clusterName must not be empty".into(),
        ));
    }
    if request.master_nodes.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "at least one master node is required".into(),
        ));
    }
    let id = state.registry.start(request);
    Ok((
        StatusCode::ACCEPTED,
        Json(StartResponse {
            installation_id: id,
            status: "running",
        }),
    ))
}

async fn installation_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Installation>, ApiError> {
    state.registry.get(&id).map(Json).ok_or_else(not_found)
}

#[derive(Serialize)]
struct LogsResponse {
    logs: Vec<LogEntry>,
}

async fn installation_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<LogsResponse>, ApiError> {
    state
        .registry
        .logs(&id)
        .map(|logs| Json(LogsResponse { logs }))
        .ok_or_else(not_found)
}

/// Live event stream. History is replayed first, then events arrive as they
/// happen; an unknown id yields an open, live-only stream.
async fn installation_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Sse<impl Stream<Item = Result<SseEvent, axum::Error>>> {
    let (_observer, rx) = state.registry.attach(&id);
    let stream =
        UnboundedReceiverStream::new(rx).map(|event| SseEvent::default().json_data(&event));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

async fn cancel_installation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    if state.registry.cancel(&id) {
        Ok(Json(MessageResponse {
            message: "installation cancelled".into(),
        }))
    } else if state.registry.get(&id).is_some() {
        Err((StatusCode::CONFLICT, "installation is not running".into()))
    } else {
        Err(not_found())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RetryResponse {
    new_installation_id: String,
}

async fn retry_installation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<RetryResponse>), ApiError> {
    state
        .registry
        .retry(&id)
        .map(|new_id| {
            (
                StatusCode::ACCEPTED,
                Json(RetryResponse {
                    new_installation_id: new_id,
                }),
            )
        })
        .ok_or_else(not_found)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FixRequest {
    installation_id: String,
    node_ip: String,
    fix_action: String,
}

async fn run_fix(
    State(state): State<AppState>,
    Json(request): Json<FixRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    match state
        .registry
        .run_fix(&request.installation_id, &request.node_ip, &request.fix_action)
        .await
    {
        Ok(()) => Ok(Json(MessageResponse {
            message: "fix routine finished".into(),
        })),
        Err(e @ (RunFixError::InstallationNotFound | RunFixError::NodeNotFound)) => {
            Err((StatusCode::NOT_FOUND, e.to_string()))
        }
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

async fn list_clusters(State(state): State<AppState>) -> Result<Json<Vec<Cluster>>, ApiError> {
    state
        .store
        .list()
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn delete_cluster(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    match state.store.delete(&id).await {
        Ok(true) => Ok(Json(MessageResponse {
            message: "cluster deleted".into(),
        })),
        Ok(false) => Err((StatusCode::NOT_FOUND, "cluster not found".into())),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

fn cluster_error(e: ClusterOpError) -> ApiError {
    match e {
        ClusterOpError::NotFound => (StatusCode::NOT_FOUND, e.to_string()),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Serve the admin kubeconfig as a file download.
async fn cluster_kubeconfig(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let config = state
        .registry
        .kubeconfig(&id)
        .await
        .map_err(cluster_error)?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/x-yaml".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"kubeconfig-{id}.yaml\""),
            ),
        ],
        config,
    ))
}

async fn cluster_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ClusterHealth>, ApiError> {
    state
        .registry
        .cluster_health(&id)
        .await
        .map(Json)
        .map_err(cluster_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, RegistryConfig};
    use crate::domain::crypto::SecretCipher;
    use crate::domain::engine::AutomationEngine;
    use crate::shell::mock::MockShell;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app_with_store(dir: &tempfile::TempDir) -> (Router, Arc<ClusterStore>) {
        let engine = AutomationEngine::new(
            Arc::new(MockShell::new()),
            EngineConfig {
                scripts_dir: dir.path().to_path_buf(),
                connect_timeout_secs: 1,
                addon_settle_secs: 0,
                validation_delay_secs: 0,
                simulation_step_ms: 0,
            },
        );
        let store = Arc::new(ClusterStore::new(
            dir.path().join("clusters.json"),
            SecretCipher::with_key([2u8; 32]),
        ));
        let registry = InstallationRegistry::new(engine, store.clone(), RegistryConfig::default());
        let router = router(AppState {
            registry,
            store: store.clone(),
            started: Instant::now(),
        });
        (router, store)
    }

    fn app(dir: &tempfile::TempDir) -> Router {
        app_with_store(dir).0
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(&dir)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn start_rejects_requests_without_masters() {
        let dir = tempfile::tempdir().unwrap();
        let body = serde_json::json!({
            "clusterName": "demo",
            "k8sVersion": "1.28.2",
            "networkPlugin": "flannel",
            "masterNodes": []
        });
        let response = app(&dir)
            .oneshot(
                Request::post("/api/v1/installations")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_installation_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(&dir)
            .oneshot(
                Request::get("/api/v1/installations/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn simulated_cluster_kubeconfig_downloads_as_yaml() {
        use crate::domain::types::{Addons, AuthSecret, Node};

        let dir = tempfile::tempdir().unwrap();
        let (app, store) = app_with_store(&dir);
        store
            .upsert(&Cluster {
                id: "sim-1".into(),
                cluster_name: "demo".into(),
                k8s_version: "1.28.2".into(),
                network_plugin: "flannel".into(),
                master_nodes: vec![Node {
                    ip: "10.0.0.1".into(),
                    username: "root".into(),
                    auth_secret: AuthSecret::Password("pw".into()),
                    hostname: None,
                }],
                worker_nodes: Vec::new(),
                addons: Addons::default(),
                status: "healthy".into(),
                endpoint: "https://10.0.0.1:6443".into(),
                node_count: 1,
                simulation_mode: true,
                created_at: None,
                updated_at: None,
            })
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::get("/api/v1/clusters/sim-1/kubeconfig")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/x-yaml"
        );
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let body = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(body.contains("server: https://10.0.0.1:6443"));
    }

    #[tokio::test]
    async fn unknown_cluster_health_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(&dir)
            .oneshot(
                Request::get("/api/v1/clusters/nope/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn empty_cluster_list_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(&dir)
            .oneshot(Request::get("/api/v1/clusters").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&bytes[..], b"[]");
    }
}
