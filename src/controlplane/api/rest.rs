//! REST API Handlers
//!
//! Global endpoints for backup storages, monitoring instances and legacy
//! cluster registrations, plus the scoped endpoints mounted under both
//! `/v1/namespaces/:namespace` and `/v1/kubernetes/:kubernetes_id`.

use crate::controlplane::scope::Scope;
use crate::controlplane::service::{ControlPlane, DeclaredResource};
use crate::crd::{DatabaseCluster, DatabaseClusterBackup, DatabaseClusterRestore};
use crate::error::{Error, Result};
use axum::{
    async_trait,
    extract::{FromRequest, FromRequestParts, Json, Path, Request, State},
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

const NAMESPACE_PREFIX: &str = "/v1/namespaces/:namespace";
const CLUSTER_PREFIX: &str = "/v1/kubernetes/:kubernetes_id";

// =============================================================================
// Request/Response Types
// =============================================================================

/// Scoped list body
#[derive(Debug, Clone, Serialize)]
pub struct ItemList<T> {
    pub items: Vec<T>,
}

/// JSON body whose rejections use the API error format
pub struct JsonBody(pub Value);

#[async_trait]
impl<S: Send + Sync> FromRequest<S> for JsonBody {
    type Rejection = Error;

    async fn from_request(req: Request, state: &S) -> Result<Self> {
        let Json(value) = Json::<Value>::from_request(req, state)
            .await
            .map_err(|e| Error::Schema(e.body_text()))?;
        Ok(Self(value))
    }
}

/// Scope and optional resource name taken from the path
pub struct ScopedPath {
    pub scope: Scope,
    name: Option<String>,
}

impl ScopedPath {
    fn name(&self) -> Result<&str> {
        self.name
            .as_deref()
            .ok_or_else(|| Error::Internal("route has no name segment".into()))
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ScopedPath {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let Path(mut params) = Path::<HashMap<String, String>>::from_request_parts(parts, state)
            .await
            .map_err(|e| Error::Validation(e.body_text()))?;

        let scope = if let Some(namespace) = params.remove("namespace") {
            Scope::Namespace(namespace)
        } else if let Some(id) = params.remove("kubernetes_id") {
            Scope::Cluster(id)
        } else {
            return Err(Error::Internal("route has no scope segment".into()));
        };
        Ok(Self {
            scope,
            name: params.remove("name"),
        })
    }
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    control_plane: Arc<ControlPlane>,
}

impl RestRouter {
    pub fn new(control_plane: Arc<ControlPlane>) -> Self {
        Self { control_plane }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            control_plane: self.control_plane,
        };

        let router = Router::new()
            // Backup storages
            .route(
                "/v1/backup-storages",
                get(list_backup_storages).post(create_backup_storage),
            )
            .route(
                "/v1/backup-storages/:name",
                get(get_backup_storage)
                    .patch(patch_backup_storage)
                    .delete(delete_backup_storage),
            )
            // Monitoring instances
            .route(
                "/v1/monitoring-instances",
                get(list_monitoring_instances).post(create_monitoring_instance),
            )
            .route(
                "/v1/monitoring-instances/:name",
                get(get_monitoring_instance)
                    .patch(patch_monitoring_instance)
                    .delete(delete_monitoring_instance),
            )
            // Legacy cluster registrations
            .route("/v1/kubernetes", get(list_registrations))
            .route(CLUSTER_PREFIX, get(get_registration))
            // Health
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check));

        let router = scoped_routes(router, NAMESPACE_PREFIX);
        scoped_routes(router, CLUSTER_PREFIX)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }
}

/// Mount the scoped endpoints under a prefix
fn scoped_routes(router: Router<AppState>, prefix: &str) -> Router<AppState> {
    router
        // Database clusters
        .route(
            &format!("{}/database-clusters", prefix),
            get(list_resources::<DatabaseCluster>).post(create_resource::<DatabaseCluster>),
        )
        .route(
            &format!("{}/database-clusters/:name", prefix),
            get(get_resource::<DatabaseCluster>)
                .put(replace_resource::<DatabaseCluster>)
                .delete(delete_resource::<DatabaseCluster>),
        )
        .route(
            &format!("{}/database-clusters/:name/backups", prefix),
            get(list_owned::<DatabaseClusterBackup>),
        )
        .route(
            &format!("{}/database-clusters/:name/restores", prefix),
            get(list_owned::<DatabaseClusterRestore>),
        )
        // Backups
        .route(
            &format!("{}/database-cluster-backups", prefix),
            get(list_resources::<DatabaseClusterBackup>)
                .post(create_resource::<DatabaseClusterBackup>),
        )
        .route(
            &format!("{}/database-cluster-backups/:name", prefix),
            get(get_resource::<DatabaseClusterBackup>)
                .put(replace_resource::<DatabaseClusterBackup>)
                .delete(delete_resource::<DatabaseClusterBackup>),
        )
        // Restores
        .route(
            &format!("{}/database-cluster-restores", prefix),
            get(list_resources::<DatabaseClusterRestore>)
                .post(create_resource::<DatabaseClusterRestore>),
        )
        .route(
            &format!("{}/database-cluster-restores/:name", prefix),
            get(get_resource::<DatabaseClusterRestore>)
                .put(replace_resource::<DatabaseClusterRestore>)
                .delete(delete_resource::<DatabaseClusterRestore>),
        )
        // Engines
        .route(&format!("{}/database-engines", prefix), get(list_engines))
        .route(
            &format!("{}/database-engines/:name", prefix),
            get(get_engine).put(update_engine),
        )
        // Cluster metadata
        .route(&format!("{}/resources", prefix), get(cluster_resources))
        .route(&format!("{}/cluster-info", prefix), get(cluster_info))
        .route(
            &format!("{}/cluster-monitoring", prefix),
            axum::routing::post(set_cluster_monitoring),
        )
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    control_plane: Arc<ControlPlane>,
}

// =============================================================================
// Global Handlers
// =============================================================================

async fn list_backup_storages(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.control_plane.list_backup_storages())
}

async fn create_backup_storage(
    State(state): State<AppState>,
    JsonBody(body): JsonBody,
) -> Result<impl IntoResponse> {
    let record = state.control_plane.create_backup_storage(body).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_backup_storage(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.control_plane.get_backup_storage(&name)?))
}

async fn patch_backup_storage(
    State(state): State<AppState>,
    Path(name): Path<String>,
    JsonBody(body): JsonBody,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state.control_plane.patch_backup_storage(&name, body).await?,
    ))
}

async fn delete_backup_storage(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.control_plane.delete_backup_storage(&name).await?))
}

async fn list_monitoring_instances(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.control_plane.list_monitoring_instances())
}

async fn create_monitoring_instance(
    State(state): State<AppState>,
    JsonBody(body): JsonBody,
) -> Result<impl IntoResponse> {
    let record = state.control_plane.create_monitoring_instance(body).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_monitoring_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.control_plane.get_monitoring_instance(&name)?))
}

async fn patch_monitoring_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
    JsonBody(body): JsonBody,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state
            .control_plane
            .patch_monitoring_instance(&name, body)
            .await?,
    ))
}

async fn delete_monitoring_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state.control_plane.delete_monitoring_instance(&name).await?,
    ))
}

async fn list_registrations(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.control_plane.list_registrations())
}

async fn get_registration(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.control_plane.get_registration(&id)?))
}

/// Liveness
async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

/// Readiness follows the default orchestrator
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let orchestrator = state.control_plane.resolver().default_orchestrator();
    match orchestrator.health_check().await {
        Ok(true) => (StatusCode::OK, Json(json!({ "status": "ready" }))),
        Ok(false) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not ready" })),
        ),
        Err(e) => {
            warn!("Readiness check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "not ready", "message": e.to_string() })),
            )
        }
    }
}

// =============================================================================
// Scoped Handlers
// =============================================================================

async fn create_resource<T: DeclaredResource>(
    State(state): State<AppState>,
    path: ScopedPath,
    JsonBody(body): JsonBody,
) -> Result<impl IntoResponse> {
    let created = state
        .control_plane
        .create_resource::<T>(&path.scope, body)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_resources<T: DeclaredResource>(
    State(state): State<AppState>,
    path: ScopedPath,
) -> Result<impl IntoResponse> {
    let items = state
        .control_plane
        .list_resources::<T>(&path.scope, None)
        .await?;
    Ok(Json(ItemList { items }))
}

/// Backups or restores of one cluster
async fn list_owned<T: DeclaredResource>(
    State(state): State<AppState>,
    path: ScopedPath,
) -> Result<impl IntoResponse> {
    let items = state
        .control_plane
        .list_resources::<T>(&path.scope, Some(path.name()?))
        .await?;
    Ok(Json(ItemList { items }))
}

async fn get_resource<T: DeclaredResource>(
    State(state): State<AppState>,
    path: ScopedPath,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state
            .control_plane
            .get_resource::<T>(&path.scope, path.name()?)
            .await?,
    ))
}

async fn replace_resource<T: DeclaredResource>(
    State(state): State<AppState>,
    path: ScopedPath,
    JsonBody(body): JsonBody,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state
            .control_plane
            .replace_resource::<T>(&path.scope, path.name()?, body)
            .await?,
    ))
}

async fn delete_resource<T: DeclaredResource>(
    State(state): State<AppState>,
    path: ScopedPath,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state
            .control_plane
            .delete_resource::<T>(&path.scope, path.name()?)
            .await?,
    ))
}

async fn list_engines(
    State(state): State<AppState>,
    path: ScopedPath,
) -> Result<impl IntoResponse> {
    let items = state.control_plane.list_engines(&path.scope).await?;
    Ok(Json(ItemList { items }))
}

async fn get_engine(
    State(state): State<AppState>,
    path: ScopedPath,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state
            .control_plane
            .get_engine(&path.scope, path.name()?)
            .await?,
    ))
}

async fn update_engine(
    State(state): State<AppState>,
    path: ScopedPath,
    JsonBody(body): JsonBody,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state
            .control_plane
            .update_engine(&path.scope, path.name()?, body)
            .await?,
    ))
}

async fn cluster_resources(
    State(state): State<AppState>,
    path: ScopedPath,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state.control_plane.cluster_resources(&path.scope).await?,
    ))
}

async fn cluster_info(
    State(state): State<AppState>,
    path: ScopedPath,
) -> Result<impl IntoResponse> {
    Ok(Json(state.control_plane.cluster_info(&path.scope).await?))
}

async fn set_cluster_monitoring(
    State(state): State<AppState>,
    path: ScopedPath,
    JsonBody(body): JsonBody,
) -> Result<impl IntoResponse> {
    state
        .control_plane
        .set_cluster_monitoring(&path.scope, body)
        .await?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::service::testing::harness;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health_routes() {
        let router = RestRouter::new(Arc::new(harness().control_plane)).build();
        let (status, body) = send(&router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        let (status, _) = send(&router, "GET", "/ready", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_malformed_json_uses_error_body() {
        let router = RestRouter::new(Arc::new(harness().control_plane)).build();
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/v1/backup-storages")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["message"]
            .as_str()
            .unwrap()
            .starts_with("Request body has an error"));
    }

    #[tokio::test]
    async fn test_legacy_scope_not_found() {
        let router = RestRouter::new(Arc::new(harness().control_plane)).build();
        let (status, body) = send(&router, "GET", "/v1/kubernetes/unknown/database-clusters", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["message"].as_str().unwrap().contains("unknown"));

        let (status, _) = send(&router, "GET", "/v1/kubernetes/unknown", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
