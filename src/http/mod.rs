//! HTTP/SSE boundary (§6 "Exposed", A.5): a thin `axum` router over
//! `Engine`'s Read/Subscription/Control API. Every handler maps an
//! `EngineError` onto a status code via `ApiError` rather than unwrapping,
//! since a forbidden kind or an unknown context name is routine client
//! input, not a process-level failure.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::errors::EngineError;
use crate::k8s::timeline::{FilterPreset, QueryOptions};
use crate::k8s::Engine;

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/api/resources/:kind", get(list_resources))
        .route("/api/resources/:kind/:namespace/:name", get(get_resource))
        .route("/api/resources/:kind/:namespace/:name/status", get(status_of))
        .route("/api/timeline", get(timeline_query))
        .route("/api/timeline/owner/:kind/:namespace/:name", get(timeline_for_owner))
        .route("/api/timeline/metrics", get(timeline_metrics))
        .route("/api/capabilities", get(capabilities))
        .route("/api/cluster-info", get(cluster_info))
        .route("/api/resource-catalog", get(resource_catalog))
        .route("/api/diagnostics", get(diagnostics))
        .route("/api/connection-status", get(connection_status))
        .route("/api/control/switch-context", post(switch_context))
        .route("/api/control/retry-connection", post(retry_connection))
        .route("/api/control/invalidate-capabilities", post(invalidate_capabilities))
        .route("/api/control/reset", post(reset_all))
        .route("/api/subscribe", get(subscribe))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

/// Uniform error envelope for every non-2xx response.
struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::NotFound { .. } | EngineError::UnknownKind { .. } => StatusCode::NOT_FOUND,
            EngineError::AmbiguousKind { .. } => StatusCode::CONFLICT,
            EngineError::Auth { .. } | EngineError::ForbiddenKind { .. } => StatusCode::FORBIDDEN,
            EngineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            EngineError::Config(_) | EngineError::Fatal { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_GATEWAY,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Comma-separated list query param, since `serde_urlencoded` (what axum's
/// `Query` extractor uses) has no way to collect repeated same-name keys
/// into a `Vec` the way some other web frameworks do.
fn split_csv(value: &Option<String>) -> Vec<String> {
    value
        .as_deref()
        .map(|csv| csv.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct NamespacesQuery {
    namespace: Option<String>,
}

async fn list_resources(
    State(engine): State<Arc<Engine>>,
    Path(kind): Path<String>,
    Query(params): Query<NamespacesQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let namespaces = split_csv(&params.namespace);
    let items = engine.list(&kind, &namespaces).await?;
    Ok(Json(serde_json::json!({ "items": items })))
}

#[derive(Debug, Deserialize)]
struct GroupQuery {
    group: Option<String>,
}

async fn get_resource(
    State(engine): State<Arc<Engine>>,
    Path((kind, namespace, name)): Path<(String, String, String)>,
    Query(params): Query<GroupQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ns = if namespace == "_" { None } else { Some(namespace.as_str()) };
    let snapshot = engine.get(&kind, ns, &name, params.group.as_deref()).await?;
    Ok(Json(serde_json::to_value(snapshot).unwrap_or_default()))
}

async fn status_of(
    State(engine): State<Arc<Engine>>,
    Path((kind, namespace, name)): Path<(String, String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = engine.status_of(&kind, &namespace, &name).await?;
    Ok(Json(serde_json::to_value(status).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
struct TimelineQuery {
    namespace: Option<String>,
    kind: Option<String>,
    since: Option<chrono::DateTime<chrono::Utc>>,
    limit: Option<usize>,
    include_k8s_events: Option<bool>,
    include_managed: Option<bool>,
    filter_preset: Option<String>,
}

async fn timeline_query(
    State(engine): State<Arc<Engine>>,
    Query(params): Query<TimelineQuery>,
) -> Json<serde_json::Value> {
    let mut options = QueryOptions::new();
    options.namespaces = split_csv(&params.namespace);
    options.kinds = split_csv(&params.kind);
    options.since = params.since;
    if let Some(limit) = params.limit {
        options.limit = limit;
    }
    if let Some(flag) = params.include_k8s_events {
        options.include_k8s_events = flag;
    }
    if let Some(flag) = params.include_managed {
        options.include_managed = flag;
    }
    options.filter_preset = params.filter_preset.as_deref().map(FilterPreset::parse);

    let events = engine.timeline_query(&options).await;
    Json(serde_json::json!({ "items": events }))
}

#[derive(Debug, Deserialize)]
struct OwnerQuery {
    since: Option<chrono::DateTime<chrono::Utc>>,
    limit: Option<usize>,
}

async fn timeline_for_owner(
    State(engine): State<Arc<Engine>>,
    Path((kind, namespace, name)): Path<(String, String, String)>,
    Query(params): Query<OwnerQuery>,
) -> Json<serde_json::Value> {
    let events = engine
        .timeline_changes_for_owner(&kind, &namespace, &name, params.since, params.limit.unwrap_or(500))
        .await;
    Json(serde_json::json!({ "items": events }))
}

async fn timeline_metrics(State(engine): State<Arc<Engine>>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(engine.timeline_debug_metrics().await).unwrap_or_default())
}

async fn capabilities(State(engine): State<Arc<Engine>>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(engine.capabilities().await).unwrap_or_default())
}

async fn cluster_info(State(engine): State<Arc<Engine>>) -> Result<Json<serde_json::Value>, ApiError> {
    let info = engine.cluster_info().await?;
    Ok(Json(serde_json::to_value(info).unwrap_or_default()))
}

async fn resource_catalog(State(engine): State<Arc<Engine>>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(engine.resource_catalog().await).unwrap_or_default())
}

async fn diagnostics(State(engine): State<Arc<Engine>>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(engine.diagnostics()).unwrap_or_default())
}

async fn connection_status(State(engine): State<Arc<Engine>>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(engine.connection_status().await).unwrap_or_default())
}

#[derive(Debug, Deserialize)]
struct SwitchContextBody {
    name: String,
}

async fn switch_context(
    State(engine): State<Arc<Engine>>,
    Json(body): Json<SwitchContextBody>,
) -> Result<StatusCode, ApiError> {
    engine.switch_context(&body.name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn retry_connection(State(engine): State<Arc<Engine>>) -> Result<StatusCode, ApiError> {
    engine.retry_connection().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn invalidate_capabilities(State(engine): State<Arc<Engine>>) -> StatusCode {
    engine.invalidate_capabilities().await;
    StatusCode::NO_CONTENT
}

async fn reset_all(State(engine): State<Arc<Engine>>) -> Result<StatusCode, ApiError> {
    engine.reset_all().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `subscribe() -> (stream, close_handle)` (§6), translated to an SSE
/// response. The subscription handle is dropped when the connection closes,
/// which tears down just this one subscriber (`Broadcaster::unsubscribe`).
async fn subscribe(
    State(engine): State<Arc<Engine>>,
) -> Sse<impl Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let (receiver, _subscription) = engine.subscribe().await;
    let stream = ReceiverStream::new(receiver).map(|message| {
        let event = SseEvent::default().json_data(message).unwrap_or_else(|_| SseEvent::default());
        Ok(event)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forbidden_kind_maps_to_403() {
        let response = ApiError(EngineError::ForbiddenKind { kind: "Secret".to_string() }).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn not_found_maps_to_404() {
        let response = ApiError(EngineError::NotFound {
            kind: "Pod".to_string(),
            name: "x".to_string(),
            namespace: None,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ambiguous_kind_maps_to_409() {
        let response = ApiError(EngineError::AmbiguousKind {
            kind: "Application".to_string(),
            groups: vec!["argoproj.io".to_string(), "app.k8s.io".to_string()],
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
