//! HTTP request handlers: thin translation onto the service API.

use super::AppState;
use crate::service::{ConnectionSpec, ListQuery, NodePatch, NodeSpec, ServiceError};

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

/// Wrapper mapping the service error taxonomy to HTTP responses.
pub struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            ServiceError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            ServiceError::AlreadyPaused => (StatusCode::CONFLICT, "already_paused"),
            ServiceError::AlreadyActive => (StatusCode::CONFLICT, "already_active"),
            ServiceError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            ServiceError::Unauthorized => (StatusCode::FORBIDDEN, "unauthorized"),
            ServiceError::Internal(e) => {
                tracing::error!("internal error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        // Internal detail stays in the logs; the client gets a generic line.
        let message = self.0.to_string();
        (status, Json(json!({ "kind": kind, "message": message }))).into_response()
    }
}

/// The acting user, taken from the opaque `x-user-id` header the auth layer
/// in front of us populates.
pub struct UserId(pub String);

impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(|v| UserId(v.to_string()))
            .ok_or_else(|| {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({
                        "kind": "unauthorized",
                        "message": "missing x-user-id header"
                    })),
                )
                    .into_response()
            })
    }
}

// ============================================================================
// Nodes
// ============================================================================

pub async fn handle_list_nodes(
    State(state): State<AppState>,
    UserId(user): UserId,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.list_nodes(&user, query)?))
}

pub async fn handle_create_node(
    State(state): State<AppState>,
    UserId(user): UserId,
    Json(spec): Json<NodeSpec>,
) -> Result<impl IntoResponse, ApiError> {
    let node = state.service.create_node(&user, spec).await?;
    Ok((StatusCode::CREATED, Json(node)))
}

pub async fn handle_get_node(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.get_node(&user, &id)?))
}

pub async fn handle_update_node(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
    Json(patch): Json<NodePatch>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.update_node(&user, &id, patch).await?))
}

pub async fn handle_delete_node(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.delete_node(&user, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_pause_node(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.pause_node(&user, &id).await?))
}

pub async fn handle_resume_node(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.resume_node(&user, &id).await?))
}

pub async fn handle_test_probe(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.test_probe(&user, &id).await?))
}

pub async fn handle_test_connection(
    State(state): State<AppState>,
    Json(spec): Json<ConnectionSpec>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.test_connection(spec).await?))
}

// ============================================================================
// Read paths
// ============================================================================

pub async fn handle_dashboard(
    State(state): State<AppState>,
    UserId(user): UserId,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.dashboard_overview(&user)?))
}

pub async fn handle_system_status(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.system_status().await?))
}
