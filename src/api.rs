//! Read-only HTTP query surface for dashboards.

use crate::app_state::McpService;
use crate::approval_workflow::{BatchStatus, PendingValidationBatch};
use crate::correction_recorder::OverrideRecord;
use crate::errors::McpResult;
use crate::mcp::{MasterControlPoint, McpState};
use axum::{
    extract::{Extension, Path, Query},
    http::Method,
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[derive(Debug, Deserialize)]
pub struct ValidationQuery {
    pub status: Option<BatchStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateResponse {
    pub model_id: String,
    pub state: McpState,
}

pub fn build_query_router(service: Arc<McpService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET]);

    Router::new()
        .route("/api/mcp", get(list_models))
        .route("/api/mcp/{model_id}", get(get_mcp))
        .route("/api/mcp/{model_id}/state", get(get_state))
        .route("/api/mcp/{model_id}/overrides", get(get_overrides))
        .route("/api/validations", get(list_validations))
        .route("/api/validations/{batch_id}", get(get_validation))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(Extension(service))
        .layer(cors)
}

async fn list_models(Extension(service): Extension<Arc<McpService>>) -> McpResult<Json<Vec<String>>> {
    Ok(Json(service.repository().model_ids()?))
}

async fn get_mcp(
    Extension(service): Extension<Arc<McpService>>,
    Path(model_id): Path<String>,
) -> McpResult<Json<MasterControlPoint>> {
    Ok(Json(service.get_mcp(&model_id)?))
}

// an unknown model reports UNINITIALIZED rather than 404
async fn get_state(
    Extension(service): Extension<Arc<McpService>>,
    Path(model_id): Path<String>,
) -> McpResult<Json<StateResponse>> {
    let state = service.repository().state(&model_id)?;
    Ok(Json(StateResponse { model_id, state }))
}

async fn get_overrides(
    Extension(service): Extension<Arc<McpService>>,
    Path(model_id): Path<String>,
) -> McpResult<Json<Vec<OverrideRecord>>> {
    Ok(Json(service.get_override_history(&model_id)?))
}

async fn list_validations(
    Extension(service): Extension<Arc<McpService>>,
    Query(query): Query<ValidationQuery>,
) -> McpResult<Json<Vec<PendingValidationBatch>>> {
    Ok(Json(service.get_pending_validations(query.status)?))
}

async fn get_validation(
    Extension(service): Extension<Arc<McpService>>,
    Path(batch_id): Path<String>,
) -> McpResult<Json<PendingValidationBatch>> {
    Ok(Json(service.workflow().get(&batch_id)?))
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn readyz(Extension(service): Extension<Arc<McpService>>) -> McpResult<Json<serde_json::Value>> {
    let models = service.repository().model_ids()?.len();
    Ok(Json(serde_json::json!({ "ready": true, "models": models })))
}
