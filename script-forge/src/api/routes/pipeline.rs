//! Pipeline routes.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::pipeline::{PipelineManager, PipelineOptions, PipelineStats, RunStatus, WorkItem};

/// Create the pipeline router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/runs", post(start_run))
        .route("/runs/{request_id}", get(get_run))
        .route("/stats", get(get_stats))
}

/// Body of a pipeline trigger.
#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    pub items: Vec<WorkItem>,
    #[serde(default)]
    pub options: PipelineOptions,
}

#[derive(Debug, Serialize)]
pub struct StartRunResponse {
    pub request_id: String,
}

fn manager(state: &AppState) -> ApiResult<&Arc<PipelineManager>> {
    state
        .pipeline_manager
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("Pipeline manager not available"))
}

/// Start a run; processing continues in the background.
async fn start_run(
    State(state): State<AppState>,
    Json(request): Json<StartRunRequest>,
) -> ApiResult<(StatusCode, Json<StartRunResponse>)> {
    let manager = manager(&state)?;
    if !state.backend_ready {
        return Err(ApiError::backend_unavailable(
            "Generation backend credentials are not configured",
        ));
    }

    let request_id = manager.start(request.items, request.options)?;
    Ok((StatusCode::ACCEPTED, Json(StartRunResponse { request_id })))
}

async fn get_run(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> ApiResult<Json<RunStatus>> {
    let manager = manager(&state)?;
    manager
        .run_status(&request_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Run '{}' not found", request_id)))
}

async fn get_stats(State(state): State<AppState>) -> ApiResult<Json<PipelineStats>> {
    Ok(Json(manager(&state)?.stats()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineVariant;

    #[test]
    fn test_request_deserialize_with_default_options() {
        let json = r#"{"items": [{"topic": "Neon Hearts", "lines": ["a", "b"]}]}"#;
        let request: StartRunRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.items.len(), 1);
        assert_eq!(request.options.variant, PipelineVariant::Sequential);
    }

    #[test]
    fn test_request_options() {
        let json = r#"{
            "items": [{"topic": "t", "lines": ["a"]}],
            "options": {"variant": "fan_out", "segment_size": 2, "enrichment": true}
        }"#;
        let request: StartRunRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.options.variant, PipelineVariant::FanOut);
        assert_eq!(request.options.segment_size, 2);
        assert!(request.options.enrichment);
    }
}
