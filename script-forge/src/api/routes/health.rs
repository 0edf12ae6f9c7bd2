//! Readiness and liveness probes.

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use crate::api::server::AppState;

/// Router mounted at `/health`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(readiness))
        .route("/live", get(liveness))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

impl From<bool> for HealthStatus {
    fn from(ok: bool) -> Self {
        if ok { Self::Healthy } else { Self::Degraded }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
}

impl ComponentHealth {
    fn check(name: &'static str, ok: bool, problem: &'static str) -> Self {
        Self {
            name,
            status: ok.into(),
            message: (!ok).then_some(problem),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub components: Vec<ComponentHealth>,
}

#[derive(Debug, Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
}

/// Degraded while the backend credential is missing or no manager runs.
/// The server keeps answering either way.
async fn readiness(State(state): State<AppState>) -> Json<HealthResponse> {
    let components = vec![
        ComponentHealth::check(
            "generation_backend",
            state.backend_ready,
            "API key not configured",
        ),
        ComponentHealth::check(
            "pipeline_manager",
            state.pipeline_manager.is_some(),
            "not running",
        ),
    ];
    let status = components
        .iter()
        .all(|c| c.status == HealthStatus::Healthy)
        .into();

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.start_time.elapsed().as_secs(),
        components,
    })
}

async fn liveness(State(state): State<AppState>) -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "alive",
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::LogHub;

    #[tokio::test]
    async fn test_degraded_without_backend() {
        let Json(report) = readiness(State(AppState::new(LogHub::new()))).await;

        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.components.len(), 2);
        assert_eq!(report.components[0].message, Some("API key not configured"));
    }

    #[tokio::test]
    async fn test_ready_backend_component() {
        let state = AppState::new(LogHub::new()).with_backend_ready(true);
        let Json(report) = readiness(State(state)).await;

        let backend = &report.components[0];
        assert_eq!(backend.status, HealthStatus::Healthy);
        let wire = serde_json::to_value(backend).unwrap();
        assert_eq!(wire["status"], "healthy");
        assert!(wire.get("message").is_none());
    }
}
