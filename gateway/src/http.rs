use crate::metrics;
use crate::registry::Registry;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

#[derive(Debug, Clone)]
struct AppState {
    registry: Registry,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connected_devices: usize,
}

/// Operational endpoints: Prometheus metrics and a liveness summary
pub fn create_router(registry: Registry) -> Router {
    let state = AppState { registry };

    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health))
        .with_state(state)
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connected_devices: state.registry.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_reports_registry_size() {
        let registry = Registry::new();

        let Json(body) = health(State(AppState { registry })).await;

        assert_eq!(body.status, "ok");
        assert_eq!(body.connected_devices, 0);
    }
}
