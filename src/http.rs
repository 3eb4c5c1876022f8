//! Observability HTTP surface: service health, aggregate metrics, and the
//! admin breaker reset. Served by the binary next to the pipeline.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde_json::json;

use crate::context::ServerContext;

pub fn create_router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/reset/:service_id", post(reset_service))
        .route("/metrics", get(metrics))
        .with_state(ctx)
}

/// 200 while no service breaker is tripped, 503 otherwise; body carries the
/// per-service detail either way.
async fn health(State(ctx): State<Arc<ServerContext>>) -> impl IntoResponse {
    let services = ctx.health.snapshot();
    let available = ctx.health.all_available();
    let status = if available {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if available { "healthy" } else { "unhealthy" },
            "active_sessions": ctx.coordinator.session_count(),
            "services": services,
        })),
    )
}

async fn reset_service(
    State(ctx): State<Arc<ServerContext>>,
    Path(service_id): Path<String>,
) -> impl IntoResponse {
    if ctx.health.reset(&service_id) {
        (
            StatusCode::OK,
            Json(json!({ "status": "reset", "service_id": service_id })),
        )
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown service: {service_id}") })),
        )
    }
}

async fn metrics(State(ctx): State<Arc<ServerContext>>) -> impl IntoResponse {
    Json(ctx.metrics.aggregate())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    async fn serve() -> (String, Arc<ServerContext>) {
        let ctx = ServerContext::new(Settings {
            enable_metrics: false,
            ..Settings::default()
        });
        let router = create_router(ctx.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{addr}"), ctx)
    }

    #[tokio::test]
    async fn test_health_endpoint_ok() {
        let (base, _ctx) = serve().await;
        let response = reqwest::get(format!("{base}/health")).await.unwrap();
        assert_eq!(response.status(), 200);

        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert!(body["services"].get("asr_primary").is_some());
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (base, _ctx) = serve().await;
        let response = reqwest::get(format!("{base}/metrics")).await.unwrap();
        assert_eq!(response.status(), 200);

        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["total_sessions"], 0);
        assert!(body["latency_targets"]["e2e"]["target_ms"].is_number());
    }

    #[tokio::test]
    async fn test_reset_endpoints() {
        let (base, _ctx) = serve().await;
        let client = reqwest::Client::new();

        let ok = client
            .post(format!("{base}/health/reset/llm_primary"))
            .send()
            .await
            .unwrap();
        assert_eq!(ok.status(), 200);

        let missing = client
            .post(format!("{base}/health/reset/bogus"))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
    }
}
