use axum::{
    routing::{get, post},
    Router,
};

use crate::server::AppState;

use super::health::health;
use super::metrics::{metrics_snapshot, prometheus_metrics};
use super::streams::{cleanup_streams, list_streams, retry_preview, stream_status};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        // Health & exposition
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .nest(
            "/api/v1",
            Router::new()
                .route("/metrics", get(metrics_snapshot))
                // Channel table
                .route("/streams", get(list_streams))
                .route("/streams/cleanup", post(cleanup_streams))
                .route("/streams/{channel}/status", get(stream_status))
                // Diagnostics
                .route("/retry-preview/{attempt}", get(retry_preview)),
        )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tower::ServiceExt;

    use crate::clock::ManualClock;
    use crate::config::{Settings, StreamConfig};
    use crate::connection_manager::ConnectionManager;
    use crate::server::{create_app, AppState};
    use crate::transport::MemoryTransport;

    fn stream_config() -> StreamConfig {
        StreamConfig {
            endpoint: "memory://feed".to_string(),
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 5_000,
            metrics_prefix: "api".to_string(),
            ..Default::default()
        }
    }

    fn make_state() -> (AppState, MemoryTransport, Arc<ManualClock>) {
        let transport = MemoryTransport::new();
        let clock = Arc::new(ManualClock::default());
        let manager = ConnectionManager::with_clock(
            stream_config(),
            Arc::new(transport.clone()),
            clock.clone(),
        )
        .unwrap();
        let state = AppState::new(Settings::default(), Arc::new(manager));
        (state, transport, clock)
    }

    async fn get_json(state: &AppState, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        send(state, req).await
    }

    async fn send(state: &AppState, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = create_app(state.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 64 * 1024)
            .await
            .unwrap();
        let parsed = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, parsed)
    }

    #[tokio::test]
    async fn test_health_is_healthy_without_streams() {
        let (state, _, _) = make_state();
        let (status, body) = get_json(&state, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["active_connections"], 0);
        assert_eq!(body["subscribers"], 0);
    }

    #[tokio::test]
    async fn test_health_is_degraded_when_no_stream_is_connected() {
        let (state, transport, _) = make_state();
        transport.set_down("memory://feed/btcusdt@trade", true);
        let _sub = state.connection_manager.subscribe("btcusdt@trade").unwrap();

        let (status, body) = get_json(&state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["subscribers"], 1);
    }

    #[tokio::test]
    async fn test_prometheus_endpoint_serves_text_exposition() {
        let (state, _, _) = make_state();
        let req = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let resp = create_app(state).oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("text/plain; version=0.0.4"));

        let body = axum::body::to_bytes(resp.into_body(), 64 * 1024)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("# TYPE api_active_connections gauge"));
        assert!(text.contains("api_stream_creations_total 0"));
    }

    #[tokio::test]
    async fn test_json_metrics_reflect_subscriptions() {
        let (state, _, _) = make_state();
        let _a = state.connection_manager.subscribe("ethusdt@trade").unwrap();
        let _b = state.connection_manager.subscribe("ethusdt@trade").unwrap();

        let (status, body) = get_json(&state, "/api/v1/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active_connections"], 1);
        assert_eq!(body["total_stream_creations"], 1);
        assert_eq!(body["subscribers"], 2);
    }

    #[tokio::test]
    async fn test_list_streams_returns_channel_table() {
        let (state, _, _) = make_state();
        let _sub = state.connection_manager.subscribe("btcusdt@depth").unwrap();

        let (status, body) = get_json(&state, "/api/v1/streams").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_streams"], 1);
        assert_eq!(body["streams"][0]["name"], "btcusdt@depth");
        assert_eq!(body["streams"][0]["subscriber_count"], 1);
    }

    #[tokio::test]
    async fn test_stream_status_for_open_and_unknown_channels() {
        let (state, _, _) = make_state();
        let _sub = state.connection_manager.subscribe("btcusdt@trade").unwrap();

        let (status, body) = get_json(&state, "/api/v1/streams/btcusdt@trade/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["channel"], "btcusdt@trade");
        assert_eq!(body["subscriber_count"], 1);

        let (status, body) = get_json(&state, "/api/v1/streams/dogeusdt@trade/status").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_cleanup_evicts_idle_warm_streams() {
        let (state, _, clock) = make_state();
        assert!(state.connection_manager.warm("solusdt@trade").unwrap());

        clock.advance(chrono::Duration::seconds(10));

        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/streams/cleanup?idle_timeout_ms=1000")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&state, req).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["evicted"], 1);
        assert!(state.connection_manager.stream_info().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recently_active_streams() {
        let (state, _, _) = make_state();
        assert!(state.connection_manager.warm("solusdt@trade").unwrap());

        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/streams/cleanup")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&state, req).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["evicted"], 0);
        assert_eq!(state.connection_manager.stream_info().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_preview_reports_bounds() {
        let (state, _, _) = make_state();
        let (status, body) = get_json(&state, "/api/v1/retry-preview/5").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["attempt"], 5);
        assert_eq!(body["exponential_ms"], 32_000);
        assert_eq!(body["clamped_ms"], 5_000);
        assert_eq!(body["min_bound_ms"], 1_000);
        assert_eq!(body["max_bound_ms"], 5_000);
    }

    #[tokio::test]
    async fn test_unknown_route_returns_404() {
        let (state, _, _) = make_state();
        let (status, _) = get_json(&state, "/nonexistent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
