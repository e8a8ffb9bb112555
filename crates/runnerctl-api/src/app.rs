use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use runnerctl_reconciler::Engine;
use tower_http::trace::TraceLayer;

use crate::auth::require_bearer_token;
use crate::handlers;
use crate::state::AppState;

pub fn build_app(engine: Engine, auth_token: Arc<String>) -> Router {
    let state = AppState { engine, auth_token };

    Router::new()
        // Health
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        // Allocation
        .route("/runners/allocate", post(handlers::post_allocate))
        .route("/runners/allocate/async", post(handlers::post_allocate_async))
        .route("/runners/events/:lifecycle_token", get(handlers::get_events))
        // Runner lifecycle actions
        .route("/runners/:id/report-state", post(handlers::post_report_state))
        .route("/runners/:id/extend-session", post(handlers::post_extend_session))
        .route("/runners/:id/terminate", post(handlers::post_terminate))
        .route("/runners/:id/attach-terminal", post(handlers::post_attach_terminal))
        // Inventory
        .route("/runners", get(handlers::list_runners))
        .route("/runners/:id", get(handlers::get_runner))
        .route("/images", get(handlers::list_images))
        .route("/images/:id", get(handlers::get_image))
        // Maintenance (normally cron-driven)
        .route("/maintenance/reap", post(handlers::post_reap))
        .route("/maintenance/reconcile-pools", post(handlers::post_reconcile_pools))
        .route("/maintenance/reclaim-idle", post(handlers::post_reclaim_idle))
        // Status
        .route("/status", get(handlers::status))
        .fallback(handlers::not_found)
        // Auth middleware applies to all routes above
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer_token))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use runnerctl_driver::{DriverRegistry, LocalDriver};
    use runnerctl_reconciler::EngineConfig;
    use runnerctl_store::InMemoryStore;
    use tower::util::ServiceExt;

    const TEST_TOKEN: &str = "test-token";

    fn test_app() -> Router {
        let store: Arc<dyn runnerctl_store::RunnerStore> = Arc::new(InMemoryStore::new());
        let mut registry = DriverRegistry::new();
        registry.register(runnerctl_domain::CloudProvider::Local, Arc::new(LocalDriver::new()));
        let engine = Engine::new(
            store,
            Arc::new(registry),
            runnerctl_crypto::EncryptionKey::from_str("0123456789abcdef").unwrap(),
            EngineConfig::default(),
        );
        build_app(engine, Arc::new(TEST_TOKEN.to_string()))
    }

    fn authed(req: axum::http::request::Builder) -> axum::http::request::Builder {
        req.header("Authorization", format!("Bearer {}", TEST_TOKEN))
    }

    #[tokio::test]
    async fn unauthenticated_request_returns_401() {
        let app = test_app();
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_token_returns_401() {
        let app = test_app();
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("Authorization", "Bearer wrong-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn health_returns_200() {
        let app = test_app();
        let resp = app
            .oneshot(authed(Request::builder().uri("/health")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_returns_200_with_empty_store() {
        let app = test_app();
        let resp = app
            .oneshot(authed(Request::builder().uri("/ready")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn runners_empty_list() {
        let app = test_app();
        let resp = app
            .oneshot(authed(Request::builder().uri("/runners")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn runner_not_found_returns_404() {
        let app = test_app();
        let resp = app
            .oneshot(
                authed(Request::builder().uri("/runners/nonexistent"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_returns_200() {
        let app = test_app();
        let resp = app
            .oneshot(authed(Request::builder().uri("/status")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn images_returns_200() {
        let app = test_app();
        let resp = app
            .oneshot(authed(Request::builder().uri("/images")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let app = test_app();
        let resp = app
            .oneshot(authed(Request::builder().uri("/nope")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn allocate_with_unknown_image_returns_client_error() {
        let app = test_app();
        let body = serde_json::json!({
            "image_id": "no-such-image",
            "user_id": "u1",
            "session_minutes": 30,
        });
        let resp = app
            .oneshot(
                authed(
                    Request::builder()
                        .method(Method::POST)
                        .uri("/runners/allocate")
                        .header("content-type", "application/json"),
                )
                .body(Body::from(body.to_string()))
                .unwrap(),
            )
            .await
            .unwrap();
        assert!(resp.status().is_client_error() || resp.status().is_server_error());
    }
}
