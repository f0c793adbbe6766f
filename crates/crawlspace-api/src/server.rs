//! API server assembly.
//!
//! Builds the axum router over an [`Engine`], serves the stable `/v2`
//! surface plus unauthenticated health/readiness probes, and owns the
//! process lifecycle (bind, serve, graceful shutdown).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crawlspace_core::{Authenticator, Principal, StaticKeyAuthenticator};
use crawlspace_engine::Engine;

use crate::config::Config;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ReadyResponse {
    /// Service readiness status.
    pub ready: bool,
    /// Optional message about readiness state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Shared application state for all request handlers.
pub struct AppState {
    /// The platform engine.
    pub engine: Arc<Engine>,
    /// Token resolver supplied by the auth collaborator.
    pub authenticator: Arc<dyn Authenticator>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    /// Creates state over an engine and authenticator.
    #[must_use]
    pub fn new(engine: Arc<Engine>, authenticator: Arc<dyn Authenticator>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            authenticator,
        })
    }

    /// Builds the authenticator implied by the configuration's API keys.
    #[must_use]
    pub fn authenticator_from_config(config: &Config) -> Arc<dyn Authenticator> {
        let mut authenticator = StaticKeyAuthenticator::new();
        for entry in &config.api_keys {
            let principal = if entry.service {
                Principal::service(entry.principal_id.clone())
            } else {
                Principal::user(entry.principal_id.clone())
            };
            authenticator = authenticator.with_key(entry.token.clone(), principal);
        }
        Arc::new(authenticator)
    }
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.engine.check_ready().await {
        Ok(()) => (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                message: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                message: Some(e.to_string()),
            }),
        ),
    }
}

/// Builds the full application router.
#[must_use]
pub fn router(state: Arc<AppState>) -> Router {
    let auth_layer = middleware::from_fn_with_state(Arc::clone(&state), crate::auth::auth_middleware);

    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .nest("/v2", crate::routes::v2_routes().layer(auth_layer))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the API until the shutdown future resolves.
pub async fn serve(
    state: Arc<AppState>,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {addr}: {e}"))?;
    tracing::info!(%addr, "crawlspace api listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| anyhow::anyhow!("server error: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawlspace_engine::{EngineConfig, MockRuntime};
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_endpoint_is_open() {
        let engine = Engine::in_memory(Arc::new(MockRuntime::succeeding()), EngineConfig::default());
        let state = AppState::new(engine, Arc::new(StaticKeyAuthenticator::new()));
        let router = router(state);

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");
    }

    #[tokio::test]
    async fn ready_endpoint_checks_leaves() {
        let engine = Engine::in_memory(Arc::new(MockRuntime::succeeding()), EngineConfig::default());
        let state = AppState::new(engine, Arc::new(StaticKeyAuthenticator::new()));
        let router = router(state);

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/ready")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn v2_requires_auth() {
        let engine = Engine::in_memory(Arc::new(MockRuntime::succeeding()), EngineConfig::default());
        let state = AppState::new(engine, Arc::new(StaticKeyAuthenticator::new()));
        let router = router(state);

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/v2/actor-runs")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload["error"]["type"], "UNAUTHENTICATED");
    }
}
