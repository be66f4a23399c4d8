//! HTTP server assembly and lifecycle.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;

use crate::api::{self, AppState, SharedState};
use crate::db::{DbHandle, FleetDb};
use crate::ws::{self, TripChannels};

pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    /// Permissive CORS for local dashboard development.
    pub dev_mode: bool,
    pub token_secret: String,
}

impl ServerConfig {
    /// Read the signing secret from `FLEETD_SECRET`, or generate an
    /// ephemeral one. A generated secret invalidates all tokens on
    /// restart, which is fine for development but logged as a warning.
    pub fn resolve_secret() -> String {
        match std::env::var("FLEETD_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ => {
                tracing::warn!(
                    "FLEETD_SECRET not set; using an ephemeral secret (tokens will not survive a restart)"
                );
                uuid::Uuid::new_v4().to_string()
            }
        }
    }
}

pub fn build_state(db: FleetDb, token_secret: String) -> SharedState {
    Arc::new(AppState {
        db: DbHandle::new(db),
        channels: Arc::new(TripChannels::default()),
        token_secret,
    })
}

pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let router = api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state);
    if dev_mode {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Open the database, bind the listener, and serve until Ctrl-C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let db = FleetDb::new(&config.db_path)
        .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?;
    let state = build_state(db, config.token_secret);
    let app = build_router(state, config.dev_mode);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(
        addr,
        db = %config.db_path.display(),
        dev_mode = config.dev_mode,
        "fleetd listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    tracing::info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install Ctrl-C handler: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_app() -> Router {
        let db = FleetDb::new_in_memory().unwrap();
        build_router(build_state(db, "test-secret".to_string()), false)
    }

    #[tokio::test]
    async fn health_endpoint_responds() {
        let resp = test_app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ws_route_is_mounted() {
        // A plain GET without the upgrade handshake is rejected, which is
        // enough to prove the route exists (a missing route would be 404).
        let resp = test_app()
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_ne!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let resp = test_app()
            .oneshot(
                Request::builder()
                    .uri("/api/nonsense")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
