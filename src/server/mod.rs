//! HTTP + WebSocket server surface.

pub mod auth;
pub mod handlers;
pub mod metrics;
pub mod rate_limit;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::HeaderValue;
use axum::routing::get;
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;

use crate::engine::Engine;

/// Assemble the router over a composed engine.
pub fn build_router(engine: Arc<Engine>) -> Router {
    let cors = cors_layer(&engine.config.allowed_origins);
    Router::new()
        .route("/api/health", get(handlers::health))
        .route(
            "/api/debates",
            get(handlers::list_debates).post(handlers::start_debate),
        )
        .route("/api/debates/:slug", get(handlers::get_debate))
        .route("/api/leaderboard", get(handlers::leaderboard))
        .route("/api/matches/recent", get(handlers::recent_matches))
        .route("/api/flips/recent", get(handlers::recent_flips))
        .route(
            "/api/agent/:name/consistency",
            get(handlers::agent_consistency),
        )
        .route("/metrics", get(handlers::metrics))
        .route("/ws", get(handlers::ws_upgrade))
        .layer(cors)
        .with_state(engine)
}

/// CORS from the explicit allow-list; an empty list allows nothing
/// cross-origin.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    if parsed.is_empty() {
        CorsLayer::new()
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(parsed))
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any)
    }
}

/// Bind and serve until shutdown.
pub async fn serve(engine: Arc<Engine>) -> std::io::Result<()> {
    let addr: SocketAddr = format!("{}:{}", engine.config.bind_addr, engine.config.port)
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let router = build_router(engine);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "aragora listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}
