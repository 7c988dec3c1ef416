//! tether-api: operator HTTP surface over the session layer.

pub mod handlers;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

/// All `/api` routes, without the CORS layer.
pub fn router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/sessions", get(handlers::handle_show))
        .route("/sessions/clear", post(handlers::handle_clear))
        .route(
            "/sessions/{thread}/{index}",
            get(handlers::handle_session_inspect).delete(handlers::handle_session_clear),
        )
        .route("/stats", get(handlers::handle_stats))
        .route("/stats", delete(handlers::handle_stats_clear))
        .route("/events", get(handlers::handle_events))
        .route("/states", get(handlers::handle_states))
        .route("/protos", get(handlers::handle_protos))
        .route("/listeners/{proto}", get(handlers::handle_listeners))
        .route("/daemon/shutdown", post(handlers::handle_shutdown))
        .with_state(state);

    Router::new().nest("/api", api_routes)
}

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(state).layer(cors);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, app).await?;
    Ok(())
}
