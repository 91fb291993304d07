pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

/// Every route, nested under `/api`.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/status", get(handlers::handle_status))
        .route("/peers", get(handlers::handle_peers))
        .route("/chunks", get(handlers::handle_chunks))
        .route("/send", post(handlers::handle_send))
        .route("/sessions", get(handlers::handle_sessions))
        .route("/sessions/cleanup", post(handlers::handle_cleanup))
        .route("/sessions/{id}", get(handlers::handle_session_inspect))
        .route("/sessions/{id}/pause", post(handlers::handle_pause))
        .route("/sessions/{id}/resume", post(handlers::handle_resume))
        .route("/sessions/{id}/cancel", post(handlers::handle_cancel))
        .route("/sessions/{id}/retry", post(handlers::handle_retry))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(cors)
}

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
