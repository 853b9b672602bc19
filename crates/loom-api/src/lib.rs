pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

/// `/api` routes with permissive CORS.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/status", get(handlers::handle_status))
        .route("/daemon/shutdown", post(handlers::handle_shutdown))
        .route(
            "/jobs",
            get(handlers::handle_jobs_list).post(handlers::handle_job_submit),
        )
        .route("/jobs/{id}", get(handlers::handle_job_inspect))
        .route("/jobs/{id}/events", get(handlers::handle_job_events))
        .route("/jobs/{id}/cancel", post(handlers::handle_job_cancel))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(cors)
}

/// Serve until a shutdown is broadcast on `state.shutdown_tx`.
pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let mut shutdown_rx = state.shutdown_tx.subscribe();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;
    Ok(())
}
