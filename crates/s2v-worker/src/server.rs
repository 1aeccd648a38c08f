mod routes;
mod schemas;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use s2v_core::VideoGenerator;
use crate::handler::JobHandler;
use crate::server::routes::api_routes;
use crate::server::state::ServerState;

/// Inline media makes job bodies large; the limit is configured rather than
/// left at axum's 2 MB default.
pub fn app<G: VideoGenerator + 'static>(handler: Arc<JobHandler<G>>, max_body_bytes: usize) -> Router {
    Router::new()
        .merge(api_routes())
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(ServerState::new(handler, max_body_bytes)))
}

/// Local HTTP front-end for testing the handler without the platform.
pub async fn serve<G: VideoGenerator + 'static>(
    handler: Arc<JobHandler<G>>,
    port: u16,
    max_body_bytes: usize,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!("Serving on http://{}", addr);
    info!("  POST /runsync - run one job and wait for the result");
    info!("  GET  /health  - model session status");

    axum::serve(listener, app(handler, max_body_bytes))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    Ok(())
}
